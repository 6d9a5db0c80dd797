//! Declarative descriptor sets.
//!
//! A set is described as an ordered list of bindings (binding slot = index)
//! and filled from an index-aligned list of resource payloads. Layout, set
//! allocation and the batched write all happen in one call.

use ash::vk;
use log::debug;

use crate::image_helpers::SampledTexture;

// ===========================================================================
// Descriptions and payloads
// ===========================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorDescription {
    pub count: u32,
    pub ty: vk::DescriptorType,
    pub stage_flags: vk::ShaderStageFlags,
    pub binding_flags: vk::DescriptorBindingFlags,
}

impl DescriptorDescription {
    pub fn new(count: u32, ty: vk::DescriptorType, stage_flags: vk::ShaderStageFlags) -> Self {
        Self {
            count,
            ty,
            stage_flags,
            binding_flags: vk::DescriptorBindingFlags::empty(),
        }
    }
}

/// Resource payload for one binding. The variant must agree with the binding type.
#[derive(Clone, Debug)]
pub enum DescriptorInfo {
    Images(Vec<vk::DescriptorImageInfo>),
    Buffers(Vec<vk::DescriptorBufferInfo>),
    BufferViews(Vec<vk::BufferView>),
    AccelerationStructures(Vec<vk::AccelerationStructureKHR>),
}

impl DescriptorInfo {
    pub fn len(&self) -> usize {
        match self {
            DescriptorInfo::Images(infos) => infos.len(),
            DescriptorInfo::Buffers(infos) => infos.len(),
            DescriptorInfo::BufferViews(views) => views.len(),
            DescriptorInfo::AccelerationStructures(handles) => handles.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this payload shape can feed a binding of type `ty`.
    pub fn accepts(&self, ty: vk::DescriptorType) -> bool {
        match self {
            DescriptorInfo::Images(_) => matches!(
                ty,
                vk::DescriptorType::SAMPLER
                    | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                    | vk::DescriptorType::SAMPLED_IMAGE
                    | vk::DescriptorType::STORAGE_IMAGE
                    | vk::DescriptorType::INPUT_ATTACHMENT
            ),
            DescriptorInfo::Buffers(_) => matches!(
                ty,
                vk::DescriptorType::UNIFORM_BUFFER
                    | vk::DescriptorType::STORAGE_BUFFER
                    | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                    | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
            ),
            DescriptorInfo::BufferViews(_) => matches!(
                ty,
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER
            ),
            DescriptorInfo::AccelerationStructures(_) => {
                ty == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct DescriptorData {
    pub ty: vk::DescriptorType,
    pub info: DescriptorInfo,
}

pub type DescriptorSetData = Vec<DescriptorData>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorSet {
    pub layout: vk::DescriptorSetLayout,
    pub value: vk::DescriptorSet,
}

/// One layout shared by N sets, one per swapchain image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiDescriptorSet {
    pub layout: vk::DescriptorSetLayout,
    pub values: Vec<vk::DescriptorSet>,
}

// ---------------------------------------------------------------------------
// Payload constructors
// ---------------------------------------------------------------------------

pub fn sampled_image_data(sampler: vk::Sampler, view: vk::ImageView) -> DescriptorData {
    sampled_images_data(sampler, &[view])
}

pub fn sampled_images_data(sampler: vk::Sampler, views: &[vk::ImageView]) -> DescriptorData {
    DescriptorData {
        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        info: DescriptorInfo::Images(
            views
                .iter()
                .map(|&view| vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
                .collect(),
        ),
    }
}

pub fn sampled_textures_data(textures: &[SampledTexture]) -> DescriptorData {
    DescriptorData {
        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        info: DescriptorInfo::Images(
            textures
                .iter()
                .map(|texture| vk::DescriptorImageInfo {
                    sampler: texture.sampler,
                    image_view: texture.texture.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
                .collect(),
        ),
    }
}

pub fn uniform_buffer_data(buffer: vk::Buffer) -> DescriptorData {
    DescriptorData {
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        info: DescriptorInfo::Buffers(vec![whole_buffer(buffer)]),
    }
}

pub fn storage_image_data(view: vk::ImageView) -> DescriptorData {
    storage_images_data(&[view])
}

pub fn storage_images_data(views: &[vk::ImageView]) -> DescriptorData {
    DescriptorData {
        ty: vk::DescriptorType::STORAGE_IMAGE,
        info: DescriptorInfo::Images(
            views
                .iter()
                .map(|&view| vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::GENERAL,
                })
                .collect(),
        ),
    }
}

pub fn storage_buffer_data(buffer: vk::Buffer) -> DescriptorData {
    storage_buffers_data(&[buffer])
}

pub fn storage_buffers_data(buffers: &[vk::Buffer]) -> DescriptorData {
    DescriptorData {
        ty: vk::DescriptorType::STORAGE_BUFFER,
        info: DescriptorInfo::Buffers(buffers.iter().map(|&buffer| whole_buffer(buffer)).collect()),
    }
}

/// Texel buffer views for a UNIFORM_ or STORAGE_TEXEL_BUFFER binding.
pub fn buffer_views_data(ty: vk::DescriptorType, views: &[vk::BufferView]) -> DescriptorData {
    assert!(
        matches!(
            ty,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER
        ),
        "Buffer views cannot feed a {:?} binding",
        ty
    );
    DescriptorData {
        ty,
        info: DescriptorInfo::BufferViews(views.to_vec()),
    }
}

pub fn uniform_texel_buffer_data(view: vk::BufferView) -> DescriptorData {
    buffer_views_data(vk::DescriptorType::UNIFORM_TEXEL_BUFFER, &[view])
}

pub fn storage_texel_buffer_data(view: vk::BufferView) -> DescriptorData {
    buffer_views_data(vk::DescriptorType::STORAGE_TEXEL_BUFFER, &[view])
}

pub fn acceleration_structure_data(handle: vk::AccelerationStructureKHR) -> DescriptorData {
    DescriptorData {
        ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        info: DescriptorInfo::AccelerationStructures(vec![handle]),
    }
}

fn whole_buffer(buffer: vk::Buffer) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check that `data` fits `description`. Any mismatch is a programming error.
pub fn validate_set_data(description: &[DescriptorDescription], data: &[DescriptorData]) {
    assert_eq!(
        description.len(),
        data.len(),
        "Descriptor set description has {} bindings but {} data entries were supplied",
        description.len(),
        data.len()
    );

    for (binding, (desc, entry)) in description.iter().zip(data).enumerate() {
        assert_eq!(
            desc.ty, entry.ty,
            "Binding {} is described as {:?} but data is {:?}",
            binding, desc.ty, entry.ty
        );
        assert!(
            entry.info.accepts(entry.ty),
            "Binding {} payload does not match descriptor type {:?}",
            binding,
            entry.ty
        );
        assert!(
            entry.info.len() <= desc.count as usize,
            "Binding {} holds {} descriptors but is described with count {}",
            binding,
            entry.info.len(),
            desc.count
        );
    }
}

/// Layout bindings for a description. Binding numbers follow description order.
pub fn layout_bindings(
    description: &[DescriptorDescription],
) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    description
        .iter()
        .enumerate()
        .map(|(binding, desc)| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding as u32)
                .descriptor_type(desc.ty)
                .descriptor_count(desc.count)
                .stage_flags(desc.stage_flags)
        })
        .collect()
}

// ===========================================================================
// DescriptorPool
// ===========================================================================

const POOL_MAX_SETS: u32 = 1024;
const POOL_DESCRIPTORS_PER_TYPE: u32 = 2048;

/// Process-wide descriptor pool. Sets are individually freeable.
pub struct DescriptorPool {
    device: ash::Device,
    pool: vk::DescriptorPool,
    live_sets: usize,
    live_layouts: usize,
}

impl DescriptorPool {
    pub fn new(device: ash::Device, ray_tracing_enabled: bool) -> Result<Self, String> {
        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = [
            vk::DescriptorType::SAMPLER,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        ]
        .iter()
        .map(|&ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: POOL_DESCRIPTORS_PER_TYPE,
        })
        .collect();

        if ray_tracing_enabled {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: POOL_MAX_SETS,
            });
        }

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(POOL_MAX_SETS)
            .pool_sizes(&pool_sizes);

        let pool = unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .map_err(|e| format!("Failed to create descriptor pool: {:?}", e))?
        };

        Ok(Self {
            device,
            pool,
            live_sets: 0,
            live_layouts: 0,
        })
    }

    fn create_layout(
        &mut self,
        description: &[DescriptorDescription],
    ) -> Result<vk::DescriptorSetLayout, String> {
        let bindings = layout_bindings(description);
        let binding_flags: Vec<vk::DescriptorBindingFlags> =
            description.iter().map(|desc| desc.binding_flags).collect();

        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        if binding_flags.iter().any(|flags| !flags.is_empty()) {
            layout_info = layout_info.push_next(&mut flags_info);
        }

        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| format!("Failed to create descriptor set layout: {:?}", e))?
        };
        self.live_layouts += 1;
        Ok(layout)
    }

    fn allocate(
        &mut self,
        layout: vk::DescriptorSetLayout,
        count: usize,
    ) -> Result<Vec<vk::DescriptorSet>, String> {
        let layouts = vec![layout; count];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| format!("Failed to allocate descriptor sets: {:?}", e))?
        };
        self.live_sets += sets.len();
        Ok(sets)
    }

    fn write(&self, set: vk::DescriptorSet, data: &[DescriptorData]) {
        let mut acceleration_structure_writes: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> =
            data.iter()
                .filter_map(|entry| match &entry.info {
                    DescriptorInfo::AccelerationStructures(handles) if !handles.is_empty() => Some(
                        vk::WriteDescriptorSetAccelerationStructureKHR::default()
                            .acceleration_structures(handles),
                    ),
                    _ => None,
                })
                .collect();
        let mut next_acceleration_structure = acceleration_structure_writes.iter_mut();

        let mut writes = Vec::with_capacity(data.len());
        for (binding, entry) in data.iter().enumerate() {
            // Unfilled bindings stay unwritten.
            if entry.info.is_empty() {
                continue;
            }

            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding as u32)
                .descriptor_type(entry.ty);

            let write = match &entry.info {
                DescriptorInfo::Images(infos) => write.image_info(infos),
                DescriptorInfo::Buffers(infos) => write.buffer_info(infos),
                DescriptorInfo::BufferViews(views) => write.texel_buffer_view(views),
                DescriptorInfo::AccelerationStructures(handles) => {
                    match next_acceleration_structure.next() {
                        Some(as_write) => write
                            .descriptor_count(handles.len() as u32)
                            .push_next(as_write),
                        None => continue,
                    }
                }
            };
            writes.push(write);
        }

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }

    /// Create a layout and one set, then write every binding in one update.
    pub fn create_descriptor_set(
        &mut self,
        description: &[DescriptorDescription],
        data: &[DescriptorData],
    ) -> Result<DescriptorSet, String> {
        validate_set_data(description, data);

        let layout = self.create_layout(description)?;
        let value = match self.allocate(layout, 1) {
            Ok(sets) => sets[0],
            Err(e) => {
                self.destroy_layout(layout);
                return Err(e);
            }
        };
        self.write(value, data);

        debug!("Created descriptor set with {} bindings", description.len());
        Ok(DescriptorSet { layout, value })
    }

    /// Create one layout and one set per entry of `data`.
    pub fn create_multi_descriptor_set(
        &mut self,
        description: &[DescriptorDescription],
        data: &[DescriptorSetData],
    ) -> Result<MultiDescriptorSet, String> {
        assert!(!data.is_empty(), "Multi descriptor set needs at least one data set");
        for set_data in data {
            validate_set_data(description, set_data);
        }

        let layout = self.create_layout(description)?;
        let values = match self.allocate(layout, data.len()) {
            Ok(sets) => sets,
            Err(e) => {
                self.destroy_layout(layout);
                return Err(e);
            }
        };
        for (&set, set_data) in values.iter().zip(data) {
            self.write(set, set_data);
        }

        debug!(
            "Created {} descriptor sets with {} bindings",
            values.len(),
            description.len()
        );
        Ok(MultiDescriptorSet { layout, values })
    }

    /// Layout shared by sets allocated later with `allocate_descriptor_sets`.
    pub fn create_descriptor_set_layout(
        &mut self,
        description: &[DescriptorDescription],
    ) -> Result<vk::DescriptorSetLayout, String> {
        self.create_layout(description)
    }

    pub fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        self.destroy_layout(layout);
    }

    /// One set of `layout` per entry of `data`. `description` must be the one
    /// the layout was created from.
    pub fn allocate_descriptor_sets(
        &mut self,
        layout: vk::DescriptorSetLayout,
        description: &[DescriptorDescription],
        data: &[DescriptorSetData],
    ) -> Result<Vec<vk::DescriptorSet>, String> {
        for set_data in data {
            validate_set_data(description, set_data);
        }

        let sets = self.allocate(layout, data.len())?;
        for (&set, set_data) in sets.iter().zip(data) {
            self.write(set, set_data);
        }
        Ok(sets)
    }

    pub fn free_descriptor_sets(&mut self, sets: &[vk::DescriptorSet]) {
        self.free(sets);
    }

    fn destroy_layout(&mut self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
        self.live_layouts -= 1;
    }

    fn free(&mut self, sets: &[vk::DescriptorSet]) {
        if let Err(e) = unsafe { self.device.free_descriptor_sets(self.pool, sets) } {
            log::warn!("Failed to free descriptor sets: {:?}", e);
        }
        self.live_sets -= sets.len();
    }

    /// Return the set to the pool and destroy its layout.
    pub fn destroy_descriptor_set(&mut self, set: &DescriptorSet) {
        self.free(std::slice::from_ref(&set.value));
        self.destroy_layout(set.layout);
    }

    pub fn destroy_multi_descriptor_set(&mut self, set: &MultiDescriptorSet) {
        self.free(&set.values);
        self.destroy_layout(set.layout);
    }

    /// Sets currently allocated from this pool.
    pub fn live_set_count(&self) -> usize {
        self.live_sets
    }

    pub fn live_layout_count(&self) -> usize {
        self.live_layouts
    }

    pub fn destroy(&mut self) {
        if self.pool == vk::DescriptorPool::null() {
            return;
        }
        if self.live_sets > 0 || self.live_layouts > 0 {
            log::warn!(
                "Destroying descriptor pool with {} live sets and {} live layouts",
                self.live_sets,
                self.live_layouts
            );
        }
        unsafe { self.device.destroy_descriptor_pool(self.pool, None) };
        self.pool = vk::DescriptorPool::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn compute(count: u32, ty: vk::DescriptorType) -> DescriptorDescription {
        DescriptorDescription::new(count, ty, vk::ShaderStageFlags::COMPUTE)
    }

    #[test]
    fn matching_description_and_data_validate() {
        let description = vec![
            compute(1, vk::DescriptorType::STORAGE_IMAGE),
            compute(1, vk::DescriptorType::UNIFORM_BUFFER),
            compute(1, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
        ];
        let data = vec![
            storage_image_data(vk::ImageView::from_raw(1)),
            uniform_buffer_data(vk::Buffer::from_raw(2)),
            acceleration_structure_data(vk::AccelerationStructureKHR::from_raw(3)),
        ];
        validate_set_data(&description, &data);
    }

    #[test]
    #[should_panic(expected = "bindings but")]
    fn length_mismatch_is_fatal() {
        let description = vec![compute(1, vk::DescriptorType::STORAGE_IMAGE)];
        validate_set_data(&description, &[]);
    }

    #[test]
    #[should_panic(expected = "is described as")]
    fn type_mismatch_is_fatal() {
        let description = vec![compute(1, vk::DescriptorType::STORAGE_BUFFER)];
        let data = vec![uniform_buffer_data(vk::Buffer::from_raw(5))];
        validate_set_data(&description, &data);
    }

    #[test]
    #[should_panic(expected = "payload does not match")]
    fn payload_shape_mismatch_is_fatal() {
        let description = vec![compute(1, vk::DescriptorType::UNIFORM_BUFFER)];
        let data = vec![DescriptorData {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            info: DescriptorInfo::Images(Vec::new()),
        }];
        validate_set_data(&description, &data);
    }

    #[test]
    #[should_panic(expected = "described with count")]
    fn oversized_array_is_fatal() {
        let description = vec![compute(1, vk::DescriptorType::STORAGE_BUFFER)];
        let data = vec![storage_buffers_data(&[
            vk::Buffer::from_raw(1),
            vk::Buffer::from_raw(2),
        ])];
        validate_set_data(&description, &data);
    }

    #[test]
    fn layout_bindings_follow_description_order() {
        let description = vec![
            compute(1, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
            compute(4, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            compute(4, vk::DescriptorType::STORAGE_BUFFER),
        ];
        let bindings = layout_bindings(&description);

        assert_eq!(bindings.len(), description.len());
        for (index, (binding, desc)) in bindings.iter().zip(&description).enumerate() {
            assert_eq!(binding.binding, index as u32);
            assert_eq!(binding.descriptor_type, desc.ty);
            assert_eq!(binding.descriptor_count, desc.count);
            assert_eq!(binding.stage_flags, vk::ShaderStageFlags::COMPUTE);
        }
    }

    #[test]
    fn payload_constructors_pick_types_and_layouts() {
        let sampled = sampled_image_data(vk::Sampler::from_raw(1), vk::ImageView::from_raw(2));
        assert_eq!(sampled.ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        match &sampled.info {
            DescriptorInfo::Images(infos) => {
                assert_eq!(infos[0].image_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let storage = storage_images_data(&[vk::ImageView::from_raw(3), vk::ImageView::from_raw(4)]);
        assert_eq!(storage.ty, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(storage.info.len(), 2);
        match &storage.info {
            DescriptorInfo::Images(infos) => {
                assert!(infos.iter().all(|info| info.image_layout == vk::ImageLayout::GENERAL));
                assert!(infos.iter().all(|info| info.sampler == vk::Sampler::null()));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let buffers = storage_buffers_data(&[vk::Buffer::from_raw(9)]);
        assert_eq!(buffers.ty, vk::DescriptorType::STORAGE_BUFFER);
        assert!(buffers.info.accepts(vk::DescriptorType::STORAGE_BUFFER));
        assert!(!buffers.info.accepts(vk::DescriptorType::STORAGE_IMAGE));
    }

    #[test]
    fn texel_buffer_payloads_carry_views() {
        let description = vec![
            compute(1, vk::DescriptorType::STORAGE_TEXEL_BUFFER),
            compute(1, vk::DescriptorType::UNIFORM_TEXEL_BUFFER),
        ];
        let data = vec![
            storage_texel_buffer_data(vk::BufferView::from_raw(7)),
            uniform_texel_buffer_data(vk::BufferView::from_raw(8)),
        ];
        validate_set_data(&description, &data);

        match &data[0].info {
            DescriptorInfo::BufferViews(views) => assert_eq!(views, &[vk::BufferView::from_raw(7)]),
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(data[1].info.accepts(vk::DescriptorType::UNIFORM_TEXEL_BUFFER));
        assert!(!data[1].info.accepts(vk::DescriptorType::STORAGE_BUFFER));
    }

    #[test]
    #[should_panic(expected = "Buffer views cannot feed")]
    fn buffer_views_reject_plain_buffer_bindings() {
        buffer_views_data(vk::DescriptorType::STORAGE_BUFFER, &[vk::BufferView::from_raw(1)]);
    }

    #[test]
    fn empty_payload_is_allowed_for_partially_bound_arrays() {
        let description = vec![compute(8, vk::DescriptorType::STORAGE_BUFFER)];
        let data = vec![storage_buffers_data(&[])];
        validate_set_data(&description, &data);
        assert!(data[0].info.is_empty());
    }
}
