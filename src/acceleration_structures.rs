//! Bottom- and top-level acceleration structure builds.
//!
//! Every structure is built synchronously in a one-time command buffer from a
//! transient scratch buffer into a persistent storage buffer. The manager keeps
//! the structure -> storage buffer table and destroys both together.

use ash::vk;
use glam::Mat4;
use log::info;

use crate::buffer_helpers;
use crate::memory_manager::{HandleMap, MemoryBlock};
use crate::vulkan_context::VulkanContext;

/// Triangle geometry for a bottom-level build. Buffers are raw bytes.
#[derive(Clone, Copy, Debug)]
pub struct BlasGeometryData<'a> {
    pub vertices: &'a [u8],
    pub indices: &'a [u8],
    pub vertex_format: vk::Format,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub index_type: vk::IndexType,
    pub index_count: u32,
}

/// One instance of a top-level build.
#[derive(Clone, Copy, Debug)]
pub struct TlasInstanceData {
    pub blas: vk::AccelerationStructureKHR,
    pub transform: Mat4,
    pub custom_index: u32,
    pub mask: u8,
    pub sbt_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

/// Row-major 3x4 matrix taken from the transposed column-major transform.
pub fn instance_transform(transform: &Mat4) -> vk::TransformMatrixKHR {
    let transposed = transform.transpose().to_cols_array();
    let mut matrix = [0.0f32; 12];
    matrix.copy_from_slice(&transposed[..12]);
    vk::TransformMatrixKHR { matrix }
}

/// Pack an instance. `blas_address` is the device address of the referenced BLAS.
pub fn pack_instance(
    instance: &TlasInstanceData,
    blas_address: vk::DeviceAddress,
) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: instance_transform(&instance.transform),
        instance_custom_index_and_mask: vk::Packed24_8::new(instance.custom_index, instance.mask),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            instance.sbt_record_offset,
            instance.flags.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

/// Axis-aligned box of edge 1 centered on the origin.
pub const UNIT_BBOX: vk::AabbPositionsKHR = vk::AabbPositionsKHR {
    min_x: -0.5,
    min_y: -0.5,
    min_z: -0.5,
    max_x: 0.5,
    max_y: 0.5,
    max_z: 0.5,
};

fn aabb_bytes(aabbs: &[vk::AabbPositionsKHR]) -> Vec<u8> {
    let floats: Vec<[f32; 6]> = aabbs
        .iter()
        .map(|b| [b.min_x, b.min_y, b.min_z, b.max_x, b.max_y, b.max_z])
        .collect();
    bytemuck::cast_slice(&floats).to_vec()
}

/// Procedural geometry reading tightly packed boxes at `address`.
fn aabb_geometry(address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
    let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: address,
        })
        .stride(std::mem::size_of::<vk::AabbPositionsKHR>() as vk::DeviceSize);

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::AABBS)
        .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs })
}

fn instance_bytes(instances: &[vk::AccelerationStructureInstanceKHR]) -> &[u8] {
    // SAFETY: the instance struct is a plain repr(C) record of 64 bytes.
    unsafe {
        std::slice::from_raw_parts(
            instances.as_ptr() as *const u8,
            std::mem::size_of_val(instances),
        )
    }
}

// ===========================================================================
// Registry
// ===========================================================================

/// Table of resident structures and the storage buffers backing them.
#[derive(Default)]
pub struct AccelerationStructureRegistry {
    entries: HandleMap<vk::AccelerationStructureKHR, vk::Buffer>,
}

impl AccelerationStructureRegistry {
    pub fn register(&mut self, handle: vk::AccelerationStructureKHR, storage: vk::Buffer) {
        self.entries.insert(handle, storage);
    }

    /// Remove an entry and return its storage buffer. The entry must exist.
    pub fn unregister(&mut self, handle: vk::AccelerationStructureKHR) -> vk::Buffer {
        self.entries
            .remove(handle)
            .expect("Acceleration structure is not registered")
    }

    pub fn storage_buffer(&self, handle: vk::AccelerationStructureKHR) -> Option<vk::Buffer> {
        self.entries.get(handle).copied()
    }

    pub fn contains(&self, handle: vk::AccelerationStructureKHR) -> bool {
        self.entries.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drain(&mut self) -> Vec<(vk::AccelerationStructureKHR, vk::Buffer)> {
        self.entries.drain().collect()
    }
}

// ===========================================================================
// Manager
// ===========================================================================

#[derive(Default)]
pub struct AccelerationStructureManager {
    registry: AccelerationStructureRegistry,
}

impl AccelerationStructureManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Triangle BLAS. Input buffers only live for the duration of the build.
    pub fn generate_blas(
        &mut self,
        ctx: &mut VulkanContext,
        data: &BlasGeometryData,
    ) -> Result<vk::AccelerationStructureKHR, String> {
        assert!(
            data.vertex_count > 0 && data.index_count >= 3,
            "BLAS geometry needs at least one triangle"
        );

        let vertex_buffer = buffer_helpers::create_buffer_with_data(
            ctx,
            data.vertices,
            build_input_usage(),
            "blas vertices",
        )?;
        let index_buffer = match buffer_helpers::create_buffer_with_data(
            ctx,
            data.indices,
            build_input_usage(),
            "blas indices",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                ctx.memory_manager.destroy_buffer(vertex_buffer);
                return Err(e);
            }
        };

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(data.vertex_format)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: buffer_helpers::buffer_device_address(&ctx.device, vertex_buffer),
            })
            .vertex_stride(data.vertex_stride)
            .max_vertex(data.vertex_count - 1)
            .index_type(data.index_type)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: buffer_helpers::buffer_device_address(&ctx.device, index_buffer),
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles });

        let result = self.generate(
            ctx,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &geometry,
            data.index_count / 3,
            "blas",
        );

        ctx.memory_manager.destroy_buffer(vertex_buffer);
        ctx.memory_manager.destroy_buffer(index_buffer);
        result
    }

    /// Procedural BLAS with one primitive per box. The box buffer is freed after the build.
    pub fn generate_aabb_blas(
        &mut self,
        ctx: &mut VulkanContext,
        aabbs: &[vk::AabbPositionsKHR],
    ) -> Result<vk::AccelerationStructureKHR, String> {
        assert!(!aabbs.is_empty(), "AABB BLAS needs at least one box");

        let aabb_buffer = buffer_helpers::create_buffer_with_data(
            ctx,
            &aabb_bytes(aabbs),
            build_input_usage(),
            "blas aabbs",
        )?;

        let geometry = aabb_geometry(buffer_helpers::buffer_device_address(&ctx.device, aabb_buffer));
        let result = self.generate(
            ctx,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &geometry,
            aabbs.len() as u32,
            "aabb blas",
        );

        ctx.memory_manager.destroy_buffer(aabb_buffer);
        result
    }

    /// Single [`UNIT_BBOX`] primitive, the proxy for intersection-shader geometry.
    #[allow(dead_code)]
    pub fn generate_unit_bbox_blas(
        &mut self,
        ctx: &mut VulkanContext,
    ) -> Result<vk::AccelerationStructureKHR, String> {
        self.generate_aabb_blas(ctx, std::slice::from_ref(&UNIT_BBOX))
    }

    /// TLAS over `instances`. Each instance references its BLAS by device address.
    pub fn generate_tlas(
        &mut self,
        ctx: &mut VulkanContext,
        instances: &[TlasInstanceData],
    ) -> Result<vk::AccelerationStructureKHR, String> {
        assert!(!instances.is_empty(), "TLAS needs at least one instance");

        let mut packed = Vec::with_capacity(instances.len());
        for instance in instances {
            let blas_address = ctx.acceleration_structure_address(instance.blas)?;
            packed.push(pack_instance(instance, blas_address));
        }

        let instance_buffer = buffer_helpers::create_buffer_with_data(
            ctx,
            instance_bytes(&packed),
            build_input_usage(),
            "tlas instances",
        )?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: buffer_helpers::buffer_device_address(&ctx.device, instance_buffer),
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            });

        let result = self.generate(
            ctx,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &geometry,
            instances.len() as u32,
            "tlas",
        );

        ctx.memory_manager.destroy_buffer(instance_buffer);
        result
    }

    fn generate(
        &mut self,
        ctx: &mut VulkanContext,
        ty: vk::AccelerationStructureTypeKHR,
        geometry: &vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
        name: &str,
    ) -> Result<vk::AccelerationStructureKHR, String> {
        let loader = ctx.acceleration_structure_loader()?.clone();
        let geometries = std::slice::from_ref(geometry);

        let size_query = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(geometries);

        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &size_query,
                &[primitive_count],
                &mut build_sizes,
            );
        }

        let storage_buffer = create_acceleration_structure_buffer(
            ctx,
            build_sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
            1,
            &format!("{} storage", name),
        )?;

        let scratch_alignment = ctx.min_scratch_offset_alignment();
        let scratch_buffer = match create_acceleration_structure_buffer(
            ctx,
            build_sizes.build_scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            scratch_alignment,
            &format!("{} scratch", name),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                ctx.memory_manager.destroy_buffer(storage_buffer);
                return Err(e);
            }
        };

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage_buffer)
            .offset(0)
            .size(build_sizes.acceleration_structure_size)
            .ty(ty);

        let handle = match unsafe { loader.create_acceleration_structure(&create_info, None) } {
            Ok(handle) => handle,
            Err(e) => {
                ctx.memory_manager.destroy_buffer(scratch_buffer);
                ctx.memory_manager.destroy_buffer(storage_buffer);
                return Err(format!("Failed to create acceleration structure '{}': {:?}", name, e));
            }
        };

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(handle)
            .geometries(geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: buffer_helpers::buffer_device_address(&ctx.device, scratch_buffer),
            });

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        let built = ctx.execute_one_time_commands(|cmd| {
            // Earlier builds (BLAS for a TLAS) must be visible to this one.
            let memory_barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR);

            unsafe {
                ctx.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[memory_barrier],
                    &[],
                    &[],
                );
                loader.cmd_build_acceleration_structures(
                    cmd,
                    std::slice::from_ref(&build_info),
                    &[std::slice::from_ref(&build_range)],
                );
            }
            Ok(())
        });

        ctx.memory_manager.destroy_buffer(scratch_buffer);

        if let Err(e) = built {
            unsafe { loader.destroy_acceleration_structure(handle, None) };
            ctx.memory_manager.destroy_buffer(storage_buffer);
            return Err(e);
        }

        info!(
            "Built {} ({} primitives, {} bytes, scratch {} bytes)",
            name,
            primitive_count,
            build_sizes.acceleration_structure_size,
            build_sizes.build_scratch_size
        );

        self.registry.register(handle, storage_buffer);
        Ok(handle)
    }

    /// Destroy a structure and its storage buffer. The structure must be resident.
    pub fn destroy_acceleration_structure(
        &mut self,
        ctx: &mut VulkanContext,
        handle: vk::AccelerationStructureKHR,
    ) {
        let storage_buffer = self.registry.unregister(handle);
        if let Ok(loader) = ctx.acceleration_structure_loader() {
            unsafe { loader.destroy_acceleration_structure(handle, None) };
        }
        ctx.memory_manager.destroy_buffer(storage_buffer);
    }

    /// Memory block of the storage buffer backing `handle`.
    pub fn memory_block(&self, ctx: &VulkanContext, handle: vk::AccelerationStructureKHR) -> MemoryBlock {
        let storage_buffer = self
            .registry
            .storage_buffer(handle)
            .expect("Acceleration structure is not registered");
        ctx.memory_manager.buffer_memory_block(storage_buffer)
    }

    pub fn destroy_all(&mut self, ctx: &mut VulkanContext) {
        if self.registry.is_empty() {
            return;
        }
        info!("Destroying {} acceleration structures", self.registry.len());
        for (handle, storage_buffer) in self.registry.drain() {
            if let Ok(loader) = ctx.acceleration_structure_loader() {
                unsafe { loader.destroy_acceleration_structure(handle, None) };
            }
            ctx.memory_manager.destroy_buffer(storage_buffer);
        }
    }
}

fn build_input_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
}

fn create_acceleration_structure_buffer(
    ctx: &mut VulkanContext,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    min_alignment: vk::DeviceSize,
    name: &str,
) -> Result<vk::Buffer, String> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    ctx.memory_manager.create_buffer_aligned(
        &buffer_info,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        min_alignment,
        name,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use glam::{Quat, Vec3};

    #[test]
    fn instance_transform_is_row_major_3x4() {
        let transform = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let matrix = instance_transform(&transform).matrix;
        assert_eq!(
            matrix,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
    }

    #[test]
    fn instance_transform_keeps_rotation_rows() {
        let transform = Mat4::from_scale_rotation_translation(
            Vec3::splat(2.0),
            Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
            Vec3::ZERO,
        );
        let matrix = instance_transform(&transform).matrix;
        let rows = transform.transpose().to_cols_array();
        assert_eq!(&matrix[..], &rows[..12]);
        assert!((matrix[1] + 2.0).abs() < 1e-5);
        assert!((matrix[4] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn packed_instance_carries_index_mask_and_address() {
        let instance = TlasInstanceData {
            blas: vk::AccelerationStructureKHR::from_raw(11),
            transform: Mat4::IDENTITY,
            custom_index: 5,
            mask: 0xFF,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        };
        let packed = pack_instance(&instance, 0xABCD_0000);

        assert_eq!(packed.instance_custom_index_and_mask.low_24(), 5);
        assert_eq!(packed.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(
            packed.instance_shader_binding_table_record_offset_and_flags.high_8(),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8
        );
        assert_eq!(unsafe { packed.acceleration_structure_reference.device_handle }, 0xABCD_0000);
        assert_eq!(instance_bytes(&[packed]).len(), 64);
    }

    #[test]
    fn unit_bbox_geometry_is_one_tightly_strided_box() {
        let bytes = aabb_bytes(std::slice::from_ref(&UNIT_BBOX));
        assert_eq!(bytes.len(), std::mem::size_of::<vk::AabbPositionsKHR>());
        assert_eq!(bytes.len(), 24);
        let floats: &[f32] = bytemuck::cast_slice(&bytes);
        assert_eq!(floats, &[-0.5, -0.5, -0.5, 0.5, 0.5, 0.5]);

        let geometry = aabb_geometry(0x1000);
        assert_eq!(geometry.geometry_type, vk::GeometryTypeKHR::AABBS);
        let aabbs = unsafe { geometry.geometry.aabbs };
        assert_eq!(aabbs.stride, 24);
        assert_eq!(unsafe { aabbs.data.device_address }, 0x1000);
    }

    #[test]
    fn box_bytes_scale_with_primitive_count() {
        let boxes = [UNIT_BBOX; 3];
        assert_eq!(aabb_bytes(&boxes).len(), 3 * 24);
    }

    #[test]
    fn registry_returns_to_previous_size_after_destroy() {
        let mut registry = AccelerationStructureRegistry::default();
        registry.register(
            vk::AccelerationStructureKHR::from_raw(1),
            vk::Buffer::from_raw(100),
        );
        let before = registry.len();

        let blas = vk::AccelerationStructureKHR::from_raw(2);
        registry.register(blas, vk::Buffer::from_raw(200));
        assert!(registry.contains(blas));
        assert_eq!(registry.storage_buffer(blas), Some(vk::Buffer::from_raw(200)));

        assert_eq!(registry.unregister(blas), vk::Buffer::from_raw(200));
        assert!(!registry.contains(blas));
        assert_eq!(registry.len(), before);
        assert!(!registry.is_empty());
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn destroying_unknown_structure_is_fatal() {
        let mut registry = AccelerationStructureRegistry::default();
        registry.unregister(vk::AccelerationStructureKHR::from_raw(9));
    }
}
