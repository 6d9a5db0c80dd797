//! Device memory and resource tracking on top of gpu-allocator.
//!
//! Buffers and images are created together with their backing memory and
//! destroyed together with it. Every live resource is tracked in a table
//! keyed by its raw Vulkan handle, so owners only ever hold plain handles.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use log::{debug, warn};
use std::collections::HashMap;
use std::marker::PhantomData;

// ===========================================================================
// Handle-keyed tables
// ===========================================================================

/// Map from a Vulkan handle to a value, keyed by the handle's raw integer.
pub struct HandleMap<H: vk::Handle + Copy, V> {
    entries: HashMap<u64, V>,
    _handle: PhantomData<H>,
}

impl<H: vk::Handle + Copy, V> Default for HandleMap<H, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: vk::Handle + Copy, V> HandleMap<H, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            _handle: PhantomData,
        }
    }

    /// Insert a value. Registering the same handle twice is a contract violation.
    pub fn insert(&mut self, handle: H, value: V) {
        let previous = self.entries.insert(handle.as_raw(), value);
        assert!(
            previous.is_none(),
            "Handle 0x{:x} is already registered",
            handle.as_raw()
        );
    }

    pub fn get(&self, handle: H) -> Option<&V> {
        self.entries.get(&handle.as_raw())
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut V> {
        self.entries.get_mut(&handle.as_raw())
    }

    pub fn remove(&mut self, handle: H) -> Option<V> {
        self.entries.remove(&handle.as_raw())
    }

    pub fn contains(&self, handle: H) -> bool {
        self.entries.contains_key(&handle.as_raw())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut()
    }

    /// Remove every entry, yielding handles and values.
    pub fn drain(&mut self) -> impl Iterator<Item = (H, V)> + '_ {
        self.entries.drain().map(|(raw, value)| (H::from_raw(raw), value))
    }
}

// ===========================================================================
// Memory blocks and descriptions
// ===========================================================================

/// A sub-allocation inside a larger device memory object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryBlock {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl MemoryBlock {
    fn of(allocation: &Allocation) -> Self {
        // SAFETY: the memory handle is only used as an identifier here.
        let memory = unsafe { allocation.memory() };
        Self {
            memory,
            offset: allocation.offset(),
            size: allocation.size(),
        }
    }
}

/// Creation parameters of a live image, kept for later queries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageDescription {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub flags: vk::ImageCreateFlags,
}

impl ImageDescription {
    pub fn from_create_info(info: &vk::ImageCreateInfo) -> Self {
        Self {
            image_type: info.image_type,
            format: info.format,
            extent: info.extent,
            mip_levels: info.mip_levels,
            array_layers: info.array_layers,
            flags: info.flags,
        }
    }

    pub fn is_cube(&self) -> bool {
        self.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE) && self.array_layers % 6 == 0
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }
}

struct ImageEntry {
    allocation: Allocation,
    description: ImageDescription,
}

/// Pick the allocator location that satisfies the requested memory properties.
pub fn memory_location(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
    if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        if properties.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::CpuToGpu
        }
    } else if properties.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        MemoryLocation::GpuOnly
    } else {
        MemoryLocation::Unknown
    }
}

// ===========================================================================
// MemoryManager
// ===========================================================================

pub struct MemoryManager {
    device: ash::Device,
    allocator: Option<Allocator>,
    memory_allocations: HashMap<MemoryBlock, Allocation>,
    buffer_allocations: HandleMap<vk::Buffer, Allocation>,
    image_allocations: HandleMap<vk::Image, ImageEntry>,
}

impl MemoryManager {
    pub fn new(device: ash::Device, allocator: Allocator) -> Self {
        Self {
            device,
            allocator: Some(allocator),
            memory_allocations: HashMap::new(),
            buffer_allocations: HandleMap::new(),
            image_allocations: HandleMap::new(),
        }
    }

    fn allocator(&mut self) -> &mut Allocator {
        self.allocator
            .as_mut()
            .expect("Memory manager used after destruction")
    }

    fn allocate(
        &mut self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        linear: bool,
        name: &str,
    ) -> Result<Allocation, String> {
        self.allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory_location(properties),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| format!("Failed to allocate memory for '{}': {:?}", name, e))
    }

    fn release(&mut self, allocation: Allocation) {
        if let Err(e) = self.allocator().free(allocation) {
            warn!("Failed to free allocation: {:?}", e);
        }
    }

    /// Allocate a raw memory block not tied to any resource.
    pub fn allocate_memory(
        &mut self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<MemoryBlock, String> {
        let allocation = self.allocate(requirements, properties, true, name)?;
        let block = MemoryBlock::of(&allocation);
        self.memory_allocations.insert(block, allocation);
        Ok(block)
    }

    pub fn free_memory(&mut self, block: MemoryBlock) {
        let allocation = self
            .memory_allocations
            .remove(&block)
            .expect("Freeing a memory block that was not allocated by this manager");
        self.release(allocation);
    }

    /// Create a buffer and bind freshly allocated memory to it.
    pub fn create_buffer(
        &mut self,
        create_info: &vk::BufferCreateInfo,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<vk::Buffer, String> {
        self.create_buffer_aligned(create_info, properties, 1, name)
    }

    /// Like `create_buffer`, but the bound memory offset is a multiple of `min_alignment`.
    pub fn create_buffer_aligned(
        &mut self,
        create_info: &vk::BufferCreateInfo,
        properties: vk::MemoryPropertyFlags,
        min_alignment: vk::DeviceSize,
        name: &str,
    ) -> Result<vk::Buffer, String> {
        let buffer = unsafe {
            self.device
                .create_buffer(create_info, None)
                .map_err(|e| format!("Failed to create buffer '{}': {:?}", name, e))?
        };

        let mut requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(min_alignment);

        let block = match self.allocate_memory(requirements, properties, name) {
            Ok(block) => block,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe { self.device.bind_buffer_memory(buffer, block.memory, block.offset) };
        if let Err(e) = bound {
            self.free_memory(block);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(format!("Failed to bind buffer memory '{}': {:?}", name, e));
        }

        // The buffer owns the block from here on.
        let allocation = self
            .memory_allocations
            .remove(&block)
            .expect("Freshly allocated block is missing");
        debug!("Created buffer '{}' ({} bytes)", name, create_info.size);
        self.buffer_allocations.insert(buffer, allocation);
        Ok(buffer)
    }

    /// Destroy a buffer and free its memory.
    pub fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        let allocation = self
            .buffer_allocations
            .remove(buffer)
            .expect("Destroying a buffer that was not created by this manager");
        unsafe { self.device.destroy_buffer(buffer, None) };
        self.release(allocation);
    }

    /// Create an image and bind freshly allocated memory to it.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<vk::Image, String> {
        let image = unsafe {
            self.device
                .create_image(create_info, None)
                .map_err(|e| format!("Failed to create image '{}': {:?}", name, e))?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let linear = create_info.tiling == vk::ImageTiling::LINEAR;

        let allocation = match self.allocate(requirements, properties, linear, name) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.release(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(format!("Failed to bind image memory '{}': {:?}", name, e));
        }

        debug!(
            "Created image '{}' ({}x{}x{}, {:?})",
            name,
            create_info.extent.width,
            create_info.extent.height,
            create_info.extent.depth,
            create_info.format
        );
        self.image_allocations.insert(
            image,
            ImageEntry {
                allocation,
                description: ImageDescription::from_create_info(create_info),
            },
        );
        Ok(image)
    }

    /// Destroy an image and free its memory.
    pub fn destroy_image(&mut self, image: vk::Image) {
        let entry = self
            .image_allocations
            .remove(image)
            .expect("Destroying an image that was not created by this manager");
        unsafe { self.device.destroy_image(image, None) };
        self.release(entry.allocation);
    }

    pub fn image_description(&self, image: vk::Image) -> ImageDescription {
        self.image_allocations
            .get(image)
            .map(|entry| entry.description)
            .expect("Querying an image that was not created by this manager")
    }

    pub fn buffer_memory_block(&self, buffer: vk::Buffer) -> MemoryBlock {
        self.buffer_allocations
            .get(buffer)
            .map(MemoryBlock::of)
            .expect("Querying a buffer that was not created by this manager")
    }

    pub fn image_memory_block(&self, image: vk::Image) -> MemoryBlock {
        self.image_allocations
            .get(image)
            .map(|entry| MemoryBlock::of(&entry.allocation))
            .expect("Querying an image that was not created by this manager")
    }

    fn allocation_for_block(&mut self, block: &MemoryBlock) -> Option<&mut Allocation> {
        if self.memory_allocations.contains_key(block) {
            return self.memory_allocations.get_mut(block);
        }
        if let Some(allocation) = self
            .buffer_allocations
            .values_mut()
            .find(|allocation| MemoryBlock::of(allocation) == *block)
        {
            return Some(allocation);
        }
        self.image_allocations
            .values_mut()
            .map(|entry| &mut entry.allocation)
            .find(|allocation| MemoryBlock::of(allocation) == *block)
    }

    /// Host view of a block. Mapping device-local memory is a contract violation.
    ///
    /// Host-visible memory stays persistently mapped by the allocator, so the
    /// returned slice is valid until the owning resource is destroyed.
    pub fn map_memory(&mut self, block: &MemoryBlock) -> &mut [u8] {
        let allocation = self
            .allocation_for_block(block)
            .expect("Mapping a memory block that is not owned by this manager");
        let size = block.size as usize;
        let mapped = allocation
            .mapped_slice_mut()
            .expect("Mapping a memory block that is not host-visible");
        &mut mapped[..size]
    }

    pub fn unmap_memory(&mut self, block: &MemoryBlock) {
        let allocation = self
            .allocation_for_block(block)
            .expect("Unmapping a memory block that is not owned by this manager");
        assert!(
            allocation.mapped_ptr().is_some(),
            "Unmapping a memory block that is not host-visible"
        );
    }

    /// Copy bytes into a host-visible buffer at `offset`.
    pub fn write_buffer(&mut self, buffer: vk::Buffer, offset: usize, data: &[u8]) {
        let block = self.buffer_memory_block(buffer);
        let mapped = self.map_memory(&block);
        mapped[offset..offset + data.len()].copy_from_slice(data);
        self.unmap_memory(&block);
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffer_allocations.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.image_allocations.len()
    }

    /// Free everything still alive and drop the allocator. Must run before device destruction.
    pub fn destroy(&mut self) {
        if self.allocator.is_none() {
            return;
        }

        let leaked_buffers: Vec<_> = self.buffer_allocations.drain().collect();
        let leaked_images: Vec<_> = self.image_allocations.drain().collect();
        let leaked_blocks: Vec<_> = self.memory_allocations.drain().collect();

        if !leaked_buffers.is_empty() || !leaked_images.is_empty() || !leaked_blocks.is_empty() {
            warn!(
                "Releasing leaked resources: {} buffers, {} images, {} memory blocks",
                leaked_buffers.len(),
                leaked_images.len(),
                leaked_blocks.len()
            );
        }

        for (buffer, allocation) in leaked_buffers {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.release(allocation);
        }
        for (image, entry) in leaked_images {
            unsafe { self.device.destroy_image(image, None) };
            self.release(entry.allocation);
        }
        for (_, allocation) in leaked_blocks {
            self.release(allocation);
        }

        drop(self.allocator.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn handle_map_keys_by_raw_value() {
        let mut map: HandleMap<vk::Buffer, u32> = HandleMap::new();
        map.insert(vk::Buffer::from_raw(7), 1);
        map.insert(vk::Buffer::from_raw(9), 2);

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(vk::Buffer::from_raw(7)), Some(&1));
        assert!(map.contains(vk::Buffer::from_raw(9)));
        assert_eq!(map.remove(vk::Buffer::from_raw(7)), Some(1));
        assert!(!map.contains(vk::Buffer::from_raw(7)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn handle_map_rejects_duplicate_registration() {
        let mut map: HandleMap<vk::Image, ()> = HandleMap::new();
        map.insert(vk::Image::from_raw(3), ());
        map.insert(vk::Image::from_raw(3), ());
    }

    #[test]
    fn handle_map_drain_restores_handles() {
        let mut map: HandleMap<vk::Buffer, &str> = HandleMap::new();
        map.insert(vk::Buffer::from_raw(42), "a");
        let drained: Vec<_> = map.drain().collect();
        assert_eq!(drained, vec![(vk::Buffer::from_raw(42), "a")]);
        assert!(map.is_empty());
    }

    #[test]
    fn memory_location_follows_property_flags() {
        assert_eq!(
            memory_location(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
            ),
            MemoryLocation::GpuToCpu
        );
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE
            ),
            MemoryLocation::CpuToGpu
        );
    }

    #[test]
    fn cube_description_requires_flag_and_six_layers() {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R16G16B16A16_SFLOAT)
            .extent(vk::Extent3D { width: 64, height: 64, depth: 1 })
            .mip_levels(7)
            .array_layers(6)
            .flags(vk::ImageCreateFlags::CUBE_COMPATIBLE);
        let description = ImageDescription::from_create_info(&info);
        assert!(description.is_cube());
        assert_eq!(description.extent_2d(), vk::Extent2D { width: 64, height: 64 });

        let flat = ImageDescription::from_create_info(&info.flags(vk::ImageCreateFlags::empty()));
        assert!(!flat.is_cube());
    }
}
