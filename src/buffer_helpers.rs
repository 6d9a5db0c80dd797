//! Buffer creation and update helpers built on the memory manager.

use ash::vk;
use log::debug;

use crate::image_helpers::SyncScope;
use crate::vulkan_context::VulkanContext;

/// Largest payload accepted by `vkCmdUpdateBuffer`.
pub const MAX_INLINE_UPDATE_SIZE: usize = 65536;

/// Create a buffer without initial contents.
pub fn create_empty_buffer(
    ctx: &mut VulkanContext,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
    name: &str,
) -> Result<vk::Buffer, String> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    ctx.memory_manager.create_buffer(&buffer_info, properties, name)
}

/// Create a host-visible buffer and upload data into it.
pub fn create_buffer_with_data(
    ctx: &mut VulkanContext,
    data: &[u8],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> Result<vk::Buffer, String> {
    assert!(!data.is_empty(), "Buffer '{}' created from empty data", name);

    let buffer = create_empty_buffer(
        ctx,
        data.len() as u64,
        usage,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        name,
    )?;
    ctx.memory_manager.write_buffer(buffer, 0, data);

    Ok(buffer)
}

/// Create a device-local buffer filled through a staging buffer and a one-time copy.
pub fn create_device_local_buffer_with_data(
    ctx: &mut VulkanContext,
    data: &[u8],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> Result<vk::Buffer, String> {
    let staging = create_buffer_with_data(
        ctx,
        data,
        vk::BufferUsageFlags::TRANSFER_SRC,
        &format!("{} staging", name),
    )?;

    let buffer = match create_empty_buffer(
        ctx,
        data.len() as u64,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        name,
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            ctx.memory_manager.destroy_buffer(staging);
            return Err(e);
        }
    };

    let region = vk::BufferCopy::default().size(data.len() as u64);
    let copied = ctx.execute_one_time_commands(|cmd| {
        unsafe {
            ctx.device
                .cmd_copy_buffer(cmd, staging, buffer, std::slice::from_ref(&region));
        }
        Ok(())
    });

    ctx.memory_manager.destroy_buffer(staging);
    if let Err(e) = copied {
        ctx.memory_manager.destroy_buffer(buffer);
        return Err(e);
    }

    debug!("Uploaded {} bytes into device-local buffer '{}'", data.len(), name);
    Ok(buffer)
}

/// Record an inline buffer update bracketed by barriers.
///
/// `wait` covers earlier accesses the update must follow, `block` covers the
/// later accesses that must see the new contents.
pub fn update_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    data: &[u8],
    wait: SyncScope,
    block: SyncScope,
) {
    assert!(
        !data.is_empty() && data.len() % 4 == 0 && data.len() <= MAX_INLINE_UPDATE_SIZE,
        "Inline buffer updates need a non-empty size that is a multiple of 4 and at most {} bytes",
        MAX_INLINE_UPDATE_SIZE
    );

    let before = vk::BufferMemoryBarrier::default()
        .src_access_mask(wait.access)
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE);

    let after = vk::BufferMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(block.access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            wait.stages,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            std::slice::from_ref(&before),
            &[],
        );
        device.cmd_update_buffer(cmd, buffer, 0, data);
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            block.stages,
            vk::DependencyFlags::empty(),
            &[],
            std::slice::from_ref(&after),
            &[],
        );
    }
}

/// GPU virtual address of a buffer created with `SHADER_DEVICE_ADDRESS` usage.
pub fn buffer_device_address(device: &ash::Device, buffer: vk::Buffer) -> vk::DeviceAddress {
    let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
    unsafe { device.get_buffer_device_address(&info) }
}

