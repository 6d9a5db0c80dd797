//! Headless capture: copy a presented target into a host-visible buffer and
//! save it as an RGBA8 PNG.

use ash::vk;
use log::info;
use std::path::Path;

use crate::buffer_helpers;
use crate::image_helpers::{self, SyncScope, FLAT_COLOR};
use crate::vulkan_context::VulkanContext;

const BYTES_PER_PIXEL: u64 = 4;

/// Reorder 8-bit BGRA texels to RGBA in place. Other supported formats are
/// already RGBA.
pub fn to_rgba8(pixels: &mut [u8], format: vk::Format) -> Result<(), String> {
    match format {
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => Ok(()),
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => {
            for texel in pixels.chunks_exact_mut(BYTES_PER_PIXEL as usize) {
                texel.swap(0, 2);
            }
            Ok(())
        }
        _ => Err(format!("Capture of {:?} images is not supported", format)),
    }
}

fn record_copy_image_to_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    buffer: vk::Buffer,
    extent: vk::Extent2D,
) {
    let region = vk::BufferImageCopy::default()
        .image_subresource(image_helpers::subresource_layers(&FLAT_COLOR, 0))
        .image_extent(image_helpers::extent_3d(extent));

    let host_read = vk::BufferMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .size(vk::WHOLE_SIZE);

    unsafe {
        device.cmd_copy_image_to_buffer(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            buffer,
            &[region],
        );
        device.cmd_pipeline_barrier(
            cmd,
            SyncScope::TRANSFER_WRITE.stages,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[],
            &[host_read],
            &[],
        );
    }
}

/// Read back `image`, which must be idle and in TRANSFER_SRC_OPTIMAL.
/// Returns tightly packed RGBA8 rows.
pub fn read_pixels(
    ctx: &mut VulkanContext,
    image: vk::Image,
    format: vk::Format,
    extent: vk::Extent2D,
) -> Result<Vec<u8>, String> {
    let size = extent.width as u64 * extent.height as u64 * BYTES_PER_PIXEL;
    let buffer = buffer_helpers::create_empty_buffer(
        ctx,
        size,
        vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        "capture readback",
    )?;

    let copied = ctx.execute_one_time_commands(|cmd| {
        record_copy_image_to_buffer(&ctx.device, cmd, image, buffer, extent);
        Ok(())
    });
    if let Err(e) = copied {
        ctx.memory_manager.destroy_buffer(buffer);
        return Err(e);
    }

    let block = ctx.memory_manager.buffer_memory_block(buffer);
    let mut pixels = ctx.memory_manager.map_memory(&block)[..size as usize].to_vec();
    ctx.memory_manager.unmap_memory(&block);
    ctx.memory_manager.destroy_buffer(buffer);

    to_rgba8(&mut pixels, format)?;
    Ok(pixels)
}

/// Save RGBA pixel data as a PNG file.
pub fn save_png(pixels: Vec<u8>, width: u32, height: u32, path: &Path) -> Result<(), String> {
    let img = image::RgbaImage::from_raw(width, height, pixels)
        .ok_or("Pixel data does not match the image size")?;

    img.save(path)
        .map_err(|e| format!("Failed to save PNG to {:?}: {}", path, e))?;

    info!("Saved {}x{} capture to {}", width, height, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_is_swizzled_to_rgba() {
        let mut pixels = vec![1, 2, 3, 4, 10, 20, 30, 40];
        to_rgba8(&mut pixels, vk::Format::B8G8R8A8_UNORM).unwrap();
        assert_eq!(pixels, vec![3, 2, 1, 4, 30, 20, 10, 40]);
    }

    #[test]
    fn rgba_is_left_alone() {
        let mut pixels = vec![1, 2, 3, 4];
        to_rgba8(&mut pixels, vk::Format::R8G8B8A8_UNORM).unwrap();
        assert_eq!(pixels, vec![1, 2, 3, 4]);
    }

    #[test]
    fn float_targets_cannot_be_captured() {
        let mut pixels = vec![0; 8];
        assert!(to_rgba8(&mut pixels, vk::Format::R16G16B16A16_SFLOAT).is_err());
    }

    #[test]
    fn png_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("capture-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("capture.png");

        let pixels: Vec<u8> = (0..2 * 2 * 4).map(|i| i as u8 * 10).collect();
        save_png(pixels.clone(), 2, 2, &path).unwrap();

        let loaded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(loaded.dimensions(), (2, 2));
        assert_eq!(loaded.into_raw(), pixels);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn mismatched_pixel_count_is_an_error() {
        let path = std::env::temp_dir().join("never-written.png");
        assert!(save_png(vec![0; 3], 2, 2, &path).is_err());
    }
}
