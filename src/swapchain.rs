//! Presentable targets: a surface swapchain, or offscreen images in headless
//! runs.
//!
//! Stages only see image count, images, views, extent, format and the layout
//! an image is in when handed over for presentation.

use ash::vk;
use log::info;

use crate::image_helpers::{
    self, ImageLayoutTransition, SyncScope, Texture, FLAT_COLOR,
};
use crate::vulkan_context::VulkanContext;

pub const OFFSCREEN_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const OFFSCREEN_IMAGE_COUNT: u32 = 3;

const PREFERRED_SURFACE_FORMATS: [vk::Format; 2] =
    [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

fn target_usage() -> vk::ImageUsageFlags {
    vk::ImageUsageFlags::STORAGE
        | vk::ImageUsageFlags::COLOR_ATTACHMENT
        | vk::ImageUsageFlags::TRANSFER_SRC
}

enum Backing {
    Surface(vk::SwapchainKHR),
    Offscreen(Vec<Texture>),
}

pub struct Swapchain {
    backing: Backing,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    /// Layout each image is in when the next frame starts using it.
    image_layouts: Vec<vk::ImageLayout>,
    extent: vk::Extent2D,
    format: vk::Format,
    present_layout: vk::ImageLayout,
    next_offscreen_image: u32,
}

/// Pick the surface extent: the surface's own when fixed, the requested one
/// clamped to the supported range otherwise.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: requested
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let max = if caps.max_image_count > 0 {
        caps.max_image_count
    } else {
        u32::MAX
    };
    (caps.min_image_count + 1).min(max)
}

/// First preferred format the surface offers in sRGB-nonlinear space whose
/// optimal tiling supports storage writes.
fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    supports_storage: impl Fn(vk::Format) -> bool,
) -> Option<vk::SurfaceFormatKHR> {
    PREFERRED_SURFACE_FORMATS.iter().find_map(|&preferred| {
        formats
            .iter()
            .find(|f| {
                f.format == preferred && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .filter(|f| supports_storage(f.format))
            .copied()
    })
}

impl Swapchain {
    /// Surface swapchain when the context has a surface, offscreen targets
    /// otherwise.
    pub fn new(ctx: &mut VulkanContext, extent: vk::Extent2D) -> Result<Self, String> {
        let mut swapchain = Swapchain {
            backing: Backing::Offscreen(Vec::new()),
            images: Vec::new(),
            image_views: Vec::new(),
            image_layouts: Vec::new(),
            extent,
            format: OFFSCREEN_FORMAT,
            present_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            next_offscreen_image: 0,
        };
        if let Err(e) = swapchain.create(ctx, extent, vk::SwapchainKHR::null()) {
            swapchain.destroy(ctx);
            return Err(e);
        }
        Ok(swapchain)
    }

    pub fn is_offscreen(&self) -> bool {
        matches!(self.backing, Backing::Offscreen(_))
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn present_layout(&self) -> vk::ImageLayout {
        self.present_layout
    }

    /// Layout of image `index` at the start of this frame. Every frame hands
    /// the image back in the present layout.
    pub fn begin_frame_layout(&mut self, index: usize) -> vk::ImageLayout {
        std::mem::replace(&mut self.image_layouts[index], self.present_layout)
    }

    fn create(
        &mut self,
        ctx: &mut VulkanContext,
        extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<(), String> {
        if ctx.surface_loader.is_some() {
            self.create_surface_swapchain(ctx, extent, old_swapchain)
        } else {
            self.create_offscreen(ctx, extent)
        }
    }

    fn create_surface_swapchain(
        &mut self,
        ctx: &mut VulkanContext,
        requested: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<(), String> {
        let surface_loader = ctx.surface_loader.as_ref().ok_or("No surface loader")?;
        let swapchain_loader = ctx.swapchain_loader.as_ref().ok_or("No swapchain loader")?;

        let caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)
                .map_err(|e| format!("Failed to get surface capabilities: {:?}", e))?
        };

        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(ctx.physical_device, ctx.surface)
                .map_err(|e| format!("Failed to get surface formats: {:?}", e))?
        };

        let surface_format = choose_surface_format(&formats, |format| {
            let props = unsafe {
                ctx.instance
                    .get_physical_device_format_properties(ctx.physical_device, format)
            };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::STORAGE_IMAGE)
        })
        .ok_or("Surface offers no UNORM format usable as a storage image")?;

        let extent = choose_extent(&caps, requested);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface)
            .min_image_count(choose_image_count(&caps))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(target_usage())
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe {
            swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| format!("Failed to create swapchain: {:?}", e))?
        };
        self.backing = Backing::Surface(swapchain);
        self.format = surface_format.format;
        self.extent = extent;
        self.present_layout = vk::ImageLayout::PRESENT_SRC_KHR;

        self.images = unsafe {
            swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(|e| format!("Failed to get swapchain images: {:?}", e))?
        };

        for &image in &self.images {
            let view = image_helpers::create_image_view(
                &ctx.device,
                image,
                vk::ImageViewType::TYPE_2D,
                self.format,
                FLAT_COLOR,
            )?;
            self.image_views.push(view);
        }

        // Surface images can't be touched before they are acquired, so the
        // first frame on each image starts from UNDEFINED.
        self.image_layouts = vec![vk::ImageLayout::UNDEFINED; self.images.len()];

        info!(
            "Swapchain created: {}x{} format={:?} images={}",
            self.extent.width,
            self.extent.height,
            self.format,
            self.images.len()
        );
        Ok(())
    }

    fn create_offscreen(&mut self, ctx: &mut VulkanContext, extent: vk::Extent2D) -> Result<(), String> {
        self.format = OFFSCREEN_FORMAT;
        self.extent = extent;
        self.present_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;

        let mut textures = Vec::with_capacity(OFFSCREEN_IMAGE_COUNT as usize);
        for i in 0..OFFSCREEN_IMAGE_COUNT {
            match image_helpers::create_render_target(
                ctx,
                self.format,
                extent,
                target_usage(),
                &format!("offscreen target {}", i),
            ) {
                Ok(texture) => textures.push(texture),
                Err(e) => {
                    self.backing = Backing::Offscreen(textures);
                    return Err(e);
                }
            }
        }

        self.images = textures.iter().map(|t| t.image).collect();
        self.image_views = textures.iter().map(|t| t.view).collect();
        self.backing = Backing::Offscreen(textures);

        let transition = ImageLayoutTransition::new(
            vk::ImageLayout::UNDEFINED,
            self.present_layout,
            SyncScope::WAIT_FOR_NONE,
            SyncScope::TRANSFER_READ,
        );
        ctx.execute_one_time_commands(|cmd| {
            for &image in &self.images {
                image_helpers::transit_image_layout(&ctx.device, cmd, image, FLAT_COLOR, &transition);
            }
            Ok(())
        })?;
        self.image_layouts = vec![self.present_layout; self.images.len()];

        info!(
            "Offscreen targets created: {}x{} format={:?} images={}",
            extent.width,
            extent.height,
            self.format,
            self.images.len()
        );
        Ok(())
    }

    /// Rebuild the targets for a new extent. The device must be idle.
    pub fn recreate(&mut self, ctx: &mut VulkanContext, extent: vk::Extent2D) -> Result<(), String> {
        let old_swapchain = self.release_targets(ctx);
        let result = self.create(ctx, extent, old_swapchain);
        if old_swapchain != vk::SwapchainKHR::null() {
            if let Some(loader) = &ctx.swapchain_loader {
                unsafe { loader.destroy_swapchain(old_swapchain, None) };
            }
        }
        result
    }

    /// Destroy views and offscreen images; hand back a surface swapchain so
    /// it can be passed as `old_swapchain`.
    fn release_targets(&mut self, ctx: &mut VulkanContext) -> vk::SwapchainKHR {
        let backing = std::mem::replace(&mut self.backing, Backing::Offscreen(Vec::new()));
        let old = match backing {
            Backing::Surface(swapchain) => {
                image_helpers::destroy_image_views(&ctx.device, &self.image_views);
                swapchain
            }
            Backing::Offscreen(textures) => {
                for texture in &textures {
                    image_helpers::destroy_texture(ctx, texture);
                }
                vk::SwapchainKHR::null()
            }
        };
        self.images.clear();
        self.image_views.clear();
        self.image_layouts.clear();
        self.next_offscreen_image = 0;
        old
    }

    /// Acquire the next image, signalling `semaphore` for surface swapchains.
    /// Returns `None` when the swapchain is out of date and must be recreated.
    pub fn acquire_next_image(
        &mut self,
        ctx: &VulkanContext,
        semaphore: vk::Semaphore,
    ) -> Result<Option<u32>, String> {
        match &self.backing {
            Backing::Surface(swapchain) => {
                let loader = ctx.swapchain_loader.as_ref().ok_or("No swapchain loader")?;
                let acquired = unsafe {
                    loader.acquire_next_image(*swapchain, u64::MAX, semaphore, vk::Fence::null())
                };
                match acquired {
                    Ok((index, _suboptimal)) => Ok(Some(index)),
                    Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
                    Err(e) => Err(format!("Failed to acquire swapchain image: {:?}", e)),
                }
            }
            Backing::Offscreen(_) => {
                let index = self.next_offscreen_image;
                self.next_offscreen_image = (index + 1) % self.images.len() as u32;
                Ok(Some(index))
            }
        }
    }

    /// Present image `index` after `wait_semaphore`. Returns true when the
    /// swapchain should be recreated. Offscreen targets are left in place.
    pub fn present(
        &self,
        ctx: &VulkanContext,
        index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, String> {
        let Backing::Surface(swapchain) = &self.backing else {
            return Ok(false);
        };
        let loader = ctx.swapchain_loader.as_ref().ok_or("No swapchain loader")?;

        let swapchains = [*swapchain];
        let image_indices = [index];
        let wait_semaphores = [wait_semaphore];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(ctx.graphics_queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(format!("Failed to present: {:?}", e)),
        }
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        let swapchain = self.release_targets(ctx);
        if swapchain != vk::SwapchainKHR::null() {
            if let Some(loader) = &ctx.swapchain_loader {
                unsafe { loader.destroy_swapchain(swapchain, None) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let extent = choose_extent(
            &caps((800, 600), 2, 3),
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!(extent, vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn free_surface_extent_is_clamped() {
        let extent = choose_extent(
            &caps((u32::MAX, u32::MAX), 2, 3),
            vk::Extent2D {
                width: 10000,
                height: 0,
            },
        );
        assert_eq!(extent, vk::Extent2D { width: 4096, height: 1 });
    }

    #[test]
    fn image_count_is_one_above_minimum_within_maximum() {
        assert_eq!(choose_image_count(&caps((1, 1), 2, 0)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 3, 3)), 3);
    }

    #[test]
    fn surface_format_requires_storage_support() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let any = choose_surface_format(&formats, |_| true).map(|f| f.format);
        assert_eq!(any, Some(vk::Format::B8G8R8A8_UNORM));

        let rgba_only =
            choose_surface_format(&formats, |f| f == vk::Format::R8G8B8A8_UNORM).map(|f| f.format);
        assert_eq!(rgba_only, Some(vk::Format::R8G8B8A8_UNORM));

        assert!(choose_surface_format(&formats, |_| false).is_none());
    }
}
