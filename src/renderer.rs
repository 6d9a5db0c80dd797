//! Frame graph: owns the context, swapchain, IBL and the three stages, and
//! records GBuffer → Lighting → Forward into one command buffer per frame.
//!
//! Stages are created in dependency order and torn down in reverse. A single
//! scene is active at a time; registering a new one releases the old one
//! from every stage first.

use ash::vk;
use log::{debug, info, warn};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::path::Path;

use crate::acceleration_structures::AccelerationStructureManager;
use crate::config::RenderConfig;
use crate::forward_stage::ForwardStage;
use crate::gbuffer_stage::GBufferStage;
use crate::direct_lighting::DirectLighting;
use crate::ibl::ImageBasedLighting;
use crate::lighting_stage::LightingStage;
use crate::scene::{Scene, SceneContent};
use crate::screenshot;
use crate::swapchain::Swapchain;
use crate::vulkan_context::VulkanContext;

/// Synchronisation for one frame in flight.
#[derive(Clone, Copy, Default)]
struct FrameSync {
    image_available: vk::Semaphore,
    in_flight: vk::Fence,
    command_buffer: vk::CommandBuffer,
}

fn create_frame_syncs(ctx: &VulkanContext, count: usize) -> Result<Vec<FrameSync>, String> {
    let command_buffers = ctx.allocate_command_buffers(count as u32)?;
    let mut frames: Vec<FrameSync> = command_buffers
        .into_iter()
        .map(|command_buffer| FrameSync {
            command_buffer,
            ..Default::default()
        })
        .collect();

    let created = frames.iter_mut().try_for_each(|frame| {
        frame.image_available = create_semaphore(&ctx.device)?;
        frame.in_flight = unsafe {
            ctx.device
                .create_fence(
                    &vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED),
                    None,
                )
                .map_err(|e| format!("Failed to create frame fence: {:?}", e))?
        };
        Ok::<(), String>(())
    });

    match created {
        Ok(()) => Ok(frames),
        Err(e) => {
            destroy_frame_syncs(ctx, &frames);
            Err(e)
        }
    }
}

fn destroy_frame_syncs(ctx: &VulkanContext, frames: &[FrameSync]) {
    unsafe {
        for frame in frames {
            ctx.device.destroy_semaphore(frame.image_available, None);
            ctx.device.destroy_fence(frame.in_flight, None);
        }
        let command_buffers: Vec<vk::CommandBuffer> =
            frames.iter().map(|frame| frame.command_buffer).collect();
        if !command_buffers.is_empty() {
            ctx.device.free_command_buffers(ctx.command_pool, &command_buffers);
        }
    }
}

fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore, String> {
    unsafe {
        device
            .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            .map_err(|e| format!("Failed to create semaphore: {:?}", e))
    }
}

/// One render-finished semaphore per swapchain image. Presentation holds
/// them until the image is reacquired.
fn create_present_semaphores(device: &ash::Device, count: usize) -> Result<Vec<vk::Semaphore>, String> {
    let mut semaphores = Vec::with_capacity(count);
    for _ in 0..count {
        match create_semaphore(device) {
            Ok(semaphore) => semaphores.push(semaphore),
            Err(e) => {
                destroy_semaphores(device, &semaphores);
                return Err(e);
            }
        }
    }
    Ok(semaphores)
}

fn destroy_semaphores(device: &ash::Device, semaphores: &[vk::Semaphore]) {
    for &semaphore in semaphores {
        unsafe { device.destroy_semaphore(semaphore, None) };
    }
}

/// Frame slot used after `frame`.
pub fn next_frame_index(frame: usize, frames_in_flight: usize) -> usize {
    (frame + 1) % frames_in_flight
}

pub struct Renderer {
    ray_tracing_enabled: bool,
    requested_extent: vk::Extent2D,
    frames: Vec<FrameSync>,
    render_finished: Vec<vk::Semaphore>,
    /// Fence of the frame that last rendered into each swapchain image.
    images_in_flight: Vec<vk::Fence>,
    current_frame: usize,
    last_presented_image: Option<usize>,
    scene: Option<Scene>,
    forward: ForwardStage,
    lighting: LightingStage,
    gbuffer: GBufferStage,
    direct_lighting: DirectLighting,
    ibl: ImageBasedLighting,
    as_manager: AccelerationStructureManager,
    swapchain: Swapchain,
    ctx: VulkanContext,
    destroyed: bool,
}

impl Renderer {
    /// Bring up the context and every stage. Without a window the renderer
    /// draws into offscreen targets.
    pub fn new(
        config: &RenderConfig,
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
        extent: vk::Extent2D,
    ) -> Result<Self, String> {
        let mut ctx = VulkanContext::new(config, window)?;
        let ray_tracing_enabled = ctx.supports_rt();
        let config = RenderConfig {
            ray_tracing_enabled,
            ..config.clone()
        };

        let mut swapchain = Swapchain::new(&mut ctx, extent)?;

        let mut ibl = match ImageBasedLighting::new(&mut ctx, config.max_environment_luminance) {
            Ok(ibl) => ibl,
            Err(e) => {
                swapchain.destroy(&mut ctx);
                return Err(e);
            }
        };

        let mut direct_lighting = match DirectLighting::new(&mut ctx) {
            Ok(direct_lighting) => direct_lighting,
            Err(e) => {
                ibl.destroy(&mut ctx);
                swapchain.destroy(&mut ctx);
                return Err(e);
            }
        };

        let mut gbuffer =
            match GBufferStage::new(&mut ctx, &config, swapchain.extent(), swapchain.image_count()) {
                Ok(stage) => stage,
                Err(e) => {
                    direct_lighting.destroy(&mut ctx);
                    ibl.destroy(&mut ctx);
                    swapchain.destroy(&mut ctx);
                    return Err(e);
                }
            };

        let mut lighting = match LightingStage::new(&mut ctx, &config, &swapchain, gbuffer.gbuffer()) {
            Ok(stage) => stage,
            Err(e) => {
                gbuffer.destroy(&mut ctx);
                direct_lighting.destroy(&mut ctx);
                ibl.destroy(&mut ctx);
                swapchain.destroy(&mut ctx);
                return Err(e);
            }
        };

        let mut forward =
            match ForwardStage::new(&mut ctx, &config, &swapchain, gbuffer.gbuffer().depth.view) {
                Ok(stage) => stage,
                Err(e) => {
                    lighting.destroy(&mut ctx);
                    gbuffer.destroy(&mut ctx);
                    direct_lighting.destroy(&mut ctx);
                    ibl.destroy(&mut ctx);
                    swapchain.destroy(&mut ctx);
                    return Err(e);
                }
            };

        let sync = create_frame_syncs(&ctx, config.frames_in_flight as usize).and_then(|frames| {
            match create_present_semaphores(&ctx.device, swapchain.image_count()) {
                Ok(semaphores) => Ok((frames, semaphores)),
                Err(e) => {
                    destroy_frame_syncs(&ctx, &frames);
                    Err(e)
                }
            }
        });
        let (frames, render_finished) = match sync {
            Ok(sync) => sync,
            Err(e) => {
                forward.destroy(&mut ctx);
                lighting.destroy(&mut ctx);
                gbuffer.destroy(&mut ctx);
                direct_lighting.destroy(&mut ctx);
                ibl.destroy(&mut ctx);
                swapchain.destroy(&mut ctx);
                return Err(e);
            }
        };

        info!(
            "Renderer ready: {}x{}, {} frames in flight, ray tracing: {}",
            swapchain.extent().width,
            swapchain.extent().height,
            frames.len(),
            ray_tracing_enabled
        );

        Ok(Self {
            ray_tracing_enabled,
            requested_extent: extent,
            frames,
            images_in_flight: vec![vk::Fence::null(); swapchain.image_count()],
            render_finished,
            current_frame: 0,
            last_presented_image: None,
            scene: None,
            forward,
            lighting,
            gbuffer,
            direct_lighting,
            ibl,
            as_manager: AccelerationStructureManager::new(),
            swapchain,
            ctx,
            destroyed: false,
        })
    }

    pub fn ray_tracing_enabled(&self) -> bool {
        self.ray_tracing_enabled
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn scene(&self) -> Option<&Scene> {
        self.scene.as_ref()
    }

    /// Upload `content` and make it the active scene.
    pub fn load_scene(&mut self, content: &SceneContent) -> Result<(), String> {
        self.ctx.wait_idle()?;
        self.remove_scene();

        let scene = Scene::create(
            &mut self.ctx,
            &mut self.as_manager,
            &self.ibl,
            &self.direct_lighting,
            content,
            self.ray_tracing_enabled,
        )?;
        self.register_scene(scene)
    }

    /// Bind `scene` to every stage and take ownership of it. On failure the
    /// stages are left unbound and the scene is destroyed.
    pub fn register_scene(&mut self, mut scene: Scene) -> Result<(), String> {
        self.ctx.wait_idle()?;
        self.remove_scene();

        let extent = self.swapchain.extent();
        scene.camera.set_aspect(extent.width, extent.height);

        if let Err(e) = self.register_stages(&scene) {
            self.release_stages();
            scene.destroy(&mut self.ctx, &mut self.as_manager);
            return Err(e);
        }

        debug_assert!(self.stages_bound());
        info!("Registered scene {:?}", scene.id());
        self.scene = Some(scene);
        Ok(())
    }

    fn register_stages(&mut self, scene: &Scene) -> Result<(), String> {
        self.gbuffer.register_scene(&mut self.ctx, scene)?;
        self.lighting.register_scene(&mut self.ctx, scene, &self.ibl)?;
        self.forward.register_scene(&mut self.ctx, scene)
    }

    fn release_stages(&mut self) {
        self.forward.remove_scene(&mut self.ctx);
        self.lighting.remove_scene(&mut self.ctx);
        self.gbuffer.remove_scene(&mut self.ctx);
        debug_assert!(
            !self.gbuffer.is_scene_bound()
                && !self.lighting.is_scene_bound()
                && !self.forward.is_scene_bound()
        );
    }

    fn stages_bound(&self) -> bool {
        self.gbuffer.is_scene_bound()
            && self.lighting.is_scene_bound()
            && self.forward.is_scene_bound()
    }

    /// Unbind and destroy the active scene. The device must be idle.
    pub fn remove_scene(&mut self) {
        self.release_stages();
        if let Some(mut scene) = self.scene.take() {
            info!("Removing scene {:?}", scene.id());
            scene.destroy(&mut self.ctx, &mut self.as_manager);
        }
    }

    /// Record and submit one frame, then present it. Recreates the swapchain
    /// when the surface reports it out of date.
    pub fn draw_frame(&mut self) -> Result<(), String> {
        if self.scene.is_none() {
            return Err("Cannot draw a frame without a scene".to_string());
        }
        let frame = self.frames[self.current_frame];
        let device = &self.ctx.device;

        unsafe {
            device
                .wait_for_fences(&[frame.in_flight], true, u64::MAX)
                .map_err(|e| format!("Failed to wait for frame fence: {:?}", e))?;
        }

        let Some(image_index) = self
            .swapchain
            .acquire_next_image(&self.ctx, frame.image_available)?
        else {
            debug!("Swapchain out of date on acquire");
            return self.recreate_swapchain();
        };
        let index = image_index as usize;
        let device = &self.ctx.device;

        let previous = std::mem::replace(&mut self.images_in_flight[index], frame.in_flight);
        if previous != vk::Fence::null() && previous != frame.in_flight {
            unsafe {
                device
                    .wait_for_fences(&[previous], true, u64::MAX)
                    .map_err(|e| format!("Failed to wait for image fence: {:?}", e))?;
            }
        }

        let scene = self.scene.as_ref().ok_or("Cannot draw a frame without a scene")?;
        let cmd = frame.command_buffer;

        unsafe {
            device
                .reset_fences(&[frame.in_flight])
                .map_err(|e| format!("Failed to reset frame fence: {:?}", e))?;
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| format!("Failed to reset command buffer: {:?}", e))?;
            device
                .begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(|e| format!("Failed to begin frame command buffer: {:?}", e))?;
        }

        let image_layout = self.swapchain.begin_frame_layout(index);
        self.gbuffer.execute(device, cmd, scene, index);
        self.lighting.execute(
            device,
            cmd,
            scene,
            self.swapchain.images()[index],
            image_layout,
            index,
        );
        self.forward.execute(device, cmd, scene, index);

        unsafe {
            device
                .end_command_buffer(cmd)
                .map_err(|e| format!("Failed to end frame command buffer: {:?}", e))?;
        }

        let command_buffers = [cmd];
        let wait_semaphores = [frame.image_available];
        // The first write to the acquired image is the lighting dispatch.
        let wait_stages = [vk::PipelineStageFlags::COMPUTE_SHADER];
        let signal_semaphores = [self.render_finished[index]];
        let offscreen = self.swapchain.is_offscreen();

        let mut submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        if !offscreen {
            submit_info = submit_info
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .signal_semaphores(&signal_semaphores);
        }

        unsafe {
            device
                .queue_submit(self.ctx.graphics_queue, &[submit_info], frame.in_flight)
                .map_err(|e| format!("Failed to submit frame: {:?}", e))?;
        }

        let out_of_date = self
            .swapchain
            .present(&self.ctx, image_index, self.render_finished[index])?;

        self.last_presented_image = Some(index);
        self.current_frame = next_frame_index(self.current_frame, self.frames.len());

        if out_of_date {
            debug!("Swapchain out of date on present");
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    /// Resize to `width`×`height`. A zero-sized request (minimised window) is
    /// ignored.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), String> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.requested_extent = vk::Extent2D { width, height };
        self.recreate_swapchain()
    }

    fn recreate_swapchain(&mut self) -> Result<(), String> {
        self.ctx.wait_idle()?;
        self.swapchain.recreate(&mut self.ctx, self.requested_extent)?;

        let extent = self.swapchain.extent();
        self.gbuffer.resize(&mut self.ctx, extent)?;
        self.lighting
            .resize(&mut self.ctx, &self.swapchain, self.gbuffer.gbuffer())?;
        self.forward
            .resize(&mut self.ctx, &self.swapchain, self.gbuffer.gbuffer().depth.view)?;

        self.images_in_flight = vec![vk::Fence::null(); self.swapchain.image_count()];
        self.last_presented_image = None;
        if let Some(scene) = self.scene.as_mut() {
            scene.camera.set_aspect(extent.width, extent.height);
        }

        info!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Rebuild every stage pipeline from the current shader sources.
    pub fn reload_shaders(&mut self) -> Result<(), String> {
        self.ctx.wait_idle()?;
        self.gbuffer.reload_shaders(&mut self.ctx)?;
        self.lighting.reload_shaders(&mut self.ctx)?;
        self.forward.reload_shaders(&mut self.ctx)?;
        info!("Shaders reloaded");
        Ok(())
    }

    pub fn toggle_light_volume(&mut self) -> bool {
        self.forward.toggle_light_volume()
    }

    /// Save the most recently presented offscreen target as a PNG.
    pub fn capture(&mut self, path: &Path) -> Result<(), String> {
        if !self.swapchain.is_offscreen() {
            return Err("Capture is only available for offscreen targets".to_string());
        }
        let index = self
            .last_presented_image
            .ok_or("No frame has been rendered yet")?;

        self.ctx.wait_idle()?;
        let extent = self.swapchain.extent();
        let pixels = screenshot::read_pixels(
            &mut self.ctx,
            self.swapchain.images()[index],
            self.swapchain.format(),
            extent,
        )?;
        screenshot::save_png(pixels, extent.width, extent.height, path)
    }

    /// Tear everything down in reverse creation order.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        if let Err(e) = self.ctx.wait_idle() {
            warn!("{}", e);
        }

        self.remove_scene();
        destroy_semaphores(&self.ctx.device, &self.render_finished);
        self.render_finished.clear();
        destroy_frame_syncs(&self.ctx, &self.frames);
        self.frames.clear();

        self.forward.destroy(&mut self.ctx);
        self.lighting.destroy(&mut self.ctx);
        self.gbuffer.destroy(&mut self.ctx);
        self.direct_lighting.destroy(&mut self.ctx);
        self.ibl.destroy(&mut self.ctx);
        self.as_manager.destroy_all(&mut self.ctx);
        self.swapchain.destroy(&mut self.ctx);

        debug!(
            "Live at teardown: {} buffers, {} images, {} descriptor sets, {} set layouts",
            self.ctx.memory_manager.live_buffer_count(),
            self.ctx.memory_manager.live_image_count(),
            self.ctx.descriptor_pool.live_set_count(),
            self.ctx.descriptor_pool.live_layout_count()
        );
        self.ctx.destroy();
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_slots_wrap_around() {
        assert_eq!(next_frame_index(0, 2), 1);
        assert_eq!(next_frame_index(1, 2), 0);
        assert_eq!(next_frame_index(0, 1), 0);
    }

    #[test]
    fn frame_sync_defaults_to_null_handles() {
        let frame = FrameSync::default();
        assert_eq!(frame.image_available, vk::Semaphore::null());
        assert_eq!(frame.in_flight, vk::Fence::null());
        assert_eq!(frame.command_buffer, vk::CommandBuffer::null());
    }
}
