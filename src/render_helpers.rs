//! Shared pieces of render stages: per-image camera uniforms, samplers,
//! render passes and framebuffers.

use ash::vk;
use glam::Mat4;

use crate::buffer_helpers;
use crate::descriptors::{self, DescriptorDescription, MultiDescriptorSet};
use crate::image_helpers::SyncScope;
use crate::vulkan_context::VulkanContext;

// ===========================================================================
// Camera data
// ===========================================================================

/// One camera uniform buffer per swapchain image plus the matching sets.
///
/// The buffers are device-local and written from the frame's command buffer,
/// so an update never races with a frame still in flight on another image.
#[derive(Default)]
pub struct CameraData {
    pub buffers: Vec<vk::Buffer>,
    pub descriptor_set: MultiDescriptorSet,
}

pub fn create_camera_data(
    ctx: &mut VulkanContext,
    buffer_count: usize,
    stage_flags: vk::ShaderStageFlags,
    name: &str,
) -> Result<CameraData, String> {
    let mut buffers = Vec::with_capacity(buffer_count);
    for i in 0..buffer_count {
        let created = buffer_helpers::create_empty_buffer(
            ctx,
            std::mem::size_of::<Mat4>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            &format!("{} camera {}", name, i),
        );
        match created {
            Ok(buffer) => buffers.push(buffer),
            Err(e) => {
                for buffer in buffers {
                    ctx.memory_manager.destroy_buffer(buffer);
                }
                return Err(e);
            }
        }
    }

    let description = vec![DescriptorDescription::new(
        1,
        vk::DescriptorType::UNIFORM_BUFFER,
        stage_flags,
    )];
    let data: Vec<_> = buffers
        .iter()
        .map(|&buffer| vec![descriptors::uniform_buffer_data(buffer)])
        .collect();

    match ctx
        .descriptor_pool
        .create_multi_descriptor_set(&description, &data)
    {
        Ok(descriptor_set) => Ok(CameraData {
            buffers,
            descriptor_set,
        }),
        Err(e) => {
            for buffer in buffers {
                ctx.memory_manager.destroy_buffer(buffer);
            }
            Err(e)
        }
    }
}

/// Record the camera matrix update for swapchain image `index`. Must be
/// recorded outside of a render pass.
pub fn update_camera_data(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    camera_data: &CameraData,
    index: usize,
    matrix: &Mat4,
) {
    buffer_helpers::update_buffer(
        device,
        cmd,
        camera_data.buffers[index],
        bytemuck::bytes_of(matrix),
        SyncScope::WAIT_FOR_NONE,
        SyncScope::UNIFORM_READ,
    );
}

/// Safe on a default (never created) value.
pub fn destroy_camera_data(ctx: &mut VulkanContext, camera_data: &CameraData) {
    if camera_data.descriptor_set.layout != vk::DescriptorSetLayout::null() {
        ctx.descriptor_pool
            .destroy_multi_descriptor_set(&camera_data.descriptor_set);
    }
    for &buffer in &camera_data.buffers {
        ctx.memory_manager.destroy_buffer(buffer);
    }
}

// ===========================================================================
// Samplers
// ===========================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDescription {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub unnormalized_coords: bool,
}

impl SamplerDescription {
    /// Trilinear, repeating, full mip range.
    pub const DEFAULT: SamplerDescription = SamplerDescription {
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode: vk::SamplerAddressMode::REPEAT,
        max_anisotropy: None,
        min_lod: 0.0,
        max_lod: vk::LOD_CLAMP_NONE,
        unnormalized_coords: false,
    };

    /// Exact texel fetches with unnormalized coordinates, used for depth reads.
    pub const TEXEL: SamplerDescription = SamplerDescription {
        mag_filter: vk::Filter::NEAREST,
        min_filter: vk::Filter::NEAREST,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        max_anisotropy: None,
        min_lod: 0.0,
        max_lod: 0.0,
        unnormalized_coords: true,
    };
}

pub fn create_sampler(
    device: &ash::Device,
    description: &SamplerDescription,
) -> Result<vk::Sampler, String> {
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(description.mag_filter)
        .min_filter(description.min_filter)
        .mipmap_mode(description.mipmap_mode)
        .address_mode_u(description.address_mode)
        .address_mode_v(description.address_mode)
        .address_mode_w(description.address_mode)
        .anisotropy_enable(description.max_anisotropy.is_some())
        .max_anisotropy(description.max_anisotropy.unwrap_or(1.0))
        .compare_enable(false)
        .min_lod(description.min_lod)
        .max_lod(description.max_lod)
        .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
        .unnormalized_coordinates(description.unnormalized_coords);

    unsafe {
        device
            .create_sampler(&sampler_info, None)
            .map_err(|e| format!("Failed to create sampler: {:?}", e))
    }
}

// ===========================================================================
// Render passes
// ===========================================================================

#[derive(Clone, Copy, Debug)]
pub struct AttachmentDescription {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    /// Layout during the single subpass.
    pub subpass_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentDescription {
    /// Cleared at the start of the pass and kept afterwards.
    pub fn cleared(format: vk::Format, subpass_layout: vk::ImageLayout, final_layout: vk::ImageLayout) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            subpass_layout,
            final_layout,
        }
    }

    /// Loaded from `initial_layout` and kept afterwards.
    pub fn loaded(
        format: vk::Format,
        initial_layout: vk::ImageLayout,
        subpass_layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
    ) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout,
            subpass_layout,
            final_layout,
        }
    }

    fn to_vk(self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::default()
            .format(self.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
    }
}

/// Dependency between the work outside the pass and its single subpass.
pub fn external_dependency(src: SyncScope, dst: SyncScope, incoming: bool) -> vk::SubpassDependency {
    let (src_subpass, dst_subpass) = if incoming {
        (vk::SUBPASS_EXTERNAL, 0)
    } else {
        (0, vk::SUBPASS_EXTERNAL)
    };
    vk::SubpassDependency::default()
        .src_subpass(src_subpass)
        .dst_subpass(dst_subpass)
        .src_stage_mask(src.stages)
        .dst_stage_mask(dst.stages)
        .src_access_mask(src.access)
        .dst_access_mask(dst.access)
}

/// Single-subpass render pass. Color attachments come first, the depth
/// attachment (if any) is last.
pub fn create_render_pass(
    device: &ash::Device,
    color_attachments: &[AttachmentDescription],
    depth_attachment: Option<AttachmentDescription>,
    dependencies: &[vk::SubpassDependency],
) -> Result<vk::RenderPass, String> {
    let attachments: Vec<vk::AttachmentDescription> = color_attachments
        .iter()
        .chain(depth_attachment.iter())
        .map(|a| a.to_vk())
        .collect();

    let color_refs: Vec<vk::AttachmentReference> = color_attachments
        .iter()
        .enumerate()
        .map(|(i, a)| vk::AttachmentReference {
            attachment: i as u32,
            layout: a.subpass_layout,
        })
        .collect();
    let depth_ref = depth_attachment.map(|a| vk::AttachmentReference {
        attachment: color_attachments.len() as u32,
        layout: a.subpass_layout,
    });

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(depth_ref) = depth_ref.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(dependencies);

    unsafe {
        device
            .create_render_pass(&render_pass_info, None)
            .map_err(|e| format!("Failed to create render pass: {:?}", e))
    }
}

// ===========================================================================
// Framebuffers
// ===========================================================================

/// One framebuffer per attachment list, all sharing `render_pass` and `extent`.
pub fn create_framebuffers(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    attachments: &[Vec<vk::ImageView>],
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>, String> {
    let mut framebuffers = Vec::with_capacity(attachments.len());
    for views in attachments {
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match unsafe { device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                destroy_framebuffers(device, &framebuffers);
                return Err(format!("Failed to create framebuffer: {:?}", e));
            }
        }
    }
    Ok(framebuffers)
}

pub fn destroy_framebuffers(device: &ash::Device, framebuffers: &[vk::Framebuffer]) {
    for &framebuffer in framebuffers {
        unsafe { device.destroy_framebuffer(framebuffer, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_sampler_reads_exact_texels() {
        let texel = SamplerDescription::TEXEL;
        assert!(texel.unnormalized_coords);
        assert_eq!(texel.min_filter, vk::Filter::NEAREST);
        assert_eq!(texel.address_mode, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(texel.max_lod, 0.0);
    }

    #[test]
    fn cleared_attachment_discards_previous_contents() {
        let attachment = AttachmentDescription::cleared(
            vk::Format::D32_SFLOAT,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let desc = attachment.to_vk();
        assert_eq!(desc.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(desc.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(desc.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn outgoing_dependency_targets_external() {
        let dep = external_dependency(
            SyncScope::COLOR_ATTACHMENT_WRITE,
            SyncScope::COMPUTE_SHADER_READ,
            false,
        );
        assert_eq!(dep.src_subpass, 0);
        assert_eq!(dep.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dep.dst_access_mask, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn default_sampler_covers_all_mips() {
        assert_eq!(SamplerDescription::DEFAULT.max_lod, vk::LOD_CLAMP_NONE);
        assert_eq!(
            SamplerDescription::DEFAULT.mipmap_mode,
            vk::SamplerMipmapMode::LINEAR
        );
    }
}
