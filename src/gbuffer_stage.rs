//! G-buffer pass: rasterizes scene meshes into the normal, emission,
//! albedo/occlusion, roughness/metallic and depth targets the lighting stage
//! reads.
//!
//! Colour targets end the pass in GENERAL (read as storage images), depth in
//! SHADER_READ_ONLY_OPTIMAL (sampled with the texel sampler).

use ash::vk;
use bytemuck::{Pod, Zeroable};
use log::info;

use crate::config::RenderConfig;
use crate::descriptors::{self, DescriptorDescription, DescriptorSet};
use crate::geometry::PbrVertex;
use crate::image_helpers::{self, SyncScope, Texture};
use crate::pipelines::{
    self, GraphicsPipeline, GraphicsPipelineDescription, VertexDescription,
};
use crate::render_helpers::{self, AttachmentDescription, CameraData};
use crate::scene::Scene;
use crate::scene_binding::{SceneResources, SceneSlot};
use crate::shader_manager::SpecializationConstants;
use crate::vulkan_context::VulkanContext;

pub const NORMALS_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const EMISSION_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const ALBEDO_OCCLUSION_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
pub const ROUGHNESS_METALLIC_FORMAT: vk::Format = vk::Format::R8G8_UNORM;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

const COLOR_FORMATS: [vk::Format; 4] = [
    NORMALS_FORMAT,
    EMISSION_FORMAT,
    ALBEDO_OCCLUSION_FORMAT,
    ROUGHNESS_METALLIC_FORMAT,
];

const VERTEX_SHADER: &str = "Hybrid/GBuffer.vert";
const FRAGMENT_SHADER: &str = "Hybrid/GBuffer.frag";

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct MeshPushConstants {
    transform: [f32; 16],
    material: u32,
}

// ===========================================================================
// Targets
// ===========================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct GBuffer {
    pub normals: Texture,
    pub emission: Texture,
    pub albedo_occlusion: Texture,
    pub roughness_metallic: Texture,
    pub depth: Texture,
}

impl GBuffer {
    fn create(ctx: &mut VulkanContext, extent: vk::Extent2D) -> Result<Self, String> {
        let mut gbuffer = GBuffer::default();
        match gbuffer.create_targets(ctx, extent) {
            Ok(()) => Ok(gbuffer),
            Err(e) => {
                gbuffer.destroy(ctx);
                Err(e)
            }
        }
    }

    fn create_targets(&mut self, ctx: &mut VulkanContext, extent: vk::Extent2D) -> Result<(), String> {
        let color_usage = vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::COLOR_ATTACHMENT;
        let depth_usage =
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;

        self.normals =
            image_helpers::create_render_target(ctx, NORMALS_FORMAT, extent, color_usage, "gbuffer normals")?;
        self.emission =
            image_helpers::create_render_target(ctx, EMISSION_FORMAT, extent, color_usage, "gbuffer emission")?;
        self.albedo_occlusion = image_helpers::create_render_target(
            ctx,
            ALBEDO_OCCLUSION_FORMAT,
            extent,
            color_usage,
            "gbuffer albedo/occlusion",
        )?;
        self.roughness_metallic = image_helpers::create_render_target(
            ctx,
            ROUGHNESS_METALLIC_FORMAT,
            extent,
            color_usage,
            "gbuffer roughness/metallic",
        )?;
        self.depth =
            image_helpers::create_render_target(ctx, DEPTH_FORMAT, extent, depth_usage, "gbuffer depth")?;
        Ok(())
    }

    /// Colour targets in attachment order.
    pub fn color_targets(&self) -> [Texture; 4] {
        [
            self.normals,
            self.emission,
            self.albedo_occlusion,
            self.roughness_metallic,
        ]
    }

    fn attachment_views(&self) -> Vec<vk::ImageView> {
        self.color_targets()
            .iter()
            .chain(std::iter::once(&self.depth))
            .map(|texture| texture.view)
            .collect()
    }

    fn destroy(&mut self, ctx: &mut VulkanContext) {
        for texture in self
            .color_targets()
            .iter()
            .chain(std::iter::once(&self.depth))
        {
            if texture.image != vk::Image::null() {
                image_helpers::destroy_texture(ctx, texture);
            }
        }
        *self = GBuffer::default();
    }
}

fn create_render_pass(device: &ash::Device) -> Result<vk::RenderPass, String> {
    let color_attachments: Vec<AttachmentDescription> = COLOR_FORMATS
        .iter()
        .map(|&format| {
            AttachmentDescription::cleared(
                format,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::GENERAL,
            )
        })
        .collect();
    let depth_attachment = AttachmentDescription::cleared(
        DEPTH_FORMAT,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );

    let attachment_writes = SyncScope::COLOR_ATTACHMENT_WRITE.union(SyncScope::DEPTH_ATTACHMENT_WRITE);
    // Previous frame's lighting and forward reads finish before the targets are cleared.
    let previous_reads = SyncScope::COMPUTE_SHADER_READ.union(SyncScope::DEPTH_ATTACHMENT_READ);
    let dependencies = [
        render_helpers::external_dependency(previous_reads, attachment_writes, true),
        render_helpers::external_dependency(attachment_writes, SyncScope::COMPUTE_SHADER_READ, false),
    ];

    render_helpers::create_render_pass(device, &color_attachments, Some(depth_attachment), &dependencies)
}

// ===========================================================================
// Scene-scoped resources
// ===========================================================================

struct GBufferSceneData {
    material_set: DescriptorSet,
    pipeline: GraphicsPipeline,
    material_count: u32,
    texture_count: u32,
}

impl SceneResources<VulkanContext> for GBufferSceneData {
    fn destroy(self, ctx: &mut VulkanContext) {
        self.pipeline.destroy(&ctx.device);
        ctx.descriptor_pool.destroy_descriptor_set(&self.material_set);
    }
}

fn material_description(texture_count: u32) -> Vec<DescriptorDescription> {
    vec![
        DescriptorDescription::new(
            1,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::FRAGMENT,
        ),
        DescriptorDescription::new(
            texture_count,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ShaderStageFlags::FRAGMENT,
        ),
    ]
}

/// Pipeline inputs that survive across scene registrations and resizes.
#[derive(Clone, Copy)]
struct PipelineState {
    render_pass: vk::RenderPass,
    camera_layout: vk::DescriptorSetLayout,
    depth_compare_op: vk::CompareOp,
}

fn create_pipeline(
    ctx: &VulkanContext,
    state: PipelineState,
    material_layout: vk::DescriptorSetLayout,
    material_count: u32,
    texture_count: u32,
) -> Result<GraphicsPipeline, String> {
    let vertex_description = VertexDescription::interleaved(
        0,
        vk::VertexInputRate::VERTEX,
        0,
        &[
            vk::Format::R32G32B32_SFLOAT,
            vk::Format::R32G32B32_SFLOAT,
            vk::Format::R32G32_SFLOAT,
        ],
    )?;
    debug_assert_eq!(
        vertex_description.binding.stride as usize,
        std::mem::size_of::<PbrVertex>()
    );

    let description = GraphicsPipelineDescription {
        cull_mode: vk::CullModeFlags::NONE,
        vertex_descriptions: vec![vertex_description],
        color_attachment_count: COLOR_FORMATS.len() as u32,
        depth_test: Some(state.depth_compare_op),
        depth_write: true,
        set_layouts: vec![state.camera_layout, material_layout],
        push_constant_ranges: vec![pipelines::push_constant_range(
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            0,
            std::mem::size_of::<MeshPushConstants>() as u32,
        )],
        ..Default::default()
    };

    let vertex_shader = ctx.shader_manager.create_shader_module(
        vk::ShaderStageFlags::VERTEX,
        VERTEX_SHADER,
        &[],
        SpecializationConstants::new(),
    )?;
    let fragment_shader = match ctx.shader_manager.create_shader_module(
        vk::ShaderStageFlags::FRAGMENT,
        FRAGMENT_SHADER,
        &[],
        SpecializationConstants::new()
            .with_u32(material_count)
            .with_u32(texture_count),
    ) {
        Ok(shader) => shader,
        Err(e) => {
            ctx.shader_manager.destroy_shader_module(vertex_shader);
            return Err(e);
        }
    };

    GraphicsPipeline::new(
        &ctx.device,
        &ctx.shader_manager,
        state.render_pass,
        &description,
        vec![vertex_shader, fragment_shader],
    )
}

// ===========================================================================
// Stage
// ===========================================================================

pub struct GBufferStage {
    reverse_depth: bool,
    depth_clear_value: f32,
    state: PipelineState,
    gbuffer: GBuffer,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    camera_data: CameraData,
    scene: SceneSlot<GBufferSceneData>,
}

impl GBufferStage {
    pub fn new(
        ctx: &mut VulkanContext,
        config: &RenderConfig,
        extent: vk::Extent2D,
        image_count: usize,
    ) -> Result<Self, String> {
        let render_pass = create_render_pass(&ctx.device)?;

        let mut gbuffer = match GBuffer::create(ctx, extent) {
            Ok(gbuffer) => gbuffer,
            Err(e) => {
                unsafe { ctx.device.destroy_render_pass(render_pass, None) };
                return Err(e);
            }
        };

        let framebuffer = match render_helpers::create_framebuffers(
            &ctx.device,
            render_pass,
            &[gbuffer.attachment_views()],
            extent,
        ) {
            Ok(framebuffers) => framebuffers[0],
            Err(e) => {
                gbuffer.destroy(ctx);
                unsafe { ctx.device.destroy_render_pass(render_pass, None) };
                return Err(e);
            }
        };

        let camera_data = match render_helpers::create_camera_data(
            ctx,
            image_count,
            vk::ShaderStageFlags::VERTEX,
            "gbuffer",
        ) {
            Ok(camera_data) => camera_data,
            Err(e) => {
                render_helpers::destroy_framebuffers(&ctx.device, &[framebuffer]);
                gbuffer.destroy(ctx);
                unsafe { ctx.device.destroy_render_pass(render_pass, None) };
                return Err(e);
            }
        };

        info!("GBuffer stage ready ({}x{})", extent.width, extent.height);

        Ok(Self {
            reverse_depth: config.reverse_depth,
            depth_clear_value: config.depth_clear_value(),
            state: PipelineState {
                render_pass,
                camera_layout: camera_data.descriptor_set.layout,
                depth_compare_op: config.depth_compare_op(),
            },
            gbuffer,
            framebuffer,
            extent,
            camera_data,
            scene: SceneSlot::new(),
        })
    }

    pub fn gbuffer(&self) -> &GBuffer {
        &self.gbuffer
    }

    pub fn is_scene_bound(&self) -> bool {
        self.scene.is_bound()
    }

    /// Bind `scene`, releasing any previously bound one first.
    pub fn register_scene(&mut self, ctx: &mut VulkanContext, scene: &Scene) -> Result<(), String> {
        let state = self.state;
        self.scene.register(ctx, scene.id(), |ctx| {
            let material_count = scene.material_count();
            let texture_count = scene.textures.len() as u32;

            let material_set = ctx.descriptor_pool.create_descriptor_set(
                &material_description(texture_count),
                &[
                    descriptors::uniform_buffer_data(scene.material_buffer),
                    descriptors::sampled_textures_data(&scene.sampled_textures(ctx.default_sampler)),
                ],
            )?;

            match create_pipeline(ctx, state, material_set.layout, material_count, texture_count) {
                Ok(pipeline) => Ok(GBufferSceneData {
                    material_set,
                    pipeline,
                    material_count,
                    texture_count,
                }),
                Err(e) => {
                    ctx.descriptor_pool.destroy_descriptor_set(&material_set);
                    Err(e)
                }
            }
        })
    }

    pub fn remove_scene(&mut self, ctx: &mut VulkanContext) {
        self.scene.release(ctx);
    }

    /// Record the pass for swapchain image `image_index`. Must be recorded
    /// outside of a render pass.
    pub fn execute(&self, device: &ash::Device, cmd: vk::CommandBuffer, scene: &Scene, image_index: usize) {
        let scene_data = self.scene.get().expect("GBuffer stage executed without a scene");
        assert_eq!(
            self.scene.scene_id(),
            Some(scene.id()),
            "GBuffer stage executed with a scene it is not bound to"
        );

        render_helpers::update_camera_data(
            device,
            cmd,
            &self.camera_data,
            image_index,
            &scene.camera.view_projection(self.reverse_depth),
        );

        let mut clear_values = vec![
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 0.0],
                },
            };
            COLOR_FORMATS.len()
        ];
        clear_values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: self.depth_clear_value,
                stencil: 0,
            },
        });

        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(self.state.render_pass)
            .framebuffer(self.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.extent,
            })
            .clear_values(&clear_values);

        let pipeline = scene_data.pipeline;
        let descriptor_sets = [
            self.camera_data.descriptor_set.values[image_index],
            scene_data.material_set.value,
        ];

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_begin, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            pipelines::set_viewport_and_scissor(device, cmd, self.extent);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                0,
                &descriptor_sets,
                &[],
            );

            for mesh in &scene.meshes {
                let push_constants = MeshPushConstants {
                    transform: mesh.transform.to_cols_array(),
                    material: mesh.material,
                };
                device.cmd_push_constants(
                    cmd,
                    pipeline.layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&push_constants),
                );
                device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buffer], &[0]);
                device.cmd_bind_index_buffer(cmd, mesh.index_buffer, 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
            }

            device.cmd_end_render_pass(cmd);
        }
    }

    /// Recreate the targets and framebuffer. The pipeline is kept because
    /// viewport and scissor are dynamic. The device must be idle.
    pub fn resize(&mut self, ctx: &mut VulkanContext, extent: vk::Extent2D) -> Result<(), String> {
        render_helpers::destroy_framebuffers(&ctx.device, &[self.framebuffer]);
        self.framebuffer = vk::Framebuffer::null();
        self.gbuffer.destroy(ctx);

        self.gbuffer = GBuffer::create(ctx, extent)?;
        self.framebuffer = render_helpers::create_framebuffers(
            &ctx.device,
            self.state.render_pass,
            &[self.gbuffer.attachment_views()],
            extent,
        )?[0];
        self.extent = extent;
        Ok(())
    }

    /// Rebuild the pipeline from the cached layouts and counts.
    pub fn reload_shaders(&mut self, ctx: &mut VulkanContext) -> Result<(), String> {
        let state = self.state;
        let Some(scene_data) = self.scene.get_mut() else {
            return Ok(());
        };
        let pipeline = create_pipeline(
            ctx,
            state,
            scene_data.material_set.layout,
            scene_data.material_count,
            scene_data.texture_count,
        )?;
        scene_data.pipeline.destroy(&ctx.device);
        scene_data.pipeline = pipeline;
        Ok(())
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        self.scene.release(ctx);
        render_helpers::destroy_camera_data(ctx, &self.camera_data);
        if self.framebuffer != vk::Framebuffer::null() {
            render_helpers::destroy_framebuffers(&ctx.device, &[self.framebuffer]);
        }
        self.gbuffer.destroy(ctx);
        unsafe { ctx.device.destroy_render_pass(self.state.render_pass, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_push_constants_fit_the_budget() {
        assert_eq!(std::mem::size_of::<MeshPushConstants>(), 68);
        assert!(std::mem::size_of::<MeshPushConstants>() as u32 <= pipelines::MAX_PUSH_CONSTANTS_SIZE);
    }

    #[test]
    fn material_set_binds_uniforms_then_textures() {
        let description = material_description(3);
        assert_eq!(description[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(description[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(description[1].count, 3);
    }

    #[test]
    fn attachment_views_put_depth_last() {
        use ash::vk::Handle;
        let texture = |raw| Texture {
            image: vk::Image::from_raw(raw),
            view: vk::ImageView::from_raw(raw),
        };
        let gbuffer = GBuffer {
            normals: texture(1),
            emission: texture(2),
            albedo_occlusion: texture(3),
            roughness_metallic: texture(4),
            depth: texture(5),
        };
        let raws: Vec<u64> = gbuffer.attachment_views().iter().map(|v| v.as_raw()).collect();
        assert_eq!(raws, vec![1, 2, 3, 4, 5]);
    }
}
