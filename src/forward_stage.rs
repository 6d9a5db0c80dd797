//! Forward pass over the lit swapchain image: the environment background and,
//! on request, a debug view of the scene's light volume (probe spheres shaded
//! by their SH coefficients plus the tetrahedral mesh edges).
//!
//! Depth comes from the G-buffer and is only tested, never written.

use ash::vk;
use log::info;

use crate::buffer_helpers;
use crate::config::RenderConfig;
use crate::descriptors::{self, DescriptorDescription, DescriptorSet};
use crate::gbuffer_stage::DEPTH_FORMAT;
use crate::geometry::{self, CUBE_INDICES};
use crate::image_helpers::SyncScope;
use crate::pipelines::{self, GraphicsPipeline, GraphicsPipelineDescription, VertexDescription};
use crate::render_helpers::{self, AttachmentDescription, CameraData};
use crate::scene::Scene;
use crate::scene_binding::{SceneResources, SceneSlot};
use crate::shader_manager::{ShaderModule, SpecializationConstants};
use crate::swapchain::Swapchain;
use crate::vulkan_context::VulkanContext;

const ENVIRONMENT_SHADERS: [&str; 2] = ["Hybrid/Environment.vert", "Hybrid/Environment.frag"];
const POSITIONS_SHADERS: [&str; 2] = [
    "Hybrid/LightVolumePositions.vert",
    "Hybrid/LightVolumePositions.frag",
];
const EDGES_SHADERS: [&str; 2] = ["Hybrid/LightVolumeEdges.vert", "Hybrid/LightVolumeEdges.frag"];

const PROBE_SPHERE_RADIUS: f32 = 0.1;
const PROBE_SPHERE_STACKS: u32 = 8;
const PROBE_SPHERE_SLICES: u32 = 16;

const PROBE_POSITION_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

fn create_render_pass(device: &ash::Device, swapchain: &Swapchain) -> Result<vk::RenderPass, String> {
    let color_attachment = AttachmentDescription::loaded(
        swapchain.format(),
        vk::ImageLayout::GENERAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        swapchain.present_layout(),
    );
    let depth_attachment = AttachmentDescription::loaded(
        DEPTH_FORMAT,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );

    let color_access = SyncScope::new(
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    );
    let dependencies = [
        // Lit image from the lighting dispatch, depth from the G-buffer pass.
        render_helpers::external_dependency(
            SyncScope::COMPUTE_SHADER_WRITE.union(SyncScope::DEPTH_ATTACHMENT_WRITE),
            color_access.union(SyncScope::DEPTH_ATTACHMENT_READ),
            true,
        ),
        render_helpers::external_dependency(
            SyncScope::COLOR_ATTACHMENT_WRITE,
            SyncScope::TRANSFER_READ.union(SyncScope::BLOCK_NONE),
            false,
        ),
    ];

    render_helpers::create_render_pass(device, &[color_attachment], Some(depth_attachment), &dependencies)
}

fn framebuffer_attachments(swapchain: &Swapchain, depth_view: vk::ImageView) -> Vec<Vec<vk::ImageView>> {
    swapchain
        .image_views()
        .iter()
        .map(|&view| vec![view, depth_view])
        .collect()
}

fn environment_description() -> Vec<DescriptorDescription> {
    vec![DescriptorDescription::new(
        1,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::ShaderStageFlags::FRAGMENT,
    )]
}

fn positions_description() -> Vec<DescriptorDescription> {
    vec![DescriptorDescription::new(
        1,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
    )]
}

// ===========================================================================
// Pipelines
// ===========================================================================

/// Pipeline inputs owned by the stage itself.
#[derive(Clone, Copy)]
struct PipelineState {
    render_pass: vk::RenderPass,
    default_camera_layout: vk::DescriptorSetLayout,
    environment_camera_layout: vk::DescriptorSetLayout,
    depth_compare_op: vk::CompareOp,
    reverse_depth: bool,
}

fn create_shaders(
    ctx: &VulkanContext,
    paths: [&str; 2],
    vertex_specialization: SpecializationConstants,
) -> Result<Vec<ShaderModule>, String> {
    let vertex_shader = ctx.shader_manager.create_shader_module(
        vk::ShaderStageFlags::VERTEX,
        paths[0],
        &[],
        vertex_specialization,
    )?;
    match ctx.shader_manager.create_shader_module(
        vk::ShaderStageFlags::FRAGMENT,
        paths[1],
        &[],
        SpecializationConstants::new(),
    ) {
        Ok(fragment_shader) => Ok(vec![vertex_shader, fragment_shader]),
        Err(e) => {
            ctx.shader_manager.destroy_shader_module(vertex_shader);
            Err(e)
        }
    }
}

/// Cube drawn around the camera at the far plane. The vertex shader decodes
/// corners from the index values, so there is no vertex input.
fn create_environment_pipeline(
    ctx: &VulkanContext,
    state: PipelineState,
    environment_layout: vk::DescriptorSetLayout,
) -> Result<GraphicsPipeline, String> {
    let description = GraphicsPipelineDescription {
        cull_mode: vk::CullModeFlags::NONE,
        depth_test: Some(state.depth_compare_op),
        depth_write: false,
        set_layouts: vec![state.environment_camera_layout, environment_layout],
        ..Default::default()
    };
    let shaders = create_shaders(
        ctx,
        ENVIRONMENT_SHADERS,
        SpecializationConstants::new().with_u32(state.reverse_depth as u32),
    )?;
    GraphicsPipeline::new(&ctx.device, &ctx.shader_manager, state.render_pass, &description, shaders)
}

/// Probe spheres instanced at the light-volume positions.
fn create_positions_pipeline(
    ctx: &VulkanContext,
    state: PipelineState,
    positions_layout: vk::DescriptorSetLayout,
) -> Result<GraphicsPipeline, String> {
    let sphere = VertexDescription::interleaved(
        0,
        vk::VertexInputRate::VERTEX,
        0,
        &[
            vk::Format::R32G32B32_SFLOAT,
            vk::Format::R32G32B32_SFLOAT,
            vk::Format::R32G32_SFLOAT,
        ],
    )?;
    let instance =
        VertexDescription::interleaved(1, vk::VertexInputRate::INSTANCE, 3, &[PROBE_POSITION_FORMAT])?;

    let description = GraphicsPipelineDescription {
        cull_mode: vk::CullModeFlags::NONE,
        vertex_descriptions: vec![sphere, instance],
        depth_test: Some(state.depth_compare_op),
        depth_write: false,
        set_layouts: vec![state.default_camera_layout, positions_layout],
        ..Default::default()
    };
    let shaders = create_shaders(ctx, POSITIONS_SHADERS, SpecializationConstants::new())?;
    GraphicsPipeline::new(&ctx.device, &ctx.shader_manager, state.render_pass, &description, shaders)
}

/// Tetrahedral mesh edges as a line list over the probe positions.
fn create_edges_pipeline(ctx: &VulkanContext, state: PipelineState) -> Result<GraphicsPipeline, String> {
    let positions =
        VertexDescription::interleaved(0, vk::VertexInputRate::VERTEX, 0, &[PROBE_POSITION_FORMAT])?;

    let description = GraphicsPipelineDescription {
        topology: vk::PrimitiveTopology::LINE_LIST,
        cull_mode: vk::CullModeFlags::NONE,
        vertex_descriptions: vec![positions],
        depth_test: Some(state.depth_compare_op),
        depth_write: false,
        set_layouts: vec![state.default_camera_layout],
        ..Default::default()
    };
    let shaders = create_shaders(ctx, EDGES_SHADERS, SpecializationConstants::new())?;
    GraphicsPipeline::new(&ctx.device, &ctx.shader_manager, state.render_pass, &description, shaders)
}

// ===========================================================================
// Scene-scoped resources
// ===========================================================================

#[derive(Default)]
struct LightVolumeDrawData {
    positions_set: DescriptorSet,
    positions_pipeline: GraphicsPipeline,
    edges_pipeline: GraphicsPipeline,
    /// Scene-owned probe positions, used as instance and edge vertex data.
    positions_buffer: vk::Buffer,
    position_count: u32,
    edges_index_buffer: vk::Buffer,
    edges_index_count: u32,
}

impl LightVolumeDrawData {
    fn create(ctx: &mut VulkanContext, state: PipelineState, scene: &Scene) -> Result<Option<Self>, String> {
        let Some(light_volume) = scene.light_volume.as_ref() else {
            return Ok(None);
        };

        let mut data = LightVolumeDrawData {
            positions_buffer: light_volume.positions_buffer,
            position_count: light_volume.position_count(),
            ..Default::default()
        };
        match data.create_resources(ctx, state, &light_volume.tetrahedra, light_volume.coefficients_buffer) {
            Ok(()) => Ok(Some(data)),
            Err(e) => {
                data.destroy(ctx);
                Err(e)
            }
        }
    }

    fn create_resources(
        &mut self,
        ctx: &mut VulkanContext,
        state: PipelineState,
        tetrahedra: &[[u32; 4]],
        coefficients_buffer: vk::Buffer,
    ) -> Result<(), String> {
        let edges = geometry::tetrahedral_edges(tetrahedra);
        self.edges_index_count = edges.len() as u32;
        self.edges_index_buffer = buffer_helpers::create_device_local_buffer_with_data(
            ctx,
            bytemuck::cast_slice(&edges),
            vk::BufferUsageFlags::INDEX_BUFFER,
            "light volume edges",
        )?;

        self.positions_set = ctx.descriptor_pool.create_descriptor_set(
            &positions_description(),
            &[descriptors::storage_buffer_data(coefficients_buffer)],
        )?;

        self.create_pipelines(ctx, state)
    }

    fn create_pipelines(&mut self, ctx: &VulkanContext, state: PipelineState) -> Result<(), String> {
        let positions_pipeline = create_positions_pipeline(ctx, state, self.positions_set.layout)?;
        let edges_pipeline = match create_edges_pipeline(ctx, state) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                positions_pipeline.destroy(&ctx.device);
                return Err(e);
            }
        };

        self.positions_pipeline.destroy(&ctx.device);
        self.edges_pipeline.destroy(&ctx.device);
        self.positions_pipeline = positions_pipeline;
        self.edges_pipeline = edges_pipeline;
        Ok(())
    }

    fn destroy(self, ctx: &mut VulkanContext) {
        self.positions_pipeline.destroy(&ctx.device);
        self.edges_pipeline.destroy(&ctx.device);
        if self.positions_set.layout != vk::DescriptorSetLayout::null() {
            ctx.descriptor_pool.destroy_descriptor_set(&self.positions_set);
        }
        if self.edges_index_buffer != vk::Buffer::null() {
            ctx.memory_manager.destroy_buffer(self.edges_index_buffer);
        }
    }

    unsafe fn draw(&self, device: &ash::Device, cmd: vk::CommandBuffer, default_camera_set: vk::DescriptorSet, probe_sphere: &ProbeSphere) {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.positions_pipeline.pipeline);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.positions_pipeline.layout,
            0,
            &[default_camera_set, self.positions_set.value],
            &[],
        );
        device.cmd_bind_vertex_buffers(
            cmd,
            0,
            &[probe_sphere.vertex_buffer, self.positions_buffer],
            &[0, 0],
        );
        device.cmd_bind_index_buffer(cmd, probe_sphere.index_buffer, 0, vk::IndexType::UINT32);
        device.cmd_draw_indexed(cmd, probe_sphere.index_count, self.position_count, 0, 0, 0);

        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.edges_pipeline.pipeline);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.edges_pipeline.layout,
            0,
            &[default_camera_set],
            &[],
        );
        device.cmd_bind_vertex_buffers(cmd, 0, &[self.positions_buffer], &[0]);
        device.cmd_bind_index_buffer(cmd, self.edges_index_buffer, 0, vk::IndexType::UINT32);
        device.cmd_draw_indexed(cmd, self.edges_index_count, 1, 0, 0, 0);
    }
}

struct ForwardSceneData {
    environment_set: DescriptorSet,
    environment_pipeline: GraphicsPipeline,
    light_volume: Option<LightVolumeDrawData>,
}

impl SceneResources<VulkanContext> for ForwardSceneData {
    fn destroy(self, ctx: &mut VulkanContext) {
        if let Some(light_volume) = self.light_volume {
            light_volume.destroy(ctx);
        }
        self.environment_pipeline.destroy(&ctx.device);
        ctx.descriptor_pool.destroy_descriptor_set(&self.environment_set);
    }
}

// ===========================================================================
// Stage
// ===========================================================================

#[derive(Default)]
struct ProbeSphere {
    vertex_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
    index_count: u32,
}

pub struct ForwardStage {
    state: PipelineState,
    extent: vk::Extent2D,
    framebuffers: Vec<vk::Framebuffer>,
    default_camera: CameraData,
    environment_camera: CameraData,
    cube_index_buffer: vk::Buffer,
    probe_sphere: ProbeSphere,
    draw_light_volume: bool,
    scene: SceneSlot<ForwardSceneData>,
}

impl ForwardStage {
    /// `depth_view` is the G-buffer depth target the pass tests against.
    pub fn new(
        ctx: &mut VulkanContext,
        config: &RenderConfig,
        swapchain: &Swapchain,
        depth_view: vk::ImageView,
    ) -> Result<Self, String> {
        let mut stage = Self {
            state: PipelineState {
                render_pass: vk::RenderPass::null(),
                default_camera_layout: vk::DescriptorSetLayout::null(),
                environment_camera_layout: vk::DescriptorSetLayout::null(),
                depth_compare_op: config.depth_compare_op(),
                reverse_depth: config.reverse_depth,
            },
            extent: swapchain.extent(),
            framebuffers: Vec::new(),
            default_camera: CameraData::default(),
            environment_camera: CameraData::default(),
            cube_index_buffer: vk::Buffer::null(),
            probe_sphere: ProbeSphere::default(),
            draw_light_volume: false,
            scene: SceneSlot::new(),
        };

        match stage.create_resources(ctx, swapchain, depth_view) {
            Ok(()) => {
                info!("Forward stage ready");
                Ok(stage)
            }
            Err(e) => {
                stage.destroy(ctx);
                Err(e)
            }
        }
    }

    fn create_resources(
        &mut self,
        ctx: &mut VulkanContext,
        swapchain: &Swapchain,
        depth_view: vk::ImageView,
    ) -> Result<(), String> {
        self.state.render_pass = create_render_pass(&ctx.device, swapchain)?;
        self.framebuffers = render_helpers::create_framebuffers(
            &ctx.device,
            self.state.render_pass,
            &framebuffer_attachments(swapchain, depth_view),
            swapchain.extent(),
        )?;

        let image_count = swapchain.image_count();
        self.default_camera =
            render_helpers::create_camera_data(ctx, image_count, vk::ShaderStageFlags::VERTEX, "forward")?;
        self.state.default_camera_layout = self.default_camera.descriptor_set.layout;
        self.environment_camera = render_helpers::create_camera_data(
            ctx,
            image_count,
            vk::ShaderStageFlags::VERTEX,
            "environment",
        )?;
        self.state.environment_camera_layout = self.environment_camera.descriptor_set.layout;

        self.cube_index_buffer = buffer_helpers::create_device_local_buffer_with_data(
            ctx,
            bytemuck::cast_slice(&CUBE_INDICES),
            vk::BufferUsageFlags::INDEX_BUFFER,
            "environment cube indices",
        )?;

        let (vertices, indices) =
            geometry::generate_sphere(PROBE_SPHERE_RADIUS, PROBE_SPHERE_STACKS, PROBE_SPHERE_SLICES);
        self.probe_sphere.vertex_buffer = buffer_helpers::create_device_local_buffer_with_data(
            ctx,
            bytemuck::cast_slice(&vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "probe sphere vertices",
        )?;
        self.probe_sphere.index_buffer = buffer_helpers::create_device_local_buffer_with_data(
            ctx,
            bytemuck::cast_slice(&indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
            "probe sphere indices",
        )?;
        self.probe_sphere.index_count = indices.len() as u32;
        Ok(())
    }

    pub fn is_scene_bound(&self) -> bool {
        self.scene.is_bound()
    }

    /// Switch the light-volume debug draw. Has no effect on scenes without a
    /// light volume.
    pub fn toggle_light_volume(&mut self) -> bool {
        self.draw_light_volume = !self.draw_light_volume;
        info!(
            "Light volume debug draw {}",
            if self.draw_light_volume { "on" } else { "off" }
        );
        self.draw_light_volume
    }

    /// Bind `scene`, releasing any previously bound one first.
    pub fn register_scene(&mut self, ctx: &mut VulkanContext, scene: &Scene) -> Result<(), String> {
        let state = self.state;
        self.scene.register(ctx, scene.id(), |ctx| {
            let environment_set = ctx.descriptor_pool.create_descriptor_set(
                &environment_description(),
                &[descriptors::sampled_image_data(
                    ctx.default_sampler,
                    scene.environment.reflection.view,
                )],
            )?;

            let environment_pipeline =
                match create_environment_pipeline(ctx, state, environment_set.layout) {
                    Ok(pipeline) => pipeline,
                    Err(e) => {
                        ctx.descriptor_pool.destroy_descriptor_set(&environment_set);
                        return Err(e);
                    }
                };

            match LightVolumeDrawData::create(ctx, state, scene) {
                Ok(light_volume) => Ok(ForwardSceneData {
                    environment_set,
                    environment_pipeline,
                    light_volume,
                }),
                Err(e) => {
                    environment_pipeline.destroy(&ctx.device);
                    ctx.descriptor_pool.destroy_descriptor_set(&environment_set);
                    Err(e)
                }
            }
        })
    }

    pub fn remove_scene(&mut self, ctx: &mut VulkanContext) {
        self.scene.release(ctx);
    }

    /// Record the pass for swapchain image `image_index`, which must be in
    /// GENERAL. The image ends in the swapchain's present layout. Must be
    /// recorded outside of a render pass.
    pub fn execute(&self, device: &ash::Device, cmd: vk::CommandBuffer, scene: &Scene, image_index: usize) {
        let scene_data = self.scene.get().expect("Forward stage executed without a scene");
        assert_eq!(
            self.scene.scene_id(),
            Some(scene.id()),
            "Forward stage executed with a scene it is not bound to"
        );

        let projection = scene.camera.projection(self.state.reverse_depth);
        render_helpers::update_camera_data(
            device,
            cmd,
            &self.default_camera,
            image_index,
            &(projection * scene.camera.view()),
        );
        render_helpers::update_camera_data(
            device,
            cmd,
            &self.environment_camera,
            image_index,
            &(projection * scene.camera.rotation_view()),
        );

        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(self.state.render_pass)
            .framebuffer(self.framebuffers[image_index])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.extent,
            });

        let environment = scene_data.environment_pipeline;

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_begin, vk::SubpassContents::INLINE);
            pipelines::set_viewport_and_scissor(device, cmd, self.extent);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, environment.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                environment.layout,
                0,
                &[
                    self.environment_camera.descriptor_set.values[image_index],
                    scene_data.environment_set.value,
                ],
                &[],
            );
            device.cmd_bind_index_buffer(cmd, self.cube_index_buffer, 0, vk::IndexType::UINT16);
            device.cmd_draw_indexed(cmd, CUBE_INDICES.len() as u32, 1, 0, 0, 0);

            if let (true, Some(light_volume)) = (self.draw_light_volume, &scene_data.light_volume) {
                light_volume.draw(
                    device,
                    cmd,
                    self.default_camera.descriptor_set.values[image_index],
                    &self.probe_sphere,
                );
            }

            device.cmd_end_render_pass(cmd);
        }
    }

    /// Recreate the framebuffers around the new swapchain views and depth
    /// target. The device must be idle.
    pub fn resize(
        &mut self,
        ctx: &mut VulkanContext,
        swapchain: &Swapchain,
        depth_view: vk::ImageView,
    ) -> Result<(), String> {
        assert_eq!(
            swapchain.image_count(),
            self.default_camera.buffers.len(),
            "Swapchain image count changed across resize"
        );
        render_helpers::destroy_framebuffers(&ctx.device, &self.framebuffers);
        self.framebuffers = render_helpers::create_framebuffers(
            &ctx.device,
            self.state.render_pass,
            &framebuffer_attachments(swapchain, depth_view),
            swapchain.extent(),
        )?;
        self.extent = swapchain.extent();
        Ok(())
    }

    /// Rebuild the environment and light-volume pipelines.
    pub fn reload_shaders(&mut self, ctx: &mut VulkanContext) -> Result<(), String> {
        let state = self.state;
        let Some(scene_data) = self.scene.get_mut() else {
            return Ok(());
        };

        let environment_pipeline =
            create_environment_pipeline(ctx, state, scene_data.environment_set.layout)?;
        scene_data.environment_pipeline.destroy(&ctx.device);
        scene_data.environment_pipeline = environment_pipeline;

        if let Some(light_volume) = scene_data.light_volume.as_mut() {
            light_volume.create_pipelines(ctx, state)?;
        }
        Ok(())
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        self.scene.release(ctx);

        let probe_sphere = std::mem::take(&mut self.probe_sphere);
        for buffer in [
            probe_sphere.vertex_buffer,
            probe_sphere.index_buffer,
            std::mem::replace(&mut self.cube_index_buffer, vk::Buffer::null()),
        ] {
            if buffer != vk::Buffer::null() {
                ctx.memory_manager.destroy_buffer(buffer);
            }
        }

        render_helpers::destroy_camera_data(ctx, &std::mem::take(&mut self.environment_camera));
        render_helpers::destroy_camera_data(ctx, &std::mem::take(&mut self.default_camera));

        render_helpers::destroy_framebuffers(&ctx.device, &self.framebuffers);
        self.framebuffers.clear();
        if self.state.render_pass != vk::RenderPass::null() {
            unsafe { ctx.device.destroy_render_pass(self.state.render_pass, None) };
            self.state.render_pass = vk::RenderPass::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn framebuffers_pair_each_image_with_shared_depth() {
        let views: Vec<vk::ImageView> = (1..=3).map(vk::ImageView::from_raw).collect();
        let depth = vk::ImageView::from_raw(9);
        let attachments: Vec<Vec<vk::ImageView>> =
            views.iter().map(|&view| vec![view, depth]).collect();
        assert_eq!(attachments.len(), 3);
        assert!(attachments.iter().all(|a| a[1] == depth));
    }

    #[test]
    fn probe_positions_are_vec4_instances() {
        let instance =
            VertexDescription::interleaved(1, vk::VertexInputRate::INSTANCE, 3, &[PROBE_POSITION_FORMAT])
                .unwrap();
        assert_eq!(instance.binding.stride as usize, std::mem::size_of::<[f32; 4]>());
        assert_eq!(instance.attributes[0].location, 3);
    }

    #[test]
    fn positions_set_exposes_coefficients_to_both_stages() {
        let description = positions_description();
        assert_eq!(description.len(), 1);
        assert!(description[0]
            .stage_flags
            .contains(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn cube_indices_cover_twelve_triangles() {
        assert_eq!(CUBE_INDICES.len(), 36);
        assert!(CUBE_INDICES.iter().all(|&i| i < 8));
    }
}
