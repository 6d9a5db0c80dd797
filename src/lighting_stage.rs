//! Deferred lighting: a compute pass reading the G-buffer and writing the lit
//! result straight into the swapchain image.
//!
//! Descriptor sets are bound in a fixed order: swapchain image, G-buffer,
//! lighting inputs, camera, and ray tracing inputs when enabled. The shader
//! variant is selected by `LIGHT_COUNT`, `RAY_TRACING_ENABLED` and
//! `LIGHT_VOLUME_ENABLED`, and the lighting set gains its light-volume
//! bindings exactly when `LIGHT_VOLUME_ENABLED` is set.

use ash::vk;
use log::{debug, info};

use crate::config::RenderConfig;
use crate::descriptors::{self, DescriptorDescription, DescriptorSet, DescriptorSetData};
use crate::gbuffer_stage::GBuffer;
use crate::ibl::ImageBasedLighting;
use crate::image_helpers::{self, ImageLayoutTransition, SyncScope, FLAT_COLOR};
use crate::pipelines::{self, ComputePipeline};
use crate::render_helpers::{self, CameraData};
use crate::scene::Scene;
use crate::scene_binding::{SceneResources, SceneSlot};
use crate::shader_manager::{ShaderDefine, SpecializationConstants};
use crate::swapchain::Swapchain;
use crate::vulkan_context::VulkanContext;

const SHADER: &str = "Hybrid/Lighting.comp";
const WORK_GROUP_SIZE: [u32; 2] = [8, 8];

/// The image-available semaphore is waited on at the compute stage; the
/// swapchain transition chains onto that wait.
const SWAPCHAIN_WAIT: SyncScope =
    SyncScope::new(vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::empty());

fn swapchain_description() -> Vec<DescriptorDescription> {
    vec![DescriptorDescription::new(
        1,
        vk::DescriptorType::STORAGE_IMAGE,
        vk::ShaderStageFlags::COMPUTE,
    )]
}

fn gbuffer_description() -> Vec<DescriptorDescription> {
    let mut description = vec![DescriptorDescription::new(
        1,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::ShaderStageFlags::COMPUTE,
    )];
    description.extend((0..4).map(|_| {
        DescriptorDescription::new(1, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::COMPUTE)
    }));
    description
}

fn lighting_description(light_volume: bool) -> Vec<DescriptorDescription> {
    let sampled = || {
        DescriptorDescription::new(
            1,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ShaderStageFlags::COMPUTE,
        )
    };
    // Irradiance, reflection, specular BRDF
    let mut description = vec![sampled(), sampled(), sampled()];
    description.push(DescriptorDescription::new(
        1,
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::ShaderStageFlags::COMPUTE,
    ));
    if light_volume {
        description.extend((0..3).map(|_| {
            DescriptorDescription::new(1, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE)
        }));
    }
    description
}

fn ray_tracing_description(texture_count: u32, mesh_count: u32) -> Vec<DescriptorDescription> {
    let compute = vk::ShaderStageFlags::COMPUTE;
    vec![
        DescriptorDescription::new(1, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, compute),
        DescriptorDescription::new(1, vk::DescriptorType::UNIFORM_BUFFER, compute),
        DescriptorDescription::new(texture_count, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, compute),
        DescriptorDescription::new(mesh_count, vk::DescriptorType::STORAGE_BUFFER, compute),
        DescriptorDescription::new(mesh_count, vk::DescriptorType::STORAGE_BUFFER, compute),
    ]
}

fn gbuffer_set_data(ctx: &VulkanContext, gbuffer: &GBuffer) -> DescriptorSetData {
    let mut data = vec![descriptors::sampled_image_data(ctx.texel_sampler, gbuffer.depth.view)];
    data.extend(
        gbuffer
            .color_targets()
            .iter()
            .map(|target| descriptors::storage_image_data(target.view)),
    );
    data
}

/// Shader defines selecting the variant for a scene. Must agree with the
/// lighting set shape built by `lighting_description`.
pub fn shader_defines(light_count: u32, ray_tracing: bool, light_volume: bool) -> Vec<ShaderDefine> {
    vec![
        ("LIGHT_COUNT", light_count),
        ("RAY_TRACING_ENABLED", ray_tracing as u32),
        ("LIGHT_VOLUME_ENABLED", light_volume as u32),
    ]
}

// ===========================================================================
// Scene-scoped resources
// ===========================================================================

struct LightingSceneData {
    lighting_set: DescriptorSet,
    ray_tracing_set: Option<DescriptorSet>,
    pipeline: ComputePipeline,
    defines: Vec<ShaderDefine>,
    material_count: u32,
    texture_count: u32,
    mesh_count: u32,
}

impl SceneResources<VulkanContext> for LightingSceneData {
    fn destroy(self, ctx: &mut VulkanContext) {
        self.pipeline.destroy(&ctx.device);
        if let Some(set) = &self.ray_tracing_set {
            ctx.descriptor_pool.destroy_descriptor_set(set);
        }
        ctx.descriptor_pool.destroy_descriptor_set(&self.lighting_set);
    }
}

impl LightingSceneData {
    fn set_layouts(
        &self,
        swapchain_layout: vk::DescriptorSetLayout,
        gbuffer_layout: vk::DescriptorSetLayout,
        camera_layout: vk::DescriptorSetLayout,
    ) -> Vec<vk::DescriptorSetLayout> {
        let mut layouts = vec![
            swapchain_layout,
            gbuffer_layout,
            self.lighting_set.layout,
            camera_layout,
        ];
        if let Some(set) = &self.ray_tracing_set {
            layouts.push(set.layout);
        }
        layouts
    }
}

fn create_pipeline(
    ctx: &VulkanContext,
    set_layouts: &[vk::DescriptorSetLayout],
    defines: &[ShaderDefine],
    material_count: u32,
    texture_count: u32,
    mesh_count: u32,
) -> Result<ComputePipeline, String> {
    let shader = ctx.shader_manager.create_shader_module(
        vk::ShaderStageFlags::COMPUTE,
        SHADER,
        defines,
        SpecializationConstants::new()
            .with_u32(WORK_GROUP_SIZE[0])
            .with_u32(WORK_GROUP_SIZE[1])
            .with_u32(material_count)
            .with_u32(texture_count)
            .with_u32(mesh_count),
    )?;

    ComputePipeline::new(
        &ctx.device,
        &ctx.shader_manager,
        shader,
        set_layouts,
        &[pipelines::push_constant_range(
            vk::ShaderStageFlags::COMPUTE,
            0,
            std::mem::size_of::<[f32; 3]>() as u32,
        )],
    )
}

// ===========================================================================
// Stage
// ===========================================================================

pub struct LightingStage {
    reverse_depth: bool,
    ray_tracing_enabled: bool,
    extent: vk::Extent2D,
    swapchain_layout: vk::DescriptorSetLayout,
    swapchain_sets: Vec<vk::DescriptorSet>,
    gbuffer_layout: vk::DescriptorSetLayout,
    gbuffer_set: vk::DescriptorSet,
    camera_data: CameraData,
    scene: SceneSlot<LightingSceneData>,
}

impl LightingStage {
    pub fn new(
        ctx: &mut VulkanContext,
        config: &RenderConfig,
        swapchain: &Swapchain,
        gbuffer: &GBuffer,
    ) -> Result<Self, String> {
        let camera_data = render_helpers::create_camera_data(
            ctx,
            swapchain.image_count(),
            vk::ShaderStageFlags::COMPUTE,
            "lighting",
        )?;

        let mut stage = Self {
            reverse_depth: config.reverse_depth,
            ray_tracing_enabled: config.ray_tracing_enabled && ctx.supports_rt(),
            extent: swapchain.extent(),
            swapchain_layout: vk::DescriptorSetLayout::null(),
            swapchain_sets: Vec::new(),
            gbuffer_layout: vk::DescriptorSetLayout::null(),
            gbuffer_set: vk::DescriptorSet::null(),
            camera_data,
            scene: SceneSlot::new(),
        };

        match stage.create_target_sets(ctx, swapchain, gbuffer) {
            Ok(()) => {
                info!(
                    "Lighting stage ready (ray tracing: {})",
                    stage.ray_tracing_enabled
                );
                Ok(stage)
            }
            Err(e) => {
                stage.destroy(ctx);
                Err(e)
            }
        }
    }

    fn create_target_sets(
        &mut self,
        ctx: &mut VulkanContext,
        swapchain: &Swapchain,
        gbuffer: &GBuffer,
    ) -> Result<(), String> {
        self.swapchain_layout = ctx
            .descriptor_pool
            .create_descriptor_set_layout(&swapchain_description())?;
        self.gbuffer_layout = ctx
            .descriptor_pool
            .create_descriptor_set_layout(&gbuffer_description())?;
        self.allocate_target_sets(ctx, swapchain, gbuffer)
    }

    /// Sets pointing at size-dependent images. Their layouts outlive resizes,
    /// so pipelines stay compatible.
    fn allocate_target_sets(
        &mut self,
        ctx: &mut VulkanContext,
        swapchain: &Swapchain,
        gbuffer: &GBuffer,
    ) -> Result<(), String> {
        let swapchain_data: Vec<DescriptorSetData> = swapchain
            .image_views()
            .iter()
            .map(|&view| vec![descriptors::storage_image_data(view)])
            .collect();
        self.swapchain_sets = ctx.descriptor_pool.allocate_descriptor_sets(
            self.swapchain_layout,
            &swapchain_description(),
            &swapchain_data,
        )?;

        let gbuffer_data = gbuffer_set_data(ctx, gbuffer);
        self.gbuffer_set = ctx.descriptor_pool.allocate_descriptor_sets(
            self.gbuffer_layout,
            &gbuffer_description(),
            &[gbuffer_data],
        )?[0];
        Ok(())
    }

    fn free_target_sets(&mut self, ctx: &mut VulkanContext) {
        if !self.swapchain_sets.is_empty() {
            ctx.descriptor_pool.free_descriptor_sets(&self.swapchain_sets);
            self.swapchain_sets.clear();
        }
        if self.gbuffer_set != vk::DescriptorSet::null() {
            ctx.descriptor_pool.free_descriptor_sets(&[self.gbuffer_set]);
            self.gbuffer_set = vk::DescriptorSet::null();
        }
    }

    pub fn is_scene_bound(&self) -> bool {
        self.scene.is_bound()
    }

    /// Bind `scene`, releasing any previously bound one first. The lighting
    /// set and shader variant follow the scene's light count and whether it
    /// has a light volume.
    pub fn register_scene(
        &mut self,
        ctx: &mut VulkanContext,
        scene: &Scene,
        ibl: &ImageBasedLighting,
    ) -> Result<(), String> {
        let ray_tracing = self.ray_tracing_enabled;
        let swapchain_layout = self.swapchain_layout;
        let gbuffer_layout = self.gbuffer_layout;
        let camera_layout = self.camera_data.descriptor_set.layout;

        self.scene.register(ctx, scene.id(), |ctx| {
            let light_volume = scene.light_volume.as_ref();
            let samplers = *ibl.samplers();

            let mut lighting_data = vec![
                descriptors::sampled_image_data(samplers.irradiance, scene.environment.irradiance.view),
                descriptors::sampled_image_data(samplers.reflection, scene.environment.reflection.view),
                descriptors::sampled_image_data(samplers.specular_brdf, ibl.specular_brdf().view),
                descriptors::uniform_buffer_data(scene.light_buffer),
            ];
            if let Some(volume) = light_volume {
                lighting_data.push(descriptors::storage_buffer_data(volume.positions_buffer));
                lighting_data.push(descriptors::storage_buffer_data(volume.tetrahedral_buffer));
                lighting_data.push(descriptors::storage_buffer_data(volume.coefficients_buffer));
            }
            let lighting_set = ctx
                .descriptor_pool
                .create_descriptor_set(&lighting_description(light_volume.is_some()), &lighting_data)?;

            let material_count = scene.material_count();
            let texture_count = scene.textures.len() as u32;
            let mesh_count = scene.meshes.len() as u32;

            let ray_tracing_set = match (ray_tracing, scene.ray_tracing.as_ref()) {
                (true, Some(storage)) => {
                    let data = vec![
                        descriptors::acceleration_structure_data(storage.tlas),
                        descriptors::uniform_buffer_data(scene.material_buffer),
                        descriptors::sampled_textures_data(&scene.sampled_textures(ctx.default_sampler)),
                        descriptors::storage_buffers_data(&storage.index_buffers),
                        descriptors::storage_buffers_data(&storage.vertex_buffers),
                    ];
                    match ctx
                        .descriptor_pool
                        .create_descriptor_set(&ray_tracing_description(texture_count, mesh_count), &data)
                    {
                        Ok(set) => Some(set),
                        Err(e) => {
                            ctx.descriptor_pool.destroy_descriptor_set(&lighting_set);
                            return Err(e);
                        }
                    }
                }
                (true, None) => panic!("Ray tracing is enabled but the scene has no ray tracing storage"),
                (false, _) => None,
            };

            let mut data = LightingSceneData {
                lighting_set,
                ray_tracing_set,
                pipeline: ComputePipeline::default(),
                defines: shader_defines(scene.light_count(), ray_tracing, light_volume.is_some()),
                material_count,
                texture_count,
                mesh_count,
            };

            let layouts = data.set_layouts(swapchain_layout, gbuffer_layout, camera_layout);
            match create_pipeline(
                ctx,
                &layouts,
                &data.defines,
                material_count,
                texture_count,
                mesh_count,
            ) {
                Ok(pipeline) => {
                    data.pipeline = pipeline;
                    debug!("Lighting variant {:?}", data.defines);
                    Ok(data)
                }
                Err(e) => {
                    data.destroy(ctx);
                    Err(e)
                }
            }
        })
    }

    pub fn remove_scene(&mut self, ctx: &mut VulkanContext) {
        self.scene.release(ctx);
    }

    /// Record the lighting dispatch into swapchain image `image_index`,
    /// which is in `image_layout` when the frame starts. The image is left in
    /// GENERAL for the forward pass.
    pub fn execute(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        scene: &Scene,
        swapchain_image: vk::Image,
        image_layout: vk::ImageLayout,
        image_index: usize,
    ) {
        let scene_data = self.scene.get().expect("Lighting stage executed without a scene");
        assert_eq!(
            self.scene.scene_id(),
            Some(scene.id()),
            "Lighting stage executed with a scene it is not bound to"
        );

        render_helpers::update_camera_data(
            device,
            cmd,
            &self.camera_data,
            image_index,
            &scene.camera.inverse_view_projection(self.reverse_depth),
        );

        image_helpers::transit_image_layout(
            device,
            cmd,
            swapchain_image,
            FLAT_COLOR,
            &ImageLayoutTransition::new(
                image_layout,
                vk::ImageLayout::GENERAL,
                SWAPCHAIN_WAIT,
                SyncScope::COMPUTE_SHADER_WRITE,
            ),
        );

        let mut descriptor_sets = vec![
            self.swapchain_sets[image_index],
            self.gbuffer_set,
            scene_data.lighting_set.value,
            self.camera_data.descriptor_set.values[image_index],
        ];
        if let Some(set) = &scene_data.ray_tracing_set {
            descriptor_sets.push(set.value);
        }

        let camera_position = scene.camera.location.position.to_array();
        let [x, y, z] = pipelines::calculate_work_group_count(self.extent, WORK_GROUP_SIZE);

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, scene_data.pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                scene_data.pipeline.layout,
                0,
                &descriptor_sets,
                &[],
            );
            device.cmd_push_constants(
                cmd,
                scene_data.pipeline.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&camera_position),
            );
            device.cmd_dispatch(cmd, x, y, z);
        }
    }

    /// Point the swapchain and G-buffer sets at the recreated images. The
    /// set layouts are unchanged, so the pipeline is reused. The device must
    /// be idle.
    pub fn resize(
        &mut self,
        ctx: &mut VulkanContext,
        swapchain: &Swapchain,
        gbuffer: &GBuffer,
    ) -> Result<(), String> {
        assert_eq!(
            swapchain.image_count(),
            self.camera_data.buffers.len(),
            "Swapchain image count changed across resize"
        );
        self.free_target_sets(ctx);
        self.allocate_target_sets(ctx, swapchain, gbuffer)?;
        self.extent = swapchain.extent();
        Ok(())
    }

    /// Rebuild the pipeline from the cached layouts, defines and counts.
    pub fn reload_shaders(&mut self, ctx: &mut VulkanContext) -> Result<(), String> {
        let swapchain_layout = self.swapchain_layout;
        let gbuffer_layout = self.gbuffer_layout;
        let camera_layout = self.camera_data.descriptor_set.layout;
        let Some(scene_data) = self.scene.get_mut() else {
            return Ok(());
        };

        let layouts = scene_data.set_layouts(swapchain_layout, gbuffer_layout, camera_layout);
        let pipeline = create_pipeline(
            ctx,
            &layouts,
            &scene_data.defines,
            scene_data.material_count,
            scene_data.texture_count,
            scene_data.mesh_count,
        )?;
        scene_data.pipeline.destroy(&ctx.device);
        scene_data.pipeline = pipeline;
        Ok(())
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        self.scene.release(ctx);
        self.free_target_sets(ctx);
        for layout in [self.swapchain_layout, self.gbuffer_layout] {
            if layout != vk::DescriptorSetLayout::null() {
                ctx.descriptor_pool.destroy_descriptor_set_layout(layout);
            }
        }
        self.swapchain_layout = vk::DescriptorSetLayout::null();
        self.gbuffer_layout = vk::DescriptorSetLayout::null();
        render_helpers::destroy_camera_data(ctx, &self.camera_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_volume_adds_three_storage_buffers() {
        let without = lighting_description(false);
        let with = lighting_description(true);
        assert_eq!(without.len(), 4);
        assert_eq!(with.len(), 7);
        assert!(with[4..]
            .iter()
            .all(|d| d.ty == vk::DescriptorType::STORAGE_BUFFER));
    }

    #[test]
    fn defines_track_set_shape() {
        let defines = shader_defines(3, false, true);
        assert!(defines.contains(&("LIGHT_COUNT", 3)));
        assert!(defines.contains(&("RAY_TRACING_ENABLED", 0)));
        assert!(defines.contains(&("LIGHT_VOLUME_ENABLED", 1)));
    }

    #[test]
    fn gbuffer_set_samples_depth_and_stores_the_rest() {
        let description = gbuffer_description();
        assert_eq!(description.len(), 5);
        assert_eq!(description[0].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert!(description[1..]
            .iter()
            .all(|d| d.ty == vk::DescriptorType::STORAGE_IMAGE));
    }

    #[test]
    fn ray_tracing_set_sizes_arrays_by_scene() {
        let description = ray_tracing_description(2, 5);
        assert_eq!(description[0].ty, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
        assert_eq!(description[2].count, 2);
        assert_eq!(description[3].count, 5);
        assert_eq!(description[4].count, 5);
    }

    #[test]
    fn camera_position_push_fits_budget() {
        assert!(std::mem::size_of::<[f32; 3]>() as u32 <= pipelines::MAX_PUSH_CONSTANTS_SIZE);
    }
}
