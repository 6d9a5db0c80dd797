//! Directional light retrieval from an environment cubemap.
//!
//! Three compute passes run in one submission: luminance of a downsampled
//! copy of the cube into a texel buffer, a single-group reduction locating the
//! brightest texel, then integration of the lobe around it into a direction
//! and an irradiance that is read back on the host. Every buffer, view and
//! descriptor set of a retrieval is freed before it returns.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use log::{debug, info};
use std::time::Instant;

use crate::buffer_helpers;
use crate::descriptors::{self, DescriptorDescription};
use crate::image_helpers::{SyncScope, Texture, CUBE_FACE_COUNT};
use crate::pipelines::{self, ComputePipeline};
use crate::scene::{Light, LightKind};
use crate::shader_manager::SpecializationConstants;
use crate::vulkan_context::VulkanContext;

const WORK_GROUP_SIZE: [u32; 2] = [8, 8];
const LOCATION_GROUP_SIZE: u32 = 256;

/// Face size the luminance pass samples the cube at.
pub const MAX_LUMINANCE_EXTENT: u32 = 64;

/// Guaranteed minimum of `maxTexelBufferElements`.
const MIN_TEXEL_BUFFER_ELEMENTS: u32 = 65536;

const LUMINANCE_SHADER: &str = "Compute/DirectLighting/Luminance.comp";
const LOCATION_SHADER: &str = "Compute/DirectLighting/Location.comp";
const PARAMETERS_SHADER: &str = "Compute/DirectLighting/Parameters.comp";

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct CubeSamplingPushConstants {
    extent: u32,
    lod: f32,
}

/// Brightest texel index (u32) followed by its luminance (f32).
const LOCATION_SIZE: vk::DeviceSize = 8;

/// Output of the parameters pass. `direction` points towards the light.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuDirectLight {
    pub direction: [f32; 4],
    pub irradiance: [f32; 4],
}

pub fn luminance_extent(cubemap_extent: u32) -> u32 {
    cubemap_extent.clamp(1, MAX_LUMINANCE_EXTENT)
}

/// Mip level whose texels match the luminance grid.
pub fn luminance_lod(cubemap_extent: u32) -> f32 {
    (cubemap_extent.max(1) as f32 / luminance_extent(cubemap_extent) as f32).log2()
}

pub fn luminance_texel_count(cubemap_extent: u32) -> u32 {
    let extent = luminance_extent(cubemap_extent);
    CUBE_FACE_COUNT * extent * extent
}

/// Directional light shining away from the retrieved direction. Colour is
/// the irradiance normalised to its largest channel, which becomes the intensity.
pub fn light_from_parameters(parameters: &GpuDirectLight) -> Light {
    let towards_light = Vec3::from_slice(&parameters.direction[..3]);
    let irradiance = Vec3::from_slice(&parameters.irradiance[..3]).max(Vec3::ZERO);
    let intensity = irradiance.max_element();

    let direction = if towards_light.length_squared() > 0.0 {
        -towards_light.normalize()
    } else {
        Vec3::NEG_Y
    };

    Light {
        kind: LightKind::Directional { direction },
        color: if intensity > 0.0 {
            irradiance / intensity
        } else {
            Vec3::ONE
        },
        intensity,
    }
}

fn single(ty: vk::DescriptorType) -> Vec<DescriptorDescription> {
    vec![DescriptorDescription::new(1, ty, vk::ShaderStageFlags::COMPUTE)]
}

fn record_buffer_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    wait: SyncScope,
    block: SyncScope,
) {
    let barrier = vk::BufferMemoryBarrier::default()
        .src_access_mask(wait.access)
        .dst_access_mask(block.access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .size(vk::WHOLE_SIZE);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            wait.stages,
            block.stages,
            vk::DependencyFlags::empty(),
            &[],
            std::slice::from_ref(&barrier),
            &[],
        );
    }
}

const HOST_READ: SyncScope = SyncScope::new(vk::PipelineStageFlags::HOST, vk::AccessFlags::HOST_READ);

/// Buffers and sets of one retrieval.
#[derive(Default)]
struct Retrieval {
    luminance_buffer: vk::Buffer,
    luminance_view: vk::BufferView,
    location_buffer: vk::Buffer,
    parameters_buffer: vk::Buffer,
    sets: Vec<vk::DescriptorSet>,
}

impl Retrieval {
    fn release(self, ctx: &mut VulkanContext) {
        if !self.sets.is_empty() {
            ctx.descriptor_pool.free_descriptor_sets(&self.sets);
        }
        if self.luminance_view != vk::BufferView::null() {
            unsafe { ctx.device.destroy_buffer_view(self.luminance_view, None) };
        }
        for buffer in [self.luminance_buffer, self.location_buffer, self.parameters_buffer] {
            if buffer != vk::Buffer::null() {
                ctx.memory_manager.destroy_buffer(buffer);
            }
        }
    }
}

#[derive(Default)]
pub struct DirectLighting {
    environment_layout: vk::DescriptorSetLayout,
    luminance_target_layout: vk::DescriptorSetLayout,
    luminance_source_layout: vk::DescriptorSetLayout,
    storage_buffer_layout: vk::DescriptorSetLayout,
    luminance_pipeline: ComputePipeline,
    location_pipeline: ComputePipeline,
    parameters_pipeline: ComputePipeline,
}

impl DirectLighting {
    pub fn new(ctx: &mut VulkanContext) -> Result<Self, String> {
        let mut direct_lighting = Self::default();
        match direct_lighting.create_resources(ctx) {
            Ok(()) => {
                debug!("Direct lighting pipelines ready");
                Ok(direct_lighting)
            }
            Err(e) => {
                direct_lighting.destroy(ctx);
                Err(e)
            }
        }
    }

    fn create_resources(&mut self, ctx: &mut VulkanContext) -> Result<(), String> {
        self.environment_layout = ctx
            .descriptor_pool
            .create_descriptor_set_layout(&single(vk::DescriptorType::COMBINED_IMAGE_SAMPLER))?;
        self.luminance_target_layout = ctx
            .descriptor_pool
            .create_descriptor_set_layout(&single(vk::DescriptorType::STORAGE_TEXEL_BUFFER))?;
        self.luminance_source_layout = ctx
            .descriptor_pool
            .create_descriptor_set_layout(&single(vk::DescriptorType::UNIFORM_TEXEL_BUFFER))?;
        self.storage_buffer_layout = ctx
            .descriptor_pool
            .create_descriptor_set_layout(&single(vk::DescriptorType::STORAGE_BUFFER))?;

        let sampling_push_constants = [pipelines::push_constant_range(
            vk::ShaderStageFlags::COMPUTE,
            0,
            std::mem::size_of::<CubeSamplingPushConstants>() as u32,
        )];

        let luminance_shader = ctx.shader_manager.create_shader_module(
            vk::ShaderStageFlags::COMPUTE,
            LUMINANCE_SHADER,
            &[],
            SpecializationConstants::new()
                .with_u32(WORK_GROUP_SIZE[0])
                .with_u32(WORK_GROUP_SIZE[1]),
        )?;
        self.luminance_pipeline = ComputePipeline::new(
            &ctx.device,
            &ctx.shader_manager,
            luminance_shader,
            &[self.environment_layout, self.luminance_target_layout],
            &sampling_push_constants,
        )?;

        let location_shader = ctx.shader_manager.create_shader_module(
            vk::ShaderStageFlags::COMPUTE,
            LOCATION_SHADER,
            &[],
            SpecializationConstants::new().with_u32(LOCATION_GROUP_SIZE),
        )?;
        self.location_pipeline = ComputePipeline::new(
            &ctx.device,
            &ctx.shader_manager,
            location_shader,
            &[self.luminance_source_layout, self.storage_buffer_layout],
            &[],
        )?;

        let parameters_shader = ctx.shader_manager.create_shader_module(
            vk::ShaderStageFlags::COMPUTE,
            PARAMETERS_SHADER,
            &[],
            SpecializationConstants::new(),
        )?;
        self.parameters_pipeline = ComputePipeline::new(
            &ctx.device,
            &ctx.shader_manager,
            parameters_shader,
            &[
                self.environment_layout,
                self.luminance_source_layout,
                self.storage_buffer_layout,
                self.storage_buffer_layout,
            ],
            &sampling_push_constants,
        )?;

        Ok(())
    }

    /// Brightest light of `cubemap` as a directional light. The cubemap must be
    /// sampleable and complete with mips.
    pub fn retrieve_direct_light(&self, ctx: &mut VulkanContext, cubemap: &Texture) -> Result<Light, String> {
        let start = Instant::now();
        let description = ctx.memory_manager.image_description(cubemap.image);
        assert!(description.is_cube(), "Direct light retrieval needs a cube texture");

        let cubemap_extent = description.extent_2d().width;
        let push_constants = CubeSamplingPushConstants {
            extent: luminance_extent(cubemap_extent),
            lod: luminance_lod(cubemap_extent),
        };
        let texel_count = luminance_texel_count(cubemap_extent);

        let mut retrieval = Retrieval::default();
        let result = self
            .prepare(ctx, cubemap, texel_count, &mut retrieval)
            .and_then(|()| self.dispatch(ctx, &retrieval, push_constants))
            .map(|()| {
                let block = ctx.memory_manager.buffer_memory_block(retrieval.parameters_buffer);
                let size = std::mem::size_of::<GpuDirectLight>();
                let parameters: GpuDirectLight =
                    bytemuck::pod_read_unaligned(&ctx.memory_manager.map_memory(&block)[..size]);
                ctx.memory_manager.unmap_memory(&block);
                parameters
            });
        retrieval.release(ctx);

        let parameters = result?;
        let light = light_from_parameters(&parameters);
        info!(
            "Retrieved direct light in {:.1} ms: {:?}, intensity {:.2}",
            start.elapsed().as_secs_f64() * 1000.0,
            light.kind,
            light.intensity
        );
        Ok(light)
    }

    fn prepare(
        &self,
        ctx: &mut VulkanContext,
        cubemap: &Texture,
        texel_count: u32,
        retrieval: &mut Retrieval,
    ) -> Result<(), String> {
        assert!(
            texel_count <= MIN_TEXEL_BUFFER_ELEMENTS,
            "Luminance grid of {} texels exceeds the texel buffer limit",
            texel_count
        );

        retrieval.luminance_buffer = buffer_helpers::create_empty_buffer(
            ctx,
            texel_count as u64 * std::mem::size_of::<f32>() as u64,
            vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            "environment luminance",
        )?;

        let view_info = vk::BufferViewCreateInfo::default()
            .buffer(retrieval.luminance_buffer)
            .format(vk::Format::R32_SFLOAT)
            .offset(0)
            .range(vk::WHOLE_SIZE);
        retrieval.luminance_view = unsafe {
            ctx.device
                .create_buffer_view(&view_info, None)
                .map_err(|e| format!("Failed to create luminance buffer view: {:?}", e))?
        };

        retrieval.location_buffer = buffer_helpers::create_empty_buffer(
            ctx,
            LOCATION_SIZE,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            "direct light location",
        )?;
        retrieval.parameters_buffer = buffer_helpers::create_empty_buffer(
            ctx,
            std::mem::size_of::<GpuDirectLight>() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
            "direct light parameters",
        )?;

        let layouts_and_data = [
            (
                self.environment_layout,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptors::sampled_image_data(ctx.default_sampler, cubemap.view),
            ),
            (
                self.luminance_target_layout,
                vk::DescriptorType::STORAGE_TEXEL_BUFFER,
                descriptors::storage_texel_buffer_data(retrieval.luminance_view),
            ),
            (
                self.luminance_source_layout,
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
                descriptors::uniform_texel_buffer_data(retrieval.luminance_view),
            ),
            (
                self.storage_buffer_layout,
                vk::DescriptorType::STORAGE_BUFFER,
                descriptors::storage_buffer_data(retrieval.location_buffer),
            ),
            (
                self.storage_buffer_layout,
                vk::DescriptorType::STORAGE_BUFFER,
                descriptors::storage_buffer_data(retrieval.parameters_buffer),
            ),
        ];

        for (layout, ty, data) in layouts_and_data {
            let sets = ctx
                .descriptor_pool
                .allocate_descriptor_sets(layout, &single(ty), &[vec![data]])?;
            retrieval.sets.extend(sets);
        }
        Ok(())
    }

    fn dispatch(
        &self,
        ctx: &VulkanContext,
        retrieval: &Retrieval,
        push_constants: CubeSamplingPushConstants,
    ) -> Result<(), String> {
        let [environment_set, luminance_target_set, luminance_source_set, location_set, parameters_set] =
            retrieval.sets[..]
        else {
            panic!("Direct light retrieval allocates five descriptor sets");
        };

        let luminance = self.luminance_pipeline;
        let location = self.location_pipeline;
        let parameters = self.parameters_pipeline;

        ctx.execute_one_time_commands(|cmd| {
            let device = &ctx.device;
            let extent = vk::Extent2D {
                width: push_constants.extent,
                height: push_constants.extent,
            };
            let [x, y, _] = pipelines::calculate_work_group_count(extent, WORK_GROUP_SIZE);

            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, luminance.pipeline);
                device.cmd_push_constants(
                    cmd,
                    luminance.layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::bytes_of(&push_constants),
                );
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    luminance.layout,
                    0,
                    &[environment_set, luminance_target_set],
                    &[],
                );
                device.cmd_dispatch(cmd, x, y, CUBE_FACE_COUNT);
            }

            record_buffer_barrier(
                device,
                cmd,
                retrieval.luminance_buffer,
                SyncScope::COMPUTE_SHADER_WRITE,
                SyncScope::COMPUTE_SHADER_READ,
            );

            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, location.pipeline);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    location.layout,
                    0,
                    &[luminance_source_set, location_set],
                    &[],
                );
                device.cmd_dispatch(cmd, 1, 1, 1);
            }

            record_buffer_barrier(
                device,
                cmd,
                retrieval.location_buffer,
                SyncScope::COMPUTE_SHADER_WRITE,
                SyncScope::COMPUTE_SHADER_READ,
            );

            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, parameters.pipeline);
                device.cmd_push_constants(
                    cmd,
                    parameters.layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::bytes_of(&push_constants),
                );
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    parameters.layout,
                    0,
                    &[environment_set, luminance_source_set, location_set, parameters_set],
                    &[],
                );
                device.cmd_dispatch(cmd, 1, 1, 1);
            }

            record_buffer_barrier(
                device,
                cmd,
                retrieval.parameters_buffer,
                SyncScope::COMPUTE_SHADER_WRITE,
                HOST_READ,
            );
            Ok(())
        })
    }

    /// Safe on a partially created object: null handles are skipped.
    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        for pipeline in [
            &mut self.luminance_pipeline,
            &mut self.location_pipeline,
            &mut self.parameters_pipeline,
        ] {
            pipeline.destroy(&ctx.device);
            *pipeline = ComputePipeline::default();
        }

        for layout in [
            &mut self.environment_layout,
            &mut self.luminance_target_layout,
            &mut self.luminance_source_layout,
            &mut self.storage_buffer_layout,
        ] {
            if *layout != vk::DescriptorSetLayout::null() {
                ctx.descriptor_pool.destroy_descriptor_set_layout(*layout);
                *layout = vk::DescriptorSetLayout::null();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luminance_grid_is_capped_and_matches_a_mip() {
        assert_eq!(luminance_extent(512), MAX_LUMINANCE_EXTENT);
        assert_eq!(luminance_lod(512), 3.0);
        assert_eq!(luminance_extent(32), 32);
        assert_eq!(luminance_lod(32), 0.0);
        assert_eq!(luminance_extent(0), 1);
    }

    #[test]
    fn luminance_grid_fits_a_texel_buffer() {
        assert_eq!(luminance_texel_count(4096), 6 * 64 * 64);
        assert!(luminance_texel_count(u32::MAX) <= MIN_TEXEL_BUFFER_ELEMENTS);
    }

    #[test]
    fn location_group_reduces_in_halves() {
        assert!(LOCATION_GROUP_SIZE.is_power_of_two());
    }

    #[test]
    fn retrieved_light_shines_away_from_the_source() {
        let light = light_from_parameters(&GpuDirectLight {
            direction: [0.0, 2.0, 0.0, 0.0],
            irradiance: [3.0, 1.5, 0.75, 0.0],
        });

        assert_eq!(
            light.kind,
            LightKind::Directional {
                direction: Vec3::NEG_Y
            }
        );
        assert_eq!(light.intensity, 3.0);
        assert_eq!(light.color, Vec3::new(1.0, 0.5, 0.25));
        assert_eq!(light.to_gpu().color, [3.0, 1.5, 0.75, 0.0]);
    }

    #[test]
    fn dark_environment_yields_a_zero_intensity_light() {
        let light = light_from_parameters(&GpuDirectLight::default());
        assert_eq!(light.intensity, 0.0);
        assert_eq!(light.color, Vec3::ONE);
        assert!(matches!(light.kind, LightKind::Directional { .. }));
    }

    #[test]
    fn gpu_layouts_match_shader_blocks() {
        assert_eq!(std::mem::size_of::<CubeSamplingPushConstants>(), 8);
        assert_eq!(std::mem::size_of::<GpuDirectLight>(), 32);
    }
}
