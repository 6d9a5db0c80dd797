//! Image-based lighting precompute.
//!
//! Turns an environment cubemap into the irradiance and prefiltered
//! reflection cubemaps sampled by the lighting stage, and owns the specular
//! BRDF lookup texture. Each generation is a sequence of one-time compute
//! submissions, one per cube face. The layout transitions bracket the whole
//! sequence: the first face moves the target to GENERAL, the last one moves
//! it to SHADER_READ_ONLY_OPTIMAL. Per-face views and descriptor sets are
//! freed before returning.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use log::{debug, info};
use std::time::Instant;

use crate::descriptors::{self, DescriptorDescription, DescriptorSetData};
use crate::image_helpers::{
    self, ImageLayoutTransition, SyncScope, Texture, CUBE_COLOR, CUBE_FACE_COUNT, FLAT_COLOR,
};
use crate::pipelines::{self, ComputePipeline};
use crate::render_helpers::{self, SamplerDescription};
use crate::shader_manager::SpecializationConstants;
use crate::vulkan_context::VulkanContext;

const WORK_GROUP_SIZE: [u32; 2] = [8, 8];

pub const SPECULAR_BRDF_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 256,
    height: 256,
};
pub const SPECULAR_BRDF_FORMAT: vk::Format = vk::Format::R16G16_SFLOAT;

pub const MAX_IRRADIANCE_EXTENT: u32 = 128;
pub const MAX_REFLECTION_EXTENT: u32 = 512;

const SPECULAR_BRDF_SHADER: &str = "Compute/ImageBasedLighting/SpecularBRDF.comp";
const IRRADIANCE_SHADER: &str = "Compute/ImageBasedLighting/Irradiance.comp";
const REFLECTION_SHADER: &str = "Compute/ImageBasedLighting/Reflection.comp";

const IRRADIANCE_SAMPLER: SamplerDescription = SamplerDescription {
    mag_filter: vk::Filter::LINEAR,
    min_filter: vk::Filter::LINEAR,
    mipmap_mode: vk::SamplerMipmapMode::NEAREST,
    address_mode: vk::SamplerAddressMode::REPEAT,
    max_anisotropy: None,
    min_lod: 0.0,
    max_lod: 0.0,
    unnormalized_coords: false,
};

const REFLECTION_SAMPLER: SamplerDescription = SamplerDescription {
    mag_filter: vk::Filter::LINEAR,
    min_filter: vk::Filter::LINEAR,
    mipmap_mode: vk::SamplerMipmapMode::LINEAR,
    address_mode: vk::SamplerAddressMode::REPEAT,
    max_anisotropy: None,
    min_lod: 0.0,
    max_lod: vk::LOD_CLAMP_NONE,
    unnormalized_coords: false,
};

const SPECULAR_BRDF_SAMPLER: SamplerDescription = SamplerDescription {
    mag_filter: vk::Filter::NEAREST,
    min_filter: vk::Filter::NEAREST,
    mipmap_mode: vk::SamplerMipmapMode::NEAREST,
    address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
    max_anisotropy: None,
    min_lod: 0.0,
    max_lod: 0.0,
    unnormalized_coords: false,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ReflectionPushConstants {
    roughness: f32,
    face: u32,
}

// ===========================================================================
// Extents and roughness schedule
// ===========================================================================

fn clamp_extent(extent: vk::Extent2D, max: u32) -> vk::Extent2D {
    if extent.width <= max {
        extent
    } else {
        vk::Extent2D {
            width: max,
            height: max,
        }
    }
}

pub fn irradiance_extent(cubemap_extent: vk::Extent2D) -> vk::Extent2D {
    clamp_extent(cubemap_extent, MAX_IRRADIANCE_EXTENT)
}

pub fn reflection_extent(cubemap_extent: vk::Extent2D) -> vk::Extent2D {
    clamp_extent(cubemap_extent, MAX_REFLECTION_EXTENT)
}

/// Roughness prefiltered into `mip_level`: 0 at the base, 1 at the last level.
pub fn reflection_roughness(mip_level: u32, mip_level_count: u32) -> f32 {
    if mip_level_count <= 1 {
        return 0.0;
    }
    mip_level as f32 / (mip_level_count - 1) as f32
}

// ===========================================================================
// ImageBasedLighting
// ===========================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct IblSamplers {
    pub irradiance: vk::Sampler,
    pub reflection: vk::Sampler,
    pub specular_brdf: vk::Sampler,
}

#[derive(Default)]
pub struct ImageBasedLighting {
    cubemap_layout: vk::DescriptorSetLayout,
    target_layout: vk::DescriptorSetLayout,
    irradiance_pipeline: ComputePipeline,
    reflection_pipeline: ComputePipeline,
    specular_brdf: Texture,
    samplers: IblSamplers,
}

fn cubemap_description() -> Vec<DescriptorDescription> {
    vec![DescriptorDescription::new(
        1,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::ShaderStageFlags::COMPUTE,
    )]
}

fn target_description() -> Vec<DescriptorDescription> {
    vec![DescriptorDescription::new(
        1,
        vk::DescriptorType::STORAGE_IMAGE,
        vk::ShaderStageFlags::COMPUTE,
    )]
}

impl ImageBasedLighting {
    pub fn new(ctx: &mut VulkanContext, max_environment_luminance: f32) -> Result<Self, String> {
        let mut ibl = Self::default();
        match ibl.create_resources(ctx, max_environment_luminance) {
            Ok(()) => {
                info!("Image-based lighting ready");
                Ok(ibl)
            }
            Err(e) => {
                ibl.destroy(ctx);
                Err(e)
            }
        }
    }

    fn create_resources(
        &mut self,
        ctx: &mut VulkanContext,
        max_environment_luminance: f32,
    ) -> Result<(), String> {
        self.cubemap_layout = ctx
            .descriptor_pool
            .create_descriptor_set_layout(&cubemap_description())?;
        self.target_layout = ctx
            .descriptor_pool
            .create_descriptor_set_layout(&target_description())?;

        let layouts = [self.cubemap_layout, self.target_layout];

        let irradiance_shader = ctx.shader_manager.create_shader_module(
            vk::ShaderStageFlags::COMPUTE,
            IRRADIANCE_SHADER,
            &[],
            SpecializationConstants::new()
                .with_u32(WORK_GROUP_SIZE[0])
                .with_u32(WORK_GROUP_SIZE[1]),
        )?;
        self.irradiance_pipeline = ComputePipeline::new(
            &ctx.device,
            &ctx.shader_manager,
            irradiance_shader,
            &layouts,
            &[pipelines::push_constant_range(
                vk::ShaderStageFlags::COMPUTE,
                0,
                std::mem::size_of::<u32>() as u32,
            )],
        )?;

        let reflection_shader = ctx.shader_manager.create_shader_module(
            vk::ShaderStageFlags::COMPUTE,
            REFLECTION_SHADER,
            &[],
            SpecializationConstants::new()
                .with_u32(WORK_GROUP_SIZE[0])
                .with_u32(WORK_GROUP_SIZE[1])
                .with_f32(max_environment_luminance),
        )?;
        self.reflection_pipeline = ComputePipeline::new(
            &ctx.device,
            &ctx.shader_manager,
            reflection_shader,
            &layouts,
            &[pipelines::push_constant_range(
                vk::ShaderStageFlags::COMPUTE,
                0,
                std::mem::size_of::<ReflectionPushConstants>() as u32,
            )],
        )?;

        self.samplers.irradiance = render_helpers::create_sampler(&ctx.device, &IRRADIANCE_SAMPLER)?;
        self.samplers.reflection = render_helpers::create_sampler(&ctx.device, &REFLECTION_SAMPLER)?;
        self.samplers.specular_brdf =
            render_helpers::create_sampler(&ctx.device, &SPECULAR_BRDF_SAMPLER)?;

        self.specular_brdf = self.create_specular_brdf(ctx)?;
        Ok(())
    }

    pub fn samplers(&self) -> &IblSamplers {
        &self.samplers
    }

    pub fn specular_brdf(&self) -> &Texture {
        &self.specular_brdf
    }

    fn create_specular_brdf(&self, ctx: &mut VulkanContext) -> Result<Texture, String> {
        let shader = ctx.shader_manager.create_shader_module(
            vk::ShaderStageFlags::COMPUTE,
            SPECULAR_BRDF_SHADER,
            &[],
            SpecializationConstants::new()
                .with_u32(WORK_GROUP_SIZE[0])
                .with_u32(WORK_GROUP_SIZE[1]),
        )?;
        let pipeline = ComputePipeline::new(
            &ctx.device,
            &ctx.shader_manager,
            shader,
            &[self.target_layout],
            &[],
        )?;

        let target = match image_helpers::create_render_target(
            ctx,
            SPECULAR_BRDF_FORMAT,
            SPECULAR_BRDF_EXTENT,
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST,
            "specular brdf",
        ) {
            Ok(target) => target,
            Err(e) => {
                pipeline.destroy(&ctx.device);
                return Err(e);
            }
        };

        let result = self.dispatch_specular_brdf(ctx, &pipeline, &target);
        pipeline.destroy(&ctx.device);

        match result {
            Ok(()) => Ok(target),
            Err(e) => {
                image_helpers::destroy_texture(ctx, &target);
                Err(e)
            }
        }
    }

    fn dispatch_specular_brdf(
        &self,
        ctx: &mut VulkanContext,
        pipeline: &ComputePipeline,
        target: &Texture,
    ) -> Result<(), String> {
        let sets = ctx.descriptor_pool.allocate_descriptor_sets(
            self.target_layout,
            &target_description(),
            &[vec![descriptors::storage_image_data(target.view)]],
        )?;

        let result = ctx.execute_one_time_commands(|cmd| {
            let device = &ctx.device;

            image_helpers::transit_image_layout(
                device,
                cmd,
                target.image,
                FLAT_COLOR,
                &ImageLayoutTransition::new(
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::GENERAL,
                    SyncScope::WAIT_FOR_NONE,
                    SyncScope::COMPUTE_SHADER_WRITE,
                ),
            );

            let [x, y, z] = pipelines::calculate_work_group_count(SPECULAR_BRDF_EXTENT, WORK_GROUP_SIZE);
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    pipeline.layout,
                    0,
                    &sets,
                    &[],
                );
                device.cmd_dispatch(cmd, x, y, z);
            }

            image_helpers::transit_image_layout(
                device,
                cmd,
                target.image,
                FLAT_COLOR,
                &ImageLayoutTransition::new(
                    vk::ImageLayout::GENERAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    SyncScope::COMPUTE_SHADER_WRITE,
                    SyncScope::BLOCK_NONE,
                ),
            );
            Ok(())
        });

        ctx.descriptor_pool.free_descriptor_sets(&sets);
        result
    }

    /// Storage + sampled cube image with the cubemap's format.
    fn create_cube_target(
        ctx: &mut VulkanContext,
        format: vk::Format,
        extent: vk::Extent2D,
        mip_levels: u32,
        name: &str,
    ) -> Result<vk::Image, String> {
        let image_info = vk::ImageCreateInfo::default()
            .flags(vk::ImageCreateFlags::CUBE_COMPATIBLE)
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(image_helpers::extent_3d(extent))
            .mip_levels(mip_levels)
            .array_layers(CUBE_FACE_COUNT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        ctx.memory_manager
            .create_image(&image_info, vk::MemoryPropertyFlags::DEVICE_LOCAL, name)
    }

    /// Per-face views for every mip level plus one storage set per view.
    fn create_face_targets(
        &self,
        ctx: &mut VulkanContext,
        image: vk::Image,
        mip_levels: u32,
    ) -> Result<(Vec<vk::ImageView>, Vec<vk::DescriptorSet>), String> {
        let mut views = Vec::with_capacity((mip_levels * CUBE_FACE_COUNT) as usize);
        for mip_level in 0..mip_levels {
            match image_helpers::create_cube_face_views(ctx, image, mip_level) {
                Ok(face_views) => views.extend_from_slice(&face_views),
                Err(e) => {
                    image_helpers::destroy_image_views(&ctx.device, &views);
                    return Err(e);
                }
            }
        }

        let data: Vec<DescriptorSetData> = views
            .iter()
            .map(|&view| vec![descriptors::storage_image_data(view)])
            .collect();

        match ctx
            .descriptor_pool
            .allocate_descriptor_sets(self.target_layout, &target_description(), &data)
        {
            Ok(sets) => Ok((views, sets)),
            Err(e) => {
                image_helpers::destroy_image_views(&ctx.device, &views);
                Err(e)
            }
        }
    }

    /// Run `record_face` in its own one-time submission for every cube face.
    /// The first submission moves `range` to GENERAL and the last one to
    /// SHADER_READ_ONLY_OPTIMAL.
    fn dispatch_faces(
        ctx: &VulkanContext,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        record_face: impl Fn(&ash::Device, vk::CommandBuffer, u32),
    ) -> Result<(), String> {
        for face in 0..CUBE_FACE_COUNT {
            ctx.execute_one_time_commands(|cmd| {
                let device = &ctx.device;

                if face == 0 {
                    image_helpers::transit_image_layout(
                        device,
                        cmd,
                        image,
                        range,
                        &ImageLayoutTransition::new(
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::GENERAL,
                            SyncScope::WAIT_FOR_NONE,
                            SyncScope::COMPUTE_SHADER_WRITE,
                        ),
                    );
                }

                record_face(device, cmd, face);

                if face == CUBE_FACE_COUNT - 1 {
                    image_helpers::transit_image_layout(
                        device,
                        cmd,
                        image,
                        range,
                        &ImageLayoutTransition::new(
                            vk::ImageLayout::GENERAL,
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                            SyncScope::COMPUTE_SHADER_WRITE,
                            SyncScope::BLOCK_NONE,
                        ),
                    );
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Shared driver for both generators: allocate the target, dispatch every
    /// face, free the scratch views and sets, then create the cube view.
    fn generate(
        &self,
        ctx: &mut VulkanContext,
        cubemap: &Texture,
        extent: vk::Extent2D,
        mip_levels: u32,
        name: &str,
        record_face: impl Fn(&ash::Device, vk::CommandBuffer, u32, vk::DescriptorSet, &[vk::DescriptorSet]),
    ) -> Result<Texture, String> {
        let start = Instant::now();
        let format = ctx.memory_manager.image_description(cubemap.image).format;

        let image = Self::create_cube_target(ctx, format, extent, mip_levels, name)?;

        let (views, face_sets) = match self.create_face_targets(ctx, image, mip_levels) {
            Ok(targets) => targets,
            Err(e) => {
                ctx.memory_manager.destroy_image(image);
                return Err(e);
            }
        };

        let range = vk::ImageSubresourceRange {
            level_count: mip_levels,
            ..CUBE_COLOR
        };

        let dispatched = ctx
            .descriptor_pool
            .allocate_descriptor_sets(
                self.cubemap_layout,
                &cubemap_description(),
                &[vec![descriptors::sampled_image_data(
                    ctx.default_sampler,
                    cubemap.view,
                )]],
            )
            .and_then(|cubemap_sets| {
                let cubemap_set = cubemap_sets[0];
                let result = Self::dispatch_faces(ctx, image, range, |device, cmd, face| {
                    record_face(device, cmd, face, cubemap_set, &face_sets)
                });
                ctx.descriptor_pool.free_descriptor_sets(&cubemap_sets);
                result
            });

        ctx.descriptor_pool.free_descriptor_sets(&face_sets);
        image_helpers::destroy_image_views(&ctx.device, &views);

        let view = dispatched.and_then(|()| {
            image_helpers::create_image_view(
                &ctx.device,
                image,
                vk::ImageViewType::CUBE,
                format,
                range,
            )
        });

        match view {
            Ok(view) => {
                info!(
                    "Generated {} {}x{} ({} mips) in {:.1} ms",
                    name,
                    extent.width,
                    extent.height,
                    mip_levels,
                    start.elapsed().as_secs_f64() * 1000.0
                );
                debug!(
                    "{} occupies {} bytes",
                    name,
                    ctx.memory_manager.image_memory_block(image).size
                );
                Ok(Texture { image, view })
            }
            Err(e) => {
                ctx.memory_manager.destroy_image(image);
                Err(e)
            }
        }
    }

    /// Single-level cube of cosine-weighted irradiance.
    pub fn generate_irradiance_texture(
        &self,
        ctx: &mut VulkanContext,
        cubemap: &Texture,
    ) -> Result<Texture, String> {
        let cubemap_extent = ctx.memory_manager.image_description(cubemap.image).extent_2d();
        let extent = irradiance_extent(cubemap_extent);
        let pipeline = self.irradiance_pipeline;

        self.generate(
            ctx,
            cubemap,
            extent,
            1,
            "irradiance map",
            |device, cmd, face, cubemap_set, face_sets| {
                let [x, y, z] = pipelines::calculate_work_group_count(extent, WORK_GROUP_SIZE);
                unsafe {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
                    device.cmd_push_constants(
                        cmd,
                        pipeline.layout,
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        bytemuck::bytes_of(&face),
                    );
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        pipeline.layout,
                        0,
                        &[cubemap_set, face_sets[face as usize]],
                        &[],
                    );
                    device.cmd_dispatch(cmd, x, y, z);
                }
            },
        )
    }

    /// Full mip chain of prefiltered radiance, roughness rising with the mip level.
    pub fn generate_reflection_texture(
        &self,
        ctx: &mut VulkanContext,
        cubemap: &Texture,
    ) -> Result<Texture, String> {
        let cubemap_extent = ctx.memory_manager.image_description(cubemap.image).extent_2d();
        let extent = reflection_extent(cubemap_extent);
        let mip_levels = image_helpers::mip_level_count(extent);
        let pipeline = self.reflection_pipeline;

        self.generate(
            ctx,
            cubemap,
            extent,
            mip_levels,
            "reflection map",
            |device, cmd, face, cubemap_set, face_sets| unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    pipeline.layout,
                    0,
                    &[cubemap_set],
                    &[],
                );

                for mip_level in 0..mip_levels {
                    let mip_extent = image_helpers::mip_level_extent(extent, mip_level);
                    let [x, y, z] = pipelines::calculate_work_group_count(mip_extent, WORK_GROUP_SIZE);

                    let push_constants = ReflectionPushConstants {
                        roughness: reflection_roughness(mip_level, mip_levels),
                        face,
                    };
                    let face_set = face_sets[(mip_level * CUBE_FACE_COUNT + face) as usize];

                    device.cmd_push_constants(
                        cmd,
                        pipeline.layout,
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        bytemuck::bytes_of(&push_constants),
                    );
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        pipeline.layout,
                        1,
                        &[face_set],
                        &[],
                    );
                    device.cmd_dispatch(cmd, x, y, z);
                }
            },
        )
    }

    /// Safe on a partially created object: null handles are skipped.
    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        self.irradiance_pipeline.destroy(&ctx.device);
        self.reflection_pipeline.destroy(&ctx.device);
        self.irradiance_pipeline = ComputePipeline::default();
        self.reflection_pipeline = ComputePipeline::default();

        if self.specular_brdf.image != vk::Image::null() {
            image_helpers::destroy_texture(ctx, &self.specular_brdf);
            self.specular_brdf = Texture::default();
        }

        unsafe {
            ctx.device.destroy_sampler(self.samplers.irradiance, None);
            ctx.device.destroy_sampler(self.samplers.reflection, None);
            ctx.device.destroy_sampler(self.samplers.specular_brdf, None);
        }
        self.samplers = IblSamplers::default();

        for layout in [&mut self.cubemap_layout, &mut self.target_layout] {
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

    fn square(size: u32) -> vk::Extent2D {
        vk::Extent2D {
            width: size,
            height: size,
        }
    }

    #[test]
    fn roughness_spans_the_mip_chain() {
        let count = image_helpers::mip_level_count(square(512));
        assert_eq!(count, 10);
        assert_eq!(reflection_roughness(0, count), 0.0);
        assert_eq!(reflection_roughness(count - 1, count), 1.0);

        for mip in 1..count {
            assert!(reflection_roughness(mip, count) > reflection_roughness(mip - 1, count));
        }
        assert!((reflection_roughness(3, count) - 3.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn single_mip_chain_has_zero_roughness() {
        assert_eq!(reflection_roughness(0, 1), 0.0);
    }

    #[test]
    fn target_extents_are_capped() {
        assert_eq!(irradiance_extent(square(64)), square(64));
        assert_eq!(irradiance_extent(square(1024)), square(MAX_IRRADIANCE_EXTENT));
        assert_eq!(reflection_extent(square(256)), square(256));
        assert_eq!(reflection_extent(square(2048)), square(MAX_REFLECTION_EXTENT));
    }

    #[test]
    fn push_constants_fit_the_minimum_budget() {
        assert_eq!(std::mem::size_of::<ReflectionPushConstants>(), 8);
        assert!(std::mem::size_of::<ReflectionPushConstants>() as u32 <= pipelines::MAX_PUSH_CONSTANTS_SIZE);
    }

    #[test]
    fn reflection_sampler_reads_every_mip() {
        assert_eq!(REFLECTION_SAMPLER.max_lod, vk::LOD_CLAMP_NONE);
        assert_eq!(IRRADIANCE_SAMPLER.mipmap_mode, vk::SamplerMipmapMode::NEAREST);
        assert_eq!(
            SPECULAR_BRDF_SAMPLER.address_mode,
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        );
    }
}
