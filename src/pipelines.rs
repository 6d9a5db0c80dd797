//! Compute and graphics pipelines owning their layouts.
//!
//! Shader modules are consumed by pipeline creation and destroyed right after,
//! whether creation succeeded or not.

use ash::vk;

use crate::image_helpers;
use crate::shader_manager::{ShaderManager, ShaderModule};

/// Guaranteed minimum of `maxPushConstantsSize`.
pub const MAX_PUSH_CONSTANTS_SIZE: u32 = 128;

/// `ceil(extent / group_size)` per component, so the whole extent is covered.
pub fn calculate_work_group_count(extent: vk::Extent2D, group_size: [u32; 2]) -> [u32; 3] {
    [
        extent.width.div_ceil(group_size[0]),
        extent.height.div_ceil(group_size[1]),
        1,
    ]
}

pub fn push_constant_range(
    stage_flags: vk::ShaderStageFlags,
    offset: u32,
    size: u32,
) -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags,
        offset,
        size,
    }
}

fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout, String> {
    for range in push_constant_ranges {
        assert!(
            range.offset + range.size <= MAX_PUSH_CONSTANTS_SIZE,
            "Push constant range of {} bytes at offset {} exceeds the {} byte budget",
            range.size,
            range.offset,
            MAX_PUSH_CONSTANTS_SIZE
        );
    }

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);

    unsafe {
        device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| format!("Failed to create pipeline layout: {:?}", e))
    }
}

fn destroy_shader_modules(shader_manager: &ShaderManager, shaders: Vec<ShaderModule>) {
    for shader in shaders {
        shader_manager.destroy_shader_module(shader);
    }
}

// ===========================================================================
// Compute
// ===========================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl ComputePipeline {
    pub fn new(
        device: &ash::Device,
        shader_manager: &ShaderManager,
        shader: ShaderModule,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self, String> {
        let result = Self::create(device, &shader, set_layouts, push_constant_ranges);
        destroy_shader_modules(shader_manager, vec![shader]);
        result
    }

    fn create(
        device: &ash::Device,
        shader: &ShaderModule,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self, String> {
        let layout = create_pipeline_layout(device, set_layouts, push_constant_ranges)?;

        let specialization = shader.specialization.info();
        let mut stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module)
            .name(c"main");
        if !shader.specialization.is_empty() {
            stage = stage.specialization_info(&specialization);
        }

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        match pipelines {
            Ok(pipelines) => Ok(Self {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(format!("Failed to create compute pipeline: {:?}", e))
            }
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

// ===========================================================================
// Graphics
// ===========================================================================

/// One interleaved vertex buffer binding.
#[derive(Clone, Debug, Default)]
pub struct VertexDescription {
    pub binding: vk::VertexInputBindingDescription,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexDescription {
    /// Tightly packed attributes in `formats` order. Locations continue from `first_location`.
    pub fn interleaved(
        binding: u32,
        input_rate: vk::VertexInputRate,
        first_location: u32,
        formats: &[vk::Format],
    ) -> Result<Self, String> {
        let mut attributes = Vec::with_capacity(formats.len());
        let mut offset = 0;
        for (i, &format) in formats.iter().enumerate() {
            attributes.push(vk::VertexInputAttributeDescription {
                location: first_location + i as u32,
                binding,
                format,
                offset,
            });
            offset += image_helpers::texel_size(format)?;
        }

        Ok(Self {
            binding: vk::VertexInputBindingDescription {
                binding,
                stride: offset,
                input_rate,
            },
            attributes,
        })
    }
}

/// Fixed-function state for a graphics pipeline. Viewport and scissor are dynamic.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineDescription {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub vertex_descriptions: Vec<VertexDescription>,
    pub color_attachment_count: u32,
    pub depth_test: Option<vk::CompareOp>,
    pub depth_write: bool,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl Default for GraphicsPipelineDescription {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            vertex_descriptions: Vec::new(),
            color_attachment_count: 1,
            depth_test: None,
            depth_write: false,
            set_layouts: Vec::new(),
            push_constant_ranges: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    pub fn new(
        device: &ash::Device,
        shader_manager: &ShaderManager,
        render_pass: vk::RenderPass,
        description: &GraphicsPipelineDescription,
        shaders: Vec<ShaderModule>,
    ) -> Result<Self, String> {
        let result = Self::create(device, render_pass, description, &shaders);
        destroy_shader_modules(shader_manager, shaders);
        result
    }

    fn create(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        description: &GraphicsPipelineDescription,
        shaders: &[ShaderModule],
    ) -> Result<Self, String> {
        let layout = create_pipeline_layout(
            device,
            &description.set_layouts,
            &description.push_constant_ranges,
        )?;

        let specializations: Vec<vk::SpecializationInfo> = shaders
            .iter()
            .map(|shader| shader.specialization.info())
            .collect();

        let shader_stages: Vec<vk::PipelineShaderStageCreateInfo> = shaders
            .iter()
            .zip(&specializations)
            .map(|(shader, specialization)| {
                let stage = vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader.stage)
                    .module(shader.module)
                    .name(c"main");
                if shader.specialization.is_empty() {
                    stage
                } else {
                    stage.specialization_info(specialization)
                }
            })
            .collect();

        let bindings: Vec<vk::VertexInputBindingDescription> = description
            .vertex_descriptions
            .iter()
            .map(|vertex| vertex.binding)
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = description
            .vertex_descriptions
            .iter()
            .flat_map(|vertex| vertex.attributes.iter().copied())
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(description.topology);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(description.polygon_mode)
            .cull_mode(description.cull_mode)
            .front_face(description.front_face)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(description.depth_test.is_some())
            .depth_write_enable(description.depth_write)
            .depth_compare_op(description.depth_test.unwrap_or(vk::CompareOp::ALWAYS));

        let blend_attachments = vec![
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA);
            description.color_attachment_count as usize
        ];
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        match pipelines {
            Ok(pipelines) => Ok(Self {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(format!("Failed to create graphics pipeline: {:?}", e))
            }
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Set a full-extent viewport and scissor on a pipeline with dynamic viewport state.
pub fn set_viewport_and_scissor(device: &ash::Device, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
    let viewport = vk::Viewport::default()
        .width(extent.width as f32)
        .height(extent.height as f32)
        .max_depth(1.0);
    let scissor = vk::Rect2D::default().extent(extent);

    unsafe {
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[scissor]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_groups_cover_full_hd() {
        assert_eq!(
            calculate_work_group_count(vk::Extent2D { width: 1920, height: 1080 }, [8, 8]),
            [240, 135, 1]
        );
    }

    #[test]
    fn work_groups_round_up() {
        assert_eq!(
            calculate_work_group_count(vk::Extent2D { width: 1921, height: 1 }, [8, 8]),
            [241, 1, 1]
        );
        assert_eq!(
            calculate_work_group_count(vk::Extent2D { width: 128, height: 128 }, [8, 8]),
            [16, 16, 1]
        );
    }

    #[test]
    fn interleaved_vertex_offsets_follow_formats() {
        let description = VertexDescription::interleaved(
            0,
            vk::VertexInputRate::VERTEX,
            0,
            &[
                vk::Format::R32G32B32_SFLOAT,
                vk::Format::R32G32B32_SFLOAT,
                vk::Format::R32G32_SFLOAT,
                vk::Format::R32G32B32A32_SFLOAT,
            ],
        )
        .unwrap();

        let offsets: Vec<u32> = description.attributes.iter().map(|a| a.offset).collect();
        let locations: Vec<u32> = description.attributes.iter().map(|a| a.location).collect();
        assert_eq!(offsets, vec![0, 12, 24, 32]);
        assert_eq!(locations, vec![0, 1, 2, 3]);
        assert_eq!(description.binding.stride, 48);
    }

    #[test]
    fn instance_attributes_continue_locations() {
        let description = VertexDescription::interleaved(
            1,
            vk::VertexInputRate::INSTANCE,
            2,
            &[vk::Format::R32G32B32_SFLOAT],
        )
        .unwrap();
        assert_eq!(description.attributes[0].location, 2);
        assert_eq!(description.attributes[0].binding, 1);
        assert_eq!(description.binding.input_rate, vk::VertexInputRate::INSTANCE);
    }
}
