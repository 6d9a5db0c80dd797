//! Image utilities: format queries, mip math, views, render targets and
//! layout transitions expressed as explicit wait/block scopes.

use ash::vk;
use log::debug;

use crate::buffer_helpers;
use crate::memory_manager::ImageDescription;
use crate::vulkan_context::VulkanContext;

pub const CUBE_FACE_COUNT: u32 = 6;

// ===========================================================================
// Synchronization scopes
// ===========================================================================

/// Pipeline stages plus the memory accesses performed in them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncScope {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

impl SyncScope {
    pub const fn new(stages: vk::PipelineStageFlags, access: vk::AccessFlags) -> Self {
        Self { stages, access }
    }

    pub const fn union(self, other: SyncScope) -> Self {
        Self::new(
            vk::PipelineStageFlags::from_raw(self.stages.as_raw() | other.stages.as_raw()),
            vk::AccessFlags::from_raw(self.access.as_raw() | other.access.as_raw()),
        )
    }

    pub const WAIT_FOR_NONE: SyncScope =
        SyncScope::new(vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty());
    pub const BLOCK_NONE: SyncScope =
        SyncScope::new(vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty());
    pub const TRANSFER_WRITE: SyncScope =
        SyncScope::new(vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE);
    pub const TRANSFER_READ: SyncScope =
        SyncScope::new(vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ);
    pub const COMPUTE_SHADER_WRITE: SyncScope =
        SyncScope::new(vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_WRITE);
    pub const COMPUTE_SHADER_READ: SyncScope =
        SyncScope::new(vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_READ);
    pub const COLOR_ATTACHMENT_WRITE: SyncScope = SyncScope::new(
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    );
    pub const DEPTH_ATTACHMENT_WRITE: SyncScope = SyncScope::new(
        vk::PipelineStageFlags::from_raw(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
    );
    pub const DEPTH_ATTACHMENT_READ: SyncScope = SyncScope::new(
        vk::PipelineStageFlags::from_raw(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
    );
    /// Uniform reads from any shader stage.
    pub const UNIFORM_READ: SyncScope = SyncScope::new(
        vk::PipelineStageFlags::from_raw(
            vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
                | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
                | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
        ),
        vk::AccessFlags::UNIFORM_READ,
    );
    /// Sampled reads from either graphics or compute.
    pub const SHADER_READ: SyncScope = SyncScope::new(
        vk::PipelineStageFlags::from_raw(
            vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
                | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
        ),
        vk::AccessFlags::SHADER_READ,
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineBarrier {
    pub wait: SyncScope,
    pub block: SyncScope,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageLayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub barrier: PipelineBarrier,
}

impl ImageLayoutTransition {
    pub const fn new(
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        wait: SyncScope,
        block: SyncScope,
    ) -> Self {
        Self {
            old_layout,
            new_layout,
            barrier: PipelineBarrier { wait, block },
        }
    }
}

// ===========================================================================
// Textures and subresources
// ===========================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Texture {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampledTexture {
    pub texture: Texture,
    pub sampler: vk::Sampler,
}

pub const FLAT_COLOR: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub const CUBE_COLOR: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: CUBE_FACE_COUNT,
};

/// Aspects a view or barrier over the whole texel of `format` must name.
pub fn image_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Single mip, single layer range over every aspect of `format`.
pub fn format_subresource_range(format: vk::Format) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: image_aspect(format),
        ..FLAT_COLOR
    }
}

/// Size in bytes of one texel. Block-compressed and exotic formats are rejected.
pub fn texel_size(format: vk::Format) -> Result<u32, String> {
    use vk::Format as F;

    let size = match format {
        F::UNDEFINED => 0,

        F::R4G4_UNORM_PACK8 => 1,

        F::R4G4B4A4_UNORM_PACK16
        | F::B4G4R4A4_UNORM_PACK16
        | F::R5G6B5_UNORM_PACK16
        | F::B5G6R5_UNORM_PACK16
        | F::R5G5B5A1_UNORM_PACK16
        | F::B5G5R5A1_UNORM_PACK16
        | F::A1R5G5B5_UNORM_PACK16 => 2,

        F::R8_UNORM | F::R8_SNORM | F::R8_USCALED | F::R8_SSCALED | F::R8_UINT | F::R8_SINT
        | F::R8_SRGB => 1,

        F::R8G8_UNORM
        | F::R8G8_SNORM
        | F::R8G8_USCALED
        | F::R8G8_SSCALED
        | F::R8G8_UINT
        | F::R8G8_SINT
        | F::R8G8_SRGB => 2,

        F::R8G8B8_UNORM
        | F::R8G8B8_SNORM
        | F::R8G8B8_USCALED
        | F::R8G8B8_SSCALED
        | F::R8G8B8_UINT
        | F::R8G8B8_SINT
        | F::R8G8B8_SRGB
        | F::B8G8R8_UNORM
        | F::B8G8R8_SNORM
        | F::B8G8R8_USCALED
        | F::B8G8R8_SSCALED
        | F::B8G8R8_UINT
        | F::B8G8R8_SINT
        | F::B8G8R8_SRGB => 3,

        F::R8G8B8A8_UNORM
        | F::R8G8B8A8_SNORM
        | F::R8G8B8A8_USCALED
        | F::R8G8B8A8_SSCALED
        | F::R8G8B8A8_UINT
        | F::R8G8B8A8_SINT
        | F::R8G8B8A8_SRGB
        | F::B8G8R8A8_UNORM
        | F::B8G8R8A8_SNORM
        | F::B8G8R8A8_USCALED
        | F::B8G8R8A8_SSCALED
        | F::B8G8R8A8_UINT
        | F::B8G8R8A8_SINT
        | F::B8G8R8A8_SRGB
        | F::A8B8G8R8_UNORM_PACK32
        | F::A8B8G8R8_SNORM_PACK32
        | F::A8B8G8R8_USCALED_PACK32
        | F::A8B8G8R8_SSCALED_PACK32
        | F::A8B8G8R8_UINT_PACK32
        | F::A8B8G8R8_SINT_PACK32
        | F::A8B8G8R8_SRGB_PACK32 => 4,

        F::A2R10G10B10_UNORM_PACK32
        | F::A2R10G10B10_SNORM_PACK32
        | F::A2R10G10B10_USCALED_PACK32
        | F::A2R10G10B10_SSCALED_PACK32
        | F::A2R10G10B10_UINT_PACK32
        | F::A2R10G10B10_SINT_PACK32
        | F::A2B10G10R10_UNORM_PACK32
        | F::A2B10G10R10_SNORM_PACK32
        | F::A2B10G10R10_USCALED_PACK32
        | F::A2B10G10R10_SSCALED_PACK32
        | F::A2B10G10R10_UINT_PACK32
        | F::A2B10G10R10_SINT_PACK32 => 4,

        F::R16_UNORM
        | F::R16_SNORM
        | F::R16_USCALED
        | F::R16_SSCALED
        | F::R16_UINT
        | F::R16_SINT
        | F::R16_SFLOAT => 2,

        F::R16G16_UNORM
        | F::R16G16_SNORM
        | F::R16G16_USCALED
        | F::R16G16_SSCALED
        | F::R16G16_UINT
        | F::R16G16_SINT
        | F::R16G16_SFLOAT => 4,

        F::R16G16B16_UNORM
        | F::R16G16B16_SNORM
        | F::R16G16B16_USCALED
        | F::R16G16B16_SSCALED
        | F::R16G16B16_UINT
        | F::R16G16B16_SINT
        | F::R16G16B16_SFLOAT => 6,

        F::R16G16B16A16_UNORM
        | F::R16G16B16A16_SNORM
        | F::R16G16B16A16_USCALED
        | F::R16G16B16A16_SSCALED
        | F::R16G16B16A16_UINT
        | F::R16G16B16A16_SINT
        | F::R16G16B16A16_SFLOAT => 8,

        F::R32_UINT | F::R32_SINT | F::R32_SFLOAT => 4,
        F::R32G32_UINT | F::R32G32_SINT | F::R32G32_SFLOAT => 8,
        F::R32G32B32_UINT | F::R32G32B32_SINT | F::R32G32B32_SFLOAT => 12,
        F::R32G32B32A32_UINT | F::R32G32B32A32_SINT | F::R32G32B32A32_SFLOAT => 16,

        F::R64_UINT | F::R64_SINT | F::R64_SFLOAT => 8,
        F::R64G64_UINT | F::R64G64_SINT | F::R64G64_SFLOAT => 16,
        F::R64G64B64_UINT | F::R64G64B64_SINT | F::R64G64B64_SFLOAT => 24,
        F::R64G64B64A64_UINT | F::R64G64B64A64_SINT | F::R64G64B64A64_SFLOAT => 32,

        F::B10G11R11_UFLOAT_PACK32 | F::E5B9G9R9_UFLOAT_PACK32 => 4,

        F::D16_UNORM => 2,
        F::X8_D24_UNORM_PACK32 => 4,
        F::D32_SFLOAT => 4,
        F::S8_UINT => 1,
        F::D16_UNORM_S8_UINT => 3,
        F::D24_UNORM_S8_UINT => 4,
        F::D32_SFLOAT_S8_UINT => 5,

        other => return Err(format!("Unsupported format for texel size: {:?}", other)),
    };

    Ok(size)
}

/// Layers of `range` at a single mip level.
pub fn subresource_layers(
    range: &vk::ImageSubresourceRange,
    mip_level: u32,
) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: range.aspect_mask,
        mip_level,
        base_array_layer: range.base_array_layer,
        layer_count: range.layer_count,
    }
}

/// Single-level range covering `layers`.
pub fn subresource_range(layers: &vk::ImageSubresourceLayers) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: layers.aspect_mask,
        base_mip_level: layers.mip_level,
        level_count: 1,
        base_array_layer: layers.base_array_layer,
        layer_count: layers.layer_count,
    }
}

// ---------------------------------------------------------------------------
// Mip math
// ---------------------------------------------------------------------------

fn mip_count_for(max_size: u32) -> u32 {
    u32::BITS - max_size.max(1).leading_zeros()
}

fn mip_dimension(size: u32, mip_level: u32) -> u32 {
    size.checked_shr(mip_level).unwrap_or(0).max(1)
}

/// `1 + floor(log2(max(width, height)))`
pub fn mip_level_count(extent: vk::Extent2D) -> u32 {
    mip_count_for(extent.width.max(extent.height))
}

pub fn mip_level_extent(extent: vk::Extent2D, mip_level: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: mip_dimension(extent.width, mip_level),
        height: mip_dimension(extent.height, mip_level),
    }
}

pub fn mip_level_extent_3d(extent: vk::Extent3D, mip_level: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: mip_dimension(extent.width, mip_level),
        height: mip_dimension(extent.height, mip_level),
        depth: mip_dimension(extent.depth, mip_level),
    }
}

/// Texels in one mip level across all array layers.
pub fn mip_level_texel_count(description: &ImageDescription, mip_level: u32) -> u64 {
    let extent = mip_level_extent_3d(description.extent, mip_level);
    extent.width as u64 * extent.height as u64 * extent.depth as u64 * description.array_layers as u64
}

pub fn mip_level_size(description: &ImageDescription, mip_level: u32) -> Result<u64, String> {
    Ok(mip_level_texel_count(description, mip_level) * texel_size(description.format)? as u64)
}

pub fn extent_3d(extent: vk::Extent2D) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: 1,
    }
}

// ===========================================================================
// Views and targets
// ===========================================================================

pub fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    view_type: vk::ImageViewType,
    format: vk::Format,
    subresource_range: vk::ImageSubresourceRange,
) -> Result<vk::ImageView, String> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(subresource_range);

    unsafe {
        device
            .create_image_view(&view_info, None)
            .map_err(|e| format!("Failed to create image view: {:?}", e))
    }
}

/// One 2D view per cube face at `mip_level`. The image must be a cube.
pub fn create_cube_face_views(
    ctx: &VulkanContext,
    image: vk::Image,
    mip_level: u32,
) -> Result<[vk::ImageView; CUBE_FACE_COUNT as usize], String> {
    let description = ctx.memory_manager.image_description(image);
    assert!(
        description.is_cube(),
        "Cube face views requested for an image that is not a cube"
    );

    let mut views = [vk::ImageView::null(); CUBE_FACE_COUNT as usize];
    for face in 0..CUBE_FACE_COUNT {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: mip_level,
            level_count: 1,
            base_array_layer: face,
            layer_count: 1,
        };

        match create_image_view(
            &ctx.device,
            image,
            vk::ImageViewType::TYPE_2D,
            description.format,
            range,
        ) {
            Ok(view) => views[face as usize] = view,
            Err(e) => {
                destroy_image_views(&ctx.device, &views[..face as usize]);
                return Err(e);
            }
        }
    }

    Ok(views)
}

pub fn destroy_image_views(device: &ash::Device, views: &[vk::ImageView]) {
    for &view in views {
        unsafe { device.destroy_image_view(view, None) };
    }
}

/// Single-sample, single-level device-local 2D target with a matching view.
pub fn create_render_target(
    ctx: &mut VulkanContext,
    format: vk::Format,
    extent: vk::Extent2D,
    usage: vk::ImageUsageFlags,
    name: &str,
) -> Result<Texture, String> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(extent_3d(extent))
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = ctx
        .memory_manager
        .create_image(&image_info, vk::MemoryPropertyFlags::DEVICE_LOCAL, name)?;

    let range = format_subresource_range(format);

    match create_image_view(&ctx.device, image, vk::ImageViewType::TYPE_2D, format, range) {
        Ok(view) => Ok(Texture { image, view }),
        Err(e) => {
            ctx.memory_manager.destroy_image(image);
            Err(e)
        }
    }
}

/// Destroy the primary view and the image together with its memory.
pub fn destroy_texture(ctx: &mut VulkanContext, texture: &Texture) {
    unsafe { ctx.device.destroy_image_view(texture.view, None) };
    ctx.memory_manager.destroy_image(texture.image);
}

// ===========================================================================
// Commands
// ===========================================================================

pub fn transit_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    subresource_range: vk::ImageSubresourceRange,
    transition: &ImageLayoutTransition,
) {
    let PipelineBarrier { wait, block } = transition.barrier;

    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(wait.access)
        .dst_access_mask(block.access)
        .old_layout(transition.old_layout)
        .new_layout(transition.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            wait.stages,
            block.stages,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Fill the mip chain of `range` by successive linear blits.
///
/// Expects the base level in TRANSFER_SRC_OPTIMAL and the rest in
/// TRANSFER_DST_OPTIMAL. On return every level except the last is in
/// TRANSFER_SRC_OPTIMAL and the last one stays in TRANSFER_DST_OPTIMAL.
pub fn generate_mip_levels(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    extent: vk::Extent3D,
    range: vk::ImageSubresourceRange,
) {
    let level_ready = ImageLayoutTransition::new(
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        SyncScope::TRANSFER_WRITE,
        SyncScope::TRANSFER_READ,
    );

    let first = range.base_mip_level;
    let last = first + range.level_count.saturating_sub(1);

    let mut src_extent = mip_level_extent_3d(extent, first);
    for mip in first..last {
        let src_layers = subresource_layers(&range, mip);
        let dst_layers = subresource_layers(&range, mip + 1);
        let dst_extent = mip_level_extent_3d(extent, mip + 1);

        let region = vk::ImageBlit {
            src_subresource: src_layers,
            src_offsets: [vk::Offset3D::default(), offset_3d(src_extent)],
            dst_subresource: dst_layers,
            dst_offsets: [vk::Offset3D::default(), offset_3d(dst_extent)],
        };

        unsafe {
            device.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            );
        }

        if mip + 1 < last {
            transit_image_layout(
                device,
                cmd,
                image,
                subresource_range(&dst_layers),
                &level_ready,
            );
        }

        src_extent = dst_extent;
    }
}

fn offset_3d(extent: vk::Extent3D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: extent.depth as i32,
    }
}

// ===========================================================================
// Uploads
// ===========================================================================

/// Parameters for a sampled texture created from level-0 data.
#[derive(Clone, Copy, Debug)]
pub struct TextureDescription {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub cube: bool,
    pub generate_mips: bool,
    /// Replace the generated levels below the base with solid debug colours.
    pub debug_mip_colors: bool,
    pub usage: vk::ImageUsageFlags,
}

/// Create a sampled texture from tightly packed level-0 data for every layer,
/// optionally generating the full mip chain. Ends in SHADER_READ_ONLY_OPTIMAL.
pub fn create_texture_with_data(
    ctx: &mut VulkanContext,
    description: &TextureDescription,
    data: &[u8],
    name: &str,
) -> Result<Texture, String> {
    let layer_count = if description.cube { CUBE_FACE_COUNT } else { 1 };
    let mip_levels = if description.generate_mips {
        mip_level_count(description.extent)
    } else {
        1
    };

    let expected = description.extent.width as u64
        * description.extent.height as u64
        * layer_count as u64
        * texel_size(description.format)? as u64;
    assert_eq!(
        data.len() as u64,
        expected,
        "Texture '{}' data size does not match its description",
        name
    );

    let mut usage = description.usage
        | vk::ImageUsageFlags::SAMPLED
        | vk::ImageUsageFlags::TRANSFER_DST;
    if mip_levels > 1 {
        usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }

    let flags = if description.cube {
        vk::ImageCreateFlags::CUBE_COMPATIBLE
    } else {
        vk::ImageCreateFlags::empty()
    };

    let image_info = vk::ImageCreateInfo::default()
        .flags(flags)
        .image_type(vk::ImageType::TYPE_2D)
        .format(description.format)
        .extent(extent_3d(description.extent))
        .mip_levels(mip_levels)
        .array_layers(layer_count)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let staging = buffer_helpers::create_buffer_with_data(
        ctx,
        data,
        vk::BufferUsageFlags::TRANSFER_SRC,
        &format!("{} staging", name),
    )?;

    let image = match ctx.memory_manager.create_image(
        &image_info,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        name,
    ) {
        Ok(image) => image,
        Err(e) => {
            ctx.memory_manager.destroy_buffer(staging);
            return Err(e);
        }
    };

    let full_range = vk::ImageSubresourceRange {
        aspect_mask: image_aspect(description.format),
        base_mip_level: 0,
        level_count: mip_levels,
        base_array_layer: 0,
        layer_count,
    };
    let base_layers = subresource_layers(&full_range, 0);
    let extent = extent_3d(description.extent);

    let uploaded = ctx.execute_one_time_commands(|cmd| {
        let device = &ctx.device;

        transit_image_layout(
            device,
            cmd,
            image,
            full_range,
            &ImageLayoutTransition::new(
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                SyncScope::WAIT_FOR_NONE,
                SyncScope::TRANSFER_WRITE,
            ),
        );

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .image_subresource(base_layers)
            .image_extent(extent);
        unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                staging,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        if mip_levels > 1 {
            transit_image_layout(
                device,
                cmd,
                image,
                subresource_range(&base_layers),
                &ImageLayoutTransition::new(
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    SyncScope::TRANSFER_WRITE,
                    SyncScope::TRANSFER_READ,
                ),
            );

            generate_mip_levels(device, cmd, image, extent, full_range);

            let mut source_levels = full_range;
            source_levels.level_count = mip_levels - 1;
            transit_image_layout(
                device,
                cmd,
                image,
                source_levels,
                &ImageLayoutTransition::new(
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    SyncScope::TRANSFER_READ,
                    SyncScope::SHADER_READ,
                ),
            );
        }

        let mut last_level = full_range;
        last_level.base_mip_level = mip_levels - 1;
        last_level.level_count = 1;
        transit_image_layout(
            device,
            cmd,
            image,
            last_level,
            &ImageLayoutTransition::new(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                SyncScope::TRANSFER_WRITE,
                SyncScope::SHADER_READ,
            ),
        );

        Ok(())
    });

    ctx.memory_manager.destroy_buffer(staging);
    if let Err(e) = uploaded {
        ctx.memory_manager.destroy_image(image);
        return Err(e);
    }

    let view_type = if description.cube {
        vk::ImageViewType::CUBE
    } else {
        vk::ImageViewType::TYPE_2D
    };

    if description.debug_mip_colors && mip_levels > 1 {
        let mut lower_levels = full_range;
        lower_levels.base_mip_level = 1;
        lower_levels.level_count = mip_levels - 1;
        if let Err(e) = fill_mip_levels_with_debug_colors(ctx, image, lower_levels) {
            ctx.memory_manager.destroy_image(image);
            return Err(e);
        }
    }

    match create_image_view(&ctx.device, image, view_type, description.format, full_range) {
        Ok(view) => {
            debug!(
                "Created texture '{}' ({}x{}, {} layers, {} mips)",
                name, description.extent.width, description.extent.height, layer_count, mip_levels
            );
            Ok(Texture { image, view })
        }
        Err(e) => {
            ctx.memory_manager.destroy_image(image);
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Debug mip visualisation
// ---------------------------------------------------------------------------

const MIP_LEVEL_COLORS: [[f32; 4]; 6] = [
    [1.0, 0.0, 0.0, 1.0],
    [1.0, 1.0, 0.0, 1.0],
    [0.0, 1.0, 0.0, 1.0],
    [0.0, 1.0, 1.0, 1.0],
    [0.0, 0.0, 1.0, 1.0],
    [1.0, 0.0, 1.0, 1.0],
];

pub fn float_to_unorm(value: f32) -> u8 {
    (value * u8::MAX as f32).clamp(0.0, u8::MAX as f32) as u8
}

pub fn float4_to_unorm(value: [f32; 4]) -> [u8; 4] {
    value.map(float_to_unorm)
}

/// Solid-colour contents for one mip level. The colour cycles with the level index.
pub fn debug_mip_level_data(
    format: vk::Format,
    texel_count: u64,
    mip_level: u32,
) -> Result<Vec<u8>, String> {
    let color = MIP_LEVEL_COLORS[mip_level as usize % MIP_LEVEL_COLORS.len()];

    let texel: Vec<u8> = match format {
        vk::Format::R32G32B32A32_SFLOAT => bytemuck::cast_slice::<f32, u8>(&color).to_vec(),
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => {
            float4_to_unorm(color).to_vec()
        }
        other => return Err(format!("Unsupported format for debug mip colors: {:?}", other)),
    };

    Ok(texel.repeat(texel_count as usize))
}

/// Overwrite every level of `range` with its debug colour.
/// The levels are expected in SHADER_READ_ONLY_OPTIMAL and are returned there.
pub fn fill_mip_levels_with_debug_colors(
    ctx: &mut VulkanContext,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
) -> Result<(), String> {
    let description = ctx.memory_manager.image_description(image);

    let mut data = Vec::new();
    let mut regions = Vec::with_capacity(range.level_count as usize);
    for i in 0..range.level_count {
        let mip_level = range.base_mip_level + i;
        let level_data = debug_mip_level_data(
            description.format,
            mip_level_texel_count(&description, mip_level),
            mip_level,
        )?;
        debug_assert_eq!(level_data.len() as u64, mip_level_size(&description, mip_level)?);

        regions.push(
            vk::BufferImageCopy::default()
                .buffer_offset(data.len() as u64)
                .image_subresource(subresource_layers(&range, mip_level))
                .image_extent(mip_level_extent_3d(description.extent, mip_level)),
        );
        data.extend_from_slice(&level_data);
    }

    let staging = buffer_helpers::create_buffer_with_data(
        ctx,
        &data,
        vk::BufferUsageFlags::TRANSFER_SRC,
        "debug mip colors",
    )?;

    let copied = ctx.execute_one_time_commands(|cmd| {
        let device = &ctx.device;
        transit_image_layout(
            device,
            cmd,
            image,
            range,
            &ImageLayoutTransition::new(
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                SyncScope::SHADER_READ,
                SyncScope::TRANSFER_WRITE,
            ),
        );
        unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                staging,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );
        }
        transit_image_layout(
            device,
            cmd,
            image,
            range,
            &ImageLayoutTransition::new(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                SyncScope::TRANSFER_WRITE,
                SyncScope::SHADER_READ,
            ),
        );
        Ok(())
    });

    ctx.memory_manager.destroy_buffer(staging);
    copied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_extent_halves_and_clamps() {
        let extent = vk::Extent2D { width: 7, height: 7 };
        assert_eq!(mip_level_extent(extent, 1), vk::Extent2D { width: 3, height: 3 });
        assert_eq!(mip_level_extent(extent, 2), vk::Extent2D { width: 1, height: 1 });
        assert_eq!(mip_level_extent(extent, 3), vk::Extent2D { width: 1, height: 1 });
        assert_eq!(mip_level_extent(extent, 40), vk::Extent2D { width: 1, height: 1 });
    }

    #[test]
    fn mip_extent_3d_keeps_depth_at_least_one() {
        let extent = vk::Extent3D { width: 16, height: 4, depth: 1 };
        assert_eq!(
            mip_level_extent_3d(extent, 3),
            vk::Extent3D { width: 2, height: 1, depth: 1 }
        );
    }

    #[test]
    fn mip_count_uses_largest_dimension() {
        assert_eq!(mip_level_count(vk::Extent2D { width: 1024, height: 512 }), 11);
        assert_eq!(mip_level_count(vk::Extent2D { width: 1, height: 1 }), 1);
        assert_eq!(mip_level_count(vk::Extent2D { width: 300, height: 17 }), 9);
    }

    #[test]
    fn subresource_round_trip_keeps_layers_and_selects_mip() {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 9,
            base_array_layer: 2,
            layer_count: 4,
        };
        let recovered = subresource_range(&subresource_layers(&range, 5));

        assert_eq!(recovered.aspect_mask, range.aspect_mask);
        assert_eq!(recovered.base_array_layer, 2);
        assert_eq!(recovered.layer_count, 4);
        assert_eq!(recovered.base_mip_level, 5);
        assert_eq!(recovered.level_count, 1);
    }

    #[test]
    fn texel_sizes_of_common_formats() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM), Ok(4));
        assert_eq!(texel_size(vk::Format::R16G16_SFLOAT), Ok(4));
        assert_eq!(texel_size(vk::Format::R16G16B16A16_SFLOAT), Ok(8));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Ok(16));
        assert_eq!(texel_size(vk::Format::D32_SFLOAT_S8_UINT), Ok(5));
        assert_eq!(texel_size(vk::Format::UNDEFINED), Ok(0));
    }

    #[test]
    fn unknown_format_is_reported() {
        assert!(texel_size(vk::Format::BC7_UNORM_BLOCK).is_err());
    }

    #[test]
    fn depth_formats_are_recognised() {
        assert_eq!(image_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(image_aspect(vk::Format::X8_D24_UNORM_PACK32), vk::ImageAspectFlags::DEPTH);
        assert_eq!(image_aspect(vk::Format::R32_SFLOAT), vk::ImageAspectFlags::COLOR);
        assert_eq!(
            image_aspect(vk::Format::R16G16B16A16_SFLOAT),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn combined_depth_stencil_formats_name_both_aspects() {
        let both = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;
        for format in [
            vk::Format::D16_UNORM_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
            vk::Format::D32_SFLOAT_S8_UINT,
        ] {
            assert_eq!(image_aspect(format), both, "{:?}", format);
        }
    }

    #[test]
    fn depth_stencil_target_range_covers_stencil() {
        let range = format_subresource_range(vk::Format::D24_UNORM_S8_UINT);
        assert!(range.aspect_mask.contains(vk::ImageAspectFlags::STENCIL));
        assert!(range.aspect_mask.contains(vk::ImageAspectFlags::DEPTH));
        assert_eq!((range.level_count, range.layer_count), (1, 1));

        assert_eq!(
            format_subresource_range(vk::Format::R8G8B8A8_UNORM).aspect_mask,
            FLAT_COLOR.aspect_mask
        );
    }

    #[test]
    fn mip_level_size_counts_all_layers() {
        let description = ImageDescription {
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D { width: 8, height: 8, depth: 1 },
            mip_levels: 4,
            array_layers: 6,
            flags: vk::ImageCreateFlags::CUBE_COMPATIBLE,
        };
        assert_eq!(mip_level_texel_count(&description, 1), 4 * 4 * 6);
        assert_eq!(mip_level_size(&description, 1), Ok(4 * 4 * 6 * 4));
    }

    #[test]
    fn unorm_conversion_clamps() {
        assert_eq!(float_to_unorm(0.0), 0);
        assert_eq!(float_to_unorm(1.0), 255);
        assert_eq!(float_to_unorm(2.0), 255);
        assert_eq!(float_to_unorm(-1.0), 0);
        assert_eq!(float4_to_unorm([1.0, 0.5, 0.0, 1.0]), [255, 127, 0, 255]);
    }

    #[test]
    fn debug_colors_cycle_per_level() {
        let level0 = debug_mip_level_data(vk::Format::R8G8B8A8_UNORM, 2, 0).unwrap();
        assert_eq!(level0, vec![255, 0, 0, 255, 255, 0, 0, 255]);

        let level7 = debug_mip_level_data(vk::Format::R8G8B8A8_UNORM, 1, 7).unwrap();
        assert_eq!(level7, vec![255, 255, 0, 255]);

        let srgb = debug_mip_level_data(vk::Format::R8G8B8A8_SRGB, 1, 2).unwrap();
        assert_eq!(srgb, vec![0, 255, 0, 255]);

        let float = debug_mip_level_data(vk::Format::R32G32B32A32_SFLOAT, 3, 4).unwrap();
        assert_eq!(float.len(), 3 * 16);

        assert!(debug_mip_level_data(vk::Format::R16G16_SFLOAT, 1, 0).is_err());
    }

    #[test]
    fn depth_attachment_scope_covers_both_fragment_test_stages() {
        let stages = SyncScope::DEPTH_ATTACHMENT_WRITE.stages;
        assert!(stages.contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));
        assert!(stages.contains(vk::PipelineStageFlags::LATE_FRAGMENT_TESTS));
    }

    #[test]
    fn union_merges_stages_and_access() {
        let merged = SyncScope::COLOR_ATTACHMENT_WRITE.union(SyncScope::DEPTH_ATTACHMENT_WRITE);
        assert!(merged.stages.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
        assert!(merged.stages.contains(vk::PipelineStageFlags::LATE_FRAGMENT_TESTS));
        assert!(merged.access.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
        assert!(merged.access.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }
}
