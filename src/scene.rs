//! Scene state consumed by the render stages.
//!
//! A `Scene` owns its GPU resources: light and material uniforms, base-colour
//! textures, mesh buffers, the environment maps, the optional light volume and,
//! when ray tracing is enabled, the acceleration structures with the mesh data
//! the hit shading reads. `SceneContent` is the CPU-side description it is
//! uploaded from.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec3, Vec4};
use log::{debug, info};

use crate::acceleration_structures::{AccelerationStructureManager, BlasGeometryData, TlasInstanceData};
use crate::buffer_helpers;
use crate::camera::Camera;
use crate::config::RenderConfig;
use crate::direct_lighting::DirectLighting;
use crate::geometry::{self, PbrVertex};
use crate::ibl::ImageBasedLighting;
use crate::image_helpers::{self, SampledTexture, Texture, TextureDescription};
use crate::scene_binding::SceneId;
use crate::vulkan_context::VulkanContext;

// ===========================================================================
// GPU layouts
// ===========================================================================

/// `location.w` is 0 for directional lights (xyz = direction) and 1 for point lights.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuLight {
    pub location: [f32; 4],
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuMaterial {
    pub base_color_factor: [f32; 4],
    pub emission_factor: [f32; 4],
    pub roughness: f32,
    pub metallic: f32,
    /// Index into the scene textures, -1 for none.
    pub base_color_texture: i32,
    pub _padding: u32,
}

/// Vertex as read by hit shading through a storage buffer (std430).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuRayTracingVertex {
    pub position: [f32; 3],
    pub u: f32,
    pub normal: [f32; 3],
    pub v: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuTetrahedron {
    pub vertices: [i32; 4],
    pub neighbors: [i32; 4],
    /// Maps a world position to its first three barycentric coordinates.
    pub matrix: [f32; 16],
}

/// 9 SH coefficients per probe, RGB padded to vec4.
pub const SH_COEFFICIENT_COUNT: usize = 9;

// ===========================================================================
// Scene content (CPU side)
// ===========================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LightKind {
    Directional { direction: Vec3 },
    Point { position: Vec3 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
}

impl Light {
    pub fn to_gpu(&self) -> GpuLight {
        let location = match self.kind {
            LightKind::Directional { direction } => direction.normalize().extend(0.0),
            LightKind::Point { position } => position.extend(1.0),
        };
        GpuLight {
            location: location.to_array(),
            color: (self.color * self.intensity).extend(0.0).to_array(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    pub base_color: Vec4,
    pub emission: Vec3,
    pub roughness: f32,
    pub metallic: f32,
    pub base_color_texture: Option<u32>,
}

impl Material {
    pub fn to_gpu(&self) -> GpuMaterial {
        GpuMaterial {
            base_color_factor: self.base_color.to_array(),
            emission_factor: self.emission.extend(0.0).to_array(),
            roughness: self.roughness,
            metallic: self.metallic,
            base_color_texture: self.base_color_texture.map_or(-1, |index| index as i32),
            _padding: 0,
        }
    }
}

pub struct TextureData {
    pub extent: vk::Extent2D,
    pub rgba8: Vec<u8>,
}

pub struct MeshData {
    pub vertices: Vec<PbrVertex>,
    pub indices: Vec<u32>,
    pub transform: Mat4,
    pub material: u32,
}

pub struct EnvironmentData {
    pub extent: u32,
    pub sun_direction: Vec3,
    /// Prepend a directional light retrieved from the uploaded cubemap.
    pub retrieve_direct_light: bool,
}

pub struct LightVolumeData {
    pub positions: Vec<Vec3>,
    pub tetrahedra: Vec<[u32; 4]>,
    pub coefficients: Vec<[Vec3; SH_COEFFICIENT_COUNT]>,
}

impl LightVolumeData {
    pub fn gpu_positions(&self) -> Vec<[f32; 4]> {
        self.positions.iter().map(|p| p.extend(1.0).to_array()).collect()
    }

    pub fn gpu_tetrahedra(&self) -> Vec<GpuTetrahedron> {
        let neighbors = geometry::tetrahedral_neighbors(&self.tetrahedra);
        self.tetrahedra
            .iter()
            .zip(neighbors)
            .map(|(tetrahedron, neighbors)| {
                let corners = tetrahedron.map(|i| self.positions[i as usize]);
                GpuTetrahedron {
                    vertices: tetrahedron.map(|i| i as i32),
                    neighbors,
                    matrix: barycentric_matrix(corners).to_cols_array(),
                }
            })
            .collect()
    }

    pub fn gpu_coefficients(&self) -> Vec<[f32; 4]> {
        self.coefficients
            .iter()
            .flat_map(|probe| probe.iter().map(|c| c.extend(0.0).to_array()))
            .collect()
    }
}

/// Bits of a TLAS instance custom index holding the mesh index; the
/// material index sits above them.
pub const INSTANCE_MESH_BITS: u32 = 12;

/// Custom index read by hit shading: which per-mesh buffers to fetch from and
/// which material to shade with. Custom indices have 24 bits.
pub fn instance_custom_index(mesh: u32, material: u32) -> u32 {
    assert!(mesh < 1 << INSTANCE_MESH_BITS, "Too many meshes for ray tracing");
    assert!(
        material < 1 << (24 - INSTANCE_MESH_BITS),
        "Too many materials for ray tracing"
    );
    material << INSTANCE_MESH_BITS | mesh
}

/// Matrix taking a world position to the barycentric weights of corners 0..3;
/// the weight of corner 3 is one minus their sum.
pub fn barycentric_matrix(corners: [Vec3; 4]) -> Mat4 {
    let [p0, p1, p2, p3] = corners;
    let edges = Mat3::from_cols(p0 - p3, p1 - p3, p2 - p3);
    Mat4::from_mat3(edges.inverse()) * Mat4::from_translation(-p3)
}

pub struct SceneContent {
    pub camera: Camera,
    pub lights: Vec<Light>,
    pub materials: Vec<Material>,
    pub textures: Vec<TextureData>,
    pub meshes: Vec<MeshData>,
    pub environment: EnvironmentData,
    pub light_volume: Option<LightVolumeData>,
    /// Upload material textures with solid-colour mip levels.
    pub debug_mip_colors: bool,
}

// ===========================================================================
// Scene (GPU side)
// ===========================================================================

pub struct Mesh {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub transform: Mat4,
    pub material: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Environment {
    pub cubemap: Texture,
    pub irradiance: Texture,
    pub reflection: Texture,
}

pub struct LightVolume {
    pub positions_buffer: vk::Buffer,
    pub tetrahedral_buffer: vk::Buffer,
    pub coefficients_buffer: vk::Buffer,
    pub positions: Vec<Vec3>,
    pub tetrahedra: Vec<[u32; 4]>,
}

impl LightVolume {
    pub fn position_count(&self) -> u32 {
        self.positions.len() as u32
    }

    pub fn tetrahedron_count(&self) -> u32 {
        self.tetrahedra.len() as u32
    }
}

#[derive(Default)]
pub struct RayTracingStorage {
    pub blases: Vec<vk::AccelerationStructureKHR>,
    pub tlas: vk::AccelerationStructureKHR,
    pub index_buffers: Vec<vk::Buffer>,
    pub vertex_buffers: Vec<vk::Buffer>,
}

pub struct Scene {
    id: SceneId,
    pub camera: Camera,
    pub lights: Vec<Light>,
    pub light_buffer: vk::Buffer,
    pub materials: Vec<Material>,
    pub material_buffer: vk::Buffer,
    pub textures: Vec<Texture>,
    pub meshes: Vec<Mesh>,
    pub environment: Environment,
    pub light_volume: Option<LightVolume>,
    pub ray_tracing: Option<RayTracingStorage>,
}

fn destroy_buffer_if_set(ctx: &mut VulkanContext, buffer: vk::Buffer) {
    if buffer != vk::Buffer::null() {
        ctx.memory_manager.destroy_buffer(buffer);
    }
}

fn destroy_texture_if_set(ctx: &mut VulkanContext, texture: &Texture) {
    if texture.image != vk::Image::null() {
        image_helpers::destroy_texture(ctx, texture);
    }
}

impl Scene {
    /// Upload `content`. On failure everything created so far is destroyed.
    pub fn create(
        ctx: &mut VulkanContext,
        as_manager: &mut AccelerationStructureManager,
        ibl: &ImageBasedLighting,
        direct_lighting: &DirectLighting,
        content: &SceneContent,
        ray_tracing_enabled: bool,
    ) -> Result<Self, String> {
        assert!(
            !content.lights.is_empty() || content.environment.retrieve_direct_light,
            "Scene needs at least one light"
        );
        assert!(!content.materials.is_empty(), "Scene needs at least one material");
        assert!(!content.meshes.is_empty(), "Scene needs at least one mesh");
        assert!(!content.textures.is_empty(), "Scene needs at least one texture");

        let mut scene = Scene {
            id: SceneId::next(),
            camera: content.camera,
            lights: content.lights.clone(),
            light_buffer: vk::Buffer::null(),
            materials: content.materials.clone(),
            material_buffer: vk::Buffer::null(),
            textures: Vec::new(),
            meshes: Vec::new(),
            environment: Environment::default(),
            light_volume: None,
            ray_tracing: None,
        };

        match scene.upload(ctx, as_manager, ibl, direct_lighting, content, ray_tracing_enabled) {
            Ok(()) => {
                info!(
                    "Created scene {:?}: {} meshes, {} materials, {} lights, light volume: {}, ray tracing: {}",
                    scene.id,
                    scene.meshes.len(),
                    scene.materials.len(),
                    scene.lights.len(),
                    scene.light_volume.is_some(),
                    scene.ray_tracing.is_some()
                );
                Ok(scene)
            }
            Err(e) => {
                scene.destroy(ctx, as_manager);
                Err(e)
            }
        }
    }

    fn upload(
        &mut self,
        ctx: &mut VulkanContext,
        as_manager: &mut AccelerationStructureManager,
        ibl: &ImageBasedLighting,
        direct_lighting: &DirectLighting,
        content: &SceneContent,
        ray_tracing_enabled: bool,
    ) -> Result<(), String> {
        self.upload_environment(ctx, ibl, &content.environment)?;

        if content.environment.retrieve_direct_light {
            let light = direct_lighting.retrieve_direct_light(ctx, &self.environment.cubemap)?;
            self.lights.insert(0, light);
        }

        let lights: Vec<GpuLight> = self.lights.iter().map(Light::to_gpu).collect();
        self.light_buffer = buffer_helpers::create_buffer_with_data(
            ctx,
            bytemuck::cast_slice(&lights),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "lights",
        )?;

        let materials: Vec<GpuMaterial> = self.materials.iter().map(Material::to_gpu).collect();
        self.material_buffer = buffer_helpers::create_buffer_with_data(
            ctx,
            bytemuck::cast_slice(&materials),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "materials",
        )?;

        for (i, texture) in content.textures.iter().enumerate() {
            let description = TextureDescription {
                format: vk::Format::R8G8B8A8_SRGB,
                extent: texture.extent,
                cube: false,
                generate_mips: true,
                debug_mip_colors: content.debug_mip_colors,
                usage: vk::ImageUsageFlags::empty(),
            };
            let texture = image_helpers::create_texture_with_data(
                ctx,
                &description,
                &texture.rgba8,
                &format!("texture {}", i),
            )?;
            self.textures.push(texture);
        }

        for (i, mesh) in content.meshes.iter().enumerate() {
            self.upload_mesh(ctx, mesh, i)?;
        }

        if let Some(light_volume) = &content.light_volume {
            self.upload_light_volume(ctx, light_volume)?;
        }

        if ray_tracing_enabled {
            self.build_ray_tracing_storage(ctx, as_manager, content)?;
        }

        Ok(())
    }

    fn upload_mesh(&mut self, ctx: &mut VulkanContext, mesh: &MeshData, index: usize) -> Result<(), String> {
        assert!(
            (mesh.material as usize) < self.materials.len(),
            "Mesh {} references missing material {}",
            index,
            mesh.material
        );

        let vertex_buffer = buffer_helpers::create_device_local_buffer_with_data(
            ctx,
            bytemuck::cast_slice(&mesh.vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &format!("mesh {} vertices", index),
        )?;
        let index_buffer = match buffer_helpers::create_device_local_buffer_with_data(
            ctx,
            bytemuck::cast_slice(&mesh.indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
            &format!("mesh {} indices", index),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                ctx.memory_manager.destroy_buffer(vertex_buffer);
                return Err(e);
            }
        };

        self.meshes.push(Mesh {
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
            transform: mesh.transform,
            material: mesh.material,
        });
        Ok(())
    }

    fn upload_environment(
        &mut self,
        ctx: &mut VulkanContext,
        ibl: &ImageBasedLighting,
        environment: &EnvironmentData,
    ) -> Result<(), String> {
        let extent = vk::Extent2D {
            width: environment.extent,
            height: environment.extent,
        };
        let description = TextureDescription {
            format: vk::Format::R16G16B16A16_SFLOAT,
            extent,
            cube: true,
            generate_mips: true,
            debug_mip_colors: false,
            usage: vk::ImageUsageFlags::empty(),
        };
        let data = geometry::generate_sky_cubemap(environment.extent, environment.sun_direction);

        self.environment.cubemap =
            image_helpers::create_texture_with_data(ctx, &description, &data, "environment")?;
        self.environment.irradiance =
            ibl.generate_irradiance_texture(ctx, &self.environment.cubemap)?;
        self.environment.reflection =
            ibl.generate_reflection_texture(ctx, &self.environment.cubemap)?;
        Ok(())
    }

    fn upload_light_volume(
        &mut self,
        ctx: &mut VulkanContext,
        data: &LightVolumeData,
    ) -> Result<(), String> {
        assert_eq!(
            data.positions.len(),
            data.coefficients.len(),
            "Light volume needs one SH probe per position"
        );

        let mut light_volume = LightVolume {
            positions_buffer: vk::Buffer::null(),
            tetrahedral_buffer: vk::Buffer::null(),
            coefficients_buffer: vk::Buffer::null(),
            positions: data.positions.clone(),
            tetrahedra: data.tetrahedra.clone(),
        };

        let usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::VERTEX_BUFFER;
        let created = buffer_helpers::create_device_local_buffer_with_data(
            ctx,
            bytemuck::cast_slice(&data.gpu_positions()),
            usage,
            "light volume positions",
        )
        .and_then(|buffer| {
            light_volume.positions_buffer = buffer;
            buffer_helpers::create_device_local_buffer_with_data(
                ctx,
                bytemuck::cast_slice(&data.gpu_tetrahedra()),
                usage,
                "light volume tetrahedra",
            )
        })
        .and_then(|buffer| {
            light_volume.tetrahedral_buffer = buffer;
            buffer_helpers::create_device_local_buffer_with_data(
                ctx,
                bytemuck::cast_slice(&data.gpu_coefficients()),
                usage,
                "light volume coefficients",
            )
        })
        .map(|buffer| light_volume.coefficients_buffer = buffer);

        // Stored even on failure so `destroy` releases the buffers created so far.
        if created.is_ok() {
            debug!(
                "Light volume: {} probes, {} tetrahedra",
                light_volume.position_count(),
                light_volume.tetrahedron_count()
            );
        }
        self.light_volume = Some(light_volume);
        created
    }

    fn build_ray_tracing_storage(
        &mut self,
        ctx: &mut VulkanContext,
        as_manager: &mut AccelerationStructureManager,
        content: &SceneContent,
    ) -> Result<(), String> {
        let storage = self.ray_tracing.insert(RayTracingStorage::default());

        let mut instances = Vec::with_capacity(content.meshes.len());
        for (i, mesh) in content.meshes.iter().enumerate() {
            let blas = as_manager.generate_blas(
                ctx,
                &BlasGeometryData {
                    vertices: bytemuck::cast_slice(&mesh.vertices),
                    indices: bytemuck::cast_slice(&mesh.indices),
                    vertex_format: vk::Format::R32G32B32_SFLOAT,
                    vertex_stride: std::mem::size_of::<PbrVertex>() as u64,
                    vertex_count: mesh.vertices.len() as u32,
                    index_type: vk::IndexType::UINT32,
                    index_count: mesh.indices.len() as u32,
                },
            )?;
            storage.blases.push(blas);

            instances.push(TlasInstanceData {
                blas,
                transform: mesh.transform,
                custom_index: instance_custom_index(i as u32, mesh.material),
                mask: 0xFF,
                sbt_record_offset: 0,
                flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            });

            let vertices: Vec<GpuRayTracingVertex> = mesh
                .vertices
                .iter()
                .map(|v| GpuRayTracingVertex {
                    position: v.position,
                    u: v.uv[0],
                    normal: v.normal,
                    v: v.uv[1],
                })
                .collect();

            let index_buffer = buffer_helpers::create_device_local_buffer_with_data(
                ctx,
                bytemuck::cast_slice(&mesh.indices),
                vk::BufferUsageFlags::STORAGE_BUFFER,
                &format!("rt mesh {} indices", i),
            )?;
            storage.index_buffers.push(index_buffer);

            let vertex_buffer = buffer_helpers::create_device_local_buffer_with_data(
                ctx,
                bytemuck::cast_slice(&vertices),
                vk::BufferUsageFlags::STORAGE_BUFFER,
                &format!("rt mesh {} vertices", i),
            )?;
            storage.vertex_buffers.push(vertex_buffer);
        }

        storage.tlas = as_manager.generate_tlas(ctx, &instances)?;
        debug!(
            "TLAS over {} instances occupies {} bytes",
            instances.len(),
            as_manager.memory_block(ctx, storage.tlas).size
        );
        Ok(())
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    pub fn light_count(&self) -> u32 {
        self.lights.len() as u32
    }

    pub fn material_count(&self) -> u32 {
        self.materials.len() as u32
    }

    /// Base-colour textures paired with `sampler`, in material texture index order.
    pub fn sampled_textures(&self, sampler: vk::Sampler) -> Vec<SampledTexture> {
        self.textures
            .iter()
            .map(|&texture| SampledTexture { texture, sampler })
            .collect()
    }

    /// Release every GPU resource. Safe on a partially uploaded scene.
    pub fn destroy(&mut self, ctx: &mut VulkanContext, as_manager: &mut AccelerationStructureManager) {
        if let Some(storage) = self.ray_tracing.take() {
            if storage.tlas != vk::AccelerationStructureKHR::null() {
                as_manager.destroy_acceleration_structure(ctx, storage.tlas);
            }
            for blas in storage.blases {
                as_manager.destroy_acceleration_structure(ctx, blas);
            }
            for buffer in storage.index_buffers.into_iter().chain(storage.vertex_buffers) {
                ctx.memory_manager.destroy_buffer(buffer);
            }
        }

        if let Some(light_volume) = self.light_volume.take() {
            destroy_buffer_if_set(ctx, light_volume.positions_buffer);
            destroy_buffer_if_set(ctx, light_volume.tetrahedral_buffer);
            destroy_buffer_if_set(ctx, light_volume.coefficients_buffer);
        }

        let environment = std::mem::take(&mut self.environment);
        destroy_texture_if_set(ctx, &environment.reflection);
        destroy_texture_if_set(ctx, &environment.irradiance);
        destroy_texture_if_set(ctx, &environment.cubemap);

        for mesh in self.meshes.drain(..) {
            ctx.memory_manager.destroy_buffer(mesh.vertex_buffer);
            ctx.memory_manager.destroy_buffer(mesh.index_buffer);
        }

        for texture in self.textures.drain(..) {
            image_helpers::destroy_texture(ctx, &texture);
        }

        destroy_buffer_if_set(ctx, std::mem::take(&mut self.material_buffer));
        destroy_buffer_if_set(ctx, std::mem::take(&mut self.light_buffer));
    }
}

// ===========================================================================
// Demo scene
// ===========================================================================

const SPHERE_COLUMNS: u32 = 4;
const SPHERE_ROWS: u32 = 3;

/// Procedural scene: a checkered floor, a grid of spheres sweeping roughness
/// and metalness, a sun plus two point lights, a procedural sky and,
/// optionally, a probe-grid light volume.
pub fn demo_scene_content(config: &RenderConfig) -> SceneContent {
    let sun_direction = Vec3::new(-0.4, -1.0, -0.3).normalize();

    let camera = {
        let mut camera = Camera::default();
        camera.location.position = Vec3::new(0.0, 3.0, 9.0);
        camera.location.direction = (Vec3::new(0.0, 1.5, 0.0) - camera.location.position).normalize();
        camera
    };

    let mut lights = vec![
        Light {
            kind: LightKind::Point {
                position: Vec3::new(-3.0, 2.0, 2.0),
            },
            color: Vec3::new(1.0, 0.6, 0.3),
            intensity: 10.0,
        },
        Light {
            kind: LightKind::Point {
                position: Vec3::new(3.0, 2.0, 2.0),
            },
            color: Vec3::new(0.3, 0.6, 1.0),
            intensity: 10.0,
        },
    ];
    if !config.environment_direct_light {
        lights.insert(
            0,
            Light {
                kind: LightKind::Directional {
                    direction: sun_direction,
                },
                color: Vec3::new(1.0, 0.95, 0.9),
                intensity: 3.0,
            },
        );
    }

    let mut materials = vec![Material {
        base_color: Vec4::ONE,
        emission: Vec3::ZERO,
        roughness: 0.8,
        metallic: 0.0,
        base_color_texture: Some(0),
    }];

    let (floor_vertices, floor_indices) = geometry::generate_plane(16.0, 8.0);
    let mut meshes = vec![MeshData {
        vertices: floor_vertices,
        indices: floor_indices,
        transform: Mat4::IDENTITY,
        material: 0,
    }];

    let row_colors = [
        Vec4::new(0.9, 0.1, 0.1, 1.0),
        Vec4::new(1.0, 0.78, 0.34, 1.0),
        Vec4::new(0.9, 0.9, 0.9, 1.0),
    ];

    let (sphere_vertices, sphere_indices) = geometry::generate_sphere(0.5, 16, 32);
    for row in 0..SPHERE_ROWS {
        for column in 0..SPHERE_COLUMNS {
            let material = materials.len() as u32;
            materials.push(Material {
                base_color: row_colors[row as usize],
                emission: Vec3::ZERO,
                roughness: (column as f32 + 0.5) / SPHERE_COLUMNS as f32,
                metallic: if row == 1 { 1.0 } else { 0.0 },
                base_color_texture: None,
            });

            let position = Vec3::new(
                (column as f32 - (SPHERE_COLUMNS - 1) as f32 * 0.5) * 1.4,
                0.6 + row as f32 * 1.2,
                0.0,
            );
            meshes.push(MeshData {
                vertices: sphere_vertices.clone(),
                indices: sphere_indices.clone(),
                transform: Mat4::from_translation(position),
                material,
            });
        }
    }

    let textures = vec![TextureData {
        extent: vk::Extent2D {
            width: 256,
            height: 256,
        },
        rgba8: geometry::generate_checker_texture(256, 8, [200, 200, 200, 255], [60, 60, 70, 255]),
    }];

    let light_volume = config.light_volume.then(|| demo_light_volume(sun_direction));

    SceneContent {
        camera,
        lights,
        materials,
        textures,
        meshes,
        environment: EnvironmentData {
            extent: config.environment_extent,
            sun_direction: -sun_direction,
            retrieve_direct_light: config.environment_direct_light,
        },
        light_volume,
        debug_mip_colors: config.debug_mip_colors,
    }
}

fn demo_light_volume(sun_direction: Vec3) -> LightVolumeData {
    const COUNTS: [u32; 3] = [4, 3, 4];
    let min = Vec3::new(-6.0, 0.1, -6.0);
    let max = Vec3::new(6.0, 4.0, 6.0);

    let positions = geometry::probe_grid(min, max, COUNTS);
    let tetrahedra = geometry::tetrahedralize_grid(COUNTS);

    let sky = geometry::sky_radiance(Vec3::Y, -sun_direction);
    let ground = Vec3::new(0.3, 0.3, 0.32);
    let coefficients = positions
        .iter()
        .map(|p| {
            let height = (p.y - min.y) / (max.y - min.y);
            geometry::gradient_sh_coefficients(sky * (0.5 + 0.5 * height), ground)
        })
        .collect();

    LightVolumeData {
        positions,
        tetrahedra,
        coefficients,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_index_packs_mesh_below_material() {
        let packed = instance_custom_index(5, 3);
        assert_eq!(packed & ((1 << INSTANCE_MESH_BITS) - 1), 5);
        assert_eq!(packed >> INSTANCE_MESH_BITS, 3);
        assert!(instance_custom_index(4095, 4095) < 1 << 24);
    }

    #[test]
    #[should_panic(expected = "Too many meshes")]
    fn custom_index_rejects_mesh_overflow() {
        instance_custom_index(1 << INSTANCE_MESH_BITS, 0);
    }

    #[test]
    fn gpu_layouts_match_shader_strides() {
        assert_eq!(std::mem::size_of::<GpuLight>(), 32);
        assert_eq!(std::mem::size_of::<GpuMaterial>(), 48);
        assert_eq!(std::mem::size_of::<GpuRayTracingVertex>(), 32);
        assert_eq!(std::mem::size_of::<GpuTetrahedron>(), 96);
    }

    #[test]
    fn lights_pack_kind_into_w() {
        let sun = Light {
            kind: LightKind::Directional {
                direction: Vec3::new(0.0, -2.0, 0.0),
            },
            color: Vec3::ONE,
            intensity: 2.0,
        }
        .to_gpu();
        assert_eq!(sun.location, [0.0, -1.0, 0.0, 0.0]);
        assert_eq!(sun.color, [2.0, 2.0, 2.0, 0.0]);

        let point = Light {
            kind: LightKind::Point {
                position: Vec3::new(1.0, 2.0, 3.0),
            },
            color: Vec3::X,
            intensity: 1.0,
        }
        .to_gpu();
        assert_eq!(point.location, [1.0, 2.0, 3.0, 1.0]);
    }

    #[test]
    fn untextured_material_has_negative_index() {
        let material = Material {
            base_color: Vec4::ONE,
            emission: Vec3::ZERO,
            roughness: 0.5,
            metallic: 0.0,
            base_color_texture: None,
        };
        assert_eq!(material.to_gpu().base_color_texture, -1);
    }

    #[test]
    fn barycentric_matrix_recovers_corner_weights() {
        let corners = [
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(0.0, 0.0, 3.0),
            Vec3::new(0.5, 0.5, 0.5),
        ];
        let matrix = barycentric_matrix(corners);

        for (i, corner) in corners.iter().enumerate().take(3) {
            let weights = matrix.transform_point3(*corner);
            for axis in 0..3 {
                let expected = if axis == i { 1.0 } else { 0.0 };
                assert!((weights[axis] - expected).abs() < 1e-5);
            }
        }
        assert!(matrix.transform_point3(corners[3]).length() < 1e-5);
    }

    #[test]
    fn demo_content_is_consistent() {
        let content = demo_scene_content(&RenderConfig::default());

        assert_eq!(content.meshes.len(), 1 + (SPHERE_ROWS * SPHERE_COLUMNS) as usize);
        assert_eq!(content.materials.len(), content.meshes.len());
        for mesh in &content.meshes {
            assert!((mesh.material as usize) < content.materials.len());
            assert_eq!(mesh.indices.len() % 3, 0);
        }
        for material in &content.materials {
            if let Some(texture) = material.base_color_texture {
                assert!((texture as usize) < content.textures.len());
            }
        }
        for texture in &content.textures {
            let expected = texture.extent.width * texture.extent.height * 4;
            assert_eq!(texture.rgba8.len() as u32, expected);
        }
    }

    #[test]
    fn demo_light_volume_follows_config() {
        let mut config = RenderConfig::default();
        config.light_volume = true;
        let content = demo_scene_content(&config);
        let volume = content.light_volume.expect("light volume requested");

        assert_eq!(volume.positions.len(), volume.coefficients.len());
        assert!(volume
            .tetrahedra
            .iter()
            .flatten()
            .all(|&i| (i as usize) < volume.positions.len()));
        assert_eq!(volume.gpu_tetrahedra().len(), volume.tetrahedra.len());
        assert_eq!(
            volume.gpu_coefficients().len(),
            volume.positions.len() * SH_COEFFICIENT_COUNT
        );

        config.light_volume = false;
        assert!(demo_scene_content(&config).light_volume.is_none());
    }

    #[test]
    fn demo_sun_comes_from_the_environment_when_retrieved() {
        let is_directional = |light: &Light| matches!(light.kind, LightKind::Directional { .. });

        let mut config = RenderConfig::default();
        config.environment_direct_light = true;
        let content = demo_scene_content(&config);
        assert!(content.environment.retrieve_direct_light);
        assert!(!content.lights.iter().any(is_directional));

        config.environment_direct_light = false;
        let content = demo_scene_content(&config);
        assert!(!content.environment.retrieve_direct_light);
        assert!(is_directional(&content.lights[0]));
        assert_eq!(content.lights.len(), 3);
    }
}
