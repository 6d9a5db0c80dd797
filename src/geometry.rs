//! Procedural geometry and texture data for the demo scene: meshes, the sky
//! cubemap and the probe grid of the light volume.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::collections::HashMap;

/// PBR vertex: position + normal + UV = 32 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PbrVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// UV sphere of `radius` around the origin.
pub fn generate_sphere(radius: f32, stacks: u32, slices: u32) -> (Vec<PbrVertex>, Vec<u32>) {
    let mut vertices = Vec::with_capacity(((stacks + 1) * (slices + 1)) as usize);
    let mut indices = Vec::with_capacity((stacks * slices * 6) as usize);

    for i in 0..=stacks {
        let v = i as f32 / stacks as f32;
        let phi = std::f32::consts::PI * v;
        for j in 0..=slices {
            let u = j as f32 / slices as f32;
            let theta = std::f32::consts::TAU * u;

            let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
            vertices.push(PbrVertex {
                position: (normal * radius).to_array(),
                normal: normal.to_array(),
                uv: [u, v],
            });
        }
    }

    let row = slices + 1;
    for i in 0..stacks {
        for j in 0..slices {
            let a = i * row + j;
            let b = a + row;
            indices.extend_from_slice(&[a, b, a + 1, b, b + 1, a + 1]);
        }
    }

    (vertices, indices)
}

/// Square in the XZ plane facing +Y, UVs repeating `uv_scale` times.
pub fn generate_plane(size: f32, uv_scale: f32) -> (Vec<PbrVertex>, Vec<u32>) {
    let h = size * 0.5;
    let corners = [(-h, -h, 0.0, 0.0), (h, -h, 1.0, 0.0), (h, h, 1.0, 1.0), (-h, h, 0.0, 1.0)];

    let vertices = corners
        .iter()
        .map(|&(x, z, u, v)| PbrVertex {
            position: [x, 0.0, z],
            normal: [0.0, 1.0, 0.0],
            uv: [u * uv_scale, v * uv_scale],
        })
        .collect();

    (vertices, vec![0, 2, 1, 0, 3, 2])
}

/// RGBA8 checker of `cells` x `cells` squares alternating two colours.
pub fn generate_checker_texture(size: u32, cells: u32, even: [u8; 4], odd: [u8; 4]) -> Vec<u8> {
    let cell_size = (size / cells.max(1)).max(1);
    let mut data = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let parity = (x / cell_size + y / cell_size) % 2;
            data.extend_from_slice(if parity == 0 { &even } else { &odd });
        }
    }
    data
}

// ===========================================================================
// Sky cubemap
// ===========================================================================

/// Direction through texel coordinates `(s, t)` in [-1, 1] of a cube face,
/// following the Vulkan face order +X, -X, +Y, -Y, +Z, -Z.
pub fn cube_face_direction(face: u32, s: f32, t: f32) -> Vec3 {
    let direction = match face {
        0 => Vec3::new(1.0, -t, -s),
        1 => Vec3::new(-1.0, -t, s),
        2 => Vec3::new(s, 1.0, t),
        3 => Vec3::new(s, -1.0, -t),
        4 => Vec3::new(s, -t, 1.0),
        5 => Vec3::new(-s, -t, -1.0),
        _ => panic!("Cube face index {} out of range", face),
    };
    direction.normalize()
}

const SKY_ZENITH: Vec3 = Vec3::new(0.15, 0.35, 0.9);
const SKY_HORIZON: Vec3 = Vec3::new(0.8, 0.85, 0.95);
const SKY_GROUND: Vec3 = Vec3::new(0.25, 0.22, 0.2);
// Integrates to an irradiance of about 3 over the sun disc.
const SUN_RADIANCE: Vec3 = Vec3::new(1000.0, 920.0, 750.0);
const SUN_COS_RADIUS: f32 = 0.9995;

/// HDR radiance of the procedural sky in `direction`.
pub fn sky_radiance(direction: Vec3, sun_direction: Vec3) -> Vec3 {
    let base = if direction.y >= 0.0 {
        SKY_HORIZON.lerp(SKY_ZENITH, direction.y.sqrt())
    } else {
        SKY_GROUND
    };

    if direction.dot(sun_direction) > SUN_COS_RADIUS {
        base + SUN_RADIANCE
    } else {
        base
    }
}

/// Six faces of R16G16B16A16_SFLOAT texels, face-major, for a cube texture upload.
pub fn generate_sky_cubemap(extent: u32, sun_direction: Vec3) -> Vec<u8> {
    let sun_direction = sun_direction.normalize();
    let mut texels: Vec<u16> = Vec::with_capacity((6 * extent * extent * 4) as usize);

    for face in 0..6 {
        for y in 0..extent {
            for x in 0..extent {
                let s = 2.0 * (x as f32 + 0.5) / extent as f32 - 1.0;
                let t = 2.0 * (y as f32 + 0.5) / extent as f32 - 1.0;
                let radiance = sky_radiance(cube_face_direction(face, s, t), sun_direction);
                for channel in [radiance.x, radiance.y, radiance.z, 1.0] {
                    texels.push(half::f16::from_f32(channel).to_bits());
                }
            }
        }
    }

    bytemuck::cast_slice(&texels).to_vec()
}

/// Indices of the 12 triangles of a unit cube whose 8 corners are encoded in
/// the vertex index bits (x = bit 0, y = bit 1, z = bit 2). Faces point inwards.
pub const CUBE_INDICES: [u16; 36] = [
    0, 2, 1, 1, 2, 3, // -Z
    4, 5, 6, 5, 7, 6, // +Z
    0, 1, 4, 1, 5, 4, // -Y
    2, 6, 3, 3, 6, 7, // +Y
    0, 4, 2, 2, 4, 6, // -X
    1, 3, 5, 3, 7, 5, // +X
];

// ===========================================================================
// Light volume
// ===========================================================================

/// Probe positions of a regular grid spanning `min..max` with `counts` probes per axis.
pub fn probe_grid(min: Vec3, max: Vec3, counts: [u32; 3]) -> Vec<Vec3> {
    assert!(
        counts.iter().all(|&count| count >= 2),
        "Probe grid needs at least two probes per axis"
    );

    let step = (max - min)
        / Vec3::new(
            (counts[0] - 1) as f32,
            (counts[1] - 1) as f32,
            (counts[2] - 1) as f32,
        );

    let mut positions = Vec::with_capacity((counts[0] * counts[1] * counts[2]) as usize);
    for z in 0..counts[2] {
        for y in 0..counts[1] {
            for x in 0..counts[0] {
                positions.push(min + step * Vec3::new(x as f32, y as f32, z as f32));
            }
        }
    }
    positions
}

/// Split every grid cell into six tetrahedra sharing the cell's main diagonal.
/// Adjacent cells agree on their shared face diagonals, so the result is conforming.
pub fn tetrahedralize_grid(counts: [u32; 3]) -> Vec<[u32; 4]> {
    const AXIS_ORDERS: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    let index = |p: [u32; 3]| p[0] + counts[0] * (p[1] + counts[1] * p[2]);

    let mut tetrahedra = Vec::new();
    for z in 0..counts[2] - 1 {
        for y in 0..counts[1] - 1 {
            for x in 0..counts[0] - 1 {
                for order in AXIS_ORDERS {
                    let mut corner = [x, y, z];
                    let mut tetrahedron = [index(corner); 4];
                    for (step, &axis) in order.iter().enumerate() {
                        corner[axis] += 1;
                        tetrahedron[step + 1] = index(corner);
                    }
                    tetrahedra.push(tetrahedron);
                }
            }
        }
    }
    tetrahedra
}

/// For each tetrahedron, the neighbour across the face opposite each vertex, or -1.
pub fn tetrahedral_neighbors(tetrahedra: &[[u32; 4]]) -> Vec<[i32; 4]> {
    let face_key = |tetrahedron: &[u32; 4], opposite: usize| {
        let mut face = [0u32; 3];
        let mut n = 0;
        for (i, &vertex) in tetrahedron.iter().enumerate() {
            if i != opposite {
                face[n] = vertex;
                n += 1;
            }
        }
        face.sort_unstable();
        face
    };

    let mut faces: HashMap<[u32; 3], Vec<usize>> = HashMap::new();
    for (t, tetrahedron) in tetrahedra.iter().enumerate() {
        for opposite in 0..4 {
            faces.entry(face_key(tetrahedron, opposite)).or_default().push(t);
        }
    }

    tetrahedra
        .iter()
        .enumerate()
        .map(|(t, tetrahedron)| {
            let mut neighbors = [-1i32; 4];
            for (opposite, neighbor) in neighbors.iter_mut().enumerate() {
                if let Some(&other) = faces[&face_key(tetrahedron, opposite)]
                    .iter()
                    .find(|&&other| other != t)
                {
                    *neighbor = other as i32;
                }
            }
            neighbors
        })
        .collect()
}

/// Unique edges of the tetrahedral mesh as a line-list index buffer.
pub fn tetrahedral_edges(tetrahedra: &[[u32; 4]]) -> Vec<u32> {
    let mut edges: Vec<(u32, u32)> = tetrahedra
        .iter()
        .flat_map(|t| {
            [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]
                .map(|(a, b)| (t[a].min(t[b]), t[a].max(t[b])))
        })
        .collect();
    edges.sort_unstable();
    edges.dedup();

    edges.into_iter().flat_map(|(a, b)| [a, b]).collect()
}

/// Order-2 spherical harmonics (9 RGB coefficients) of a sky that fades from
/// `ground` below the horizon to `sky` above it.
pub fn gradient_sh_coefficients(sky: Vec3, ground: Vec3) -> [Vec3; 9] {
    // Projection of a step function along Y onto the Y_0^0 and Y_1^0 bands.
    const Y00: f32 = 0.282_095;
    const Y10: f32 = 0.488_603;
    let pi = std::f32::consts::PI;

    let mut coefficients = [Vec3::ZERO; 9];
    coefficients[0] = (sky + ground) * (2.0 * pi * Y00);
    coefficients[2] = (sky - ground) * (pi * Y10);
    coefficients
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_sizes() {
        let (vertices, indices) = generate_sphere(2.0, 8, 16);
        assert_eq!(vertices.len(), 9 * 17);
        assert_eq!(indices.len(), 8 * 16 * 6);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));

        let top = Vec3::from(vertices[0].position);
        assert!((top - Vec3::new(0.0, 2.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn plane_faces_up() {
        let (vertices, indices) = generate_plane(10.0, 4.0);
        assert_eq!(vertices.len(), 4);
        assert_eq!(indices.len(), 6);

        let [a, b, c] = [indices[0], indices[1], indices[2]].map(|i| Vec3::from(vertices[i as usize].position));
        assert!((b - a).cross(c - a).y > 0.0);
    }

    #[test]
    fn checker_alternates_cells() {
        let data = generate_checker_texture(4, 2, [255; 4], [0, 0, 0, 255]);
        assert_eq!(data.len(), 4 * 4 * 4);
        assert_eq!(&data[0..4], &[255; 4]);
        assert_eq!(&data[8..12], &[0, 0, 0, 255]);
    }

    #[test]
    fn cube_face_centres_point_along_axes() {
        let expected = [Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z];
        for (face, axis) in expected.iter().enumerate() {
            let direction = cube_face_direction(face as u32, 0.0, 0.0);
            assert!((direction - *axis).length() < 1e-6, "face {}", face);
        }
    }

    #[test]
    fn sky_cubemap_is_half_float_rgba() {
        let data = generate_sky_cubemap(4, Vec3::Y);
        assert_eq!(data.len(), 6 * 4 * 4 * 8);
    }

    #[test]
    fn sun_is_brighter_than_sky() {
        let sun = Vec3::new(0.0, 1.0, 0.0);
        assert!(sky_radiance(sun, sun).x > sky_radiance(Vec3::X, sun).x + 10.0);
    }

    #[test]
    fn cube_indices_cover_every_corner() {
        for corner in 0..8u16 {
            let uses = CUBE_INDICES.iter().filter(|&&i| i == corner).count();
            assert!(uses >= 3, "corner {} used {} times", corner, uses);
        }
    }

    #[test]
    fn probe_grid_spans_bounds() {
        let positions = probe_grid(Vec3::splat(-1.0), Vec3::splat(1.0), [2, 3, 4]);
        assert_eq!(positions.len(), 24);
        assert_eq!(positions[0], Vec3::splat(-1.0));
        assert!((*positions.last().unwrap() - Vec3::splat(1.0)).length() < 1e-5);
    }

    #[test]
    fn single_cell_splits_into_six_tetrahedra() {
        let tetrahedra = tetrahedralize_grid([2, 2, 2]);
        assert_eq!(tetrahedra.len(), 6);
        for t in &tetrahedra {
            assert_eq!(t[0], 0);
            assert_eq!(t[3], 7);
        }

        // 12 cube edges, 6 face diagonals and the main diagonal.
        assert_eq!(tetrahedral_edges(&tetrahedra).len(), 19 * 2);
    }

    #[test]
    fn tetrahedra_have_volume() {
        let positions = probe_grid(Vec3::ZERO, Vec3::splat(2.0), [3, 3, 3]);
        let tetrahedra = tetrahedralize_grid([3, 3, 3]);
        assert_eq!(tetrahedra.len(), 8 * 6);

        for t in &tetrahedra {
            let [a, b, c, d] = t.map(|i| positions[i as usize]);
            let volume = (b - a).cross(c - a).dot(d - a).abs() / 6.0;
            assert!((volume - 1.0 / 6.0).abs() < 1e-5);
        }
    }

    #[test]
    fn neighbors_are_symmetric() {
        let tetrahedra = tetrahedralize_grid([3, 2, 2]);
        let neighbors = tetrahedral_neighbors(&tetrahedra);

        for (t, faces) in neighbors.iter().enumerate() {
            for &n in faces.iter().filter(|&&n| n >= 0) {
                assert!(neighbors[n as usize].contains(&(t as i32)));
            }
        }

        let single = tetrahedral_neighbors(&tetrahedralize_grid([2, 2, 2]));
        for faces in &single {
            assert_eq!(faces.iter().filter(|&&n| n >= 0).count(), 2);
        }
    }

    #[test]
    fn gradient_sh_is_constant_for_uniform_sky() {
        let sh = gradient_sh_coefficients(Vec3::ONE, Vec3::ONE);
        assert!(sh[2].length() < 1e-6);
        assert!(sh[0].x > 0.0);
    }
}
