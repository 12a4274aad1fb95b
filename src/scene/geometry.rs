// Procedural meshes
//
// Plane, cube and UV sphere with a full tangent frame per vertex, stored as
// separate streams (one vertex buffer per attribute, binding order below).
// Front faces are counter-clockwise.

use glam::{Vec2, Vec3};

/// Vertex streams in binding order.
pub const VERTEX_STREAMS: [&str; 5] = ["positions", "tex_coords", "normals", "tangents", "bitangents"];

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub positions: Vec<Vec3>,
    pub tex_coords: Vec<Vec2>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec3>,
    pub bitangents: Vec<Vec3>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Raw bytes of each vertex stream, in binding order.
    pub fn stream_bytes(&self) -> [&[u8]; 5] {
        [
            bytemuck::cast_slice(&self.positions),
            bytemuck::cast_slice(&self.tex_coords),
            bytemuck::cast_slice(&self.normals),
            bytemuck::cast_slice(&self.tangents),
            bytemuck::cast_slice(&self.bitangents),
        ]
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    fn push_vertex(&mut self, position: Vec3, tex_coord: Vec2, normal: Vec3) -> u32 {
        let index = self.positions.len() as u32;
        self.positions.push(position);
        self.tex_coords.push(tex_coord);
        self.normals.push(normal);
        index
    }

    /// Derive tangents and bitangents from positions, normals and texture
    /// coordinates.
    fn compute_tangent_frames(&mut self) {
        let count = self.positions.len();
        let mut tangents = vec![Vec3::ZERO; count];
        let mut bitangents = vec![Vec3::ZERO; count];

        for tri in self.indices.chunks_exact(3) {
            let [i0, i1, i2] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
            let e1 = self.positions[i1] - self.positions[i0];
            let e2 = self.positions[i2] - self.positions[i0];
            let d1 = self.tex_coords[i1] - self.tex_coords[i0];
            let d2 = self.tex_coords[i2] - self.tex_coords[i0];
            let det = d1.x * d2.y - d2.x * d1.y;
            if det.abs() < 1e-8 {
                continue;
            }
            let t = (e1 * d2.y - e2 * d1.y) / det;
            let b = (e2 * d1.x - e1 * d2.x) / det;
            for i in [i0, i1, i2] {
                tangents[i] += t;
                bitangents[i] += b;
            }
        }

        self.tangents.clear();
        self.bitangents.clear();
        for i in 0..count {
            let n = self.normals[i];
            // Gram-Schmidt against the normal
            let t = (tangents[i] - n * n.dot(tangents[i]))
                .try_normalize()
                .unwrap_or_else(|| n.any_orthonormal_vector());
            let handedness = if n.cross(t).dot(bitangents[i]) < 0.0 { -1.0 } else { 1.0 };
            self.tangents.push(t);
            self.bitangents.push(n.cross(t) * handedness);
        }
    }
}

/// Square in the XZ plane facing +Y, `size` wide, `subdivisions` quads per side.
pub fn plane(size: f32, subdivisions: u32) -> Mesh {
    let n = subdivisions.max(1);
    let mut mesh = Mesh::default();
    for z in 0..=n {
        for x in 0..=n {
            let u = x as f32 / n as f32;
            let v = z as f32 / n as f32;
            let position = Vec3::new((u - 0.5) * size, 0.0, (v - 0.5) * size);
            mesh.push_vertex(position, Vec2::new(u, v), Vec3::Y);
        }
    }
    let row = n + 1;
    for z in 0..n {
        for x in 0..n {
            let a = z * row + x;
            let (right, below) = (a + 1, a + row);
            mesh.indices.extend_from_slice(&[a, below, right, right, below, below + 1]);
        }
    }
    mesh.compute_tangent_frames();
    mesh
}

/// Axis-aligned cube centred at the origin, 24 vertices (hard edges).
pub fn cube(size: f32) -> Mesh {
    let h = size * 0.5;
    // (normal, u axis, v axis) with u x v = normal
    let faces = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
    ];
    let mut mesh = Mesh::default();
    for (normal, u, v) in faces {
        let corners = [
            (-u - v, Vec2::new(0.0, 1.0)),
            (u - v, Vec2::new(1.0, 1.0)),
            (u + v, Vec2::new(1.0, 0.0)),
            (-u + v, Vec2::new(0.0, 0.0)),
        ];
        let base = mesh.positions.len() as u32;
        for (offset, uv) in corners {
            mesh.push_vertex((normal + offset) * h, uv, normal);
        }
        mesh.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    mesh.compute_tangent_frames();
    mesh
}

/// UV sphere centred at the origin.
pub fn uv_sphere(radius: f32, segments: u32, rings: u32) -> Mesh {
    let segments = segments.max(3);
    let rings = rings.max(2);
    let mut mesh = Mesh::default();
    for r in 0..=rings {
        let theta = std::f32::consts::PI * r as f32 / rings as f32;
        for s in 0..=segments {
            let phi = std::f32::consts::TAU * s as f32 / segments as f32;
            let normal = Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin());
            let uv = Vec2::new(s as f32 / segments as f32, r as f32 / rings as f32);
            mesh.push_vertex(normal * radius, uv, normal);
        }
    }
    let row = segments + 1;
    for r in 0..rings {
        for s in 0..segments {
            let a = r * row + s;
            let b = a + row;
            // Skip the zero-area triangles at the poles
            if r != 0 {
                mesh.indices.extend_from_slice(&[a, a + 1, b]);
            }
            if r != rings - 1 {
                mesh.indices.extend_from_slice(&[a + 1, b + 1, b]);
            }
        }
    }
    mesh.compute_tangent_frames();
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent(mesh: &Mesh) {
        let count = mesh.vertex_count();
        assert_eq!(mesh.tex_coords.len(), count);
        assert_eq!(mesh.normals.len(), count);
        assert_eq!(mesh.tangents.len(), count);
        assert_eq!(mesh.bitangents.len(), count);
        assert_eq!(mesh.indices.len() % 3, 0);
        assert!(mesh.indices.iter().all(|i| (*i as usize) < count));

        for i in 0..count {
            let (n, t, b) = (mesh.normals[i], mesh.tangents[i], mesh.bitangents[i]);
            assert!((t.length() - 1.0).abs() < 1e-4, "tangent {} not unit", i);
            assert!(n.dot(t).abs() < 1e-4, "tangent {} not orthogonal", i);
            assert!(n.dot(b).abs() < 1e-4, "bitangent {} not orthogonal", i);
        }
    }

    /// Every triangle's geometric normal agrees with its vertex normals.
    fn assert_outward(mesh: &Mesh) {
        for tri in mesh.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
            let face = (mesh.positions[b] - mesh.positions[a]).cross(mesh.positions[c] - mesh.positions[a]);
            assert!(face.dot(mesh.normals[a]) > 0.0);
        }
    }

    #[test]
    fn plane_faces_up() {
        let mesh = plane(10.0, 4);
        assert_eq!(mesh.vertex_count(), 25);
        assert_eq!(mesh.index_count(), 4 * 4 * 6);
        assert_consistent(&mesh);
        assert_outward(&mesh);
        assert!(mesh.tangents.iter().all(|t| (*t - Vec3::X).length() < 1e-5));
    }

    #[test]
    fn cube_has_hard_edges() {
        let mesh = cube(2.0);
        assert_eq!(mesh.vertex_count(), 24);
        assert_eq!(mesh.index_count(), 36);
        assert_consistent(&mesh);
        assert_outward(&mesh);
        assert!(mesh.positions.iter().all(|p| p.abs().max_element() == 1.0));
    }

    #[test]
    fn sphere_is_round() {
        let mesh = uv_sphere(1.5, 16, 8);
        assert_eq!(mesh.vertex_count(), 17 * 9);
        assert_eq!(mesh.index_count(), (16 * 8 * 2 - 2 * 16) * 3);
        assert_consistent(&mesh);
        assert_outward(&mesh);
        assert!(mesh.positions.iter().all(|p| (p.length() - 1.5).abs() < 1e-4));
    }

    #[test]
    fn stream_sizes() {
        let mesh = cube(1.0);
        let [positions, tex_coords, normals, tangents, bitangents] = mesh.stream_bytes();
        assert_eq!(positions.len(), 24 * 12);
        assert_eq!(tex_coords.len(), 24 * 8);
        assert_eq!(normals.len(), 24 * 12);
        assert_eq!(tangents.len(), 24 * 12);
        assert_eq!(bitangents.len(), 24 * 12);
        assert_eq!(mesh.index_bytes().len(), 36 * 4);
    }
}
