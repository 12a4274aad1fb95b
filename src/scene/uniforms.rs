// GPU data layouts shared with the shaders
//
// Must match shaders/transform_and_pass_on.vert and
// shaders/blinnphong_and_normal_mapping.frag (std140/std430 friendly:
// only vec4/mat4 sized members, no implicit padding).

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Per-frame camera matrices and user input (set 1, binding 0).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    /// View matrix of the active camera
    pub view: Mat4,
    /// Projection matrix of the active camera
    pub projection: Mat4,
    /// Translation to the camera's position
    pub camera_position: Mat4,
    /// x = normal mapping strength; y, z, w unused
    pub user_input: Vec4,
}

impl FrameUniforms {
    pub fn new(view: Mat4, projection: Mat4, camera_translation: Vec3, normal_mapping_strength: f32) -> Self {
        Self {
            view,
            projection,
            camera_position: Mat4::from_translation(camera_translation),
            user_input: Vec4::splat(normal_mapping_strength),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Per-draw push constants.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PushConstants {
    pub model: Mat4,
    pub material_index: i32,
    pub _pad: [i32; 3],
}

impl PushConstants {
    pub fn new(model: Mat4, material_index: i32) -> Self {
        Self { model, material_index, _pad: [0; 3] }
    }
}

/// Material record in the materials storage buffer (set 0, binding 0).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialGpuData {
    pub diffuse: Vec4,
    /// rgb = specular color, w = shininess
    pub specular: Vec4,
    pub ambient: Vec4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_have_no_hidden_padding() {
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 3 * 64 + 16);
        assert_eq!(std::mem::size_of::<PushConstants>(), 80);
        assert_eq!(std::mem::size_of::<MaterialGpuData>(), 48);
    }

    #[test]
    fn strength_is_broadcast_to_user_input() {
        let uniforms = FrameUniforms::new(Mat4::IDENTITY, Mat4::IDENTITY, Vec3::new(1.0, 2.0, 3.0), 0.25);
        assert_eq!(uniforms.user_input, Vec4::splat(0.25));
        assert_eq!(uniforms.camera_position.w_axis, Vec4::new(1.0, 2.0, 3.0, 1.0));
    }
}
