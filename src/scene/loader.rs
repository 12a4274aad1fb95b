// Scene loading
//
// A scene is described in TOML (materials, objects, lights). Geometry is
// generated procedurally and uploaded once with blocking transfers; identical
// shapes share their buffers.

use anyhow::{Context, Result};
use glam::{EulerRot, Mat4, Quat, Vec3};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use super::geometry::{self, Mesh};
use super::lights::{LightAnimation, LightKind, LightSource, MAX_NUMBER_OF_LIGHTSOURCES};
use super::uniforms::MaterialGpuData;
use crate::error::LogicError;
use crate::frame::backend::{BufferDesc, BufferHandle, BufferUsage, GeometryHandles, GpuBackend, MemoryUsage};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaterialDesc {
    pub name: String,
    pub diffuse: [f32; 3],
    pub specular: [f32; 3],
    pub shininess: f32,
    pub ambient: [f32; 3],
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            diffuse: [0.8, 0.8, 0.8],
            specular: [0.5, 0.5, 0.5],
            shininess: 32.0,
            ambient: [1.0, 1.0, 1.0],
        }
    }
}

impl MaterialDesc {
    fn to_gpu(&self) -> MaterialGpuData {
        MaterialGpuData {
            diffuse: Vec3::from(self.diffuse).extend(1.0),
            specular: Vec3::from(self.specular).extend(self.shininess),
            ambient: Vec3::from(self.ambient).extend(1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Plane,
    Cube,
    Sphere,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectDesc {
    pub shape: Shape,
    /// Edge length (plane, cube) or diameter (sphere)
    pub size: f32,
    /// Plane subdivisions or sphere segments
    pub detail: u32,
    pub translation: [f32; 3],
    /// Euler angles in degrees, applied Y, X, Z
    pub rotation: [f32; 3],
    pub scale: [f32; 3],
    pub material: u32,
}

impl Default for ObjectDesc {
    fn default() -> Self {
        Self {
            shape: Shape::Cube,
            size: 1.0,
            detail: 16,
            translation: [0.0; 3],
            rotation: [0.0; 3],
            scale: [1.0; 3],
            material: 0,
        }
    }
}

impl ObjectDesc {
    pub fn model_matrix(&self) -> Mat4 {
        let [x, y, z] = self.rotation.map(f32::to_radians);
        Mat4::from_scale_rotation_translation(
            Vec3::from(self.scale),
            Quat::from_euler(EulerRot::YXZ, y, x, z),
            Vec3::from(self.translation),
        )
    }

    fn mesh(&self) -> Mesh {
        match self.shape {
            Shape::Plane => geometry::plane(self.size, self.detail),
            Shape::Cube => geometry::cube(self.size),
            Shape::Sphere => geometry::uv_sphere(self.size * 0.5, self.detail, (self.detail / 2).max(2)),
        }
    }

    /// Objects with the same key produce the same mesh.
    fn mesh_key(&self) -> (Shape, u32, u32) {
        let detail = if self.shape == Shape::Cube { 0 } else { self.detail };
        (self.shape, self.size.to_bits(), detail)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LightDesc {
    pub kind: LightKind,
    pub enabled: bool,
    pub color: [f32; 3],
    pub intensity: f32,
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub attenuation: [f32; 3],
    pub inner_angle: f32,
    pub outer_angle: f32,
    pub falloff: f32,
    /// Circle around `position` when non-zero
    pub orbit_radius: f32,
    pub orbit_speed: f32,
    pub orbit_phase: f32,
}

impl Default for LightDesc {
    fn default() -> Self {
        let base = LightSource::new(LightKind::Point, Vec3::ONE);
        Self {
            kind: base.kind,
            enabled: base.enabled,
            color: base.color.to_array(),
            intensity: base.intensity,
            position: base.position.to_array(),
            direction: base.direction.to_array(),
            attenuation: base.attenuation.to_array(),
            inner_angle: base.inner_angle,
            outer_angle: base.outer_angle,
            falloff: base.falloff,
            orbit_radius: 0.0,
            orbit_speed: 0.0,
            orbit_phase: 0.0,
        }
    }
}

impl LightDesc {
    pub fn to_light(&self) -> LightSource {
        let animation = (self.orbit_radius != 0.0).then_some(LightAnimation {
            radius: self.orbit_radius,
            speed: self.orbit_speed,
            phase: self.orbit_phase,
        });
        LightSource {
            kind: self.kind,
            enabled: self.enabled,
            color: Vec3::from(self.color),
            intensity: self.intensity,
            position: Vec3::from(self.position),
            direction: Vec3::from(self.direction),
            attenuation: Vec3::from(self.attenuation),
            inner_angle: self.inner_angle,
            outer_angle: self.outer_angle,
            falloff: self.falloff,
            animation,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SceneDescription {
    pub materials: Vec<MaterialDesc>,
    pub objects: Vec<ObjectDesc>,
    pub lights: Vec<LightDesc>,
}

impl Default for SceneDescription {
    fn default() -> Self {
        let material = |name: &str, diffuse: [f32; 3], shininess: f32| MaterialDesc {
            name: name.to_string(),
            diffuse,
            shininess,
            ..MaterialDesc::default()
        };
        let light = |kind: LightKind, color: [f32; 3]| LightDesc { kind, color, ..LightDesc::default() };

        Self {
            materials: vec![
                material("floor", [0.6, 0.6, 0.6], 8.0),
                material("brick", [0.7, 0.3, 0.2], 16.0),
                material("chrome", [0.9, 0.9, 0.95], 96.0),
            ],
            objects: vec![
                ObjectDesc { shape: Shape::Plane, size: 20.0, detail: 8, material: 0, ..ObjectDesc::default() },
                ObjectDesc { shape: Shape::Cube, translation: [0.0, 0.5, 0.0], material: 1, ..ObjectDesc::default() },
                ObjectDesc {
                    shape: Shape::Cube,
                    translation: [-2.0, 0.5, 2.0],
                    rotation: [0.0, 35.0, 0.0],
                    material: 1,
                    ..ObjectDesc::default()
                },
                ObjectDesc {
                    shape: Shape::Sphere,
                    size: 1.5,
                    detail: 32,
                    translation: [2.0, 0.75, -1.0],
                    material: 2,
                    ..ObjectDesc::default()
                },
            ],
            lights: vec![
                light(LightKind::Ambient, [0.1, 0.1, 0.12]),
                LightDesc { direction: [-0.4, -1.0, -0.3], ..light(LightKind::Directional, [0.8, 0.75, 0.7]) },
                LightDesc {
                    position: [0.0, 2.0, 0.0],
                    orbit_radius: 3.0,
                    orbit_speed: 0.8,
                    ..light(LightKind::Point, [1.0, 0.6, 0.3])
                },
                LightDesc {
                    position: [0.0, 1.5, 0.0],
                    orbit_radius: 4.0,
                    orbit_speed: -0.5,
                    orbit_phase: std::f32::consts::PI,
                    ..light(LightKind::Point, [0.3, 0.5, 1.0])
                },
                LightDesc {
                    position: [4.0, 4.0, 4.0],
                    direction: [-1.0, -1.0, -1.0],
                    ..light(LightKind::Spot, [1.0, 1.0, 0.9])
                },
            ],
        }
    }
}

impl SceneDescription {
    /// Load a scene file, falling back to the built-in scene if it is missing.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Scene file not found at {:?}, using built-in scene", path);
            return Ok(SceneDescription::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scene file: {:?}", path))?;
        let scene: SceneDescription = toml::from_str(&content)
            .with_context(|| format!("Failed to parse scene file: {:?}", path))?;
        scene.validate().with_context(|| format!("Invalid scene file: {:?}", path))?;

        log::info!(
            "Loaded scene from {:?}: {} materials, {} objects, {} lights",
            path,
            scene.materials.len(),
            scene.objects.len(),
            scene.lights.len()
        );
        Ok(scene)
    }

    pub fn validate(&self) -> Result<(), LogicError> {
        if self.materials.is_empty() && !self.objects.is_empty() {
            return Err(LogicError::InvalidConfig("scene has objects but no materials".to_string()));
        }
        for (i, object) in self.objects.iter().enumerate() {
            if object.material as usize >= self.materials.len() {
                return Err(LogicError::InvalidConfig(format!(
                    "object {} uses material {} but only {} exist",
                    i,
                    object.material,
                    self.materials.len()
                )));
            }
            if !(object.size > 0.0) {
                return Err(LogicError::InvalidConfig(format!("object {} has non-positive size", i)));
            }
        }
        let enabled = self.lights.iter().filter(|l| l.enabled).count();
        if enabled > MAX_NUMBER_OF_LIGHTSOURCES {
            return Err(LogicError::LightCapacityExceeded { count: enabled, capacity: MAX_NUMBER_OF_LIGHTSOURCES });
        }
        Ok(())
    }

    /// Create and fill all GPU buffers for this scene.
    pub fn upload(&self, backend: &mut dyn GpuBackend) -> Result<LoadedScene> {
        self.validate()?;

        let mut materials: Vec<MaterialGpuData> = self.materials.iter().map(MaterialDesc::to_gpu).collect();
        if materials.is_empty() {
            materials.push(MaterialDesc::default().to_gpu());
        }
        let material_bytes: &[u8] = bytemuck::cast_slice(&materials);
        let material_buffer = backend.create_buffer(&BufferDesc::new(
            "materials",
            material_bytes.len() as u64,
            BufferUsage::Storage,
            MemoryUsage::Device,
        ))?;
        backend.upload_blocking(material_buffer, material_bytes).context("Uploading materials")?;

        let mut meshes: HashMap<(Shape, u32, u32), GeometryHandles> = HashMap::new();
        let mut draw_calls = Vec::with_capacity(self.objects.len());
        for (i, object) in self.objects.iter().enumerate() {
            let geometry = match meshes.get(&object.mesh_key()) {
                Some(geometry) => *geometry,
                None => {
                    let geometry = upload_mesh(backend, &object.mesh(), &format!("object{}", i))
                        .with_context(|| format!("Uploading geometry of object {}", i))?;
                    meshes.insert(object.mesh_key(), geometry);
                    geometry
                }
            };
            draw_calls.push(DrawCall {
                model: object.model_matrix(),
                material_index: object.material as i32,
                geometry,
            });
        }

        log::info!("Uploaded {} draw calls using {} meshes", draw_calls.len(), meshes.len());
        Ok(LoadedScene {
            materials: material_buffer,
            material_count: materials.len(),
            draw_calls,
            lights: self.lights.iter().map(LightDesc::to_light).collect(),
        })
    }
}

/// One indexed draw of the scene. Immutable after loading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawCall {
    pub model: Mat4,
    pub material_index: i32,
    pub geometry: GeometryHandles,
}

#[derive(Debug)]
pub struct LoadedScene {
    pub materials: BufferHandle,
    pub material_count: usize,
    pub draw_calls: Vec<DrawCall>,
    pub lights: Vec<LightSource>,
}

/// Upload one mesh as an index buffer plus one vertex buffer per stream.
pub fn upload_mesh(backend: &mut dyn GpuBackend, mesh: &Mesh, name: &str) -> Result<GeometryHandles> {
    let mut upload = |suffix: &str, bytes: &[u8], usage: BufferUsage| -> Result<BufferHandle> {
        let desc = BufferDesc::new(format!("{}.{}", name, suffix), bytes.len() as u64, usage, MemoryUsage::Device);
        let buffer = backend.create_buffer(&desc)?;
        backend.upload_blocking(buffer, bytes)?;
        Ok(buffer)
    };

    let index = upload("indices", mesh.index_bytes(), BufferUsage::Index)?;
    let mut streams = Vec::with_capacity(geometry::VERTEX_STREAMS.len());
    for (stream, bytes) in geometry::VERTEX_STREAMS.iter().zip(mesh.stream_bytes()) {
        streams.push(upload(stream, bytes, BufferUsage::Vertex)?);
    }

    Ok(GeometryHandles {
        index,
        index_count: mesh.index_count(),
        positions: streams[0],
        tex_coords: streams[1],
        normals: streams[2],
        tangents: streams[3],
        bitangents: streams[4],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::headless::HeadlessBackend;

    #[test]
    fn built_in_scene_is_valid() {
        let scene = SceneDescription::default();
        assert_eq!(scene.validate(), Ok(()));
        let kinds: Vec<LightKind> = scene.lights.iter().map(|l| l.kind).collect();
        assert!(kinds.contains(&LightKind::Ambient));
        assert!(kinds.contains(&LightKind::Spot));
    }

    #[test]
    fn parses_scene_toml() {
        let scene: SceneDescription = toml::from_str(
            r#"
            [[materials]]
            name = "red"
            diffuse = [1.0, 0.0, 0.0]

            [[objects]]
            shape = "sphere"
            size = 2.0
            translation = [0.0, 1.0, 0.0]

            [[lights]]
            kind = "ambient"
            color = [0.2, 0.2, 0.2]

            [[lights]]
            kind = "directional"
            direction = [0.0, -1.0, 0.0]
            "#,
        )
        .unwrap();

        assert_eq!(scene.materials[0].name, "red");
        assert_eq!(scene.materials[0].shininess, 32.0);
        assert_eq!(scene.objects[0].shape, Shape::Sphere);
        assert_eq!(scene.objects[0].scale, [1.0; 3]);
        assert_eq!(scene.lights[1].kind, LightKind::Directional);
        assert!(scene.lights[1].enabled);
        assert_eq!(scene.validate(), Ok(()));
    }

    #[test]
    fn rejects_missing_material() {
        let mut scene = SceneDescription::default();
        scene.objects[1].material = 7;
        assert!(matches!(scene.validate(), Err(LogicError::InvalidConfig(_))));
    }

    #[test]
    fn upload_shares_identical_meshes() {
        let mut backend = HeadlessBackend::new(3, 1920, 1080);
        let scene = SceneDescription::default();
        let loaded = scene.upload(&mut backend).unwrap();

        assert_eq!(loaded.draw_calls.len(), 4);
        assert_eq!(loaded.material_count, 3);
        // The two cubes share one set of buffers
        assert_eq!(loaded.draw_calls[1].geometry, loaded.draw_calls[2].geometry);
        assert_ne!(loaded.draw_calls[0].geometry, loaded.draw_calls[1].geometry);
        assert_eq!(loaded.draw_calls[1].geometry.index_count, 36);

        let materials = backend.buffer_contents(loaded.materials).unwrap();
        let first: MaterialGpuData = bytemuck::pod_read_unaligned(&materials[..48]);
        assert_eq!(first.specular.w, 8.0);
        assert_eq!(loaded.lights.len(), 5);
    }

    #[test]
    fn model_matrix_applies_translation_and_scale() {
        let object = ObjectDesc { translation: [1.0, 2.0, 3.0], scale: [2.0; 3], ..ObjectDesc::default() };
        let p = object.model_matrix().transform_point3(Vec3::ONE);
        assert!((p - Vec3::new(3.0, 4.0, 5.0)).length() < 1e-5);
    }

    #[test]
    fn missing_scene_file_falls_back() {
        let scene = SceneDescription::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(scene.objects.len(), SceneDescription::default().objects.len());
    }
}
