// Scene data: GPU layouts, lights, cameras, geometry and scene files

pub mod camera;
pub mod geometry;
pub mod lights;
pub mod loader;
pub mod uniforms;

pub use camera::{Camera, CameraKind, CameraRig};
pub use lights::{LightKind, LightSource, LightSourceBlock, MAX_NUMBER_OF_LIGHTSOURCES};
pub use loader::{DrawCall, LoadedScene, SceneDescription};
pub use uniforms::{FrameUniforms, MaterialGpuData, PushConstants};
