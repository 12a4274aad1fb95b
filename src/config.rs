// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Missing sections and keys fall back to defaults; invalid values are
// rejected by `validate`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::LogicError;
use crate::frame::LightWait;
use crate::input::Key;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
    pub scene: SceneConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Light Sync Renderer".to_string(),
            width: 1920,
            height: 1080,
            fullscreen: false,
        }
    }
}

/// Which GpuBackend drives the frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Vulkan,
    /// No window, no GPU: simulate frames and report synchronization hazards
    Headless,
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub backend: BackendKind,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    pub presentable_images: u32,
    /// Where the light transfer is waited on
    pub light_wait: LightWait,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Vulkan,
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 3,
            presentable_images: 5,
            light_wait: LightWait::FragmentShader,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    /// Frames simulated by the headless backend
    pub headless_frames: u64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "lightsync_debug.log".to_string(),
            show_fps: true,
            headless_frames: 300,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
    pub toggle_quake_camera_key: String,
    pub strength_up_key: String,
    pub strength_down_key: String,
    pub toggle_sky_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
            toggle_quake_camera_key: "F1".to_string(),
            strength_up_key: "PageUp".to_string(),
            strength_down_key: "PageDown".to_string(),
            toggle_sky_key: "F2".to_string(),
        }
    }
}

/// Scene, shaders and camera
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub path: PathBuf,
    pub shader_dir: PathBuf,
    /// Recompile and rebuild pipelines when shader sources change
    pub hot_reload: bool,
    pub normal_mapping_strength: f32,
    pub camera_position: [f32; 3],
    pub camera_direction: [f32; 3],
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("assets/scene.toml"),
            shader_dir: PathBuf::from("shaders"),
            hot_reload: true,
            normal_mapping_strength: 0.5,
            camera_position: [-6.81, 1.71, -0.72],
            camera_direction: [1.0, 0.0, 0.0],
            fov_degrees: 60.0,
            near: 0.3,
            far: 1000.0,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found.
    /// A file that exists but is unreadable or invalid is an error.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate().with_context(|| format!("Invalid config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Reject values the renderer can't work with
    pub fn validate(&self) -> Result<(), LogicError> {
        let invalid = |msg: String| Err(LogicError::InvalidConfig(msg));

        if self.graphics.max_frames_in_flight == 0 {
            return invalid("graphics.max_frames_in_flight must be at least 1".to_string());
        }
        if self.graphics.presentable_images == 0 {
            return invalid("graphics.presentable_images must be at least 1".to_string());
        }
        let strength = self.scene.normal_mapping_strength;
        if !(0.0..=1.0).contains(&strength) {
            return invalid(format!("scene.normal_mapping_strength {} is outside [0, 1]", strength));
        }
        if !(self.scene.fov_degrees > 0.0 && self.scene.fov_degrees < 180.0) {
            return invalid(format!("scene.fov_degrees {} is outside (0, 180)", self.scene.fov_degrees));
        }
        if !(self.scene.near > 0.0 && self.scene.far > self.scene.near) {
            return invalid(format!("scene.near/far {} / {} are not ordered", self.scene.near, self.scene.far));
        }
        for name in [
            &self.controls.fullscreen_key,
            &self.controls.quit_key,
            &self.controls.toggle_quake_camera_key,
            &self.controls.strength_up_key,
            &self.controls.strength_down_key,
            &self.controls.toggle_sky_key,
        ] {
            Key::from_name(name)?;
        }
        Ok(())
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}
