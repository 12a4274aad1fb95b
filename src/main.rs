// =============================================================================
// LIGHT SYNC RENDERER - Frame-synchronized Blinn-Phong scene renderer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, input, resize, close)                │
// │    └── Composition (frame participants, updater events)         │
// │          └── SceneRenderer (cameras, lights, overlay)           │
// │                └── FrameProtocol (tokens, waits, lifetimes)     │
// │                      └── GpuBackend: Vulkan or headless         │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Deliver updater events (swapchain changed, shaders changed)
// 2. Participant updates (overlay, cameras)
// 3. Wait for the frame slot, acquire the next image
// 4. Host-visible uniform write, light transfer, record + submit
// 5. Present, advance to the next frame
//
// =============================================================================

mod app;
mod backend;
mod config;
mod diagnostics;
mod error;
mod frame;
mod input;
mod overlay;
mod participant;
mod scene;
mod updater;

use anyhow::{bail, Context, Result};
use app::SceneRenderer;
use backend::VulkanBackend;
use config::{BackendKind, Config, DebugConfig};
use error::categorize;
use frame::{GpuBackend, HeadlessBackend};
use input::{InputState, Key, MouseButton};
use participant::{Composition, Flow};
use scene::SceneDescription;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use updater::{ShaderWatcher, Updater};
use winit::{
    application::ApplicationHandler,
    event::{DeviceEvent, ElementState, MouseScrollDelta, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

const CONFIG_PATH: &str = "config.toml";

/// Simulated frame rate of the headless backend
const HEADLESS_TIMESTEP: f32 = 1.0 / 60.0;

// Pixels per scroll "line" for touchpads reporting pixel deltas
const PIXELS_PER_LINE: f32 = 40.0;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> ExitCode {
    let config = Config::load_from_path(CONFIG_PATH);

    // Initialize logging before anything else can fail loudly
    init_logging(config.as_ref().ok().map(|c| &c.debug));
    log::info!("Starting light sync renderer");

    match config.and_then(run) {
        Ok(()) => {
            log::info!("Exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Exiting on {} error: {:?}", categorize(&e), e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging with optional file output
fn init_logging(debug: Option<&DebugConfig>) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if let Some(debug) = debug.filter(|d| d.log_to_file) {
        match OpenOptions::new().create(true).write(true).truncate(true).open(&debug.log_file) {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Light Sync Renderer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {:?}: {}", debug.log_file, e),
        }
    }

    builder.init();
}

fn run(config: Config) -> Result<()> {
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}, light wait: {:?}", config.graphics.present_mode, config.graphics.light_wait);

    let scene = SceneDescription::load_from_path(&config.scene.path)?;

    match config.graphics.backend {
        BackendKind::Headless => run_headless(&config, scene),
        BackendKind::Vulkan => run_windowed(config, scene),
    }
}

// =============================================================================
// HEADLESS: simulate frames and report synchronization hazards
// =============================================================================

fn run_headless(config: &Config, scene: SceneDescription) -> Result<()> {
    let backend = HeadlessBackend::new(config.graphics.max_frames_in_flight, config.window.width, config.window.height);
    let mut composition = Composition::new(backend).with_fixed_timestep(HEADLESS_TIMESTEP);
    composition.add(SceneRenderer::with_settings_panel(scene, config)?);

    let frames = composition.run_frames(config.debug.headless_frames)?;
    composition.shutdown()?;

    let hazards = composition.backend_mut().take_hazards();
    for hazard in &hazards {
        log::warn!("{}", hazard);
    }
    log::info!("Simulated {} frames with {} hazards", frames, hazards.len());

    if !hazards.is_empty() {
        bail!("{} synchronization hazards detected", hazards.len());
    }
    Ok(())
}

// =============================================================================
// WINDOWED: Vulkan backend driven by winit
// =============================================================================

fn run_windowed(config: Config, scene: SceneDescription) -> Result<()> {
    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, scene)?;
    event_loop.run_app(&mut app)?;
    app.finish()
}

/// Window plus the composition rendering into it.
///
/// IMPORTANT: the composition owns the Vulkan backend, which must be dropped
/// before the window it presents to.
struct App {
    config: Config,
    scene: Option<SceneDescription>,
    fullscreen_key: Key,

    composition: Option<Composition<VulkanBackend>>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    /// Window size is zero: nothing to render to
    is_minimized: bool,
    error: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config, scene: SceneDescription) -> Result<Self> {
        let fullscreen_key = Key::from_name(&config.controls.fullscreen_key)?;
        let is_fullscreen = config.window.fullscreen;
        Ok(Self {
            config,
            scene: Some(scene),
            fullscreen_key,
            composition: None,
            window: None,
            is_fullscreen,
            is_minimized: false,
            error: None,
        })
    }

    /// Window, backend and renderer. Called once when the event loop resumes.
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(self.config.window.width, self.config.window.height));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = Arc::new(event_loop.create_window(window_attributes).context("Failed to create window")?);
        let backend = VulkanBackend::new(window.clone(), &self.config)?;

        let updater = if self.config.scene.hot_reload {
            match ShaderWatcher::new(&self.config.scene.shader_dir) {
                Ok(watcher) => Updater::with_shader_watcher(watcher),
                Err(e) => {
                    log::warn!("Shader hot reload disabled: {:?}", e);
                    Updater::new()
                }
            }
        } else {
            Updater::new()
        };

        let scene = self.scene.take().context("Renderer already initialized")?;
        let mut composition = Composition::new(backend).with_updater(updater);
        composition.add(SceneRenderer::with_settings_panel(scene, &self.config)?);
        composition.initialize()?;

        self.composition = Some(composition);
        self.window = Some(window);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:?}", error);
        self.error.get_or_insert(error);
        event_loop.exit();
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            return;
        }
        let Some(composition) = self.composition.as_mut() else {
            return;
        };
        match composition.tick() {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => event_loop.exit(),
            Err(e) => self.fail(event_loop, e.context("Render error")),
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows recreates the swapchain
        }
    }

    fn input(&mut self) -> Option<&mut InputState> {
        self.composition.as_mut().map(|c| c.input_mut())
    }

    /// Wait for the GPU, drop everything, report the first error.
    fn finish(&mut self) -> Result<()> {
        if let Some(mut composition) = self.composition.take() {
            if let Err(e) = composition.shutdown() {
                self.error.get_or_insert(e);
            }
            log::info!("Rendered {} frames", composition.frames_rendered());
        }
        self.window = None;
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.error.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e.context("Failed to initialize renderer"));
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST: the renderer stops on its next update
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                let ticking = !self.is_minimized;
                match self.input() {
                    Some(input) if ticking => input.request_close(),
                    _ => event_loop.exit(),
                }
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.is_minimized = size.width == 0 || size.height == 0;
                if let Some(composition) = self.composition.as_mut() {
                    composition.backend_mut().surface_resized(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(code) = event.physical_key else {
                    return;
                };
                let Some(key) = map_key(code) else {
                    return;
                };
                if event.state.is_pressed() {
                    if key == self.fullscreen_key && !event.repeat {
                        self.toggle_fullscreen();
                    }
                    if let Some(input) = self.input() {
                        input.key_down(key);
                    }
                } else if let Some(input) = self.input() {
                    input.key_up(key);
                }
            }

            WindowEvent::MouseInput { state, button, .. } => {
                let Some(button) = map_button(button) else {
                    return;
                };
                if let Some(input) = self.input() {
                    match state {
                        ElementState::Pressed => input.button_down(button),
                        ElementState::Released => input.button_up(button),
                    }
                }
            }

            WindowEvent::MouseWheel { delta, .. } => {
                let lines = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(position) => position.y as f32 / PIXELS_PER_LINE,
                };
                if let Some(input) = self.input() {
                    input.scrolled(lines);
                }
            }

            _ => {}
        }
    }

    /// Raw mouse motion; unaffected by the cursor hitting the window edge
    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _device_id: winit::event::DeviceId, event: DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            if let Some(input) = self.input() {
                input.mouse_moved(dx as f32, dy as f32);
            }
        }
    }

    /// Request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

fn map_key(code: KeyCode) -> Option<Key> {
    let key = match code {
        KeyCode::KeyW => Key::W,
        KeyCode::KeyA => Key::A,
        KeyCode::KeyS => Key::S,
        KeyCode::KeyD => Key::D,
        KeyCode::KeyQ => Key::Q,
        KeyCode::KeyE => Key::E,
        KeyCode::Space => Key::Space,
        KeyCode::ShiftLeft | KeyCode::ShiftRight => Key::Shift,
        KeyCode::ControlLeft | KeyCode::ControlRight => Key::Control,
        KeyCode::Escape => Key::Escape,
        KeyCode::Tab => Key::Tab,
        KeyCode::Enter => Key::Enter,
        KeyCode::ArrowUp => Key::Up,
        KeyCode::ArrowDown => Key::Down,
        KeyCode::ArrowLeft => Key::Left,
        KeyCode::ArrowRight => Key::Right,
        KeyCode::PageUp => Key::PageUp,
        KeyCode::PageDown => Key::PageDown,
        KeyCode::F1 => Key::F(1),
        KeyCode::F2 => Key::F(2),
        KeyCode::F3 => Key::F(3),
        KeyCode::F4 => Key::F(4),
        KeyCode::F5 => Key::F(5),
        KeyCode::F6 => Key::F(6),
        KeyCode::F7 => Key::F(7),
        KeyCode::F8 => Key::F(8),
        KeyCode::F9 => Key::F(9),
        KeyCode::F10 => Key::F(10),
        KeyCode::F11 => Key::F(11),
        KeyCode::F12 => Key::F(12),
        _ => return None,
    };
    Some(key)
}

fn map_button(button: winit::event::MouseButton) -> Option<MouseButton> {
    match button {
        winit::event::MouseButton::Left => Some(MouseButton::Left),
        winit::event::MouseButton::Right => Some(MouseButton::Right),
        winit::event::MouseButton::Middle => Some(MouseButton::Middle),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configurable_keys_have_window_mappings() {
        let controls = config::ControlsConfig::default();
        for name in [
            &controls.fullscreen_key,
            &controls.quit_key,
            &controls.toggle_quake_camera_key,
            &controls.strength_up_key,
            &controls.strength_down_key,
            &controls.toggle_sky_key,
        ] {
            let key = Key::from_name(name).unwrap();
            let mapped = [
                KeyCode::Escape,
                KeyCode::F1,
                KeyCode::F2,
                KeyCode::F11,
                KeyCode::PageUp,
                KeyCode::PageDown,
            ]
            .into_iter()
            .filter_map(map_key)
            .any(|k| k == key);
            assert!(mapped, "{} has no window mapping", name);
        }
    }

    #[test]
    fn default_scene_runs_headless_without_hazards() {
        let mut config = Config::default();
        config.graphics.backend = BackendKind::Headless;
        config.debug.headless_frames = 12;
        assert!(run_headless(&config, SceneDescription::default()).is_ok());
    }

    #[test]
    fn present_only_wait_fails_the_headless_run() {
        let mut config = Config::default();
        config.graphics.light_wait = frame::LightWait::PresentOnly;
        config.debug.headless_frames = 4;
        let err = run_headless(&config, SceneDescription::default()).unwrap_err();
        assert_eq!(categorize(&err), error::ErrorCategory::Runtime);
        assert!(err.to_string().contains("hazards"));
    }
}
