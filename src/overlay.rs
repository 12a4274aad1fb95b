// Overlay
//
// The renderer invokes one injected callback per frame with mutable access to
// the render settings, the cameras and the input. The default callback is a
// keyboard-driven settings panel that also publishes a status line.

use crate::config::ControlsConfig;
use crate::diagnostics::FrameRateHistory;
use crate::error::LogicError;
use crate::input::{InputState, Key};
use crate::scene::{CameraKind, CameraRig};

pub const STRENGTH_STEP: f32 = 0.05;

/// Settings the overlay may change; read by the renderer every frame.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderSettings {
    /// Normal mapping strength in [0, 1]
    pub normal_mapping_strength: f32,
    pub draw_sky: bool,
}

impl RenderSettings {
    pub fn set_normal_mapping_strength(&mut self, strength: f32) {
        self.normal_mapping_strength = strength.clamp(0.0, 1.0);
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self { normal_mapping_strength: 0.5, draw_sky: true }
    }
}

/// What the overlay callback sees each frame.
pub struct OverlayFrame<'a> {
    pub settings: &'a mut RenderSettings,
    pub cameras: &'a mut CameraRig,
    pub input: &'a mut InputState,
    pub frame_rates: &'a FrameRateHistory,
    status: Option<String>,
}

impl<'a> OverlayFrame<'a> {
    pub fn new(
        settings: &'a mut RenderSettings,
        cameras: &'a mut CameraRig,
        input: &'a mut InputState,
        frame_rates: &'a FrameRateHistory,
    ) -> Self {
        Self { settings, cameras, input, frame_rates, status: None }
    }

    pub fn set_status(&mut self, text: impl Into<String>) {
        self.status = Some(text.into());
    }

    pub fn take_status(&mut self) -> Option<String> {
        self.status.take()
    }
}

pub type OverlayCallback = Box<dyn FnMut(&mut OverlayFrame<'_>)>;

/// Keys used by the settings panel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PanelBindings {
    pub quit: Key,
    pub toggle_quake_camera: Key,
    pub strength_up: Key,
    pub strength_down: Key,
    pub toggle_sky: Key,
}

impl PanelBindings {
    pub fn from_config(controls: &ControlsConfig) -> Result<Self, LogicError> {
        Ok(Self {
            quit: Key::from_name(&controls.quit_key)?,
            toggle_quake_camera: Key::from_name(&controls.toggle_quake_camera_key)?,
            strength_up: Key::from_name(&controls.strength_up_key)?,
            strength_down: Key::from_name(&controls.strength_down_key)?,
            toggle_sky: Key::from_name(&controls.toggle_sky_key)?,
        })
    }
}

impl Default for PanelBindings {
    fn default() -> Self {
        Self {
            quit: Key::Escape,
            toggle_quake_camera: Key::F(1),
            strength_up: Key::PageUp,
            strength_down: Key::PageDown,
            toggle_sky: Key::F(2),
        }
    }
}

/// The default overlay: camera switching, normal-mapping strength, sky toggle
/// and a status line, optionally led by the recent frame rate.
///
/// While Control is held the panel owns the mouse: the wheel adjusts the
/// normal mapping strength and the cameras ignore input.
pub fn settings_panel(bindings: PanelBindings, show_fps: bool) -> OverlayCallback {
    Box::new(move |frame: &mut OverlayFrame<'_>| {
        let focused = frame.input.held(Key::Control);
        frame.cameras.set_input_suspended(focused);
        if focused && frame.input.scroll_delta() != 0.0 {
            let strength = frame.settings.normal_mapping_strength + frame.input.scroll_delta() * STRENGTH_STEP;
            frame.settings.set_normal_mapping_strength(strength);
        }

        if frame.input.consume_press(bindings.toggle_quake_camera) {
            frame.cameras.toggle_quake();
        }
        // Quit leaves the quake camera instead of the application
        if frame.cameras.is_enabled(CameraKind::Quake) && frame.input.consume_press(bindings.quit) {
            frame.cameras.enable(CameraKind::Orbit);
        }

        if frame.input.consume_press(bindings.strength_up) {
            let strength = frame.settings.normal_mapping_strength + STRENGTH_STEP;
            frame.settings.set_normal_mapping_strength(strength);
        }
        if frame.input.consume_press(bindings.strength_down) {
            let strength = frame.settings.normal_mapping_strength - STRENGTH_STEP;
            frame.settings.set_normal_mapping_strength(strength);
        }
        if frame.input.consume_press(bindings.toggle_sky) {
            frame.settings.draw_sky = !frame.settings.draw_sky;
        }

        let mut status = format!(
            "{:?} camera | normal mapping {:.2} | sky {}",
            frame.cameras.active_kind(),
            frame.settings.normal_mapping_strength,
            if frame.settings.draw_sky { "on" } else { "off" }
        );
        if show_fps {
            let fps = frame.frame_rates.latest().unwrap_or(0.0);
            status = format!("{:.0} FPS | {}", fps, status);
        }
        frame.set_status(status);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::SAMPLES_PER_AVERAGE;
    use crate::scene::Camera;

    struct Harness {
        settings: RenderSettings,
        cameras: CameraRig,
        input: InputState,
        fps: FrameRateHistory,
        panel: OverlayCallback,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                settings: RenderSettings::default(),
                cameras: CameraRig::new(Camera::perspective(60.0, 1.0, 0.3, 1000.0)),
                input: InputState::new(),
                fps: FrameRateHistory::default(),
                panel: settings_panel(PanelBindings::default(), true),
            }
        }

        fn run_frame(&mut self) -> Option<String> {
            let mut frame = OverlayFrame::new(&mut self.settings, &mut self.cameras, &mut self.input, &self.fps);
            (self.panel)(&mut frame);
            let status = frame.take_status();
            self.input.end_frame();
            status
        }

        fn press(&mut self, key: Key) -> Option<String> {
            self.input.key_down(key);
            let mut frame = OverlayFrame::new(&mut self.settings, &mut self.cameras, &mut self.input, &self.fps);
            (self.panel)(&mut frame);
            let status = frame.take_status();
            self.input.key_up(key);
            self.input.end_frame();
            status
        }
    }

    #[test]
    fn strength_is_clamped() {
        let mut h = Harness::new();
        for _ in 0..20 {
            h.press(Key::PageUp);
        }
        assert_eq!(h.settings.normal_mapping_strength, 1.0);
        for _ in 0..30 {
            h.press(Key::PageDown);
        }
        assert_eq!(h.settings.normal_mapping_strength, 0.0);
    }

    #[test]
    fn quit_key_leaves_quake_camera() {
        let mut h = Harness::new();
        h.press(Key::F(1));
        assert!(h.cameras.is_enabled(CameraKind::Quake));

        h.input.key_down(Key::Escape);
        let mut frame = OverlayFrame::new(&mut h.settings, &mut h.cameras, &mut h.input, &h.fps);
        (h.panel)(&mut frame);
        assert!(h.cameras.is_enabled(CameraKind::Orbit));
        // The press is used up, nobody else sees it this frame
        assert!(!h.input.pressed(Key::Escape));
    }

    #[test]
    fn quit_key_is_left_alone_for_orbit_camera() {
        let mut h = Harness::new();
        h.input.key_down(Key::Escape);
        let mut frame = OverlayFrame::new(&mut h.settings, &mut h.cameras, &mut h.input, &h.fps);
        (h.panel)(&mut frame);
        assert!(h.input.pressed(Key::Escape));
    }

    #[test]
    fn publishes_status() {
        let mut h = Harness::new();
        let status = h.press(Key::F(2)).unwrap();
        assert!(!h.settings.draw_sky);
        assert!(status.contains("Orbit camera"));
        assert!(status.contains("sky off"));
    }

    #[test]
    fn status_leads_with_fps_when_enabled() {
        let mut h = Harness::new();
        for _ in 0..SAMPLES_PER_AVERAGE {
            h.fps.record(120.0);
        }
        let status = h.press(Key::F(2)).unwrap();
        assert!(status.starts_with("120 FPS | "));
    }

    #[test]
    fn status_omits_fps_when_disabled() {
        let mut h = Harness::new();
        h.panel = settings_panel(PanelBindings::default(), false);
        for _ in 0..SAMPLES_PER_AVERAGE {
            h.fps.record(120.0);
        }
        let status = h.press(Key::F(2)).unwrap();
        assert!(!status.contains("FPS"));
        assert!(status.starts_with("Orbit camera"));
    }

    #[test]
    fn control_hands_the_mouse_to_the_panel() {
        let mut h = Harness::new();
        h.input.key_down(Key::Control);
        h.input.scrolled(2.0);
        h.run_frame();
        assert!(h.cameras.input_suspended());
        assert!((h.settings.normal_mapping_strength - (0.5 + 2.0 * STRENGTH_STEP)).abs() < 1e-6);

        h.input.key_up(Key::Control);
        h.input.scrolled(2.0);
        h.run_frame();
        assert!(!h.cameras.input_suspended());
        assert!((h.settings.normal_mapping_strength - (0.5 + 2.0 * STRENGTH_STEP)).abs() < 1e-6);
    }
}
