// Cameras
//
// Two controllers share one rig: an orbit camera (drag to rotate around a
// pivot in front of the camera, scroll to zoom) and a quake camera (mouse
// look + WASD). Exactly one is enabled; the other follows its transform so
// switching never jumps.

use glam::{Mat4, Quat, Vec3};

use crate::input::{InputState, Key, MouseButton};

/// Perspective camera. Looks along its local -Z axis.
#[derive(Clone, Debug, PartialEq)]
pub struct Camera {
    translation: Vec3,
    rotation: Quat,
    fov_y_degrees: f32,
    aspect_ratio: f32,
    near: f32,
    far: f32,
}

impl Camera {
    pub fn perspective(fov_y_degrees: f32, aspect_ratio: f32, near: f32, far: f32) -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            fov_y_degrees,
            aspect_ratio,
            near,
            far,
        }
    }

    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    pub fn set_translation(&mut self, translation: Vec3) {
        self.translation = translation;
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: Quat) {
        self.rotation = rotation.normalize();
    }

    /// Turn the camera to look along `direction` (world space, +Y up).
    pub fn look_along(&mut self, direction: Vec3) {
        let view = Mat4::look_to_rh(Vec3::ZERO, direction.normalize_or_zero(), Vec3::Y);
        self.rotation = Quat::from_mat4(&view.inverse()).normalize();
    }

    pub fn front(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    /// World transform (camera -> world).
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.translation)
    }

    /// Take over `other`'s transform, keeping our own projection.
    pub fn follow(&mut self, other: &Camera) {
        self.translation = other.translation;
        self.rotation = other.rotation;
    }

    pub fn view_matrix(&self) -> Mat4 {
        self.matrix().inverse()
    }

    /// Projection into Vulkan clip space (Y down, depth 0..1).
    pub fn projection_matrix(&self) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov_y_degrees.to_radians(), self.aspect_ratio, self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.aspect_ratio
    }

    pub fn set_aspect_ratio(&mut self, aspect_ratio: f32) {
        if aspect_ratio.is_finite() && aspect_ratio > 0.0 {
            self.aspect_ratio = aspect_ratio;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraKind {
    Orbit,
    Quake,
}

#[derive(Clone, Debug)]
pub struct OrbitCamera {
    pub camera: Camera,
    /// Distance from the camera to the point it orbits
    pub pivot_distance: f32,
    /// Radians per pixel
    pub rotate_speed: f32,
    /// Units per scroll step
    pub zoom_speed: f32,
}

impl OrbitCamera {
    fn update(&mut self, input: &InputState) {
        let front = self.camera.front();
        let pivot = self.camera.translation() + front * self.pivot_distance;

        if input.button_held(MouseButton::Left) {
            let (dx, dy) = input.mouse_delta();
            let rotation = Quat::from_rotation_y(-dx * self.rotate_speed)
                * Quat::from_axis_angle(self.camera.right(), -dy * self.rotate_speed);
            let offset = rotation * (self.camera.translation() - pivot);
            self.camera.set_translation(pivot + offset);
            self.camera.set_rotation(rotation * self.camera.rotation());
        }

        let zoom = input.scroll_delta() * self.zoom_speed;
        if zoom != 0.0 {
            let zoom = zoom.min(self.pivot_distance - 0.5);
            self.pivot_distance -= zoom;
            self.camera.set_translation(self.camera.translation() + front * zoom);
        }
    }
}

#[derive(Clone, Debug)]
pub struct QuakeCamera {
    pub camera: Camera,
    /// Units per second
    pub move_speed: f32,
    /// Radians per pixel
    pub look_speed: f32,
}

impl QuakeCamera {
    fn update(&mut self, input: &InputState, dt: f32) {
        let (dx, dy) = input.mouse_delta();
        let yawed = Quat::from_rotation_y(-dx * self.look_speed) * self.camera.rotation();
        let pitched = yawed * Quat::from_rotation_x(-dy * self.look_speed);
        // Don't flip over the poles
        if (pitched * Vec3::NEG_Z).y.abs() < 0.99 {
            self.camera.set_rotation(pitched);
        } else {
            self.camera.set_rotation(yawed);
        }

        let mut direction = Vec3::ZERO;
        let bindings = [
            (Key::W, self.camera.front()),
            (Key::S, -self.camera.front()),
            (Key::D, self.camera.right()),
            (Key::A, -self.camera.right()),
            (Key::E, Vec3::Y),
            (Key::Q, Vec3::NEG_Y),
        ];
        for (key, axis) in bindings {
            if input.held(key) {
                direction += axis;
            }
        }
        if direction != Vec3::ZERO {
            let boost = if input.held(Key::Shift) { 4.0 } else { 1.0 };
            let step = direction.normalize() * self.move_speed * boost * dt;
            self.camera.set_translation(self.camera.translation() + step);
        }
    }
}

/// Both cameras, exactly one enabled.
#[derive(Clone, Debug)]
pub struct CameraRig {
    orbit: OrbitCamera,
    quake: QuakeCamera,
    active: CameraKind,
    input_suspended: bool,
}

impl CameraRig {
    /// Both cameras start at `camera`'s transform; the orbit camera is enabled.
    pub fn new(camera: Camera) -> Self {
        Self {
            orbit: OrbitCamera { camera: camera.clone(), pivot_distance: 5.0, rotate_speed: 0.005, zoom_speed: 0.5 },
            quake: QuakeCamera { camera, move_speed: 3.0, look_speed: 0.002 },
            active: CameraKind::Orbit,
            input_suspended: false,
        }
    }

    pub fn active_kind(&self) -> CameraKind {
        self.active
    }

    pub fn is_enabled(&self, kind: CameraKind) -> bool {
        self.active == kind
    }

    /// Enable `kind`, which disables the other camera. The newly enabled
    /// camera takes over the current view.
    pub fn enable(&mut self, kind: CameraKind) {
        if self.active == kind {
            return;
        }
        self.sync();
        self.active = kind;
        log::info!("{:?} camera enabled", kind);
    }

    pub fn toggle_quake(&mut self) {
        self.enable(match self.active {
            CameraKind::Orbit => CameraKind::Quake,
            CameraKind::Quake => CameraKind::Orbit,
        });
    }

    pub fn active(&self) -> &Camera {
        match self.active {
            CameraKind::Orbit => &self.orbit.camera,
            CameraKind::Quake => &self.quake.camera,
        }
    }

    pub fn orbit(&self) -> &OrbitCamera {
        &self.orbit
    }

    pub fn quake(&self) -> &QuakeCamera {
        &self.quake
    }

    /// Copy the enabled camera's transform onto the disabled one.
    pub fn sync(&mut self) {
        match self.active {
            CameraKind::Orbit => self.quake.camera.follow(&self.orbit.camera),
            CameraKind::Quake => self.orbit.camera.follow(&self.quake.camera),
        }
    }

    /// While suspended (e.g. the overlay owns the mouse) cameras ignore input.
    pub fn set_input_suspended(&mut self, suspended: bool) {
        self.input_suspended = suspended;
    }

    pub fn input_suspended(&self) -> bool {
        self.input_suspended
    }

    pub fn set_aspect_ratio(&mut self, aspect_ratio: f32) {
        self.orbit.camera.set_aspect_ratio(aspect_ratio);
        self.quake.camera.set_aspect_ratio(aspect_ratio);
    }

    /// Move the enabled camera, then bring the other one along.
    pub fn update(&mut self, input: &InputState, dt: f32) {
        if !self.input_suspended {
            match self.active {
                CameraKind::Orbit => self.orbit.update(input),
                CameraKind::Quake => self.quake.update(input, dt),
            }
        }
        self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_camera() -> Camera {
        let mut camera = Camera::perspective(60.0, 16.0 / 9.0, 0.3, 1000.0);
        camera.set_translation(Vec3::new(-6.81, 1.71, -0.72));
        camera.look_along(Vec3::X);
        camera
    }

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn look_along_sets_front() {
        let camera = start_camera();
        assert!(close(camera.front(), Vec3::X));
        assert!(close(camera.up(), Vec3::Y));
        let eye_in_view = camera.view_matrix().transform_point3(camera.translation());
        assert!(close(eye_in_view, Vec3::ZERO));
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let camera = start_camera();
        let proj = camera.projection_matrix();
        assert!(proj.y_axis.y < 0.0);
        // A point above the view axis ends up with negative clip-space y
        let clip = proj * glam::Vec4::new(0.0, 1.0, -5.0, 1.0);
        assert!(clip.y < 0.0);
    }

    #[test]
    fn exactly_one_camera_enabled() {
        let mut rig = CameraRig::new(start_camera());
        assert!(rig.is_enabled(CameraKind::Orbit));
        assert!(!rig.is_enabled(CameraKind::Quake));

        rig.enable(CameraKind::Quake);
        assert!(rig.is_enabled(CameraKind::Quake));
        assert!(!rig.is_enabled(CameraKind::Orbit));

        rig.toggle_quake();
        assert!(rig.is_enabled(CameraKind::Orbit));
        assert!(!rig.is_enabled(CameraKind::Quake));
    }

    #[test]
    fn disabled_camera_follows_enabled_one() {
        let mut rig = CameraRig::new(start_camera());
        rig.enable(CameraKind::Quake);

        let mut input = InputState::new();
        input.key_down(Key::W);
        rig.update(&input, 1.0);

        let moved = rig.quake().camera.translation();
        assert!(close(moved, Vec3::new(-6.81 + 3.0, 1.71, -0.72)));
        assert!(close(rig.orbit().camera.translation(), moved));

        rig.enable(CameraKind::Orbit);
        assert!(close(rig.active().translation(), moved));
    }

    #[test]
    fn suspended_input_is_ignored() {
        let mut rig = CameraRig::new(start_camera());
        rig.enable(CameraKind::Quake);
        rig.set_input_suspended(true);

        let mut input = InputState::new();
        input.key_down(Key::W);
        input.mouse_moved(100.0, 50.0);
        rig.update(&input, 1.0);
        assert_eq!(rig.active(), &start_camera());
    }

    #[test]
    fn orbit_keeps_distance_to_pivot() {
        let mut rig = CameraRig::new(start_camera());
        let pivot = start_camera().translation() + Vec3::X * 5.0;

        let mut input = InputState::new();
        input.button_down(MouseButton::Left);
        input.mouse_moved(120.0, 30.0);
        rig.update(&input, 0.016);

        let camera = rig.active();
        assert!(((camera.translation() - pivot).length() - 5.0).abs() < 1e-3);
        // Still looking at the pivot
        assert!(close(camera.translation() + camera.front() * 5.0, pivot));
    }

    #[test]
    fn aspect_ratio_applies_to_both() {
        let mut rig = CameraRig::new(start_camera());
        rig.set_aspect_ratio(2.0);
        assert_eq!(rig.orbit().camera.aspect_ratio(), 2.0);
        assert_eq!(rig.quake().camera.aspect_ratio(), 2.0);
        rig.set_aspect_ratio(f32::NAN);
        assert_eq!(rig.active().aspect_ratio(), 2.0);
    }
}
