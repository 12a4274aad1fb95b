// Light sources
//
// Lights are grouped by category in the GPU block so the fragment shader can
// loop over each category with a single [begin, end) range:
//
//   ranges_ambient_directional = [amb.begin, amb.end, dir.begin, dir.end]
//   ranges_point_spot          = [point.begin, point.end, spot.begin, spot.end]
//
// Records past the last active light are zero.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec4, Vec3, Vec4};
use serde::Deserialize;

use crate::error::LogicError;

/// Must match MAX_NUMBER_OF_LIGHTSOURCES in shaders/lightsource_limits.glsl
pub const MAX_NUMBER_OF_LIGHTSOURCES: usize = 128;

/// Light categories, in the order they are packed into the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightKind {
    Ambient,
    Directional,
    Point,
    Spot,
}

impl LightKind {
    pub const ALL: [LightKind; 4] = [LightKind::Ambient, LightKind::Directional, LightKind::Point, LightKind::Spot];

    fn index(self) -> usize {
        self as usize
    }
}

/// Circular motion around the light's base position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightAnimation {
    pub radius: f32,
    /// Radians per second
    pub speed: f32,
    pub phase: f32,
}

/// A light source in world space.
#[derive(Clone, Debug, PartialEq)]
pub struct LightSource {
    pub kind: LightKind,
    pub enabled: bool,
    pub color: Vec3,
    pub intensity: f32,
    pub position: Vec3,
    pub direction: Vec3,
    /// (constant, linear, quadratic)
    pub attenuation: Vec3,
    /// Full cone angles in degrees, spot lights only
    pub inner_angle: f32,
    pub outer_angle: f32,
    pub falloff: f32,
    pub animation: Option<LightAnimation>,
}

impl LightSource {
    pub fn new(kind: LightKind, color: Vec3) -> Self {
        Self {
            kind,
            enabled: true,
            color,
            intensity: 1.0,
            position: Vec3::ZERO,
            direction: Vec3::NEG_Y,
            attenuation: Vec3::new(1.0, 0.1, 0.01),
            inner_angle: 30.0,
            outer_angle: 45.0,
            falloff: 1.0,
            animation: None,
        }
    }

    pub fn ambient(color: Vec3) -> Self {
        Self::new(LightKind::Ambient, color)
    }

    pub fn directional(color: Vec3, direction: Vec3) -> Self {
        Self { direction, ..Self::new(LightKind::Directional, color) }
    }

    pub fn point(color: Vec3, position: Vec3) -> Self {
        Self { position, ..Self::new(LightKind::Point, color) }
    }

    pub fn spot(color: Vec3, position: Vec3, direction: Vec3) -> Self {
        Self { position, direction, ..Self::new(LightKind::Spot, color) }
    }

    /// This light as seen at time `t` (seconds). Pure: same `t`, same result.
    pub fn at_time(&self, t: f32) -> LightSource {
        let mut light = self.clone();
        if let Some(anim) = self.animation {
            let angle = anim.phase + anim.speed * t;
            light.position += Vec3::new(angle.cos(), 0.0, angle.sin()) * anim.radius;
        }
        light
    }

    /// GPU record with position and direction transformed into view space.
    pub fn to_gpu(&self, view: Mat4) -> LightGpuData {
        let position = view * self.position.extend(1.0);
        let direction = (view * self.direction.extend(0.0)).truncate().normalize_or_zero();
        LightGpuData {
            color: self.color.extend(self.intensity),
            direction: direction.extend(0.0),
            position,
            angles: Vec4::new(
                (self.outer_angle.to_radians() * 0.5).cos(),
                (self.inner_angle.to_radians() * 0.5).cos(),
                self.falloff,
                0.0,
            ),
            attenuation: self.attenuation.extend(0.0),
            info: UVec4::new(self.kind as u32, 0, 0, 0),
        }
    }
}

/// One light record in the light storage buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LightGpuData {
    /// rgb = color, w = intensity
    pub color: Vec4,
    pub direction: Vec4,
    pub position: Vec4,
    /// cos(outer / 2), cos(inner / 2), falloff, unused
    pub angles: Vec4,
    /// constant, linear, quadratic, unused
    pub attenuation: Vec4,
    /// x = LightKind
    pub info: UVec4,
}

/// Half-open index range of one category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LightRange {
    pub begin: u32,
    pub end: u32,
}

impl LightRange {
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }
}

/// The light storage buffer (set 1, binding 1).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct LightSourceBlock {
    pub ranges_ambient_directional: UVec4,
    pub ranges_point_spot: UVec4,
    pub lights: [LightGpuData; MAX_NUMBER_OF_LIGHTSOURCES],
}

impl LightSourceBlock {
    /// Pack the enabled lights, grouped by category in declaration order.
    pub fn build(lights: &[LightSource], view: Mat4) -> Result<Self, LogicError> {
        let mut active: Vec<&LightSource> = lights.iter().filter(|l| l.enabled).collect();
        if active.len() > MAX_NUMBER_OF_LIGHTSOURCES {
            return Err(LogicError::LightCapacityExceeded {
                count: active.len(),
                capacity: MAX_NUMBER_OF_LIGHTSOURCES,
            });
        }
        // Stable: lights of one kind keep their relative order
        active.sort_by_key(|l| l.kind);

        let mut ranges = [LightRange::default(); 4];
        let mut cursor = 0u32;
        for kind in LightKind::ALL {
            let count = active.iter().filter(|l| l.kind == kind).count() as u32;
            ranges[kind.index()] = LightRange { begin: cursor, end: cursor + count };
            cursor += count;
        }

        let mut block = Self::zeroed();
        block.set_ranges(ranges);
        for (slot, light) in block.lights.iter_mut().zip(&active) {
            *slot = light.to_gpu(view);
        }
        Ok(block)
    }

    fn set_ranges(&mut self, r: [LightRange; 4]) {
        self.ranges_ambient_directional = UVec4::new(r[0].begin, r[0].end, r[1].begin, r[1].end);
        self.ranges_point_spot = UVec4::new(r[2].begin, r[2].end, r[3].begin, r[3].end);
    }

    pub fn range(&self, kind: LightKind) -> LightRange {
        let (packed, offset) = match kind {
            LightKind::Ambient => (self.ranges_ambient_directional, 0),
            LightKind::Directional => (self.ranges_ambient_directional, 2),
            LightKind::Point => (self.ranges_point_spot, 0),
            LightKind::Spot => (self.ranges_point_spot, 2),
        };
        let values = packed.to_array();
        LightRange { begin: values[offset], end: values[offset + 1] }
    }

    pub fn active_count(&self) -> u32 {
        LightKind::ALL.iter().map(|k| self.range(*k).len()).sum()
    }

    /// Check the range invariants: ordered, in bounds, disjoint, tagged with
    /// their category, and zero past the last active light.
    pub fn validate(&self) -> Result<(), String> {
        let capacity = MAX_NUMBER_OF_LIGHTSOURCES as u32;
        let mut covered = vec![false; MAX_NUMBER_OF_LIGHTSOURCES];
        for kind in LightKind::ALL {
            let range = self.range(kind);
            if range.end < range.begin {
                return Err(format!("{:?} range ends before it begins: {:?}", kind, range));
            }
            if range.end > capacity {
                return Err(format!("{:?} range exceeds capacity: {:?}", kind, range));
            }
            for i in range.begin..range.end {
                let i = i as usize;
                if covered[i] {
                    return Err(format!("light {} is in more than one range", i));
                }
                covered[i] = true;
                if self.lights[i].info.x != kind as u32 {
                    return Err(format!("light {} is not a {:?} light", i, kind));
                }
            }
        }
        let active = covered.iter().filter(|c| **c).count();
        if covered[active..].iter().any(|c| *c) {
            return Err("active lights are not contiguous".to_string());
        }
        if self.lights[active..].iter().any(|l| *l != LightGpuData::zeroed()) {
            return Err("unused light records are not zero".to_string());
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Lights at time `t`, for one frame.
pub fn animate_lights(lights: &[LightSource], t: f32) -> Vec<LightSource> {
    lights.iter().map(|l| l.at_time(t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_a() -> Vec<LightSource> {
        vec![
            LightSource::ambient(Vec3::splat(0.1)),
            LightSource::directional(Vec3::ONE, Vec3::new(-1.0, -1.0, 0.0)),
            LightSource::ambient(Vec3::splat(0.05)),
        ]
    }

    #[test]
    fn gpu_record_layout() {
        assert_eq!(std::mem::size_of::<LightGpuData>(), 96);
        assert_eq!(
            std::mem::size_of::<LightSourceBlock>(),
            32 + 96 * MAX_NUMBER_OF_LIGHTSOURCES
        );
    }

    #[test]
    fn two_ambient_one_directional() {
        let block = LightSourceBlock::build(&scenario_a(), Mat4::IDENTITY).unwrap();

        assert_eq!(block.range(LightKind::Ambient), LightRange { begin: 0, end: 2 });
        assert_eq!(block.range(LightKind::Directional), LightRange { begin: 2, end: 3 });
        assert_eq!(block.range(LightKind::Point), LightRange { begin: 3, end: 3 });
        assert_eq!(block.range(LightKind::Spot), LightRange { begin: 3, end: 3 });
        assert_eq!(block.ranges_ambient_directional, UVec4::new(0, 2, 2, 3));
        assert_eq!(block.ranges_point_spot, UVec4::new(3, 3, 3, 3));

        // Declaration order is kept within a category
        assert_eq!(block.lights[0].color.x, 0.1);
        assert_eq!(block.lights[1].color.x, 0.05);
        assert_eq!(block.validate(), Ok(()));
    }

    #[test]
    fn ranges_stay_disjoint_for_mixed_input() {
        let mut lights = Vec::new();
        for i in 0..20 {
            let kind = LightKind::ALL[(i * 7) % 4];
            let mut light = LightSource::new(kind, Vec3::ONE);
            light.enabled = i % 5 != 0;
            lights.push(light);
        }
        let block = LightSourceBlock::build(&lights, Mat4::IDENTITY).unwrap();
        assert_eq!(block.validate(), Ok(()));
        assert_eq!(block.active_count(), 16);

        let mut previous_end = 0;
        for kind in LightKind::ALL {
            let range = block.range(kind);
            assert!(range.begin <= range.end);
            assert_eq!(range.begin, previous_end);
            previous_end = range.end;
        }
    }

    #[test]
    fn no_lights_is_valid() {
        let block = LightSourceBlock::build(&[], Mat4::IDENTITY).unwrap();
        assert_eq!(block.active_count(), 0);
        assert_eq!(block.validate(), Ok(()));
    }

    #[test]
    fn capacity_is_enforced() {
        let lights = vec![LightSource::point(Vec3::ONE, Vec3::ZERO); MAX_NUMBER_OF_LIGHTSOURCES + 1];
        let err = LightSourceBlock::build(&lights, Mat4::IDENTITY).unwrap_err();
        assert_eq!(
            err,
            LogicError::LightCapacityExceeded { count: MAX_NUMBER_OF_LIGHTSOURCES + 1, capacity: MAX_NUMBER_OF_LIGHTSOURCES }
        );

        let full = vec![LightSource::point(Vec3::ONE, Vec3::ZERO); MAX_NUMBER_OF_LIGHTSOURCES];
        let block = LightSourceBlock::build(&full, Mat4::IDENTITY).unwrap();
        assert_eq!(block.range(LightKind::Point), LightRange { begin: 0, end: 128 });
        assert_eq!(block.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_overlap() {
        let mut block = LightSourceBlock::build(&scenario_a(), Mat4::IDENTITY).unwrap();
        block.ranges_ambient_directional = UVec4::new(0, 2, 1, 3);
        assert!(block.validate().is_err());
    }

    #[test]
    fn positions_are_transformed_to_view_space() {
        let view = Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
        let light = LightSource::point(Vec3::ONE, Vec3::new(1.0, 2.0, 3.0));
        let gpu = light.to_gpu(view);
        assert_eq!(gpu.position, Vec4::new(1.0, 2.0, -2.0, 1.0));
        assert_eq!(gpu.info.x, LightKind::Point as u32);
    }

    #[test]
    fn build_is_idempotent() {
        let mut lights = scenario_a();
        let mut moving = LightSource::point(Vec3::ONE, Vec3::new(0.0, 1.0, 0.0));
        moving.animation = Some(LightAnimation { radius: 2.0, speed: 1.0, phase: 0.0 });
        lights.push(moving);

        let view = Mat4::look_at_rh(Vec3::new(3.0, 2.0, 1.0), Vec3::ZERO, Vec3::Y);
        let first = LightSourceBlock::build(&animate_lights(&lights, 1.25), view).unwrap();
        let second = LightSourceBlock::build(&animate_lights(&lights, 1.25), view).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn animation_moves_on_a_circle() {
        let mut light = LightSource::point(Vec3::ONE, Vec3::new(1.0, 3.0, 1.0));
        light.animation = Some(LightAnimation { radius: 2.0, speed: 0.5, phase: 0.0 });
        for t in [0.0, 1.0, 7.5] {
            let moved = light.at_time(t);
            let offset = moved.position - light.position;
            assert!((offset.length() - 2.0).abs() < 1e-5);
            assert_eq!(offset.y, 0.0);
        }
    }
}
