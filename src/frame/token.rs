// Signal tokens and stage waits
//
// A SignalToken is the capability produced by exactly one GPU operation.
// It is move-only: attaching it to a wait consumes it, so it can never be
// waited on twice. Backends track tokens that are never consumed.

use ash::vk;

/// Labels of the tokens backends produce.
pub const IMAGE_AVAILABLE: &str = "image-available";
pub const TRANSFER_COMPLETE: &str = "transfer-complete";
pub const RENDER_FINISHED: &str = "render-finished";

/// Opaque single-use completion marker.
///
/// On the Vulkan backend this wraps a binary semaphore; the headless backend
/// leaves the semaphore null and tracks tokens by id.
#[must_use = "a signal token must be attached to a submission wait or a present dependency"]
#[derive(Debug, PartialEq, Eq)]
pub struct SignalToken {
    id: u64,
    label: &'static str,
    semaphore: vk::Semaphore,
}

impl SignalToken {
    pub fn new(id: u64, label: &'static str, semaphore: vk::Semaphore) -> Self {
        Self { id, label, semaphore }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Which operation produced this token ("image-available", "transfer-complete", ...)
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Attach this token as a wait condition at `stage`.
    pub fn at(self, stage: vk::PipelineStageFlags) -> StageWait {
        StageWait { token: self, stage }
    }
}

/// A token consumed as a wait condition of a submission at a pipeline stage.
#[derive(Debug)]
pub struct StageWait {
    pub token: SignalToken,
    pub stage: vk::PipelineStageFlags,
}

/// Position of a single graphics stage in the logical pipeline order.
///
/// Early fragment tests run before the fragment shader even though their
/// flag bit is higher, so the raw bit values can't be compared directly.
fn logical_order(stage: vk::PipelineStageFlags) -> Option<u8> {
    let order = match stage {
        vk::PipelineStageFlags::TOP_OF_PIPE => 0,
        vk::PipelineStageFlags::DRAW_INDIRECT => 1,
        vk::PipelineStageFlags::VERTEX_INPUT => 2,
        vk::PipelineStageFlags::VERTEX_SHADER => 3,
        vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER => 4,
        vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER => 5,
        vk::PipelineStageFlags::GEOMETRY_SHADER => 6,
        vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS => 7,
        vk::PipelineStageFlags::FRAGMENT_SHADER => 8,
        vk::PipelineStageFlags::LATE_FRAGMENT_TESTS => 9,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT => 10,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE => 11,
        _ => return None,
    };
    Some(order)
}

/// Individual stage bits contained in `mask`.
fn stages_in(mask: vk::PipelineStageFlags) -> impl Iterator<Item = vk::PipelineStageFlags> {
    (0..32)
        .map(|bit| vk::PipelineStageFlags::from_raw(1 << bit))
        .filter(move |stage| mask.contains(*stage))
}

/// Whether a wait with `wait_mask` keeps `stage` from executing until the
/// awaited signal arrived.
///
/// A wait blocks the named stages and every stage logically after them.
/// ALL_GRAPHICS and ALL_COMMANDS block everything.
pub fn wait_covers(wait_mask: vk::PipelineStageFlags, stage: vk::PipelineStageFlags) -> bool {
    if wait_mask.intersects(vk::PipelineStageFlags::ALL_GRAPHICS | vk::PipelineStageFlags::ALL_COMMANDS) {
        return true;
    }
    let target = match logical_order(stage) {
        Some(order) => order,
        // Transfer/compute are not ordered against the graphics stages.
        None => return wait_mask.contains(stage),
    };
    stages_in(wait_mask)
        .filter_map(logical_order)
        .any(|order| order <= target)
}

/// Earliest logical graphics stage contained in `mask`.
pub fn earliest_stage(mask: vk::PipelineStageFlags) -> Option<vk::PipelineStageFlags> {
    stages_in(mask)
        .filter_map(|stage| logical_order(stage).map(|order| (order, stage)))
        .min_by_key(|(order, _)| *order)
        .map(|(_, stage)| stage)
}

/// Pipeline stages in which shaders with `stages` access a descriptor.
pub fn reading_stages(stages: vk::ShaderStageFlags) -> vk::PipelineStageFlags {
    let mut mask = vk::PipelineStageFlags::empty();
    if stages.contains(vk::ShaderStageFlags::VERTEX) {
        mask |= vk::PipelineStageFlags::VERTEX_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::GEOMETRY) {
        mask |= vk::PipelineStageFlags::GEOMETRY_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::FRAGMENT) {
        mask |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::COMPUTE) {
        mask |= vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_fragment_tests_wait_covers_fragment_shading() {
        assert!(wait_covers(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags::FRAGMENT_SHADER
        ));
        assert!(wait_covers(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        ));
    }

    #[test]
    fn late_wait_does_not_cover_earlier_stage() {
        assert!(!wait_covers(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::FRAGMENT_SHADER
        ));
        assert!(!wait_covers(
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::VERTEX_SHADER
        ));
    }

    #[test]
    fn combined_masks_use_their_earliest_stage() {
        let mask = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::VERTEX_SHADER;
        assert!(wait_covers(mask, vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert_eq!(earliest_stage(mask), Some(vk::PipelineStageFlags::VERTEX_SHADER));
    }

    #[test]
    fn all_commands_covers_everything() {
        assert!(wait_covers(vk::PipelineStageFlags::ALL_COMMANDS, vk::PipelineStageFlags::VERTEX_INPUT));
        assert!(wait_covers(vk::PipelineStageFlags::ALL_GRAPHICS, vk::PipelineStageFlags::TRANSFER));
    }

    #[test]
    fn transfer_is_only_covered_by_itself() {
        assert!(wait_covers(vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::TRANSFER));
        assert!(!wait_covers(vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::TRANSFER));
    }

    #[test]
    fn descriptor_stages_map_to_pipeline_stages() {
        let mask = reading_stages(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(
            mask,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER
        );
    }
}
