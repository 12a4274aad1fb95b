// Per-frame update & submission protocol
//
// FRAME FLOW:
// 1. Take the "image available" token
// 2. Write uniforms into host-visible memory (synchronous, no token)
// 3. Transfer light data into device-local memory (async, produces a token)
// 4. Record the draw commands (no waits at record time)
// 5. Submit, waiting on the image token and the light-transfer token
// 6. Make presentation depend on the submission
// 7. Hand the command buffer to the lifetime queue

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;

use super::backend::{BufferHandle, DrawCommand, GpuBackend};
use super::token::StageWait;

/// Where the light-transfer completion token is attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LightWait {
    /// The render submission waits on it before fragment shading.
    #[default]
    FragmentShader,
    /// Only presentation waits on it. Fragment shading may read light data
    /// before the transfer has landed.
    PresentOnly,
}

/// Data written and commands submitted for one frame.
#[derive(Debug)]
pub struct FrameWork<'a> {
    pub uniform_buffer: BufferHandle,
    pub uniform_bytes: &'a [u8],
    pub light_buffer: BufferHandle,
    pub light_bytes: &'a [u8],
    pub commands: &'a [DrawCommand],
}

#[derive(Clone, Copy, Debug)]
pub struct FrameProtocol {
    light_wait: LightWait,
    /// First stage touching the backbuffer or the depth attachment.
    image_wait_stage: vk::PipelineStageFlags,
    /// First stage reading the light buffer.
    light_wait_stage: vk::PipelineStageFlags,
}

impl Default for FrameProtocol {
    fn default() -> Self {
        Self::new(LightWait::default())
    }
}

impl FrameProtocol {
    pub fn new(light_wait: LightWait) -> Self {
        Self {
            light_wait,
            image_wait_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            light_wait_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }
    }

    pub fn light_wait(&self) -> LightWait {
        self.light_wait
    }

    /// Run steps 1-7 for the backend's current frame.
    pub fn run(&self, backend: &mut dyn GpuBackend, work: &FrameWork<'_>) -> Result<()> {
        let frame = backend.frame_index();

        let image_available = backend
            .take_image_available()
            .with_context(|| format!("Frame {}: acquiring image", frame))?;

        backend
            .write_host_visible(work.uniform_buffer, work.uniform_bytes)
            .with_context(|| format!("Frame {}: writing uniforms", frame))?;

        let lights_transferred = backend
            .transfer_to_device(work.light_buffer, work.light_bytes)
            .with_context(|| format!("Frame {}: transferring lights", frame))?;

        let mut waits: Vec<StageWait> = vec![image_available.at(self.image_wait_stage)];
        let mut present_after = Vec::new();
        match self.light_wait {
            LightWait::FragmentShader => waits.push(lights_transferred.at(self.light_wait_stage)),
            LightWait::PresentOnly => present_after.push(lights_transferred),
        }

        let command_buffer = backend.allocate_command_buffer()?;
        let submitted = backend
            .record(command_buffer, work.commands)
            .with_context(|| format!("Frame {}: recording commands", frame))
            .and_then(|()| {
                backend
                    .submit(command_buffer, waits)
                    .with_context(|| format!("Frame {}: submitting", frame))
            });
        let rendered = match submitted {
            Ok(token) => token,
            Err(e) => {
                // Still released after N frames
                backend.handle_lifetime(command_buffer);
                return Err(e);
            }
        };

        for token in present_after {
            backend.add_present_dependency(token)?;
        }
        backend.add_present_dependency(rendered)?;

        backend.handle_lifetime(command_buffer);

        log::trace!("Frame {} submitted ({:?})", frame, self.light_wait);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::backend::{
        BufferDesc, BufferUsage, DescriptorBinding, DescriptorKind, DescriptorSlot, MemoryUsage, PipelineDesc,
        PipelineHandle,
    };
    use crate::frame::headless::{GpuOp, Hazard, HeadlessBackend};
    use crate::frame::in_flight::PerFrame;

    struct Fixture {
        backend: HeadlessBackend,
        pipeline: PipelineHandle,
        uniforms: PerFrame<BufferHandle>,
        lights: PerFrame<BufferHandle>,
    }

    impl Fixture {
        fn new(frames_in_flight: usize) -> Self {
            let mut backend = HeadlessBackend::new(frames_in_flight, 640, 480);
            let pipeline = backend
                .create_graphics_pipeline(&PipelineDesc {
                    name: "test".to_string(),
                    vertex_shader: "test.vert.spv".into(),
                    fragment_shader: "test.frag.spv".into(),
                    vertex_streams: Vec::new(),
                    descriptors: vec![
                        DescriptorSlot {
                            set: 1,
                            binding: 0,
                            kind: DescriptorKind::UniformBuffer,
                            stages: vk::ShaderStageFlags::VERTEX,
                        },
                        DescriptorSlot {
                            set: 1,
                            binding: 1,
                            kind: DescriptorKind::StorageBuffer,
                            stages: vk::ShaderStageFlags::FRAGMENT,
                        },
                    ],
                    push_constant_size: 0,
                    push_constant_stages: vk::ShaderStageFlags::empty(),
                    cull_mode: vk::CullModeFlags::NONE,
                    front_face: vk::FrontFace::COUNTER_CLOCKWISE,
                    depth_test: true,
                    depth_write: true,
                })
                .unwrap();
            let uniforms = PerFrame::try_new(frames_in_flight, |i| {
                backend.create_buffer(&BufferDesc::new(
                    format!("u{}", i),
                    16,
                    BufferUsage::Uniform,
                    MemoryUsage::HostVisible,
                ))
            })
            .unwrap();
            let lights = PerFrame::try_new(frames_in_flight, |i| {
                backend.create_buffer(&BufferDesc::new(format!("l{}", i), 16, BufferUsage::Storage, MemoryUsage::Device))
            })
            .unwrap();
            Self { backend, pipeline, uniforms, lights }
        }

        fn frame(&mut self, protocol: &FrameProtocol, value: u8) {
            let frame = self.backend.frame_index();
            let uniform_buffer = *self.uniforms.for_frame(frame);
            let light_buffer = *self.lights.for_frame(frame);
            let commands = vec![
                DrawCommand::BeginRenderPass { pipeline: self.pipeline, clear_color: [0.0; 4] },
                DrawCommand::BindPipeline(self.pipeline),
                DrawCommand::BindDescriptors {
                    pipeline: self.pipeline,
                    bindings: vec![
                        DescriptorBinding::new(1, 0, uniform_buffer),
                        DescriptorBinding::new(1, 1, light_buffer),
                    ],
                },
                DrawCommand::EndRenderPass,
            ];
            let bytes = [value; 16];
            let work = FrameWork {
                uniform_buffer,
                uniform_bytes: &bytes,
                light_buffer,
                light_bytes: &bytes,
                commands: &commands,
            };
            self.backend.sync_before_render().unwrap();
            protocol.run(&mut self.backend, &work).unwrap();
            self.backend.render_frame().unwrap();
        }
    }

    #[test]
    fn default_protocol_is_hazard_free() {
        let mut fixture = Fixture::new(3);
        let protocol = FrameProtocol::default();
        for i in 0..9 {
            fixture.frame(&protocol, i);
        }
        assert!(fixture.backend.hazards().is_empty(), "{:?}", fixture.backend.hazards());
        assert_eq!(fixture.backend.buffer_contents(*fixture.lights.for_frame(8)), Some(&[8u8; 16][..]));
    }

    #[test]
    fn steps_run_in_order() {
        let mut fixture = Fixture::new(2);
        fixture.frame(&FrameProtocol::default(), 1);

        let kinds: Vec<&str> = fixture
            .backend
            .timeline()
            .iter()
            .map(|op| match op {
                GpuOp::Acquire { .. } => "acquire",
                GpuOp::HostWrite { .. } => "uniforms",
                GpuOp::Transfer { .. } => "lights",
                GpuOp::Submit { .. } => "submit",
                GpuOp::Present { .. } => "present",
            })
            .collect();
        assert_eq!(kinds, vec!["acquire", "uniforms", "lights", "submit", "present"]);
        assert_eq!(
            fixture.backend.timeline().last(),
            Some(&GpuOp::Present { frame: 0, waits: vec!["render-finished"] })
        );
    }

    #[test]
    fn present_only_policy_leaves_fragment_reads_unordered() {
        let mut fixture = Fixture::new(3);
        let protocol = FrameProtocol::new(LightWait::PresentOnly);
        fixture.frame(&protocol, 1);

        let light_buffer = *fixture.lights.for_frame(0);
        assert_eq!(
            fixture.backend.hazards(),
            &[Hazard::StaleRead { frame: 0, buffer: light_buffer, stage: vk::PipelineStageFlags::FRAGMENT_SHADER }]
        );
        assert_eq!(
            fixture.backend.timeline().last(),
            Some(&GpuOp::Present { frame: 0, waits: vec!["transfer-complete", "render-finished"] })
        );
    }

    #[test]
    fn light_wait_after_fragment_shading_is_too_late() {
        let mut fixture = Fixture::new(3);
        let protocol = FrameProtocol {
            light_wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ..FrameProtocol::default()
        };
        fixture.frame(&protocol, 1);
        assert!(matches!(fixture.backend.hazards(), [Hazard::StaleRead { .. }]));
    }

    #[test]
    fn failed_recording_still_releases_the_command_buffer() {
        let mut fixture = Fixture::new(3);
        let frame = fixture.backend.frame_index();
        let uniform_buffer = *fixture.uniforms.for_frame(frame);
        let light_buffer = *fixture.lights.for_frame(frame);
        let commands = vec![DrawCommand::BindPipeline(PipelineHandle(999))];
        let bytes = [1u8; 16];
        let work = FrameWork {
            uniform_buffer,
            uniform_bytes: &bytes,
            light_buffer,
            light_bytes: &bytes,
            commands: &commands,
        };

        fixture.backend.sync_before_render().unwrap();
        assert!(FrameProtocol::default().run(&mut fixture.backend, &work).is_err());
        assert_eq!(fixture.backend.live_command_buffers(), 1);

        fixture.backend.wait_idle().unwrap();
        assert_eq!(fixture.backend.live_command_buffers(), 0);
    }

    #[test]
    fn image_wait_after_depth_tests_is_flagged() {
        let mut fixture = Fixture::new(3);
        let protocol = FrameProtocol {
            image_wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ..FrameProtocol::default()
        };
        fixture.frame(&protocol, 1);
        assert_eq!(fixture.backend.hazards(), &[Hazard::ImageNotAcquired { frame: 0 }]);
    }
}
