// Frame participants and their composition
//
// TICK FLOW:
// 1. Deliver update events (swapchain changed, shaders changed)
// 2. Every participant's update()
// 3. Backend: wait for the frame slot, acquire the next image
// 4. Every participant's render()
// 5. Backend: present, advance to the next frame
//
// Participants run sequentially on the calling thread, in insertion order.

use anyhow::{Context, Result};
use std::time::Instant;

use crate::frame::GpuBackend;
use crate::input::InputState;
use crate::updater::{UpdateEvent, Updater};

/// Timing of the current frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameTime {
    /// Seconds since the previous frame
    pub delta: f32,
    /// Seconds since the composition started
    pub elapsed: f32,
}

/// Everything a participant can reach during a callback.
pub struct FrameContext<'a> {
    pub backend: &'a mut dyn GpuBackend,
    pub input: &'a mut InputState,
    pub time: FrameTime,
    stop_requested: &'a mut bool,
}

impl<'a> FrameContext<'a> {
    pub fn new(
        backend: &'a mut dyn GpuBackend,
        input: &'a mut InputState,
        time: FrameTime,
        stop_requested: &'a mut bool,
    ) -> Self {
        Self { backend, input, time, stop_requested }
    }

    /// Stop the composition after this frame's updates; nothing is rendered.
    pub fn request_stop(&mut self) {
        *self.stop_requested = true;
    }
}

pub trait FrameParticipant {
    /// Called once before the first frame.
    fn initialize(&mut self, ctx: &mut FrameContext<'_>) -> Result<()>;

    /// CPU-side per-frame logic.
    fn update(&mut self, ctx: &mut FrameContext<'_>) -> Result<()>;

    /// GPU work for the current frame. The image has been acquired.
    fn render(&mut self, ctx: &mut FrameContext<'_>) -> Result<()>;

    fn handle_event(&mut self, _event: &UpdateEvent, _ctx: &mut FrameContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Drives a set of participants against one backend.
pub struct Composition<B: GpuBackend> {
    backend: B,
    participants: Vec<Box<dyn FrameParticipant>>,
    input: InputState,
    updater: Updater,
    initialized: bool,
    stopped: bool,
    fixed_delta: Option<f32>,
    started: Instant,
    last_tick: Option<Instant>,
    elapsed: f32,
    frames: u64,
}

impl<B: GpuBackend> Composition<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            participants: Vec::new(),
            input: InputState::new(),
            updater: Updater::new(),
            initialized: false,
            stopped: false,
            fixed_delta: None,
            started: Instant::now(),
            last_tick: None,
            elapsed: 0.0,
            frames: 0,
        }
    }

    /// Advance time by `delta` seconds per frame instead of the wall clock.
    pub fn with_fixed_timestep(mut self, delta: f32) -> Self {
        self.fixed_delta = Some(delta);
        self
    }

    pub fn with_updater(mut self, updater: Updater) -> Self {
        self.updater = updater;
        self
    }

    pub fn add(&mut self, participant: impl FrameParticipant + 'static) {
        self.participants.push(Box::new(participant));
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn input_mut(&mut self) -> &mut InputState {
        &mut self.input
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    fn context(&mut self, time: FrameTime) -> FrameContext<'_> {
        FrameContext {
            backend: &mut self.backend,
            input: &mut self.input,
            time,
            stop_requested: &mut self.stopped,
        }
    }

    fn advance_time(&mut self) -> FrameTime {
        let (delta, elapsed) = match self.fixed_delta {
            Some(delta) => (delta, self.elapsed + delta),
            None => {
                let now = Instant::now();
                let delta = self.last_tick.map_or(0.0, |last| now.duration_since(last).as_secs_f32());
                self.last_tick = Some(now);
                (delta, now.duration_since(self.started).as_secs_f32())
            }
        };
        self.elapsed = elapsed;
        FrameTime { delta, elapsed }
    }

    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let mut participants = std::mem::take(&mut self.participants);
        let mut ctx = self.context(FrameTime::default());
        let result = participants
            .iter_mut()
            .try_for_each(|p| p.initialize(&mut ctx))
            .context("Initializing frame participants");
        self.participants = participants;
        result?;
        self.initialized = true;
        Ok(())
    }

    /// Run one frame.
    pub fn tick(&mut self) -> Result<Flow> {
        if self.stopped {
            return Ok(Flow::Stop);
        }
        self.initialize()?;

        let time = self.advance_time();
        let events = self.updater.poll();
        let mut participants = std::mem::take(&mut self.participants);
        let result = self.tick_with(&mut participants, &events, time);
        self.participants = participants;
        let flow = result?;

        self.input.end_frame();
        Ok(flow)
    }

    fn tick_with(
        &mut self,
        participants: &mut [Box<dyn FrameParticipant>],
        events: &[UpdateEvent],
        time: FrameTime,
    ) -> Result<Flow> {
        {
            let mut ctx = self.context(time);
            for event in events {
                for participant in participants.iter_mut() {
                    participant.handle_event(event, &mut ctx)?;
                }
            }
            for participant in participants.iter_mut() {
                participant.update(&mut ctx)?;
            }
        }
        if self.stopped {
            log::info!("Stop requested after {} frames", self.frames);
            return Ok(Flow::Stop);
        }

        self.backend.sync_before_render().context("Waiting for frame slot")?;
        {
            let mut ctx = self.context(time);
            for participant in participants.iter_mut() {
                participant.render(&mut ctx)?;
            }
        }
        let outcome = self.backend.render_frame().context("Presenting frame")?;
        self.frames += 1;

        if outcome.swapchain_changed {
            let aspect_ratio = self.backend.aspect_ratio();
            log::debug!("Swapchain changed, aspect ratio {:.3}", aspect_ratio);
            self.updater.push(UpdateEvent::SwapchainChanged { aspect_ratio });
        }
        Ok(Flow::Continue)
    }

    /// Tick until stopped or `max_frames` frames were rendered.
    pub fn run_frames(&mut self, max_frames: u64) -> Result<u64> {
        let start = self.frames;
        while self.frames - start < max_frames {
            if self.tick()? == Flow::Stop {
                break;
            }
        }
        Ok(self.frames - start)
    }

    /// Wait for the GPU so resources can be dropped safely.
    pub fn shutdown(&mut self) -> Result<()> {
        self.stopped = true;
        self.backend.wait_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HeadlessBackend;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        log: Rc<RefCell<Vec<String>>>,
        stop_after: Option<u64>,
        updates: u64,
    }

    impl FrameParticipant for Recorder {
        fn initialize(&mut self, _ctx: &mut FrameContext<'_>) -> Result<()> {
            self.log.borrow_mut().push("init".into());
            Ok(())
        }

        fn update(&mut self, ctx: &mut FrameContext<'_>) -> Result<()> {
            self.updates += 1;
            self.log.borrow_mut().push(format!("update {}", ctx.backend.frame_index()));
            if self.stop_after == Some(self.updates) {
                ctx.request_stop();
            }
            Ok(())
        }

        fn render(&mut self, ctx: &mut FrameContext<'_>) -> Result<()> {
            self.log.borrow_mut().push(format!("render {} t={:.1}", ctx.backend.frame_index(), ctx.time.elapsed));
            Ok(())
        }

        fn handle_event(&mut self, event: &UpdateEvent, _ctx: &mut FrameContext<'_>) -> Result<()> {
            self.log.borrow_mut().push(format!("{:?}", event));
            Ok(())
        }
    }

    #[test]
    fn update_then_render_each_frame() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut composition = Composition::new(HeadlessBackend::new(3, 64, 64)).with_fixed_timestep(0.5);
        composition.add(Recorder { log: log.clone(), ..Recorder::default() });

        assert_eq!(composition.run_frames(2).unwrap(), 2);
        assert_eq!(
            *log.borrow(),
            vec!["init", "update 0", "render 0 t=0.5", "update 1", "render 1 t=1.0"]
        );
    }

    #[test]
    fn stop_skips_render() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut composition = Composition::new(HeadlessBackend::new(2, 64, 64)).with_fixed_timestep(0.1);
        composition.add(Recorder { log: log.clone(), stop_after: Some(3), ..Recorder::default() });

        assert_eq!(composition.run_frames(10).unwrap(), 2);
        assert!(composition.is_stopped());
        assert_eq!(log.borrow().last().map(String::as_str), Some("update 2"));
        assert_eq!(composition.tick().unwrap(), Flow::Stop);
    }

    #[test]
    fn swapchain_change_is_delivered_next_frame() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut composition = Composition::new(HeadlessBackend::new(2, 100, 100)).with_fixed_timestep(0.1);
        composition.add(Recorder { log: log.clone(), ..Recorder::default() });

        composition.run_frames(1).unwrap();
        composition.backend_mut().surface_resized(200, 100);
        composition.run_frames(2).unwrap();

        let log = log.borrow();
        let event = log.iter().position(|l| l.starts_with("SwapchainChanged")).unwrap();
        assert_eq!(log[event], "SwapchainChanged { aspect_ratio: 2.0 }");
        assert_eq!(log[event + 1], "update 2");
    }
}
