// Headless backend
//
// A GpuBackend without a GPU. It keeps buffer contents in host memory and
// models the GPU timeline well enough to catch ordering mistakes:
//
// - a submission reading a device-local buffer whose transfer it does not
//   wait on (at or before the reading stage)
// - a render pass started without waiting on the image-available token
// - a write into a buffer that an unretired frame still reads
// - tokens that were produced but never consumed
// - presentation that does not depend on the frame's rendering
//
// Frame f retires when frame f + N starts, like a fence per frame slot.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use super::backend::{
    BufferDesc, BufferHandle, CommandBufferHandle, DrawCommand, FrameOutcome, GpuBackend,
    MemoryUsage, PipelineDesc, PipelineHandle,
};
use super::in_flight::LifetimeQueue;
use super::token::{
    earliest_stage, reading_stages, wait_covers, SignalToken, StageWait, IMAGE_AVAILABLE, RENDER_FINISHED,
    TRANSFER_COMPLETE,
};
use crate::error::LogicError;

/// A synchronization mistake detected on the simulated timeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Hazard {
    /// A shader stage may read `buffer` before its pending transfer landed.
    StaleRead { frame: u64, buffer: BufferHandle, stage: vk::PipelineStageFlags },
    /// The render pass may touch the backbuffer before it was acquired.
    ImageNotAcquired { frame: u64 },
    /// `buffer` was overwritten while `reader_frame` may still read it.
    WriteWhileInFlight { frame: u64, buffer: BufferHandle, reader_frame: u64 },
    /// A token nobody waited on.
    UnconsumedSignal { frame: u64, label: &'static str },
    /// Presentation does not wait on the frame's rendering.
    PresentWithoutRender { frame: u64 },
}

impl fmt::Display for Hazard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hazard::StaleRead { frame, buffer, stage } => {
                write!(f, "frame {}: {} read at {:?} before its transfer completed", frame, buffer, stage)
            }
            Hazard::ImageNotAcquired { frame } => {
                write!(f, "frame {}: render pass does not wait for the acquired image", frame)
            }
            Hazard::WriteWhileInFlight { frame, buffer, reader_frame } => {
                write!(f, "frame {}: {} overwritten while frame {} may read it", frame, buffer, reader_frame)
            }
            Hazard::UnconsumedSignal { frame, label } => {
                write!(f, "frame {}: {} signal was never waited on", frame, label)
            }
            Hazard::PresentWithoutRender { frame } => {
                write!(f, "frame {}: present does not depend on rendering", frame)
            }
        }
    }
}

/// Operations in submission order, for inspection by tests.
#[derive(Clone, Debug, PartialEq)]
pub enum GpuOp {
    Acquire { frame: u64, token: u64 },
    HostWrite { frame: u64, buffer: BufferHandle },
    Transfer { frame: u64, buffer: BufferHandle, token: u64 },
    Submit { frame: u64, command_buffer: CommandBufferHandle, waits: Vec<(&'static str, vk::PipelineStageFlags)>, token: u64 },
    Present { frame: u64, waits: Vec<&'static str> },
}

#[derive(Debug)]
struct HeadlessBuffer {
    desc: BufferDesc,
    contents: Vec<u8>,
    /// Transfer written this frame; readers must wait on it until the frame ends.
    pending_transfer: Option<u64>,
}

#[derive(Debug)]
struct HeadlessPipeline {
    desc: PipelineDesc,
    rebuilds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageState {
    NotAcquired,
    Available(u64),
    Taken,
}

#[derive(Debug)]
struct InFlightFrame {
    frame: u64,
    reads: HashSet<BufferHandle>,
}

pub struct HeadlessBackend {
    concurrent_frames: usize,
    extent: (u32, u32),
    frame: u64,
    next_id: u64,

    buffers: HashMap<BufferHandle, HeadlessBuffer>,
    pipelines: HashMap<PipelineHandle, HeadlessPipeline>,
    command_buffers: HashMap<CommandBufferHandle, Option<Vec<DrawCommand>>>,
    lifetime: LifetimeQueue<CommandBufferHandle>,

    image: ImageState,
    image_token: Option<u64>,
    /// Issued and not yet consumed: id -> label
    outstanding: HashMap<u64, &'static str>,
    render_tokens: Vec<u64>,
    present_waits: Vec<(u64, &'static str)>,
    current_reads: HashSet<BufferHandle>,
    in_flight: VecDeque<InFlightFrame>,

    resize_pending: bool,
    status_text: String,
    hazards: Vec<Hazard>,
    timeline: Vec<GpuOp>,
}

impl HeadlessBackend {
    pub fn new(concurrent_frames: usize, width: u32, height: u32) -> Self {
        let concurrent_frames = concurrent_frames.max(1);
        Self {
            concurrent_frames,
            extent: (width.max(1), height.max(1)),
            frame: 0,
            next_id: 1,
            buffers: HashMap::new(),
            pipelines: HashMap::new(),
            command_buffers: HashMap::new(),
            lifetime: LifetimeQueue::new(concurrent_frames),
            image: ImageState::NotAcquired,
            image_token: None,
            outstanding: HashMap::new(),
            render_tokens: Vec::new(),
            present_waits: Vec::new(),
            current_reads: HashSet::new(),
            in_flight: VecDeque::new(),
            resize_pending: false,
            status_text: String::new(),
            hazards: Vec::new(),
            timeline: Vec::new(),
        }
    }

    pub fn hazards(&self) -> &[Hazard] {
        &self.hazards
    }

    pub fn take_hazards(&mut self) -> Vec<Hazard> {
        std::mem::take(&mut self.hazards)
    }

    pub fn timeline(&self) -> &[GpuOp] {
        &self.timeline
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.contents.as_slice())
    }

    /// Command buffers not yet destroyed.
    pub fn live_command_buffers(&self) -> usize {
        self.command_buffers.len()
    }

    pub fn pipeline_rebuilds(&self, pipeline: PipelineHandle) -> Option<u32> {
        self.pipelines.get(&pipeline).map(|p| p.rebuilds)
    }

    pub fn pipeline_named(&self, name: &str) -> Option<PipelineHandle> {
        self.pipelines.iter().find(|(_, p)| p.desc.name == name).map(|(handle, _)| *handle)
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// Frames whose work has not retired yet.
    pub fn unretired_frames(&self) -> Vec<u64> {
        self.in_flight.iter().map(|f| f.frame).collect()
    }

    fn issue_id(&mut self, label: &'static str) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding.insert(id, label);
        id
    }

    fn issue(&mut self, label: &'static str) -> SignalToken {
        let id = self.issue_id(label);
        SignalToken::new(id, label, vk::Semaphore::null())
    }

    fn consume(&mut self, token: SignalToken) -> Result<(u64, &'static str)> {
        match self.outstanding.remove(&token.id()) {
            Some(label) => Ok((token.id(), label)),
            None => Err(LogicError::ForeignToken { id: token.id() }.into()),
        }
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer_mut(&mut self, buffer: BufferHandle) -> Result<&mut HeadlessBuffer> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| LogicError::UnknownHandle { kind: BufferHandle::KIND, id: buffer.0 }.into())
    }

    fn check_write(&mut self, buffer: BufferHandle) {
        let frame = self.frame;
        let readers: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|f| f.reads.contains(&buffer))
            .map(|f| f.frame)
            .collect();
        for reader_frame in readers {
            self.hazards.push(Hazard::WriteWhileInFlight { frame, buffer, reader_frame });
        }
    }

    fn write(&mut self, buffer: BufferHandle, bytes: &[u8], expected: MemoryUsage) -> Result<()> {
        let target = self.buffer_mut(buffer)?;
        if target.desc.memory != expected {
            return Err(match expected {
                MemoryUsage::HostVisible => LogicError::NotHostVisible { id: buffer.0 },
                MemoryUsage::Device => LogicError::NotDeviceLocal { id: buffer.0 },
            }
            .into());
        }
        if bytes.len() > target.contents.len() {
            return Err(LogicError::BufferOverflow { len: bytes.len(), size: target.contents.len() }.into());
        }
        target.contents[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn retire_until(&mut self, frame: u64) {
        let window = self.concurrent_frames as u64;
        while self.in_flight.front().is_some_and(|f| f.frame + window <= frame) {
            self.in_flight.pop_front();
        }
        for command_buffer in self.lifetime.release(frame) {
            self.command_buffers.remove(&command_buffer);
        }
    }

    /// (buffer, earliest reading stage) for everything `commands` reads.
    fn reads_of(&self, commands: &[DrawCommand]) -> Result<Vec<(BufferHandle, vk::PipelineStageFlags)>> {
        let mut reads = Vec::new();
        for command in commands {
            match command {
                DrawCommand::BindDescriptors { pipeline, bindings } => {
                    let desc = &self
                        .pipelines
                        .get(pipeline)
                        .ok_or(LogicError::UnknownHandle { kind: PipelineHandle::KIND, id: pipeline.0 })?
                        .desc;
                    for binding in bindings {
                        let stages = desc.stages_for(binding.set, binding.binding).ok_or(
                            LogicError::UndeclaredBinding { pipeline: pipeline.0, set: binding.set, binding: binding.binding },
                        )?;
                        let stage = earliest_stage(reading_stages(stages))
                            .unwrap_or(vk::PipelineStageFlags::TOP_OF_PIPE);
                        reads.push((binding.buffer, stage));
                    }
                }
                DrawCommand::DrawIndexed { geometry, vertex_streams } => {
                    reads.push((geometry.index, vk::PipelineStageFlags::VERTEX_INPUT));
                    for buffer in geometry.vertex_buffers().iter().take(*vertex_streams as usize) {
                        reads.push((*buffer, vk::PipelineStageFlags::VERTEX_INPUT));
                    }
                }
                _ => {}
            }
        }
        Ok(reads)
    }
}

impl GpuBackend for HeadlessBackend {
    fn concurrent_frames(&self) -> usize {
        self.concurrent_frames
    }

    fn frame_index(&self) -> u64 {
        self.frame
    }

    fn aspect_ratio(&self) -> f32 {
        self.extent.0 as f32 / self.extent.1 as f32
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        let handle = BufferHandle(self.next_handle());
        self.buffers.insert(
            handle,
            HeadlessBuffer { desc: desc.clone(), contents: vec![0; desc.size as usize], pending_transfer: None },
        );
        log::debug!("Created {} '{}' ({} bytes, {:?})", handle, desc.name, desc.size, desc.memory);
        Ok(handle)
    }

    fn upload_blocking(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<()> {
        let target = self.buffer_mut(buffer)?;
        if bytes.len() > target.contents.len() {
            return Err(LogicError::BufferOverflow { len: bytes.len(), size: target.contents.len() }.into());
        }
        target.contents[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn create_graphics_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        let handle = PipelineHandle(self.next_handle());
        self.pipelines.insert(handle, HeadlessPipeline { desc: desc.clone(), rebuilds: 0 });
        Ok(handle)
    }

    fn rebuild_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        let entry = self
            .pipelines
            .get_mut(&pipeline)
            .ok_or(LogicError::UnknownHandle { kind: PipelineHandle::KIND, id: pipeline.0 })?;
        entry.rebuilds += 1;
        log::debug!("Rebuilt pipeline '{}'", entry.desc.name);
        Ok(())
    }

    fn sync_before_render(&mut self) -> Result<()> {
        self.retire_until(self.frame);
        // Tracked in `outstanding` until the token is taken and waited on.
        let id = self.issue_id(IMAGE_AVAILABLE);
        self.timeline.push(GpuOp::Acquire { frame: self.frame, token: id });
        self.image = ImageState::Available(id);
        self.image_token = Some(id);
        Ok(())
    }

    fn take_image_available(&mut self) -> Result<SignalToken> {
        match self.image {
            ImageState::Available(id) => {
                self.image = ImageState::Taken;
                Ok(SignalToken::new(id, IMAGE_AVAILABLE, vk::Semaphore::null()))
            }
            ImageState::Taken => Err(LogicError::ImageTokenTaken { frame: self.frame }.into()),
            ImageState::NotAcquired => Err(LogicError::NoImageAcquired { frame: self.frame }.into()),
        }
    }

    fn write_host_visible(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<()> {
        self.write(buffer, bytes, MemoryUsage::HostVisible)?;
        self.check_write(buffer);
        self.timeline.push(GpuOp::HostWrite { frame: self.frame, buffer });
        Ok(())
    }

    fn transfer_to_device(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<SignalToken> {
        self.write(buffer, bytes, MemoryUsage::Device)?;
        self.check_write(buffer);
        let token = self.issue(TRANSFER_COMPLETE);
        self.buffer_mut(buffer)?.pending_transfer = Some(token.id());
        self.timeline.push(GpuOp::Transfer { frame: self.frame, buffer, token: token.id() });
        Ok(token)
    }

    fn allocate_command_buffer(&mut self) -> Result<CommandBufferHandle> {
        let handle = CommandBufferHandle(self.next_handle());
        self.command_buffers.insert(handle, None);
        Ok(handle)
    }

    fn record(&mut self, command_buffer: CommandBufferHandle, commands: &[DrawCommand]) -> Result<()> {
        // Validate now so that bad handles fail at record time.
        self.reads_of(commands)?;
        for command in commands {
            let referenced = match command {
                DrawCommand::BeginRenderPass { pipeline, .. }
                | DrawCommand::BindPipeline(pipeline)
                | DrawCommand::PushConstants { pipeline, .. } => Some(*pipeline),
                _ => None,
            };
            if let Some(pipeline) = referenced {
                if !self.pipelines.contains_key(&pipeline) {
                    return Err(LogicError::UnknownHandle { kind: PipelineHandle::KIND, id: pipeline.0 }.into());
                }
            }
        }
        let slot = self
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(LogicError::UnknownHandle { kind: CommandBufferHandle::KIND, id: command_buffer.0 })?;
        *slot = Some(commands.to_vec());
        Ok(())
    }

    fn submit(&mut self, command_buffer: CommandBufferHandle, waits: Vec<StageWait>) -> Result<SignalToken> {
        let commands = self
            .command_buffers
            .get(&command_buffer)
            .ok_or(LogicError::UnknownHandle { kind: CommandBufferHandle::KIND, id: command_buffer.0 })?
            .clone()
            .ok_or(LogicError::NotRecorded { id: command_buffer.0 })?;

        // Reject the submission before any token is spent
        let reads = self.reads_of(&commands).context("Analyzing submission")?;
        for wait in &waits {
            if !self.outstanding.contains_key(&wait.token.id()) {
                return Err(LogicError::ForeignToken { id: wait.token.id() }.into());
            }
        }

        let mut waited = Vec::with_capacity(waits.len());
        for wait in waits {
            let stage = wait.stage;
            let (id, label) = self.consume(wait.token)?;
            waited.push((id, label, stage));
        }

        let frame = self.frame;
        let touches_image = commands.iter().any(|c| matches!(c, DrawCommand::BeginRenderPass { .. }));
        if touches_image {
            let image_ok = self.image_token.is_some_and(|image| {
                waited.iter().any(|(id, _, stage)| {
                    *id == image && wait_covers(*stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
                })
            });
            if !image_ok {
                self.hazards.push(Hazard::ImageNotAcquired { frame });
            }
        }

        // A semaphore wait only orders its own batch, so every submission
        // reading the buffer this frame must wait on the transfer itself.
        for (buffer, stage) in reads {
            self.current_reads.insert(buffer);
            let pending = self.buffers.get(&buffer).and_then(|b| b.pending_transfer);
            if let Some(transfer) = pending {
                let ordered = waited.iter().any(|(id, _, mask)| *id == transfer && wait_covers(*mask, stage));
                if !ordered {
                    self.hazards.push(Hazard::StaleRead { frame, buffer, stage });
                }
            }
        }

        let token = self.issue(RENDER_FINISHED);
        self.render_tokens.push(token.id());
        self.timeline.push(GpuOp::Submit {
            frame,
            command_buffer,
            waits: waited.iter().map(|(_, label, stage)| (*label, *stage)).collect(),
            token: token.id(),
        });
        Ok(token)
    }

    fn add_present_dependency(&mut self, token: SignalToken) -> Result<()> {
        let waited = self.consume(token)?;
        self.present_waits.push(waited);
        Ok(())
    }

    fn handle_lifetime(&mut self, command_buffer: CommandBufferHandle) {
        self.lifetime.push(self.frame, command_buffer);
    }

    fn render_frame(&mut self) -> Result<FrameOutcome> {
        let frame = self.frame;

        if !self.render_tokens.is_empty()
            && !self.present_waits.iter().any(|(id, _)| self.render_tokens.contains(id))
        {
            self.hazards.push(Hazard::PresentWithoutRender { frame });
        }

        let mut unconsumed: Vec<(u64, &'static str)> = self.outstanding.drain().collect();
        unconsumed.sort_unstable();
        for (_, label) in unconsumed {
            self.hazards.push(Hazard::UnconsumedSignal { frame, label });
        }

        let present_labels: Vec<&'static str> = self.present_waits.iter().map(|(_, label)| *label).collect();
        self.timeline.push(GpuOp::Present { frame, waits: present_labels });

        for buffer in self.buffers.values_mut() {
            buffer.pending_transfer = None;
        }
        let reads = std::mem::take(&mut self.current_reads);
        self.in_flight.push_back(InFlightFrame { frame, reads });
        self.render_tokens.clear();
        self.present_waits.clear();
        self.image = ImageState::NotAcquired;
        self.image_token = None;
        self.frame += 1;

        Ok(FrameOutcome { presented: true, swapchain_changed: std::mem::take(&mut self.resize_pending) })
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.in_flight.clear();
        for command_buffer in self.lifetime.drain() {
            self.command_buffers.remove(&command_buffer);
        }
        Ok(())
    }

    fn surface_resized(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.extent = (width, height);
        self.resize_pending = true;
    }

    fn set_status_text(&mut self, text: &str) {
        self.status_text = text.to_string();
    }
}
