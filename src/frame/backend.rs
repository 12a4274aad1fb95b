// Backend abstraction
//
// Everything the frame protocol and the scene renderer need from a GPU:
// resource creation, per-frame token production/consumption, command
// recording and presentation. Implemented by the Vulkan backend and by the
// headless harness.

use anyhow::Result;
use ash::vk;
use std::fmt;
use std::path::PathBuf;

use super::token::{SignalToken, StageWait};

macro_rules! handle_type {
    ($name:ident, $kind:literal) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub const KIND: &'static str = $kind;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $kind, self.0)
            }
        }
    };
}

handle_type!(BufferHandle, "buffer");
handle_type!(PipelineHandle, "pipeline");
handle_type!(CommandBufferHandle, "command-buffer");

/// Where a buffer's backing memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Directly writable from the host; writes are synchronous.
    HostVisible,
    /// Device-local; written through a staging copy on the GPU.
    Device,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    Uniform,
    Storage,
    Vertex,
    Index,
}

impl BufferUsage {
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryUsage,
}

impl BufferDesc {
    pub fn new(name: impl Into<String>, size: u64, usage: BufferUsage, memory: MemoryUsage) -> Self {
        Self { name: name.into(), size, usage, memory }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
}

impl DescriptorKind {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// Layout slot a pipeline declares: (set, binding) plus what lives there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorSlot {
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    pub stages: vk::ShaderStageFlags,
}

/// A concrete buffer bound to a slot at record time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub set: u32,
    pub binding: u32,
    pub buffer: BufferHandle,
}

impl DescriptorBinding {
    pub fn new(set: u32, binding: u32, buffer: BufferHandle) -> Self {
        Self { set, binding, buffer }
    }
}

/// One per-vertex attribute stream: buffer binding -> shader location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexStream {
    pub binding: u32,
    pub location: u32,
    pub format: vk::Format,
    pub stride: u32,
}

impl VertexStream {
    pub fn vec3(binding: u32, location: u32) -> Self {
        Self { binding, location, format: vk::Format::R32G32B32_SFLOAT, stride: 12 }
    }

    pub fn vec2(binding: u32, location: u32) -> Self {
        Self { binding, location, format: vk::Format::R32G32_SFLOAT, stride: 8 }
    }
}

/// Backend-agnostic graphics pipeline description.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineDesc {
    pub name: String,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub vertex_streams: Vec<VertexStream>,
    pub descriptors: Vec<DescriptorSlot>,
    pub push_constant_size: u32,
    pub push_constant_stages: vk::ShaderStageFlags,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
}

impl PipelineDesc {
    /// Stages that read the descriptor at (set, binding), if declared.
    pub fn stages_for(&self, set: u32, binding: u32) -> Option<vk::ShaderStageFlags> {
        self.descriptors
            .iter()
            .find(|slot| slot.set == set && slot.binding == binding)
            .map(|slot| slot.stages)
    }

    pub fn shader_paths(&self) -> [&PathBuf; 2] {
        [&self.vertex_shader, &self.fragment_shader]
    }
}

/// Geometry of one indexed draw, one buffer per vertex stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryHandles {
    pub index: BufferHandle,
    pub index_count: u32,
    pub positions: BufferHandle,
    pub tex_coords: BufferHandle,
    pub normals: BufferHandle,
    pub tangents: BufferHandle,
    pub bitangents: BufferHandle,
}

impl GeometryHandles {
    /// Vertex buffers in binding order (#0 positions .. #4 bitangents).
    pub fn vertex_buffers(&self) -> [BufferHandle; 5] {
        [self.positions, self.tex_coords, self.normals, self.tangents, self.bitangents]
    }
}

/// Commands recorded into a command buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum DrawCommand {
    /// Begin the pipeline's render pass on the current backbuffer.
    BeginRenderPass { pipeline: PipelineHandle, clear_color: [f32; 4] },
    BindPipeline(PipelineHandle),
    BindDescriptors { pipeline: PipelineHandle, bindings: Vec<DescriptorBinding> },
    PushConstants { pipeline: PipelineHandle, data: Vec<u8> },
    DrawIndexed { geometry: GeometryHandles, vertex_streams: u32 },
    EndRenderPass,
}

/// What happened at the end of a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    pub presented: bool,
    pub swapchain_changed: bool,
}

/// Host-controlled GPU collaborator.
///
/// Frame lifecycle, driven by the composition:
/// `sync_before_render` → participants' render work → `render_frame`.
pub trait GpuBackend {
    /// In-flight frame bound N.
    fn concurrent_frames(&self) -> usize;

    /// Index of the frame currently being built.
    fn frame_index(&self) -> u64;

    fn aspect_ratio(&self) -> f32;

    // ── setup ────────────────────────────────────────────────────────────

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle>;

    /// One-time upload that blocks the CPU until the data is on the device.
    fn upload_blocking(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<()>;

    fn create_graphics_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle>;

    /// Recreate a pipeline after its shaders or the swapchain changed.
    fn rebuild_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()>;

    // ── per frame ────────────────────────────────────────────────────────

    /// Wait for the frame slot's previous use and acquire the next image.
    fn sync_before_render(&mut self) -> Result<()>;

    /// Hand out the "image available" token; once per frame.
    fn take_image_available(&mut self) -> Result<SignalToken>;

    /// Synchronous write into host-visible memory.
    fn write_host_visible(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<()>;

    /// Staged copy into device-local memory; returns its completion token.
    fn transfer_to_device(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<SignalToken>;

    fn allocate_command_buffer(&mut self) -> Result<CommandBufferHandle>;

    fn record(&mut self, command_buffer: CommandBufferHandle, commands: &[DrawCommand]) -> Result<()>;

    /// Submit recorded commands; returns the submission's completion token.
    fn submit(&mut self, command_buffer: CommandBufferHandle, waits: Vec<StageWait>) -> Result<SignalToken>;

    /// The presentation engine won't display the image before `token` signals.
    fn add_present_dependency(&mut self, token: SignalToken) -> Result<()>;

    /// Destroy the command buffer once N frames have passed.
    fn handle_lifetime(&mut self, command_buffer: CommandBufferHandle);

    /// Present and advance to the next frame.
    fn render_frame(&mut self) -> Result<FrameOutcome>;

    // ── misc ─────────────────────────────────────────────────────────────

    fn wait_idle(&mut self) -> Result<()>;

    /// Window size changed; the swapchain is rebuilt lazily.
    fn surface_resized(&mut self, _width: u32, _height: u32) {}

    /// Short status text published by the overlay.
    fn set_status_text(&mut self, _text: &str) {}
}
