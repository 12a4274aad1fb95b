// Frame synchronization
//
// Backend-agnostic per-frame protocol: signal tokens, the GpuBackend
// abstraction, in-flight frame bookkeeping and the headless test backend.

pub mod backend;
pub mod headless;
pub mod in_flight;
pub mod protocol;
pub mod token;

pub use backend::{
    BufferDesc, BufferHandle, BufferUsage, CommandBufferHandle, DescriptorBinding, DescriptorKind,
    DescriptorSlot, DrawCommand, FrameOutcome, GeometryHandles, GpuBackend, MemoryUsage, PipelineDesc,
    PipelineHandle, VertexStream,
};
pub use headless::{Hazard, HeadlessBackend};
pub use in_flight::{LifetimeQueue, PerFrame};
pub use protocol::{FrameProtocol, FrameWork, LightWait};
pub use token::{SignalToken, StageWait};
