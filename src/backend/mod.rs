// Backend module - Vulkan implementation of the GpuBackend
//
// Design: Thin wrapper around ash with safety and ergonomics
// - device:    instance, surface, GPU selection, allocator
// - swapchain: presentable images
// - sync:      per-slot fences, semaphore pool for signal tokens
// - buffer:    gpu-allocator buffers, staging copies, depth image
// - pipeline:  render pass, framebuffers, pipelines from PipelineDesc
// - shader:    SPIR-V loading
// - vulkan:    the GpuBackend tying it together

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
mod vulkan;

pub use device::VulkanDevice;
pub use vulkan::VulkanBackend;
