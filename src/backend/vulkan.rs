// Vulkan implementation of GpuBackend
//
// FRAME FLOW:
// 1. sync_before_render: wait for the slot's fence, retire its resources,
//    acquire a swapchain image (signals the image-available semaphore)
// 2. participants: host writes, staged transfers, record + submit
// 3. render_frame: fence submission, present, recreate swapchain if needed
//
// Every token is a binary semaphore from the pool. Semaphores, descriptor
// sets, command buffers and staging buffers used during frame f are reused
// or destroyed once frame f + N starts, after its slot fence was waited on.

use anyhow::{bail, Context, Result};
use ash::vk;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use winit::window::Window;

use super::buffer::{record_copy, DepthBuffer, GpuBuffer};
use super::pipeline::{self, GraphicsPipeline};
use super::swapchain::{choose_surface_format, Swapchain};
use super::sync::{FrameSync, PresentedSemaphores, SemaphorePool};
use super::VulkanDevice;
use crate::config::Config;
use crate::error::LogicError;
use crate::frame::token::{IMAGE_AVAILABLE, RENDER_FINISHED, TRANSFER_COMPLETE};
use crate::frame::{
    BufferDesc, BufferHandle, CommandBufferHandle, DescriptorBinding, DescriptorKind, DrawCommand, FrameOutcome,
    GpuBackend, LifetimeQueue, MemoryUsage, PerFrame, PipelineDesc, PipelineHandle, SignalToken, StageWait,
};

/// Swapchain plus everything sized to it
struct RenderTargets {
    swapchain: Swapchain,
    depth: DepthBuffer,
    framebuffers: Vec<vk::Framebuffer>,
}

impl RenderTargets {
    fn new(
        device: &Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
        extent: (u32, u32),
        present_mode: vk::PresentModeKHR,
        presentable_images: u32,
    ) -> Result<Self> {
        let swapchain = Swapchain::new(device.clone(), extent.0, extent.1, present_mode, presentable_images)?;
        let mut depth = DepthBuffer::new(device, swapchain.extent)?;
        match pipeline::create_framebuffers(device, &swapchain.image_views, depth.view, render_pass, swapchain.extent) {
            Ok(framebuffers) => Ok(Self { swapchain, depth, framebuffers }),
            Err(e) => {
                depth.destroy(device);
                Err(e)
            }
        }
    }

    fn destroy(mut self, device: &VulkanDevice) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                device.device.destroy_framebuffer(framebuffer, None);
            }
        }
        self.depth.destroy(device);
        // Swapchain cleans up on drop
    }
}

/// Resources whose destruction waits until their frame retired.
enum Retired {
    CommandBuffer(CommandBufferHandle),
    Transfer { command_buffer: vk::CommandBuffer, staging: GpuBuffer },
}

struct CommandBufferEntry {
    command_buffer: vk::CommandBuffer,
    recorded: bool,
}

pub struct VulkanBackend {
    window: Arc<Window>,
    title: String,
    present_mode: vk::PresentModeKHR,
    presentable_images: u32,
    concurrent_frames: usize,
    frame: u64,
    next_id: u64,

    command_pool: vk::CommandPool,
    render_pass: vk::RenderPass,
    targets: Option<RenderTargets>,
    frame_sync: PerFrame<FrameSync>,
    descriptor_pools: PerFrame<vk::DescriptorPool>,
    semaphores: SemaphorePool,

    buffers: HashMap<BufferHandle, GpuBuffer>,
    pipelines: HashMap<PipelineHandle, GraphicsPipeline>,
    command_buffers: HashMap<CommandBufferHandle, CommandBufferEntry>,
    lifetime: LifetimeQueue<Retired>,

    image_index: Option<u32>,
    image_token: Option<SignalToken>,
    /// Issued and not yet consumed: id -> (label, semaphore)
    outstanding: HashMap<u64, (&'static str, vk::Semaphore)>,
    present_waits: Vec<vk::Semaphore>,
    presented: PresentedSemaphores,

    window_extent: (u32, u32),
    resize_pending: bool,
    swapchain_changed: bool,

    // Dropped last
    device: Arc<VulkanDevice>,
}

impl VulkanBackend {
    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // Validation only in debug builds
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, enable_validation, window.as_ref())?;

        let size = window.inner_size();
        let window_extent = (size.width.max(1), size.height.max(1));
        let concurrent_frames = config.graphics.max_frames_in_flight;

        let surface_format = choose_surface_format(&device)?;
        let render_pass = pipeline::create_render_pass(&device, surface_format.format)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let frame_sync = PerFrame::try_new(concurrent_frames, |_| FrameSync::new(&device))?;
        let descriptor_pools = PerFrame::try_new(concurrent_frames, |_| pipeline::create_descriptor_pool(&device))?;

        let mut backend = Self {
            window,
            title: config.window.title.clone(),
            present_mode: config.get_present_mode(),
            presentable_images: config.graphics.presentable_images,
            concurrent_frames,
            frame: 0,
            next_id: 1,
            command_pool,
            render_pass,
            targets: None,
            frame_sync,
            descriptor_pools,
            semaphores: SemaphorePool::default(),
            buffers: HashMap::new(),
            pipelines: HashMap::new(),
            command_buffers: HashMap::new(),
            lifetime: LifetimeQueue::new(concurrent_frames),
            image_index: None,
            image_token: None,
            outstanding: HashMap::new(),
            present_waits: Vec::new(),
            presented: PresentedSemaphores::default(),
            window_extent,
            resize_pending: false,
            swapchain_changed: false,
            device,
        };

        backend.recreate_swapchain()?;
        // The first swapchain is not a change
        backend.swapchain_changed = false;

        log::info!("Vulkan initialized with {} frames in flight", concurrent_frames);
        Ok(backend)
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn targets(&self) -> Result<&RenderTargets> {
        self.targets.as_ref().context("Swapchain not initialized")
    }

    fn extent(&self) -> Result<vk::Extent2D> {
        Ok(self.targets()?.swapchain.extent)
    }

    /// A semaphore owned by the current frame
    fn frame_semaphore(&mut self) -> Result<vk::Semaphore> {
        let semaphore = self.semaphores.get(&self.device)?;
        self.frame_sync.for_frame_mut(self.frame).track(semaphore);
        Ok(semaphore)
    }

    fn issue(&mut self, label: &'static str, semaphore: vk::Semaphore) -> SignalToken {
        let id = self.next_handle();
        self.outstanding.insert(id, (label, semaphore));
        SignalToken::new(id, label, semaphore)
    }

    fn consume(&mut self, token: SignalToken) -> Result<vk::Semaphore> {
        match self.outstanding.remove(&token.id()) {
            Some((_, semaphore)) => Ok(semaphore),
            None => Err(LogicError::ForeignToken { id: token.id() }.into()),
        }
    }

    fn buffer(&self, buffer: BufferHandle) -> Result<&GpuBuffer> {
        self.buffers
            .get(&buffer)
            .ok_or_else(|| LogicError::UnknownHandle { kind: BufferHandle::KIND, id: buffer.0 }.into())
    }

    fn buffer_mut(&mut self, buffer: BufferHandle) -> Result<&mut GpuBuffer> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| LogicError::UnknownHandle { kind: BufferHandle::KIND, id: buffer.0 }.into())
    }

    fn pipeline(&self, pipeline: PipelineHandle) -> Result<&GraphicsPipeline> {
        self.pipelines
            .get(&pipeline)
            .ok_or_else(|| LogicError::UnknownHandle { kind: PipelineHandle::KIND, id: pipeline.0 }.into())
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        if self.window_extent.0 == 0 || self.window_extent.1 == 0 {
            // Minimized; try again once the window has a size
            return Ok(());
        }
        self.device.wait_idle()?;
        self.semaphores.recycle(self.presented.drain());
        if let Some(targets) = self.targets.take() {
            targets.destroy(&self.device);
        }
        let targets = RenderTargets::new(
            &self.device,
            self.render_pass,
            self.window_extent,
            self.present_mode,
            self.presentable_images,
        )?;
        log::info!("Swapchain ready: {}x{}", targets.swapchain.extent.width, targets.swapchain.extent.height);
        self.targets = Some(targets);
        self.resize_pending = false;
        self.swapchain_changed = true;
        Ok(())
    }

    fn acquire_image(&mut self, semaphore: vk::Semaphore) -> Result<u32> {
        // Out of date: recreate once and retry
        for _ in 0..2 {
            match self.targets()?.swapchain.acquire_next_image(u64::MAX, semaphore)? {
                Some((index, suboptimal)) => {
                    if suboptimal {
                        self.resize_pending = true;
                    }
                    return Ok(index);
                }
                None => self.recreate_swapchain()?,
            }
        }
        bail!("Swapchain stays out of date after recreation")
    }

    fn allocate_vk_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;
        command_buffers.into_iter().next().context("Driver returned no command buffer")
    }

    fn begin_one_time(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.device.begin_command_buffer(command_buffer, &begin_info) }
            .context("Failed to begin command buffer")
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.device.free_command_buffers(self.command_pool, &[command_buffer]);
        }
    }

    fn destroy_retired(&mut self, retired: Retired) {
        match retired {
            Retired::CommandBuffer(handle) => {
                if let Some(entry) = self.command_buffers.remove(&handle) {
                    self.free_command_buffer(entry.command_buffer);
                }
            }
            Retired::Transfer { command_buffer, mut staging } => {
                self.free_command_buffer(command_buffer);
                staging.destroy(&self.device);
            }
        }
    }

    /// Record a staging copy into a fresh command buffer.
    fn record_staged_copy(&self, buffer: BufferHandle, bytes: &[u8]) -> Result<(vk::CommandBuffer, GpuBuffer)> {
        let target = self.buffer(buffer)?.buffer;
        let staging = GpuBuffer::staging(&self.device, "staging", bytes)?;
        let command_buffer = self.allocate_vk_command_buffer()?;
        self.begin_one_time(command_buffer)?;
        record_copy(&self.device, command_buffer, &staging, target);
        unsafe { self.device.device.end_command_buffer(command_buffer) }.context("Failed to end transfer commands")?;
        Ok((command_buffer, staging))
    }

    /// Checks shared by host writes and transfers
    fn check_write(&self, buffer: BufferHandle, bytes: &[u8], expected: MemoryUsage) -> Result<()> {
        let target = self.buffer(buffer)?;
        if target.memory != expected {
            return Err(match expected {
                MemoryUsage::HostVisible => LogicError::NotHostVisible { id: buffer.0 },
                MemoryUsage::Device => LogicError::NotDeviceLocal { id: buffer.0 },
            }
            .into());
        }
        if bytes.len() as u64 > target.size {
            return Err(LogicError::BufferOverflow { len: bytes.len(), size: target.size as usize }.into());
        }
        Ok(())
    }

    fn record_command(&self, command_buffer: vk::CommandBuffer, command: &DrawCommand) -> Result<()> {
        let device = &self.device.device;
        match command {
            DrawCommand::BeginRenderPass { pipeline, clear_color } => {
                self.pipeline(*pipeline)?;
                let image_index = self.image_index.ok_or(LogicError::NoImageAcquired { frame: self.frame })?;
                let targets = self.targets()?;
                let framebuffer = *targets
                    .framebuffers
                    .get(image_index as usize)
                    .context("No framebuffer for the acquired image")?;
                let clear_values = [
                    vk::ClearValue { color: vk::ClearColorValue { float32: *clear_color } },
                    vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } },
                ];
                let begin_info = vk::RenderPassBeginInfo::builder()
                    .render_pass(self.render_pass)
                    .framebuffer(framebuffer)
                    .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: targets.swapchain.extent })
                    .clear_values(&clear_values);
                unsafe { device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE) };
            }
            DrawCommand::BindPipeline(pipeline) => {
                let pipeline = self.pipeline(*pipeline)?;
                unsafe { device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline) };
            }
            DrawCommand::BindDescriptors { pipeline, bindings } => {
                self.bind_descriptors(command_buffer, *pipeline, bindings)?;
            }
            DrawCommand::PushConstants { pipeline, data } => {
                let pipeline = self.pipeline(*pipeline)?;
                if data.len() > pipeline.desc.push_constant_size as usize {
                    return Err(LogicError::BufferOverflow {
                        len: data.len(),
                        size: pipeline.desc.push_constant_size as usize,
                    }
                    .into());
                }
                unsafe {
                    device.cmd_push_constants(
                        command_buffer,
                        pipeline.layout,
                        pipeline.desc.push_constant_stages,
                        0,
                        data,
                    )
                };
            }
            DrawCommand::DrawIndexed { geometry, vertex_streams } => {
                let vertex_buffers = geometry
                    .vertex_buffers()
                    .iter()
                    .take(*vertex_streams as usize)
                    .map(|handle| self.buffer(*handle).map(|b| b.buffer))
                    .collect::<Result<Vec<_>>>()?;
                let offsets = vec![0; vertex_buffers.len()];
                let index = self.buffer(geometry.index)?.buffer;
                unsafe {
                    device.cmd_bind_vertex_buffers(command_buffer, 0, &vertex_buffers, &offsets);
                    device.cmd_bind_index_buffer(command_buffer, index, 0, vk::IndexType::UINT32);
                    device.cmd_draw_indexed(command_buffer, geometry.index_count, 1, 0, 0, 0);
                }
            }
            DrawCommand::EndRenderPass => unsafe { device.cmd_end_render_pass(command_buffer) },
        }
        Ok(())
    }

    /// Allocate one set per referenced set number from the frame's pool,
    /// point it at the given buffers and bind it.
    fn bind_descriptors(
        &self,
        command_buffer: vk::CommandBuffer,
        handle: PipelineHandle,
        bindings: &[DescriptorBinding],
    ) -> Result<()> {
        let pipeline = self.pipeline(handle)?;
        let pool = *self.descriptor_pools.for_frame(self.frame);

        let mut by_set: BTreeMap<u32, Vec<&DescriptorBinding>> = BTreeMap::new();
        for binding in bindings {
            by_set.entry(binding.set).or_default().push(binding);
        }

        for (set, set_bindings) in by_set {
            let undeclared = |binding: u32| LogicError::UndeclaredBinding { pipeline: handle.0, set, binding };
            let layout = pipeline.set_layout(set).ok_or_else(|| undeclared(set_bindings[0].binding))?;

            let layouts = [layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            let descriptor_set = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
                .context("Failed to allocate descriptor set")?
                .into_iter()
                .next()
                .context("Driver returned no descriptor set")?;

            let mut infos = Vec::with_capacity(set_bindings.len());
            let mut kinds = Vec::with_capacity(set_bindings.len());
            for binding in &set_bindings {
                let kind = pipeline::declared_kind(&pipeline.desc, set, binding.binding)
                    .ok_or_else(|| undeclared(binding.binding))?;
                let buffer = self.buffer(binding.buffer)?;
                infos.push(vk::DescriptorBufferInfo { buffer: buffer.buffer, offset: 0, range: vk::WHOLE_SIZE });
                kinds.push(kind);
            }
            let writes: Vec<vk::WriteDescriptorSet> = set_bindings
                .iter()
                .zip(infos.iter().zip(&kinds))
                .map(|(binding, (info, kind))| {
                    vk::WriteDescriptorSet::builder()
                        .dst_set(descriptor_set)
                        .dst_binding(binding.binding)
                        .descriptor_type(DescriptorKind::to_vk(*kind))
                        .buffer_info(std::slice::from_ref(info))
                        .build()
                })
                .collect();

            unsafe {
                self.device.device.update_descriptor_sets(&writes, &[]);
                self.device.device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    set,
                    &[descriptor_set],
                    &[],
                );
            }
        }
        Ok(())
    }

    /// Submit `command_buffers` with the given waits, signaling `signal`.
    fn queue_submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        waits: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> = waits.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = waits.iter().map(|(_, stage)| *stage).collect();
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(signal);
        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], fence)
        }
        .context("Queue submission failed")
    }
}

impl GpuBackend for VulkanBackend {
    fn concurrent_frames(&self) -> usize {
        self.concurrent_frames
    }

    fn frame_index(&self) -> u64 {
        self.frame
    }

    fn aspect_ratio(&self) -> f32 {
        match &self.targets {
            Some(targets) => targets.swapchain.aspect_ratio(),
            None => self.window_extent.0 as f32 / self.window_extent.1.max(1) as f32,
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        let buffer = GpuBuffer::new(&self.device, desc)?;
        let handle = BufferHandle(self.next_handle());
        self.buffers.insert(handle, buffer);
        log::debug!("Created {} '{}' ({} bytes, {:?})", handle, desc.name, desc.size, desc.memory);
        Ok(handle)
    }

    fn upload_blocking(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<()> {
        let target = self.buffer_mut(buffer)?;
        if target.memory == MemoryUsage::HostVisible {
            return target.write(bytes);
        }
        if bytes.len() as u64 > target.size {
            return Err(LogicError::BufferOverflow { len: bytes.len(), size: target.size as usize }.into());
        }

        let (command_buffer, mut staging) = self.record_staged_copy(buffer, bytes)?;
        let fence = unsafe { self.device.device.create_fence(&vk::FenceCreateInfo::default(), None) }?;
        let result = self
            .queue_submit(&[command_buffer], &[], &[], fence)
            .and_then(|()| unsafe {
                self.device.device.wait_for_fences(&[fence], true, u64::MAX).context("Waiting for upload")
            });

        unsafe { self.device.device.destroy_fence(fence, None) };
        self.free_command_buffer(command_buffer);
        staging.destroy(&self.device);
        result
    }

    fn create_graphics_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        let extent = self.extent()?;
        let pipeline = GraphicsPipeline::new(&self.device, desc, self.render_pass, extent)?;
        let handle = PipelineHandle(self.next_handle());
        self.pipelines.insert(handle, pipeline);
        Ok(handle)
    }

    fn rebuild_pipeline(&mut self, handle: PipelineHandle) -> Result<()> {
        let extent = self.extent()?;
        let entry = self
            .pipelines
            .get_mut(&handle)
            .ok_or(LogicError::UnknownHandle { kind: PipelineHandle::KIND, id: handle.0 })?;

        // On failure the old pipeline stays in use
        let fresh = pipeline::build_pipeline(&self.device, &entry.desc, entry.layout, self.render_pass, extent)?;

        // In-flight frames may still use the old one
        self.device.wait_idle()?;
        unsafe { self.device.device.destroy_pipeline(entry.pipeline, None) };
        entry.pipeline = fresh;
        log::debug!("Rebuilt pipeline '{}' for {}x{}", entry.desc.name, extent.width, extent.height);
        Ok(())
    }

    fn sync_before_render(&mut self) -> Result<()> {
        self.frame_sync.for_frame(self.frame).wait(&self.device)?;

        // Frame - N has retired: its semaphores, descriptor sets and
        // lifetime-managed resources are free again.
        let sync = self.frame_sync.for_frame_mut(self.frame);
        let used = sync.take_used();
        let discarded = sync.take_discarded();
        self.semaphores.recycle(used);
        for semaphore in discarded {
            self.semaphores.destroy_one(&self.device.device, semaphore);
        }
        let pool = *self.descriptor_pools.for_frame(self.frame);
        unsafe { self.device.device.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty()) }
            .context("Failed to reset descriptor pool")?;
        for retired in self.lifetime.release(self.frame) {
            self.destroy_retired(retired);
        }

        if self.resize_pending {
            self.recreate_swapchain()?;
        }

        let image_available = self.frame_semaphore()?;
        let index = self.acquire_image(image_available)?;
        self.semaphores.recycle(self.presented.reacquired(index));
        self.image_index = Some(index);
        self.image_token = Some(self.issue(IMAGE_AVAILABLE, image_available));
        Ok(())
    }

    fn take_image_available(&mut self) -> Result<SignalToken> {
        match self.image_token.take() {
            Some(token) => Ok(token),
            None if self.image_index.is_some() => Err(LogicError::ImageTokenTaken { frame: self.frame }.into()),
            None => Err(LogicError::NoImageAcquired { frame: self.frame }.into()),
        }
    }

    fn write_host_visible(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<()> {
        self.check_write(buffer, bytes, MemoryUsage::HostVisible)?;
        self.buffer_mut(buffer)?.write(bytes)
    }

    fn transfer_to_device(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<SignalToken> {
        self.check_write(buffer, bytes, MemoryUsage::Device)?;

        let (command_buffer, staging) = self.record_staged_copy(buffer, bytes)?;
        let complete = self.frame_semaphore()?;
        let submitted = self.queue_submit(&[command_buffer], &[], &[complete], vk::Fence::null());
        self.lifetime.push(self.frame, Retired::Transfer { command_buffer, staging });
        submitted?;

        Ok(self.issue(TRANSFER_COMPLETE, complete))
    }

    fn allocate_command_buffer(&mut self) -> Result<CommandBufferHandle> {
        let command_buffer = self.allocate_vk_command_buffer()?;
        let handle = CommandBufferHandle(self.next_handle());
        self.command_buffers.insert(handle, CommandBufferEntry { command_buffer, recorded: false });
        Ok(handle)
    }

    fn record(&mut self, handle: CommandBufferHandle, commands: &[DrawCommand]) -> Result<()> {
        let command_buffer = self
            .command_buffers
            .get(&handle)
            .ok_or(LogicError::UnknownHandle { kind: CommandBufferHandle::KIND, id: handle.0 })?
            .command_buffer;

        self.begin_one_time(command_buffer)?;
        for command in commands {
            self.record_command(command_buffer, command)?;
        }
        unsafe { self.device.device.end_command_buffer(command_buffer) }.context("Failed to end command buffer")?;

        if let Some(entry) = self.command_buffers.get_mut(&handle) {
            entry.recorded = true;
        }
        Ok(())
    }

    fn submit(&mut self, handle: CommandBufferHandle, waits: Vec<StageWait>) -> Result<SignalToken> {
        let entry = self
            .command_buffers
            .get(&handle)
            .ok_or(LogicError::UnknownHandle { kind: CommandBufferHandle::KIND, id: handle.0 })?;
        if !entry.recorded {
            return Err(LogicError::NotRecorded { id: handle.0 }.into());
        }
        let command_buffer = entry.command_buffer;

        // Reject the submission before any token is spent
        if let Some(foreign) = waits.iter().find(|wait| !self.outstanding.contains_key(&wait.token.id())) {
            return Err(LogicError::ForeignToken { id: foreign.token.id() }.into());
        }

        let mut wait_semaphores = Vec::with_capacity(waits.len());
        for wait in waits {
            let stage = wait.stage;
            wait_semaphores.push((self.consume(wait.token)?, stage));
        }

        let finished = self.frame_semaphore()?;
        self.queue_submit(&[command_buffer], &wait_semaphores, &[finished], vk::Fence::null())?;
        Ok(self.issue(RENDER_FINISHED, finished))
    }

    fn add_present_dependency(&mut self, token: SignalToken) -> Result<()> {
        let semaphore = self.consume(token)?;
        self.present_waits.push(semaphore);
        Ok(())
    }

    fn handle_lifetime(&mut self, command_buffer: CommandBufferHandle) {
        self.lifetime.push(self.frame, Retired::CommandBuffer(command_buffer));
    }

    fn render_frame(&mut self) -> Result<FrameOutcome> {
        let image_index = self.image_index.take().ok_or(LogicError::NoImageAcquired { frame: self.frame })?;

        // Nobody rendered: release the image without touching it
        if let Some(token) = self.image_token.take() {
            log::warn!("Frame {} presents an image nothing rendered to", self.frame);
            let acquired = self.consume(token)?;
            let released = self.frame_semaphore()?;
            self.queue_submit(&[], &[(acquired, vk::PipelineStageFlags::ALL_COMMANDS)], &[released], vk::Fence::null())?;
            self.present_waits.push(released);
        }
        if self.present_waits.is_empty() {
            log::warn!("Frame {} presents without waiting on rendering", self.frame);
        }
        let frame = self.frame;
        let sync = self.frame_sync.for_frame_mut(frame);
        for (_, (label, semaphore)) in self.outstanding.drain() {
            log::warn!("Frame {}: {} signal was never waited on", frame, label);
            sync.discard(semaphore);
        }

        // Signals once everything submitted this frame has finished
        let fence = self.frame_sync.for_frame(self.frame).in_flight_fence;
        unsafe { self.device.device.reset_fences(&[fence]) }?;
        self.queue_submit(&[], &[], &[], fence)?;

        // Recycled when the image comes back from acquire
        let waits = std::mem::take(&mut self.present_waits);
        let sync = self.frame_sync.for_frame_mut(frame);
        for &semaphore in &waits {
            sync.untrack(semaphore);
        }
        let needs_recreate =
            self.targets()?.swapchain.present(self.device.graphics_queue, image_index, &waits)?;
        self.presented.presented(image_index, waits);

        self.frame += 1;

        if needs_recreate || self.resize_pending {
            self.recreate_swapchain()?;
        }
        Ok(FrameOutcome { presented: true, swapchain_changed: std::mem::take(&mut self.swapchain_changed) })
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        for retired in self.lifetime.drain() {
            self.destroy_retired(retired);
        }
        Ok(())
    }

    fn surface_resized(&mut self, width: u32, height: u32) {
        self.window_extent = (width, height);
        if width > 0 && height > 0 {
            self.resize_pending = true;
        }
    }

    fn set_status_text(&mut self, text: &str) {
        self.window.set_title(&format!("{} - {}", self.title, text));
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        let _ = self.device.wait_idle();

        for retired in self.lifetime.drain() {
            self.destroy_retired(retired);
        }
        for buffer in self.buffers.values_mut() {
            buffer.destroy(&self.device);
        }
        for pipeline in self.pipelines.values() {
            pipeline.destroy(&self.device);
        }
        if let Some(targets) = self.targets.take() {
            targets.destroy(&self.device);
        }

        for sync in self.frame_sync.iter() {
            sync.destroy(&self.device.device);
        }
        let mut used = Vec::new();
        for slot in 0..self.concurrent_frames as u64 {
            let sync = self.frame_sync.for_frame_mut(slot);
            used.extend(sync.take_used());
            used.extend(sync.take_discarded());
        }
        used.extend(self.presented.drain());
        self.semaphores.recycle(used);
        self.semaphores.destroy(&self.device.device);

        unsafe {
            for &pool in self.descriptor_pools.iter() {
                self.device.device.destroy_descriptor_pool(pool, None);
            }
            // Also frees the remaining command buffers
            self.device.device.destroy_command_pool(self.command_pool, None);
            self.device.device.destroy_render_pass(self.render_pass, None);
        }

        log::info!("Cleanup complete");
    }
}
