// GPU buffers and images backed by gpu-allocator
//
// Host-visible buffers stay persistently mapped and are written directly.
// Device-local buffers are filled through a staging buffer and a copy
// command; the caller decides how that copy is synchronized.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;
use crate::error::LogicError;
use crate::frame::{BufferDesc, MemoryUsage};

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: u64,
    pub memory: MemoryUsage,
}

impl GpuBuffer {
    pub fn new(device: &VulkanDevice, desc: &BufferDesc) -> Result<Self> {
        let (usage, location) = match desc.memory {
            MemoryUsage::HostVisible => (desc.usage.to_vk(), MemoryLocation::CpuToGpu),
            MemoryUsage::Device => (desc.usage.to_vk() | vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuOnly),
        };
        Self::allocate(device, &desc.name, desc.size, usage, location, desc.memory)
    }

    /// Host-visible copy source holding `bytes`
    pub fn staging(device: &VulkanDevice, name: &str, bytes: &[u8]) -> Result<Self> {
        let mut staging = Self::allocate(
            device,
            name,
            bytes.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            MemoryUsage::HostVisible,
        )?;
        staging.write(bytes)?;
        Ok(staging)
    }

    fn allocate(
        device: &VulkanDevice,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        memory: MemoryUsage,
    ) -> Result<Self> {
        // Zero-sized buffers are invalid in Vulkan
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .with_context(|| format!("Failed to create buffer '{}'", name))?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for buffer '{}'", name))?;

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .context("Failed to bind buffer memory")?;
        }

        Ok(Self { buffer, allocation: Some(allocation), size, memory })
    }

    /// Copy `bytes` into the mapped memory; host-visible buffers only.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > self.size {
            return Err(LogicError::BufferOverflow { len: bytes.len(), size: self.size as usize }.into());
        }
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer memory is not host-mapped")?;
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_buffer(self.buffer, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

/// Record a full copy of `src` into `dst`
pub fn record_copy(device: &VulkanDevice, command_buffer: vk::CommandBuffer, src: &GpuBuffer, dst: vk::Buffer) {
    let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size: src.size };
    unsafe {
        device.device.cmd_copy_buffer(command_buffer, src.buffer, dst, &[region]);
    }
}

/// Depth attachment matching the swapchain extent
pub struct DepthBuffer {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
}

impl DepthBuffer {
    pub fn new(device: &VulkanDevice, extent: vk::Extent2D) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .format(DEPTH_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device
                .device
                .create_image(&image_info, None)
                .context("Failed to create depth image")?
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device
            .allocator()
            .allocate(&AllocationCreateDesc {
                name: "depth",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context("Failed to allocate depth image memory")?;

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind depth image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe {
            device
                .device
                .create_image_view(&view_info, None)
                .context("Failed to create depth image view")?
        };

        Ok(Self { image, view, allocation: Some(allocation) })
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_image_view(self.view, None);
            device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator().free(allocation) {
                log::warn!("Failed to free depth image memory: {}", e);
            }
        }
    }
}
