// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// Pipelines are built from a backend-agnostic PipelineDesc; the viewport is
// baked in, so they are rebuilt whenever the swapchain changes.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;

use super::buffer::DEPTH_FORMAT;
use super::shader::load_shader_module;
use super::VulkanDevice;
use crate::frame::{DescriptorKind, PipelineDesc};

const SHADER_ENTRY: &CStr = c"main";

/// Descriptor sets one frame slot can allocate before its pool is reset
const MAX_SETS_PER_FRAME: u32 = 256;

/// Create a render pass for color attachment rendering with depth
pub fn create_render_pass(device: &VulkanDevice, format: vk::Format) -> Result<vk::RenderPass> {
    // Color attachment (the swapchain image)
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(DEPTH_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref)
        .build();

    // The image-available wait happens at early fragment tests; the layout
    // transition and the depth clear must not start before it.
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .build();

    let attachments = &[color_attachment, depth_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    unsafe {
        device
            .device
            .create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")
    }
}

/// Create framebuffers for each swapchain image (with depth attachment)
pub fn create_framebuffers(
    device: &VulkanDevice,
    image_views: &[vk::ImageView],
    depth_image_view: vk::ImageView,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    image_views
        .iter()
        .map(|&image_view| {
            let attachments = &[image_view, depth_image_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            unsafe {
                device
                    .device
                    .create_framebuffer(&framebuffer_info, None)
                    .context("Failed to create framebuffer")
            }
        })
        .collect()
}

/// Descriptor pool for one frame slot; reset when the slot comes around.
pub fn create_descriptor_pool(device: &VulkanDevice) -> Result<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: MAX_SETS_PER_FRAME * 2 },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: MAX_SETS_PER_FRAME * 2 },
    ];
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .max_sets(MAX_SETS_PER_FRAME)
        .pool_sizes(&pool_sizes);

    unsafe {
        device
            .device
            .create_descriptor_pool(&pool_info, None)
            .context("Failed to create descriptor pool")
    }
}

/// A graphics pipeline together with the layouts it was built from.
pub struct GraphicsPipeline {
    pub desc: PipelineDesc,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    /// Indexed by set number; sets the description skips get an empty layout
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
}

impl GraphicsPipeline {
    pub fn new(
        device: &VulkanDevice,
        desc: &PipelineDesc,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let set_layouts = create_set_layouts(device, desc)?;

        let push_constant_ranges = [vk::PushConstantRange::builder()
            .stage_flags(desc.push_constant_stages)
            .offset(0)
            .size(desc.push_constant_size)
            .build()];
        let ranges: &[vk::PushConstantRange] =
            if desc.push_constant_size > 0 { &push_constant_ranges } else { &[] };

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(ranges);

        let layout = unsafe {
            device
                .device
                .create_pipeline_layout(&layout_info, None)
                .context("Failed to create pipeline layout")?
        };

        let pipeline = build_pipeline(device, desc, layout, render_pass, extent)
            .with_context(|| format!("Building pipeline '{}'", desc.name))?;

        log::info!("Created pipeline '{}'", desc.name);
        Ok(Self { desc: desc.clone(), pipeline, layout, set_layouts })
    }

    pub fn set_layout(&self, set: u32) -> Option<vk::DescriptorSetLayout> {
        self.set_layouts.get(set as usize).copied()
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.layout, None);
            for &set_layout in &self.set_layouts {
                device.device.destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }
}

fn create_set_layouts(device: &VulkanDevice, desc: &PipelineDesc) -> Result<Vec<vk::DescriptorSetLayout>> {
    let set_count = desc.descriptors.iter().map(|slot| slot.set + 1).max().unwrap_or(0);

    (0..set_count)
        .map(|set| {
            let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
                .descriptors
                .iter()
                .filter(|slot| slot.set == set)
                .map(|slot| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(slot.binding)
                        .descriptor_type(slot.kind.to_vk())
                        .descriptor_count(1)
                        .stage_flags(slot.stages)
                        .build()
                })
                .collect();
            let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
            unsafe {
                device
                    .device
                    .create_descriptor_set_layout(&info, None)
                    .context("Failed to create descriptor set layout")
            }
        })
        .collect()
}

/// Descriptor kind declared at (set, binding), if any
pub fn declared_kind(desc: &PipelineDesc, set: u32, binding: u32) -> Option<DescriptorKind> {
    desc.descriptors
        .iter()
        .find(|slot| slot.set == set && slot.binding == binding)
        .map(|slot| slot.kind)
}

/// Compile the pipeline object. Shader binaries are read from disk each time.
pub fn build_pipeline(
    device: &VulkanDevice,
    desc: &PipelineDesc,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<vk::Pipeline> {
    let vert_shader = load_shader_module(device, &desc.vertex_shader)?;
    let frag_shader = match load_shader_module(device, &desc.fragment_shader) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.device.destroy_shader_module(vert_shader, None) };
            return Err(e);
        }
    };

    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader)
        .name(SHADER_ENTRY)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader)
        .name(SHADER_ENTRY)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    // Vertex input: one non-interleaved buffer per stream
    let bindings: Vec<vk::VertexInputBindingDescription> = desc
        .vertex_streams
        .iter()
        .map(|stream| {
            vk::VertexInputBindingDescription::builder()
                .binding(stream.binding)
                .stride(stream.stride)
                .input_rate(vk::VertexInputRate::VERTEX)
                .build()
        })
        .collect();
    let attributes: Vec<vk::VertexInputAttributeDescription> = desc
        .vertex_streams
        .iter()
        .map(|stream| {
            vk::VertexInputAttributeDescription::builder()
                .binding(stream.binding)
                .location(stream.location)
                .format(stream.format)
                .offset(0)
                .build()
        })
        .collect();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport = vk::Viewport::builder()
        .x(0.0)
        .y(0.0)
        .width(extent.width as f32)
        .height(extent.height as f32)
        .min_depth(0.0)
        .max_depth(1.0)
        .build();

    let scissor = vk::Rect2D::builder()
        .offset(vk::Offset2D { x: 0, y: 0 })
        .extent(extent)
        .build();

    let viewports = &[viewport];
    let scissors = &[scissor];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(viewports)
        .scissors(scissors);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(desc.cull_mode)
        .front_face(desc.front_face)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // Opaque
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = &[color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let result = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    // Modules are only needed while the pipeline is compiled
    unsafe {
        device.device.destroy_shader_module(vert_shader, None);
        device.device.destroy_shader_module(frag_shader, None);
    }

    let pipelines = result.map_err(|(_, e)| e).context("Failed to create graphics pipeline")?;
    pipelines.into_iter().next().context("Driver returned no pipeline")
}
