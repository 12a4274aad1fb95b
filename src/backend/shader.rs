// Shader module loading
//
// Vulkan uses SPIR-V bytecode for shaders. Binaries are read from disk at
// pipeline (re)build time so that hot-reloaded shaders are picked up.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use super::VulkanDevice;

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // SPIR-V is a stream of 4-byte words; read_spv copies into aligned storage
    let words = ash::util::read_spv(&mut Cursor::new(code)).context("Invalid SPIR-V")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Load a compiled shader binary from disk
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let code = std::fs::read(path).with_context(|| format!("Failed to read shader {:?}", path))?;
    create_shader_module(device, &code).with_context(|| format!("Loading shader {:?}", path))
}
