// Shader module loading
//
// Vulkan consumes SPIR-V words; callers decode bytes with
// `backend::spirv_words` first so alignment is never an issue here.

use crate::error::{GfxError, Result};
use ash::vk;

pub(super) fn create_shader_module(device: &ash::Device, words: &[u32]) -> Result<vk::ShaderModule> {
    if words.is_empty() {
        return Err(GfxError::InvalidArgument("empty SPIR-V module".to_string()));
    }

    let create_info = vk::ShaderModuleCreateInfo::builder().code(words);

    let module = unsafe { device.create_shader_module(&create_info, None) }?;
    Ok(module)
}
