// Vulkan driver - ash behind the Driver/Device seam
//
// Layout:
// - device.rs:    instance, physical device, logical device, allocator
// - context.rs:   the immediate context (Device impl), lazy command recording
// - buffer.rs:    persistently mapped buffers, renamed on discard
// - image.rs:     textures, layout transitions, exportable memory
// - swapchain.rs: presentation surfaces
// - pipeline.rs:  programs and their pipeline variants
// - shader.rs:    SPIR-V modules
// - surface.rs:   VkSurfaceKHR from raw window handles
// - sync.rs:      submission fence and semaphores

mod buffer;
mod context;
mod device;
mod image;
mod pipeline;
mod shader;
mod surface;
mod swapchain;
mod sync;

use super::{ClipSpace, Device, DispMethod, Driver};
use crate::error::{GfxError, Result};
use ash::Entry;
use std::ffi::CStr;

pub use context::VulkanDevice;

/// Instance level options.
#[derive(Debug, Clone)]
pub struct VulkanSettings {
    pub app_name: String,
    pub validation: bool,
}

impl Default for VulkanSettings {
    fn default() -> Self {
        Self {
            app_name: "emu-gfx".to_string(),
            validation: cfg!(debug_assertions),
        }
    }
}

pub struct VulkanDriver {
    entry: Option<Entry>,
    load_error: Option<String>,
    settings: VulkanSettings,
}

impl VulkanDriver {
    /// Loads the Vulkan loader. A missing loader is reported by
    /// [`Driver::check_platform`], not here.
    pub fn new(settings: VulkanSettings) -> Self {
        match unsafe { Entry::load() } {
            Ok(entry) => Self {
                entry: Some(entry),
                load_error: None,
                settings,
            },
            Err(err) => Self {
                entry: None,
                load_error: Some(err.to_string()),
                settings,
            },
        }
    }

    fn entry(&self) -> Result<&Entry> {
        self.entry.as_ref().ok_or_else(|| {
            GfxError::Unsupported(format!(
                "Failed to load Vulkan library ({}). Is Vulkan installed?",
                self.load_error.as_deref().unwrap_or("unknown error")
            ))
        })
    }
}

impl Driver for VulkanDriver {
    fn disp_method(&self) -> DispMethod {
        DispMethod::Vulkan
    }

    fn check_platform(&self) -> Result<()> {
        let entry = self.entry()?;

        let version = unsafe { entry.try_enumerate_instance_version() }?
            .unwrap_or(ash::vk::API_VERSION_1_0);
        if version < ash::vk::API_VERSION_1_3 {
            return Err(GfxError::Unsupported(format!(
                "Vulkan 1.3 required, loader reports {}.{}",
                ash::vk::api_version_major(version),
                ash::vk::api_version_minor(version)
            )));
        }

        let available = device::available_instance_extensions(entry)?;
        let has = |name: &CStr| available.iter().any(|n| n.as_c_str() == name);
        if !has(ash::extensions::khr::Surface::name()) {
            return Err(GfxError::Unsupported("VK_KHR_surface missing".to_string()));
        }
        if !surface::platform_extensions().iter().any(|&name| has(name)) {
            return Err(GfxError::Unsupported(
                "no window system surface extension available".to_string(),
            ));
        }
        Ok(())
    }

    fn clip_space(&self) -> ClipSpace {
        ClipSpace::YDown
    }

    fn create_device(&mut self) -> Result<Box<dyn Device>> {
        let entry = self.entry()?.clone();
        let device = VulkanDevice::new(entry, &self.settings)?;
        Ok(Box::new(device))
    }
}
