// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and surface extensions
// - Physical device selection (prefer discrete GPU)
// - Logical device + queue creation
// - Memory allocator setup
// - Extension loaders used by the immediate context

use super::surface;
use super::VulkanSettings;
use crate::backend::DeviceCaps;
use crate::error::{GfxError, Result};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;

/// Device extensions without which the device is unusable.
fn required_device_extensions() -> [&'static CStr; 2] {
    [khr::Swapchain::name(), khr::PushDescriptor::name()]
}

pub(super) fn available_instance_extensions(entry: &Entry) -> Result<Vec<CString>> {
    let properties = entry.enumerate_instance_extension_properties(None)?;
    Ok(properties
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
        .collect())
}

/// Instance, device and the loaders built on them. Dropped last.
pub(super) struct Core {
    // Order matters for drop: allocator before device before instance
    pub allocator: ManuallyDrop<Allocator>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    pub queue: vk::Queue,
    pub queue_family: u32,

    pub surface_loader: khr::Surface,
    pub swapchain_loader: khr::Swapchain,
    pub push_descriptor: khr::PushDescriptor,
    pub external_memory_fd: Option<khr::ExternalMemoryFd>,

    /// Window system surface extensions that were enabled on the instance.
    pub surface_extensions: Vec<&'static CStr>,

    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub adapter_name: String,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl Core {
    pub fn new(entry: Entry, settings: &VulkanSettings) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", settings.app_name);

        let available = available_instance_extensions(&entry)?;
        let surface_extensions: Vec<&'static CStr> = surface::platform_extensions()
            .into_iter()
            .filter(|&name| available.iter().any(|n| n.as_c_str() == name))
            .collect();
        let debug_available = available
            .iter()
            .any(|n| n.as_c_str() == ext::DebugUtils::name());
        let enable_validation = settings.validation && debug_available;
        if settings.validation && !debug_available {
            log::warn!("Validation requested but VK_EXT_debug_utils is missing");
        }

        let instance =
            Self::create_instance(&entry, settings, &surface_extensions, enable_validation)?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(utils) => Some(utils),
                Err(err) => {
                    log::warn!("Failed to install debug messenger: {}", err);
                    None
                }
            }
        } else {
            None
        };

        let (physical_device, queue_family) = match Self::pick_physical_device(&instance) {
            Ok(picked) => picked,
            Err(err) => {
                unsafe {
                    if let Some((utils, messenger)) = &debug_utils {
                        utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(err);
            }
        };

        let external_memory = cfg!(unix)
            && Self::device_supports(&instance, physical_device, khr::ExternalMemoryFd::name());

        let device = Self::create_logical_device(
            &instance,
            physical_device,
            queue_family,
            external_memory,
        )?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let adapter_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        log::info!("Selected GPU: {}", adapter_name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let surface_loader = khr::Surface::new(&entry, &instance);
        let swapchain_loader = khr::Swapchain::new(&instance, &device);
        let push_descriptor = khr::PushDescriptor::new(&instance, &device);
        let external_memory_fd =
            external_memory.then(|| khr::ExternalMemoryFd::new(&instance, &device));

        Ok(Self {
            allocator: ManuallyDrop::new(allocator),
            device,
            physical_device,
            instance,
            entry,
            queue,
            queue_family,
            surface_loader,
            swapchain_loader,
            push_descriptor,
            external_memory_fd,
            surface_extensions,
            debug_utils,
            adapter_name,
            memory_properties,
        })
    }

    pub fn caps(&self) -> DeviceCaps {
        DeviceCaps {
            // Present modes stand in for the extended surface factory
            flip_presentation: true,
            external_memory: self.external_memory_fd.is_some(),
        }
    }

    fn create_instance(
        entry: &Entry,
        settings: &VulkanSettings,
        surface_extensions: &[&'static CStr],
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name = CString::new(settings.app_name.as_str())
            .map_err(|_| GfxError::InvalidArgument("application name contains NUL".to_string()))?;
        let engine_name = c"emu-gfx";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = vec![khr::Surface::name().as_ptr()];
        extensions.extend(surface_extensions.iter().map(|name| name.as_ptr()));
        if enable_validation {
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }?;
        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn device_supports(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        name: &CStr,
    ) -> bool {
        let properties = match unsafe {
            instance.enumerate_device_extension_properties(physical_device)
        } {
            Ok(properties) => properties,
            Err(_) => return false,
        };
        properties
            .iter()
            .any(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) } == name)
    }

    fn supports_dynamic_rendering(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> bool {
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features13);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        features13.dynamic_rendering == vk::TRUE
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            return Err(GfxError::Unsupported("No Vulkan-capable GPU found".to_string()));
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            if props.api_version < vk::API_VERSION_1_3 {
                continue;
            }
            if !required_device_extensions()
                .iter()
                .all(|&name| Self::device_supports(instance, device, name))
            {
                continue;
            }
            if !Self::supports_dynamic_rendering(instance, device) {
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i as u32);

            if let Some(graphics_family) = graphics_family {
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| {
            GfxError::Unsupported(
                "No GPU with Vulkan 1.3, dynamic rendering and push descriptors".to_string(),
            )
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        external_memory: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let mut extensions: Vec<*const std::os::raw::c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        if external_memory {
            extensions.push(khr::ExternalMemoryFd::name().as_ptr());
        }

        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut features13);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }?;
        Ok(device)
    }

    /// Index of a memory type allowed by `type_filter` with `properties`.
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        (0..self.memory_properties.memory_type_count)
            .find(|&i| {
                (type_filter & (1 << i)) != 0
                    && self.memory_properties.memory_types[i as usize]
                        .property_flags
                        .contains(properties)
            })
            .ok_or_else(|| GfxError::Allocation("no suitable memory type".to_string()))
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
