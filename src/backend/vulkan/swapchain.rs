// Swapchain - Window presentation
//
// Swap effects map to present modes:
// - FlipDiscard + tearing: IMMEDIATE, refused when the surface lacks it
// - FlipDiscard:           MAILBOX when available, else FIFO
// - Discard / legacy:      FIFO, always available

use super::device::Core;
use super::image::{create_view, COLOR_FORMAT};
use super::surface;
use crate::backend::{SwapChainDesc, SwapChainInfo, SwapEffect, TextureId};
use crate::error::{GfxError, Result};
use ash::vk;

pub(super) struct Swapchain {
    pub surface: vk::SurfaceKHR,
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub layouts: Vec<vk::ImageLayout>,
    pub extent: vk::Extent2D,
    pub info: SwapChainInfo,
    present_mode: vk::PresentModeKHR,
    buffer_count: u32,
    /// Index of the image acquired for the frame being recorded.
    pub acquired: Option<u32>,
    pub back_buffer: Option<TextureId>,
}

fn choose_present_mode(desc: &SwapChainDesc, available: &[vk::PresentModeKHR]) -> Result<vk::PresentModeKHR> {
    let has = |mode| available.contains(&mode);
    match desc.effect {
        SwapEffect::FlipDiscard if !desc.legacy && desc.allow_tearing => {
            if has(vk::PresentModeKHR::IMMEDIATE) {
                Ok(vk::PresentModeKHR::IMMEDIATE)
            } else {
                Err(GfxError::Presentation(
                    "surface has no tearing present mode".to_string(),
                ))
            }
        }
        SwapEffect::FlipDiscard if !desc.legacy && has(vk::PresentModeKHR::MAILBOX) => {
            Ok(vk::PresentModeKHR::MAILBOX)
        }
        _ => Ok(vk::PresentModeKHR::FIFO),
    }
}

impl Swapchain {
    pub fn new(core: &Core, desc: &SwapChainDesc) -> Result<Self> {
        log::info!(
            "Creating swapchain: {}x{} ({:?}, tearing: {}, legacy: {})",
            desc.width,
            desc.height,
            desc.effect,
            desc.allow_tearing,
            desc.legacy
        );

        let surface = surface::create_surface(core, desc.window, desc.display)?;

        let mut swapchain = Self {
            surface,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            layouts: Vec::new(),
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            info: SwapChainInfo {
                width: desc.width,
                height: desc.height,
                effect: desc.effect,
                allow_tearing: false,
            },
            present_mode: vk::PresentModeKHR::FIFO,
            buffer_count: desc.buffer_count.max(2),
            acquired: None,
            back_buffer: None,
        };

        let result = (|| {
            let supported = unsafe {
                core.surface_loader.get_physical_device_surface_support(
                    core.physical_device,
                    core.queue_family,
                    surface,
                )
            }?;
            if !supported {
                return Err(GfxError::Presentation(
                    "graphics queue cannot present to this surface".to_string(),
                ));
            }

            let present_modes = unsafe {
                core.surface_loader
                    .get_physical_device_surface_present_modes(core.physical_device, surface)
            }?;
            swapchain.present_mode = choose_present_mode(desc, &present_modes)?;
            swapchain.info.allow_tearing =
                swapchain.present_mode == vk::PresentModeKHR::IMMEDIATE;
            log::info!("Present mode: {:?}", swapchain.present_mode);

            swapchain.build(core, desc.width, desc.height)
        })();

        match result {
            Ok(()) => Ok(swapchain),
            Err(err) => {
                swapchain.destroy(core);
                Err(err)
            }
        }
    }

    /// (Re)creates the VkSwapchainKHR and its views for the given size.
    fn build(&mut self, core: &Core, width: u32, height: u32) -> Result<()> {
        let surface_caps = unsafe {
            core.surface_loader
                .get_physical_device_surface_capabilities(core.physical_device, self.surface)
        }?;
        let formats = unsafe {
            core.surface_loader
                .get_physical_device_surface_formats(core.physical_device, self.surface)
        }?;
        let surface_format = formats
            .iter()
            .find(|f| f.format == COLOR_FORMAT)
            .ok_or_else(|| {
                GfxError::Presentation("surface does not support B8G8R8A8_UNORM".to_string())
            })?;

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        let mut image_count = self.buffer_count.max(surface_caps.min_image_count);
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { core.swapchain_loader.create_swapchain(&create_info, None) }?;

        self.destroy_views(core);
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { core.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;

        self.images = unsafe { core.swapchain_loader.get_swapchain_images(swapchain) }?;
        for &image in &self.images {
            let view = create_view(&core.device, image)?;
            self.image_views.push(view);
        }
        self.layouts = vec![vk::ImageLayout::UNDEFINED; self.images.len()];
        self.extent = extent;
        self.info.width = extent.width;
        self.info.height = extent.height;
        self.acquired = None;

        log::info!("Created swapchain with {} images", self.images.len());
        Ok(())
    }

    pub fn resize(&mut self, core: &Core, width: u32, height: u32) -> Result<()> {
        core.wait_idle()?;
        self.build(core, width.max(1), height.max(1))
    }

    /// Acquires the next image, signaling `semaphore`.
    pub fn acquire(&mut self, core: &Core, semaphore: vk::Semaphore) -> Result<u32> {
        let (index, suboptimal) = unsafe {
            core.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }?;
        if suboptimal {
            log::debug!("Swapchain is suboptimal for its surface");
        }

        self.acquired = Some(index);
        self.layouts[index as usize] = vk::ImageLayout::UNDEFINED;
        Ok(index)
    }

    /// Presents the acquired image once `wait` is signaled.
    pub fn present(&mut self, core: &Core, wait: vk::Semaphore) -> Result<()> {
        let index = self
            .acquired
            .take()
            .ok_or_else(|| GfxError::InvalidOperation("no swap chain image acquired".to_string()))?;

        let swapchains = [self.swapchain];
        let image_indices = [index];
        let wait_semaphores = [wait];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { core.swapchain_loader.queue_present(core.queue, &present_info) } {
            Ok(_) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn destroy_views(&mut self, core: &Core) {
        unsafe {
            for view in self.image_views.drain(..) {
                core.device.destroy_image_view(view, None);
            }
        }
    }

    pub fn destroy(&mut self, core: &Core) {
        self.destroy_views(core);
        unsafe {
            if self.swapchain != vk::SwapchainKHR::null() {
                core.swapchain_loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
            if self.surface != vk::SurfaceKHR::null() {
                core.surface_loader.destroy_surface(self.surface, None);
                self.surface = vk::SurfaceKHR::null();
            }
        }
    }
}
