// Images: sampled textures, render targets and exportable memory
//
// All images are B8G8R8A8_UNORM with one mip level. Layouts are tracked on
// the CPU and changed with full barriers; the workload is a handful of
// quads per frame.

use super::device::Core;
use crate::backend::{ExternalHandleKind, ExternalMemory, SwapChainId, TextureUsage};
use crate::error::{GfxError, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

pub(super) const COLOR_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub(super) enum ImageMemory {
    Allocated(Allocation),
    /// Dedicated, exportable allocation.
    Exported(vk::DeviceMemory),
    /// Stands for whichever swap chain image is currently acquired.
    SwapChain(SwapChainId),
}

pub(super) struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: ImageMemory,
    pub extent: vk::Extent2D,
    pub usage: TextureUsage,
    pub layout: vk::ImageLayout,
}

fn usage_flags(usage: TextureUsage) -> vk::ImageUsageFlags {
    match usage {
        TextureUsage::Dynamic => vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        TextureUsage::RenderTarget => {
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT
        }
    }
}

fn image_info<'a>(width: u32, height: u32, usage: TextureUsage) -> vk::ImageCreateInfoBuilder<'a> {
    vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(COLOR_FORMAT)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage_flags(usage))
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
}

pub(super) fn create_view(device: &ash::Device, image: vk::Image) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(COLOR_FORMAT)
        .components(vk::ComponentMapping::default())
        .subresource_range(COLOR_RANGE);

    Ok(unsafe { device.create_image_view(&view_info, None) }?)
}

impl GpuImage {
    pub fn new(core: &mut Core, width: u32, height: u32, usage: TextureUsage) -> Result<Self> {
        let image = unsafe { core.device.create_image(&image_info(width, height, usage), None) }?;
        let requirements = unsafe { core.device.get_image_memory_requirements(image) };

        let allocation = match core.allocator.allocate(&AllocationCreateDesc {
            name: "texture",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { core.device.destroy_image(image, None) };
                return Err(err.into());
            }
        };

        let mut gpu_image = Self {
            image,
            view: vk::ImageView::null(),
            memory: ImageMemory::Allocated(allocation),
            extent: vk::Extent2D { width, height },
            usage,
            layout: vk::ImageLayout::UNDEFINED,
        };

        let bound = match &gpu_image.memory {
            ImageMemory::Allocated(a) => unsafe {
                core.device.bind_image_memory(image, a.memory(), a.offset())
            },
            _ => Ok(()),
        };
        if let Err(err) = bound {
            gpu_image.destroy(core);
            return Err(err.into());
        }

        match create_view(&core.device, image) {
            Ok(view) => gpu_image.view = view,
            Err(err) => {
                gpu_image.destroy(core);
                return Err(err);
            }
        }
        Ok(gpu_image)
    }

    /// A sampled image backed by a dedicated allocation exported as an
    /// opaque file descriptor.
    pub fn new_exportable(core: &mut Core, width: u32, height: u32) -> Result<(Self, ExternalMemory)> {
        let fd_loader = core
            .external_memory_fd
            .clone()
            .ok_or(GfxError::InteropUnavailable)?;

        let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let create_info = image_info(width, height, TextureUsage::Dynamic).push_next(&mut external_info);
        let image = unsafe { core.device.create_image(&create_info, None) }?;
        let requirements = unsafe { core.device.get_image_memory_requirements(image) };

        let memory_type = match core.find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(index) => index,
            Err(err) => {
                unsafe { core.device.destroy_image(image, None) };
                return Err(err);
            }
        };

        let mut export_info = vk::ExportMemoryAllocateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image);
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type)
            .push_next(&mut export_info)
            .push_next(&mut dedicated_info);

        let memory = match unsafe { core.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { core.device.destroy_image(image, None) };
                return Err(err.into());
            }
        };

        let mut gpu_image = Self {
            image,
            view: vk::ImageView::null(),
            memory: ImageMemory::Exported(memory),
            extent: vk::Extent2D { width, height },
            usage: TextureUsage::Dynamic,
            layout: vk::ImageLayout::UNDEFINED,
        };

        let setup = unsafe { core.device.bind_image_memory(image, memory, 0) }
            .map_err(GfxError::from)
            .and_then(|_| create_view(&core.device, image));
        match setup {
            Ok(view) => gpu_image.view = view,
            Err(err) => {
                gpu_image.destroy(core);
                return Err(err);
            }
        }

        let fd_info = vk::MemoryGetFdInfoKHR::builder()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let fd = match unsafe { fd_loader.get_memory_fd(&fd_info) } {
            Ok(fd) => fd,
            Err(err) => {
                gpu_image.destroy(core);
                return Err(err.into());
            }
        };

        Ok((
            gpu_image,
            ExternalMemory {
                kind: ExternalHandleKind::OpaqueFd,
                handle: fd as i64,
                size: requirements.size,
            },
        ))
    }

    /// A placeholder resolved against a swap chain at use time.
    pub fn swap_chain_backed(swap_chain: SwapChainId, extent: vk::Extent2D) -> Self {
        Self {
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            memory: ImageMemory::SwapChain(swap_chain),
            extent,
            usage: TextureUsage::RenderTarget,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }

    pub fn swap_chain(&self) -> Option<SwapChainId> {
        match self.memory {
            ImageMemory::SwapChain(id) => Some(id),
            _ => None,
        }
    }

    pub fn destroy(self, core: &mut Core) {
        unsafe {
            if self.view != vk::ImageView::null() {
                core.device.destroy_image_view(self.view, None);
            }
            match self.memory {
                ImageMemory::Allocated(allocation) => {
                    core.device.destroy_image(self.image, None);
                    if let Err(err) = core.allocator.free(allocation) {
                        log::error!("Failed to free image memory: {}", err);
                    }
                }
                ImageMemory::Exported(memory) => {
                    core.device.destroy_image(self.image, None);
                    core.device.free_memory(memory, None);
                }
                ImageMemory::SwapChain(_) => {}
            }
        }
    }
}

/// Records a full barrier moving `image` from `old` to `new`.
pub(super) fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old)
        .new_layout(new)
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Records a full-image copy from a staging buffer. The image must be in
/// TRANSFER_DST_OPTIMAL.
pub(super) fn copy_from_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    image: vk::Image,
    extent: vk::Extent2D,
) {
    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .build();

    unsafe {
        device.cmd_copy_buffer_to_image(
            cmd,
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
}
