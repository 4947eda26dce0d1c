// Buffer utilities for vertex, uniform and staging buffers
//
// Every buffer is host visible and persistently mapped. A buffer still
// referenced by recorded work is never written: write-discard swaps in fresh
// storage and retires the old one until the next submission completes.

use super::device::Core;
use crate::backend::BufferUsage;
use crate::error::{GfxError, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

pub(super) struct GpuBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: usize,
}

impl GpuBuffer {
    pub fn new(core: &mut Core, size: usize, usage: vk::BufferUsageFlags, name: &str) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size as vk::DeviceSize)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { core.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { core.device.get_buffer_memory_requirements(buffer) };

        let allocation = match core.allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { core.device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };

        if let Err(err) = unsafe {
            core.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            let _ = core.allocator.free(allocation);
            unsafe { core.device.destroy_buffer(buffer, None) };
            return Err(err.into());
        }

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Copies `data` to the start of the mapping.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.size {
            return Err(GfxError::InvalidArgument(format!(
                "{} bytes written to a {} byte buffer",
                data.len(),
                self.size
            )));
        }

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| GfxError::Allocation("buffer memory is not mapped".to_string()))?;
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn destroy(mut self, core: &mut Core) {
        unsafe { core.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = core.allocator.free(allocation) {
                log::error!("Failed to free buffer memory: {}", err);
            }
        }
    }
}

pub(super) fn usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    match usage {
        BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
        BufferUsage::Constant => vk::BufferUsageFlags::UNIFORM_BUFFER,
    }
}

/// A vertex or constant buffer as seen through a `BufferId`.
pub(super) struct BufferSlot {
    pub current: GpuBuffer,
    pub usage: BufferUsage,
    /// Referenced by commands recorded since the last submission.
    pub in_flight: bool,
}

impl BufferSlot {
    /// Map-discard semantics: never stalls on recorded work.
    pub fn write_discard(
        &mut self,
        core: &mut Core,
        retired: &mut Vec<GpuBuffer>,
        data: &[u8],
    ) -> Result<()> {
        if self.in_flight {
            let fresh = GpuBuffer::new(core, self.current.size, usage_flags(self.usage), "renamed")?;
            retired.push(std::mem::replace(&mut self.current, fresh));
            self.in_flight = false;
        }
        self.current.write(data)
    }
}
