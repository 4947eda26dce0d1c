// Synchronization primitives
//
// One submission is in flight at a time: every submit waits on the fence
// before returning, so a single set of primitives is enough.

use crate::error::Result;
use ash::vk;

pub(super) struct SubmitSync {
    /// Signaled by swap chain acquire, waited by the next submit.
    pub image_available: vk::Semaphore,
    /// Signaled by the presenting submit, waited by queue present.
    pub render_finished: vk::Semaphore,
    pub submitted: vk::Fence,
}

impl SubmitSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder();

        unsafe {
            Ok(Self {
                image_available: device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.create_semaphore(&semaphore_info, None)?,
                submitted: device.create_fence(&fence_info, None)?,
            })
        }
    }

    /// Blocks until the last submission retired, then rearms the fence.
    pub fn wait(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device.wait_for_fences(&[self.submitted], true, u64::MAX)?;
            device.reset_fences(&[self.submitted])?;
        }
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.submitted, None);
        }
    }
}
