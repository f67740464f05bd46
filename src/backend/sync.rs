// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync.
// One FrameSync = one frame of CPU/GPU overlap.

use ash::vk;

use super::error::{RenderResult, VkResultExt};

/// Fences start signaled, so the first wait returns immediately.
pub fn fence_create_info() -> vk::FenceCreateInfo {
    vk::FenceCreateInfo::builder()
        .flags(vk::FenceCreateFlags::SIGNALED)
        .build()
}

pub fn make_fence(device: &ash::Device) -> RenderResult<vk::Fence> {
    unsafe { device.create_fence(&fence_create_info(), None) }.fatal("create_fence")
}

pub fn make_semaphore(device: &ash::Device) -> RenderResult<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    unsafe { device.create_semaphore(&semaphore_info, None) }.fatal("create_semaphore")
}

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> RenderResult<Self> {
        Ok(Self {
            image_available: make_semaphore(device)?,
            render_finished: make_semaphore(device)?,
            in_flight_fence: make_fence(device)?,
        })
    }

    /// Replace every primitive after a dropped submission.
    ///
    /// A failed submit leaves the fence unsignaled and the image-available
    /// semaphore signaled with no waiter. The device must be idle.
    pub fn recreate(&mut self, device: &ash::Device) -> RenderResult<()> {
        let fresh = Self::new(device)?;
        self.destroy(device);
        *self = fresh;
        Ok(())
    }

    pub fn wait(&self, device: &ash::Device) -> RenderResult<()> {
        unsafe { device.wait_for_fences(&[self.in_flight_fence], true, u64::MAX) }
            .fatal("wait_for_fences")
    }

    pub fn reset(&self, device: &ash::Device) -> RenderResult<()> {
        unsafe { device.reset_fences(&[self.in_flight_fence]) }.fatal("reset_fences")
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
