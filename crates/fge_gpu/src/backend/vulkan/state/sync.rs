//! Synchronization primitives for frame pacing
//!
//! RAII wrappers over semaphores and fences plus [`FrameSync`], the set of objects one
//! frame slot needs: the semaphore the indirect batch signals for the renderer, the
//! fence guarding that batch, and the fence guarding the renderer's graphics work.

use std::rc::Rc;

use ash::vk;

use crate::backend::vulkan::device::GpuDevice;
use crate::backend::vulkan::VulkanResult;

/// GPU-GPU synchronization primitive
pub struct Semaphore {
    device: Rc<dyn GpuDevice>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new binary semaphore
    pub fn new(device: Rc<dyn GpuDevice>) -> VulkanResult<Self> {
        let semaphore = device.create_semaphore()?;
        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Rc<dyn GpuDevice>,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: Rc<dyn GpuDevice>, signaled: bool) -> VulkanResult<Self> {
        let fence = device.create_fence(signaled)?;
        Ok(Self { device, fence })
    }

    /// Wait for the fence; `false` when the timeout expired first
    pub fn wait(&self, timeout: u64) -> VulkanResult<bool> {
        self.device.wait_for_fences(&[self.fence], timeout)
    }

    /// Reset fence
    pub fn reset(&self) -> VulkanResult<()> {
        self.device.reset_fences(&[self.fence])
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

/// Synchronization objects of one frame slot
pub struct FrameSync {
    /// Signaled by the indirect batch, waited on by the renderer's submission
    pub indirect_finished: Semaphore,
    /// Guards the indirect batch
    pub indirect_fence: Fence,
    /// Guards the renderer's graphics submission
    pub in_flight: Fence,
}

impl FrameSync {
    /// Create frame synchronization objects; both fences start signaled
    pub fn new(device: Rc<dyn GpuDevice>) -> VulkanResult<Self> {
        let indirect_finished = Semaphore::new(device.clone())?;
        let indirect_fence = Fence::new(device.clone(), true)?;
        let in_flight = Fence::new(device, true)?;

        Ok(Self { indirect_finished, indirect_fence, in_flight })
    }

    /// Fences that must be signaled before the slot's resources are reused
    pub fn fences(&self) -> [vk::Fence; 2] {
        [self.indirect_fence.handle(), self.in_flight.handle()]
    }
}
