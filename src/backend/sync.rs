// Synchronization primitives
//
// One fence per frame slot: it signals once everything submitted during the
// slot's frame has finished on the GPU. Token semaphores come from a pool and
// are handed back when the frame that used them retires.

use anyhow::Result;
use ash::vk;
use std::collections::HashMap;

use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub in_flight_fence: vk::Fence,
    /// Semaphores signaled or waited during this slot's current frame
    used: Vec<vk::Semaphore>,
    /// Signaled but never waited on; destroyed once the slot's fence signals
    discarded: Vec<vk::Semaphore>,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        Ok(Self {
            in_flight_fence: unsafe { device.device.create_fence(&fence_info, None)? },
            used: Vec::new(),
            discarded: Vec::new(),
        })
    }

    /// Block until the slot's previous frame has finished on the GPU.
    pub fn wait(&self, device: &VulkanDevice) -> Result<()> {
        unsafe { device.device.wait_for_fences(&[self.in_flight_fence], true, u64::MAX)? };
        Ok(())
    }

    pub fn track(&mut self, semaphore: vk::Semaphore) {
        self.used.push(semaphore);
    }

    /// Stop tracking a semaphore whose reuse is decided elsewhere.
    pub fn untrack(&mut self, semaphore: vk::Semaphore) {
        self.used.retain(|&s| s != semaphore);
    }

    /// A signaled semaphore can't be signaled again, so it is not recycled.
    pub fn discard(&mut self, semaphore: vk::Semaphore) {
        self.untrack(semaphore);
        self.discarded.push(semaphore);
    }

    pub fn take_used(&mut self) -> Vec<vk::Semaphore> {
        std::mem::take(&mut self.used)
    }

    pub fn take_discarded(&mut self) -> Vec<vk::Semaphore> {
        std::mem::take(&mut self.discarded)
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Binary semaphores for signal tokens.
#[derive(Default)]
pub struct SemaphorePool {
    free: Vec<vk::Semaphore>,
    created: usize,
}

impl SemaphorePool {
    pub fn get(&mut self, device: &VulkanDevice) -> Result<vk::Semaphore> {
        if let Some(semaphore) = self.free.pop() {
            return Ok(semaphore);
        }
        let info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.device.create_semaphore(&info, None)? };
        self.created += 1;
        log::trace!("Semaphore pool grew to {}", self.created);
        Ok(semaphore)
    }

    /// Return semaphores whose signal and wait operations have completed.
    pub fn recycle(&mut self, semaphores: impl IntoIterator<Item = vk::Semaphore>) {
        self.free.extend(semaphores);
    }

    /// Destroy a semaphore handed out by this pool instead of recycling it.
    pub fn destroy_one(&mut self, device: &ash::Device, semaphore: vk::Semaphore) {
        unsafe { device.destroy_semaphore(semaphore, None) };
        self.created = self.created.saturating_sub(1);
    }

    /// Destroys the free list; recycle everything first.
    pub fn destroy(&mut self, device: &ash::Device) {
        if self.free.len() != self.created {
            log::warn!("Destroying semaphore pool with {} of {} semaphores missing", self.created - self.free.len(), self.created);
        }
        unsafe {
            for semaphore in self.free.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }
        }
        self.created = 0;
    }
}

/// Semaphores waited on by the last present of each swapchain image.
///
/// No fence covers a present's wait, so they stay out of the pool until the
/// same image is acquired again.
#[derive(Default)]
pub struct PresentedSemaphores {
    by_image: HashMap<u32, Vec<vk::Semaphore>>,
}

impl PresentedSemaphores {
    pub fn presented(&mut self, image_index: u32, semaphores: impl IntoIterator<Item = vk::Semaphore>) {
        self.by_image.entry(image_index).or_default().extend(semaphores);
    }

    /// `image_index` was acquired: its previous present has finished waiting.
    pub fn reacquired(&mut self, image_index: u32) -> Vec<vk::Semaphore> {
        self.by_image.remove(&image_index).unwrap_or_default()
    }

    /// Everything, for swapchain teardown after the device went idle.
    pub fn drain(&mut self) -> Vec<vk::Semaphore> {
        self.by_image.drain().flat_map(|(_, semaphores)| semaphores).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn semaphore(raw: u64) -> vk::Semaphore {
        vk::Semaphore::from_raw(raw)
    }

    fn frame_sync() -> FrameSync {
        FrameSync { in_flight_fence: vk::Fence::null(), used: Vec::new(), discarded: Vec::new() }
    }

    #[test]
    fn discarded_semaphores_are_not_recycled() {
        let mut sync = frame_sync();
        sync.track(semaphore(1));
        sync.track(semaphore(2));
        sync.discard(semaphore(2));

        assert_eq!(sync.take_used(), vec![semaphore(1)]);
        assert_eq!(sync.take_discarded(), vec![semaphore(2)]);
        assert!(sync.take_discarded().is_empty());
    }

    #[test]
    fn present_waits_leave_the_frame_slot() {
        let mut sync = frame_sync();
        sync.track(semaphore(1));
        sync.track(semaphore(2));
        sync.untrack(semaphore(2));
        assert_eq!(sync.take_used(), vec![semaphore(1)]);
    }

    #[test]
    fn presented_semaphores_wait_for_their_image() {
        let mut presented = PresentedSemaphores::default();
        presented.presented(0, [semaphore(1)]);
        presented.presented(1, [semaphore(2), semaphore(3)]);

        assert!(presented.reacquired(2).is_empty());
        assert_eq!(presented.reacquired(0), vec![semaphore(1)]);
        assert!(presented.reacquired(0).is_empty());

        let mut rest = presented.drain();
        rest.sort_by_key(|s| s.as_raw());
        assert_eq!(rest, vec![semaphore(2), semaphore(3)]);
    }
}
