// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync, plus the command buffer
// each frame slot records into. Created once at startup and kept for the
// whole run; they are NOT rebuilt with the swapchain.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// Object creation the frame ring needs from the GPU
pub trait SyncBackend {
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn destroy_fence(&self, fence: vk::Fence);
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);
}

/// Frame synchronization - one per frame in flight
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSlot {
    /// Signaled by acquire, waited on by submit
    pub image_available: vk::Semaphore,
    /// Signaled by submit, waited on by present
    pub render_finished: vk::Semaphore,
    /// Signaled when the slot's submission completes; the CPU waits on it
    pub in_flight: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
}

/// Fixed ring of frame slots
pub struct FrameSlots<B: SyncBackend> {
    backend: Arc<B>,
    slots: Vec<FrameSlot>,
}

impl<B: SyncBackend> FrameSlots<B> {
    pub fn new(backend: Arc<B>, count: usize) -> Result<Self> {
        assert!(count > 0, "frame ring needs at least one slot");

        let mut ring = Self {
            backend,
            slots: Vec::with_capacity(count),
        };

        let command_buffers = ring
            .backend
            .allocate_command_buffers(count as u32)
            .context("Failed to allocate frame command buffers")?;

        // Pushed as they come so a failure half-way still frees what exists
        let mut command_buffers = command_buffers.into_iter();
        for index in 0..count {
            let command_buffer = command_buffers
                .next()
                .context("Backend returned too few command buffers")?;
            let slot = ring.create_slot(command_buffer);
            match slot {
                Ok(slot) => ring.slots.push(slot),
                Err(e) => {
                    ring.backend.free_command_buffers(&[command_buffer]);
                    if !command_buffers.as_slice().is_empty() {
                        ring.backend.free_command_buffers(command_buffers.as_slice());
                    }
                    return Err(e.context(format!("Failed to create frame slot {}", index)));
                }
            }
        }

        log::info!("Created {} frame slots", count);
        Ok(ring)
    }

    fn create_slot(&self, command_buffer: vk::CommandBuffer) -> Result<FrameSlot> {
        let image_available = self.backend.create_semaphore()?;
        let render_finished = match self.backend.create_semaphore() {
            Ok(s) => s,
            Err(e) => {
                self.backend.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        // Start signaled so the very first wait on this slot returns at once
        let in_flight = match self.backend.create_fence(true) {
            Ok(f) => f,
            Err(e) => {
                self.backend.destroy_semaphore(render_finished);
                self.backend.destroy_semaphore(image_available);
                return Err(e);
            }
        };

        Ok(FrameSlot {
            image_available,
            render_finished,
            in_flight,
            command_buffer,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot> {
        self.slots.iter()
    }
}

impl<B: SyncBackend> Drop for FrameSlots<B> {
    fn drop(&mut self) {
        let command_buffers: Vec<_> = self.slots.iter().map(|s| s.command_buffer).collect();
        for slot in self.slots.drain(..) {
            self.backend.destroy_semaphore(slot.image_available);
            self.backend.destroy_semaphore(slot.render_finished);
            self.backend.destroy_fence(slot.in_flight);
        }
        if !command_buffers.is_empty() {
            self.backend.free_command_buffers(&command_buffers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockGpu};

    #[test]
    fn test_slots_are_distinct_and_fences_start_signaled() {
        let gpu = MockGpu::new();
        let slots = FrameSlots::new(gpu.clone(), 2).unwrap();

        assert_eq!(slots.len(), 2);
        assert_ne!(slots.get(0), slots.get(1));
        for slot in slots.iter() {
            assert!(gpu.fence_signaled(slot.in_flight));
            assert_ne!(slot.image_available, slot.render_finished);
        }
        assert_eq!(gpu.count(|c| matches!(c, Call::CreateFence { signaled: true })), 2);
        assert_eq!(gpu.count(|c| matches!(c, Call::CreateFence { signaled: false })), 0);
    }

    #[test]
    fn test_drop_destroys_every_object_once() {
        let gpu = MockGpu::new();
        drop(FrameSlots::new(gpu.clone(), 3).unwrap());

        assert_eq!(gpu.count(|c| matches!(c, Call::DestroySemaphore(_))), 6);
        assert_eq!(gpu.count(|c| matches!(c, Call::DestroyFence(_))), 3);
        assert_eq!(gpu.count(|c| matches!(c, Call::FreeCommandBuffers(3))), 1);
    }

    #[test]
    fn test_failed_slot_creation_releases_earlier_slots() {
        let gpu = MockGpu::new();
        gpu.fail_fence_after(1);

        assert!(FrameSlots::new(gpu.clone(), 2).is_err());

        let created = gpu.count(|c| matches!(c, Call::CreateSemaphore));
        assert_eq!(gpu.count(|c| matches!(c, Call::DestroySemaphore(_))), created);
        assert_eq!(gpu.count(|c| matches!(c, Call::DestroyFence(_))), 1);
        let freed: usize = gpu
            .calls()
            .iter()
            .map(|c| match c {
                Call::FreeCommandBuffers(n) => *n,
                _ => 0,
            })
            .sum();
        assert_eq!(freed, 2);
    }
}
