// =============================================================================
// FRAME LOOP
// =============================================================================
//
// Drives one frame per iteration over a fixed ring of frame slots:
//
// ┌──────────────────────────────────────────────────────────────────────────┐
// │  wait fence ─> acquire ─> reset + record ─> transient ─> submit ─> present │
// │      │            │                                                 │    │
// │  (slot free?)  (stale? rebuild,                   (stale/resized? rebuild)│
// │                 skip frame)                                              │
// └──────────────────────────────────────────────────────────────────────────┘
//
// A slot's command buffer is only touched after its fence has signaled, and the
// fence is only reset once an image has actually been acquired, so a skipped
// frame never leaves a fence that nothing will signal.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::swapchain::{ChainBackend, ChainConfig, PresentationChain};
use crate::backend::sync::{FrameSlots, SyncBackend};
use crate::error::RenderError;
use crate::window::{ResizeSignal, WindowSurface};

/// Neither wait is allowed to give up; a timeout here means the GPU is hung
const FENCE_TIMEOUT: u64 = u64::MAX;
const ACQUIRE_TIMEOUT: u64 = u64::MAX;

/// One queue submission for one frame slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSubmission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// Per-frame GPU calls. Raw `vk::Result`s come back so the loop can tell a
/// stale swapchain apart from a real failure.
pub trait FrameBackend: ChainBackend + SyncBackend {
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// `(image_index, suboptimal)`
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// Submit on the graphics queue
    fn submit(&self, submission: &FrameSubmission) -> VkResult<()>;

    /// Present on the presentation queue. `Ok(true)` means suboptimal.
    fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> VkResult<bool>;
}

/// Everything the recorder needs for one frame
#[derive(Clone, Copy, Debug)]
pub struct FrameTarget {
    pub command_buffer: vk::CommandBuffer,
    pub image_index: u32,
    pub slot_index: usize,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
}

/// Fills a slot's command buffer. Must not submit or present.
pub trait CommandRecorder {
    fn record(&mut self, target: &FrameTarget) -> Result<()>;

    /// Write per-frame data owned by `slot_index`; its previous use has retired
    fn update_transient_state(&mut self, _slot_index: usize) -> Result<()> {
        Ok(())
    }
}

/// Which frame slot is in use; wraps at the slot count
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameCursor {
    index: usize,
    count: usize,
}

impl FrameCursor {
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "frame cursor needs at least one slot");
        Self { index: 0, count }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.count;
    }
}

/// What happened to one iteration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Submitted and presented
    Presented,
    /// Submitted and presented, then the chain was rebuilt
    PresentedAndRebuilt,
    /// Nothing submitted; the chain was stale at acquire time
    Skipped,
}

// =============================================================================
// FPS TRACKING
// =============================================================================

#[derive(Debug)]
pub struct FrameStats {
    total_frames: u64,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl FrameStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            total_frames: 0,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn frame_presented(&mut self) {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;
        self.total_frames += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            log::info!("{:.0} FPS ({:.2}ms)", fps, frame_time * 1000.0);
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    #[inline]
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

// =============================================================================
// DRIVER
// =============================================================================

/// Owns the chain and the slot ring and renders frames into them.
///
/// Field order matters for Drop: chain, slots and recorder release their GPU
/// objects first, then the backend, and the window goes last so the surface
/// never outlives it.
pub struct FrameLoop<B: FrameBackend, W: WindowSurface, R: CommandRecorder> {
    chain: PresentationChain<B>,
    slots: FrameSlots<B>,
    recorder: R,
    backend: Arc<B>,
    window: W,
    resize: ResizeSignal,
    cursor: FrameCursor,
    stats: FrameStats,
}

impl<B: FrameBackend, W: WindowSurface, R: CommandRecorder> FrameLoop<B, W, R> {
    pub fn new(
        backend: Arc<B>,
        mut window: W,
        recorder: R,
        chain_config: ChainConfig,
        frames_in_flight: usize,
        resize: ResizeSignal,
    ) -> Result<Self> {
        let chain = PresentationChain::new(backend.clone(), &mut window, chain_config)
            .context("Failed to create presentation chain")?;
        // Sync objects don't depend on the chain and are never rebuilt with it
        let slots = FrameSlots::new(backend.clone(), frames_in_flight)?;

        Ok(Self {
            chain,
            slots,
            recorder,
            backend,
            window,
            resize,
            cursor: FrameCursor::new(frames_in_flight),
            stats: FrameStats::new(),
        })
    }

    /// Render until the window asks to close, then wait for the GPU to drain
    pub fn run(&mut self) -> Result<()> {
        log::info!(
            "Entering frame loop: {} frames in flight, {:?} {:?}",
            self.slots.len(),
            self.chain.present_mode(),
            self.chain.surface_format().format
        );

        while !self.window.should_close() {
            self.window.poll_events();
            if self.window.should_close() {
                break;
            }
            self.render_frame()?;
        }

        self.backend.wait_idle().context("Failed to wait for device idle")?;
        log::info!("Frame loop finished after {} frames", self.stats.total_frames());
        Ok(())
    }

    /// Run one iteration of the frame protocol.
    pub fn render_frame(&mut self) -> Result<FrameOutcome> {
        let slot_index = self.cursor.index();
        let slot = *self.slots.get(slot_index);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Wait until the slot's previous submission has retired
        // ─────────────────────────────────────────────────────────────────────
        self.backend
            .wait_for_fence(slot.in_flight, FENCE_TIMEOUT)
            .map_err(|e| RenderError::from_wait("frame fence", e))?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Acquire the next presentable image
        // ─────────────────────────────────────────────────────────────────────
        let acquired = self
            .backend
            .acquire_next_image(self.chain.handle(), ACQUIRE_TIMEOUT, slot.image_available);

        let image_index = match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Acquired image {} from a suboptimal swapchain", index);
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                // Fence is still signaled, so the slot is reusable next iteration
                log::debug!("Swapchain out of date at acquire, skipping frame");
                self.rebuild_chain()?;
                return Ok(FrameOutcome::Skipped);
            }
            Err(e @ (vk::Result::TIMEOUT | vk::Result::NOT_READY)) => {
                return Err(RenderError::from_wait("swapchain image", e).into());
            }
            Err(e) => return Err(RenderError::Acquire(e).into()),
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Reset and record
        // ─────────────────────────────────────────────────────────────────────
        let framebuffer = self.chain.framebuffer(image_index);

        self.backend
            .reset_fence(slot.in_flight)
            .context("Failed to reset frame fence")?;
        self.backend
            .reset_command_buffer(slot.command_buffer)
            .context("Failed to reset command buffer")?;

        let target = FrameTarget {
            command_buffer: slot.command_buffer,
            image_index,
            slot_index,
            framebuffer,
            extent: self.chain.extent(),
        };
        self.recorder.record(&target).context("Failed to record frame")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Per-slot transient data
        // ─────────────────────────────────────────────────────────────────────
        self.recorder
            .update_transient_state(slot_index)
            .context("Failed to update per-frame state")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Submit
        // ─────────────────────────────────────────────────────────────────────
        let submission = FrameSubmission {
            command_buffer: slot.command_buffer,
            wait_semaphore: slot.image_available,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: slot.render_finished,
            fence: slot.in_flight,
        };
        self.backend.submit(&submission).map_err(RenderError::Submit)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Present
        // ─────────────────────────────────────────────────────────────────────
        let stale = match self
            .backend
            .present(self.chain.handle(), image_index, slot.render_finished)
        {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(RenderError::Present(e).into()),
        };

        let outcome = if stale || self.resize.is_raised() {
            log::debug!("Rebuilding swapchain after present (stale: {})", stale);
            self.rebuild_chain()?;
            FrameOutcome::PresentedAndRebuilt
        } else {
            FrameOutcome::Presented
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 7: Advance to next slot
        // ─────────────────────────────────────────────────────────────────────
        self.cursor.advance();
        self.stats.frame_presented();

        Ok(outcome)
    }

    fn rebuild_chain(&mut self) -> Result<()> {
        self.chain.recreate(&mut self.window, &self.resize)
    }

    #[cfg(test)]
    pub fn cursor(&self) -> FrameCursor {
        self.cursor
    }

    #[cfg(test)]
    pub fn chain(&self) -> &PresentationChain<B> {
        &self.chain
    }

    #[cfg(test)]
    pub fn slots(&self) -> &FrameSlots<B> {
        &self.slots
    }

    #[cfg(test)]
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    #[cfg(test)]
    pub fn window_mut(&mut self) -> &mut W {
        &mut self.window
    }

    #[cfg(test)]
    pub fn recorder(&self) -> &R {
        &self.recorder
    }
}

impl<B: FrameBackend, W: WindowSurface, R: CommandRecorder> Drop for FrameLoop<B, W, R> {
    fn drop(&mut self) {
        // Nothing may still be executing when the chain and slots are destroyed
        if let Err(e) = self.backend.wait_idle() {
            log::error!("Failed to wait for device idle during shutdown: {:?}", e);
        }
    }
}
