// Recording GPU and window stand-ins for unit tests
//
// `MockGpu` implements every backend trait, hands out unique fake handles and
// logs each call so tests can assert on ordering. It also models just enough
// GPU behaviour to catch sync bugs: a submission keeps its command buffer busy
// until a wait on its fence observes completion, and a stalled GPU never
// completes anything.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::backend::swapchain::{ChainBackend, SurfaceSupport, SwapchainRequest};
use crate::backend::sync::SyncBackend;
use crate::frame_loop::{FrameBackend, FrameSubmission};
use crate::window::{ResizeSignal, WindowSurface};

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    SurfaceSupport,
    CreateSwapchain { min_image_count: u32 },
    SwapchainImages(vk::SwapchainKHR),
    CreateImageView(vk::Image),
    CreateDepth,
    CreateFramebuffer { color: vk::ImageView, depth: Option<vk::ImageView> },
    DestroyFramebuffer(vk::Framebuffer),
    DestroyDepth(vk::ImageView),
    DestroyImageView(vk::ImageView),
    DestroySwapchain(vk::SwapchainKHR),
    WaitIdle,

    CreateSemaphore,
    CreateFence { signaled: bool },
    AllocateCommandBuffers(u32),
    DestroySemaphore(vk::Semaphore),
    DestroyFence(vk::Fence),
    FreeCommandBuffers(usize),

    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    Acquire { swapchain: vk::SwapchainKHR, semaphore: vk::Semaphore },
    ResetCommandBuffer(vk::CommandBuffer),
    Submit(FrameSubmission),
    Present { swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore },

    WaitEvents,
}

struct MockState {
    next_handle: u64,
    calls: Vec<Call>,

    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    returned_images: Option<usize>,
    swapchain_lengths: HashMap<vk::SwapchainKHR, usize>,
    framebuffer_budget: Option<usize>,
    fence_budget: Option<usize>,

    fences: HashMap<vk::Fence, bool>,
    in_flight: HashMap<vk::Fence, vk::CommandBuffer>,
    busy: HashSet<vk::CommandBuffer>,
    stalled: bool,

    next_image: u32,
    acquire_script: VecDeque<VkResult<(u32, bool)>>,
    present_script: VecDeque<VkResult<bool>>,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct MockGpu {
    state: Mutex<MockState>,
}

impl MockGpu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_handle: 0,
                calls: Vec::new(),
                capabilities: vk::SurfaceCapabilitiesKHR {
                    min_image_count: 2,
                    max_image_count: 3,
                    current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
                    min_image_extent: vk::Extent2D { width: 1, height: 1 },
                    max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
                    ..Default::default()
                },
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                returned_images: None,
                swapchain_lengths: HashMap::new(),
                framebuffer_budget: None,
                fence_budget: None,
                fences: HashMap::new(),
                in_flight: HashMap::new(),
                busy: HashSet::new(),
                stalled: false,
                next_image: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
            }),
        })
    }

    fn log(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scripting
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_image_limits(&self, min: u32, max: u32) {
        let mut state = self.state.lock();
        state.capabilities.min_image_count = min;
        state.capabilities.max_image_count = max;
    }

    /// Make the presentation engine return this many images regardless of the request
    pub fn set_returned_images(&self, count: Option<usize>) {
        self.state.lock().returned_images = count;
    }

    /// Let `n` framebuffer creations succeed, then fail
    pub fn fail_framebuffer_after(&self, n: usize) {
        self.state.lock().framebuffer_budget = Some(n);
    }

    /// Let `n` fence creations succeed, then fail
    pub fn fail_fence_after(&self, n: usize) {
        self.state.lock().fence_budget = Some(n);
    }

    /// A stalled GPU never finishes submitted work
    pub fn stall(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    pub fn script_acquire(&self, result: VkResult<(u32, bool)>) {
        self.state.lock().acquire_script.push_back(result);
    }

    pub fn script_present(&self, result: VkResult<bool>) {
        self.state.lock().present_script.push_back(result);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn requested_image_counts(&self) -> Vec<u32> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::CreateSwapchain { min_image_count } => Some(*min_image_count),
                _ => None,
            })
            .collect()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }
}

impl ChainBackend for MockGpu {
    type Depth = vk::ImageView;

    fn surface_support(&self) -> Result<SurfaceSupport> {
        let mut state = self.state.lock();
        state.calls.push(Call::SurfaceSupport);
        Ok(SurfaceSupport {
            capabilities: state.capabilities,
            formats: state.formats.clone(),
            present_modes: state.present_modes.clone(),
        })
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> Result<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateSwapchain {
            min_image_count: request.min_image_count,
        });
        let swapchain = vk::SwapchainKHR::from_raw(state.handle());
        let length = state.returned_images.unwrap_or(request.min_image_count as usize);
        state.swapchain_lengths.insert(swapchain, length);
        state.next_image = 0;
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let mut state = self.state.lock();
        state.calls.push(Call::SwapchainImages(swapchain));
        let length = state.swapchain_lengths.get(&swapchain).copied().unwrap_or(0);
        Ok((0..length).map(|_| vk::Image::from_raw(state.handle())).collect())
    }

    fn create_image_view(&self, image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateImageView(image));
        Ok(vk::ImageView::from_raw(state.handle()))
    }

    fn create_depth(&self, _format: vk::Format, _extent: vk::Extent2D) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateDepth);
        Ok(vk::ImageView::from_raw(state.handle()))
    }

    fn depth_view(depth: &vk::ImageView) -> vk::ImageView {
        *depth
    }

    fn create_framebuffer(
        &self,
        color: vk::ImageView,
        depth: Option<vk::ImageView>,
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let mut state = self.state.lock();
        if let Some(budget) = state.framebuffer_budget.as_mut() {
            if *budget == 0 {
                anyhow::bail!("mock framebuffer creation failure");
            }
            *budget -= 1;
        }
        state.calls.push(Call::CreateFramebuffer { color, depth });
        Ok(vk::Framebuffer::from_raw(state.handle()))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.log(Call::DestroyFramebuffer(framebuffer));
    }

    fn destroy_depth(&self, depth: vk::ImageView) {
        self.log(Call::DestroyDepth(depth));
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.log(Call::DestroyImageView(view));
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.log(Call::DestroySwapchain(swapchain));
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::WaitIdle);
        if state.stalled {
            anyhow::bail!("mock device is stalled");
        }
        // Idle means every submission has retired
        let retired: Vec<_> = state.in_flight.drain().collect();
        for (fence, command_buffer) in retired {
            state.fences.insert(fence, true);
            state.busy.remove(&command_buffer);
        }
        Ok(())
    }
}

impl SyncBackend for MockGpu {
    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateSemaphore);
        Ok(vk::Semaphore::from_raw(state.handle()))
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        if let Some(budget) = state.fence_budget.as_mut() {
            if *budget == 0 {
                anyhow::bail!("mock fence creation failure");
            }
            *budget -= 1;
        }
        state.calls.push(Call::CreateFence { signaled });
        let fence = vk::Fence::from_raw(state.handle());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        state.calls.push(Call::AllocateCommandBuffers(count));
        Ok((0..count).map(|_| vk::CommandBuffer::from_raw(state.handle())).collect())
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.log(Call::DestroySemaphore(semaphore));
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.log(Call::DestroyFence(fence));
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        self.log(Call::FreeCommandBuffers(command_buffers.len()));
    }
}

impl FrameBackend for MockGpu {
    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::WaitFence(fence));

        if state.fences.get(&fence).copied().unwrap_or(false) {
            return Ok(());
        }
        // Unsignaled with nothing submitted would hang forever on real hardware
        if state.stalled || !state.in_flight.contains_key(&fence) {
            return Err(vk::Result::TIMEOUT);
        }
        if let Some(command_buffer) = state.in_flight.remove(&fence) {
            state.busy.remove(&command_buffer);
        }
        state.fences.insert(fence, true);
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::ResetFence(fence));
        state.fences.insert(fence, false);
        Ok(())
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        state.calls.push(Call::Acquire { swapchain, semaphore });
        if let Some(result) = state.acquire_script.pop_front() {
            return result;
        }
        let length = state.swapchain_lengths.get(&swapchain).copied().unwrap_or(1).max(1) as u32;
        let index = state.next_image % length;
        state.next_image += 1;
        Ok((index, false))
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        assert!(
            !state.busy.contains(&command_buffer),
            "command buffer {:?} reset while the GPU still owns it",
            command_buffer
        );
        state.calls.push(Call::ResetCommandBuffer(command_buffer));
        Ok(())
    }

    fn submit(&self, submission: &FrameSubmission) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Submit(*submission));
        state.fences.insert(submission.fence, false);
        state.in_flight.insert(submission.fence, submission.command_buffer);
        state.busy.insert(submission.command_buffer);
        Ok(())
    }

    fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.calls.push(Call::Present {
            swapchain,
            image_index,
            wait,
        });
        state.present_script.pop_front().unwrap_or(Ok(false))
    }
}

/// Window with a scripted sequence of drawable sizes
pub struct MockWindow {
    gpu: Arc<MockGpu>,
    sizes: VecDeque<(u32, u32)>,
    close_requested: bool,
    close_after_frames: Option<usize>,
    polls: usize,
    resize_on_wait: Option<ResizeSignal>,
}

impl MockWindow {
    pub fn new(gpu: &Arc<MockGpu>, sizes: &[(u32, u32)]) -> Self {
        Self {
            gpu: gpu.clone(),
            sizes: sizes.iter().copied().collect(),
            close_requested: false,
            close_after_frames: None,
            polls: 0,
            resize_on_wait: None,
        }
    }

    /// Replace the size script; each `wait_events` moves to the next entry
    pub fn set_sizes(&mut self, sizes: &[(u32, u32)]) {
        self.sizes = sizes.iter().copied().collect();
    }

    /// Raise `resize` on every `wait_events`, like winit's `Resized` events
    pub fn raise_on_wait(&mut self, resize: &ResizeSignal) {
        self.resize_on_wait = Some(resize.clone());
    }

    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Report should-close once `frames` polls have gone by
    pub fn close_after_frames(&mut self, frames: usize) {
        self.close_after_frames = Some(frames);
    }
}

impl WindowSurface for MockWindow {
    fn drawable_size(&self) -> (u32, u32) {
        self.sizes.front().copied().unwrap_or((0, 0))
    }

    fn poll_events(&mut self) {
        self.polls += 1;
        if self.close_after_frames.is_some_and(|frames| self.polls > frames) {
            self.close_requested = true;
        }
    }

    fn wait_events(&mut self) {
        self.gpu.log(Call::WaitEvents);
        if let Some(resize) = &self.resize_on_wait {
            resize.raise();
        }
        if self.sizes.len() > 1 {
            self.sizes.pop_front();
        }
    }

    fn should_close(&self) -> bool {
        self.close_requested
    }
}
