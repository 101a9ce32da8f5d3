// Vulkan implementation of the chain, sync and frame traits
//
// Thin: every method is one or two ash calls. Owns the swapchain loader, the
// render pass framebuffers are built against and the command pool the frame
// slots allocate from.

use anyhow::{Context, Result};
use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

use super::buffer::{self, DepthAttachment};
use super::pipeline;
use super::swapchain::{self as chain, ChainBackend, SurfaceSupport, SwapchainRequest};
use super::sync::SyncBackend;
use super::VulkanDevice;
use crate::frame_loop::{FrameBackend, FrameSubmission};

pub struct VulkanBackend {
    device: Arc<VulkanDevice>,
    swapchain_loader: SwapchainLoader,
    surface_format: vk::SurfaceFormatKHR,
    render_pass: vk::RenderPass,
    command_pool: vk::CommandPool,
}

impl VulkanBackend {
    /// The render pass is built once for the surface format picked here, so
    /// every rebuilt chain must keep using that format.
    pub fn new(device: Arc<VulkanDevice>, depth_format: Option<vk::Format>) -> Result<Self> {
        let swapchain_loader = SwapchainLoader::new(&device.instance, &device.device);

        let formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical_device, device.surface)
        }
        .context("Failed to query surface formats")?;
        let surface_format = chain::choose_surface_format(&formats, None);

        let render_pass = pipeline::create_render_pass(&device, surface_format.format, depth_format)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queues.graphics)
            // TRANSIENT: Command buffers are short-lived
            // RESET: Allow individual buffer reset
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = match unsafe { device.device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.device.destroy_render_pass(render_pass, None) };
                return Err(e).context("Failed to create command pool");
            }
        };

        Ok(Self {
            device,
            swapchain_loader,
            surface_format,
            render_pass,
            command_pool,
        })
    }

    #[inline]
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Format the render pass was built for; pass it as the chain's preference
    #[inline]
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }
}

impl ChainBackend for VulkanBackend {
    type Depth = DepthAttachment;

    fn surface_support(&self) -> Result<SurfaceSupport> {
        let loader = &self.device.surface_loader;
        let physical_device = self.device.physical_device;
        let surface = self.device.surface;

        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .context("Failed to query surface capabilities")?,
                formats: loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .context("Failed to query surface formats")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .context("Failed to query present modes")?,
            })
        }
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> Result<vk::SwapchainKHR> {
        let queue_families = [self.device.queues.graphics, self.device.queues.present];

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.device.surface)
            .min_image_count(request.min_image_count)
            .image_format(request.surface_format.format)
            .image_color_space(request.surface_format.color_space)
            .image_extent(request.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(request.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(request.present_mode)
            .clipped(true);

        // Images are written on one queue and presented from another
        create_info = if self.device.queues.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        };

        unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }.context("Failed to create swapchain")
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }.context("Failed to get swapchain images")
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.device.device.create_image_view(&create_info, None) }.context("Failed to create image view")
    }

    fn create_depth(&self, format: vk::Format, extent: vk::Extent2D) -> Result<DepthAttachment> {
        buffer::create_depth_attachment(&self.device, format, extent)
    }

    fn depth_view(depth: &DepthAttachment) -> vk::ImageView {
        depth.view
    }

    fn create_framebuffer(
        &self,
        color: vk::ImageView,
        depth: Option<vk::ImageView>,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let attachments: Vec<_> = std::iter::once(color).chain(depth).collect();
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(self.render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
            .context("Failed to create framebuffer")
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
    }

    fn destroy_depth(&self, depth: DepthAttachment) {
        buffer::destroy_depth_attachment(&self.device, depth);
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.device.destroy_image_view(view, None) };
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl SyncBackend for VulkanBackend {
    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.device.create_semaphore(&semaphore_info, None) }.context("Failed to create semaphore")
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.device.create_fence(&fence_info, None) }.context("Failed to create fence")
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.device.destroy_semaphore(semaphore, None) };
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.device.destroy_fence(fence, None) };
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        unsafe {
            self.device
                .device
                .free_command_buffers(self.command_pool, command_buffers)
        };
    }
}

impl FrameBackend for VulkanBackend {
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.device.device.wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.device.reset_fences(&[fence]) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn submit(&self, submission: &FrameSubmission) -> VkResult<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let command_buffers = [submission.command_buffer];
        let signal_semaphores = [submission.signal_semaphore];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores) // Wait for image to be available
            .wait_dst_stage_mask(&wait_stages) // Which stage waits
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], submission.fence)
        }
    }

    fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.swapchain_loader
                .queue_present(self.device.present_queue, &present_info)
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        unsafe {
            // Also frees any command buffers still allocated from it
            self.device.device.destroy_command_pool(self.command_pool, None);
            self.device.device.destroy_render_pass(self.render_pass, None);
        }
    }
}
