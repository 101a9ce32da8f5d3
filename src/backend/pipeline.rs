// Render pass setup
//
// One subpass writing the swapchain image, plus the depth attachment when the
// chain carries one. Framebuffers are built against this pass by the backend.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Color attachment first, then depth if present
pub fn attachment_descriptions(
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
) -> Vec<vk::AttachmentDescription> {
    // Color attachment (the swapchain image)
    let color = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let mut attachments = vec![color];

    if let Some(format) = depth_format {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE) // Don't need to store depth
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        );
    }

    attachments
}

/// Dependency on work submitted before the pass.
///
/// The acquire semaphore is waited at COLOR_ATTACHMENT_OUTPUT, so the color
/// layout transition must not start before that stage. The depth image is
/// shared by every frame slot, so this pass's depth clear also has to wait for
/// the previous frame's depth writes, which land in LATE_FRAGMENT_TESTS.
pub fn external_dependency(has_depth: bool) -> vk::SubpassDependency {
    let (src_stage, src_access, dst_stage, dst_access) = if has_depth {
        (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
    } else {
        (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
    };

    vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .build()
}

/// Create a render pass for the swapchain format, with depth when requested
pub fn create_render_pass(
    device: &VulkanDevice,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
) -> Result<vk::RenderPass> {
    let attachments = attachment_descriptions(color_format, depth_format);

    let color_attachment_ref = [vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build()];

    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachment_ref);
    if depth_format.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_attachment_ref);
    }
    let subpasses = [subpass.build()];

    let dependencies = [external_dependency(depth_format.is_some())];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.device.create_render_pass(&render_pass_info, None) }.context("Failed to create render pass")
}
