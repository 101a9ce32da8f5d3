// Demo command recorder
//
// Clears the swapchain image (and depth) through the render pass each frame
// and keeps a small per-slot uniform block up to date. There is no pipeline
// yet, so nothing samples the uniforms; they exist so the per-slot ring is
// exercised under the same fence discipline a real draw would need.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::buffer::TransientRing;
use crate::backend::VulkanDevice;
use crate::frame_loop::{CommandRecorder, FrameTarget};

/// Per-frame uniform block, std140 compatible
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameUniforms {
    pub transform: Mat4,
    pub tint: Vec4,
    pub time: f32,
    _pad: [f32; 3],
}

impl FrameUniforms {
    /// Slow spin around Z, tint pulsing around `base`
    pub fn at(time: f32, base: Vec4) -> Self {
        let pulse = 0.5 + 0.5 * (time * 2.0).sin();
        Self {
            transform: Mat4::from_rotation_z(time * 0.5),
            tint: (base * (0.75 + 0.25 * pulse)).truncate().extend(base.w),
            time,
            _pad: [0.0; 3],
        }
    }
}

pub struct ClearRecorder {
    device: Arc<VulkanDevice>,
    render_pass: vk::RenderPass,
    clear_color: [f32; 4],
    has_depth: bool,
    uniforms: TransientRing<FrameUniforms>,
    start: Instant,
}

impl ClearRecorder {
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
        clear_color: [f32; 4],
        has_depth: bool,
        frames_in_flight: usize,
    ) -> Result<Self> {
        // One block per frame slot, never per swapchain image
        let uniforms = TransientRing::new(device.clone(), frames_in_flight, vk::BufferUsageFlags::UNIFORM_BUFFER)?;

        Ok(Self {
            device,
            render_pass,
            clear_color,
            has_depth,
            uniforms,
            start: Instant::now(),
        })
    }

    fn clear_values(&self) -> Vec<vk::ClearValue> {
        let mut values = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        if self.has_depth {
            values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            });
        }
        values
    }
}

impl CommandRecorder for ClearRecorder {
    fn record(&mut self, target: &FrameTarget) -> Result<()> {
        let device = &self.device.device;
        let cmd = target.command_buffer;
        let clear_values = self.clear_values();
        log::trace!("Recording slot {} into image {}", target.slot_index, target.image_index);

        unsafe {
            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            // The render pass's load ops do the clearing
            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.render_pass)
                .framebuffer(target.framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: target.extent,
                })
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_end_render_pass(cmd);

            device.end_command_buffer(cmd).context("Failed to end command buffer")?;
        }

        Ok(())
    }

    fn update_transient_state(&mut self, slot_index: usize) -> Result<()> {
        let time = self.start.elapsed().as_secs_f32();
        let uniforms = FrameUniforms::at(time, Vec4::from_array(self.clear_color));
        self.uniforms.write(slot_index, &uniforms)
    }
}
