// GPU memory-backed resources
//
// The depth attachment that travels with the swapchain, and the per-slot ring
// of host-visible uniform buffers the CPU rewrites every frame. Memory comes
// from the device's gpu-allocator instance.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::marker::PhantomData;
use std::sync::Arc;

use super::VulkanDevice;

/// Depth image, its memory and view
pub struct DepthAttachment {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Allocation,
}

/// Create a depth buffer image, memory, and view
pub fn create_depth_attachment(
    device: &VulkanDevice,
    format: vk::Format,
    extent: vk::Extent2D,
) -> Result<DepthAttachment> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe { device.device.create_image(&image_info, None) }
        .context("Failed to create depth image")?;

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };
    let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
        name: "depth attachment",
        requirements,
        location: MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            return Err(e).context("Failed to allocate depth image memory");
        }
    };

    let view = unsafe { device.device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
        .context("Failed to bind depth image memory")
        .and_then(|_| {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::DEPTH,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            unsafe { device.device.create_image_view(&view_info, None) }.context("Failed to create depth image view")
        });

    match view {
        Ok(view) => Ok(DepthAttachment { image, view, allocation }),
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            free_allocation(device, allocation);
            Err(e)
        }
    }
}

pub fn destroy_depth_attachment(device: &VulkanDevice, depth: DepthAttachment) {
    unsafe {
        device.device.destroy_image_view(depth.view, None);
        device.device.destroy_image(depth.image, None);
    }
    free_allocation(device, depth.allocation);
}

fn free_allocation(device: &VulkanDevice, allocation: Allocation) {
    if let Err(e) = device.allocator.lock().free(allocation) {
        log::error!("Failed to free GPU allocation: {:?}", e);
    }
}

// =============================================================================
// TRANSIENT RING
// =============================================================================

struct TransientBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
}

/// One persistently mapped buffer of `T` per frame slot.
///
/// Slot `i` may only be written after slot `i`'s fence has signaled; the frame
/// loop guarantees that by calling in only from `update_transient_state`.
pub struct TransientRing<T: Pod> {
    device: Arc<VulkanDevice>,
    buffers: Vec<TransientBuffer>,
    _marker: PhantomData<T>,
}

impl<T: Pod> TransientRing<T> {
    pub fn new(device: Arc<VulkanDevice>, slot_count: usize, usage: vk::BufferUsageFlags) -> Result<Self> {
        let mut ring = Self {
            device,
            buffers: Vec::with_capacity(slot_count),
            _marker: PhantomData,
        };

        let size = std::mem::size_of::<T>() as vk::DeviceSize;
        for slot in 0..slot_count {
            let buffer_info = vk::BufferCreateInfo::builder()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let buffer = unsafe { ring.device.device.create_buffer(&buffer_info, None) }
                .context("Failed to create transient buffer")?;
            // Owned by the ring from here so Drop cleans up on failure
            ring.buffers.push(TransientBuffer {
                buffer,
                allocation: None,
            });

            let requirements = unsafe { ring.device.device.get_buffer_memory_requirements(buffer) };
            let name = format!("transient slot {}", slot);
            let allocation = ring
                .device
                .allocator
                .lock()
                .allocate(&AllocationCreateDesc {
                    name: &name,
                    requirements,
                    location: MemoryLocation::CpuToGpu,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .context("Failed to allocate transient buffer memory")?;

            let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
            if let Some(last) = ring.buffers.last_mut() {
                last.allocation = Some(allocation);
            }

            unsafe { ring.device.device.bind_buffer_memory(buffer, memory, offset) }
                .context("Failed to bind transient buffer memory")?;
        }

        log::debug!("Created {} transient buffers of {} bytes", slot_count, size);
        Ok(ring)
    }

    /// Overwrite slot `slot` with `value`
    pub fn write(&mut self, slot: usize, value: &T) -> Result<()> {
        let allocation = self.buffers[slot]
            .allocation
            .as_mut()
            .context("Transient buffer has no memory")?;
        let mapped = allocation
            .mapped_slice_mut()
            .context("Transient buffer memory is not host visible")?;

        let bytes = bytemuck::bytes_of(value);
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl<T: Pod> Drop for TransientRing<T> {
    fn drop(&mut self) {
        for transient in self.buffers.drain(..) {
            unsafe { self.device.device.destroy_buffer(transient.buffer, None) };
            if let Some(allocation) = transient.allocation {
                free_allocation(&self.device, allocation);
            }
        }
    }
}
