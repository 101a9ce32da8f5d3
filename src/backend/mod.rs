// Backend module - Vulkan abstraction layer
//
// Design: chain and slot management are written against small traits
// (`ChainBackend`, `SyncBackend`, `FrameBackend`); `VulkanBackend` is the ash
// implementation and `mock` the recording one used by tests.

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod selector;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

#[cfg(test)]
pub mod mock;

pub use device::VulkanDevice;
pub use swapchain::ChainConfig;
pub use vulkan::VulkanBackend;
