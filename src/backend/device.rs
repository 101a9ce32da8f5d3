// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with the window system's surface extensions
// - Surface creation for the window we present to
// - Physical device selection (delegated to `selector`)
// - Logical device with one queue per distinct family
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr::Surface};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::selector::{self, DeviceCandidate, DeviceRequirements, QueueAssignment};

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    /// Dropped by hand before the device it allocates from
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles; the same queue twice when one family does both
    pub queues: QueueAssignment,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: Surface,

    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    _entry: Entry,

    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create the instance, surface and logical device for one window
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `display_handle` / `window_handle` - The window to present to
    /// * `requirements` - What the chosen GPU must support
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        requirements: &DeviceRequirements,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation, display_handle)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Create surface (platform-specific window connection)
        let surface_loader = Surface::new(&entry, &instance);
        let surface = unsafe { ash_window::create_surface(&entry, &instance, display_handle, window_handle, None) }
            .context("Failed to create window surface")?;

        // Step 5: Pick physical device (GPU)
        let profiles = selector::enumerate_profiles(&instance, &surface_loader, surface)?;
        let candidate = selector::select_device(&profiles, requirements)?;
        log::info!(
            "Selected GPU: {} ({:?}) - Score: {}",
            candidate.name,
            candidate.device_type,
            candidate.score
        );
        if !candidate.queues.is_shared() {
            log::info!(
                "Using separate queue families: graphics {}, present {}",
                candidate.queues.graphics,
                candidate.queues.present
            );
        }

        // Step 6: Create logical device
        let device = Self::create_logical_device(&instance, &candidate, requirements)?;
        let graphics_queue = unsafe { device.get_device_queue(candidate.queues.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(candidate.queues.present, 0) };

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(candidate.handle) };
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 8: Create memory allocator
        let allocator = Self::create_allocator(&instance, candidate.handle, &device)?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device: candidate.handle,
            queues: candidate.queues,
            graphics_queue,
            present_queue,
            surface,
            surface_loader,
            debug_utils,
            instance,
            _entry: entry,
            properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("Frame Pacer")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Surface extensions for whatever window system we're on
        let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display_handle)
            .context("Unsupported window system")?
            .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        candidate: &DeviceCandidate,
        requirements: &DeviceRequirements,
    ) -> Result<ash::Device> {
        // One queue from each distinct family
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = candidate
            .queues
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const c_char> = requirements.extensions.iter().map(|e| e.as_ptr()).collect();

        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: if requirements.sampler_anisotropy { vk::TRUE } else { vk::FALSE },
            ..Default::default()
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(candidate.handle, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }

    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device ({})...", self.device_name());

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order: allocator, device, surface, messenger, instance
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
