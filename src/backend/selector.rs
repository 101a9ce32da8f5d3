// Physical device selection
//
// Enumeration and scoring are split: `enumerate_profiles` talks to Vulkan and
// flattens each GPU into a `DeviceProfile`, `select_device` is pure and picks
// the winner. That keeps the scoring rules testable without a GPU.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::{CStr, CString};

use crate::error::RenderError;

/// Added for discrete GPUs; always larger than the image-dimension term
const DISCRETE_BONUS: u32 = 1000;

/// Image dimension is scored in steps of this many texels
const DIMENSION_STEP: u32 = 64;

/// Per queue family: can it draw, can it present to our surface
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub graphics: bool,
    pub present: bool,
}

/// Everything the selector needs to know about one GPU
#[derive(Clone, Debug)]
pub struct DeviceProfile {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub features: vk::PhysicalDeviceFeatures,
    pub queue_families: Vec<QueueFamilySupport>,
    pub extensions: Vec<CString>,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// What a GPU must offer to be considered at all
#[derive(Clone, Debug)]
pub struct DeviceRequirements {
    pub extensions: Vec<CString>,
    pub sampler_anisotropy: bool,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            extensions: vec![ash::extensions::khr::Swapchain::name().to_owned()],
            sampler_anisotropy: true,
        }
    }
}

/// Graphics and presentation family indices; equal on most hardware
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueAssignment {
    pub graphics: u32,
    pub present: u32,
}

impl QueueAssignment {
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first
    pub fn unique_families(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// The chosen GPU
#[derive(Clone, Debug)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queues: QueueAssignment,
    pub score: u32,
}

/// Pick graphics and present families. A family doing both wins outright.
pub fn assign_queues(families: &[QueueFamilySupport]) -> Option<QueueAssignment> {
    if let Some(shared) = families.iter().position(|f| f.graphics && f.present) {
        let index = shared as u32;
        return Some(QueueAssignment {
            graphics: index,
            present: index,
        });
    }

    let graphics = families.iter().position(|f| f.graphics)? as u32;
    let present = families.iter().position(|f| f.present)? as u32;
    Some(QueueAssignment { graphics, present })
}

/// Score a profile, or `None` if it is disqualified
pub fn rate_device(profile: &DeviceProfile, requirements: &DeviceRequirements) -> Option<(u32, QueueAssignment)> {
    let Some(queues) = assign_queues(&profile.queue_families) else {
        log::debug!("GPU '{}' skipped: missing graphics or present queue family", profile.name);
        return None;
    };

    if let Some(missing) = requirements
        .extensions
        .iter()
        .find(|required| !profile.extensions.contains(required))
    {
        log::debug!("GPU '{}' skipped: missing extension {:?}", profile.name, missing);
        return None;
    }

    if profile.surface_formats.is_empty() || profile.present_modes.is_empty() {
        log::debug!(
            "GPU '{}' skipped: inadequate surface support ({} formats, {} present modes)",
            profile.name,
            profile.surface_formats.len(),
            profile.present_modes.len()
        );
        return None;
    }

    if requirements.sampler_anisotropy && profile.features.sampler_anisotropy != vk::TRUE {
        log::debug!("GPU '{}' skipped: sampler anisotropy not supported", profile.name);
        return None;
    }

    let mut score = 0u32;
    if profile.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        score += DISCRETE_BONUS;
    }
    score += dimension_score(profile.max_image_dimension_2d);

    Some((score, queues))
}

/// Proportional to the 2D image limit, capped below the discrete bonus
fn dimension_score(max_image_dimension_2d: u32) -> u32 {
    (max_image_dimension_2d / DIMENSION_STEP).min(DISCRETE_BONUS - 1)
}

/// Keep the highest-scoring qualifying device; ties keep the first one seen
pub fn select_device(profiles: &[DeviceProfile], requirements: &DeviceRequirements) -> Result<DeviceCandidate, RenderError> {
    let mut best: Option<DeviceCandidate> = None;

    for profile in profiles {
        let Some((score, queues)) = rate_device(profile, requirements) else {
            continue;
        };

        log::debug!("GPU '{}' ({:?}) - Score: {}", profile.name, profile.device_type, score);

        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(DeviceCandidate {
                handle: profile.handle,
                name: profile.name.clone(),
                device_type: profile.device_type,
                queues,
                score,
            });
        }
    }

    best.ok_or(RenderError::NoSuitableDevice(profiles.len()))
}

/// Flatten every physical device into a profile against `surface`
pub fn enumerate_profiles(
    instance: &ash::Instance,
    surface_loader: &ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
) -> Result<Vec<DeviceProfile>> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .context("Failed to enumerate physical devices")?;

    log::info!("Found {} GPU(s)", devices.len());

    devices
        .into_iter()
        .map(|device| profile_device(instance, surface_loader, surface, device))
        .collect()
}

fn profile_device(
    instance: &ash::Instance,
    surface_loader: &ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Result<DeviceProfile> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let features = unsafe { instance.get_physical_device_features(device) };
    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let queue_families = families
        .iter()
        .enumerate()
        .map(|(i, family)| {
            // A failed support query counts as "cannot present"
            let present = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, i as u32, surface)
                    .unwrap_or(false)
            };
            QueueFamilySupport {
                graphics: family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                present: family.queue_count > 0 && present,
            }
        })
        .collect();

    let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
        .with_context(|| format!("Failed to query extensions for '{}'", name))?
        .iter()
        .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }.to_owned())
        .collect();

    let surface_formats = unsafe { surface_loader.get_physical_device_surface_formats(device, surface) }
        .unwrap_or_default();
    let present_modes = unsafe { surface_loader.get_physical_device_surface_present_modes(device, surface) }
        .unwrap_or_default();

    Ok(DeviceProfile {
        handle: device,
        name,
        device_type: properties.device_type,
        max_image_dimension_2d: properties.limits.max_image_dimension2_d,
        features,
        queue_families,
        extensions,
        surface_formats,
        present_modes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn profile(raw: u64, name: &str, device_type: vk::PhysicalDeviceType) -> DeviceProfile {
        DeviceProfile {
            handle: vk::PhysicalDevice::from_raw(raw),
            name: name.to_string(),
            device_type,
            max_image_dimension_2d: 8192,
            features: vk::PhysicalDeviceFeatures {
                sampler_anisotropy: vk::TRUE,
                ..Default::default()
            },
            queue_families: vec![QueueFamilySupport {
                graphics: true,
                present: true,
            }],
            extensions: vec![ash::extensions::khr::Swapchain::name().to_owned()],
            surface_formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    #[test]
    fn test_disqualified_device_never_wins_regardless_of_order() {
        let mut no_present = profile(1, "headless", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_present.queue_families = vec![QueueFamilySupport {
            graphics: true,
            present: false,
        }];
        no_present.max_image_dimension_2d = 32768;
        let good = profile(2, "good", vk::PhysicalDeviceType::DISCRETE_GPU);

        let requirements = DeviceRequirements::default();
        let forward = select_device(&[no_present.clone(), good.clone()], &requirements).unwrap();
        let backward = select_device(&[good, no_present], &requirements).unwrap();

        assert_eq!(forward.name, "good");
        assert_eq!(backward.name, "good");
    }

    #[test]
    fn test_discrete_outranks_integrated() {
        let mut integrated = profile(1, "igpu", vk::PhysicalDeviceType::INTEGRATED_GPU);
        integrated.max_image_dimension_2d = 16384;
        let discrete = profile(2, "dgpu", vk::PhysicalDeviceType::DISCRETE_GPU);

        let chosen = select_device(&[integrated, discrete], &DeviceRequirements::default()).unwrap();
        assert_eq!(chosen.name, "dgpu");
        assert_eq!(chosen.score, DISCRETE_BONUS + 8192 / DIMENSION_STEP);
    }

    #[test]
    fn test_huge_image_limit_never_beats_discrete_bonus() {
        let mut integrated = profile(1, "igpu", vk::PhysicalDeviceType::INTEGRATED_GPU);
        integrated.max_image_dimension_2d = u32::MAX;
        let mut discrete = profile(2, "dgpu", vk::PhysicalDeviceType::DISCRETE_GPU);
        discrete.max_image_dimension_2d = 0;

        let chosen = select_device(&[integrated, discrete], &DeviceRequirements::default()).unwrap();
        assert_eq!(chosen.name, "dgpu");
    }

    #[test]
    fn test_larger_image_limit_wins_within_a_class() {
        let small = profile(1, "small", vk::PhysicalDeviceType::INTEGRATED_GPU);
        let mut large = profile(2, "large", vk::PhysicalDeviceType::INTEGRATED_GPU);
        large.max_image_dimension_2d = 16384;

        let chosen = select_device(&[small, large], &DeviceRequirements::default()).unwrap();
        assert_eq!(chosen.name, "large");
    }

    #[test]
    fn test_ties_keep_first_found() {
        let a = profile(1, "first", vk::PhysicalDeviceType::DISCRETE_GPU);
        let b = profile(2, "second", vk::PhysicalDeviceType::DISCRETE_GPU);

        let chosen = select_device(&[a, b], &DeviceRequirements::default()).unwrap();
        assert_eq!(chosen.name, "first");
    }

    #[test]
    fn test_missing_extension_or_surface_support_disqualifies() {
        let mut no_swapchain = profile(1, "a", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_swapchain.extensions.clear();
        let mut no_modes = profile(2, "b", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_modes.present_modes.clear();
        let mut no_formats = profile(3, "c", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_formats.surface_formats.clear();

        let result = select_device(&[no_swapchain, no_modes, no_formats], &DeviceRequirements::default());
        assert!(matches!(result, Err(RenderError::NoSuitableDevice(3))));
    }

    #[test]
    fn test_anisotropy_only_disqualifies_when_required() {
        let mut device = profile(1, "plain", vk::PhysicalDeviceType::INTEGRATED_GPU);
        device.features.sampler_anisotropy = vk::FALSE;

        let strict = DeviceRequirements::default();
        assert!(select_device(&[device.clone()], &strict).is_err());

        let relaxed = DeviceRequirements {
            sampler_anisotropy: false,
            ..Default::default()
        };
        assert!(select_device(&[device], &relaxed).is_ok());
    }

    #[test]
    fn test_empty_device_list_fails() {
        let result = select_device(&[], &DeviceRequirements::default());
        assert!(matches!(result, Err(RenderError::NoSuitableDevice(0))));
    }

    #[test]
    fn test_queue_assignment_prefers_shared_family() {
        let families = [
            QueueFamilySupport { graphics: true, present: false },
            QueueFamilySupport { graphics: false, present: true },
            QueueFamilySupport { graphics: true, present: true },
        ];
        let queues = assign_queues(&families).unwrap();
        assert_eq!(queues, QueueAssignment { graphics: 2, present: 2 });
        assert_eq!(queues.unique_families(), vec![2]);
    }

    #[test]
    fn test_queue_assignment_falls_back_to_split_families() {
        let families = [
            QueueFamilySupport { graphics: true, present: false },
            QueueFamilySupport { graphics: false, present: true },
        ];
        let queues = assign_queues(&families).unwrap();
        assert_eq!(queues, QueueAssignment { graphics: 0, present: 1 });
        assert!(!queues.is_shared());
        assert_eq!(queues.unique_families(), vec![0, 1]);
    }
}
