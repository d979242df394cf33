//! Vulkan physical and logical device selection.

use std::ffi::CStr;

use ash::vk;

use crate::error::FrameError;

/// Selected adapter together with the queue family frames are submitted on.
#[derive(Debug, Clone, Copy)]
pub struct AdapterSelection {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
}

/// Pick the best physical device that has a graphics queue able to present
/// to `surface` (when one is given).
///
/// Prefers discrete GPUs over integrated ones.
pub fn select_adapter(
    instance: &ash::Instance,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> Result<AdapterSelection, FrameError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        FrameError::InitializationFailed(format!("Failed to enumerate physical devices: {e:?}"))
    })?;

    if devices.is_empty() {
        return Err(FrameError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, AdapterSelection)> = None;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };

        let Some(queue_family) = find_queue_family(instance, device, surface) else {
            log::debug!("Skipping GPU {name:?}: no graphics queue that can present");
            continue;
        };

        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 0,
        };
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            name,
            properties.device_type,
            score
        );

        if best.is_none_or(|(best_score, _)| score > best_score) {
            best = Some((
                score,
                AdapterSelection {
                    physical_device: device,
                    queue_family,
                },
            ));
        }
    }

    best.map(|(_, selection)| selection)
        .ok_or_else(|| FrameError::InitializationFailed("No suitable GPU found".to_string()))
}

fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> Option<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            return None;
        }
        let presents = match surface {
            Some((loader, surface)) => unsafe {
                loader
                    .get_physical_device_surface_support(physical_device, index, surface)
                    .unwrap_or(false)
            },
            None => true,
        };
        presents.then_some(index)
    })
}

/// Create a logical device with timeline semaphores and dynamic rendering.
pub fn create_logical_device(
    instance: &ash::Instance,
    selection: AdapterSelection,
    presents: bool,
) -> Result<ash::Device, FrameError> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selection.queue_family)
        .queue_priorities(&queue_priorities)];

    let mut device_extensions = vec![ash::khr::dynamic_rendering::NAME.as_ptr()];
    if presents {
        device_extensions.push(ash::khr::swapchain::NAME.as_ptr());
    }

    let mut timeline_features =
        vk::PhysicalDeviceTimelineSemaphoreFeatures::default().timeline_semaphore(true);
    let mut dynamic_rendering_features =
        vk::PhysicalDeviceDynamicRenderingFeatures::default().dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .push_next(&mut timeline_features)
        .push_next(&mut dynamic_rendering_features);

    unsafe { instance.create_device(selection.physical_device, &create_info, None) }.map_err(|e| {
        FrameError::InitializationFailed(format!("Failed to create logical device: {e:?}"))
    })
}
