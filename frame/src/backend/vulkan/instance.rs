//! Vulkan instance creation and configuration.

use std::ffi::{CStr, CString};

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::error::FrameError;

use super::debug;

/// Required Vulkan API version.
/// MoltenVK only exposes 1.2; timeline semaphores are core there and dynamic
/// rendering comes from the KHR extension.
#[cfg(target_os = "macos")]
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

#[cfg(not(target_os = "macos"))]
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

/// Validation layer name.
const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance together with its optional debug messenger.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub debug_utils: Option<ash::ext::debug_utils::Instance>,
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

/// Create a Vulkan instance with optional validation layers.
///
/// When `display` is given, the surface extensions it needs are enabled.
pub fn create_instance(
    entry: &ash::Entry,
    application_name: &str,
    validation_enabled: bool,
    display: Option<RawDisplayHandle>,
) -> Result<InstanceBundle, FrameError> {
    let validation_available = validation_enabled && check_validation_layer_support(entry);

    if validation_enabled && !validation_available {
        log::warn!("Validation layers requested but not available");
    }

    let app_name = CString::new(application_name).map_err(|e| {
        FrameError::InvalidParameter(format!("application name contains a null byte: {e}"))
    })?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"RedLilium Frame")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let mut extensions: Vec<*const std::ffi::c_char> = Vec::new();
    if let Some(display) = display {
        let required = ash_window::enumerate_required_extensions(display).map_err(|e| {
            FrameError::InitializationFailed(format!(
                "Failed to query surface extensions: {e:?}"
            ))
        })?;
        extensions.extend_from_slice(required);
    }

    if validation_available {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
    }

    let layer_names: Vec<*const std::ffi::c_char> = if validation_available {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        vec![]
    };

    #[allow(unused_mut)]
    let mut create_flags = vk::InstanceCreateFlags::empty();

    #[cfg(target_os = "macos")]
    {
        create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let create_info = vk::InstanceCreateInfo::default()
        .flags(create_flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        FrameError::InitializationFailed(format!("Failed to create Vulkan instance: {e:?}"))
    })?;

    let (debug_utils, debug_messenger) = if validation_available {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
        match debug::create_debug_messenger(&debug_utils) {
            Ok(messenger) => (Some(debug_utils), Some(messenger)),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        }
    } else {
        (None, None)
    };

    Ok(InstanceBundle {
        instance,
        debug_utils,
        debug_messenger,
    })
}

/// Check if the validation layer is available.
fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let Ok(available_layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };

    available_layers.iter().any(|layer| {
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER_NAME
    })
}
