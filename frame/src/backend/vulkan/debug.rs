//! Validation layer output.
//!
//! Messages are forwarded to `log` under the `redlilium_frame::vulkan`
//! target. The messenger only subscribes to severities the current log
//! filter would print, so a quiet build does not pay for formatting
//! verbose loader chatter.
//!
//! | Vulkan severity | log level |
//! |-----------------|-----------|
//! | ERROR           | error     |
//! | WARNING         | warn      |
//! | INFO            | debug     |
//! | VERBOSE         | trace     |
//!
//! Performance warnings are demoted one step: they are advice, not misuse.

use std::ffi::{CStr, c_char};

use ash::vk;
use log::{Level, LevelFilter};

use crate::error::FrameError;

const LOG_TARGET: &str = "redlilium_frame::vulkan";

/// Create a debug messenger for validation layer output.
pub fn create_debug_messenger(
    debug_utils: &ash::ext::debug_utils::Instance,
) -> Result<vk::DebugUtilsMessengerEXT, FrameError> {
    let severities = subscribed_severities(log::max_level());
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severities)
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(forward_message));

    log::debug!("Subscribing to validation messages {severities:?}");
    unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }.map_err(|e| {
        FrameError::InitializationFailed(format!("Failed to create debug messenger: {e:?}"))
    })
}

fn subscribed_severities(filter: LevelFilter) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    let mut severities = vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
    if filter >= LevelFilter::Warn {
        severities |= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING;
    }
    if filter >= LevelFilter::Debug {
        severities |= vk::DebugUtilsMessageSeverityFlagsEXT::INFO;
    }
    if filter >= LevelFilter::Trace {
        severities |= vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE;
    }
    severities
}

fn message_level(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
) -> Level {
    let level = if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        Level::Debug
    } else {
        Level::Trace
    };
    if kind == vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE {
        match level {
            Level::Error => Level::Warn,
            Level::Warn => Level::Info,
            other => other,
        }
    } else {
        level
    }
}

// SAFETY: `text` is null or a null-terminated string that outlives the call.
unsafe fn lossy(text: *const c_char) -> Option<String> {
    (!text.is_null()).then(|| unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned())
}

unsafe extern "system" fn forward_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let level = message_level(severity, kind);
    if !log::log_enabled!(target: LOG_TARGET, level) {
        return vk::FALSE;
    }

    // SAFETY: the driver passes valid callback data for the duration of the call
    let Some(data) = (unsafe { callback_data.as_ref() }) else {
        log::log!(target: LOG_TARGET, level, "{kind:?} message without callback data");
        return vk::FALSE;
    };
    let id = unsafe { lossy(data.p_message_id_name) };
    let message = unsafe { lossy(data.p_message) }.unwrap_or_default();
    match id {
        Some(id) => log::log!(target: LOG_TARGET, level, "{kind:?} [{id}] {message}"),
        None => log::log!(target: LOG_TARGET, level, "{kind:?} {message}"),
    }

    // Never abort the call that triggered the message.
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_filter_still_subscribes_to_errors() {
        assert_eq!(
            subscribed_severities(LevelFilter::Off),
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        );
        let info = subscribed_severities(LevelFilter::Info);
        assert!(info.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING));
        assert!(!info.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO));
        assert!(subscribed_severities(LevelFilter::Trace).contains(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE));
    }

    #[test]
    fn test_performance_messages_are_demoted() {
        let validation = vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION;
        let performance = vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
        let warning = vk::DebugUtilsMessageSeverityFlagsEXT::WARNING;

        assert_eq!(message_level(warning, validation), Level::Warn);
        assert_eq!(message_level(warning, performance), Level::Info);
        assert_eq!(
            message_level(vk::DebugUtilsMessageSeverityFlagsEXT::INFO, validation),
            Level::Debug
        );
    }
}
