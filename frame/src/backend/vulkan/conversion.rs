//! Type conversions between frame types and Vulkan types.

use ash::vk;

use crate::error::FrameError;
use crate::surface::PresentMode;
use crate::types::{TextureFormat, TextureUsage};

/// Convert TextureFormat to Vulkan format.
pub fn convert_texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Depth16Unorm => vk::Format::D16_UNORM,
        TextureFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
    }
}

/// Image aspect covered by views and barriers of `format`.
pub fn aspect_mask(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth_stencil() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Convert TextureUsage flags to Vulkan image usage flags.
///
/// The format decides whether RENDER_ATTACHMENT maps to a color or a
/// depth-stencil attachment.
pub fn convert_texture_usage(usage: TextureUsage, format: TextureFormat) -> vk::ImageUsageFlags {
    let mut result = vk::ImageUsageFlags::empty();

    if usage.contains(TextureUsage::COPY_SRC) {
        result |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        result |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::TEXTURE_BINDING) {
        result |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.is_depth_stencil() {
            result |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            result |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
    }

    result
}

/// Convert PresentMode to Vulkan present mode.
pub fn convert_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

/// Map a Vulkan result code to a frame error.
///
/// Device loss, memory exhaustion and surface loss keep their own variants;
/// everything else is reported as an internal error with `context`.
pub fn map_vk_error(context: &str, result: vk::Result) -> FrameError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => FrameError::DeviceLost,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            FrameError::OutOfMemory
        }
        vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
            FrameError::SurfaceOutdated
        }
        other => FrameError::Internal(format!("{context}: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TextureFormat::Bgra8Unorm, vk::ImageAspectFlags::COLOR)]
    #[case(TextureFormat::Depth32Float, vk::ImageAspectFlags::DEPTH)]
    #[case(
        TextureFormat::Depth24PlusStencil8,
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    )]
    fn test_aspect_mask(#[case] format: TextureFormat, #[case] expected: vk::ImageAspectFlags) {
        assert_eq!(aspect_mask(format), expected);
    }

    #[test]
    fn test_render_attachment_usage_follows_format() {
        let color = convert_texture_usage(TextureUsage::RENDER_ATTACHMENT, TextureFormat::Rgba16Float);
        assert_eq!(color, vk::ImageUsageFlags::COLOR_ATTACHMENT);

        let depth = convert_texture_usage(
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
            TextureFormat::Depth32Float,
        );
        assert_eq!(
            depth,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        );
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            map_vk_error("submit", vk::Result::ERROR_DEVICE_LOST),
            FrameError::DeviceLost
        );
        assert_eq!(
            map_vk_error("acquire", vk::Result::ERROR_OUT_OF_DATE_KHR),
            FrameError::SurfaceOutdated
        );
        assert!(matches!(
            map_vk_error("submit", vk::Result::ERROR_UNKNOWN),
            FrameError::Internal(_)
        ));
    }
}
