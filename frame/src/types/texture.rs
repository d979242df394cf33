//! Texture types and descriptors.

use super::Extent2d;
use bitflags::bitflags;

/// Texture format enumeration.
///
/// Only the formats used by render targets in this crate are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum TextureFormat {
    /// 8-bit RGBA channels, unsigned normalized.
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA channels, sRGB.
    Rgba8UnormSrgb,
    /// 8-bit BGRA channels, unsigned normalized.
    Bgra8Unorm,
    /// 8-bit BGRA channels, sRGB.
    Bgra8UnormSrgb,
    /// 16-bit RGBA channels, float.
    Rgba16Float,
    /// 16-bit depth.
    Depth16Unorm,
    /// 24-bit depth with 8-bit stencil.
    Depth24PlusStencil8,
    /// 32-bit depth, float.
    Depth32Float,
}

impl TextureFormat {
    /// Returns true if this is a depth or stencil format.
    pub fn is_depth_stencil(&self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm | Self::Depth24PlusStencil8 | Self::Depth32Float
        )
    }

    /// Returns true if this format has a stencil component.
    pub fn has_stencil(&self) -> bool {
        matches!(self, Self::Depth24PlusStencil8)
    }

    /// Returns the size in bytes per pixel.
    pub fn block_size(&self) -> u32 {
        match self {
            Self::Depth16Unorm => 2,
            Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Depth24PlusStencil8
            | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
        }
    }
}

bitflags! {
    /// Usage flags for textures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// Texture can be copied from.
        const COPY_SRC = 1 << 0;
        /// Texture can be copied to.
        const COPY_DST = 1 << 1;
        /// Texture can be sampled in a shader.
        const TEXTURE_BINDING = 1 << 2;
        /// Texture can be used as a render or depth attachment.
        const RENDER_ATTACHMENT = 1 << 4;
        /// Texture is owned by the presentation engine.
        const PRESENT = 1 << 5;
    }
}

impl Default for TextureUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a 2D texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    /// Debug label for the texture.
    pub label: Option<String>,
    /// Size of the texture.
    pub size: Extent2d,
    /// Texture format.
    pub format: TextureFormat,
    /// Usage flags.
    pub usage: TextureUsage,
}

impl TextureDescriptor {
    /// Create a new 2D texture descriptor.
    pub fn new_2d(size: Extent2d, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            size,
            format,
            usage,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label used in logs, falling back to `"unnamed"`.
    pub fn label_or_default(&self) -> &str {
        self.label.as_deref().unwrap_or("unnamed")
    }
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: Extent2d::default(),
            format: TextureFormat::default(),
            usage: TextureUsage::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::color(TextureFormat::Rgba8Unorm, false)]
    #[case::bgra_srgb(TextureFormat::Bgra8UnormSrgb, false)]
    #[case::depth32(TextureFormat::Depth32Float, true)]
    #[case::depth_stencil(TextureFormat::Depth24PlusStencil8, true)]
    fn test_depth_classification(#[case] format: TextureFormat, #[case] depth: bool) {
        assert_eq!(format.is_depth_stencil(), depth);
    }

    #[test]
    fn test_descriptor_label() {
        let desc = TextureDescriptor::new_2d(
            Extent2d::new(4, 4),
            TextureFormat::Rgba16Float,
            TextureUsage::RENDER_ATTACHMENT,
        );
        assert_eq!(desc.label_or_default(), "unnamed");
        assert_eq!(desc.with_label("hdr").label_or_default(), "hdr");
    }
}
