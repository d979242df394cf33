//! Image layouts backing each tracked resource state.
//!
//! The frame components track [`ResourceState`]s; the Vulkan backend turns
//! each state into an image layout plus the access mask and pipeline stage
//! that a barrier into or out of that layout must cover.

use ash::vk;

use crate::resource::ResourceState;

/// Vulkan image layout states that frame textures can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureLayout {
    /// Contents undefined.
    #[default]
    Undefined,
    /// Optimal for color attachment writes.
    ColorAttachment,
    /// Optimal for depth attachment writes.
    DepthStencilAttachment,
    /// Optimal for depth sampling.
    DepthStencilReadOnly,
    /// Optimal for shader sampling.
    ShaderReadOnly,
    /// Optimal for presentation.
    PresentSrc,
}

impl From<ResourceState> for TextureLayout {
    fn from(state: ResourceState) -> Self {
        match state {
            ResourceState::Undefined => Self::Undefined,
            ResourceState::RenderTarget => Self::ColorAttachment,
            ResourceState::DepthWrite => Self::DepthStencilAttachment,
            ResourceState::ShaderRead => Self::ShaderReadOnly,
            ResourceState::DepthRead => Self::DepthStencilReadOnly,
            ResourceState::Present => Self::PresentSrc,
        }
    }
}

impl TextureLayout {
    /// Convert to Vulkan image layout.
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            Self::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Accesses that must be made available when leaving this layout.
    pub fn src_access_mask(self) -> vk::AccessFlags {
        match self {
            Self::Undefined | Self::PresentSrc => vk::AccessFlags::empty(),
            Self::ColorAttachment => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            Self::DepthStencilAttachment => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            Self::DepthStencilReadOnly | Self::ShaderReadOnly => vk::AccessFlags::SHADER_READ,
        }
    }

    /// Accesses that must see the data when entering this layout.
    pub fn dst_access_mask(self) -> vk::AccessFlags {
        match self {
            Self::Undefined | Self::PresentSrc => vk::AccessFlags::empty(),
            Self::ColorAttachment => {
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            Self::DepthStencilAttachment => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            Self::DepthStencilReadOnly | Self::ShaderReadOnly => vk::AccessFlags::SHADER_READ,
        }
    }

    /// Stage that last touches an image in this layout.
    pub fn src_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            // The acquire semaphore waits at color output, so leaving the
            // present layout has to chain to that stage.
            Self::PresentSrc => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthStencilAttachment => vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            Self::DepthStencilReadOnly | Self::ShaderReadOnly => {
                vk::PipelineStageFlags::FRAGMENT_SHADER
            }
        }
    }

    /// Stage that first touches an image in this layout.
    pub fn dst_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            Self::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthStencilAttachment => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            }
            Self::DepthStencilReadOnly | Self::ShaderReadOnly => {
                vk::PipelineStageFlags::FRAGMENT_SHADER
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_to_layout() {
        let cases = [
            (ResourceState::Undefined, vk::ImageLayout::UNDEFINED),
            (ResourceState::RenderTarget, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            (
                ResourceState::DepthWrite,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
            (ResourceState::ShaderRead, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            (
                ResourceState::DepthRead,
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            ),
            (ResourceState::Present, vk::ImageLayout::PRESENT_SRC_KHR),
        ];
        for (state, layout) in cases {
            assert_eq!(TextureLayout::from(state).to_vk(), layout, "{state}");
        }
    }

    #[test]
    fn test_leaving_present_chains_to_color_output() {
        assert_eq!(
            TextureLayout::PresentSrc.src_stage(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
    }
}
