//! Barrier batching for recorded transitions.
//!
//! Consecutive transition commands are collected into one batch and
//! submitted as a single `vkCmdPipelineBarrier` call.

use ash::vk;

use super::conversion::aspect_mask;
use super::layout::TextureLayout;
use crate::error::FrameError;
use crate::resource::TransitionRecord;

/// A batch of image memory barriers to submit together.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    image_barriers: Vec<ImageBarrierInfo>,
    src_stage_mask: vk::PipelineStageFlags,
    dst_stage_mask: vk::PipelineStageFlags,
}

#[derive(Debug, Clone, Copy)]
struct ImageBarrierInfo {
    image: vk::Image,
    old_layout: TextureLayout,
    new_layout: TextureLayout,
    aspect_mask: vk::ImageAspectFlags,
}

impl BarrierBatch {
    /// Create a new empty barrier batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the barrier for one recorded transition.
    ///
    /// Transitions whose layouts coincide are skipped.
    pub fn add_transition(&mut self, record: &TransitionRecord) -> Result<(), FrameError> {
        let old_layout = TextureLayout::from(record.before);
        let new_layout = TextureLayout::from(record.after);
        if old_layout == new_layout {
            return Ok(());
        }

        let image = record.texture.vk_image().ok_or_else(|| {
            FrameError::InvalidParameter(format!(
                "texture '{}' was not created by the Vulkan backend",
                record.texture.label()
            ))
        })?;

        self.image_barriers.push(ImageBarrierInfo {
            image,
            old_layout,
            new_layout,
            aspect_mask: aspect_mask(record.texture.format()),
        });
        self.src_stage_mask |= old_layout.src_stage();
        self.dst_stage_mask |= new_layout.dst_stage();
        Ok(())
    }

    /// Check if the batch has any barriers.
    pub fn is_empty(&self) -> bool {
        self.image_barriers.is_empty()
    }

    /// Record all barriers and clear the batch.
    ///
    /// Does nothing if the batch is empty.
    pub fn flush(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }

        let barriers: Vec<vk::ImageMemoryBarrier> = self
            .image_barriers
            .iter()
            .map(|info| {
                vk::ImageMemoryBarrier::default()
                    .old_layout(info.old_layout.to_vk())
                    .new_layout(info.new_layout.to_vk())
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(info.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: info.aspect_mask,
                        base_mip_level: 0,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        base_array_layer: 0,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                    })
                    .src_access_mask(info.old_layout.src_access_mask())
                    .dst_access_mask(info.new_layout.dst_access_mask())
            })
            .collect();

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                self.src_stage_mask,
                self.dst_stage_mask,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        }

        self.clear();
    }

    /// Clear all barriers from the batch.
    pub fn clear(&mut self) {
        self.image_barriers.clear();
        self.src_stage_mask = vk::PipelineStageFlags::empty();
        self.dst_stage_mask = vk::PipelineStageFlags::empty();
    }
}
