//! Translation of recorded commands into a Vulkan command buffer.

use ash::vk;

use super::barriers::BarrierBatch;
use super::conversion::map_vk_error;
use super::pipeline::{COLOR_BINDING, DEPTH_BINDING, FullscreenLayout};
use super::{VulkanView, ViewTables};
use crate::backend::RawPipeline;
use crate::commands::RecordedCommand;
use crate::error::FrameError;
use crate::slots::{SlotCategory, ViewHandle};

/// Encodes one frame's commands into `cmd`.
///
/// Transitions accumulate in a barrier batch that is flushed before the
/// first non-transition command that follows them.
pub(super) struct CommandEncoder<'a> {
    pub device: &'a ash::Device,
    pub dynamic_rendering: &'a ash::khr::dynamic_rendering::Device,
    pub layout: &'a FullscreenLayout,
    pub views: &'a ViewTables,
    pub descriptor_pool: vk::DescriptorPool,
    pub cmd: vk::CommandBuffer,
    pub barriers: BarrierBatch,
}

impl CommandEncoder<'_> {
    pub fn encode(&mut self, command: &RecordedCommand) -> Result<(), FrameError> {
        if let RecordedCommand::Transition(record) = command {
            return self.barriers.add_transition(record);
        }
        self.barriers.flush(self.device, self.cmd);

        match command {
            RecordedCommand::Transition(_) => {}
            RecordedCommand::BeginRendering {
                label,
                color,
                depth,
                extent,
            } => {
                log::trace!("Vulkan: begin rendering '{label}' ({extent})");

                let color_attachments: Vec<vk::RenderingAttachmentInfo> = color
                    .iter()
                    .map(|attachment| {
                        let view = lookup(self.views, attachment.view)?;
                        let (load_op, clear_value) = match attachment.clear {
                            Some(color) => (
                                vk::AttachmentLoadOp::CLEAR,
                                vk::ClearValue {
                                    color: vk::ClearColorValue { float32: color },
                                },
                            ),
                            None => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
                        };
                        Ok(vk::RenderingAttachmentInfo::default()
                            .image_view(view.view)
                            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                            .load_op(load_op)
                            .store_op(vk::AttachmentStoreOp::STORE)
                            .clear_value(clear_value))
                    })
                    .collect::<Result<_, FrameError>>()?;

                let depth_attachment = depth
                    .as_ref()
                    .map(|attachment| {
                        let view = lookup(self.views, attachment.view)?;
                        let (load_op, clear_value) = match attachment.clear {
                            Some(depth) => (
                                vk::AttachmentLoadOp::CLEAR,
                                vk::ClearValue {
                                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
                                },
                            ),
                            None => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
                        };
                        Ok::<_, FrameError>(
                            vk::RenderingAttachmentInfo::default()
                                .image_view(view.view)
                                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                                .load_op(load_op)
                                .store_op(vk::AttachmentStoreOp::STORE)
                                .clear_value(clear_value),
                        )
                    })
                    .transpose()?;

                let mut rendering_info = vk::RenderingInfo::default()
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: vk::Extent2D {
                            width: extent.width,
                            height: extent.height,
                        },
                    })
                    .layer_count(1)
                    .color_attachments(&color_attachments);
                if let Some(depth_attachment) = depth_attachment.as_ref() {
                    rendering_info = rendering_info.depth_attachment(depth_attachment);
                }

                unsafe {
                    self.dynamic_rendering
                        .cmd_begin_rendering(self.cmd, &rendering_info);
                }
            }
            RecordedCommand::SetViewport(viewport) => {
                let viewports = [vk::Viewport {
                    x: viewport.x,
                    y: viewport.y,
                    width: viewport.width,
                    height: viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                }];
                unsafe { self.device.cmd_set_viewport(self.cmd, 0, &viewports) };
            }
            RecordedCommand::SetScissor(scissor) => {
                let scissors = [vk::Rect2D {
                    offset: vk::Offset2D {
                        x: scissor.x,
                        y: scissor.y,
                    },
                    extent: vk::Extent2D {
                        width: scissor.width,
                        height: scissor.height,
                    },
                }];
                unsafe { self.device.cmd_set_scissor(self.cmd, 0, &scissors) };
            }
            RecordedCommand::BindPipeline(pipeline) => {
                let RawPipeline::Vulkan {
                    pipeline: raw_pipeline,
                    ..
                } = &pipeline.raw
                else {
                    return Err(FrameError::InvalidParameter(format!(
                        "pipeline '{}' was not created by the Vulkan backend",
                        pipeline.label()
                    )));
                };
                unsafe {
                    self.device.cmd_bind_pipeline(
                        self.cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        *raw_pipeline,
                    );
                }
            }
            RecordedCommand::BindInputs { color, depth } => {
                self.bind_inputs(*color, *depth)?;
            }
            RecordedCommand::PushConstants(data) => unsafe {
                self.device.cmd_push_constants(
                    self.cmd,
                    self.layout.pipeline_layout(),
                    self.layout.push_constant_stages(),
                    0,
                    data,
                );
            },
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
            } => unsafe {
                self.device
                    .cmd_draw(self.cmd, *vertex_count, *instance_count, 0, 0);
            },
            RecordedCommand::EndRendering => unsafe {
                self.dynamic_rendering.cmd_end_rendering(self.cmd);
            },
        }
        Ok(())
    }

    /// Flush transitions recorded after the last other command.
    pub fn finish(&mut self) {
        self.barriers.flush(self.device, self.cmd);
    }

    fn bind_inputs(&mut self, color: ViewHandle, depth: Option<ViewHandle>) -> Result<(), FrameError> {
        let set_layouts = [self.layout.set_layout()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| map_vk_error("Failed to allocate descriptor set", e))?
            .into_iter()
            .next()
            .ok_or_else(|| FrameError::Internal("descriptor set allocation returned nothing".into()))?;

        let color_info = [vk::DescriptorImageInfo::default()
            .image_view(lookup_input(self.views, color)?.view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let depth_info = depth
            .map(|depth| {
                lookup_input(self.views, depth).map(|view| {
                    [vk::DescriptorImageInfo::default()
                        .image_view(view.view)
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)]
                })
            })
            .transpose()?;

        let mut writes = vec![
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(COLOR_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&color_info),
        ];
        if let Some(depth_info) = depth_info.as_ref() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(DEPTH_BINDING)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(depth_info),
            );
        }

        unsafe {
            self.device.update_descriptor_sets(&writes, &[]);
            self.device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout.pipeline_layout(),
                0,
                &[set],
                &[],
            );
        }
        Ok(())
    }
}

fn lookup(views: &ViewTables, handle: ViewHandle) -> Result<&VulkanView, FrameError> {
    views
        .get(&handle.category())
        .and_then(|table| table.get(handle.index() as usize))
        .and_then(Option::as_ref)
        .ok_or_else(|| {
            FrameError::InvalidParameter(format!(
                "{} slot {} is empty",
                handle.category(),
                handle.index()
            ))
        })
}

fn lookup_input(views: &ViewTables, handle: ViewHandle) -> Result<&VulkanView, FrameError> {
    if handle.category() != SlotCategory::ShaderResource {
        return Err(FrameError::InvalidParameter(format!(
            "expected a shader-resource view, got a {} view",
            handle.category()
        )));
    }
    lookup(views, handle)
}

