//! Fullscreen-triangle pipeline shared by effects and the compositor.

use std::sync::Arc;

use crate::backend::GpuPipeline;
use crate::commands::CommandRecorder;
use crate::device::{FullscreenPipelineDescriptor, GraphicsDevice};
use crate::error::FrameError;
use crate::shader::ShaderSource;
use crate::types::TextureFormat;

use super::EffectInput;

const FULLSCREEN_WGSL: &str = include_str!("../../shaders/fullscreen.wgsl");

/// Prepend the shared vertex stage to a fragment shader.
pub(crate) fn fullscreen_source(label: &'static str, fragment: &str) -> ShaderSource {
    ShaderSource::wgsl(label, format!("{FULLSCREEN_WGSL}\n{fragment}"))
}

/// A lazily created fullscreen pipeline.
#[derive(Debug)]
pub(crate) struct FullscreenPass {
    label: &'static str,
    fragment: &'static str,
    push_constant_size: u32,
    pipeline: Option<Arc<GpuPipeline>>,
}

impl FullscreenPass {
    pub(crate) fn new(label: &'static str, fragment: &'static str, push_constant_size: u32) -> Self {
        Self {
            label,
            fragment,
            push_constant_size,
            pipeline: None,
        }
    }

    pub(crate) fn prepare(
        &mut self,
        device: &GraphicsDevice,
        format: TextureFormat,
    ) -> Result<(), FrameError> {
        let descriptor = FullscreenPipelineDescriptor::new(
            self.label,
            fullscreen_source(self.label, self.fragment),
            format,
        )
        .with_push_constants(self.push_constant_size);
        self.pipeline = Some(device.create_fullscreen_pipeline(&descriptor)?);
        Ok(())
    }

    /// Bind the pipeline and inputs, upload `constants` and draw the triangle.
    pub(crate) fn draw(
        &self,
        recorder: &mut CommandRecorder,
        input: &EffectInput,
        constants: &[u8],
    ) -> Result<(), FrameError> {
        let Some(pipeline) = &self.pipeline else {
            return Err(FrameError::contract(format!(
                "'{}' recorded before its pipeline was created",
                self.label
            )));
        };
        recorder.bind_pipeline(pipeline);
        recorder.bind_inputs(input.color, input.depth);
        if !constants.is_empty() {
            recorder.push_constants(constants);
        }
        recorder.draw(3, 1)
    }
}
