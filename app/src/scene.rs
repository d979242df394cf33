//! The demo scene: one fullscreen draw into the offscreen target.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use redlilium_frame::backend::GpuPipeline;
use redlilium_frame::{
    CommandRecorder, Extent2d, FrameError, FullscreenPipelineDescriptor, GraphicsDevice,
    OffscreenDescriptor, ShaderSource,
};

const SCENE_WGSL: &str = include_str!("../shaders/scene.wgsl");

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SceneParams {
    time: f32,
    aspect: f32,
    _pad: [f32; 2],
}

/// Animated gradient writing both color and depth.
pub struct GradientScene {
    pipeline: Arc<GpuPipeline>,
}

impl GradientScene {
    pub fn new(device: &GraphicsDevice, offscreen: &OffscreenDescriptor) -> Result<Self, FrameError> {
        let descriptor = FullscreenPipelineDescriptor::new(
            "scene_gradient",
            ShaderSource::wgsl("scene.wgsl", SCENE_WGSL),
            offscreen.color_format,
        )
        .with_depth(offscreen.depth_format)
        .with_push_constants(std::mem::size_of::<SceneParams>() as u32);

        Ok(Self {
            pipeline: device.create_fullscreen_pipeline(&descriptor)?,
        })
    }

    /// Record the scene into the open offscreen pass. Viewport and scissor
    /// are already set to the offscreen extent.
    pub fn record(
        &self,
        recorder: &mut CommandRecorder,
        extent: Extent2d,
        time: f32,
    ) -> Result<(), FrameError> {
        let params = SceneParams {
            time,
            aspect: extent.width as f32 / extent.height.max(1) as f32,
            _pad: [0.0; 2],
        };

        recorder.bind_pipeline(&self.pipeline);
        recorder.push_constants(bytemuck::bytes_of(&params));
        recorder.draw(3, 1)
    }
}
