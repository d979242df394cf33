//! Frame lifecycle facade.
//!
//! [`FrameRenderer`] wires the frame components together so the outer loop
//! only issues two calls per frame:
//!
//! ```text
//! begin_frame ─► acquire surface target ─► offscreen pass opens
//!                                              │
//!                                  scene draws recorded by caller
//!                                              │
//! end_frame   ─► offscreen pass closes ─► post-process chain ─► composite
//!             ─► release to presentable ─► submit + signal ─► present ─► pace
//! ```
//!
//! # Example
//!
//! ```ignore
//! let device = GraphicsDevice::new(DeviceParameters::new())?;
//! let mut renderer = FrameRenderer::new(device, FrameRendererDescriptor::new(1280, 720))?;
//! renderer.chain_mut().add_effect(Box::new(ToneMapEffect::new()), 0)?;
//!
//! loop {
//!     let recorder = renderer.begin_frame()?;
//!     scene.record(recorder)?;
//!     renderer.end_frame()?;
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use crate::commands::{CommandRecorder, CommandSubmissionPipeline};
use crate::device::GraphicsDevice;
use crate::error::FrameError;
use crate::offscreen::{OffscreenDescriptor, OffscreenRenderTarget};
use crate::post::{Compositor, DEFAULT_PING_PONG_COUNT, PostProcessChain};
use crate::slots::ViewHandle;
use crate::surface::{PresentationSurface, SurfaceConfiguration, SurfaceTarget};
use crate::types::{ClearValues, Extent2d};

/// Everything needed to build a [`FrameRenderer`].
#[derive(Debug, Clone)]
pub struct FrameRendererDescriptor {
    /// Presentation surface configuration.
    pub surface: SurfaceConfiguration,
    /// Offscreen scene target.
    pub offscreen: OffscreenDescriptor,
    /// Resize the offscreen target and chain together with the surface.
    pub offscreen_follows_surface: bool,
    /// Number of post-process ping-pong buffers (at least 2).
    pub ping_pong_count: usize,
    /// Frames the GPU may work on while the CPU records the next.
    pub frames_in_flight: usize,
    /// Clear values of the offscreen pass.
    pub clear: ClearValues,
}

impl FrameRendererDescriptor {
    /// Surface and offscreen target of the same size, one frame in flight.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            surface: SurfaceConfiguration::new(width, height),
            offscreen: OffscreenDescriptor::new(width, height),
            offscreen_follows_surface: true,
            ping_pong_count: DEFAULT_PING_PONG_COUNT,
            frames_in_flight: 1,
            clear: ClearValues::default(),
        }
    }

    /// Set the surface configuration.
    pub fn with_surface(mut self, surface: SurfaceConfiguration) -> Self {
        self.surface = surface;
        self
    }

    /// Render the scene at a fixed size independent of the surface.
    pub fn with_offscreen(mut self, offscreen: OffscreenDescriptor) -> Self {
        self.offscreen = offscreen;
        self.offscreen_follows_surface = false;
        self
    }

    /// Set the number of ping-pong buffers.
    pub fn with_ping_pong_count(mut self, count: usize) -> Self {
        self.ping_pong_count = count;
        self
    }

    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the offscreen clear values.
    pub fn with_clear(mut self, clear: ClearValues) -> Self {
        self.clear = clear;
        self
    }
}

/// Owns the frame components and drives one frame at a time.
pub struct FrameRenderer {
    // Dropped first so in-flight work retires before resources go away.
    pipeline: CommandSubmissionPipeline,
    compositor: Compositor,
    chain: PostProcessChain,
    offscreen: OffscreenRenderTarget,
    surface: PresentationSurface,
    device: Arc<GraphicsDevice>,
    clear: ClearValues,
    offscreen_follows_surface: bool,
    target: Option<SurfaceTarget>,
    presentable_output: Option<ViewHandle>,
}

impl FrameRenderer {
    /// Create every frame component. Any failure here is fatal.
    pub fn new(device: Arc<GraphicsDevice>, descriptor: FrameRendererDescriptor) -> Result<Self, FrameError> {
        let surface = PresentationSurface::new(Arc::clone(&device), descriptor.surface.clone())?;
        let offscreen = OffscreenRenderTarget::new(Arc::clone(&device), descriptor.offscreen.clone())?;
        let chain = PostProcessChain::new(
            Arc::clone(&device),
            offscreen.extent(),
            descriptor.offscreen.color_format,
            descriptor.ping_pong_count,
        )?;
        let compositor = Compositor::new(&device, surface.format())?;
        let pipeline = CommandSubmissionPipeline::new(&device, descriptor.frames_in_flight)?;

        log::info!(
            "Frame renderer ready: surface {}, offscreen {}, {} frame(s) in flight",
            surface.extent(),
            offscreen.extent(),
            descriptor.frames_in_flight
        );

        Ok(Self {
            pipeline,
            compositor,
            chain,
            offscreen,
            surface,
            device,
            clear: descriptor.clear,
            offscreen_follows_surface: descriptor.offscreen_follows_surface,
            target: None,
            presentable_output: None,
        })
    }

    /// Start a frame and return the recorder for scene draws.
    ///
    /// The offscreen pass is open when this returns. Returns
    /// [`FrameError::SurfaceOutdated`] without opening a frame when the
    /// surface must be resized first.
    pub fn begin_frame(&mut self) -> Result<&mut CommandRecorder, FrameError> {
        self.pipeline.begin_frame()?;
        if let Err(e) = self.open_frame() {
            self.discard_frame();
            return Err(e);
        }
        self.pipeline.recorder()
    }

    fn open_frame(&mut self) -> Result<(), FrameError> {
        let recorder = self.pipeline.recorder()?;
        self.target = Some(self.surface.acquire_writable_index(recorder)?);
        self.offscreen.begin_pass(recorder, self.clear)
    }

    /// The open frame's recorder.
    pub fn recorder(&mut self) -> Result<&mut CommandRecorder, FrameError> {
        self.pipeline.recorder()
    }

    /// Post-process, composite, submit and present the open frame.
    ///
    /// Returns the fence value signalled for the frame. On error the frame
    /// is dropped: nothing of it reaches the screen, and the next
    /// [`begin_frame`](Self::begin_frame) starts from the state the
    /// resources had before it.
    pub fn end_frame(&mut self) -> Result<u64, FrameError> {
        let Some(target) = self.target.take() else {
            return Err(FrameError::contract(
                "end_frame called without a matching begin_frame",
            ));
        };

        match self.finish_frame(&target) {
            Ok(fence_value) => Ok(fence_value),
            Err(e) => {
                log::warn!("Dropping frame {}: {e}", self.pipeline.frame_count());
                self.discard_frame();
                Err(e)
            }
        }
    }

    fn finish_frame(&mut self, target: &SurfaceTarget) -> Result<u64, FrameError> {
        let recorder = self.pipeline.recorder()?;
        let color = self.offscreen.end_pass(recorder)?;
        let depth = if self.chain.requires_depth() {
            Some(self.offscreen.depth_view_for_effects(recorder)?)
        } else {
            None
        };

        let output = self.chain.apply(recorder, color, depth)?;
        self.compositor.composite(recorder, output, target)?;
        self.surface.release_to_presentable(recorder)?;

        let fence_value = self.pipeline.end_frame(Some(&mut self.surface))?;
        self.presentable_output = Some(output);
        Ok(fence_value)
    }

    // Unwinds whatever part of a frame was set up. Textures touched by
    // commands that never reached the queue go back to their earlier states.
    fn discard_frame(&mut self) {
        self.target = None;
        if let Some(snapshot) = self.pipeline.discard_frame() {
            self.surface.rewind(&snapshot);
            self.offscreen.rewind(&snapshot);
            self.chain.rewind(&snapshot);
        }
        if let Err(e) = self.surface.discard_writable() {
            log::warn!("Failed to give back the surface image of a dropped frame: {e}");
        }
    }

    /// Resize the surface, and the offscreen target and chain if they follow it.
    ///
    /// Waits for all in-flight frames first. Not allowed inside a frame.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), FrameError> {
        if self.target.is_some() || self.pipeline.is_recording() {
            return Err(FrameError::contract("resize called inside a frame"));
        }
        self.pipeline.wait_idle()?;

        self.surface.resize(width, height)?;
        if self.offscreen_follows_surface {
            self.offscreen.resize(width, height)?;
            self.chain.resize(width, height)?;
        }
        self.presentable_output = None;
        Ok(())
    }

    /// Wait for every submitted frame to retire.
    pub fn wait_idle(&mut self) -> Result<(), FrameError> {
        self.pipeline.wait_idle()
    }

    /// The final image composited onto the surface in the last frame.
    pub fn presentable_output_handle(&self) -> Option<ViewHandle> {
        self.presentable_output
    }

    /// Shader-resource view of the offscreen color texture.
    pub fn offscreen_color_handle(&self) -> ViewHandle {
        self.offscreen.color_handle()
    }

    /// Shader-resource view of the offscreen depth texture.
    pub fn offscreen_depth_handle(&self) -> ViewHandle {
        self.offscreen.depth_handle()
    }

    /// Size the scene is rendered at.
    pub fn offscreen_extent(&self) -> Extent2d {
        self.offscreen.extent()
    }

    /// The device service.
    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.device
    }

    /// The presentation surface.
    pub fn surface(&self) -> &PresentationSurface {
        &self.surface
    }

    /// The offscreen scene target.
    pub fn offscreen(&self) -> &OffscreenRenderTarget {
        &self.offscreen
    }

    /// The post-process chain.
    pub fn chain(&self) -> &PostProcessChain {
        &self.chain
    }

    /// The post-process chain, for registering and toggling effects.
    pub fn chain_mut(&mut self) -> &mut PostProcessChain {
        &mut self.chain
    }

    /// The submission pipeline.
    pub fn pipeline(&self) -> &CommandSubmissionPipeline {
        &self.pipeline
    }

    /// Number of frames submitted.
    pub fn frame_count(&self) -> u64 {
        self.pipeline.frame_count()
    }
}

impl fmt::Debug for FrameRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRenderer")
            .field("pipeline", &self.pipeline)
            .field("surface", &self.surface)
            .field("offscreen", &self.offscreen)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BackendType, DeviceParameters};
    use crate::post::ToneMapEffect;
    use crate::resource::ResourceState;

    fn create_renderer(descriptor: FrameRendererDescriptor) -> FrameRenderer {
        let device =
            GraphicsDevice::new(DeviceParameters::new().with_backend(BackendType::Dummy)).unwrap();
        FrameRenderer::new(device, descriptor).unwrap()
    }

    #[test]
    fn test_frame_without_effects_composites_offscreen_color() {
        let mut renderer = create_renderer(FrameRendererDescriptor::new(64, 64));
        renderer.begin_frame().unwrap();
        let fence = renderer.end_frame().unwrap();

        assert_eq!(fence, 1);
        assert_eq!(
            renderer.presentable_output_handle(),
            Some(renderer.offscreen_color_handle())
        );
        assert_eq!(renderer.offscreen().color_state(), ResourceState::ShaderRead);
        assert_eq!(renderer.surface().last_presented(), Some(0));
    }

    #[test]
    fn test_effect_output_is_presentable() {
        let mut renderer = create_renderer(FrameRendererDescriptor::new(32, 32));
        renderer
            .chain_mut()
            .add_effect(Box::new(ToneMapEffect::new()), 0)
            .unwrap();

        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
        assert_eq!(
            renderer.presentable_output_handle(),
            renderer.chain().buffer_view(0)
        );
    }

    #[test]
    fn test_end_frame_twice_is_contract_violation() {
        let mut renderer = create_renderer(FrameRendererDescriptor::new(16, 16));
        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
        assert!(matches!(
            renderer.end_frame(),
            Err(FrameError::ContractViolation(_))
        ));
        assert_eq!(renderer.frame_count(), 1);
    }

    #[test]
    fn test_resize_inside_frame_rejected() {
        let mut renderer = create_renderer(FrameRendererDescriptor::new(16, 16));
        renderer.begin_frame().unwrap();
        assert!(renderer.resize(32, 32).is_err());
        renderer.end_frame().unwrap();

        renderer.resize(32, 24).unwrap();
        assert_eq!(renderer.offscreen_extent(), Extent2d::new(32, 24));
        assert_eq!(renderer.chain().extent(), Extent2d::new(32, 24));
        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
    }

    #[test]
    fn test_fixed_offscreen_survives_resize() {
        let mut renderer = create_renderer(
            FrameRendererDescriptor::new(16, 16).with_offscreen(OffscreenDescriptor::new(8, 8)),
        );
        renderer.resize(64, 64).unwrap();
        assert_eq!(renderer.surface().extent(), Extent2d::new(64, 64));
        assert_eq!(renderer.offscreen_extent(), Extent2d::new(8, 8));
    }
}
