//! # RedLilium Frame
//!
//! GPU frame orchestration for the RedLilium renderer: view-slot pools,
//! fence-based frame pacing, a double-buffered presentation surface, an
//! offscreen scene target and a post-process effect chain.
//!
//! ## Overview
//!
//! - [`GraphicsDevice`] - Device service: backend, view-slot pools, shader compiler
//! - [`ViewSlotAllocator`] - Fixed-capacity render-target/depth-stencil/shader-resource pools
//! - [`FrameSynchronizer`] - Timeline fence with "wait until retired" semantics
//! - [`CommandSubmissionPipeline`] - Per-frame recording and submission
//! - [`PresentationSurface`] - Two alternating swapchain targets
//! - [`OffscreenRenderTarget`] - Color + depth scene target
//! - [`PostProcessChain`] - Ordered effects over ping-pong buffers
//! - [`FrameRenderer`] - All of the above behind `begin_frame`/`end_frame`
//!
//! Backends: the always-available [`DummyBackend`] simulation and, with the
//! `vulkan-backend` feature, a native Vulkan backend.
//!
//! ## Example
//!
//! ```ignore
//! use redlilium_frame::{DeviceParameters, FrameRenderer, FrameRendererDescriptor, GraphicsDevice};
//!
//! let device = GraphicsDevice::new(DeviceParameters::new())?;
//! let mut renderer = FrameRenderer::new(device, FrameRendererDescriptor::new(1280, 720))?;
//! loop {
//!     let recorder = renderer.begin_frame()?;
//!     // record scene draws...
//!     renderer.end_frame()?;
//! }
//! ```

pub mod backend;
pub mod commands;
pub mod device;
pub mod error;
pub mod offscreen;
pub mod post;
pub mod renderer;
pub mod resize;
pub mod resource;
pub mod shader;
pub mod slots;
pub mod surface;
pub mod sync;
pub mod types;

// Re-export main types for convenience
pub use backend::{DummyBackend, DummyCounters, GpuBackend, GpuTexture, has_gpu_backend};
pub use commands::{
    ColorAttachment, CommandRecorder, CommandSubmissionPipeline, DepthAttachment,
    MAX_FRAMES_IN_FLIGHT, RecordedCommand, RecorderState,
};
pub use device::{
    BackendType, DeviceParameters, FullscreenPipelineDescriptor, GraphicsDevice, OwnedView,
};
pub use error::FrameError;
pub use offscreen::{OffscreenDescriptor, OffscreenRenderTarget};
pub use post::{
    ChainDiagnostic, Compositor, DepthFogEffect, EffectHandle, EffectInput, PostEffect,
    PostProcessChain, ToneMapEffect, VignetteEffect,
};
pub use renderer::{FrameRenderer, FrameRendererDescriptor};
pub use resize::{ResizeEvent, ResizeManager};
pub use resource::{GpuResource, ResourceState, TransitionRecord};
pub use shader::{ShaderBinary, ShaderCompiler, ShaderSource, ShaderStage, WgslCompiler};
pub use slots::{
    SlotCapacities, SlotCategory, SlotHandle, SlotPoolStats, ViewHandle, ViewSlotAllocator,
    ViewSlotPool,
};
pub use surface::{PresentMode, PresentationSurface, SurfaceConfiguration, SurfaceTarget};
pub use sync::{FrameSynchronizer, SyncState};
pub use types::{
    ClearValues, Extent2d, ScissorRect, TextureDescriptor, TextureFormat, TextureUsage, Viewport,
};

/// Frame library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the frame subsystem.
///
/// Only logs the version; every component is created explicitly.
pub fn init() {
    log::info!("RedLilium Frame v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_backend() {
        let backend = DummyBackend::new();
        assert!(backend.name() == "Dummy");
    }
}
