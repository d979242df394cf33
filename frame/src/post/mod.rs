//! Post-processing.
//!
//! The scene rendered into the offscreen target passes through a
//! [`PostProcessChain`] of image-space effects before the [`Compositor`]
//! blits the result onto the presentation surface.
//!
//! Effects implement [`PostEffect`]. An effect that samples scene depth says
//! so through [`PostEffect::requires_depth`]; the chain never inspects the
//! concrete effect type.

mod chain;
mod compositor;
mod effects;
mod fullscreen;

pub use chain::{ChainDiagnostic, EffectHandle, PostProcessChain, DEFAULT_PING_PONG_COUNT};
pub use compositor::Compositor;
pub use effects::{DepthFogEffect, FogParams, ToneMapEffect, ToneMapParams, VignetteEffect, VignetteParams};

use crate::commands::CommandRecorder;
use crate::device::GraphicsDevice;
use crate::error::FrameError;
use crate::slots::ViewHandle;
use crate::types::{Extent2d, TextureFormat};

/// Inputs handed to an effect for one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectInput {
    /// Shader-resource view of the previous result.
    pub color: ViewHandle,
    /// Shader-resource view of scene depth, only for depth-aware effects.
    pub depth: Option<ViewHandle>,
    /// Size of the output target.
    pub extent: Extent2d,
}

/// An image-space effect: one shader-resource input, one render-target output.
pub trait PostEffect: Send {
    /// Name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Whether the effect samples scene depth.
    ///
    /// Such an effect is skipped when the chain is applied without a depth view.
    fn requires_depth(&self) -> bool {
        false
    }

    /// Create GPU state. Called once when the effect is registered.
    fn prepare(&mut self, device: &GraphicsDevice, output_format: TextureFormat) -> Result<(), FrameError>;

    /// Record the effect's draws. The output target is already bound.
    fn record(&self, recorder: &mut CommandRecorder, input: &EffectInput) -> Result<(), FrameError>;
}
