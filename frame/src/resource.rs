//! Resource-state tracking for GPU textures.
//!
//! Every texture owned by a frame component is wrapped in a [`GpuResource`],
//! which remembers the state the texture will be in once the commands
//! recorded so far have executed. Moving to a new state goes through
//! [`GpuResource::transition`], the only place a [`TransitionRecord`] is
//! produced:
//!
//! ```text
//!             ┌──────────────┐  begin pass  ┌──────────────┐
//!  Undefined ─┤ RenderTarget ├─────────────►│  ShaderRead  │
//!             └──────┬───────┘◄─────────────┴──────────────┘
//!                    │ release                 next write
//!                    ▼
//!              ┌──────────┐
//!              │ Present  │── acquire ──► RenderTarget
//!              └──────────┘
//! ```
//!
//! A transition to the state the resource is already in is a no-op and
//! records nothing. Whether a state is reachable at all depends on the
//! texture's usage flags and format.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::backend::{GpuTexture, TextureId};
use crate::commands::CommandRecorder;
use crate::error::FrameError;
use crate::types::TextureUsage;

/// GPU usage mode of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    /// Contents undefined (freshly created).
    #[default]
    Undefined,
    /// Writable color attachment.
    RenderTarget,
    /// Writable depth attachment.
    DepthWrite,
    /// Sampled color texture.
    ShaderRead,
    /// Sampled depth texture.
    DepthRead,
    /// Owned by the presentation engine.
    Present,
}

impl ResourceState {
    /// Whether the state allows the texture to be rendered into.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::RenderTarget | Self::DepthWrite)
    }

    /// Whether the state allows the texture to be sampled.
    pub fn is_shader_readable(self) -> bool {
        matches!(self, Self::ShaderRead | Self::DepthRead)
    }

    fn required_usage(self) -> TextureUsage {
        match self {
            Self::Undefined => TextureUsage::empty(),
            Self::RenderTarget | Self::DepthWrite => TextureUsage::RENDER_ATTACHMENT,
            Self::ShaderRead | Self::DepthRead => TextureUsage::TEXTURE_BINDING,
            Self::Present => TextureUsage::PRESENT,
        }
    }

    fn accepts_depth_format(self, is_depth: bool) -> bool {
        match self {
            Self::Undefined => true,
            Self::DepthWrite | Self::DepthRead => is_depth,
            Self::RenderTarget | Self::ShaderRead | Self::Present => !is_depth,
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::RenderTarget => "render-target",
            Self::DepthWrite => "depth-write",
            Self::ShaderRead => "shader-read",
            Self::DepthRead => "depth-read",
            Self::Present => "present",
        };
        f.write_str(name)
    }
}

/// Tracked state of each texture before a recording touched it.
pub(crate) type StateSnapshot = HashMap<TextureId, ResourceState>;

/// A recorded state change of one texture.
#[derive(Clone)]
pub struct TransitionRecord {
    /// The texture changing state.
    pub texture: Arc<GpuTexture>,
    /// State before the transition.
    pub before: ResourceState,
    /// State after the transition.
    pub after: ResourceState,
}

impl fmt::Debug for TransitionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transition({}: {} -> {})",
            self.texture.label(),
            self.before,
            self.after
        )
    }
}

/// A texture together with its tracked state.
pub struct GpuResource {
    texture: Arc<GpuTexture>,
    state: ResourceState,
}

impl GpuResource {
    /// Wrap a freshly created texture. Its state starts as `Undefined`.
    pub fn new(texture: GpuTexture) -> Self {
        Self {
            texture: Arc::new(texture),
            state: ResourceState::Undefined,
        }
    }

    /// The wrapped texture.
    pub fn texture(&self) -> &Arc<GpuTexture> {
        &self.texture
    }

    /// State after all commands recorded so far.
    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Move the resource to `target`, recording a transition if needed.
    ///
    /// Returns `Ok(false)` without recording anything when the resource is
    /// already in `target`.
    pub fn transition(
        &mut self,
        target: ResourceState,
        recorder: &mut CommandRecorder,
    ) -> Result<bool, FrameError> {
        if self.state == target {
            return Ok(false);
        }

        let descriptor = self.texture.descriptor();
        if !descriptor.usage.contains(target.required_usage())
            || !target.accepts_depth_format(descriptor.format.is_depth_stencil())
        {
            return Err(FrameError::contract(format!(
                "texture '{}' ({:?}, {:?}) cannot enter state {target}",
                self.texture.label(),
                descriptor.format,
                descriptor.usage
            )));
        }

        recorder.record_transition(TransitionRecord {
            texture: Arc::clone(&self.texture),
            before: self.state,
            after: target,
        })?;
        self.state = target;
        Ok(true)
    }

    /// Restore the state this texture had before a discarded recording.
    ///
    /// Textures the recording never touched are left alone.
    pub(crate) fn rewind(&mut self, snapshot: &StateSnapshot) {
        if let Some(state) = snapshot.get(&self.texture.id()) {
            self.state = *state;
        }
    }

    /// Swap in a recreated texture, e.g. after a resize.
    pub(crate) fn replace_texture(&mut self, texture: GpuTexture) {
        self.texture = Arc::new(texture);
        self.state = ResourceState::Undefined;
    }
}

impl fmt::Debug for GpuResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuResource")
            .field("texture", &self.texture.label())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RawTexture;
    use crate::commands::RecordedCommand;
    use crate::types::{Extent2d, TextureDescriptor, TextureFormat};

    fn resource(format: TextureFormat, usage: TextureUsage) -> GpuResource {
        let descriptor =
            TextureDescriptor::new_2d(Extent2d::new(8, 8), format, usage).with_label("test");
        GpuResource::new(GpuTexture::new(descriptor, RawTexture::Dummy))
    }

    fn color_target() -> GpuResource {
        resource(
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )
    }

    #[test]
    fn test_transition_to_current_state_is_noop() {
        let mut recorder = CommandRecorder::new();
        let mut target = color_target();

        assert!(target.transition(ResourceState::RenderTarget, &mut recorder).unwrap());
        assert!(!target.transition(ResourceState::RenderTarget, &mut recorder).unwrap());

        recorder.flush_transitions();
        assert_eq!(recorder.transition_count(), 1);
        assert_eq!(target.state(), ResourceState::RenderTarget);
    }

    #[test]
    fn test_transition_records_before_and_after() {
        let mut recorder = CommandRecorder::new();
        let mut target = color_target();
        target
            .transition(ResourceState::RenderTarget, &mut recorder)
            .unwrap();
        recorder.flush_transitions();

        match &recorder.commands()[0] {
            RecordedCommand::Transition(record) => {
                assert_eq!(record.before, ResourceState::Undefined);
                assert_eq!(record.after, ResourceState::RenderTarget);
                assert_eq!(record.texture.id(), target.texture().id());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_rewind_restores_state_before_discarded_recording() {
        let mut recorder = CommandRecorder::new();
        let mut target = color_target();
        let mut untouched = color_target();
        target
            .transition(ResourceState::RenderTarget, &mut recorder)
            .unwrap();
        recorder.flush_transitions();
        recorder.reset();

        target
            .transition(ResourceState::ShaderRead, &mut recorder)
            .unwrap();
        recorder.flush_transitions();
        target
            .transition(ResourceState::RenderTarget, &mut recorder)
            .unwrap();
        target
            .transition(ResourceState::ShaderRead, &mut recorder)
            .unwrap();

        let snapshot = recorder.initial_states();
        target.rewind(&snapshot);
        untouched.rewind(&snapshot);
        assert_eq!(target.state(), ResourceState::RenderTarget);
        assert_eq!(untouched.state(), ResourceState::Undefined);
    }

    #[test]
    fn test_usage_is_validated() {
        let mut recorder = CommandRecorder::new();
        let mut target = resource(TextureFormat::Rgba8Unorm, TextureUsage::RENDER_ATTACHMENT);

        let result = target.transition(ResourceState::ShaderRead, &mut recorder);
        assert!(matches!(result, Err(FrameError::ContractViolation(_))));
        assert_eq!(target.state(), ResourceState::Undefined);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_depth_states_require_depth_format() {
        let mut recorder = CommandRecorder::new();
        let mut depth = resource(
            TextureFormat::Depth32Float,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        );
        assert!(depth.transition(ResourceState::RenderTarget, &mut recorder).is_err());
        assert!(depth.transition(ResourceState::DepthWrite, &mut recorder).is_ok());
        assert!(depth.transition(ResourceState::DepthRead, &mut recorder).is_ok());
    }

    #[test]
    fn test_replace_texture_resets_state() {
        let mut recorder = CommandRecorder::new();
        let mut target = color_target();
        target
            .transition(ResourceState::RenderTarget, &mut recorder)
            .unwrap();
        let old_id = target.texture().id();

        let descriptor = target.texture().descriptor().clone();
        target.replace_texture(GpuTexture::new(descriptor, RawTexture::Dummy));
        assert_eq!(target.state(), ResourceState::Undefined);
        assert_ne!(target.texture().id(), old_id);
    }

    #[test]
    fn test_state_predicates() {
        assert!(ResourceState::RenderTarget.is_writable());
        assert!(ResourceState::DepthWrite.is_writable());
        assert!(!ResourceState::Present.is_writable());
        assert!(ResourceState::DepthRead.is_shader_readable());
        assert!(!ResourceState::Undefined.is_shader_readable());
    }
}
