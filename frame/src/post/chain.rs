//! Ordered chain of image-space effects over ping-pong buffers.
//!
//! Effects are kept sorted by ascending priority; equal priorities keep
//! registration order. [`PostProcessChain::apply`] walks the enabled effects,
//! rendering each into the next ping-pong buffer and sampling the previous
//! result:
//!
//! ```text
//! input ─► [A] ─► buf0 ─► [B] ─► buf1 ─► [C] ─► buf0 ─► output
//! ```
//!
//! The buffer being written is never the one being read: there are at least
//! two buffers and the index advances after every effect. The index restarts
//! at zero on every application, so a frame's output buffer depends only on
//! how many effects ran.

use std::fmt;
use std::sync::Arc;

use crate::backend::GpuTexture;
use crate::commands::{ColorAttachment, CommandRecorder};
use crate::device::{GraphicsDevice, OwnedView};
use crate::error::FrameError;
use crate::resource::{GpuResource, ResourceState, StateSnapshot};
use crate::slots::{SlotCategory, ViewHandle};
use crate::types::{Extent2d, ScissorRect, TextureDescriptor, TextureFormat, TextureUsage, Viewport};

use super::{EffectInput, PostEffect};

/// Ping-pong buffers created by default.
pub const DEFAULT_PING_PONG_COUNT: usize = 2;

/// Identifies a registered effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectHandle(u64);

/// Something the chain noticed while applying effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainDiagnostic {
    /// A depth-requiring effect was skipped because no depth view was given.
    DepthUnavailable {
        /// The skipped effect.
        effect: EffectHandle,
        /// Its name.
        name: String,
    },
}

impl fmt::Display for ChainDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DepthUnavailable { name, .. } => {
                write!(f, "effect '{name}' skipped: it requires depth but none was supplied")
            }
        }
    }
}

struct EffectEntry {
    handle: EffectHandle,
    effect: Box<dyn PostEffect>,
    enabled: bool,
    priority: i32,
    skip_reported: bool,
}

struct PingPongBuffer {
    rtv: OwnedView,
    srv: OwnedView,
    resource: GpuResource,
}

/// Ordered post-process effects over `k >= 2` ping-pong buffers.
pub struct PostProcessChain {
    buffers: Vec<PingPongBuffer>,
    entries: Vec<EffectEntry>,
    device: Arc<GraphicsDevice>,
    extent: Extent2d,
    format: TextureFormat,
    next_handle: u64,
    diagnostics: Vec<ChainDiagnostic>,
    last_output: Option<ViewHandle>,
}

impl PostProcessChain {
    /// Create a chain whose buffers have the given size and format.
    pub fn new(
        device: Arc<GraphicsDevice>,
        extent: Extent2d,
        format: TextureFormat,
        buffer_count: usize,
    ) -> Result<Self, FrameError> {
        if buffer_count < 2 {
            return Err(FrameError::InvalidParameter(format!(
                "post-process chain needs at least 2 ping-pong buffers, got {buffer_count}"
            )));
        }
        if format.is_depth_stencil() {
            return Err(FrameError::InvalidParameter(format!(
                "post-process format {format:?} is a depth format"
            )));
        }
        if extent.is_empty() {
            return Err(FrameError::InvalidParameter(format!(
                "post-process buffers must have a non-zero size, got {extent}"
            )));
        }

        let mut chain = Self {
            buffers: Vec::with_capacity(buffer_count),
            entries: Vec::new(),
            device,
            extent,
            format,
            next_handle: 0,
            diagnostics: Vec::new(),
            last_output: None,
        };
        for _ in 0..buffer_count {
            chain.add_buffer()?;
        }

        log::debug!(
            "Created post-process chain {} ({:?}, {} ping-pong buffers)",
            extent,
            format,
            buffer_count
        );
        Ok(chain)
    }

    /// Add one more ping-pong buffer.
    ///
    /// Fails with [`FrameError::SlotExhausted`] when the view-slot pools are
    /// full. The chain stays usable with its current buffers.
    pub fn add_buffer(&mut self) -> Result<(), FrameError> {
        let buffer = self.create_buffer(self.buffers.len())?;
        self.buffers.push(buffer);
        Ok(())
    }

    fn buffer_descriptor(&self, extent: Extent2d, index: usize) -> TextureDescriptor {
        TextureDescriptor::new_2d(
            extent,
            self.format,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )
        .with_label(format!("post ping-pong {index}"))
    }

    fn create_buffer(&self, index: usize) -> Result<PingPongBuffer, FrameError> {
        let texture = self
            .device
            .create_texture(&self.buffer_descriptor(self.extent, index))?;
        let rtv = self
            .device
            .create_owned_view(SlotCategory::RenderTarget, &texture)?;
        let srv = self
            .device
            .create_owned_view(SlotCategory::ShaderResource, &texture)?;
        Ok(PingPongBuffer {
            rtv,
            srv,
            resource: GpuResource::new(texture),
        })
    }

    /// Register an effect and create its GPU state.
    ///
    /// A pipeline that fails to build is returned as an error and the effect
    /// is not registered.
    pub fn add_effect(
        &mut self,
        mut effect: Box<dyn PostEffect>,
        priority: i32,
    ) -> Result<EffectHandle, FrameError> {
        effect.prepare(&self.device, self.format)?;

        let handle = EffectHandle(self.next_handle);
        self.next_handle += 1;
        log::debug!(
            "Registered effect '{}' with priority {priority}{}",
            effect.name(),
            if effect.requires_depth() { " (requires depth)" } else { "" }
        );

        self.insert_sorted(EffectEntry {
            handle,
            effect,
            enabled: true,
            priority,
            skip_reported: false,
        });
        Ok(handle)
    }

    // Handles grow with registration, so (priority, handle) is the stable order.
    fn insert_sorted(&mut self, entry: EffectEntry) {
        let key = (entry.priority, entry.handle);
        let position = self
            .entries
            .partition_point(|e| (e.priority, e.handle) < key);
        self.entries.insert(position, entry);
    }

    fn position(&self, handle: EffectHandle) -> Result<usize, FrameError> {
        self.entries
            .iter()
            .position(|e| e.handle == handle)
            .ok_or_else(|| FrameError::InvalidParameter(format!("unknown effect {handle:?}")))
    }

    /// Unregister an effect and hand it back.
    pub fn remove_effect(&mut self, handle: EffectHandle) -> Result<Box<dyn PostEffect>, FrameError> {
        let position = self.position(handle)?;
        let entry = self.entries.remove(position);
        log::debug!("Removed effect '{}'", entry.effect.name());
        Ok(entry.effect)
    }

    /// Enable or bypass an effect. A disabled effect costs nothing.
    pub fn set_enabled(&mut self, handle: EffectHandle, enabled: bool) -> Result<(), FrameError> {
        let position = self.position(handle)?;
        self.entries[position].enabled = enabled;
        Ok(())
    }

    /// Whether an effect is enabled.
    pub fn is_enabled(&self, handle: EffectHandle) -> Result<bool, FrameError> {
        Ok(self.entries[self.position(handle)?].enabled)
    }

    /// Change an effect's priority and re-sort.
    pub fn set_priority(&mut self, handle: EffectHandle, priority: i32) -> Result<(), FrameError> {
        let position = self.position(handle)?;
        let mut entry = self.entries.remove(position);
        entry.priority = priority;
        self.insert_sorted(entry);
        Ok(())
    }

    /// Names of the enabled effects in execution order.
    pub fn effect_order(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.effect.name())
            .collect()
    }

    /// Whether any enabled effect samples scene depth.
    pub fn requires_depth(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.enabled && e.effect.requires_depth())
    }

    /// Number of registered effects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no effect is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of ping-pong buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Size of the ping-pong buffers.
    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    /// Format of the ping-pong buffers.
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Shader-resource view of one ping-pong buffer.
    pub fn buffer_view(&self, index: usize) -> Option<ViewHandle> {
        self.buffers.get(index).map(|b| b.srv.view())
    }

    /// Texture behind one ping-pong buffer.
    pub fn buffer_texture(&self, index: usize) -> Option<&Arc<GpuTexture>> {
        self.buffers.get(index).map(|b| b.resource.texture())
    }

    /// Diagnostics recorded by the last [`apply`](Self::apply).
    pub fn last_diagnostics(&self) -> &[ChainDiagnostic] {
        &self.diagnostics
    }

    /// Output of the last [`apply`](Self::apply).
    pub fn last_output(&self) -> Option<ViewHandle> {
        self.last_output
    }

    /// Run every enabled effect over `input` and return the final view.
    ///
    /// `input` must already be shader-readable. With no enabled effect the
    /// input is returned unchanged and nothing is recorded.
    pub fn apply(
        &mut self,
        recorder: &mut CommandRecorder,
        input: ViewHandle,
        depth: Option<ViewHandle>,
    ) -> Result<ViewHandle, FrameError> {
        self.diagnostics.clear();
        let mut current = input;
        let mut next = 0;

        for entry in self.entries.iter_mut().filter(|e| e.enabled) {
            let name = entry.effect.name();
            let requires_depth = entry.effect.requires_depth();

            if requires_depth && depth.is_none() {
                if !entry.skip_reported {
                    log::warn!("Skipping effect '{name}': it requires depth but none was supplied");
                    entry.skip_reported = true;
                }
                self.diagnostics.push(ChainDiagnostic::DepthUnavailable {
                    effect: entry.handle,
                    name: name.to_string(),
                });
                continue;
            }
            entry.skip_reported = false;
            if !requires_depth && depth.is_some() {
                log::trace!("Effect '{name}' ignores the supplied depth view");
            }

            let buffer = &mut self.buffers[next];
            buffer.resource.transition(ResourceState::RenderTarget, recorder)?;
            recorder.begin_rendering(
                name,
                Some(ColorAttachment {
                    view: buffer.rtv.view(),
                    clear: None,
                }),
                None,
                self.extent,
            )?;
            recorder.set_viewport(Viewport::from_extent(self.extent));
            recorder.set_scissor(ScissorRect::from_extent(self.extent));

            let effect_input = EffectInput {
                color: current,
                depth: if requires_depth { depth } else { None },
                extent: self.extent,
            };
            entry.effect.record(recorder, &effect_input)?;

            recorder.end_rendering()?;
            buffer.resource.transition(ResourceState::ShaderRead, recorder)?;
            current = buffer.srv.view();
            next = (next + 1) % self.buffers.len();
        }

        self.last_output = Some(current);
        Ok(current)
    }

    /// Recreate the ping-pong buffers at a new size, keeping their slots.
    ///
    /// The caller must make sure the GPU no longer uses the old buffers.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), FrameError> {
        let extent = Extent2d::new(width, height);
        if extent.is_empty() {
            return Err(FrameError::InvalidParameter(format!(
                "post-process buffers must have a non-zero size, got {extent}"
            )));
        }
        if extent == self.extent {
            return Ok(());
        }

        let textures = (0..self.buffers.len())
            .map(|index| self.device.create_texture(&self.buffer_descriptor(extent, index)))
            .collect::<Result<Vec<_>, _>>()?;

        for (rewritten, texture) in textures.iter().enumerate() {
            let buffer = &self.buffers[rewritten];
            if let Err(e) = buffer
                .rtv
                .rewrite(texture)
                .and_then(|()| buffer.srv.rewrite(texture))
            {
                self.restore_views(rewritten + 1);
                return Err(e);
            }
        }
        for (buffer, texture) in self.buffers.iter_mut().zip(textures) {
            buffer.resource.replace_texture(texture);
        }
        self.extent = extent;
        self.last_output = None;

        log::debug!("Resized post-process chain to {extent}");
        Ok(())
    }

    // Point the views of the first `count` buffers back at their textures.
    fn restore_views(&self, count: usize) {
        for buffer in &self.buffers[..count] {
            let texture = buffer.resource.texture();
            if let Err(e) = buffer.rtv.rewrite(texture).and_then(|()| buffer.srv.rewrite(texture)) {
                log::error!("Failed to restore post-process views after a failed resize: {e}");
            }
        }
    }

    pub(crate) fn rewind(&mut self, snapshot: &StateSnapshot) {
        for buffer in &mut self.buffers {
            buffer.resource.rewind(snapshot);
        }
    }
}

impl fmt::Debug for PostProcessChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostProcessChain")
            .field("extent", &self.extent)
            .field("format", &self.format)
            .field("buffers", &self.buffers.len())
            .field("effects", &self.entries.iter().map(|e| e.effect.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::RecordedCommand;
    use crate::device::{BackendType, DeviceParameters};
    use crate::slots::{SlotCapacities, SlotHandle};
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<(String, ViewHandle, Option<ViewHandle>)>>>;

    /// Records which inputs it saw instead of drawing.
    struct Recording {
        name: &'static str,
        requires_depth: bool,
        log: Log,
    }

    impl PostEffect for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn requires_depth(&self) -> bool {
            self.requires_depth
        }

        fn prepare(&mut self, _: &GraphicsDevice, _: TextureFormat) -> Result<(), FrameError> {
            Ok(())
        }

        fn record(&self, _: &mut CommandRecorder, input: &EffectInput) -> Result<(), FrameError> {
            self.log
                .lock()
                .push((self.name.to_string(), input.color, input.depth));
            Ok(())
        }
    }

    struct Failing;

    impl PostEffect for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn prepare(&mut self, _: &GraphicsDevice, _: TextureFormat) -> Result<(), FrameError> {
            Err(FrameError::ShaderCompilationFailed("failing: no shader".into()))
        }

        fn record(&self, _: &mut CommandRecorder, _: &EffectInput) -> Result<(), FrameError> {
            Ok(())
        }
    }

    struct Fixture {
        device: Arc<GraphicsDevice>,
        chain: PostProcessChain,
        input: SlotHandle,
        depth: SlotHandle,
        log: Log,
    }

    impl Fixture {
        fn new() -> Self {
            let device =
                GraphicsDevice::new(DeviceParameters::new().with_backend(BackendType::Dummy))
                    .unwrap();
            let chain = PostProcessChain::new(
                device.clone(),
                Extent2d::new(64, 64),
                TextureFormat::Rgba16Float,
                DEFAULT_PING_PONG_COUNT,
            )
            .unwrap();
            let input = device.allocate_view(SlotCategory::ShaderResource).unwrap();
            let depth = device.allocate_view(SlotCategory::ShaderResource).unwrap();
            Self {
                device,
                chain,
                input,
                depth,
                log: Arc::default(),
            }
        }

        fn add(&mut self, name: &'static str, priority: i32, requires_depth: bool) -> EffectHandle {
            let effect = Recording {
                name,
                requires_depth,
                log: self.log.clone(),
            };
            self.chain.add_effect(Box::new(effect), priority).unwrap()
        }

        fn executed(&self) -> Vec<String> {
            self.log.lock().iter().map(|(name, ..)| name.clone()).collect()
        }

        fn release(self) {
            self.device.release_view(self.input);
            self.device.release_view(self.depth);
        }
    }

    #[test]
    fn test_no_enabled_effects_is_identity() {
        let mut fx = Fixture::new();
        let handle = fx.add("a", 0, false);
        fx.chain.set_enabled(handle, false).unwrap();

        let mut recorder = CommandRecorder::new();
        let output = fx
            .chain
            .apply(&mut recorder, fx.input.view(), Some(fx.depth.view()))
            .unwrap();

        assert_eq!(output, fx.input.view());
        assert!(recorder.is_empty());
        assert_eq!(recorder.transition_count(), 0);
        fx.release();
    }

    #[test]
    fn test_priority_order_beats_registration_order() {
        let mut fx = Fixture::new();
        fx.add("A", 1, false);
        fx.add("B", 0, false);

        let mut recorder = CommandRecorder::new();
        fx.chain.apply(&mut recorder, fx.input.view(), None).unwrap();
        assert_eq!(fx.executed(), vec!["B", "A"]);
        fx.release();
    }

    #[test]
    fn test_three_effect_scenario() {
        let mut fx = Fixture::new();
        fx.add("A", 2, false);
        fx.add("B", 1, false);
        fx.add("C", 3, false);
        assert_eq!(fx.chain.effect_order(), vec!["B", "A", "C"]);

        let mut recorder = CommandRecorder::new();
        fx.chain.apply(&mut recorder, fx.input.view(), None).unwrap();
        assert_eq!(fx.executed(), vec!["B", "A", "C"]);
        fx.release();
    }

    #[test]
    fn test_equal_priorities_keep_registration_order() {
        let mut fx = Fixture::new();
        fx.add("first", 5, false);
        fx.add("second", 5, false);
        fx.add("early", -1, false);
        assert_eq!(fx.chain.effect_order(), vec!["early", "first", "second"]);
        fx.release();
    }

    #[test]
    fn test_ping_pong_feeds_previous_output() {
        let mut fx = Fixture::new();
        fx.add("A", 0, false);
        fx.add("B", 1, false);
        fx.add("C", 2, false);

        let mut recorder = CommandRecorder::new();
        let output = fx.chain.apply(&mut recorder, fx.input.view(), None).unwrap();

        let buf0 = fx.chain.buffer_view(0).unwrap();
        let buf1 = fx.chain.buffer_view(1).unwrap();
        let inputs: Vec<ViewHandle> = fx.log.lock().iter().map(|(_, color, _)| *color).collect();
        assert_eq!(inputs, vec![fx.input.view(), buf0, buf1]);
        assert_eq!(output, buf0);
        assert_eq!(fx.chain.last_output(), Some(buf0));

        // Render targets alternate buf0, buf1, buf0.
        let targets: Vec<ViewHandle> = recorder
            .commands()
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginRendering { color: Some(c), .. } => Some(c.view),
                _ => None,
            })
            .collect();
        assert_eq!(targets.len(), 3);
        assert_ne!(targets[0], targets[1]);
        assert_eq!(targets[0], targets[2]);
        fx.release();
    }

    #[test]
    fn test_depth_effect_skipped_without_depth() {
        let mut with_skip = Fixture::new();
        with_skip.add("A", 0, false);
        let fog = with_skip.add("fog", 1, true);
        with_skip.add("C", 2, false);

        let mut recorder = CommandRecorder::new();
        let skipped_output = with_skip
            .chain
            .apply(&mut recorder, with_skip.input.view(), None)
            .unwrap();
        assert_eq!(with_skip.executed(), vec!["A", "C"]);
        assert_eq!(
            with_skip.chain.last_diagnostics(),
            &[ChainDiagnostic::DepthUnavailable {
                effect: fog,
                name: "fog".to_string(),
            }]
        );

        let mut disabled = Fixture::new();
        disabled.add("A", 0, false);
        let fog = disabled.add("fog", 1, true);
        disabled.add("C", 2, false);
        disabled.chain.set_enabled(fog, false).unwrap();
        let mut recorder = CommandRecorder::new();
        let disabled_output = disabled
            .chain
            .apply(&mut recorder, disabled.input.view(), None)
            .unwrap();

        assert_eq!(skipped_output.index(), disabled_output.index());
        assert_eq!(with_skip.executed(), disabled.executed());
        assert!(disabled.chain.last_diagnostics().is_empty());
        with_skip.release();
        disabled.release();
    }

    #[test]
    fn test_depth_passed_only_to_depth_effects() {
        let mut fx = Fixture::new();
        fx.add("color", 0, false);
        fx.add("fog", 1, true);

        let mut recorder = CommandRecorder::new();
        fx.chain
            .apply(&mut recorder, fx.input.view(), Some(fx.depth.view()))
            .unwrap();
        assert!(fx.chain.requires_depth());
        let depths: Vec<Option<ViewHandle>> = fx.log.lock().iter().map(|(.., d)| *d).collect();
        assert_eq!(depths, vec![None, Some(fx.depth.view())]);
        assert!(fx.chain.last_diagnostics().is_empty());
        fx.release();
    }

    #[test]
    fn test_management_operations() {
        let mut fx = Fixture::new();
        let a = fx.add("A", 0, false);
        let b = fx.add("B", 1, false);

        fx.chain.set_priority(a, 2).unwrap();
        assert_eq!(fx.chain.effect_order(), vec!["B", "A"]);

        fx.chain.set_enabled(b, false).unwrap();
        assert!(!fx.chain.is_enabled(b).unwrap());
        assert_eq!(fx.chain.effect_order(), vec!["A"]);

        let removed = fx.chain.remove_effect(a).unwrap();
        assert_eq!(removed.name(), "A");
        assert_eq!(fx.chain.len(), 1);
        assert!(fx.chain.set_enabled(a, true).is_err());
        fx.release();
    }

    #[test]
    fn test_failing_effect_not_registered() {
        let mut fx = Fixture::new();
        let result = fx.chain.add_effect(Box::new(Failing), 0);
        assert!(matches!(result, Err(FrameError::ShaderCompilationFailed(_))));
        assert!(fx.chain.is_empty());
        fx.release();
    }

    #[test]
    fn test_ping_pong_transitions_balance() {
        let mut fx = Fixture::new();
        fx.add("A", 0, false);
        fx.add("B", 1, false);

        let mut recorder = CommandRecorder::new();
        fx.chain.apply(&mut recorder, fx.input.view(), None).unwrap();
        // Two transitions per pass: into RenderTarget, back to ShaderRead.
        recorder.flush_transitions();
        assert_eq!(recorder.transition_count(), 4);

        let mut recorder = CommandRecorder::new();
        fx.chain.apply(&mut recorder, fx.input.view(), None).unwrap();
        recorder.flush_transitions();
        assert_eq!(recorder.transition_count(), 4);
        fx.release();
    }

    #[test]
    fn test_requires_two_buffers() {
        let device =
            GraphicsDevice::new(DeviceParameters::new().with_backend(BackendType::Dummy)).unwrap();
        let result = PostProcessChain::new(device, Extent2d::new(8, 8), TextureFormat::Rgba8Unorm, 1);
        assert!(matches!(result, Err(FrameError::InvalidParameter(_))));
    }

    #[test]
    fn test_extra_buffer_exhaustion_is_recoverable() {
        let device = GraphicsDevice::new(
            DeviceParameters::new()
                .with_backend(BackendType::Dummy)
                .with_slot_capacities(SlotCapacities {
                    render_target: 2,
                    depth_stencil: 1,
                    shader_resource: 8,
                }),
        )
        .unwrap();
        let mut chain =
            PostProcessChain::new(device.clone(), Extent2d::new(8, 8), TextureFormat::Rgba8Unorm, 2)
                .unwrap();

        let err = chain.add_buffer().unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(chain.buffer_count(), 2);
        assert_eq!(device.slots().stats(SlotCategory::ShaderResource).in_use, 2);
    }

    #[test]
    fn test_resize_keeps_views() {
        let mut fx = Fixture::new();
        let before = fx.chain.buffer_view(1);
        fx.chain.resize(32, 16).unwrap();
        assert_eq!(fx.chain.extent(), Extent2d::new(32, 16));
        assert_eq!(fx.chain.buffer_view(1), before);
        fx.release();
    }
}
