//! Shared fixtures for the frame integration tests.
//!
//! Every test runs on the dummy backend. The backend is kept as a concrete
//! `Arc<DummyBackend>` next to the device so tests can read its counters.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use redlilium_frame::{
    CommandRecorder, DummyBackend, DummyCounters, EffectInput, FrameError, FrameRenderer,
    FrameRendererDescriptor, GraphicsDevice, PostEffect, SlotCapacities, TextureFormat,
    WgslCompiler,
};

/// Route library logs to the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A device together with the dummy backend behind it.
pub struct TestContext {
    pub backend: Arc<DummyBackend>,
    pub device: Arc<GraphicsDevice>,
}

impl TestContext {
    /// Instant GPU, default slot capacities.
    pub fn new() -> Self {
        Self::build(DummyBackend::new(), SlotCapacities::default())
    }

    /// GPU whose fence signals lag by `latency` each.
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(DummyBackend::with_latency(Some(latency)), SlotCapacities::default())
    }

    /// Instant GPU with custom slot capacities.
    pub fn with_capacities(capacities: SlotCapacities) -> Self {
        Self::build(DummyBackend::new(), capacities)
    }

    fn build(backend: DummyBackend, capacities: SlotCapacities) -> Self {
        init_logging();
        let backend = Arc::new(backend);
        let device = GraphicsDevice::from_parts(
            backend.clone(),
            capacities,
            Arc::new(WgslCompiler::new()),
        )
        .expect("dummy device");
        Self { backend, device }
    }

    pub fn counters(&self) -> DummyCounters {
        self.backend.counters()
    }

    pub fn renderer(&self, descriptor: FrameRendererDescriptor) -> FrameRenderer {
        FrameRenderer::new(Arc::clone(&self.device), descriptor).expect("frame renderer")
    }
}

/// Effect that draws nothing and reports every input it was given.
pub struct RecordingEffect {
    pub name: &'static str,
    pub requires_depth: bool,
    pub seen: Arc<parking_lot::Mutex<Vec<(&'static str, EffectInput)>>>,
}

impl RecordingEffect {
    pub fn new(
        name: &'static str,
        seen: &Arc<parking_lot::Mutex<Vec<(&'static str, EffectInput)>>>,
    ) -> Self {
        Self {
            name,
            requires_depth: false,
            seen: Arc::clone(seen),
        }
    }

    pub fn needing_depth(mut self) -> Self {
        self.requires_depth = true;
        self
    }
}

impl PostEffect for RecordingEffect {
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
        self.seen.lock().push((self.name, *input));
        Ok(())
    }
}
