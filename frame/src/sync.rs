//! CPU-GPU frame pacing.
//!
//! [`FrameSynchronizer`] wraps a single timeline fence: a counter the GPU
//! queue writes as work completes and the CPU reads or waits on.
//!
//! ```text
//!              signal()                     GPU reaches target
//!   Idle ───────────────► AwaitingSignal(target) ──────────────► Idle
//! ```
//!
//! The CPU side keeps `target_value`, the highest value ever requested. The
//! GPU side exposes `completed_value`, which only grows and never exceeds
//! `target_value`. Waiting blocks on the backend's wait primitive and never
//! spins.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{GpuBackend, GpuTimeline};
use crate::error::FrameError;

/// Observable state of the frame fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// All signalled work has retired.
    Idle,
    /// The GPU has not yet reached this value.
    AwaitingSignal(u64),
}

/// Timeline-fence based frame synchronizer.
pub struct FrameSynchronizer {
    backend: Arc<dyn GpuBackend>,
    timeline: GpuTimeline,
    target_value: u64,
    last_observed: AtomicU64,
}

impl FrameSynchronizer {
    /// Create the synchronizer and its fence.
    ///
    /// Failing to create the fence is fatal: no frame pacing is possible.
    pub fn new(backend: Arc<dyn GpuBackend>) -> Result<Self, FrameError> {
        let timeline = backend.create_timeline(0).map_err(|e| {
            FrameError::InitializationFailed(format!("failed to create frame fence: {e}"))
        })?;
        Ok(Self {
            backend,
            timeline,
            target_value: 0,
            last_observed: AtomicU64::new(0),
        })
    }

    /// Request the queue to signal the next value once prior work completes.
    ///
    /// Returns the value that will be signalled.
    pub fn signal(&mut self) -> Result<u64, FrameError> {
        let value = self.target_value + 1;
        self.backend.signal_timeline(&self.timeline, value)?;
        self.target_value = value;
        Ok(value)
    }

    /// Highest value ever requested.
    pub fn target_value(&self) -> u64 {
        self.target_value
    }

    /// Value the GPU has completed so far.
    pub fn completed_value(&self) -> Result<u64, FrameError> {
        let value = self.backend.timeline_value(&self.timeline)?;
        let previous = self.last_observed.fetch_max(value, Ordering::AcqRel);
        debug_assert!(
            value >= previous,
            "fence value went backwards: {previous} -> {value}"
        );
        debug_assert!(
            value <= self.target_value,
            "fence value {value} exceeds target {}",
            self.target_value
        );
        Ok(value)
    }

    /// Current state of the fence.
    pub fn state(&self) -> Result<SyncState, FrameError> {
        if self.completed_value()? >= self.target_value {
            Ok(SyncState::Idle)
        } else {
            Ok(SyncState::AwaitingSignal(self.target_value))
        }
    }

    /// Block until the GPU has completed `value`.
    ///
    /// Waiting on a value that was never signalled would never return, so it
    /// is rejected as a contract violation.
    pub fn wait_until_retired(&self, value: u64) -> Result<(), FrameError> {
        if value > self.target_value {
            return Err(FrameError::contract(format!(
                "waiting for fence value {value}, but only {} was signalled",
                self.target_value
            )));
        }
        if self.completed_value()? >= value {
            return Ok(());
        }

        log::trace!("Waiting for fence value {value}");
        self.backend.wait_timeline(&self.timeline, value)?;

        let completed = self.completed_value()?;
        debug_assert!(
            completed >= value,
            "fence wait returned early: {completed} < {value}"
        );
        Ok(())
    }

    /// Block until everything signalled so far has retired.
    pub fn wait_idle(&self) -> Result<(), FrameError> {
        self.wait_until_retired(self.target_value)
    }
}

impl fmt::Debug for FrameSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSynchronizer")
            .field("timeline", &self.timeline)
            .field("target_value", &self.target_value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use rstest::rstest;
    use std::time::Duration;

    fn synchronizer(latency: Option<Duration>) -> FrameSynchronizer {
        FrameSynchronizer::new(Arc::new(DummyBackend::with_latency(latency))).unwrap()
    }

    #[test]
    fn test_starts_idle() {
        let sync = synchronizer(None);
        assert_eq!(sync.target_value(), 0);
        assert_eq!(sync.completed_value().unwrap(), 0);
        assert_eq!(sync.state().unwrap(), SyncState::Idle);
        sync.wait_idle().unwrap();
    }

    #[test]
    fn test_signal_increments_target() {
        let mut sync = synchronizer(None);
        assert_eq!(sync.signal().unwrap(), 1);
        assert_eq!(sync.signal().unwrap(), 2);
        assert_eq!(sync.target_value(), 2);
        sync.wait_until_retired(2).unwrap();
        assert_eq!(sync.completed_value().unwrap(), 2);
    }

    #[rstest]
    #[case::one(1)]
    #[case::three(3)]
    #[case::eight(8)]
    fn test_wait_never_returns_early(#[case] signals: u64) {
        let mut sync = synchronizer(Some(Duration::from_millis(5)));
        for _ in 0..signals {
            sync.signal().unwrap();
        }

        sync.wait_until_retired(signals).unwrap();
        assert!(sync.completed_value().unwrap() >= signals);
    }

    #[test]
    fn test_state_machine_with_latency() {
        let mut sync = synchronizer(Some(Duration::from_millis(50)));
        let value = sync.signal().unwrap();
        assert_eq!(sync.state().unwrap(), SyncState::AwaitingSignal(value));

        sync.wait_until_retired(value).unwrap();
        assert_eq!(sync.state().unwrap(), SyncState::Idle);
    }

    #[test]
    fn test_wait_for_unsignalled_value_is_rejected() {
        let mut sync = synchronizer(None);
        sync.signal().unwrap();
        assert!(matches!(
            sync.wait_until_retired(2),
            Err(FrameError::ContractViolation(_))
        ));
    }
}
