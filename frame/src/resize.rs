//! Debounced window resizes.
//!
//! During a drag-resize the windowing system reports a new size every few
//! milliseconds. Resizing the frame renderer means waiting for the GPU to go
//! idle and recreating the surface, offscreen target and ping-pong buffers,
//! so doing it per event stalls every frame of the drag:
//!
//! ```text
//! Events:  R  R  R  R  R  R  ... R [quiet period]
//!          └──────────────────────┘      │
//!            (events buffered)           ▼
//!                              Single FrameRenderer::resize
//! ```
//!
//! [`ResizeManager`] buffers the latest size and releases it once no new
//! event arrived for the debounce period. A zero-sized window (minimized)
//! is reported through [`ResizeManager::is_minimized`] instead, since no
//! swapchain can have a zero extent.
//!
//! ```ignore
//! match event {
//!     WindowEvent::Resized(size) => resize.on_resize_event(size.width, size.height),
//!     WindowEvent::RedrawRequested => {
//!         if let Some(event) = resize.update() {
//!             renderer.resize(event.extent.width, event.extent.height)?;
//!         }
//!         if !resize.is_minimized() {
//!             renderer.begin_frame()?;
//!             renderer.end_frame()?;
//!         }
//!     }
//!     _ => {}
//! }
//! ```

use std::time::{Duration, Instant};

use crate::types::Extent2d;

/// Default quiet period before a resize is applied.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// A resize that should be applied now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeEvent {
    /// New size.
    pub extent: Extent2d,
    /// Size before the resize.
    pub previous: Extent2d,
}

/// Buffers resize events until the window stops changing size.
#[derive(Debug)]
pub struct ResizeManager {
    current: Extent2d,
    pending: Option<Extent2d>,
    last_event: Instant,
    debounce: Duration,
    minimized: bool,
}

impl ResizeManager {
    /// Track a window whose swapchain currently has `initial` size.
    pub fn new(initial: Extent2d, debounce: Duration) -> Self {
        Self {
            current: initial,
            pending: None,
            last_event: Instant::now(),
            debounce,
            minimized: initial.is_empty(),
        }
    }

    /// Quiet period before a pending resize is released.
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Change the quiet period.
    pub fn set_debounce(&mut self, debounce: Duration) {
        self.debounce = debounce;
    }

    /// Record a window resize event.
    pub fn on_resize_event(&mut self, width: u32, height: u32) {
        self.on_resize_event_at(width, height, Instant::now());
    }

    /// Record a window resize event observed at `now`.
    pub fn on_resize_event_at(&mut self, width: u32, height: u32, now: Instant) {
        let extent = Extent2d::new(width, height);
        if extent.is_empty() {
            if !self.minimized {
                log::debug!("Window minimized, pausing frames");
            }
            self.minimized = true;
            return;
        }
        self.minimized = false;

        if Some(extent) == self.pending || (self.pending.is_none() && extent == self.current) {
            return;
        }
        self.pending = Some(extent);
        self.last_event = now;
        log::trace!("Resize to {extent} pending");
    }

    /// Release the pending resize if the quiet period has passed.
    pub fn update(&mut self) -> Option<ResizeEvent> {
        self.update_at(Instant::now())
    }

    /// Release the pending resize if the quiet period has passed by `now`.
    pub fn update_at(&mut self, now: Instant) -> Option<ResizeEvent> {
        if self.minimized {
            return None;
        }
        let extent = self.pending?;
        if now.saturating_duration_since(self.last_event) < self.debounce {
            return None;
        }
        self.take(extent)
    }

    /// Release the pending resize immediately, e.g. on a fullscreen toggle.
    pub fn force_resize(&mut self) -> Option<ResizeEvent> {
        let extent = self.pending?;
        self.take(extent)
    }

    fn take(&mut self, extent: Extent2d) -> Option<ResizeEvent> {
        self.pending = None;
        if extent == self.current {
            return None;
        }
        let previous = std::mem::replace(&mut self.current, extent);
        log::debug!("Applying resize {previous} -> {extent}");
        Some(ResizeEvent { extent, previous })
    }

    /// Size last handed out by [`update`](Self::update).
    pub fn current(&self) -> Extent2d {
        self.current
    }

    /// Size waiting for the quiet period, if any.
    pub fn pending(&self) -> Option<Extent2d> {
        self.pending
    }

    /// Whether a resize is waiting.
    pub fn is_resizing(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether the window currently has a zero size.
    pub fn is_minimized(&self) -> bool {
        self.minimized
    }
}
