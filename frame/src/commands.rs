//! Command recording and per-frame submission.
//!
//! # Recording
//!
//! [`CommandRecorder`] collects a linear list of [`RecordedCommand`]s for one
//! frame. Resource-state transitions are not written to the list right
//! away: they sit in a pending batch, keyed by texture, until something
//! needs them (a render pass begins or the recorder closes). Repeated
//! transitions of the same texture are merged, so a recording never holds
//! two unresolved transitions for one resource.
//!
//! # Submission
//!
//! [`CommandSubmissionPipeline`] owns one recorder per frame-in-flight slot
//! and drives each through a small state machine:
//!
//! ```text
//!  begin_frame          end_frame: close     submit + signal     retired
//! ───────────► Recording ──────────► Submittable ──────► InFlight ──────► Retired
//!                  ▲                                                        │
//!                  └──────────────── begin_frame (reset) ───────────────────┘
//! ```
//!
//! `end_frame` closes the recorder, submits it, signals the frame fence,
//! presents, and then waits until at most `frames_in_flight - 1` frames are
//! still executing. With the default of one frame in flight this is a full
//! retirement wait every frame: at most one frame of GPU work is outstanding.

use std::fmt;
use std::sync::Arc;

use crate::backend::{GpuBackend, GpuPipeline, Submission};
use crate::device::GraphicsDevice;
use crate::error::FrameError;
use crate::resource::{StateSnapshot, TransitionRecord};
use crate::slots::ViewHandle;
use crate::surface::PresentationSurface;
use crate::sync::FrameSynchronizer;
use crate::types::{Extent2d, ScissorRect, Viewport};

/// Upper bound on frames in flight.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Color attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    /// Render-target view to draw into.
    pub view: ViewHandle,
    /// Clear color, or `None` to keep the previous contents.
    pub clear: Option<[f32; 4]>,
}

/// Depth attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    /// Depth-stencil view to test against.
    pub view: ViewHandle,
    /// Clear depth, or `None` to keep the previous contents.
    pub clear: Option<f32>,
}

/// A single recorded GPU command.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    /// Resource-state transition (barrier).
    Transition(TransitionRecord),
    /// Begin rendering into the given attachments.
    BeginRendering {
        label: String,
        color: Option<ColorAttachment>,
        depth: Option<DepthAttachment>,
        extent: Extent2d,
    },
    /// Set the viewport.
    SetViewport(Viewport),
    /// Set the scissor rectangle.
    SetScissor(ScissorRect),
    /// Bind a fullscreen pipeline.
    BindPipeline(Arc<GpuPipeline>),
    /// Bind the sampled inputs of the current pipeline.
    BindInputs {
        color: ViewHandle,
        depth: Option<ViewHandle>,
    },
    /// Upload push-constant data.
    PushConstants(Vec<u8>),
    /// Non-indexed draw.
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    /// End the current render pass.
    EndRendering,
}

/// Records the commands of one frame.
///
/// Also usable standalone, which makes it the natural test double for
/// observing what a component records.
pub struct CommandRecorder {
    commands: Vec<RecordedCommand>,
    pending: Vec<TransitionRecord>,
    in_pass: bool,
    pipeline_bound: bool,
}

impl CommandRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            pending: Vec::new(),
            in_pass: false,
            pipeline_bound: false,
        }
    }

    /// Drop all recorded commands, keeping the allocations.
    pub(crate) fn reset(&mut self) {
        self.commands.clear();
        self.pending.clear();
        self.in_pass = false;
        self.pipeline_bound = false;
    }

    /// State of every texture before its first transition in this recording.
    pub(crate) fn initial_states(&self) -> StateSnapshot {
        let flushed = self.commands.iter().filter_map(|command| match command {
            RecordedCommand::Transition(record) => Some(record),
            _ => None,
        });
        let mut snapshot = StateSnapshot::new();
        for record in flushed.chain(&self.pending) {
            snapshot.entry(record.texture.id()).or_insert(record.before);
        }
        snapshot
    }

    /// Queue a transition, merging it with a pending one for the same texture.
    pub(crate) fn record_transition(&mut self, record: TransitionRecord) -> Result<(), FrameError> {
        if self.in_pass {
            return Err(FrameError::contract(format!(
                "transition of '{}' recorded inside a render pass",
                record.texture.label()
            )));
        }

        let id = record.texture.id();
        if let Some(position) = self.pending.iter().position(|p| p.texture.id() == id) {
            let pending = &mut self.pending[position];
            debug_assert_eq!(pending.after, record.before);
            pending.after = record.after;
            if pending.before == pending.after {
                self.pending.remove(position);
            }
        } else {
            self.pending.push(record);
        }
        Ok(())
    }

    /// Move pending transitions into the command stream.
    pub fn flush_transitions(&mut self) {
        for record in self.pending.drain(..) {
            log::trace!("Recorded {record:?}");
            self.commands.push(RecordedCommand::Transition(record));
        }
    }

    /// Begin a render pass. Pending transitions are flushed first.
    pub fn begin_rendering(
        &mut self,
        label: &str,
        color: Option<ColorAttachment>,
        depth: Option<DepthAttachment>,
        extent: Extent2d,
    ) -> Result<(), FrameError> {
        if self.in_pass {
            return Err(FrameError::contract(format!(
                "render pass '{label}' begun inside another render pass"
            )));
        }
        if color.is_none() && depth.is_none() {
            return Err(FrameError::InvalidParameter(format!(
                "render pass '{label}' has no attachments"
            )));
        }

        self.flush_transitions();
        self.commands.push(RecordedCommand::BeginRendering {
            label: label.to_string(),
            color,
            depth,
            extent,
        });
        self.in_pass = true;
        self.pipeline_bound = false;
        Ok(())
    }

    /// End the current render pass.
    pub fn end_rendering(&mut self) -> Result<(), FrameError> {
        if !self.in_pass {
            return Err(FrameError::contract("end_rendering without a render pass"));
        }
        self.commands.push(RecordedCommand::EndRendering);
        self.in_pass = false;
        Ok(())
    }

    /// Set the viewport.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(RecordedCommand::SetViewport(viewport));
    }

    /// Set the scissor rectangle.
    pub fn set_scissor(&mut self, scissor: ScissorRect) {
        self.commands.push(RecordedCommand::SetScissor(scissor));
    }

    /// Bind a pipeline for subsequent draws.
    pub fn bind_pipeline(&mut self, pipeline: &Arc<GpuPipeline>) {
        self.commands
            .push(RecordedCommand::BindPipeline(Arc::clone(pipeline)));
        self.pipeline_bound = true;
    }

    /// Bind sampled inputs for the bound pipeline.
    pub fn bind_inputs(&mut self, color: ViewHandle, depth: Option<ViewHandle>) {
        self.commands
            .push(RecordedCommand::BindInputs { color, depth });
    }

    /// Upload push constants for the bound pipeline.
    pub fn push_constants(&mut self, data: &[u8]) {
        self.commands.push(RecordedCommand::PushConstants(data.to_vec()));
    }

    /// Record a draw. Must be inside a render pass with a bound pipeline.
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> Result<(), FrameError> {
        if !self.in_pass {
            return Err(FrameError::contract("draw recorded outside a render pass"));
        }
        if !self.pipeline_bound {
            return Err(FrameError::contract("draw recorded without a bound pipeline"));
        }
        self.commands.push(RecordedCommand::Draw {
            vertex_count,
            instance_count,
        });
        Ok(())
    }

    /// Flush pending transitions and validate that the stream is complete.
    pub(crate) fn close(&mut self) -> Result<(), FrameError> {
        if self.in_pass {
            return Err(FrameError::contract(
                "command recorder closed inside a render pass",
            ));
        }
        self.flush_transitions();
        Ok(())
    }

    /// Recorded commands (pending transitions excluded).
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Number of transitions recorded so far, pending ones included.
    pub fn transition_count(&self) -> usize {
        self.pending.len()
            + self
                .commands
                .iter()
                .filter(|c| matches!(c, RecordedCommand::Transition(_)))
                .count()
    }

    /// Number of draws recorded so far.
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::Draw { .. }))
            .count()
    }

    /// Whether nothing at all has been recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.pending.is_empty()
    }

    /// Whether a render pass is open.
    pub fn in_render_pass(&self) -> bool {
        self.in_pass
    }
}

impl Default for CommandRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("commands", &self.commands.len())
            .field("pending_transitions", &self.pending.len())
            .field("in_pass", &self.in_pass)
            .finish()
    }
}

/// Lifecycle state of one frame slot's recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Open for recording.
    Recording,
    /// Closed, waiting to be submitted.
    Submittable,
    /// Submitted; the GPU may still be reading it.
    InFlight {
        /// Fence value signalled when the submission retires.
        fence_value: u64,
    },
    /// Confirmed finished by the GPU; free to reset.
    Retired,
}

struct FrameSlot {
    recorder: CommandRecorder,
    state: RecorderState,
}

/// Per-frame command recording and submission.
pub struct CommandSubmissionPipeline {
    backend: Arc<dyn GpuBackend>,
    synchronizer: FrameSynchronizer,
    slots: Vec<FrameSlot>,
    current: usize,
    frame_count: u64,
}

impl CommandSubmissionPipeline {
    /// Create a pipeline with `frames_in_flight` recorder slots.
    pub fn new(device: &GraphicsDevice, frames_in_flight: usize) -> Result<Self, FrameError> {
        if frames_in_flight == 0 || frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(FrameError::InvalidParameter(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {frames_in_flight}"
            )));
        }

        let backend = Arc::clone(device.backend());
        let synchronizer = FrameSynchronizer::new(Arc::clone(&backend))?;
        let slots = (0..frames_in_flight)
            .map(|_| FrameSlot {
                recorder: CommandRecorder::new(),
                state: RecorderState::Retired,
            })
            .collect();

        log::debug!("Created command submission pipeline with {frames_in_flight} frame(s) in flight");

        Ok(Self {
            backend,
            synchronizer,
            slots,
            current: 0,
            frame_count: 0,
        })
    }

    /// Number of recorder slots.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Number of frames submitted so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Index of the slot the next (or current) frame uses.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// State of the current slot's recorder.
    pub fn state(&self) -> RecorderState {
        self.slots[self.current].state
    }

    /// Whether a frame is open for recording.
    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Recording
    }

    /// The frame fence.
    pub fn synchronizer(&self) -> &FrameSynchronizer {
        &self.synchronizer
    }

    /// Start a frame and return its recorder.
    ///
    /// Waits for the slot's previous submission to retire before resetting
    /// the recorder.
    pub fn begin_frame(&mut self) -> Result<&mut CommandRecorder, FrameError> {
        let slot = &mut self.slots[self.current];
        match slot.state {
            RecorderState::Recording | RecorderState::Submittable => {
                return Err(FrameError::contract(format!(
                    "begin_frame called while frame {} is still open",
                    self.frame_count
                )));
            }
            RecorderState::InFlight { fence_value } => {
                self.synchronizer.wait_until_retired(fence_value)?;
            }
            RecorderState::Retired => {}
        }

        slot.recorder.reset();
        slot.state = RecorderState::Recording;
        log::trace!(
            "Frame {} begun on slot {}",
            self.frame_count,
            self.current
        );
        Ok(&mut slot.recorder)
    }

    /// The open frame's recorder.
    pub fn recorder(&mut self) -> Result<&mut CommandRecorder, FrameError> {
        let slot = &mut self.slots[self.current];
        if slot.state != RecorderState::Recording {
            return Err(FrameError::contract(format!(
                "recording while the frame slot is {:?}",
                slot.state
            )));
        }
        Ok(&mut slot.recorder)
    }

    /// Discard the open frame without submitting it.
    ///
    /// Only allowed while nothing has been recorded: recorded transitions
    /// have already advanced the tracked state of their resources.
    pub fn abandon_frame(&mut self) -> Result<(), FrameError> {
        let slot = &mut self.slots[self.current];
        if slot.state != RecorderState::Recording {
            return Err(FrameError::contract(format!(
                "abandon_frame called while the frame slot is {:?}",
                slot.state
            )));
        }
        if !slot.recorder.is_empty() {
            return Err(FrameError::contract(
                "abandon_frame called after commands were recorded",
            ));
        }
        slot.state = RecorderState::Retired;
        log::debug!("Frame {} abandoned", self.frame_count);
        Ok(())
    }

    /// Drop an open frame whatever it has recorded.
    ///
    /// Returns the tracked state of every texture before the frame touched
    /// it, so owners can rewind their [`GpuResource`](crate::resource::GpuResource)s,
    /// or `None` when no unsubmitted frame was open.
    pub(crate) fn discard_frame(&mut self) -> Option<StateSnapshot> {
        let slot = &mut self.slots[self.current];
        if !matches!(
            slot.state,
            RecorderState::Recording | RecorderState::Submittable
        ) {
            return None;
        }
        let snapshot = slot.recorder.initial_states();
        slot.recorder.reset();
        slot.state = RecorderState::Retired;
        log::debug!(
            "Frame {} discarded on slot {} ({} textures rewound)",
            self.frame_count,
            self.current,
            snapshot.len()
        );
        Some(snapshot)
    }

    /// Close, submit, signal, present and pace the open frame.
    ///
    /// Returns the fence value signalled for this frame.
    pub fn end_frame(
        &mut self,
        mut surface: Option<&mut PresentationSurface>,
    ) -> Result<u64, FrameError> {
        let slot_index = self.current;
        let slot = &mut self.slots[slot_index];
        if slot.state != RecorderState::Recording {
            return Err(FrameError::contract(format!(
                "end_frame called without a matching begin_frame (slot is {:?})",
                slot.state
            )));
        }
        if let Some(surface) = surface.as_deref()
            && !surface.is_ready_to_present()
        {
            return Err(FrameError::contract(
                "end_frame called before the surface target was released to presentable",
            ));
        }

        slot.recorder.close()?;
        slot.state = RecorderState::Submittable;

        self.backend.submit(Submission {
            frame_slot: slot_index,
            commands: slot.recorder.commands(),
            swapchain: surface.as_deref_mut().map(PresentationSurface::swapchain_mut),
        })?;
        let fence_value = match self.synchronizer.signal() {
            Ok(value) => value,
            Err(e) => {
                // The commands are on the queue; there is nothing to rewind.
                slot.recorder.reset();
                slot.state = RecorderState::Retired;
                return Err(e);
            }
        };
        slot.state = RecorderState::InFlight { fence_value };

        log::trace!(
            "Frame {} submitted on slot {} ({} commands, fence {})",
            self.frame_count,
            slot_index,
            slot.recorder.commands().len(),
            fence_value
        );

        self.frame_count += 1;
        self.current = (self.current + 1) % self.slots.len();

        if let Some(surface) = surface {
            surface.present()?;
        }

        let lag = self.slots.len() as u64 - 1;
        if fence_value > lag {
            self.synchronizer.wait_until_retired(fence_value - lag)?;
        }
        self.mark_retired()?;

        Ok(fence_value)
    }

    /// Wait for every submitted frame to retire.
    pub fn wait_idle(&mut self) -> Result<(), FrameError> {
        self.synchronizer.wait_idle()?;
        self.mark_retired()
    }

    fn mark_retired(&mut self) -> Result<(), FrameError> {
        let completed = self.synchronizer.completed_value()?;
        for slot in &mut self.slots {
            if let RecorderState::InFlight { fence_value } = slot.state
                && fence_value <= completed
            {
                slot.state = RecorderState::Retired;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CommandSubmissionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSubmissionPipeline")
            .field("frames_in_flight", &self.slots.len())
            .field("current", &self.current)
            .field("frame_count", &self.frame_count)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for CommandSubmissionPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.synchronizer.wait_idle() {
            log::warn!("Failed to wait for in-flight frames on shutdown: {e}");
        }
    }
}
