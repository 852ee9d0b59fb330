//! Processing back ends.
//!
//! A back end owns the current image, selection and settings, and runs the
//! three-stage pipeline (L-R sharpening → unsharp masking → tone curve)
//! incrementally: a request re-runs the requested stage and everything
//! downstream, re-executing invalid upstream outputs first.
//!
//! Back ends are pumped with [`ProcessingBackend::step`]: the CPU back end
//! drains its worker-thread events, the GPU back end issues the next
//! command batch. `step` returns [`StepResult::Done`] exactly once per
//! scheduled run, with the completion status.

pub mod cpu;

cfg_if::cfg_if! {
    if #[cfg(feature = "gpu")] {
        pub mod gpu;
    }
}

use crate::error::Result;
use crate::image::{Image, Rect};
use crate::processing::{CompletionStatus, ProcessingRequest, ProcessingSettings};
use crate::progress::SharedProgress;

/// Outcome of one pump step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// No run is active.
    Idle,
    /// A run is active; call `step` again.
    Busy,
    /// The active run just finished; delivered exactly once per run.
    Done(CompletionStatus),
}

pub trait ProcessingBackend {
    /// Sets the image to process (`Mono32f` or `Rgb32f`); resets the
    /// selection to the full image and invalidates all outputs.
    fn set_image(&mut self, img: Image) -> Result<()>;

    /// Sets the selection rectangle (clamped to the image); invalidates
    /// all outputs.
    fn set_selection(&mut self, selection: Rect) -> Result<()>;

    /// Replaces the settings snapshot, invalidating only the stages whose
    /// parameters changed.
    fn set_settings(&mut self, settings: ProcessingSettings);

    /// Schedules a pipeline run. If a run is in flight it is asked to
    /// finish as soon as possible and the new request starts right after.
    fn start(&mut self, request: ProcessingRequest) -> Result<()>;

    /// Pumps the back end.
    fn step(&mut self) -> StepResult;

    /// Requests cooperative cancellation of the active run.
    fn abort(&mut self);

    fn is_processing(&self) -> bool;

    fn set_progress_sink(&mut self, sink: SharedProgress);

    /// Blocks until outputs are available (running the pipeline if
    /// needed), applies precise tone curve values, and returns the
    /// processed selection.
    fn processed_output(&mut self) -> Result<Image>;
}

/// Pumps `backend` until the active run completes.
pub fn run_to_completion(backend: &mut dyn ProcessingBackend) -> CompletionStatus {
    loop {
        match backend.step() {
            StepResult::Busy => {}
            StepResult::Done(status) => return status,
            StepResult::Idle => return CompletionStatus::Completed,
        }
    }
}
