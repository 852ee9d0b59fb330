//! CPU back end: one worker thread per pipeline stage, data-parallel rows
//! inside each stage via rayon.
//!
//! The scheduler keeps at most one worker in flight. Events carry a rising
//! task id; anything tagged with an older id is dropped. Scheduling a new
//! request while a worker runs sets the abort flag and stashes the request,
//! which starts as soon as the worker is reaped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};

use super::{ProcessingBackend, StepResult};
use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat, Rect};
use crate::processing::deconvolution::{
    blur_threshold_vicinity, clamp_unit, lucy_richardson_gaussian,
};
use crate::processing::settings::{DERINGING_BRIGHTNESS_THRESHOLD, MAX_GAUSSIAN_SIGMA};
use crate::processing::unsharp::{apply_unsharp_mask, steering_signal};
use crate::processing::{CompletionStatus, ProcessingRequest, ProcessingSettings, ToneCurve};
use crate::math::convolution::ConvolutionMethod;
use crate::progress::{noop_progress, SharedProgress};

/// Selection-sized float planes, one per channel (1 for mono, 3 for RGB).
type Planes = Vec<Vec<f32>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Sharpening,
    UnsharpMasking(usize),
    ToneCurve,
}

impl Stage {
    fn label(self) -> &'static str {
        match self {
            Stage::Sharpening => "Lucy\u{2013}Richardson deconvolution",
            Stage::UnsharpMasking(_) => "Unsharp masking",
            Stage::ToneCurve => "Applying tone curve",
        }
    }
}

enum WorkerEvent {
    Progress { percent: u32 },
    Finished { status: CompletionStatus, outputs: Planes },
}

struct Worker {
    join: Option<JoinHandle<()>>,
    abort: Arc<AtomicBool>,
    task_id: u64,
    stage: Stage,
}

#[derive(Default)]
struct StageOutput {
    planes: Planes,
    valid: bool,
}

#[derive(Default)]
struct Outputs {
    sharpening: StageOutput,
    unsharp: Vec<StageOutput>,
    tone: StageOutput,
    precise_values_applied: bool,
}

pub struct CpuProcessing {
    /// Mono32f channel images covering the full input (1 or 3 entries).
    channels: Vec<Image>,
    /// Mono rendition of the full input (steering source for adaptive
    /// unsharp masking).
    img_mono: Option<Image>,
    selection: Rect,
    settings: ProcessingSettings,
    output: Outputs,
    /// Blurred mono luminance of the current selection; rebuilt when the
    /// image or selection changes, not on settings changes.
    steering: Option<Arc<Vec<f32>>>,
    worker: Option<Worker>,
    current_task_id: u64,
    /// Request to start once the running worker is reaped.
    scheduled: Option<ProcessingRequest>,
    run_active: bool,
    pending_done: Option<CompletionStatus>,
    use_precise_tone_curve: bool,
    events_tx: Sender<(u64, WorkerEvent)>,
    events_rx: Receiver<(u64, WorkerEvent)>,
    progress: SharedProgress,
}

impl Default for CpuProcessing {
    fn default() -> Self {
        Self::new()
    }
}

// Rayon pool sized once for the whole process; one core is left for the
// thread pumping step().
static INIT_THREAD_POOL: std::sync::Once = std::sync::Once::new();

fn init_thread_pool() {
    INIT_THREAD_POOL.call_once(|| {
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads((num_cpus::get() - 1).max(1))
            .build_global();
    });
}

impl CpuProcessing {
    pub fn new() -> CpuProcessing {
        init_thread_pool();
        let (events_tx, events_rx) = unbounded();
        CpuProcessing {
            channels: Vec::new(),
            img_mono: None,
            selection: Rect::new(0, 0, 0, 0),
            settings: ProcessingSettings::new(),
            output: Outputs::default(),
            steering: None,
            worker: None,
            current_task_id: 0,
            scheduled: None,
            run_active: false,
            pending_done: None,
            use_precise_tone_curve: false,
            events_tx,
            events_rx,
            progress: noop_progress(),
        }
    }

    /// Precise tone-curve evaluation in the workers themselves (used by
    /// the non-interactive `process_image` path).
    pub fn set_use_precise_tone_curve(&mut self, enabled: bool) {
        self.use_precise_tone_curve = enabled;
    }

    fn selection_plane(&self, channel: &Image) -> Vec<f32> {
        let mut plane =
            Vec::with_capacity(self.selection.width as usize * self.selection.height as usize);
        for y in 0..self.selection.height {
            let row = channel.row_as::<f32>(self.selection.y as u32 + y);
            plane.extend_from_slice(
                &row[self.selection.x as usize
                    ..self.selection.x as usize + self.selection.width as usize],
            );
        }
        plane
    }

    fn invalidate_all(&mut self) {
        self.output.sharpening.valid = false;
        for um in self.output.unsharp.iter_mut() {
            um.valid = false;
        }
        self.output.tone.valid = false;
        self.output.precise_values_applied = false;
    }

    fn ensure_unsharp_slots(&mut self) {
        let n = self.settings.unsharp_masks.len();
        if self.output.unsharp.len() != n {
            // keep the prefix; new slots start out invalid
            self.output.unsharp.resize_with(n, StageOutput::default);
        }
    }

    fn ensure_steering(&mut self) -> Arc<Vec<f32>> {
        if self.steering.is_none() {
            let mono = self.img_mono.as_ref().expect("image must be set");
            let plane = self.selection_plane(mono);
            let blurred = steering_signal(
                &plane,
                self.selection.width as usize,
                self.selection.height as usize,
            );
            self.steering = Some(Arc::new(blurred));
        }
        self.steering.as_ref().unwrap().clone()
    }

    fn is_worker_running(&self) -> bool {
        self.worker.as_ref().map(|w| w.join.is_some()).unwrap_or(false)
    }

    /// Escalates a request to the first stage whose input is invalid.
    fn effective_request(&self, request: ProcessingRequest) -> ProcessingRequest {
        let first_invalid_mask = |up_to: usize| -> Option<usize> {
            (0..up_to.min(self.output.unsharp.len())).find(|&k| !self.output.unsharp[k].valid)
        };

        let request = match request {
            ProcessingRequest::ToneCurve => {
                match first_invalid_mask(self.settings.unsharp_masks.len()) {
                    Some(k) => ProcessingRequest::UnsharpMasking { mask_idx: k },
                    None => return ProcessingRequest::ToneCurve,
                }
            }
            other => other,
        };

        match request {
            ProcessingRequest::UnsharpMasking { mask_idx } => {
                let mask_idx = first_invalid_mask(mask_idx).unwrap_or(mask_idx);
                if !self.output.sharpening.valid {
                    ProcessingRequest::Sharpening
                } else {
                    ProcessingRequest::UnsharpMasking { mask_idx }
                }
            }
            other => other,
        }
    }

    fn stage_of(request: ProcessingRequest) -> Stage {
        match request {
            ProcessingRequest::Sharpening => Stage::Sharpening,
            ProcessingRequest::UnsharpMasking { mask_idx } => Stage::UnsharpMasking(mask_idx),
            ProcessingRequest::ToneCurve => Stage::ToneCurve,
        }
    }

    fn next_stage(&self, stage: Stage) -> Option<Stage> {
        match stage {
            Stage::Sharpening => Some(Stage::UnsharpMasking(0)),
            Stage::UnsharpMasking(i) => {
                if i + 1 < self.settings.unsharp_masks.len() {
                    Some(Stage::UnsharpMasking(i + 1))
                } else {
                    Some(Stage::ToneCurve)
                }
            }
            Stage::ToneCurve => None,
        }
    }

    fn begin_run(&mut self, request: ProcessingRequest) {
        debug_assert!(!self.is_worker_running());
        self.run_active = true;
        self.current_task_id += 1;
        self.ensure_unsharp_slots();
        let stage = Self::stage_of(self.effective_request(request));
        self.advance_from(stage);
    }

    // Runs stages starting at `stage`: short-circuit stages complete
    // inline, the first real one gets a worker. Ends the run when the
    // chain is exhausted.
    fn advance_from(&mut self, mut stage: Stage) {
        loop {
            match self.start_stage(stage) {
                StageStart::WorkerSpawned => return,
                StageStart::CompletedInline => match self.next_stage(stage) {
                    Some(next) => stage = next,
                    None => {
                        self.finish_run(CompletionStatus::Completed);
                        return;
                    }
                },
            }
        }
    }

    fn finish_run(&mut self, status: CompletionStatus) {
        debug!("pipeline run finished: {status:?}");
        self.run_active = false;
        self.pending_done = Some(status);
        self.progress.finish(Some("Idle"));
    }

    fn start_stage(&mut self, stage: Stage) -> StageStart {
        match stage {
            Stage::Sharpening => self.start_sharpening(),
            Stage::UnsharpMasking(idx) => self.start_unsharp(idx),
            Stage::ToneCurve => self.start_tone_curve(),
        }
    }

    fn start_sharpening(&mut self) -> StageStart {
        self.invalidate_all();

        let inputs: Planes =
            self.channels.iter().map(|ch| self.selection_plane(ch)).collect();

        let lr = self.settings.lucy_richardson;
        if lr.iterations == 0 {
            debug!("sharpening disabled, no work needed");
            self.output.sharpening.planes = inputs;
            self.output.sharpening.valid = true;
            return StageStart::CompletedInline;
        }

        let width = self.selection.width as usize;
        let height = self.selection.height as usize;
        let abort = Arc::new(AtomicBool::new(false));
        let tx = self.events_tx.clone();
        let task_id = self.current_task_id;
        self.progress.set(0.0, Some("Lucy\u{2013}Richardson deconvolution: 0%"));

        let join = std::thread::spawn({
            let abort = abort.clone();
            move || {
                let num_channels = inputs.len();
                let mut outputs: Planes =
                    inputs.iter().map(|p| vec![0.0f32; p.len()]).collect();

                // deringing replaces the input with its blurred-vicinity
                // version before deconvolution
                let actual_inputs: Planes = if lr.deringing {
                    let mut mask = vec![0u8; width * height];
                    inputs
                        .iter()
                        .map(|plane| {
                            let mut preprocessed = vec![0.0f32; plane.len()];
                            blur_threshold_vicinity(
                                plane,
                                &mut preprocessed,
                                &mut mask,
                                width,
                                height,
                                DERINGING_BRIGHTNESS_THRESHOLD,
                                lr.sigma,
                            );
                            preprocessed
                        })
                        .collect()
                } else {
                    inputs
                };

                let mut last_reported = 0u32;
                let mut aborted = false;
                for (ch, (input, output)) in
                    actual_inputs.iter().zip(outputs.iter_mut()).enumerate()
                {
                    lucy_richardson_gaussian(
                        input,
                        output,
                        width,
                        height,
                        lr.iterations,
                        lr.sigma,
                        ConvolutionMethod::Auto,
                        |done, total| {
                            let percent = 100 * (ch as u32 * total + done)
                                / (total * num_channels as u32);
                            // report in >= 5 percentage point steps
                            if percent >= last_reported + 5 {
                                last_reported = percent;
                                let _ = tx.send((task_id, WorkerEvent::Progress { percent }));
                            }
                        },
                        || abort.load(Ordering::Relaxed),
                    );
                    if abort.load(Ordering::Relaxed) {
                        aborted = true;
                        break;
                    }
                }

                for output in outputs.iter_mut() {
                    clamp_unit(output);
                }

                let status = if aborted {
                    CompletionStatus::Aborted
                } else {
                    CompletionStatus::Completed
                };
                let _ = tx.send((task_id, WorkerEvent::Finished { status, outputs }));
            }
        });

        self.worker = Some(Worker {
            join: Some(join),
            abort,
            task_id,
            stage: Stage::Sharpening,
        });
        StageStart::WorkerSpawned
    }

    fn start_unsharp(&mut self, idx: usize) -> StageStart {
        for k in idx..self.output.unsharp.len() {
            self.output.unsharp[k].valid = false;
        }
        self.output.tone.valid = false;
        self.output.precise_values_applied = false;

        let mask = self.settings.unsharp_masks[idx];
        if mask.sigma <= 0.0 || mask.sigma > MAX_GAUSSIAN_SIGMA {
            warn!("unsharp mask {idx} has out-of-range sigma {}", mask.sigma);
        }

        let inputs: Planes = if idx == 0 {
            self.output.sharpening.planes.clone()
        } else {
            self.output.unsharp[idx - 1].planes.clone()
        };

        if !mask.is_effective() {
            debug!("unsharp mask {idx} is ineffective, no work needed");
            self.output.unsharp[idx].planes = inputs;
            self.output.unsharp[idx].valid = true;
            return StageStart::CompletedInline;
        }

        let steering = if mask.adaptive { Some(self.ensure_steering()) } else { None };

        let width = self.selection.width as usize;
        let height = self.selection.height as usize;
        let abort = Arc::new(AtomicBool::new(false));
        let tx = self.events_tx.clone();
        let task_id = self.current_task_id;
        self.progress.set(0.0, Some("Unsharp masking..."));

        let join = std::thread::spawn({
            let abort = abort.clone();
            move || {
                let mut outputs: Planes =
                    inputs.iter().map(|p| vec![0.0f32; p.len()]).collect();
                let mut aborted = false;
                for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
                    if abort.load(Ordering::Relaxed) {
                        aborted = true;
                        break;
                    }
                    apply_unsharp_mask(
                        &mask,
                        input,
                        output,
                        width,
                        height,
                        steering.as_deref().map(|s| s.as_slice()),
                    );
                }
                let status = if aborted {
                    CompletionStatus::Aborted
                } else {
                    CompletionStatus::Completed
                };
                let _ = tx.send((task_id, WorkerEvent::Finished { status, outputs }));
            }
        });

        self.worker = Some(Worker {
            join: Some(join),
            abort,
            task_id,
            stage: Stage::UnsharpMasking(idx),
        });
        StageStart::WorkerSpawned
    }

    fn start_tone_curve(&mut self) -> StageStart {
        self.output.tone.valid = false;
        self.output.precise_values_applied = false;

        let last_unsharp = self
            .output
            .unsharp
            .last()
            .expect("unsharp outputs exist before the tone curve stage");
        let inputs: Planes = last_unsharp.planes.clone();

        if self.settings.tone_curve.is_identity() {
            debug!("tone curve is an identity map, no work needed");
            self.output.tone.planes = inputs;
            self.output.tone.valid = true;
            self.output.precise_values_applied = true;
            return StageStart::CompletedInline;
        }

        let precise = self.use_precise_tone_curve;
        if !precise && !self.settings.tone_curve.has_lut() {
            self.settings.tone_curve.refresh_lut();
        }
        let curve: ToneCurve = self.settings.tone_curve.clone();

        let abort = Arc::new(AtomicBool::new(false));
        let tx = self.events_tx.clone();
        let task_id = self.current_task_id;
        self.progress.set(0.0, Some("Applying tone curve: 0%"));

        let join = std::thread::spawn({
            let abort = abort.clone();
            move || {
                let mut outputs: Planes =
                    inputs.iter().map(|p| vec![0.0f32; p.len()]).collect();
                let mut aborted = false;
                for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
                    if abort.load(Ordering::Relaxed) {
                        aborted = true;
                        break;
                    }
                    curve.apply(input, output, precise);
                }
                let status = if aborted {
                    CompletionStatus::Aborted
                } else {
                    CompletionStatus::Completed
                };
                let _ = tx.send((task_id, WorkerEvent::Finished { status, outputs }));
            }
        });

        self.worker = Some(Worker {
            join: Some(join),
            abort,
            task_id,
            stage: Stage::ToneCurve,
        });
        StageStart::WorkerSpawned
    }

    fn reap_worker(&mut self) {
        if let Some(worker) = self.worker.as_mut() {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
        self.worker = None;
    }

    fn on_stage_finished(&mut self, stage: Stage, status: CompletionStatus, outputs: Planes) {
        self.reap_worker();

        if status == CompletionStatus::Aborted {
            debug!("stage {stage:?} aborted");
            self.finish_run(CompletionStatus::Aborted);
            return;
        }

        match stage {
            Stage::Sharpening => {
                self.output.sharpening.planes = outputs;
                self.output.sharpening.valid = true;
            }
            Stage::UnsharpMasking(i) => {
                self.output.unsharp[i].planes = outputs;
                self.output.unsharp[i].valid = true;
            }
            Stage::ToneCurve => {
                self.output.tone.planes = outputs;
                self.output.tone.valid = true;
                self.output.precise_values_applied = self.use_precise_tone_curve;
            }
        }

        // a request arrived while this stage ran: end this run here (its
        // remaining stages are superseded) and let step() start the new one
        if self.scheduled.is_some() {
            self.finish_run(CompletionStatus::Aborted);
            return;
        }

        match self.next_stage(stage) {
            Some(next) => self.advance_from(next),
            None => self.finish_run(CompletionStatus::Completed),
        }
    }

    fn handle_event(&mut self, task_id: u64, event: WorkerEvent) {
        if task_id != self.current_task_id {
            debug!("dropping outdated event from task {task_id}");
            return;
        }
        match event {
            WorkerEvent::Progress { percent } => {
                if let Some(worker) = &self.worker {
                    let label = worker.stage.label();
                    self.progress
                        .set(percent as f32 / 100.0, Some(&format!("{label}: {percent}%")));
                }
            }
            WorkerEvent::Finished { status, outputs } => {
                let stage = self.worker.as_ref().map(|w| w.stage);
                if let Some(stage) = stage {
                    self.on_stage_finished(stage, status, outputs);
                }
            }
        }
    }

    fn apply_precise_tone_curve(&mut self) {
        if self.output.precise_values_applied {
            return;
        }

        self.ensure_unsharp_slots();

        // make sure there is an unsharp-masking output to read from
        if self.output.unsharp.last().map(|o| !o.valid).unwrap_or(true) {
            let inputs: Planes =
                self.channels.iter().map(|ch| self.selection_plane(ch)).collect();
            if let Some(last) = self.output.unsharp.last_mut() {
                last.planes = inputs;
            }
        }

        let src = &self.output.unsharp.last().unwrap().planes;
        let curve = &self.settings.tone_curve;
        let tone: Planes = src
            .iter()
            .map(|plane| {
                let mut out = vec![0.0f32; plane.len()];
                curve.apply(plane, &mut out, true);
                out
            })
            .collect();

        self.output.tone.planes = tone;
        self.output.tone.valid = true;
        self.output.precise_values_applied = true;
    }

    fn planes_to_image(&self) -> Result<Image> {
        let width = self.selection.width;
        let height = self.selection.height;
        let planes = &self.output.tone.planes;

        let plane_to_image = |plane: &Vec<f32>| -> Image {
            let mut img = Image::new(width, height, PixelFormat::Mono32f);
            for y in 0..height {
                img.row_as_mut::<f32>(y).copy_from_slice(
                    &plane[y as usize * width as usize..(y as usize + 1) * width as usize],
                );
            }
            img
        };

        match planes.len() {
            1 => Ok(plane_to_image(&planes[0])),
            3 => {
                let r = plane_to_image(&planes[0]);
                let g = plane_to_image(&planes[1]);
                let b = plane_to_image(&planes[2]);
                Image::combine_rgb(&r, &g, &b)
            }
            n => Err(Error::Internal(format!("unexpected channel count: {n}"))),
        }
    }
}

enum StageStart {
    WorkerSpawned,
    CompletedInline,
}

impl ProcessingBackend for CpuProcessing {
    fn set_image(&mut self, img: Image) -> Result<()> {
        match img.pixel_format() {
            PixelFormat::Mono32f => {
                self.img_mono = Some(img.clone());
                self.channels = vec![img];
            }
            PixelFormat::Rgb32f => {
                self.img_mono = Some(img.convert_pixel_format(PixelFormat::Mono32f)?);
                let (r, g, b) = img.split_rgb()?;
                self.channels = vec![r, g, b];
            }
            other => {
                return Err(Error::invalid_arg(format!(
                    "back end requires MONO32F or RGB32F input, got {other:?}"
                )))
            }
        }
        self.selection = self.channels[0].rect();
        self.steering = None;
        self.invalidate_all();
        Ok(())
    }

    fn set_selection(&mut self, selection: Rect) -> Result<()> {
        if self.channels.is_empty() {
            return Err(Error::invalid_arg("set an image before the selection"));
        }
        let clamped = selection.clamped(&self.channels[0].rect());
        if clamped.width == 0 || clamped.height == 0 {
            return Err(Error::invalid_arg("selection lies outside the image"));
        }
        self.selection = clamped;
        self.steering = None;
        self.invalidate_all();
        Ok(())
    }

    fn set_settings(&mut self, settings: ProcessingSettings) {
        let old = std::mem::replace(&mut self.settings, settings);

        if old.lucy_richardson != self.settings.lucy_richardson {
            self.invalidate_all();
        }

        self.ensure_unsharp_slots();
        let changed_mask = old
            .unsharp_masks
            .iter()
            .zip(self.settings.unsharp_masks.iter())
            .position(|(a, b)| a != b)
            .or_else(|| {
                (old.unsharp_masks.len() != self.settings.unsharp_masks.len())
                    .then(|| old.unsharp_masks.len().min(self.settings.unsharp_masks.len()))
            });
        if let Some(i) = changed_mask {
            for k in i..self.output.unsharp.len() {
                self.output.unsharp[k].valid = false;
            }
            self.output.tone.valid = false;
            self.output.precise_values_applied = false;
        }

        let tone_changed = {
            let a = &old.tone_curve;
            let b = &self.settings.tone_curve;
            a.points() != b.points()
                || a.is_smooth() != b.is_smooth()
                || a.is_gamma_mode() != b.is_gamma_mode()
                || a.gamma() != b.gamma()
        };
        if tone_changed {
            self.output.tone.valid = false;
            self.output.precise_values_applied = false;
        }
    }

    fn start(&mut self, request: ProcessingRequest) -> Result<()> {
        if self.channels.is_empty() {
            return Err(Error::invalid_arg("set an image before starting processing"));
        }
        if self.settings.unsharp_masks.is_empty() {
            return Err(Error::invalid_arg("settings must define at least one unsharp mask"));
        }

        if self.is_worker_running() {
            debug!("a worker is running; aborting it and queueing {request:?}");
            if let Some(worker) = &self.worker {
                worker.abort.store(true, Ordering::Relaxed);
            }
            self.scheduled = Some(request);
        } else {
            self.begin_run(request);
        }
        Ok(())
    }

    fn step(&mut self) -> StepResult {
        // block briefly while a worker is active so pump loops do not spin
        if self.is_worker_running() {
            if let Ok((task_id, event)) = self.events_rx.recv_timeout(Duration::from_millis(10)) {
                self.handle_event(task_id, event);
            }
        }
        while let Ok((task_id, event)) = self.events_rx.try_recv() {
            self.handle_event(task_id, event);
        }

        if let Some(status) = self.pending_done.take() {
            return StepResult::Done(status);
        }
        if self.run_active {
            return StepResult::Busy;
        }
        if let Some(request) = self.scheduled.take() {
            self.begin_run(request);
            return StepResult::Busy;
        }
        StepResult::Idle
    }

    fn abort(&mut self) {
        if !self.run_active {
            return;
        }
        debug!("abort requested");
        self.scheduled = None;
        let stage = self.worker.as_ref().map(|w| w.stage);
        if let Some(worker) = &self.worker {
            worker.abort.store(true, Ordering::Relaxed);
        }
        self.reap_worker();

        // keep the stage's work if it finished before seeing the flag
        while let Ok((task_id, event)) = self.events_rx.try_recv() {
            if task_id != self.current_task_id {
                continue;
            }
            if let (
                WorkerEvent::Finished { status: CompletionStatus::Completed, outputs },
                Some(stage),
            ) = (event, stage)
            {
                match stage {
                    Stage::Sharpening => {
                        self.output.sharpening.planes = outputs;
                        self.output.sharpening.valid = true;
                    }
                    Stage::UnsharpMasking(i) => {
                        self.output.unsharp[i].planes = outputs;
                        self.output.unsharp[i].valid = true;
                    }
                    Stage::ToneCurve => {
                        self.output.tone.planes = outputs;
                        self.output.tone.valid = true;
                        self.output.precise_values_applied = self.use_precise_tone_curve;
                    }
                }
            }
        }
        self.finish_run(CompletionStatus::Aborted);
    }

    fn is_processing(&self) -> bool {
        self.run_active
    }

    fn set_progress_sink(&mut self, sink: SharedProgress) {
        self.progress = sink;
    }

    fn processed_output(&mut self) -> Result<Image> {
        // finish in-flight and queued work first
        loop {
            match self.step() {
                StepResult::Busy | StepResult::Done(_) => {}
                StepResult::Idle => break,
            }
        }

        if !self.output.tone.valid || !self.output.precise_values_applied {
            if !self.output.tone.valid {
                self.begin_run(ProcessingRequest::ToneCurve);
                loop {
                    match self.step() {
                        StepResult::Busy => {}
                        StepResult::Done(_) | StepResult::Idle => break,
                    }
                }
            }
            self.apply_precise_tone_curve();
        }

        self.planes_to_image()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::run_to_completion;
    use crate::processing::UnsharpMask;

    fn gradient_image(width: u32, height: u32) -> Image {
        let mut img = Image::new(width, height, PixelFormat::Mono32f);
        for y in 0..height {
            let row = img.row_as_mut::<f32>(y);
            for (x, v) in row.iter_mut().enumerate() {
                *v = ((x as u32 + y) % 64) as f32 / 64.0;
            }
        }
        img
    }

    fn identity_settings() -> ProcessingSettings {
        ProcessingSettings::new()
    }

    #[test]
    fn identity_pipeline_reproduces_input() {
        let img = gradient_image(100, 100);
        let expected = img.clone();

        let mut backend = CpuProcessing::new();
        backend.set_image(img).unwrap();
        backend.set_settings(identity_settings());
        backend.start(ProcessingRequest::Sharpening).unwrap();
        assert_eq!(run_to_completion(&mut backend), CompletionStatus::Completed);

        let out = backend.processed_output().unwrap();
        assert_eq!(out.pixel_format(), PixelFormat::Mono32f);
        for y in 0..out.height() {
            let a = out.row_as::<f32>(y);
            let b = expected.row_as::<f32>(y);
            for (va, vb) in a.iter().zip(b) {
                assert!((va - vb).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn rgb_pipeline_runs_per_channel() {
        let mut img = Image::new(32, 32, PixelFormat::Rgb32f);
        for y in 0..32 {
            let row = img.row_as_mut::<f32>(y);
            for x in 0..32usize {
                row[3 * x] = 0.2;
                row[3 * x + 1] = 0.5;
                row[3 * x + 2] = 0.8;
            }
        }

        let mut backend = CpuProcessing::new();
        backend.set_image(img).unwrap();
        backend.set_settings(identity_settings());
        backend.start(ProcessingRequest::Sharpening).unwrap();
        run_to_completion(&mut backend);

        let out = backend.processed_output().unwrap();
        assert_eq!(out.pixel_format(), PixelFormat::Rgb32f);
        let row = out.row_as::<f32>(16);
        assert!((row[3 * 16] - 0.2).abs() < 1e-6);
        assert!((row[3 * 16 + 1] - 0.5).abs() < 1e-6);
        assert!((row[3 * 16 + 2] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn tone_curve_request_skips_upstream_when_valid() {
        let img = gradient_image(64, 64);
        let mut backend = CpuProcessing::new();
        backend.set_image(img).unwrap();
        backend.set_settings(identity_settings());

        backend.start(ProcessingRequest::Sharpening).unwrap();
        run_to_completion(&mut backend);
        assert!(backend.output.sharpening.valid);

        // a tone-curve-only change must not invalidate sharpening
        let mut settings = identity_settings();
        settings.tone_curve.add_point(0.5, 0.6);
        backend.set_settings(settings);
        assert!(backend.output.sharpening.valid);
        assert!(!backend.output.tone.valid);

        backend.start(ProcessingRequest::ToneCurve).unwrap();
        run_to_completion(&mut backend);
        assert!(backend.output.tone.valid);
    }

    #[test]
    fn invalid_upstream_is_re_executed_first() {
        let img = gradient_image(64, 64);
        let mut backend = CpuProcessing::new();
        backend.set_image(img).unwrap();

        let mut settings = identity_settings();
        settings.tone_curve.add_point(0.5, 0.7);
        backend.set_settings(settings);

        // nothing computed yet: a ToneCurve request must run everything
        backend.start(ProcessingRequest::ToneCurve).unwrap();
        run_to_completion(&mut backend);
        assert!(backend.output.sharpening.valid);
        assert!(backend.output.unsharp.iter().all(|o| o.valid));
        assert!(backend.output.tone.valid);
    }

    #[test]
    fn lr_settings_change_invalidates_downstream() {
        let img = gradient_image(64, 64);
        let mut backend = CpuProcessing::new();
        backend.set_image(img).unwrap();
        backend.set_settings(identity_settings());
        backend.start(ProcessingRequest::Sharpening).unwrap();
        run_to_completion(&mut backend);

        let mut settings = identity_settings();
        settings.lucy_richardson.sigma = 2.0;
        settings.lucy_richardson.iterations = 3;
        backend.set_settings(settings);
        assert!(!backend.output.sharpening.valid);
        assert!(!backend.output.tone.valid);
    }

    #[test]
    fn cancellation_yields_single_aborted_completion() {
        let img = gradient_image(200, 200);
        let mut backend = CpuProcessing::new();
        backend.set_image(img).unwrap();

        let mut settings = identity_settings();
        settings.lucy_richardson.sigma = 2.0;
        settings.lucy_richardson.iterations = 500;
        backend.set_settings(settings);

        backend.start(ProcessingRequest::Sharpening).unwrap();
        assert!(backend.is_processing());
        backend.abort();

        let mut done_events = 0;
        for _ in 0..100 {
            match backend.step() {
                StepResult::Done(status) => {
                    assert_eq!(status, CompletionStatus::Aborted);
                    done_events += 1;
                }
                StepResult::Idle => break,
                StepResult::Busy => {}
            }
        }
        assert!(done_events <= 1);
        assert!(!backend.is_processing());
    }

    #[test]
    fn new_request_while_running_supersedes_the_run() {
        let img = gradient_image(200, 200);
        let mut backend = CpuProcessing::new();
        backend.set_image(img).unwrap();

        let mut settings = identity_settings();
        settings.lucy_richardson.sigma = 1.5;
        settings.lucy_richardson.iterations = 200;
        backend.set_settings(settings);

        backend.start(ProcessingRequest::Sharpening).unwrap();
        // immediately supersede with another request
        backend.start(ProcessingRequest::Sharpening).unwrap();

        // the superseded run ends aborted, the queued one completes
        let first = run_to_completion(&mut backend);
        assert_eq!(first, CompletionStatus::Aborted);
        let second = run_to_completion(&mut backend);
        assert_eq!(second, CompletionStatus::Completed);
        assert!(backend.output.sharpening.valid);
    }

    #[test]
    fn steering_cache_survives_settings_changes() {
        let img = gradient_image(64, 64);
        let mut backend = CpuProcessing::new();
        backend.set_image(img).unwrap();

        let mut settings = identity_settings();
        settings.unsharp_masks[0] = UnsharpMask {
            adaptive: true,
            sigma: 1.5,
            amount_min: 1.0,
            amount_max: 1.6,
            threshold: 0.5,
            width: 0.1,
        };
        backend.set_settings(settings.clone());
        backend.start(ProcessingRequest::Sharpening).unwrap();
        run_to_completion(&mut backend);
        let steering_before = backend.steering.clone();
        assert!(steering_before.is_some());

        // settings change: cache kept
        settings.unsharp_masks[0].amount_max = 2.0;
        backend.set_settings(settings);
        assert!(Arc::ptr_eq(
            backend.steering.as_ref().unwrap(),
            steering_before.as_ref().unwrap()
        ));

        // selection change: cache dropped
        backend.set_selection(Rect::new(4, 4, 32, 32)).unwrap();
        assert!(backend.steering.is_none());
    }
}
