//! Capture-to-delivery pipeline
//!
//! A single blocking worker drives the loop: admit a frame from the capture
//! pool, run the motion gate, apply the selected display transform, encode
//! and hand the payload to the delivery mailbox, and feed the notification
//! limiter. The worker owns the gate, the frame archive and the status
//! counters; commands reach it through word-sized tuning atomics.

use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::{ParamPage, ProcMode, Tuning};
use crate::error::{AppError, ErrorSlot, Result};
use crate::notify::NotificationLimiter;
use crate::server::{CommandSink, FrameSink, Param};
use crate::utils::profile::StageTimer;
use crate::utils::Shutdown;
use crate::video::convert::{bgr_to_gray, bgr_to_rgb};
use crate::video::encode::{blur_gray, encode_segmented};
use crate::video::motion::MotionGate;
use crate::video::pool::{Consumer, FrameRef};
use crate::video::DisplayFrame;

/// Nominal skip between admitted frames.
pub const FRAME_SKIP: i32 = 2;
/// Lower clamp for the admission counter when the pipeline falls behind.
pub const FRAME_BACKLOG_MIN: i32 = -5;
/// Admitted frames at startup during which counters are not updated.
pub const STATUS_SUPPRESS_DELAY: u8 = 10;
/// Capacity of the debug frame archive.
pub const MAX_ARCHIVE_RECORDS: usize = 150;

/// Timed pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ProcStage {
    Gray = 0,
    Blur = 1,
    Encode = 2,
    Total = 3,
}

pub const STAGE_COUNT: usize = 4;
const STAGE_NAMES: [&str; STAGE_COUNT] = ["Gray", "Blur", "Encode", "Total"];

/// Status counters owned by the pipeline worker. Command-side reads are
/// best-effort snapshots through the mutex.
pub struct Status {
    suppress_delay: u8,
    num_frames: u64,
    num_dropped_frames: u64,
    curr_us: [i64; STAGE_COUNT],
    total_us: [i64; STAGE_COUNT],
    max_us: [i64; STAGE_COUNT],
    epoch: Option<Instant>,
}

impl Status {
    pub fn new() -> Self {
        Self {
            suppress_delay: STATUS_SUPPRESS_DELAY,
            num_frames: 0,
            num_dropped_frames: 0,
            curr_us: [0; STAGE_COUNT],
            total_us: [0; STAGE_COUNT],
            max_us: [0; STAGE_COUNT],
            epoch: None,
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress_delay > 0
    }

    /// Tick the warm-up countdown. Returns true exactly once, when the
    /// suppression window expires.
    pub fn suppression_processing(&mut self) -> bool {
        if self.suppress_delay > 0 {
            self.suppress_delay -= 1;
            return self.suppress_delay == 0;
        }
        false
    }

    pub fn mark_epoch(&mut self, at: Instant) {
        self.epoch = Some(at);
    }

    pub fn count_dropped(&mut self) {
        self.num_dropped_frames += 1;
    }

    pub fn num_frames(&self) -> u64 {
        self.num_frames
    }

    pub fn num_dropped_frames(&self) -> u64 {
        self.num_dropped_frames
    }

    pub fn record_frame(&mut self, stage_us: &[i64; STAGE_COUNT]) {
        self.num_frames += 1;
        for i in 0..STAGE_COUNT {
            self.curr_us[i] = stage_us[i];
            self.total_us[i] += stage_us[i];
            self.max_us[i] = self.max_us[i].max(stage_us[i]);
        }
    }

    fn log(&self) {
        info!("statistics");
        info!(
            "  total frames={} delayed frames={}",
            self.num_frames, self.num_dropped_frames
        );
        if self.num_frames == 0 {
            return;
        }
        if let Some(epoch) = self.epoch {
            let secs = epoch.elapsed().as_secs();
            if secs > 0 {
                info!("  average fps={}", self.num_frames / secs);
            }
        }
        info!("  processing times:");
        for i in 0..STAGE_COUNT {
            info!(
                "    {}: curr={} us, avg={} us, max={} us",
                STAGE_NAMES[i],
                self.curr_us[i],
                self.total_us[i] / self.num_frames as i64,
                self.max_us[i]
            );
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame-skip admission: one frame is admitted per `FRAME_SKIP` captured,
/// with a bounded backlog credit when the pipeline falls behind.
pub struct Admission {
    next_frame: i32,
}

impl Admission {
    pub fn new() -> Self {
        Self {
            next_frame: FRAME_SKIP,
        }
    }

    /// Account for one grabbed frame plus the frames the source dropped in
    /// its favor. Returns true when the frame is admitted for processing.
    pub fn absorb(&mut self, source_dropped: usize) -> bool {
        self.next_frame -= source_dropped as i32 + 1;
        self.next_frame <= 0
    }

    /// Re-arm after an admission. Returns true when the cadence slipped
    /// (the admitted frame was late).
    pub fn rearm(&mut self) -> bool {
        self.next_frame += FRAME_SKIP;
        if self.next_frame < FRAME_BACKLOG_MIN {
            self.next_frame = FRAME_BACKLOG_MIN;
        }
        self.next_frame != FRAME_SKIP
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::new()
    }
}

/// Ring of archived display frames for the Debug mode.
pub struct FrameArchive {
    records: Vec<DisplayFrame>,
    capacity: usize,
    next: usize,
    selected: usize,
}

impl FrameArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity: capacity.max(1),
            next: 0,
            selected: 0,
        }
    }

    pub fn push(&mut self, frame: DisplayFrame) {
        if self.records.len() < self.capacity {
            self.records.push(frame);
        } else {
            self.records[self.next] = frame;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Move the selection by `delta`, wrapping over the occupied records.
    pub fn step(&mut self, delta: i32) {
        if self.records.is_empty() {
            return;
        }
        let len = self.records.len() as i64;
        let pos = (self.selected as i64 + delta as i64).rem_euclid(len);
        self.selected = pos as usize;
    }

    pub fn selected(&self) -> Option<&DisplayFrame> {
        self.records.get(self.selected)
    }
}

/// Command surface of the pipeline: mutates tuning atomics and reads the
/// status counters best-effort. Shared by the command reader and the TTY.
pub struct PipelineControl {
    tuning: Arc<Tuning>,
    status: Arc<Mutex<Status>>,
}

impl CommandSink for PipelineControl {
    fn output_status(&self) {
        self.status.lock().log();
    }

    fn output_config(&self) {
        info!("configuration");
        info!("  image processing mode={}", self.tuning.mode());
        info!("  current parameter page={}", self.tuning.param_page());
        info!("  kernel size={}", self.tuning.kernel_size());
        info!("  motion threshold={}", self.tuning.motion_threshold());
    }

    fn cycle_mode(&self) {
        info!("image processing mode: {}", self.tuning.cycle_mode());
    }

    fn next_page(&self) {
        self.tuning.cycle_param_page();
        log_param_page(&self.tuning);
    }

    fn adjust_param(&self, param: Param, up: bool) {
        match param {
            Param::Primary => match self.tuning.param_page() {
                ParamPage::Blur => {
                    info!("kernel size: {}", self.tuning.adjust_kernel_size(up));
                }
                ParamPage::Motion => {
                    info!(
                        "motion threshold: {}",
                        self.tuning.adjust_motion_threshold(up)
                    );
                }
            },
            Param::Secondary => {
                self.tuning.push_archive_step(if up { 1 } else { -1 });
            }
        }
    }

    fn debug_trigger(&self) {
        self.tuning.fire_debug_trigger();
    }

    fn toggle_debug_mode(&self) {
        let on = self.tuning.toggle_debug_mode();
        info!("debug mode {}", if on { "enabled" } else { "disabled" });
    }
}

fn log_param_page(tuning: &Tuning) {
    let page = tuning.param_page();
    info!("current parameter page: {}", page);
    match page {
        ParamPage::Blur => info!("  1) kernel size"),
        ParamPage::Motion => info!("  1) motion threshold"),
    }
}

/// The capture-to-delivery pipeline worker.
pub struct Pipeline {
    tuning: Arc<Tuning>,
    status: Arc<Mutex<Status>>,
    sink: Arc<dyn FrameSink>,
    shutdown: Shutdown,
}

impl Pipeline {
    pub fn new(tuning: Arc<Tuning>, sink: Arc<dyn FrameSink>, shutdown: Shutdown) -> Self {
        Self {
            tuning,
            status: Arc::new(Mutex::new(Status::new())),
            sink,
            shutdown,
        }
    }

    /// Command surface bound to this pipeline.
    pub fn control(&self) -> PipelineControl {
        PipelineControl {
            tuning: self.tuning.clone(),
            status: self.status.clone(),
        }
    }

    /// Run the worker on a blocking thread. A fatal error is recorded and
    /// shuts the process down; a shutdown-induced interrupt exits cleanly.
    pub fn spawn(
        self,
        frames: Consumer,
        limiter: NotificationLimiter,
        errors: Arc<ErrorSlot>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            match self.run(frames, limiter) {
                Err(AppError::Interrupt) => {
                    if !self.shutdown.is_triggered() {
                        errors.record(AppError::Interrupt);
                    }
                    info!("pipeline worker interrupted");
                }
                Err(e) => errors.record(e),
                Ok(()) => {}
            }
            self.shutdown.trigger();
        })
    }

    /// Worker loop. Exits only on interruption or a fatal error.
    pub fn run(&self, frames: Consumer, mut limiter: NotificationLimiter) -> Result<()> {
        let interrupt = self.shutdown.flag();
        let mut gate = MotionGate::new();
        let mut archive = FrameArchive::new(MAX_ARCHIVE_RECORDS);
        let mut admission = Admission::new();

        log_param_page(&self.tuning);

        loop {
            // Cancellation checkpoint at the top of the loop.
            if interrupt.load(Ordering::SeqCst) {
                return Err(AppError::Interrupt);
            }

            // Admission: keep draining until the skip counter says process.
            let frame = loop {
                let (frame, dropped) = frames.latest(&interrupt)?;
                if admission.absorb(dropped) {
                    break frame;
                }
            };
            let fell_behind = admission.rearm();

            let was_suppressed = {
                let mut status = self.status.lock();
                let was = status.is_suppressed();
                if status.suppression_processing() {
                    status.mark_epoch(Instant::now());
                }
                if !was && fell_behind {
                    status.count_dropped();
                    debug!("pipeline behind capture, frame counted as delayed");
                }
                was
            };

            let stage_us = self.process_frame(&frame, &mut gate, &mut archive, &mut limiter)?;

            if !was_suppressed {
                self.status.lock().record_frame(&stage_us);
            }

            // Cancellation checkpoint at the bottom of the loop.
            if interrupt.load(Ordering::SeqCst) {
                return Err(AppError::Interrupt);
            }
        }
    }

    fn process_frame(
        &self,
        frame: &FrameRef,
        gate: &mut MotionGate,
        archive: &mut FrameArchive,
        limiter: &mut NotificationLimiter,
    ) -> Result<[i64; STAGE_COUNT]> {
        let total_timer = StageTimer::start();
        let mut stage_us = [0i64; STAGE_COUNT];

        let resolution = frame.resolution();
        let motion = gate.update(frame.data(), resolution, self.tuning.motion_threshold());
        let mode = self.tuning.mode();

        // Variant A gating: in MotionDetect mode a motionless frame produces
        // no output at all.
        let gated = mode == ProcMode::MotionDetect && self.tuning.motion_gated() && !motion;
        if !gated {
            let display = self.render(frame, mode, gate, archive, &mut stage_us);

            if self.tuning.take_debug_trigger() || self.tuning.debug_mode() {
                archive.push(display.clone());
            }
            let steps = self.tuning.take_archive_steps();
            if steps != 0 {
                archive.step(steps);
            }

            let encode_timer = StageTimer::start();
            let payload = encode_segmented(&display)?;
            stage_us[ProcStage::Encode as usize] = encode_timer.elapsed_us();

            if self.sink.ready() {
                self.sink.send_frame(payload);
            }
        }

        if motion {
            limiter.maybe_notify();
        }

        stage_us[ProcStage::Total as usize] = total_timer.elapsed_us();
        Ok(stage_us)
    }

    fn render(
        &self,
        frame: &FrameRef,
        mode: ProcMode,
        gate: &MotionGate,
        archive: &FrameArchive,
        stage_us: &mut [i64; STAGE_COUNT],
    ) -> DisplayFrame {
        let resolution = frame.resolution();
        match mode {
            ProcMode::None => DisplayFrame::Color(bgr_to_rgb(frame.data(), resolution)),
            ProcMode::MotionDetect => match gate.diff_frame() {
                Some(diff) => DisplayFrame::Gray(diff.clone()),
                // No previous frame yet; show plain grayscale.
                None => DisplayFrame::Gray(bgr_to_gray(frame.data(), resolution)),
            },
            ProcMode::Gray => {
                let timer = StageTimer::start();
                let gray = bgr_to_gray(frame.data(), resolution);
                stage_us[ProcStage::Gray as usize] = timer.elapsed_us();
                DisplayFrame::Gray(gray)
            }
            ProcMode::Blur => {
                let timer = StageTimer::start();
                let gray = bgr_to_gray(frame.data(), resolution);
                stage_us[ProcStage::Gray as usize] = timer.elapsed_us();

                let timer = StageTimer::start();
                let blurred = blur_gray(&gray, self.tuning.kernel_size());
                stage_us[ProcStage::Blur as usize] = timer.elapsed_us();

                DisplayFrame::Gray(blurred)
            }
            ProcMode::Debug => match archive.selected() {
                Some(archived) => archived.clone(),
                None => DisplayFrame::Color(bgr_to_rgb(frame.data(), resolution)),
            },
        }
    }
}
