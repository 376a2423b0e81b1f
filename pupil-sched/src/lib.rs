//! Detection scheduler: the single cooperative worker that applies the
//! active processing mode to each incoming frame and publishes results.
//!
//! Frames enter through a single-slot latest-wins mailbox so the producer
//! is never blocked by detection; under load the worker always processes
//! the freshest frame. Results fan out through a [frame_flow::Hub]; the
//! image-carrying preview signal is throttled, the data signal is not.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cam_source::CameraEvent;
use event_tracker::EventTracker;
use frame_flow::{FpsCounter, Hub, Mailbox, PlaybackSync};
use parking_lot::Mutex;
use pupil_detect::strategy_by_name;
use pupil_types::{
    now_ms, Calibration, CameraImage, DiscreteRoi, ProcMode, Pupil, PupilFrame, RationalRoi,
    SourceKind,
};
use tracing::{debug, info};

mod process;
use process::{default_rois, process_frame, same_view_partner, SchedState};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("processing mode {mode:?} incompatible with source kind {kind:?}")]
    IncompatibleProcMode { mode: ProcMode, kind: SourceKind },
    #[error("no camera source attached")]
    NoSourceAttached,
    #[error("processing mode is undetermined")]
    UndeterminedMode,
    #[error("ROI role {0} out of range for current mode")]
    RoiRoleOutOfRange(usize),
    #[error("ROIs of distinct pupils overlap")]
    OverlappingRois,
    #[error("unknown detection strategy {0:?}")]
    UnknownStrategy(String),
    #[error("expected maximum pupil size {0} outside 20..=100 percent")]
    PupilSizePercentOutOfRange(f64),
    #[error("SchedulerError({0})")]
    SchedulerError(String),
}

/// Preview bundle for UIs; throttled to [PREVIEW_INTERVAL].
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub image: Arc<CameraImage>,
    pub mode: ProcMode,
    pub rois: Vec<DiscreteRoi>,
    pub pupils: Vec<Pupil>,
}

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// throttled, carries the frame for display
    ProcessedImage(Arc<ProcessedImage>),
    /// unthrottled, one per processed frame, after any preview for it
    ProcessedPupilData(PupilFrame),
    ProcessingFinished,
    Fps(f64),
}

/// Preview signals are limited to about 30 Hz regardless of detection
/// throughput.
pub const PREVIEW_INTERVAL: Duration = Duration::from_millis(33);

struct AttachedSource {
    events: Arc<Hub<CameraEvent>>,
    kind: SourceKind,
}

pub struct DetectionScheduler {
    state: Arc<Mutex<SchedState>>,
    hub: Arc<Hub<SchedulerEvent>>,
    tracker: Arc<EventTracker>,
    /// replaced per run; closing it is the worker stop signal
    mailbox: Mutex<Mailbox<Arc<CameraImage>>>,
    source: Mutex<Option<AttachedSource>>,
    sync: Mutex<Option<Arc<PlaybackSync>>>,
    processed_count: Arc<AtomicU64>,
    threads: Mutex<Option<Threads>>,
}

struct Threads {
    controls: Vec<thread_control::Control>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl DetectionScheduler {
    pub fn new(tracker: Arc<EventTracker>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedState::new())),
            hub: Arc::new(Hub::new()),
            tracker,
            mailbox: Mutex::new(Mailbox::new()),
            source: Mutex::new(None),
            sync: Mutex::new(None),
            processed_count: Arc::new(AtomicU64::new(0)),
            threads: Mutex::new(None),
        }
    }

    pub fn events(&self) -> Arc<Hub<SchedulerEvent>> {
        self.hub.clone()
    }

    /// Subscribe to exactly one camera source.
    pub fn attach_source(&self, events: Arc<Hub<CameraEvent>>, kind: SourceKind) {
        *self.source.lock() = Some(AttachedSource { events, kind });
    }

    /// Couple a file-playback reader to detection completion.
    pub fn attach_playback_sync(&self, sync: Arc<PlaybackSync>) {
        *self.sync.lock() = Some(sync);
    }

    pub fn proc_mode(&self) -> ProcMode {
        self.state.lock().mode
    }

    /// Select the processing mode.
    ///
    /// Refused when the mode cannot process frames of the attached source
    /// kind; the current mode is left unchanged. Selecting a mode resets
    /// the ROIs to the mode's default layout. Allowed while running: the
    /// next frame is processed under the new mode, in-flight bundles keep
    /// their original mode.
    pub fn set_proc_mode(&self, mode: ProcMode) -> Result<()> {
        let source = self.source.lock();
        let kind = source.as_ref().map(|s| s.kind);
        if let Some(kind) = kind {
            if !mode.compatible_with(kind) {
                return Err(Error::IncompatibleProcMode { mode, kind });
            }
        } else if mode == ProcMode::Undetermined {
            return Err(Error::UndeterminedMode);
        }
        let mut state = self.state.lock();
        state.mode = mode;
        state.rois = default_rois(mode);
        info!("processing mode set to {mode:?}");
        Ok(())
    }

    pub fn rois(&self) -> Vec<RationalRoi> {
        self.state.lock().rois.clone()
    }

    /// Replace the ROI of one role of the current mode.
    ///
    /// Refused when the role does not exist or when the region would
    /// overlap the region of the other pupil in the same view.
    pub fn set_roi(&self, role: usize, roi: RationalRoi) -> Result<()> {
        let mut state = self.state.lock();
        if role >= state.rois.len() {
            return Err(Error::RoiRoleOutOfRange(role));
        }
        if let Some(partner) = same_view_partner(state.mode, role) {
            if roi.overlaps(&state.rois[partner]) {
                return Err(Error::OverlappingRois);
            }
        }
        state.rois[role] = roi;
        Ok(())
    }

    /// Select the detection strategy for pupil slot 0 or 1 by name.
    pub fn set_strategy(&self, pupil_index: usize, name: &str) -> Result<()> {
        if pupil_index > 1 {
            return Err(Error::SchedulerError(format!(
                "pupil index {pupil_index} out of range"
            )));
        }
        let strategy =
            strategy_by_name(name).ok_or_else(|| Error::UnknownStrategy(name.to_string()))?;
        self.state.lock().strategies[pupil_index] = strategy;
        Ok(())
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.state.lock().strategy_names()
    }

    pub fn set_calibration(&self, calibration: Option<Arc<dyn Calibration>>) {
        self.state.lock().calibration = calibration;
    }

    /// Schedule the one-shot auto-parameter pass for the next frame.
    ///
    /// `percent` is the expected maximum pupil size as a share of the
    /// shorter image axis, valid in 20..=100.
    pub fn schedule_auto_param(&self, percent: f64) -> Result<()> {
        if !(20.0..=100.0).contains(&percent) {
            return Err(Error::PupilSizePercentOutOfRange(percent));
        }
        self.state.lock().auto_param_percent = Some(percent);
        Ok(())
    }

    pub fn auto_param_scheduled(&self) -> bool {
        self.state.lock().auto_param_percent.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.threads.lock().is_some()
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count.load(Ordering::SeqCst)
    }

    /// Start the detection worker. Errors without an attached source or
    /// with an undetermined mode.
    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if threads.is_some() {
            return Ok(());
        }
        let (camera_rx, source_kind) = {
            let source = self.source.lock();
            let source = source.as_ref().ok_or(Error::NoSourceAttached)?;
            (source.events.subscribe(), source.kind)
        };
        {
            let state = self.state.lock();
            if state.mode == ProcMode::Undetermined {
                return Err(Error::UndeterminedMode);
            }
            if !state.mode.compatible_with(source_kind) {
                return Err(Error::IncompatibleProcMode {
                    mode: state.mode,
                    kind: source_kind,
                });
            }
        }

        let mut controls = Vec::new();
        let mut handles = Vec::new();

        let run_mailbox = Mailbox::new();
        *self.mailbox.lock() = run_mailbox.clone();

        // forwarder: camera events -> mailbox, plus wrap bookkeeping
        {
            let (flag, control) = thread_control::make_pair();
            let mailbox = run_mailbox.clone();
            let tracker = self.tracker.clone();
            let handle = std::thread::Builder::new()
                .name("detector-feed".to_string())
                .spawn(move || {
                    while flag.is_alive() {
                        let event = match camera_rx.recv_timeout(Duration::from_millis(100)) {
                            Ok(ev) => ev,
                            Err(e) if e.is_timeout() => continue,
                            Err(_) => break,
                        };
                        match event {
                            CameraEvent::NewImage(image) => {
                                if mailbox.post(image) {
                                    debug!("detector busy, replaced waiting frame");
                                }
                            }
                            CameraEvent::Wrapped => {
                                // synthetic trial reset between the last
                                // pre-wrap and first post-wrap frame
                                tracker.reset_trial_counter(now_ms());
                            }
                            CameraEvent::DeviceRemoved | CameraEvent::EndReached => {
                                mailbox.close();
                                break;
                            }
                            _ => {}
                        }
                    }
                    debug!("detector-feed exiting");
                })
                .map_err(|e| Error::SchedulerError(e.to_string()))?;
            controls.push(control);
            handles.push(handle);
        }

        // worker; stopped by closing the mailbox, not by a control flag
        {
            let mailbox = run_mailbox;
            let state = self.state.clone();
            let hub = self.hub.clone();
            let tracker = self.tracker.clone();
            let sync = self.sync.lock().clone();
            let processed_count = self.processed_count.clone();
            let handle = std::thread::Builder::new()
                .name("detector".to_string())
                .spawn(move || {
                    let mut fps = FpsCounter::new();
                    let mut last_preview = Instant::now() - PREVIEW_INTERVAL;
                    loop {
                        let image = match mailbox.take() {
                            Some(image) => image,
                            None => break, // closed and drained
                        };
                        let trial = tracker.trial_number_at(image.timestamp_ms);
                        let (frame, rois) = {
                            let mut state = state.lock();
                            process_frame(&mut state, &image, trial)
                        };

                        // preview first, data second, per frame
                        let now = Instant::now();
                        if now.duration_since(last_preview) >= PREVIEW_INTERVAL {
                            last_preview = now;
                            hub.publish(SchedulerEvent::ProcessedImage(Arc::new(
                                ProcessedImage {
                                    image: image.clone(),
                                    mode: frame.mode,
                                    rois,
                                    pupils: frame.pupils.clone(),
                                },
                            )));
                        }
                        hub.publish(SchedulerEvent::ProcessedPupilData(frame));
                        processed_count.fetch_add(1, Ordering::SeqCst);

                        if let Some(report) = fps.tick(Instant::now()) {
                            hub.publish(SchedulerEvent::Fps(report.fps));
                        }
                        if let Some(sync) = &sync {
                            sync.notify_processed();
                        }
                    }
                    hub.publish(SchedulerEvent::ProcessingFinished);
                    debug!("detector exiting");
                })
                .map_err(|e| Error::SchedulerError(e.to_string()))?;
            handles.push(handle);
        }

        *threads = Some(Threads { controls, handles });
        Ok(())
    }

    /// Drain the mailbox and stop. Emits
    /// [SchedulerEvent::ProcessingFinished]; idempotent.
    pub fn stop(&self) {
        let taken = self.threads.lock().take();
        if let Some(Threads { controls, handles }) = taken {
            for control in &controls {
                control.stop();
            }
            self.mailbox.lock().close();
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for DetectionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests;
