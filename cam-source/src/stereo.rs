use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use frame_flow::{FpsCounter, Hub};
use parking_lot::Mutex;
use pupil_types::{now_ms, CameraImage, SourceKind};
use tracing::{debug, error, warn};

use crate::driver::{FrameDriver, GrabError, SensorRoi};
use crate::pairing::{Pairer, TimedFrame, DEFAULT_PAIR_WINDOW_MS};
use crate::{CameraEvent, Result};

enum PairerMsg {
    Primary(TimedFrame),
    Secondary(TimedFrame),
    Removed,
}

struct StereoThreads {
    controls: Vec<thread_control::Control>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

/// Frame source over two physically synchronized cameras.
///
/// Each camera runs its own grabber thread; a pairer thread binds the two
/// streams into [CameraImage] pairs by timestamp window. The pair window
/// guarantees both images of an emitted pair stem from one shared trigger
/// pulse.
pub struct StereoCameraSource {
    primary: Arc<Mutex<Box<dyn FrameDriver>>>,
    secondary: Arc<Mutex<Box<dyn FrameDriver>>>,
    hub: Arc<Hub<CameraEvent>>,
    /// the primary grabber's counter; pairs carry these numbers
    frame_number: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
    pair_window_ms: i64,
    pair_drops: Arc<AtomicU64>,
    threads: Mutex<Option<StereoThreads>>,
}

impl StereoCameraSource {
    pub fn open(primary: Box<dyn FrameDriver>, secondary: Box<dyn FrameDriver>) -> Self {
        Self::open_with_window(primary, secondary, DEFAULT_PAIR_WINDOW_MS)
    }

    pub fn open_with_window(
        primary: Box<dyn FrameDriver>,
        secondary: Box<dyn FrameDriver>,
        pair_window_ms: i64,
    ) -> Self {
        Self {
            primary: Arc::new(Mutex::new(primary)),
            secondary: Arc::new(Mutex::new(secondary)),
            hub: Arc::new(Hub::new()),
            frame_number: Arc::new(AtomicU64::new(0)),
            open: Arc::new(AtomicBool::new(true)),
            pair_window_ms,
            pair_drops: Arc::new(AtomicU64::new(0)),
            threads: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_grabbing(&self) -> bool {
        self.threads.lock().is_some()
    }

    pub fn events(&self) -> Arc<Hub<CameraEvent>> {
        self.hub.clone()
    }

    pub fn kind(&self) -> SourceKind {
        SourceKind::LiveStereo
    }

    /// Unmatched singles dropped by the pairer so far.
    pub fn pair_drops(&self) -> u64 {
        self.pair_drops.load(Ordering::SeqCst)
    }

    /// Start grabbing, then run `issue_trigger`.
    ///
    /// External triggering requires grabbing to be active before the first
    /// pulse arrives, otherwise the leading frames reach only one physical
    /// camera and the pairing window drops them. Routing the trigger start
    /// through this method makes that ordering structural.
    pub fn arm_then<T>(&self, issue_trigger: impl FnOnce() -> T) -> Result<T> {
        self.start_grabbing()?;
        Ok(issue_trigger())
    }

    pub fn start_grabbing(&self) -> Result<()> {
        if !self.is_open() {
            return Err(crate::Error::NotOpen);
        }
        let mut threads = self.threads.lock();
        if threads.is_some() {
            return Ok(());
        }

        let (tx, rx) = crossbeam_channel::bounded::<PairerMsg>(16);
        let mut controls = Vec::new();
        let mut handles = Vec::new();

        // grabber threads
        for (label, driver, is_primary) in [
            ("grabber-primary", self.primary.clone(), true),
            ("grabber-secondary", self.secondary.clone(), false),
        ] {
            let (flag, control) = thread_control::make_pair();
            let tx = tx.clone();
            let hub = self.hub.clone();
            let frame_number = self.frame_number.clone();
            let handle = std::thread::Builder::new()
                .name(label.to_string())
                .spawn(move || {
                    let mut local_number = 0u64;
                    let mut last_ts = i64::MIN;
                    let mut in_skip_run = false;
                    while flag.is_alive() {
                        let outcome = {
                            let mut drv = driver.lock();
                            drv.grab_next()
                        };
                        match outcome {
                            Ok(frame) => {
                                in_skip_run = false;
                                let ts = now_ms().max(last_ts);
                                last_ts = ts;
                                let frame_number = if is_primary {
                                    frame_number.fetch_add(1, Ordering::SeqCst)
                                } else {
                                    local_number += 1;
                                    local_number - 1
                                };
                                let timed = TimedFrame {
                                    timestamp_ms: ts,
                                    frame_number,
                                    image: frame.image,
                                };
                                let msg = if is_primary {
                                    PairerMsg::Primary(timed)
                                } else {
                                    PairerMsg::Secondary(timed)
                                };
                                if tx.send(msg).is_err() {
                                    break; // pairer gone
                                }
                            }
                            Err(GrabError::Skipped) => {
                                if !in_skip_run {
                                    in_skip_run = true;
                                    hub.publish(CameraEvent::ImagesSkipped);
                                }
                            }
                            Err(GrabError::Removed) => {
                                let _ = tx.send(PairerMsg::Removed);
                                break;
                            }
                            Err(GrabError::Fatal(msg)) => {
                                error!("fatal grab error on {label}: {msg}");
                                let _ = tx.send(PairerMsg::Removed);
                                break;
                            }
                        }
                    }
                    debug!("{label} exiting");
                })
                .map_err(|e| crate::Error::CamSourceError(e.to_string()))?;
            controls.push(control);
            handles.push(handle);
        }
        drop(tx);

        // pairer thread
        {
            let (flag, control) = thread_control::make_pair();
            let hub = self.hub.clone();
            let open = self.open.clone();
            let pair_drops = self.pair_drops.clone();
            let window_ms = self.pair_window_ms;
            let handle = std::thread::Builder::new()
                .name("pairer".to_string())
                .spawn(move || {
                    let mut pairer = Pairer::new(window_ms);
                    let mut fps = FpsCounter::new();
                    let mut emitted = 0u64;
                    while flag.is_alive() {
                        let msg =
                            match rx.recv_timeout(std::time::Duration::from_millis(100)) {
                                Ok(msg) => msg,
                                Err(e) if e.is_timeout() => continue,
                                Err(_) => break, // grabbers gone
                            };
                        let pairs = match msg {
                            PairerMsg::Primary(f) => pairer.push_primary(f),
                            PairerMsg::Secondary(f) => pairer.push_secondary(f),
                            PairerMsg::Removed => {
                                hub.publish(CameraEvent::DeviceRemoved);
                                open.store(false, Ordering::SeqCst);
                                break;
                            }
                        };
                        pair_drops.store(pairer.drops(), Ordering::SeqCst);
                        for (p, s) in pairs {
                            match CameraImage::new_stereo(
                                p.timestamp_ms,
                                SourceKind::LiveStereo,
                                p.frame_number,
                                p.image,
                                s.image,
                            ) {
                                Ok(image) => {
                                    emitted += 1;
                                    hub.publish(CameraEvent::NewImage(Arc::new(image)));
                                    if let Some(report) = fps.tick(Instant::now()) {
                                        hub.publish(CameraEvent::Fps(report.fps));
                                        hub.publish(CameraEvent::FrameCount(emitted));
                                    }
                                }
                                Err(e) => warn!("discarding mismatched pair: {e}"),
                            }
                        }
                    }
                    debug!("pairer exiting");
                })
                .map_err(|e| crate::Error::CamSourceError(e.to_string()))?;
            controls.push(control);
            handles.push(handle);
        }

        *threads = Some(StereoThreads { controls, handles });
        Ok(())
    }

    /// Idempotent; joins all three threads.
    pub fn stop_grabbing(&self) -> bool {
        let taken = self.threads.lock().take();
        match taken {
            Some(StereoThreads { controls, handles }) => {
                for control in &controls {
                    control.stop();
                }
                for handle in handles {
                    let _ = handle.join();
                }
                true
            }
            None => false,
        }
    }

    pub fn close(&self) {
        self.stop_grabbing();
        self.open.store(false, Ordering::SeqCst);
    }

    /// Apply a mutation to both drivers with grabbing paused. Atomic from
    /// the caller's view; the frame counter is not reset.
    fn with_paused_grab<T>(
        &self,
        f: impl Fn(&mut dyn FrameDriver) -> Result<T>,
    ) -> Result<T> {
        let was_grabbing = self.stop_grabbing();
        let result = (|| {
            let mut p = self.primary.lock();
            f(&mut **p)?;
            let mut s = self.secondary.lock();
            f(&mut **s)
        })();
        if was_grabbing && self.is_open() {
            self.start_grabbing()?;
        }
        result
    }

    pub fn image_roi(&self) -> SensorRoi {
        self.primary.lock().image_roi()
    }

    pub fn image_roi_max(&self) -> SensorRoi {
        self.primary.lock().image_roi_max()
    }

    /// Applied to both cameras so the two views stay dimension-identical.
    pub fn set_image_roi(&self, roi: SensorRoi) -> Result<()> {
        self.with_paused_grab(|drv| drv.set_image_roi(roi))
    }

    pub fn binning(&self) -> u32 {
        self.primary.lock().binning()
    }

    pub fn set_binning(&self, binning: u32) -> Result<()> {
        self.with_paused_grab(|drv| drv.set_binning(binning))
    }

    pub fn exposure_us(&self) -> f64 {
        self.primary.lock().exposure_us()
    }

    pub fn set_exposure_us(&self, value: f64) -> Result<()> {
        self.with_paused_grab(|drv| drv.set_exposure_us(value))
    }

    pub fn gain_db(&self) -> f64 {
        self.primary.lock().gain_db()
    }

    pub fn set_gain_db(&self, value: f64) -> Result<()> {
        self.with_paused_grab(|drv| drv.set_gain_db(value))
    }

    pub fn resulting_frame_rate(&self) -> f64 {
        self.primary.lock().resulting_frame_rate()
    }

    /// One entry per physical camera, for temperature-check events.
    pub fn temperatures(&self) -> Vec<f64> {
        [&self.primary, &self.secondary]
            .iter()
            .filter_map(|drv| drv.lock().temperature_c())
            .collect()
    }

    /// Confirm an ack-less trigger stop took effect.
    ///
    /// The trigger protocol has no acknowledgement; the absence of further
    /// frames for twice the expected inter-frame interval counts as
    /// confirmation. Returns false when frames keep arriving well past
    /// that point.
    pub fn confirm_trigger_stopped(&self, frame_period: std::time::Duration) -> bool {
        let rx = self.hub.subscribe_bounded(4);
        let quiet_window = frame_period * 2;
        for _ in 0..25 {
            match rx.recv_timeout(quiet_window) {
                Err(_) => return true, // no frame within 2x the interval
                Ok(CameraEvent::NewImage(_)) => continue,
                Ok(_) => continue,
            }
        }
        false
    }
}

impl Drop for StereoCameraSource {
    fn drop(&mut self) {
        self.close();
    }
}
