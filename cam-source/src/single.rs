use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use frame_flow::{FpsCounter, Hub};
use parking_lot::Mutex;
use pupil_types::{now_ms, CameraImage, SourceKind};
use tracing::{debug, error};

use crate::driver::{FrameDriver, GrabError, SensorRoi};
use crate::{CameraEvent, Result};

/// Live frame source over one camera driver.
///
/// `start_grabbing` spawns a grabber thread which stamps each completed
/// buffer with the host clock and publishes it. Skipped buffers are
/// coalesced into one [CameraEvent::ImagesSkipped] per run; device removal
/// publishes [CameraEvent::DeviceRemoved] and transitions the source to
/// closed.
pub struct SingleCameraSource {
    driver: Arc<Mutex<Box<dyn FrameDriver>>>,
    hub: Arc<Hub<CameraEvent>>,
    kind: SourceKind,
    /// monotonic across grab restarts and ROI/binning changes
    frame_number: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
    grab: Mutex<Option<(thread_control::Control, std::thread::JoinHandle<()>)>>,
}

impl SingleCameraSource {
    pub fn open(driver: Box<dyn FrameDriver>) -> Self {
        Self::open_with_kind(driver, SourceKind::LiveSingle)
    }

    pub fn open_with_kind(driver: Box<dyn FrameDriver>, kind: SourceKind) -> Self {
        debug_assert!(!kind.is_stereo() && !kind.is_file());
        Self {
            driver: Arc::new(Mutex::new(driver)),
            hub: Arc::new(Hub::new()),
            kind,
            frame_number: Arc::new(AtomicU64::new(0)),
            open: Arc::new(AtomicBool::new(true)),
            grab: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_grabbing(&self) -> bool {
        self.grab.lock().is_some()
    }

    pub fn events(&self) -> Arc<Hub<CameraEvent>> {
        self.hub.clone()
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn start_grabbing(&self) -> Result<()> {
        if !self.is_open() {
            return Err(crate::Error::NotOpen);
        }
        let mut grab = self.grab.lock();
        if grab.is_some() {
            return Ok(());
        }
        let (flag, control) = thread_control::make_pair();
        let driver = self.driver.clone();
        let hub = self.hub.clone();
        let kind = self.kind;
        let frame_number = self.frame_number.clone();
        let open = self.open.clone();
        let handle = std::thread::Builder::new()
            .name("grabber-primary".to_string())
            .spawn(move || {
                let mut fps = FpsCounter::new();
                let mut last_ts = i64::MIN;
                let mut in_skip_run = false;
                while flag.is_alive() {
                    // release and re-acquire each cycle so setters get a turn
                    let outcome = {
                        let mut drv = driver.lock();
                        drv.grab_next()
                    };
                    match outcome {
                        Ok(frame) => {
                            in_skip_run = false;
                            let ts = now_ms().max(last_ts);
                            last_ts = ts;
                            let n = frame_number.fetch_add(1, Ordering::SeqCst);
                            let image = CameraImage::new_single(ts, kind, n, frame.image);
                            hub.publish(CameraEvent::NewImage(Arc::new(image)));
                            if let Some(report) = fps.tick(Instant::now()) {
                                hub.publish(CameraEvent::Fps(report.fps));
                                hub.publish(CameraEvent::FrameCount(
                                    frame_number.load(Ordering::SeqCst),
                                ));
                            }
                        }
                        Err(GrabError::Skipped) => {
                            if !in_skip_run {
                                in_skip_run = true;
                                hub.publish(CameraEvent::ImagesSkipped);
                            }
                        }
                        Err(GrabError::Removed) => {
                            hub.publish(CameraEvent::DeviceRemoved);
                            open.store(false, Ordering::SeqCst);
                            break;
                        }
                        Err(GrabError::Fatal(msg)) => {
                            error!("fatal grab error: {msg}");
                            hub.publish(CameraEvent::DeviceRemoved);
                            open.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                debug!("grabber thread exiting");
            })
            .map_err(|e| crate::Error::CamSourceError(e.to_string()))?;
        *grab = Some((control, handle));
        Ok(())
    }

    /// Idempotent; joins the grabber so in-flight work is drained before
    /// this returns.
    pub fn stop_grabbing(&self) -> bool {
        let taken = self.grab.lock().take();
        match taken {
            Some((control, handle)) => {
                control.stop();
                let _ = handle.join();
                true
            }
            None => false,
        }
    }

    pub fn close(&self) {
        self.stop_grabbing();
        self.open.store(false, Ordering::SeqCst);
    }

    /// Stop grabbing, apply a driver mutation, restart if it was grabbing.
    /// Atomic from the caller's view; the frame counter is not reset.
    fn with_paused_grab<T>(
        &self,
        f: impl FnOnce(&mut dyn FrameDriver) -> Result<T>,
    ) -> Result<T> {
        let was_grabbing = self.stop_grabbing();
        let result = {
            let mut drv = self.driver.lock();
            f(&mut **drv)
        };
        if was_grabbing && self.is_open() {
            self.start_grabbing()?;
        }
        result
    }

    pub fn image_roi(&self) -> SensorRoi {
        self.driver.lock().image_roi()
    }

    pub fn image_roi_max(&self) -> SensorRoi {
        self.driver.lock().image_roi_max()
    }

    pub fn set_image_roi(&self, roi: SensorRoi) -> Result<()> {
        self.with_paused_grab(|drv| drv.set_image_roi(roi))
    }

    pub fn binning(&self) -> u32 {
        self.driver.lock().binning()
    }

    pub fn set_binning(&self, binning: u32) -> Result<()> {
        self.with_paused_grab(|drv| drv.set_binning(binning))
    }

    pub fn exposure_us(&self) -> f64 {
        self.driver.lock().exposure_us()
    }

    pub fn set_exposure_us(&self, value: f64) -> Result<()> {
        self.with_paused_grab(|drv| drv.set_exposure_us(value))
    }

    pub fn gain_db(&self) -> f64 {
        self.driver.lock().gain_db()
    }

    pub fn set_gain_db(&self, value: f64) -> Result<()> {
        self.with_paused_grab(|drv| drv.set_gain_db(value))
    }

    pub fn resulting_frame_rate(&self) -> f64 {
        self.driver.lock().resulting_frame_rate()
    }

    /// One entry per physical camera, for temperature-check events.
    pub fn temperatures(&self) -> Vec<f64> {
        self.driver.lock().temperature_c().into_iter().collect()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_number.load(Ordering::SeqCst)
    }
}

impl Drop for SingleCameraSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDriver, MockGrab};
    use std::time::Duration;

    fn collect_until_removed(rx: &crossbeam_channel::Receiver<CameraEvent>) -> Vec<CameraEvent> {
        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(ev) => {
                    let is_removed = matches!(ev, CameraEvent::DeviceRemoved);
                    events.push(ev);
                    if is_removed {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        events
    }

    #[test]
    fn frames_are_stamped_and_monotonic() {
        let driver = MockDriver::new("mock0", 320, 240)
            .with_script([MockGrab::Frame, MockGrab::Frame, MockGrab::Frame]);
        let source = SingleCameraSource::open(Box::new(driver));
        let rx = source.events().subscribe();
        source.start_grabbing().unwrap();
        let events = collect_until_removed(&rx);

        let frames: Vec<_> = events
            .iter()
            .filter_map(|ev| match ev {
                CameraEvent::NewImage(im) => Some(im.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 3);
        for pair in frames.windows(2) {
            assert!(pair[1].timestamp_ms >= pair[0].timestamp_ms);
            assert_eq!(pair[1].frame_number, pair[0].frame_number + 1);
        }
        assert!(events
            .iter()
            .any(|ev| matches!(ev, CameraEvent::DeviceRemoved)));
        assert!(!source.is_open());
    }

    #[test]
    fn skip_runs_are_coalesced() {
        let driver = MockDriver::new("mock0", 320, 240).with_script([
            MockGrab::Frame,
            MockGrab::Skip,
            MockGrab::Skip,
            MockGrab::Skip,
            MockGrab::Frame,
            MockGrab::Skip,
            MockGrab::Frame,
        ]);
        let source = SingleCameraSource::open(Box::new(driver));
        let rx = source.events().subscribe();
        source.start_grabbing().unwrap();
        let events = collect_until_removed(&rx);

        let skips = events
            .iter()
            .filter(|ev| matches!(ev, CameraEvent::ImagesSkipped))
            .count();
        assert_eq!(skips, 2, "one event per run of skips");
        let frames = events
            .iter()
            .filter(|ev| matches!(ev, CameraEvent::NewImage(_)))
            .count();
        assert_eq!(frames, 3);
    }

    #[test]
    fn frame_counter_survives_binning_change() {
        let driver = MockDriver::new("mock0", 640, 480);
        let source = SingleCameraSource::open(Box::new(driver));
        let rx = source.events().subscribe();
        source.start_grabbing().unwrap();
        // wait for some frames
        let mut seen_before = 0u64;
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen_before < 3 && Instant::now() < deadline {
            if let Ok(CameraEvent::NewImage(im)) = rx.recv_timeout(Duration::from_millis(100)) {
                seen_before = im.frame_number;
            }
        }
        source.set_binning(2).unwrap();
        assert!(source.is_grabbing());
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "no frame after binning change");
            if let Ok(CameraEvent::NewImage(im)) = rx.recv_timeout(Duration::from_millis(100)) {
                if im.image.width() == 320 {
                    assert!(im.frame_number > seen_before, "counter must not reset");
                    break;
                }
            }
        }
        source.close();
        source.close(); // idempotent
    }

    #[test]
    fn start_without_open_is_an_error() {
        let driver = MockDriver::new("mock0", 320, 240).with_script([]);
        let source = SingleCameraSource::open(Box::new(driver));
        source.close();
        assert!(source.start_grabbing().is_err());
    }
}
