use std::collections::VecDeque;
use std::time::Duration;

use pupil_types::GrayImage;

use crate::driver::{DriverFrame, FrameDriver, GrabError, SensorRoi};

/// Scripted grab outcomes for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockGrab {
    Frame,
    Skip,
    Remove,
}

/// Deterministic software camera.
///
/// Produces a bright field with one dark ellipse in the middle of the
/// current ROI, so detection strategies find a stable pupil. A script of
/// [MockGrab] outcomes can inject skips and device removal; an empty script
/// with `endless` set keeps producing frames at the configured rate.
pub struct MockDriver {
    name: String,
    sensor_width: u32,
    sensor_height: u32,
    binning: u32,
    roi: SensorRoi,
    exposure_us: f64,
    gain_db: f64,
    frame_rate: f64,
    paced: bool,
    endless: bool,
    script: VecDeque<MockGrab>,
}

impl MockDriver {
    pub fn new(name: &str, sensor_width: u32, sensor_height: u32) -> Self {
        Self {
            name: name.to_string(),
            sensor_width,
            sensor_height,
            binning: 1,
            roi: SensorRoi::full(sensor_width, sensor_height),
            exposure_us: 4000.0,
            gain_db: 0.0,
            frame_rate: 100.0,
            paced: true,
            endless: true,
            script: VecDeque::new(),
        }
    }

    /// Sleep one frame interval per grab, emulating a real camera cadence.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.frame_rate = fps;
        self
    }

    /// Run `script` first; afterwards report the device removed. Scripted
    /// drivers are not paced so tests run fast.
    pub fn with_script(mut self, script: impl IntoIterator<Item = MockGrab>) -> Self {
        self.script = script.into_iter().collect();
        self.endless = false;
        self.paced = false;
        self
    }

    pub fn endless(mut self, endless: bool) -> Self {
        self.endless = endless;
        self
    }

    fn render(&self) -> GrayImage {
        let (w, h) = (self.roi.width, self.roi.height);
        let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
        let r = (w.min(h) as f64 / 6.0).max(2.0);
        GrayImage::from_fn(w, h, |x, y| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            if dx * dx + dy * dy <= r * r {
                30
            } else {
                190
            }
        })
    }
}

impl FrameDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn sensor_size(&self) -> (u32, u32) {
        (self.sensor_width, self.sensor_height)
    }

    fn image_roi(&self) -> SensorRoi {
        self.roi
    }

    fn image_roi_max(&self) -> SensorRoi {
        SensorRoi::full(
            self.sensor_width / self.binning,
            self.sensor_height / self.binning,
        )
    }

    fn set_image_roi(&mut self, roi: SensorRoi) -> crate::Result<()> {
        let max = self.image_roi_max();
        roi.validate(max.width, max.height)?;
        self.roi = roi;
        Ok(())
    }

    fn binning(&self) -> u32 {
        self.binning
    }

    fn set_binning(&mut self, binning: u32) -> crate::Result<()> {
        if !matches!(binning, 1 | 2 | 4) {
            return Err(crate::Error::InvalidBinning(binning));
        }
        self.binning = binning;
        let max = self.image_roi_max();
        self.roi = self.roi.clamped(max.width, max.height);
        Ok(())
    }

    fn exposure_us(&self) -> f64 {
        self.exposure_us
    }

    fn set_exposure_us(&mut self, value: f64) -> crate::Result<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err("exposure must be positive".into());
        }
        self.exposure_us = value;
        Ok(())
    }

    fn gain_db(&self) -> f64 {
        self.gain_db
    }

    fn set_gain_db(&mut self, value: f64) -> crate::Result<()> {
        if !value.is_finite() || value < 0.0 {
            return Err("gain must be non-negative".into());
        }
        self.gain_db = value;
        Ok(())
    }

    fn resulting_frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn temperature_c(&self) -> Option<f64> {
        Some(41.5)
    }

    fn grab_next(&mut self) -> std::result::Result<DriverFrame, GrabError> {
        if self.paced && self.frame_rate > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(1.0 / self.frame_rate));
        }
        match self.script.pop_front() {
            Some(MockGrab::Frame) => Ok(DriverFrame {
                image: self.render(),
            }),
            Some(MockGrab::Skip) => Err(GrabError::Skipped),
            Some(MockGrab::Remove) => Err(GrabError::Removed),
            None if self.endless => Ok(DriverFrame {
                image: self.render(),
            }),
            None => Err(GrabError::Removed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_plays_out_then_removes() {
        let mut drv = MockDriver::new("mock0", 640, 480)
            .with_script([MockGrab::Frame, MockGrab::Skip, MockGrab::Frame]);
        assert!(drv.grab_next().is_ok());
        assert!(matches!(drv.grab_next(), Err(GrabError::Skipped)));
        assert!(drv.grab_next().is_ok());
        assert!(matches!(drv.grab_next(), Err(GrabError::Removed)));
    }

    #[test]
    fn binning_clamps_roi_and_round_trip_restores_saved_roi() {
        let mut drv = MockDriver::new("mock0", 1280, 1024);
        let saved = SensorRoi {
            offset_x: 320,
            offset_y: 256,
            width: 640,
            height: 512,
        };
        drv.set_image_roi(saved).unwrap();
        drv.set_binning(2).unwrap();
        // bounds are now 640x512; the ROI was clamped deterministically
        let clamped = drv.image_roi();
        assert!(clamped
            .validate(drv.image_roi_max().width, drv.image_roi_max().height)
            .is_ok());
        drv.set_binning(1).unwrap();
        // caller re-applies the saved ROI and gets it back exactly
        drv.set_image_roi(saved).unwrap();
        assert_eq!(drv.image_roi(), saved);
    }

    #[test]
    fn rejects_bad_binning_and_roi() {
        let mut drv = MockDriver::new("mock0", 1280, 1024);
        assert!(drv.set_binning(3).is_err());
        assert!(drv
            .set_image_roi(SensorRoi {
                offset_x: 0,
                offset_y: 0,
                width: 100,
                height: 96,
            })
            .is_err());
        // refused setters leave state unchanged
        assert_eq!(drv.binning(), 1);
        assert_eq!(drv.image_roi(), SensorRoi::full(1280, 1024));
    }

    #[test]
    fn rendered_frame_matches_roi_size() {
        let mut drv = MockDriver::new("mock0", 640, 480);
        drv.set_image_roi(SensorRoi {
            offset_x: 16,
            offset_y: 16,
            width: 320,
            height: 240,
        })
        .unwrap();
        let frame = drv.grab_next().unwrap();
        assert_eq!(frame.image.width(), 320);
        assert_eq!(frame.image.height(), 240);
    }
}
