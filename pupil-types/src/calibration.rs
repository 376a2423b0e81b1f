use crate::Pupil;

/// Read-only calibration bundle attached to the detection pipeline.
///
/// The pipeline only consumes these two operations; how the calibration was
/// produced is another component's concern.
pub trait Calibration: Send + Sync {
    /// Map a distorted pixel coordinate to its undistorted position.
    fn undistort(&self, p: (f64, f64)) -> (f64, f64);

    /// Physical pupil diameter from paired views of the same pupil.
    ///
    /// Returns None when either detection is invalid.
    fn physical_diameter_mm(
        &self,
        view1: &Pupil,
        view2: &Pupil,
        image_size: (u32, u32),
    ) -> Option<f64>;
}

/// Pixel-pitch calibration: a fixed number of sensor pixels per millimeter.
///
/// Adequate for file playback of archives recorded with a known optical
/// setup, and for tests. Undistortion is the identity.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScaleCalibration {
    pub pixels_per_mm: f64,
}

impl Calibration for ScaleCalibration {
    fn undistort(&self, p: (f64, f64)) -> (f64, f64) {
        p
    }

    fn physical_diameter_mm(
        &self,
        view1: &Pupil,
        view2: &Pupil,
        _image_size: (u32, u32),
    ) -> Option<f64> {
        if !view1.valid(-2.0) || !view2.valid(-2.0) {
            return None;
        }
        if self.pixels_per_mm <= 0.0 {
            return None;
        }
        let mean_px = (view1.diameter() + view2.diameter()) / 2.0;
        Some(mean_px / self.pixels_per_mm)
    }
}
