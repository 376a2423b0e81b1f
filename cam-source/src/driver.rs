use pupil_types::GrayImage;

/// Image ROI on the sensor, in (possibly binned) sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorRoi {
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
}

impl SensorRoi {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            offset_x: 0,
            offset_y: 0,
            width,
            height,
        }
    }

    /// Validate the driver constraints: width and height multiples of 16,
    /// and the rectangle must fit within `max` minus the offsets.
    ///
    /// Refusal, never clamping: an out-of-bounds request is the caller's
    /// configuration error.
    pub fn validate(&self, max_width: u32, max_height: u32) -> crate::Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(crate::Error::InvalidImageRoi("zero-sized".to_string()));
        }
        if self.width % 16 != 0 || self.height % 16 != 0 {
            return Err(crate::Error::InvalidImageRoi(format!(
                "{}x{} not multiples of 16",
                self.width, self.height
            )));
        }
        if self.offset_x + self.width > max_width || self.offset_y + self.height > max_height {
            return Err(crate::Error::InvalidImageRoi(format!(
                "{}+{} x {}+{} exceeds {}x{}",
                self.offset_x, self.width, self.offset_y, self.height, max_width, max_height
            )));
        }
        Ok(())
    }

    /// Deterministic clamp used when a binning change shrinks the sensor
    /// bounds: offset first, then size, both snapped down to multiples of
    /// 16. On a grow the ROI is left alone; re-expanding is the caller's
    /// choice.
    pub fn clamped(&self, max_width: u32, max_height: u32) -> Self {
        let snap = |v: u32| v / 16 * 16;
        let offset_x = self.offset_x.min(max_width.saturating_sub(16));
        let offset_y = self.offset_y.min(max_height.saturating_sub(16));
        let width = snap(self.width.min(max_width - offset_x)).max(16);
        let height = snap(self.height.min(max_height - offset_y)).max(16);
        Self {
            offset_x,
            offset_y,
            width,
            height,
        }
    }
}

/// One completed buffer from a driver.
#[derive(Debug)]
pub struct DriverFrame {
    pub image: GrayImage,
}

/// Why a grab produced no frame.
#[derive(Debug, thiserror::Error)]
pub enum GrabError {
    /// incomplete or skipped buffer; telemetry only, the grab loop continues
    #[error("frame skipped")]
    Skipped,
    /// the device disappeared; the source transitions to closed
    #[error("device removed")]
    Removed,
    #[error("driver error: {0}")]
    Fatal(String),
}

/// Blocking driver abstraction implemented per camera backend.
///
/// All setters validate synchronously and refuse rather than clamp, except
/// the binning-induced ROI clamp which is deterministic per
/// [SensorRoi::clamped]. `grab_next` blocks on the driver/OS wait.
pub trait FrameDriver: Send {
    fn name(&self) -> &str;

    /// Sensor size at binning 1.
    fn sensor_size(&self) -> (u32, u32);

    fn image_roi(&self) -> SensorRoi;
    /// Maximum ROI under the current binning.
    fn image_roi_max(&self) -> SensorRoi;
    fn set_image_roi(&mut self, roi: SensorRoi) -> crate::Result<()>;

    fn binning(&self) -> u32;
    fn set_binning(&mut self, binning: u32) -> crate::Result<()>;

    fn exposure_us(&self) -> f64;
    fn set_exposure_us(&mut self, value: f64) -> crate::Result<()>;

    fn gain_db(&self) -> f64;
    fn set_gain_db(&mut self, value: f64) -> crate::Result<()>;

    /// Frame rate the device will deliver under current settings.
    fn resulting_frame_rate(&self) -> f64;

    /// Sensor temperature in degrees C, when the device reports one.
    fn temperature_c(&self) -> Option<f64> {
        None
    }

    fn grab_next(&mut self) -> std::result::Result<DriverFrame, GrabError>;
}
