use std::f64::consts::PI;

/// Detected pupil ellipse with quality measures.
///
/// Center coordinates are in pixels of the image the detection ran on, not
/// of the full sensor. Invalid pupils (see [Pupil::invalid]) are emitted so
/// downstream sinks keep one slot per expected detection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Pupil {
    pub center_x: f64,
    pub center_y: f64,
    /// full length of the first ellipse axis, pixels
    pub width: f64,
    /// full length of the second ellipse axis, pixels
    pub height: f64,
    /// rotation of the first axis, degrees
    pub angle: f64,
    /// detection confidence in [0,1]
    pub confidence: f64,
    /// fraction of the ellipse outline supported by image evidence, [0,1]
    pub outline_confidence: f64,
    /// physical diameter, populated only with a stereo calibration attached
    pub physical_diameter_mm: Option<f64>,
    /// diameter after undistortion, populated only with a calibration attached
    pub undistorted_diameter_px: Option<f64>,
}

impl Pupil {
    /// Sentinel emitted for a slot where detection failed.
    pub fn invalid() -> Self {
        Self {
            center_x: -1.0,
            center_y: -1.0,
            width: -1.0,
            height: -1.0,
            angle: 0.0,
            confidence: 0.0,
            outline_confidence: 0.0,
            physical_diameter_mm: None,
            undistorted_diameter_px: None,
        }
    }

    /// True iff both axes are strictly positive beyond `tolerance`.
    pub fn valid(&self, tolerance: f64) -> bool {
        self.width > tolerance && self.height > tolerance && self.width > 0.0 && self.height > 0.0
    }

    pub fn major_axis(&self) -> f64 {
        self.width.max(self.height)
    }

    pub fn minor_axis(&self) -> f64 {
        self.width.min(self.height)
    }

    /// Diameter reported downstream: the major axis.
    pub fn diameter(&self) -> f64 {
        self.major_axis()
    }

    pub fn area(&self) -> f64 {
        PI * (self.width / 2.0) * (self.height / 2.0)
    }

    /// Ellipse circumference, Ramanujan approximation.
    pub fn circumference(&self) -> f64 {
        let a = self.major_axis() / 2.0;
        let b = self.minor_axis() / 2.0;
        PI * (3.0 * (a + b) - ((3.0 * a + b) * (a + 3.0 * b)).sqrt())
    }

    /// Translate the center, used to re-base ROI-local detections into image
    /// coordinates.
    pub fn shift(mut self, dx: f64, dy: f64) -> Self {
        if self.valid(-2.0) {
            self.center_x += dx;
            self.center_y += dy;
        }
        self
    }
}
