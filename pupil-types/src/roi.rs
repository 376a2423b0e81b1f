/// Region of interest in fractions of the image size.
///
/// This is the persisted form; it is materialized to pixel coordinates per
/// frame with [RationalRoi::discretise] so a configured region survives
/// resolution and binning changes.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RationalRoi {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl RationalRoi {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> crate::Result<Self> {
        for v in [x, y, w, h] {
            if !v.is_finite() {
                return Err(crate::Error::RoiOutOfBounds);
            }
        }
        if w <= 0.0 || h <= 0.0 {
            return Err(crate::Error::DegenerateRoi);
        }
        if x < 0.0 || y < 0.0 || x + w > 1.0 || y + h > 1.0 {
            return Err(crate::Error::RoiOutOfBounds);
        }
        Ok(Self { x, y, w, h })
    }

    /// Whole image.
    pub fn full() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            w: 1.0,
            h: 1.0,
        }
    }

    pub fn discretise(&self, width: u32, height: u32) -> DiscreteRoi {
        DiscreteRoi {
            x: (self.x * width as f64).round() as u32,
            y: (self.y * height as f64).round() as u32,
            w: (self.w * width as f64).round() as u32,
            h: (self.h * height as f64).round() as u32,
        }
    }

    /// True when the interiors intersect. Touching borders is allowed for
    /// regions assigned to distinct pupils of one image.
    pub fn overlaps(&self, other: &RationalRoi) -> bool {
        self.x < other.x + other.w
            && other.x < self.x + self.w
            && self.y < other.y + other.h
            && other.y < self.y + self.h
    }
}

/// Pixel-coordinate region, valid for one frame geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DiscreteRoi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl DiscreteRoi {
    pub fn overlaps(&self, other: &DiscreteRoi) -> bool {
        self.x < other.x + other.w
            && other.x < self.x + self.w
            && self.y < other.y + other.h
            && other.y < self.y + self.h
    }
}
