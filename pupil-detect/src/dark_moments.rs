use pupil_types::{DiscreteRoi, GrayImage, Pupil};

use crate::moments::{pupil_from_moments, RegionMoments};
use crate::DetectionStrategy;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DarkMomentsParams {
    /// added to the darkest pixel value to form the region threshold
    pub threshold_offset: u8,
    /// smallest acceptable full ellipse axis, pixels
    pub min_axis_px: f64,
    /// largest acceptable full ellipse axis, pixels
    pub max_axis_px: f64,
}

impl Default for DarkMomentsParams {
    fn default() -> Self {
        Self {
            threshold_offset: 25,
            min_axis_px: 6.0,
            max_axis_px: 400.0,
        }
    }
}

/// Threshold-and-moments detector.
///
/// The pupil is taken as the connected mass of pixels within
/// `threshold_offset` of the darkest pixel; its image moments give the
/// equivalent ellipse.
#[derive(Debug, Default)]
pub struct DarkMoments {
    params: DarkMomentsParams,
}

impl DarkMoments {
    pub fn new(params: DarkMomentsParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DarkMomentsParams {
        &self.params
    }
}

impl DetectionStrategy for DarkMoments {
    fn name(&self) -> &'static str {
        "dark_moments"
    }

    fn detect(&self, im: &GrayImage) -> Option<Pupil> {
        if im.width() == 0 || im.height() == 0 {
            return None;
        }
        let darkest = (0..im.height())
            .flat_map(|y| im.row(y).iter().copied())
            .min()?;
        let threshold = darkest.saturating_add(self.params.threshold_offset);
        let window = DiscreteRoi {
            x: 0,
            y: 0,
            w: im.width(),
            h: im.height(),
        };
        let m = RegionMoments::accumulate(im, threshold, &window)?;
        pupil_from_moments(&m, self.params.min_axis_px, self.params.max_axis_px)
    }

    fn apply_expected_max_pupil(&mut self, max_axis_px: f64) {
        self.params.max_axis_px = max_axis_px;
        self.params.min_axis_px = (max_axis_px / 10.0).max(2.0);
    }
}
