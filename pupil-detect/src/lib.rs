//! Pluggable pupil-detection strategies.
//!
//! A strategy receives one grayscale region of interest and returns at most
//! one pupil ellipse with confidences. Strategies own their parameters; the
//! only cross-strategy contract is [DetectionStrategy::apply_expected_max_pupil],
//! the one-shot auto-parameter hook.

use pupil_types::{GrayImage, Pupil};

mod moments;

mod dark_moments;
pub use dark_moments::{DarkMoments, DarkMomentsParams};

mod center_surround;
pub use center_surround::{CenterSurround, CenterSurroundParams};

pub trait DetectionStrategy: Send {
    fn name(&self) -> &'static str;

    /// Detect at most one pupil in `im`.
    ///
    /// Coordinates of the returned pupil are local to `im`; the caller
    /// re-bases them into full-image coordinates.
    fn detect(&self, im: &GrayImage) -> Option<Pupil>;

    /// Derive strategy parameters from the expected maximum pupil axis,
    /// given in pixels of the image the strategy will run on.
    ///
    /// The mapping is strategy-private; callers only guarantee this runs
    /// once per schedule and before detection on the triggering frame.
    fn apply_expected_max_pupil(&mut self, max_axis_px: f64);
}

/// Expected maximum pupil axis in pixels from the configured percentage of
/// the shorter image axis.
pub fn expected_max_axis_px(percent: f64, width: u32, height: u32) -> f64 {
    percent / 100.0 * width.min(height) as f64
}

pub fn strategy_by_name(name: &str) -> Option<Box<dyn DetectionStrategy + Send>> {
    match name {
        "dark_moments" => Some(Box::new(DarkMoments::default())),
        "center_surround" => Some(Box::new(CenterSurround::default())),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testimg {
    use pupil_types::GrayImage;

    /// Bright field with a dark filled ellipse, the shape every strategy
    /// must find.
    pub fn dark_ellipse(
        width: u32,
        height: u32,
        cx: f64,
        cy: f64,
        rx: f64,
        ry: f64,
    ) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let dx = (x as f64 - cx) / rx;
            let dy = (y as f64 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                20
            } else {
                200
            }
        })
    }
}
