use pupil_types::{DiscreteRoi, GrayImage, Pupil};

use crate::moments::{pupil_from_moments, RegionMoments};
use crate::DetectionStrategy;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CenterSurroundParams {
    /// search window edge length, pixels; also the maximum accepted axis
    pub window_px: u32,
    pub threshold_offset: u8,
}

impl Default for CenterSurroundParams {
    fn default() -> Self {
        Self {
            window_px: 120,
            threshold_offset: 25,
        }
    }
}

/// Coarse-to-fine detector: a center-surround response scan locates the
/// window with the darkest interior relative to its surround, then the
/// moments fit from [DarkMoments](crate::DarkMoments) refines inside that
/// window only.
///
/// Slower per window than the plain moments fit but robust against dark
/// clutter near the image edges (lashes, shadows).
#[derive(Debug, Default)]
pub struct CenterSurround {
    params: CenterSurroundParams,
}

impl CenterSurround {
    pub fn new(params: CenterSurroundParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &CenterSurroundParams {
        &self.params
    }

    fn mean_of(im: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> f64 {
        let mut sum = 0u64;
        let mut n = 0u64;
        for y in y0..y1 {
            let row = im.row(y);
            for x in x0..x1 {
                sum += row[x as usize] as u64;
                n += 1;
            }
        }
        if n == 0 {
            0.0
        } else {
            sum as f64 / n as f64
        }
    }

    /// Best window by surround-minus-center response, or None for images
    /// smaller than one window.
    fn best_window(&self, im: &GrayImage) -> Option<DiscreteRoi> {
        let win = self.params.window_px.min(im.width()).min(im.height());
        if win < 4 {
            return None;
        }
        let step = (win / 4).max(1);
        let quarter = win / 4;
        let mut best: Option<(f64, DiscreteRoi)> = None;
        let mut y = 0;
        while y + win <= im.height() {
            let mut x = 0;
            while x + win <= im.width() {
                let outer = Self::mean_of(im, x, y, x + win, y + win);
                let inner = Self::mean_of(
                    im,
                    x + quarter,
                    y + quarter,
                    x + win - quarter,
                    y + win - quarter,
                );
                let response = outer - inner;
                if best.map(|(r, _)| response > r).unwrap_or(true) {
                    best = Some((
                        response,
                        DiscreteRoi {
                            x,
                            y,
                            w: win,
                            h: win,
                        },
                    ));
                }
                x += step;
            }
            y += step;
        }
        best.map(|(_, roi)| roi)
    }
}

impl DetectionStrategy for CenterSurround {
    fn name(&self) -> &'static str {
        "center_surround"
    }

    fn detect(&self, im: &GrayImage) -> Option<Pupil> {
        let window = self.best_window(im)?;
        let darkest = (window.y..window.y + window.h)
            .flat_map(|y| {
                let row = im.row(y);
                (window.x..window.x + window.w).map(move |x| row[x as usize])
            })
            .min()?;
        let threshold = darkest.saturating_add(self.params.threshold_offset);
        let m = RegionMoments::accumulate(im, threshold, &window)?;
        let max_axis = window.w as f64;
        pupil_from_moments(&m, (max_axis / 10.0).max(2.0), max_axis)
    }

    fn apply_expected_max_pupil(&mut self, max_axis_px: f64) {
        self.params.window_px = (max_axis_px.max(4.0)) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testimg::dark_ellipse;

    #[test]
    fn finds_off_center_pupil() {
        let im = dark_ellipse(320, 240, 90.0, 150.0, 22.0, 18.0);
        let strat = CenterSurround::default();
        let p = strat.detect(&im).expect("pupil");
        assert!((p.center_x - 90.0).abs() < 2.0);
        assert!((p.center_y - 150.0).abs() < 2.0);
        assert!((p.major_axis() - 44.0).abs() < 4.0);
    }

    #[test]
    fn auto_param_resizes_window() {
        let mut strat = CenterSurround::default();
        strat.apply_expected_max_pupil(64.0);
        assert_eq!(strat.params().window_px, 64);
    }

    #[test]
    fn tiny_image_yields_nothing() {
        let im = GrayImage::filled(3, 3, 10);
        assert!(CenterSurround::default().detect(&im).is_none());
    }
}
