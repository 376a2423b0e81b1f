use pupil_types::{DiscreteRoi, GrayImage};

/// Spatial and central moments of the sub-threshold region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RegionMoments {
    /// pixel count of the region
    pub m00: f64,
    pub cx: f64,
    pub cy: f64,
    pub mu20: f64,
    pub mu11: f64,
    pub mu02: f64,
    /// region pixels lying on the image border
    pub border_pixels: u64,
}

impl RegionMoments {
    /// Accumulate the binary region `pixel <= threshold` within `window`
    /// (clamped to the image).
    pub fn accumulate(im: &GrayImage, threshold: u8, window: &DiscreteRoi) -> Option<Self> {
        let x0 = window.x.min(im.width());
        let y0 = window.y.min(im.height());
        let x1 = window.x.saturating_add(window.w).min(im.width());
        let y1 = window.y.saturating_add(window.h).min(im.height());

        let (mut m00, mut m10, mut m01) = (0.0f64, 0.0f64, 0.0f64);
        let mut border_pixels = 0u64;
        for y in y0..y1 {
            let row = im.row(y);
            for x in x0..x1 {
                if row[x as usize] <= threshold {
                    m00 += 1.0;
                    m10 += x as f64;
                    m01 += y as f64;
                    if x == 0 || y == 0 || x == im.width() - 1 || y == im.height() - 1 {
                        border_pixels += 1;
                    }
                }
            }
        }
        if m00 == 0.0 {
            return None;
        }
        let cx = m10 / m00;
        let cy = m01 / m00;

        let (mut mu20, mut mu11, mut mu02) = (0.0f64, 0.0f64, 0.0f64);
        for y in y0..y1 {
            let row = im.row(y);
            for x in x0..x1 {
                if row[x as usize] <= threshold {
                    let dx = x as f64 - cx;
                    let dy = y as f64 - cy;
                    mu20 += dx * dx;
                    mu11 += dx * dy;
                    mu02 += dy * dy;
                }
            }
        }
        Some(Self {
            m00,
            cx,
            cy,
            mu20: mu20 / m00,
            mu11: mu11 / m00,
            mu02: mu02 / m00,
            border_pixels,
        })
    }
}

/// Eigen decomposition of the real symmetric 2x2 covariance.
fn eigen_symmetric_2x2(a: f64, b: f64, d: f64) -> ((f64, f64), f64) {
    // eigenvalues of [[a, b], [b, d]]
    let trace_half = (a + d) / 2.0;
    let det = a * d - b * b;
    let disc = (trace_half * trace_half - det).max(0.0).sqrt();
    let l1 = trace_half + disc;
    let l2 = trace_half - disc;
    // orientation of the major eigenvector
    let angle = if b.abs() < 1e-12 {
        if a >= d {
            0.0
        } else {
            std::f64::consts::FRAC_PI_2
        }
    } else {
        (l1 - a).atan2(b)
    };
    ((l1, l2), angle)
}

/// Ellipse (full width, full height, angle in degrees) equivalent to the
/// region described by `m`.
///
/// For a filled ellipse with semi-axes (p, q) the covariance eigenvalues are
/// p^2/4 and q^2/4, so each full axis is 4 * sqrt(lambda).
pub(crate) fn fit_ellipse(m: &RegionMoments) -> (f64, f64, f64) {
    let ((l1, l2), angle) = eigen_symmetric_2x2(m.mu20, m.mu11, m.mu02);
    let width = 4.0 * l1.max(0.0).sqrt();
    let height = 4.0 * l2.max(0.0).sqrt();
    (width, height, angle.to_degrees())
}

/// Build a [pupil_types::Pupil] from fitted region moments, rejecting fits
/// whose axes fall outside [min_axis, max_axis].
pub(crate) fn pupil_from_moments(
    m: &RegionMoments,
    min_axis: f64,
    max_axis: f64,
) -> Option<pupil_types::Pupil> {
    let (width, height, angle) = fit_ellipse(m);
    if width < min_axis || height < min_axis || width > max_axis || height > max_axis {
        return None;
    }
    let ellipse_area = std::f64::consts::PI * (width / 2.0) * (height / 2.0);
    let fill_ratio = if ellipse_area > 0.0 {
        (m.m00 / ellipse_area).min(1.0)
    } else {
        0.0
    };
    let border_fraction = m.border_pixels as f64 / m.m00;
    Some(pupil_types::Pupil {
        center_x: m.cx,
        center_y: m.cy,
        width,
        height,
        angle,
        confidence: fill_ratio,
        outline_confidence: (1.0 - border_fraction).max(0.0),
        physical_diameter_mm: None,
        undistorted_diameter_px: None,
    })
}
