use std::sync::Arc;

use pupil_detect::{expected_max_axis_px, DetectionStrategy};
use pupil_types::{
    Calibration, CameraImage, DiscreteRoi, GrayImage, ProcMode, Pupil, PupilFrame, RationalRoi,
};

/// Mutable detection configuration, owned by the scheduler and snapshotted
/// per frame.
pub(crate) struct SchedState {
    pub mode: ProcMode,
    /// one entry per ROI role of `mode`
    pub rois: Vec<RationalRoi>,
    /// exactly two entries; single-pupil modes use only the first
    pub strategies: Vec<Box<dyn DetectionStrategy + Send>>,
    pub calibration: Option<Arc<dyn Calibration>>,
    /// Some = auto-parameter adaptation scheduled, consumed by the next frame
    pub auto_param_percent: Option<f64>,
}

impl SchedState {
    pub fn new() -> Self {
        Self {
            mode: ProcMode::Undetermined,
            rois: Vec::new(),
            strategies: vec![
                Box::new(pupil_detect::DarkMoments::default()),
                Box::new(pupil_detect::DarkMoments::default()),
            ],
            calibration: None,
            auto_param_percent: None,
        }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

/// Default ROI layout declared by each processing mode.
///
/// Two-pupil modes partition each view into touching but non-overlapping
/// halves, pupil A on the left.
pub(crate) fn default_rois(mode: ProcMode) -> Vec<RationalRoi> {
    let full = RationalRoi::full();
    let left = RationalRoi {
        x: 0.0,
        y: 0.0,
        w: 0.5,
        h: 1.0,
    };
    let right = RationalRoi {
        x: 0.5,
        y: 0.0,
        w: 0.5,
        h: 1.0,
    };
    match mode {
        ProcMode::Undetermined => vec![],
        ProcMode::SingleImageOnePupil => vec![full],
        ProcMode::SingleImageTwoPupil => vec![left, right],
        ProcMode::StereoImageOnePupil => vec![full, full],
        ProcMode::StereoImageTwoPupil => vec![left, left, right, right],
    }
}

/// ROI roles addressing the same physical image, for the overlap check:
/// regions of distinct pupils in one view may touch but not overlap.
pub(crate) fn same_view_partner(mode: ProcMode, role: usize) -> Option<usize> {
    match mode {
        ProcMode::SingleImageTwoPupil => Some(1 - role),
        ProcMode::StereoImageTwoPupil => Some(match role {
            0 => 2,
            1 => 3,
            2 => 0,
            _ => 1,
        }),
        _ => None,
    }
}

/// Which image and which strategy serve each result slot. Slot order is
/// fixed per mode and equals the ROI role order.
fn slot_view(mode: ProcMode, slot: usize, image: &CameraImage) -> &GrayImage {
    let secondary = image.image_secondary.as_ref().unwrap_or(&image.image);
    match mode {
        ProcMode::StereoImageOnePupil | ProcMode::StereoImageTwoPupil => {
            if slot % 2 == 0 {
                &image.image
            } else {
                secondary
            }
        }
        _ => &image.image,
    }
}

fn slot_strategy(mode: ProcMode, slot: usize) -> usize {
    match mode {
        ProcMode::SingleImageTwoPupil => slot,
        ProcMode::StereoImageTwoPupil => slot / 2,
        _ => 0,
    }
}

/// Undistorted major-axis length: undistort the two endpoints of the major
/// axis and measure their distance.
fn undistorted_diameter(cal: &dyn Calibration, p: &Pupil) -> f64 {
    let theta = p.angle.to_radians();
    let (dx, dy) = if p.width >= p.height {
        (theta.cos(), theta.sin())
    } else {
        (-theta.sin(), theta.cos())
    };
    let half = p.diameter() / 2.0;
    let a = cal.undistort((p.center_x - dx * half, p.center_y - dy * half));
    let b = cal.undistort((p.center_x + dx * half, p.center_y + dy * half));
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// The per-frame procedure: discretise ROIs, run the scheduled auto-param
/// pass, detect per slot, re-base coordinates, apply calibration, and
/// assemble the fixed-slot result vector.
pub(crate) fn process_frame(
    state: &mut SchedState,
    image: &CameraImage,
    trial: u64,
) -> (PupilFrame, Vec<DiscreteRoi>) {
    let mode = state.mode;
    let (w, h) = (image.image.width(), image.image.height());

    let rois: Vec<DiscreteRoi> = state.rois.iter().map(|r| r.discretise(w, h)).collect();

    if let Some(percent) = state.auto_param_percent.take() {
        let px = expected_max_axis_px(percent, w, h);
        for strategy in &mut state.strategies {
            strategy.apply_expected_max_pupil(px);
        }
    }

    let mut pupils = Vec::with_capacity(mode.slot_count());
    for slot in 0..mode.slot_count() {
        let roi = &rois[slot];
        let view = slot_view(mode, slot, image);
        let sub = view.crop(roi);
        let pupil = state.strategies[slot_strategy(mode, slot)]
            .detect(&sub)
            .map(|p| p.shift(roi.x as f64, roi.y as f64))
            .unwrap_or_else(Pupil::invalid);
        pupils.push(pupil);
    }

    if let Some(cal) = &state.calibration {
        for pupil in pupils.iter_mut() {
            if pupil.valid(-2.0) {
                pupil.undistorted_diameter_px = Some(undistorted_diameter(cal.as_ref(), pupil));
            }
        }
        if mode.is_stereo() {
            for pair_start in (0..pupils.len()).step_by(2) {
                let mm = cal.physical_diameter_mm(
                    &pupils[pair_start],
                    &pupils[pair_start + 1],
                    (w, h),
                );
                if let Some(mm) = mm {
                    pupils[pair_start].physical_diameter_mm = Some(mm);
                    pupils[pair_start + 1].physical_diameter_mm = Some(mm);
                }
            }
        }
    }

    let frame = PupilFrame {
        timestamp_ms: image.timestamp_ms,
        mode,
        pupils,
        trial,
        image_id: image.image_id(),
    };
    (frame, rois)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pupil_types::{ScaleCalibration, SourceKind};

    fn two_pupil_image(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let left = {
                let dx = x as f64 - w as f64 * 0.25;
                let dy = y as f64 - h as f64 / 2.0;
                dx * dx + dy * dy <= 15.0 * 15.0
            };
            let right = {
                let dx = x as f64 - w as f64 * 0.75;
                let dy = y as f64 - h as f64 / 2.0;
                dx * dx + dy * dy <= 10.0 * 10.0
            };
            if left || right {
                25
            } else {
                210
            }
        })
    }

    fn state_for(mode: ProcMode) -> SchedState {
        let mut state = SchedState::new();
        state.mode = mode;
        state.rois = default_rois(mode);
        state
    }

    #[test]
    fn single_two_slots_are_left_then_right() {
        let im = two_pupil_image(320, 240);
        let frame = CameraImage::new_single(1000, SourceKind::FileSingle, 0, im);
        let mut state = state_for(ProcMode::SingleImageTwoPupil);
        let (result, rois) = process_frame(&mut state, &frame, 0);
        assert_eq!(result.pupils.len(), 2);
        assert_eq!(rois.len(), 2);
        let a = &result.pupils[0];
        let b = &result.pupils[1];
        assert!(a.valid(-2.0) && b.valid(-2.0));
        // slot A holds the left pupil in image coordinates
        assert!((a.center_x - 80.0).abs() < 2.0, "a at {}", a.center_x);
        assert!((b.center_x - 240.0).abs() < 2.0, "b at {}", b.center_x);
        assert!(a.major_axis() > b.major_axis());
    }

    #[test]
    fn stereo_two_slot_order_and_physical_diameter() {
        let w = 320;
        let h = 240;
        let primary = two_pupil_image(w, h);
        let secondary = two_pupil_image(w, h);
        let frame =
            CameraImage::new_stereo(0, SourceKind::LiveStereo, 0, primary, secondary).unwrap();
        let mut state = state_for(ProcMode::StereoImageTwoPupil);
        state.calibration = Some(Arc::new(ScaleCalibration { pixels_per_mm: 10.0 }));
        let (result, _) = process_frame(&mut state, &frame, 3);
        assert_eq!(result.pupils.len(), 4);
        assert_eq!(result.trial, 3);
        // A (left, diameter 30 px) in slots 0/1; B (right, 20 px) in 2/3
        assert!((result.pupils[0].diameter() - 30.0).abs() < 3.0);
        assert!((result.pupils[2].diameter() - 20.0).abs() < 3.0);
        for pair in [(0, 1), (2, 3)] {
            assert_eq!(
                result.pupils[pair.0].physical_diameter_mm,
                result.pupils[pair.1].physical_diameter_mm
            );
            assert!(result.pupils[pair.0].physical_diameter_mm.is_some());
        }
        // identity undistortion: undistorted diameter equals the pixel one
        let p = &result.pupils[0];
        assert!(
            (p.undistorted_diameter_px.unwrap() - p.diameter()).abs() < 1e-9
        );
    }

    #[test]
    fn failed_slot_keeps_its_position_and_no_physical_diameter() {
        let w = 320;
        let h = 240;
        // pupil only in the primary view
        let primary = GrayImage::from_fn(w, h, |x, y| {
            let dx = x as f64 - 160.0;
            let dy = y as f64 - 120.0;
            if dx * dx + dy * dy <= 15.0 * 15.0 {
                25
            } else {
                210
            }
        });
        let secondary = GrayImage::filled(w, h, 210);
        let frame =
            CameraImage::new_stereo(0, SourceKind::LiveStereo, 0, primary, secondary).unwrap();
        let mut state = state_for(ProcMode::StereoImageOnePupil);
        state.calibration = Some(Arc::new(ScaleCalibration { pixels_per_mm: 10.0 }));
        let (result, _) = process_frame(&mut state, &frame, 0);
        assert_eq!(result.pupils.len(), 2);
        assert!(result.pupils[0].valid(-2.0));
        assert!(!result.pupils[1].valid(-2.0));
        assert_eq!(result.pupils[0].physical_diameter_mm, None);
        assert_eq!(result.pupils[1].physical_diameter_mm, None);
    }

    #[test]
    fn auto_param_is_consumed_once() {
        let im = two_pupil_image(320, 240);
        let frame = CameraImage::new_single(0, SourceKind::FileSingle, 0, im);
        let mut state = state_for(ProcMode::SingleImageOnePupil);
        state.auto_param_percent = Some(30.0);
        let _ = process_frame(&mut state, &frame, 0);
        assert_eq!(state.auto_param_percent, None);
    }
}
