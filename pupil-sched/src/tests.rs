use super::*;

use pupil_types::GrayImage;

fn pupil_image(w: u32, h: u32, cx: f64, cy: f64, r: f64) -> GrayImage {
    GrayImage::from_fn(w, h, |x, y| {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        if dx * dx + dy * dy <= r * r {
            25
        } else {
            210
        }
    })
}

fn single_frame(timestamp_ms: i64, frame_number: u64) -> Arc<CameraImage> {
    Arc::new(CameraImage::new_single(
        timestamp_ms,
        SourceKind::FileSingle,
        frame_number,
        pupil_image(320, 240, 160.0, 120.0, 20.0),
    ))
}

struct Rig {
    camera: Arc<Hub<CameraEvent>>,
    scheduler: DetectionScheduler,
    tracker: Arc<EventTracker>,
}

fn rig(kind: SourceKind, mode: ProcMode) -> Rig {
    let tracker = EventTracker::shared();
    let camera = Arc::new(Hub::new());
    let scheduler = DetectionScheduler::new(tracker.clone());
    scheduler.attach_source(camera.clone(), kind);
    scheduler.set_proc_mode(mode).unwrap();
    Rig {
        camera,
        scheduler,
        tracker,
    }
}

fn recv_data(
    rx: &crossbeam_channel::Receiver<SchedulerEvent>,
    n: usize,
) -> Vec<PupilFrame> {
    let mut frames = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while frames.len() < n && Instant::now() < deadline {
        if let Ok(SchedulerEvent::ProcessedPupilData(frame)) =
            rx.recv_timeout(Duration::from_millis(100))
        {
            frames.push(frame);
        }
    }
    frames
}

#[test]
fn incompatible_mode_is_refused_and_mode_unchanged() {
    let rig = rig(SourceKind::LiveSingle, ProcMode::SingleImageOnePupil);
    let err = rig
        .scheduler
        .set_proc_mode(ProcMode::StereoImageOnePupil)
        .unwrap_err();
    assert!(matches!(err, Error::IncompatibleProcMode { .. }));
    assert_eq!(rig.scheduler.proc_mode(), ProcMode::SingleImageOnePupil);
}

#[test]
fn start_requires_source_and_determined_mode() {
    let tracker = EventTracker::shared();
    let scheduler = DetectionScheduler::new(tracker);
    assert!(matches!(scheduler.start(), Err(Error::NoSourceAttached)));

    let rig = rig(SourceKind::LiveSingle, ProcMode::SingleImageOnePupil);
    let fresh = DetectionScheduler::new(rig.tracker.clone());
    fresh.attach_source(rig.camera.clone(), SourceKind::LiveSingle);
    assert!(matches!(fresh.start(), Err(Error::UndeterminedMode)));
}

#[test]
fn processes_frames_with_stable_slot_count_and_trial_zero() {
    let rig = rig(SourceKind::FileSingle, ProcMode::SingleImageOnePupil);
    let rx = rig.scheduler.events().subscribe();
    rig.scheduler.start().unwrap();

    for i in 0..3 {
        rig.camera
            .publish(CameraEvent::NewImage(single_frame(1000 + i, i as u64)));
        // pace the producer so the latest-wins mailbox keeps every frame
        std::thread::sleep(Duration::from_millis(10));
    }
    let frames = recv_data(&rx, 3);
    assert_eq!(frames.len(), 3);
    for frame in &frames {
        assert_eq!(frame.pupils.len(), 1);
        assert_eq!(frame.trial, 0);
        assert!(frame.pupils[0].valid(-2.0));
        assert!((frame.pupils[0].center_x - 160.0).abs() < 1.5);
    }
    rig.scheduler.stop();
    rig.scheduler.stop(); // idempotent
}

#[test]
fn end_of_source_drains_and_finishes() {
    let rig = rig(SourceKind::FileSingle, ProcMode::SingleImageOnePupil);
    let rx = rig.scheduler.events().subscribe();
    rig.scheduler.start().unwrap();
    rig.camera
        .publish(CameraEvent::NewImage(single_frame(1000, 0)));
    rig.camera.publish(CameraEvent::EndReached);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut data = 0;
    let mut finished = false;
    while !finished && Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(SchedulerEvent::ProcessedPupilData(_)) => data += 1,
            Ok(SchedulerEvent::ProcessingFinished) => finished = true,
            _ => {}
        }
    }
    assert!(finished, "ProcessingFinished after source end");
    assert_eq!(data, 1, "the in-flight frame is processed before finishing");
}

#[test]
fn trial_numbers_follow_the_event_tracker() {
    let rig = rig(SourceKind::FileSingle, ProcMode::SingleImageOnePupil);
    rig.tracker.add_trial_increment(1500);
    let rx = rig.scheduler.events().subscribe();
    rig.scheduler.start().unwrap();

    rig.camera
        .publish(CameraEvent::NewImage(single_frame(1000, 0)));
    std::thread::sleep(Duration::from_millis(20));
    rig.camera
        .publish(CameraEvent::NewImage(single_frame(2000, 1)));

    let frames = recv_data(&rx, 2);
    assert_eq!(frames[0].trial, 0);
    assert_eq!(frames[1].trial, 1);
}

#[test]
fn playback_wrap_resets_trial_exactly_once() {
    let rig = rig(SourceKind::FileSingle, ProcMode::SingleImageOnePupil);
    let rx = rig.scheduler.events().subscribe();
    rig.scheduler.start().unwrap();

    let t0 = now_ms();
    rig.tracker.add_trial_increment(t0);
    rig.camera
        .publish(CameraEvent::NewImage(single_frame(now_ms(), 0)));
    std::thread::sleep(Duration::from_millis(20));
    rig.camera.publish(CameraEvent::Wrapped);
    std::thread::sleep(Duration::from_millis(20));
    rig.camera
        .publish(CameraEvent::NewImage(single_frame(now_ms(), 0)));

    let frames = recv_data(&rx, 2);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].trial, 1, "pre-wrap frame keeps its trial");
    assert_eq!(frames[1].trial, 0, "post-wrap frame sees the reset");
}

#[test]
fn auto_param_one_shot_is_cleared_by_next_frame() {
    let rig = rig(SourceKind::FileSingle, ProcMode::SingleImageOnePupil);
    assert!(rig.scheduler.schedule_auto_param(150.0).is_err());
    assert!(rig.scheduler.schedule_auto_param(10.0).is_err());
    rig.scheduler.schedule_auto_param(30.0).unwrap();
    assert!(rig.scheduler.auto_param_scheduled());

    let rx = rig.scheduler.events().subscribe();
    rig.scheduler.start().unwrap();
    rig.camera
        .publish(CameraEvent::NewImage(single_frame(1000, 0)));
    let frames = recv_data(&rx, 1);
    assert_eq!(frames.len(), 1);
    assert!(
        !rig.scheduler.auto_param_scheduled(),
        "flag consumed by the triggering frame"
    );
}

#[test]
fn roi_overlap_is_refused() {
    let rig = rig(SourceKind::FileSingle, ProcMode::SingleImageTwoPupil);
    // touching halves are the default and fine; an overlapping region is not
    let wide = RationalRoi::new(0.3, 0.0, 0.4, 1.0).unwrap();
    assert!(matches!(
        rig.scheduler.set_roi(0, wide),
        Err(Error::OverlappingRois)
    ));
    let narrower = RationalRoi::new(0.0, 0.2, 0.5, 0.6).unwrap();
    rig.scheduler.set_roi(0, narrower).unwrap();
    assert_eq!(rig.scheduler.rois()[0], narrower);
    assert!(matches!(
        rig.scheduler.set_roi(5, narrower),
        Err(Error::RoiRoleOutOfRange(5))
    ));
}

#[test]
fn strategy_selection_by_name() {
    let rig = rig(SourceKind::FileSingle, ProcMode::SingleImageTwoPupil);
    rig.scheduler.set_strategy(1, "center_surround").unwrap();
    assert_eq!(
        rig.scheduler.strategy_names(),
        vec!["dark_moments", "center_surround"]
    );
    assert!(matches!(
        rig.scheduler.set_strategy(0, "starburst"),
        Err(Error::UnknownStrategy(_))
    ));
}

#[test]
fn preview_is_throttled_data_is_not() {
    let rig = rig(SourceKind::FileSingle, ProcMode::SingleImageOnePupil);
    let rx = rig.scheduler.events().subscribe();
    rig.scheduler.start().unwrap();

    // burst faster than the preview interval
    for i in 0..4 {
        rig.camera
            .publish(CameraEvent::NewImage(single_frame(1000 + i, i as u64)));
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(100));
    rig.scheduler.stop();

    let events: Vec<SchedulerEvent> = rx.try_iter().collect();
    let previews = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::ProcessedImage(_)))
        .count();
    let data = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::ProcessedPupilData(_)))
        .count();
    assert!(data >= previews, "every preview has a data record");
    assert!(previews < data || data <= 1, "preview rate is limited");
}
