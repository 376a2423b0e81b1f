//! Command-line acquisition and playback runner.
//!
//! Plays back a recorded image archive (or drives the built-in software
//! camera) through the detection pipeline and fans results out to the CSV
//! writer and the network/serial streamers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;
use tracing::{info, warn};

use cam_source::{CameraEvent, MockDriver, SingleCameraSource, StereoCameraSource};
use event_tracker::EventTracker;
use image_reader::ImageReader;
use pupil_sched::{DetectionScheduler, SchedulerEvent};
use pupil_stream::{FieldTemplate, Streamer};
use pupil_types::{now_ms, ProcMode, PupilFrame, SourceKind};
use pupil_writer::{DataWriter, ImageWriter, ImageWriterConfig, ImagerecMeta, RecordingMeta};
use trigger_box::{SerialPool, TriggerBox};

mod settings;
use settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum SourceArg {
    /// play back a recorded image directory
    File,
    /// built-in software camera, one view
    MockSingle,
    /// built-in software cameras, hardware-trigger style stereo pair
    MockStereo,
}

#[derive(Debug, Parser)]
#[command(name = "pupil-rig", about = "Real-time pupillometry pipeline runner")]
struct Opt {
    /// Frame source
    #[arg(long, value_enum, default_value = "file")]
    source: SourceArg,

    /// Directory of recorded images (file source)
    #[arg(long)]
    image_dir: Option<PathBuf>,

    /// Output directory for data, logs and archives
    #[arg(long)]
    output_dir: PathBuf,

    /// Pupil detection data CSV path (default: <output-dir>/pupil_data.csv)
    #[arg(long)]
    pupil_data_csv: Option<PathBuf>,

    /// Playback (or mock camera) frame rate; 0 plays back as fast as possible
    #[arg(long, default_value = "25")]
    fps: f64,

    /// Loop playback endlessly
    #[arg(long)]
    playback_loop: bool,

    /// Expected maximum pupil size, percent of the shorter image axis (20-100)
    #[arg(long)]
    expected_max_pupil_size_percent: Option<f64>,

    /// Couple CSV recording to playback cadence (no frame skipped)
    #[arg(long)]
    sync_record_csv_with_playback: bool,

    /// Couple streaming to playback cadence
    #[arg(long)]
    sync_stream_with_playback: bool,

    /// Skip the metadata sidecar next to the CSV
    #[arg(long)]
    no_metadata_snapshots: bool,

    /// Save the event log as XML next to the output on exit
    #[arg(long)]
    save_offline_event_log: bool,

    /// Also record incoming frames as an image archive
    #[arg(long)]
    record_images: bool,

    /// Overwrite a non-empty image archive directory without asking
    #[arg(long)]
    overwrite_archive: bool,

    /// Stream results to this UDP address
    #[arg(long)]
    udp_stream: Option<SocketAddr>,

    /// Stream results over this serial port
    #[arg(long)]
    serial_stream_port: Option<String>,

    #[arg(long, default_value = "115200")]
    serial_baud: u32,

    /// Microcontroller frame-clock port (mock-stereo source)
    #[arg(long)]
    trigger_port: Option<String>,

    /// Run length for the mock sources, seconds
    #[arg(long, default_value = "5")]
    duration_secs: u64,

    /// Settings file (default: <output-dir>/settings.yaml)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Keep the (external) UI above other windows; recorded in settings
    #[arg(long)]
    always_on_top: bool,

    /// Dark UI theme; recorded in settings
    #[arg(long)]
    dark_mode: bool,
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let evt_fmt = fmt::format()
        .with_timer(fmt::time::Uptime::default())
        .compact();
    tracing_subscriber::registry()
        .with(fmt::layer().event_format(evt_fmt))
        .with(EnvFilter::from_default_env())
        .init();
}

/// Default mode for a source the persisted mode cannot process.
fn fallback_mode(kind: SourceKind) -> ProcMode {
    if kind.is_stereo() {
        ProcMode::StereoImageOnePupil
    } else {
        ProcMode::SingleImageOnePupil
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    init_logging();
    let opt = Opt::parse();

    std::fs::create_dir_all(&opt.output_dir)
        .wrap_err("could not create the output directory")?;
    let settings_path = opt
        .settings
        .clone()
        .unwrap_or_else(|| opt.output_dir.join("settings.yaml"));
    let mut settings = Settings::load(&settings_path)?;
    settings.always_on_top |= opt.always_on_top;
    settings.dark_mode |= opt.dark_mode;
    settings.sync_record_csv_with_playback |= opt.sync_record_csv_with_playback;
    settings.sync_stream_with_playback |= opt.sync_stream_with_playback;
    settings.metadata_snapshots_enabled &= !opt.no_metadata_snapshots;
    settings.offline_event_log_save |= opt.save_offline_event_log;
    if let Some(percent) = opt.expected_max_pupil_size_percent {
        // refusal, not clamping: an out-of-range request is a caller error
        eyre::ensure!(
            (20.0..=100.0).contains(&percent),
            "expected maximum pupil size must be within 20..=100 percent, got {percent}"
        );
        settings.expected_max_pupil_size_percent = percent;
    }

    let tracker = EventTracker::shared();

    match opt.source {
        SourceArg::File => run_file_playback(&opt, &settings, &tracker)?,
        SourceArg::MockSingle | SourceArg::MockStereo => run_mock(&opt, &settings, &tracker)?,
    }

    if settings.offline_event_log_save {
        let path = opt.output_dir.join(image_reader::EVENT_LOG_SIDECAR);
        tracker.save_offline_log(0, now_ms(), &path)?;
        info!("event log saved to {}", path.display());
    }
    settings.save(&settings_path)?;
    Ok(())
}

/// Fan results out to the CSV writer and the streamers until the scheduler
/// reports completion; then tear down in reverse start order.
struct SinkSet {
    data_writer: DataWriter,
    stream_txs: Vec<crossbeam_channel::Sender<PupilFrame>>,
    streamers: Vec<Streamer>,
}

fn build_sinks(
    opt: &Opt,
    settings: &Settings,
    tracker: &Arc<EventTracker>,
    kind: SourceKind,
    scheduler: &DetectionScheduler,
) -> eyre::Result<SinkSet> {
    let csv_path = opt
        .pupil_data_csv
        .clone()
        .unwrap_or_else(|| opt.output_dir.join("pupil_data.csv"));
    let mode = scheduler.proc_mode();
    let meta = settings.metadata_snapshots_enabled.then(|| {
        RecordingMeta::new(
            kind,
            mode,
            scheduler.rois(),
            scheduler
                .strategy_names()
                .into_iter()
                .map(String::from)
                .collect(),
            false,
        )
    });
    let data_writer = DataWriter::open(
        &csv_path,
        mode,
        meta.as_ref(),
        Some(tracker.writer_guard()),
    )?;

    let template = FieldTemplate::parse(&settings.stream_template)
        .unwrap_or_else(|_| FieldTemplate::full());
    let mut stream_txs = Vec::new();
    let mut streamers = Vec::new();
    if let Some(target) = opt.udp_stream {
        let (tx, rx) = crossbeam_channel::unbounded();
        streamers.push(Streamer::spawn_udp(
            target,
            template.clone(),
            rx,
            Some(tracker.writer_guard()),
        )?);
        stream_txs.push(tx);
    }
    if let Some(port) = &opt.serial_stream_port {
        let pool = SerialPool::new();
        let conn = pool.open(port, opt.serial_baud)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        streamers.push(Streamer::spawn_serial(
            conn,
            template.clone(),
            rx,
            Some(tracker.writer_guard()),
        )?);
        stream_txs.push(tx);
    }

    Ok(SinkSet {
        data_writer,
        stream_txs,
        streamers,
    })
}

impl SinkSet {
    /// Consume scheduler events until ProcessingFinished (or the deadline,
    /// for endless sources).
    fn pump(
        &mut self,
        rx: &crossbeam_channel::Receiver<SchedulerEvent>,
        deadline: Option<std::time::Instant>,
    ) -> eyre::Result<u64> {
        let mut records = 0u64;
        loop {
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    break;
                }
            }
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(SchedulerEvent::ProcessedPupilData(frame)) => {
                    records += 1;
                    for tx in &self.stream_txs {
                        let _ = tx.send(frame.clone());
                    }
                    self.data_writer.write(frame)?;
                }
                Ok(SchedulerEvent::Fps(fps)) => info!("processing at {fps:.1} fps"),
                Ok(SchedulerEvent::ProcessingFinished) => break,
                Ok(_) => {}
                Err(e) if e.is_timeout() => continue,
                Err(_) => break,
            }
        }
        Ok(records)
    }

    fn teardown(mut self) -> eyre::Result<()> {
        for mut streamer in self.streamers.drain(..) {
            streamer.stop();
        }
        self.data_writer.finish()?;
        Ok(())
    }
}

fn run_file_playback(
    opt: &Opt,
    settings: &Settings,
    tracker: &Arc<EventTracker>,
) -> eyre::Result<()> {
    let image_dir = opt
        .image_dir
        .as_ref()
        .ok_or_else(|| eyre::eyre!("--image-dir is required for the file source"))?;
    let reader = ImageReader::new(image_dir, opt.fps, opt.playback_loop)?;
    let kind = reader.kind();
    info!("playing back {} as {:?}", image_dir.display(), kind);

    if let Some(log_path) = reader.offline_event_log_path() {
        tracker.load_offline_log(&log_path)?;
        info!("loaded offline event log with {} events", tracker.len());
    }

    let scheduler = DetectionScheduler::new(tracker.clone());
    scheduler.attach_source(reader.events(), kind);
    let mode = settings.parse_proc_mode().unwrap_or_else(|| fallback_mode(kind));
    if scheduler.set_proc_mode(mode).is_err() {
        warn!("persisted mode {mode:?} cannot process {kind:?} frames, using fallback");
        scheduler.set_proc_mode(fallback_mode(kind))?;
    }
    scheduler.schedule_auto_param(settings.expected_max_pupil_size_percent)?;

    let coupled =
        settings.sync_record_csv_with_playback || settings.sync_stream_with_playback;
    if coupled {
        reader.playback_sync().set_coupled(true);
        scheduler.attach_playback_sync(reader.playback_sync());
    }

    let mut sinks = build_sinks(opt, settings, tracker, kind, &scheduler)?;
    let scheduler_rx = scheduler.events().subscribe();

    scheduler.start()?;
    reader.start()?;

    let records = sinks.pump(&scheduler_rx, None)?;
    info!("playback finished, {records} records written");

    // reverse start order
    reader.stop();
    scheduler.stop();
    sinks.teardown()?;
    Ok(())
}

fn run_mock(opt: &Opt, settings: &Settings, tracker: &Arc<EventTracker>) -> eyre::Result<()> {
    let fps = if opt.fps > 0.0 { opt.fps } else { 25.0 };
    let deadline = std::time::Instant::now() + Duration::from_secs(opt.duration_secs);
    let scheduler = DetectionScheduler::new(tracker.clone());

    // optional archive of the raw frames
    let stereo = opt.source == SourceArg::MockStereo;
    let kind = if stereo {
        SourceKind::LiveStereo
    } else {
        SourceKind::LiveSingle
    };
    let image_writer = if opt.record_images {
        let mut config = ImageWriterConfig::new(&opt.output_dir.join("images"));
        config.confirmed = opt.overwrite_archive;
        Some(ImageWriter::open(
            config,
            stereo,
            &ImagerecMeta {
                source_kind: kind,
                binning: 1,
                roi_offset_x: 0,
                roi_offset_y: 0,
                roi_width: 640,
                roi_height: 480,
                start_timestamp_ms: now_ms(),
            },
        )?)
    } else {
        None
    };

    let camera_events;
    let _single: Option<Arc<SingleCameraSource>>;
    let _stereo: Option<(Arc<StereoCameraSource>, Option<TriggerBox>)>;
    if stereo {
        let source = Arc::new(StereoCameraSource::open(
            Box::new(MockDriver::new("mock-primary", 640, 480).with_frame_rate(fps)),
            Box::new(MockDriver::new("mock-secondary", 640, 480).with_frame_rate(fps)),
        ));
        camera_events = source.events();
        // the frame clock may only start once both grabbers are armed
        if let Some(port) = &opt.trigger_port {
            let pool = SerialPool::new();
            let trigger = TriggerBox::new(&pool, port, opt.serial_baud)?;
            source.arm_then(|| trigger.start_fps(fps))??;
            _stereo = Some((source, Some(trigger)));
        } else {
            source.start_grabbing()?;
            _stereo = Some((source, None));
        }
        _single = None;
    } else {
        let source = Arc::new(SingleCameraSource::open(Box::new(
            MockDriver::new("mock0", 640, 480).with_frame_rate(fps),
        )));
        camera_events = source.events();
        source.start_grabbing()?;
        _single = Some(source);
        _stereo = None;
    }

    // periodic camera temperature checks recorded into the event timeline
    let (temp_stop_tx, temp_stop_rx) = crossbeam_channel::bounded::<()>(0);
    let temp_handle = {
        let tracker = tracker.clone();
        let single = _single.clone();
        let stereo_source = _stereo.as_ref().map(|(s, _)| s.clone());
        std::thread::Builder::new()
            .name("temperature-monitor".to_string())
            .spawn(move || loop {
                match temp_stop_rx.recv_timeout(Duration::from_secs(2)) {
                    Err(e) if e.is_timeout() => {
                        let temps = single
                            .as_ref()
                            .map(|s| s.temperatures())
                            .or_else(|| stereo_source.as_ref().map(|s| s.temperatures()))
                            .unwrap_or_default();
                        // a failed read is transient telemetry, just skip it
                        if !temps.is_empty() {
                            tracker.add_temperature_check(now_ms(), &temps);
                        }
                    }
                    _ => break,
                }
            })?
    };

    scheduler.attach_source(camera_events.clone(), kind);
    let mode = settings.parse_proc_mode().unwrap_or_else(|| fallback_mode(kind));
    if scheduler.set_proc_mode(mode).is_err() {
        scheduler.set_proc_mode(fallback_mode(kind))?;
    }
    scheduler.schedule_auto_param(settings.expected_max_pupil_size_percent)?;

    // raw-frame tap for the archive writer, off the camera hub directly
    let archive_handle = match image_writer {
        Some(writer) => {
            let rx = camera_events.subscribe_bounded(128);
            let handle = std::thread::Builder::new()
                .name("archive-feed".to_string())
                .spawn(move || {
                    let mut writer = writer;
                    while let Ok(event) = rx.recv() {
                        match event {
                            CameraEvent::NewImage(frame) => {
                                if writer.write(frame).is_err() {
                                    break;
                                }
                            }
                            CameraEvent::EndReached | CameraEvent::DeviceRemoved => break,
                            _ => {}
                        }
                    }
                    if writer.dropped() > 0 {
                        warn!("archive writer dropped {} frames", writer.dropped());
                    }
                    let _ = writer.finish();
                })?;
            Some(handle)
        }
        None => None,
    };

    let mut sinks = build_sinks(opt, settings, tracker, kind, &scheduler)?;
    let scheduler_rx = scheduler.events().subscribe();
    scheduler.start()?;

    let records = sinks.pump(&scheduler_rx, Some(deadline))?;
    info!("mock run finished, {records} records written");

    // reverse start order: monitor, trigger, sources, scheduler, sinks
    drop(temp_stop_tx);
    let _ = temp_handle.join();
    if let Some((source, trigger)) = &_stereo {
        if let Some(trigger) = trigger {
            trigger.stop_pulses()?;
            // the stop is ack-less; silence on the frame stream confirms it
            if let Some(period) = trigger.current_frame_period() {
                if !source.confirm_trigger_stopped(period) {
                    warn!("frames still arriving after trigger stop");
                }
            }
        }
        source.stop_grabbing();
    }
    if let Some(source) = &_single {
        source.stop_grabbing();
    }
    scheduler.stop();
    if let Some(handle) = archive_handle {
        // wake the archive feed so it drains and exits
        camera_events.publish(CameraEvent::EndReached);
        let _ = handle.join();
    }
    sinks.teardown()?;
    Ok(())
}
