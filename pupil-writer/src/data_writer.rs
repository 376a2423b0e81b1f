use std::path::{Path, PathBuf};

use event_tracker::WriterGuard;
use pupil_types::{ProcMode, Pupil, PupilFrame, RationalRoi, SourceKind};
use tracing::{debug, info};

use crate::{Error, Result};

/// Human-readable sidecar written next to the CSV at open time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecordingMeta {
    pub source_kind: SourceKind,
    pub mode: ProcMode,
    pub rois: Vec<RationalRoi>,
    pub strategies: Vec<String>,
    pub calibrated: bool,
    /// what the timestamp column means
    pub time_base: String,
    pub opened_at: String,
}

impl RecordingMeta {
    pub fn new(
        source_kind: SourceKind,
        mode: ProcMode,
        rois: Vec<RationalRoi>,
        strategies: Vec<String>,
        calibrated: bool,
    ) -> Self {
        Self {
            source_kind,
            mode,
            rois,
            strategies,
            calibrated,
            time_base: "milliseconds since unix epoch, host clock at buffer completion"
                .to_string(),
            opened_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

enum Msg {
    Record(PupilFrame),
    Finish,
}

/// CSV sink for detection result bundles.
///
/// Column layout is fixed by the processing mode at open time. Each record
/// is flushed line by line; close fsyncs. Records are queued to a dedicated
/// thread, so a slow disk grows the queue instead of stalling the detector.
pub struct DataWriter {
    tx: crossbeam_channel::Sender<Msg>,
    err_rx: crossbeam_channel::Receiver<Error>,
    handle: Option<std::thread::JoinHandle<()>>,
    is_done: bool,
    /// registers this writer with the event tracker so trial resets are
    /// refused while recording
    _guard: Option<WriterGuard>,
}

const PUPIL_COLUMNS: &[&str] = &[
    "center_x",
    "center_y",
    "width",
    "height",
    "angle",
    "confidence",
    "outline_confidence",
    "diameter",
    "undistorted_diameter_px",
    "physical_diameter_mm",
];

fn header(mode: ProcMode) -> Vec<String> {
    let mut columns = vec![
        "trial".to_string(),
        "timestamp_ms".to_string(),
        "image_id".to_string(),
    ];
    for label in mode.slot_labels() {
        for column in PUPIL_COLUMNS {
            columns.push(format!("{label}_{column}"));
        }
    }
    columns
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn record_row(frame: &PupilFrame) -> Vec<String> {
    let mut row = vec![
        frame.trial.to_string(),
        frame.timestamp_ms.to_string(),
        frame.image_id.clone(),
    ];
    for pupil in &frame.pupils {
        row.extend(pupil_cells(pupil));
    }
    row
}

fn pupil_cells(p: &Pupil) -> Vec<String> {
    vec![
        p.center_x.to_string(),
        p.center_y.to_string(),
        p.width.to_string(),
        p.height.to_string(),
        p.angle.to_string(),
        p.confidence.to_string(),
        p.outline_confidence.to_string(),
        p.diameter().to_string(),
        fmt_opt(p.undistorted_diameter_px),
        fmt_opt(p.physical_diameter_mm),
    ]
}

fn sidecar_path(csv_path: &Path) -> PathBuf {
    let stem = csv_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    csv_path.with_file_name(format!("{stem}_meta.yaml"))
}

impl DataWriter {
    /// Open `csv_path`, write the header row for `mode`, and (unless
    /// suppressed) the metadata sidecar.
    pub fn open(
        csv_path: &Path,
        mode: ProcMode,
        meta: Option<&RecordingMeta>,
        guard: Option<WriterGuard>,
    ) -> Result<Self> {
        if let Some(meta) = meta {
            let body = serde_yaml::to_string(meta)?;
            std::fs::write(sidecar_path(csv_path), body)?;
        }
        let file = std::fs::File::create(csv_path)?;
        let mut csv_writer = csv::Writer::from_writer(file);
        csv_writer.write_record(header(mode))?;
        csv_writer.flush()?;
        info!("recording pupil data to {}", csv_path.display());

        let (tx, rx) = crossbeam_channel::unbounded::<Msg>();
        let (err_tx, err_rx) = crossbeam_channel::unbounded::<Error>();
        let handle = std::thread::Builder::new()
            .name("data-writer".to_string())
            .spawn(move || {
                let mut csv_writer = csv_writer;
                loop {
                    let msg = match rx.recv() {
                        Ok(msg) => msg,
                        Err(_) => break,
                    };
                    match msg {
                        Msg::Record(frame) => {
                            let result = csv_writer
                                .write_record(record_row(&frame))
                                .and_then(|_| csv_writer.flush().map_err(Into::into));
                            if let Err(e) = result {
                                let _ = err_tx.send(e.into());
                                return;
                            }
                        }
                        Msg::Finish => break,
                    }
                }
                match csv_writer.into_inner() {
                    Ok(file) => {
                        if let Err(e) = file.sync_all() {
                            let _ = err_tx.send(e.into());
                        }
                    }
                    Err(e) => {
                        let _ = err_tx.send(Error::Metadata(e.to_string()));
                    }
                }
                debug!("data-writer exiting");
            })?;

        Ok(Self {
            tx,
            err_rx,
            handle: Some(handle),
            is_done: false,
            _guard: guard,
        })
    }

    /// Queue one record; never blocks on the disk.
    pub fn write(&mut self, frame: PupilFrame) -> Result<()> {
        self.check_async_err()?;
        if self.is_done {
            return Err(Error::AlreadyDone);
        }
        self.tx
            .send(Msg::Record(frame))
            .map_err(|_| Error::Disconnected)
    }

    /// Flush, fsync and join the writer thread.
    pub fn finish(&mut self) -> Result<()> {
        if self.is_done {
            return Ok(());
        }
        self.is_done = true;
        let _ = self.tx.send(Msg::Finish);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.check_async_err()
    }

    fn check_async_err(&self) -> Result<()> {
        match self.err_rx.try_recv() {
            Ok(e) => Err(e),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(()),
            Err(crossbeam_channel::TryRecvError::Disconnected) => Ok(()),
        }
    }
}

impl Drop for DataWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
