//! File-playback frame source.
//!
//! Enumerates an image directory (or the `0/` and `1/` subdirectories for a
//! stereo archive), emulates the camera cadence at a target FPS and emits
//! [cam_source::CameraEvent]s exactly like a live source. Timestamps are
//! synthetic: wall clock at start plus `index / fps`, stable per index so
//! seeks do not invalidate earlier queries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cam_source::CameraEvent;
use frame_flow::{Hub, PlaybackSync};
use parking_lot::Mutex;
use pupil_types::{now_ms, CameraImage, GrayImage, SourceKind};
use tracing::{debug, info, warn};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("image directory does not exist: {0}")]
    NoSuchDirectory(PathBuf),
    #[error("no image files found in {0}")]
    EmptyDirectory(PathBuf),
    #[error("stereo archive has {0} primary but {1} secondary images")]
    UnbalancedStereoArchive(usize, usize),
    #[error("index {0} out of range ({1} images)")]
    IndexOutOfRange(usize, usize),
    #[error("could not decode {path}: {message}")]
    Decode { path: PathBuf, message: String },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Sidecar files living next to an archive, never part of the frame stream.
pub const META_SIDECAR: &str = "imagerec_meta.xml";
pub const EVENT_LOG_SIDECAR: &str = "offline_event_log.xml";

/// Fallback inter-frame delay when the target FPS is 0 ("no delay" mode);
/// synthetic timestamps still advance by this much per frame.
const NO_DELAY_TIMESTAMP_STEP_MS: i64 = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

pub struct ImageReader {
    directory: PathBuf,
    filenames: Arc<Vec<PathBuf>>,
    filenames_secondary: Arc<Vec<PathBuf>>,
    stereo: bool,
    hub: Arc<Hub<CameraEvent>>,
    sync: Arc<PlaybackSync>,
    state: Arc<Mutex<PlaybackState>>,
    current_index: Arc<AtomicUsize>,
    start_timestamp_ms: Arc<AtomicI64>,
    target_fps: Arc<Mutex<f64>>,
    playback_loop: Arc<Mutex<bool>>,
    thread: Mutex<Option<(thread_control::Control, std::thread::JoinHandle<()>)>>,
}

fn enumerate(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    // lexicographic order equals temporal order for zero-padded names
    files.sort();
    Ok(files)
}

fn decode_gray(path: &Path) -> Result<GrayImage> {
    let dynamic = image::open(path).map_err(|e| Error::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let luma = dynamic.into_luma8();
    let (w, h) = luma.dimensions();
    GrayImage::new(w, h, w, luma.into_raw()).map_err(|e| Error::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

impl ImageReader {
    /// Open `directory` for playback.
    ///
    /// A stereo archive is recognized by the presence of both `0/` and `1/`
    /// subdirectories; images are then paired by sorted position, which
    /// requires zero-padded filenames on the recording side.
    pub fn new(directory: &Path, target_fps: f64, playback_loop: bool) -> Result<Self> {
        if !directory.is_dir() {
            return Err(Error::NoSuchDirectory(directory.to_path_buf()));
        }
        let sub0 = directory.join("0");
        let sub1 = directory.join("1");
        let stereo = sub0.is_dir() && sub1.is_dir();

        let (filenames, filenames_secondary) = if stereo {
            info!("found stereo structure in {}", directory.display());
            let primary = enumerate(&sub0)?;
            let secondary = enumerate(&sub1)?;
            if primary.len() != secondary.len() {
                return Err(Error::UnbalancedStereoArchive(
                    primary.len(),
                    secondary.len(),
                ));
            }
            (primary, secondary)
        } else {
            (enumerate(directory)?, Vec::new())
        };
        if filenames.is_empty() {
            return Err(Error::EmptyDirectory(directory.to_path_buf()));
        }
        info!("found {} images, ready", filenames.len());

        Ok(Self {
            directory: directory.to_path_buf(),
            filenames: Arc::new(filenames),
            filenames_secondary: Arc::new(filenames_secondary),
            stereo,
            hub: Arc::new(Hub::new()),
            sync: PlaybackSync::shared(false),
            state: Arc::new(Mutex::new(PlaybackState::Stopped)),
            current_index: Arc::new(AtomicUsize::new(0)),
            start_timestamp_ms: Arc::new(AtomicI64::new(0)),
            target_fps: Arc::new(Mutex::new(target_fps)),
            playback_loop: Arc::new(Mutex::new(playback_loop)),
            thread: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> SourceKind {
        if self.stereo {
            SourceKind::FileStereo
        } else {
            SourceKind::FileSingle
        }
    }

    pub fn len(&self) -> usize {
        self.filenames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filenames.is_empty()
    }

    pub fn events(&self) -> Arc<Hub<CameraEvent>> {
        self.hub.clone()
    }

    /// Hand-shake used to couple playback cadence to detector completion.
    pub fn playback_sync(&self) -> Arc<PlaybackSync> {
        self.sync.clone()
    }

    /// Path of the adjacent offline event log, when the archive carries one.
    pub fn offline_event_log_path(&self) -> Option<PathBuf> {
        let path = self.directory.join(EVENT_LOG_SIDECAR);
        path.is_file().then_some(path)
    }

    pub fn set_target_fps(&self, fps: f64) {
        *self.target_fps.lock() = fps;
    }

    pub fn set_playback_loop(&self, playback_loop: bool) {
        *self.playback_loop.lock() = playback_loop;
    }

    pub fn current_index(&self) -> usize {
        self.current_index.load(Ordering::SeqCst)
    }

    /// Place the playback position; the next emission uses the stored
    /// per-index timestamp.
    pub fn seek(&self, index: usize) -> Result<()> {
        if index >= self.filenames.len() {
            return Err(Error::IndexOutOfRange(index, self.filenames.len()));
        }
        self.current_index.store(index, Ordering::SeqCst);
        Ok(())
    }

    /// Raw image access outside the playback cadence, for previews. Not
    /// ordered against the frame stream.
    pub fn still_image(&self, index: usize) -> Result<GrayImage> {
        let path = self
            .filenames
            .get(index)
            .ok_or(Error::IndexOutOfRange(index, self.filenames.len()))?;
        decode_gray(path)
    }

    fn delay_of(fps: f64) -> (Option<Duration>, i64) {
        if fps <= 0.0 {
            // no pacing, but timestamps still advance
            (None, NO_DELAY_TIMESTAMP_STEP_MS)
        } else {
            let delay = Duration::from_secs_f64(1.0 / fps);
            (Some(delay), delay.as_millis() as i64)
        }
    }

    pub fn is_playing(&self) -> bool {
        *self.state.lock() == PlaybackState::Playing
    }

    /// Start or resume playback in a dedicated thread.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        {
            let mut state = self.state.lock();
            if *state == PlaybackState::Playing {
                return Ok(());
            }
            if *state == PlaybackState::Stopped {
                self.start_timestamp_ms.store(now_ms(), Ordering::SeqCst);
            }
            *state = PlaybackState::Playing;
        }

        let (flag, control) = thread_control::make_pair();
        let filenames = self.filenames.clone();
        let filenames_secondary = self.filenames_secondary.clone();
        let stereo = self.stereo;
        let kind = self.kind();
        let hub = self.hub.clone();
        let sync = self.sync.clone();
        let state = self.state.clone();
        let current_index = self.current_index.clone();
        let start_timestamp_ms = self.start_timestamp_ms.clone();
        let target_fps = self.target_fps.clone();
        let playback_loop = self.playback_loop.clone();

        let handle = std::thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                while flag.is_alive() && *state.lock() == PlaybackState::Playing {
                    let begin = Instant::now();
                    let index = current_index.load(Ordering::SeqCst);
                    let (delay, step_ms) = Self::delay_of(*target_fps.lock());

                    let primary = match decode_gray(&filenames[index]) {
                        Ok(im) => Some(im),
                        Err(e) => {
                            warn!("image could not be read, skipping: {e}");
                            None
                        }
                    };
                    let secondary = if stereo {
                        match decode_gray(&filenames_secondary[index]) {
                            Ok(im) => Some(im),
                            Err(e) => {
                                warn!("secondary image could not be read, skipping: {e}");
                                None
                            }
                        }
                    } else {
                        None
                    };

                    let timestamp_ms =
                        start_timestamp_ms.load(Ordering::SeqCst) + index as i64 * step_ms;

                    let emit = match (primary, secondary, stereo) {
                        (Some(image), Some(image_secondary), true) => CameraImage::new_stereo(
                            timestamp_ms,
                            kind,
                            index as u64,
                            image,
                            image_secondary,
                        )
                        .map_err(|e| warn!("skipping mismatched stereo frame: {e}"))
                        .ok(),
                        (Some(image), None, false) => Some(CameraImage::new_single(
                            timestamp_ms,
                            kind,
                            index as u64,
                            image,
                        )),
                        _ => None,
                    }
                    .map(|im| {
                        im.with_filename(
                            filenames[index]
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default(),
                        )
                    });

                    // advance before the cadence sleep so pause/stop leave a
                    // consistent next index
                    let last = index + 1 == filenames.len();
                    let wrapped = if last {
                        if *playback_loop.lock() {
                            current_index.store(0, Ordering::SeqCst);
                            true
                        } else {
                            false
                        }
                    } else {
                        current_index.store(index + 1, Ordering::SeqCst);
                        false
                    };

                    if let Some(image) = emit {
                        if let Some(delay) = delay {
                            let elapsed = begin.elapsed();
                            if delay > elapsed {
                                std::thread::sleep(delay - elapsed);
                            }
                        }
                        // mark before publishing: the processed notification
                        // may arrive before we reach the wait
                        sync.mark_published();
                        hub.publish(CameraEvent::NewImage(Arc::new(image)));
                        // when coupled, hold the cadence until the detector
                        // finished this frame
                        sync.wait_processed();
                    }

                    if wrapped {
                        debug!("end reached, resetting playback, endless looping");
                        hub.publish(CameraEvent::Wrapped);
                        // new run: timestamps restart from the wrap instant
                        start_timestamp_ms.store(now_ms(), Ordering::SeqCst);
                    } else if last {
                        *state.lock() = PlaybackState::Stopped;
                        current_index.store(0, Ordering::SeqCst);
                        hub.publish(CameraEvent::EndReached);
                        break;
                    }
                }
                debug!("playback thread exiting");
            })
            .map_err(|e| Error::Io { source: e })?;
        *thread = Some((control, handle));
        Ok(())
    }

    fn join_thread(&self) {
        let taken = self.thread.lock().take();
        if let Some((control, handle)) = taken {
            control.stop();
            // keep releasing a coupled waiter until the thread has observed
            // the state change; a single notify could race the wait entry
            while !handle.is_finished() {
                self.sync.notify_processed();
                std::thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
    }

    /// Pause at the current image; `start` resumes from it. Idempotent.
    pub fn pause(&self) {
        {
            let mut state = self.state.lock();
            if *state != PlaybackState::Playing {
                return;
            }
            *state = PlaybackState::Paused;
        }
        self.join_thread();
    }

    /// Stop and reset the position to the first image. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == PlaybackState::Stopped {
                return;
            }
            *state = PlaybackState::Stopped;
        }
        self.join_thread();
        self.current_index.store(0, Ordering::SeqCst);
    }
}

impl Drop for ImageReader {
    fn drop(&mut self) {
        self.stop();
        self.sync.release();
    }
}
