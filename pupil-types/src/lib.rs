//! Value types shared by every stage of the pupillometry pipeline.

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("stereo images have mismatched dimensions ({0}x{1} vs {2}x{3})")]
    MismatchedStereoDimensions(u32, u32, u32, u32),
    #[error("source kind {0:?} does not carry a secondary image")]
    NotStereoKind(SourceKind),
    #[error("region of interest out of bounds")]
    RoiOutOfBounds,
    #[error("degenerate region of interest")]
    DegenerateRoi,
    #[error("PupilTypesError({0})")]
    PupilTypesError(String),
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::PupilTypesError(orig.to_string())
    }
}

mod frame;
pub use frame::GrayImage;

mod pupil;
pub use pupil::Pupil;

mod roi;
pub use roi::{DiscreteRoi, RationalRoi};

mod proc_mode;
pub use proc_mode::ProcMode;

mod calibration;
pub use calibration::{Calibration, ScaleCalibration};

/// Closed set of frame producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    LiveSingle,
    LiveStereo,
    LiveWebcam,
    FileSingle,
    FileStereo,
}

impl SourceKind {
    pub fn is_stereo(&self) -> bool {
        matches!(self, SourceKind::LiveStereo | SourceKind::FileStereo)
    }
    pub fn is_file(&self) -> bool {
        matches!(self, SourceKind::FileSingle | SourceKind::FileStereo)
    }
}

/// One acquired frame (or hardware-triggered pair).
///
/// The timestamp is stamped by the grabbing thread at buffer completion,
/// never by a receiver. Frame numbers increase monotonically per source and
/// wrap to 0 only on a playback loop.
#[derive(Debug, Clone)]
pub struct CameraImage {
    /// milliseconds since the unix epoch
    pub timestamp_ms: i64,
    pub kind: SourceKind,
    pub frame_number: u64,
    pub image: GrayImage,
    /// second view, present only for stereo kinds
    pub image_secondary: Option<GrayImage>,
    /// originating file, present only for file kinds
    pub filename: Option<String>,
}

impl CameraImage {
    pub fn new_single(
        timestamp_ms: i64,
        kind: SourceKind,
        frame_number: u64,
        image: GrayImage,
    ) -> Self {
        debug_assert!(!kind.is_stereo());
        Self {
            timestamp_ms,
            kind,
            frame_number,
            image,
            image_secondary: None,
            filename: None,
        }
    }

    pub fn new_stereo(
        timestamp_ms: i64,
        kind: SourceKind,
        frame_number: u64,
        image: GrayImage,
        image_secondary: GrayImage,
    ) -> Result<Self> {
        if !kind.is_stereo() {
            return Err(Error::NotStereoKind(kind));
        }
        if image.width() != image_secondary.width() || image.height() != image_secondary.height() {
            return Err(Error::MismatchedStereoDimensions(
                image.width(),
                image.height(),
                image_secondary.width(),
                image_secondary.height(),
            ));
        }
        Ok(Self {
            timestamp_ms,
            kind,
            frame_number,
            image,
            image_secondary: Some(image_secondary),
            filename: None,
        })
    }

    pub fn with_filename(mut self, filename: String) -> Self {
        self.filename = Some(filename);
        self
    }

    /// Identifier used in CSV records and stream lines: the source filename
    /// for file kinds, the frame number otherwise.
    pub fn image_id(&self) -> String {
        match &self.filename {
            Some(f) => f.clone(),
            None => format!("{}", self.frame_number),
        }
    }
}

/// One detection result bundle, the unit every data sink consumes.
///
/// `pupils` always has exactly `mode.slot_count()` entries; failed slots
/// carry the invalid sentinel so positions stay stable.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PupilFrame {
    pub timestamp_ms: i64,
    pub mode: ProcMode,
    pub pupils: Vec<Pupil>,
    /// trial number in force at `timestamp_ms`
    pub trial: u64,
    pub image_id: String,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn _test_camera_image_is_send() {
    // Compile-time test to ensure CameraImage implements Send trait.
    fn implements<T: Send>() {}
    implements::<CameraImage>();
}
