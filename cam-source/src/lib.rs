//! Uniform frame producers over industrial camera drivers.
//!
//! A [FrameDriver] is the thin blocking abstraction a vendor backend must
//! implement. [SingleCameraSource] and [StereoCameraSource] turn drivers
//! into hot event streams with host timestamps, skip coalescing and
//! device-removal handling. File playback lives in the `image-reader` crate
//! and emits the same [CameraEvent] stream.

use std::sync::Arc;

use pupil_types::CameraImage;

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("device open failed: {0}")]
    DeviceOpen(String),
    #[error("camera is not open")]
    NotOpen,
    #[error("image ROI invalid: {0}")]
    InvalidImageRoi(String),
    #[error("binning {0} not supported (must be 1, 2 or 4)")]
    InvalidBinning(u32),
    #[error("CamSourceError({0})")]
    CamSourceError(String),
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::CamSourceError(orig.to_string())
    }
}

mod driver;
pub use driver::{DriverFrame, FrameDriver, GrabError, SensorRoi};

mod mock;
pub use mock::{MockDriver, MockGrab};

mod pairing;
pub use pairing::{Pairer, TimedFrame, DEFAULT_PAIR_WINDOW_MS};

mod single;
pub use single::SingleCameraSource;

mod stereo;
pub use stereo::StereoCameraSource;

/// Telemetry and data events published by every frame source.
#[derive(Debug, Clone)]
pub enum CameraEvent {
    NewImage(Arc<CameraImage>),
    Fps(f64),
    FrameCount(u64),
    /// one or more frames were skipped; coalesced per run of skips
    ImagesSkipped,
    DeviceRemoved,
    /// file playback reached the last image with looping disabled
    EndReached,
    /// file playback wrapped from the last image back to index 0
    Wrapped,
}
