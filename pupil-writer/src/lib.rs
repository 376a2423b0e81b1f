//! Persistence sinks for the detection pipeline: the per-record CSV data
//! writer and the asynchronous image archive writer. Both run their own
//! thread and never block the producer.

pub type Result<M> = std::result::Result<M, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("csv error: {source}")]
    Csv {
        #[from]
        source: csv::Error,
    },
    #[error("image encode error: {0}")]
    ImageEncode(String),
    #[error("metadata error: {0}")]
    Metadata(String),
    #[error("target directory {0} is not empty; confirmation required")]
    TargetDirNotEmpty(std::path::PathBuf),
    #[error("writer already finished")]
    AlreadyDone,
    #[error("writer thread disconnected")]
    Disconnected,
}

impl From<serde_yaml::Error> for Error {
    fn from(orig: serde_yaml::Error) -> Error {
        Error::Metadata(orig.to_string())
    }
}

impl From<serde_xml_rs::Error> for Error {
    fn from(orig: serde_xml_rs::Error) -> Error {
        Error::Metadata(orig.to_string())
    }
}

mod data_writer;
pub use data_writer::{DataWriter, RecordingMeta};

mod image_writer;
pub use image_writer::{ImageWriter, ImageWriterConfig, ImagerecMeta};
