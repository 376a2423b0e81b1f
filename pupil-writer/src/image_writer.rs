use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::TrySendError;
use pupil_types::{CameraImage, GrayImage, SourceKind};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Archive sidecar recording how the images were acquired.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename = "imagerec_meta")]
pub struct ImagerecMeta {
    pub source_kind: SourceKind,
    pub binning: u32,
    pub roi_offset_x: u32,
    pub roi_offset_y: u32,
    pub roi_width: u32,
    pub roi_height: u32,
    pub start_timestamp_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ImageWriterConfig {
    pub directory: PathBuf,
    /// png, tiff, bmp or jpeg
    pub extension: String,
    pub queue_size: usize,
    /// a non-empty target directory requires explicit confirmation from the
    /// caller (the surrounding application owns the dialog)
    pub confirmed: bool,
}

impl ImageWriterConfig {
    pub fn new(directory: &Path) -> Self {
        Self {
            directory: directory.to_path_buf(),
            extension: "png".to_string(),
            queue_size: 64,
            confirmed: false,
        }
    }
}

enum Msg {
    Write(Arc<CameraImage>),
    Finish,
}

/// Asynchronous image-to-disk sink with backpressure by dropping.
///
/// The queue is bounded; when the disk cannot keep up, new frames are
/// dropped and counted instead of blocking the acquisition path. Stereo
/// frames are written to the `0/` and `1/` subdirectories under one shared
/// base name, zero-padded so lexicographic order equals temporal order.
pub struct ImageWriter {
    tx: crossbeam_channel::Sender<Msg>,
    handle: Option<std::thread::JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
    is_done: bool,
}

fn encode(image: &GrayImage, path: &Path) -> Result<()> {
    // tightly packed copy; driver frames may carry row padding
    let mut data = Vec::with_capacity(image.width() as usize * image.height() as usize);
    for y in 0..image.height() {
        data.extend_from_slice(image.row(y));
    }
    let buffer = image::GrayImage::from_raw(image.width(), image.height(), data)
        .ok_or_else(|| Error::ImageEncode("buffer size mismatch".to_string()))?;
    buffer
        .save(path)
        .map_err(|e| Error::ImageEncode(e.to_string()))
}

impl ImageWriter {
    /// Create the archive layout and start the writer thread.
    pub fn open(config: ImageWriterConfig, stereo: bool, meta: &ImagerecMeta) -> Result<Self> {
        let dir = &config.directory;
        if dir.exists() {
            let non_empty = std::fs::read_dir(dir)?.next().is_some();
            if non_empty && !config.confirmed {
                return Err(Error::TargetDirNotEmpty(dir.clone()));
            }
        } else {
            std::fs::create_dir_all(dir)?;
        }
        if stereo {
            std::fs::create_dir_all(dir.join("0"))?;
            std::fs::create_dir_all(dir.join("1"))?;
        }
        let meta_body = serde_xml_rs::to_string(meta)?;
        std::fs::write(dir.join("imagerec_meta.xml"), meta_body)?;
        info!("recording images to {}", dir.display());

        let (tx, rx) = crossbeam_channel::bounded::<Msg>(config.queue_size);
        let dropped = Arc::new(AtomicU64::new(0));
        let written = Arc::new(AtomicU64::new(0));
        let thread_written = written.clone();
        let directory = dir.clone();
        let extension = config.extension.clone();
        let handle = std::thread::Builder::new()
            .name("image-writer".to_string())
            .spawn(move || {
                let mut index = 0u64;
                loop {
                    let msg = match rx.recv() {
                        Ok(msg) => msg,
                        Err(_) => break,
                    };
                    match msg {
                        Msg::Write(frame) => {
                            let base = format!("{index:06}.{extension}");
                            let result = match &frame.image_secondary {
                                Some(secondary) => {
                                    encode(&frame.image, &directory.join("0").join(&base))
                                        .and_then(|_| {
                                            encode(secondary, &directory.join("1").join(&base))
                                        })
                                }
                                None => encode(&frame.image, &directory.join(&base)),
                            };
                            match result {
                                Ok(()) => {
                                    index += 1;
                                    thread_written.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(e) => warn!("image write failed: {e}"),
                            }
                        }
                        Msg::Finish => break,
                    }
                }
                debug!("image-writer exiting");
            })?;

        Ok(Self {
            tx,
            handle: Some(handle),
            dropped,
            written,
            is_done: false,
        })
    }

    /// Queue a frame for writing; a full queue drops it and counts.
    pub fn write(&self, frame: Arc<CameraImage>) -> Result<()> {
        if self.is_done {
            return Err(Error::AlreadyDone);
        }
        match self.tx.try_send(Msg::Write(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::Disconnected),
        }
    }

    /// Frames dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Frames written to disk so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// Drain the queue and join the writer thread.
    pub fn finish(&mut self) -> Result<()> {
        if self.is_done {
            return Ok(());
        }
        self.is_done = true;
        // blocking send so every queued frame ahead of Finish is written
        let _ = self.tx.send(Msg::Finish);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for ImageWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(kind: SourceKind) -> ImagerecMeta {
        ImagerecMeta {
            source_kind: kind,
            binning: 1,
            roi_offset_x: 0,
            roi_offset_y: 0,
            roi_width: 64,
            roi_height: 48,
            start_timestamp_ms: 1000,
        }
    }

    fn single_frame(n: u64, value: u8) -> Arc<CameraImage> {
        Arc::new(CameraImage::new_single(
            1000 + n as i64,
            SourceKind::LiveSingle,
            n,
            GrayImage::filled(64, 48, value),
        ))
    }

    #[test]
    fn writes_zero_padded_archive_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("rec");
        let mut writer = ImageWriter::open(
            ImageWriterConfig::new(&target),
            false,
            &meta(SourceKind::LiveSingle),
        )
        .unwrap();
        for n in 0..3 {
            writer.write(single_frame(n, n as u8 * 40 + 10)).unwrap();
        }
        writer.finish().unwrap();
        assert_eq!(writer.written(), 3);
        assert_eq!(writer.dropped(), 0);

        for n in 0..3u8 {
            let path = target.join(format!("{:06}.png", n));
            let decoded = image::open(&path).unwrap().into_luma8();
            assert_eq!(decoded.get_pixel(0, 0).0[0], n * 40 + 10);
        }
        assert!(target.join("imagerec_meta.xml").exists());
    }

    #[test]
    fn stereo_frames_share_one_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("rec");
        let mut writer = ImageWriter::open(
            ImageWriterConfig::new(&target),
            true,
            &meta(SourceKind::LiveStereo),
        )
        .unwrap();
        let frame = Arc::new(
            CameraImage::new_stereo(
                0,
                SourceKind::LiveStereo,
                0,
                GrayImage::filled(64, 48, 11),
                GrayImage::filled(64, 48, 22),
            )
            .unwrap(),
        );
        writer.write(frame).unwrap();
        writer.finish().unwrap();
        let p0 = image::open(target.join("0/000000.png")).unwrap().into_luma8();
        let p1 = image::open(target.join("1/000000.png")).unwrap().into_luma8();
        assert_eq!(p0.get_pixel(0, 0).0[0], 11);
        assert_eq!(p1.get_pixel(0, 0).0[0], 22);
    }

    #[test]
    fn non_empty_target_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("rec");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("leftover.txt"), "x").unwrap();

        let unconfirmed = ImageWriter::open(
            ImageWriterConfig::new(&target),
            false,
            &meta(SourceKind::LiveSingle),
        );
        assert!(matches!(unconfirmed, Err(Error::TargetDirNotEmpty(_))));

        let mut config = ImageWriterConfig::new(&target);
        config.confirmed = true;
        let confirmed = ImageWriter::open(config, false, &meta(SourceKind::LiveSingle));
        assert!(confirmed.is_ok());
    }

    #[test]
    fn full_queue_drops_and_counts_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("rec");
        let mut config = ImageWriterConfig::new(&target);
        config.queue_size = 1;
        let mut writer =
            ImageWriter::open(config, false, &meta(SourceKind::LiveSingle)).unwrap();
        let total = 200u64;
        for n in 0..total {
            writer.write(single_frame(n, 50)).unwrap();
        }
        writer.finish().unwrap();
        assert_eq!(writer.written() + writer.dropped(), total);
        assert!(writer.written() >= 1);
    }
}
