//! JPEG evidence written for every dispatched alert.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use image::{ImageError, RgbImage, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("evidence I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("JPEG encode failed: {0}")]
    Encode(#[from] ImageError),
}

/// Writes annotated frames as uniquely named JPEG files.
#[derive(Clone, Debug)]
pub struct EvidenceStore {
    dir: PathBuf,
    quality: u8,
}

impl EvidenceStore {
    pub fn new(dir: impl Into<PathBuf>, quality: u8) -> Self {
        Self {
            dir: dir.into(),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `image` as `alert_YYYYmmdd_HHMMSS_mmm.jpg`, adding a numeric
    /// suffix if that name is already taken.
    pub fn persist(
        &self,
        image: &RgbImage,
        at: DateTime<Local>,
    ) -> Result<PathBuf, EvidenceError> {
        fs::create_dir_all(&self.dir).map_err(|source| EvidenceError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let stem = format!("alert_{}", at.format("%Y%m%d_%H%M%S_%3f"));
        let (path, file) = self.create_unique(&stem)?;

        let mut writer = BufWriter::new(file);
        let encoded = JpegEncoder::new_with_quality(&mut writer, self.quality).encode_image(image);
        if let Err(err) = encoded {
            drop(writer);
            let _ = fs::remove_file(&path);
            return Err(err.into());
        }
        writer.flush().map_err(|source| EvidenceError::Io {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), "evidence saved");
        Ok(path)
    }

    fn create_unique(&self, stem: &str) -> Result<(PathBuf, File), EvidenceError> {
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{stem}.jpg")
            } else {
                format!("{stem}_{attempt}.jpg")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(source) => return Err(EvidenceError::Io { path, source }),
            }
        }
    }
}

/// Encode an RGB image to JPEG in memory.
pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}
