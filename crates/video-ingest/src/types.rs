use std::fmt;

use anyhow::Error;
use thiserror::Error;

/// Raw BGR frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Wrap a packed BGR8 buffer, rejecting buffers whose length does not match the size.
    pub fn bgr8(
        data: Vec<u8>,
        width: i32,
        height: i32,
        timestamp_ms: i64,
    ) -> Result<Self, CaptureError> {
        let expected = (width.max(0) as usize) * (height.max(0) as usize) * 3;
        if width <= 0 || height <= 0 || data.len() != expected {
            return Err(CaptureError::Malformed {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms,
            format: FrameFormat::Bgr8,
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source {uri:?} returned no frame")]
    EmptyFrame { uri: String },
    #[error("frame buffer of {len} bytes does not match {width}x{height} BGR8")]
    Malformed { width: i32, height: i32, len: usize },
    #[error("capture device has already been released")]
    Released,
    #[error(transparent)]
    Other(#[from] Error),
}
