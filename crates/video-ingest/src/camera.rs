//! OpenCV-backed capture device.

#[cfg(feature = "opencv")]
pub use backend::OpenCvCamera;

/// Parse a numeric or `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

#[cfg(feature = "opencv")]
mod backend {
    use chrono::Utc;
    use opencv::{
        core::{self, MatTraitConstManual},
        prelude::*,
        videoio::{self, VideoCapture, VideoCaptureTrait},
    };
    use tracing::{debug, info};

    use super::parse_device_index;
    use crate::{
        source::CaptureDevice,
        types::{CaptureError, Frame},
    };

    /// Camera or stream opened through OpenCV's `videoio`.
    ///
    /// The capture handle is opened lazily and dropped after a read error so
    /// that an unplugged camera is picked up again once it returns.
    pub struct OpenCvCamera {
        uri: String,
        target_size: (i32, i32),
        fps: f64,
        cap: Option<VideoCapture>,
        frame: Mat,
        scratch: Mat,
    }

    impl OpenCvCamera {
        pub fn new(uri: impl Into<String>, target_size: (i32, i32)) -> Self {
            Self {
                uri: uri.into(),
                target_size,
                fps: 30.0,
                cap: None,
                frame: Mat::default(),
                scratch: Mat::default(),
            }
        }

        pub fn with_fps(mut self, fps: f64) -> Self {
            self.fps = fps;
            self
        }

        fn ensure_open(&mut self) -> Result<(), CaptureError> {
            if self.cap.is_none() {
                let mut cap = open_video_capture(&self.uri)?;
                configure_camera(&mut cap, self.target_size, self.fps);
                info!(uri = %self.uri, "video source opened");
                self.cap = Some(cap);
            }
            Ok(())
        }

        fn grab(&mut self) -> Result<Frame, CaptureError> {
            let uri = self.uri.clone();
            let (target_w, target_h) = self.target_size;
            self.ensure_open()?;
            let Some(cap) = self.cap.as_mut() else {
                return Err(CaptureError::Open { uri });
            };

            let ok = cap
                .read(&mut self.frame)
                .map_err(|e| CaptureError::Other(e.into()))?;
            let size = self
                .frame
                .size()
                .map_err(|e| CaptureError::Other(e.into()))?;
            if !ok || size.width <= 0 {
                return Err(CaptureError::EmptyFrame { uri });
            }

            let working = if size.width != target_w || size.height != target_h {
                opencv::imgproc::resize(
                    &self.frame,
                    &mut self.scratch,
                    core::Size {
                        width: target_w,
                        height: target_h,
                    },
                    0.0,
                    0.0,
                    opencv::imgproc::INTER_LINEAR,
                )
                .map_err(|e| CaptureError::Other(e.into()))?;
                &self.scratch
            } else {
                &self.frame
            };

            let data = working
                .data_bytes()
                .map_err(|e| CaptureError::Other(e.into()))?
                .to_vec();

            Frame::bgr8(data, target_w, target_h, Utc::now().timestamp_millis())
        }
    }

    impl CaptureDevice for OpenCvCamera {
        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            let result = self.grab();
            if matches!(result, Err(CaptureError::Other(_))) {
                // Reopen on the next attempt.
                self.cap = None;
            }
            result
        }

        fn release(&mut self) {
            if let Some(mut cap) = self.cap.take() {
                if let Err(err) = cap.release() {
                    debug!(uri = %self.uri, "error while releasing capture: {err}");
                }
            }
        }

        fn describe(&self) -> String {
            format!("opencv:{}", self.uri)
        }
    }

    /// Attempt to open a camera input either by index or URI.
    fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
        if let Some(index) = parse_device_index(uri) {
            for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
                match VideoCapture::new(index, backend) {
                    Ok(cap) => {
                        if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                            return Ok(cap);
                        }
                    }
                    Err(err) => {
                        debug!("failed to open device #{index} with backend {backend}: {err}");
                    }
                }
            }
        }

        for backend in [videoio::CAP_FFMPEG, videoio::CAP_ANY] {
            match VideoCapture::from_file(uri, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    debug!("failed to open {uri} with backend {backend}: {err}");
                }
            }
        }

        Err(CaptureError::Open {
            uri: uri.to_string(),
        })
    }

    /// Apply common capture settings (resolution, fps, preferred pixel format).
    fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
        if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
        }
        let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
        let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
        let _ = cap.set(videoio::CAP_PROP_FPS, fps);
    }
}
