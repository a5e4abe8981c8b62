//! Continuous camera acquisition for the monitor.
//!
//! A [`FrameSource`] owns a [`CaptureDevice`] on a background thread and
//! publishes each frame into a single-slot [`FrameMailbox`], so the consumer
//! always sees the freshest scene without ever waiting on the camera.

pub mod camera;
pub mod mailbox;
pub mod source;
pub mod types;

#[cfg(feature = "opencv")]
pub use camera::OpenCvCamera;
pub use camera::parse_device_index;
pub use mailbox::{Delivery, FrameMailbox};
pub use source::{CaptureDevice, FrameSource, SourceOptions, SourceStatsSnapshot};
pub use types::{CaptureError, Frame, FrameFormat};
