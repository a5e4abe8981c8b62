//! Person/pose detection capability for the monitor: shared types, the IoU
//! tracker and, with the `with-tch` feature, a TorchScript YOLOv8-pose backend.

pub mod identity;
pub mod pose;
pub mod tracker;

#[cfg(feature = "with-tch")]
pub mod detector;

#[cfg(feature = "with-tch")]
pub use detector::TorchPoseDetector;
pub use identity::{IdentityMatcher, UNKNOWN_IDENTITY};
pub use pose::{
    BoundingBox, CocoKeypoint, ImageView, KEYPOINT_COUNT, Keypoint, PoseDetection, PoseError,
    PoseEstimator, PoseQuery, SKELETON, non_max_suppression,
};
pub use tracker::IouTracker;

#[cfg(feature = "with-tch")]
pub use tch;
