//! Person/pose detection types shared by every backend.

use std::time::Duration;

use thiserror::Error;

/// Number of landmarks in the COCO keypoint layout.
pub const KEYPOINT_COUNT: usize = 17;

/// COCO keypoint order as emitted by YOLOv8-pose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum CocoKeypoint {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl CocoKeypoint {
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            CocoKeypoint::Nose => "nose",
            CocoKeypoint::LeftEye => "left_eye",
            CocoKeypoint::RightEye => "right_eye",
            CocoKeypoint::LeftEar => "left_ear",
            CocoKeypoint::RightEar => "right_ear",
            CocoKeypoint::LeftShoulder => "left_shoulder",
            CocoKeypoint::RightShoulder => "right_shoulder",
            CocoKeypoint::LeftElbow => "left_elbow",
            CocoKeypoint::RightElbow => "right_elbow",
            CocoKeypoint::LeftWrist => "left_wrist",
            CocoKeypoint::RightWrist => "right_wrist",
            CocoKeypoint::LeftHip => "left_hip",
            CocoKeypoint::RightHip => "right_hip",
            CocoKeypoint::LeftKnee => "left_knee",
            CocoKeypoint::RightKnee => "right_knee",
            CocoKeypoint::LeftAnkle => "left_ankle",
            CocoKeypoint::RightAnkle => "right_ankle",
        }
    }
}

/// Limb pairs used when drawing a skeleton.
pub const SKELETON: [(CocoKeypoint, CocoKeypoint); 14] = [
    (CocoKeypoint::Nose, CocoKeypoint::LeftShoulder),
    (CocoKeypoint::Nose, CocoKeypoint::RightShoulder),
    (CocoKeypoint::LeftShoulder, CocoKeypoint::RightShoulder),
    (CocoKeypoint::LeftShoulder, CocoKeypoint::LeftElbow),
    (CocoKeypoint::LeftElbow, CocoKeypoint::LeftWrist),
    (CocoKeypoint::RightShoulder, CocoKeypoint::RightElbow),
    (CocoKeypoint::RightElbow, CocoKeypoint::RightWrist),
    (CocoKeypoint::LeftShoulder, CocoKeypoint::LeftHip),
    (CocoKeypoint::RightShoulder, CocoKeypoint::RightHip),
    (CocoKeypoint::LeftHip, CocoKeypoint::RightHip),
    (CocoKeypoint::LeftHip, CocoKeypoint::LeftKnee),
    (CocoKeypoint::LeftKnee, CocoKeypoint::LeftAnkle),
    (CocoKeypoint::RightHip, CocoKeypoint::RightKnee),
    (CocoKeypoint::RightKnee, CocoKeypoint::RightAnkle),
];

/// Borrowed packed BGR8 image.
#[derive(Clone, Copy, Debug)]
pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: i32,
    pub height: i32,
}

impl<'a> ImageView<'a> {
    pub fn new(data: &'a [u8], width: i32, height: i32) -> Result<Self, PoseError> {
        let expected = (width.max(0) as usize) * (height.max(0) as usize) * 3;
        if width <= 0 || height <= 0 || data.len() != expected {
            return Err(PoseError::InvalidInput(format!(
                "buffer of {} bytes does not match {width}x{height} BGR8",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }
}

/// Axis-aligned box in pixel coordinates (corner form).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union; zero for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    /// Clamp into `[0, width) x [0, height)`. NaN coordinates become zero.
    pub fn clamp_to(&self, width: i32, height: i32) -> BoundingBox {
        let max_x = (width.max(1) - 1) as f32;
        let max_y = (height.max(1) - 1) as f32;
        let clamp = |v: f32, max: f32| if v.is_nan() { 0.0 } else { v.clamp(0.0, max) };
        BoundingBox {
            x1: clamp(self.x1, max_x),
            y1: clamp(self.y1, max_y),
            x2: clamp(self.x2, max_x),
            y2: clamp(self.y2, max_y),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    /// Finite and inside `[0, width] x [0, height]`, edges included.
    pub fn is_within(&self, width: i32, height: i32) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && (0.0..=width as f32).contains(&self.x)
            && (0.0..=height as f32).contains(&self.y)
    }
}

/// One detected person.
#[derive(Clone, Debug, PartialEq)]
pub struct PoseDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Stable across frames while the person stays tracked.
    pub track_id: Option<u64>,
    pub keypoints: [Keypoint; KEYPOINT_COUNT],
}

impl PoseDetection {
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            track_id: None,
            keypoints: [Keypoint::default(); KEYPOINT_COUNT],
        }
    }

    pub fn keypoint(&self, which: CocoKeypoint) -> Keypoint {
        self.keypoints[which.index()]
    }

    /// Clamp the box to a `width` x `height` frame and blank out keypoints
    /// that are off the frame or carry a non-finite value.
    pub fn sanitize(&mut self, width: i32, height: i32) {
        self.bbox = self.bbox.clamp_to(width, height);
        for kp in &mut self.keypoints {
            if !kp.confidence.is_finite() || !kp.is_within(width, height) {
                *kp = Keypoint::default();
            }
        }
    }
}

/// Per-call detection parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseQuery {
    pub confidence_threshold: f32,
    /// Keep track ids continuous with previous calls.
    pub persist_tracks: bool,
}

impl Default for PoseQuery {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            persist_tracks: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoseError {
    #[error("invalid input image: {0}")]
    InvalidInput(String),
    #[error("unexpected model output: {0}")]
    MalformedOutput(String),
    #[error("pose estimation did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("pose estimator is still busy with an earlier frame")]
    Busy,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Person/pose detection capability.
pub trait PoseEstimator: Send {
    fn estimate(
        &mut self,
        image: &ImageView<'_>,
        query: &PoseQuery,
    ) -> Result<Vec<PoseDetection>, PoseError>;
}

impl<T: PoseEstimator + ?Sized> PoseEstimator for Box<T> {
    fn estimate(
        &mut self,
        image: &ImageView<'_>,
        query: &PoseQuery,
    ) -> Result<Vec<PoseDetection>, PoseError> {
        (**self).estimate(image, query)
    }
}

/// Greedy non-maximum suppression, highest confidence first.
pub fn non_max_suppression(
    mut detections: Vec<PoseDetection>,
    iou_threshold: f32,
) -> Vec<PoseDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<PoseDetection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if kept
            .iter()
            .all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        // 50 / 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_strongest_of_overlapping_boxes() {
        let strong = PoseDetection::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.9);
        let weak = PoseDetection::new(BoundingBox::new(1.0, 1.0, 10.0, 10.0), 0.7);
        let apart = PoseDetection::new(BoundingBox::new(50.0, 50.0, 60.0, 60.0), 0.65);
        let kept = non_max_suppression(vec![weak, apart.clone(), strong.clone()], 0.45);
        assert_eq!(kept, vec![strong, apart]);
    }

    #[test]
    fn image_view_validates_buffer_length() {
        assert!(ImageView::new(&[0; 12], 2, 2).is_ok());
        assert!(matches!(
            ImageView::new(&[0; 11], 2, 2),
            Err(PoseError::InvalidInput(_))
        ));
    }

    #[test]
    fn sanitize_drops_off_frame_keypoints() {
        let mut detection = PoseDetection::new(BoundingBox::new(-3e9, f32::NAN, 3e9, 50.0), 0.9);
        detection.keypoints[CocoKeypoint::Nose.index()] = Keypoint::new(3e9, 3e9, 0.9);
        detection.keypoints[CocoKeypoint::LeftEye.index()] = Keypoint::new(f32::NAN, 10.0, 0.9);
        detection.keypoints[CocoKeypoint::RightEye.index()] = Keypoint::new(10.0, 10.0, f32::NAN);
        detection.keypoints[CocoKeypoint::LeftWrist.index()] = Keypoint::new(-0.5, 10.0, 0.9);
        detection.keypoints[CocoKeypoint::RightWrist.index()] = Keypoint::new(64.0, 48.0, 0.8);

        detection.sanitize(64, 48);

        assert_eq!(detection.bbox, BoundingBox::new(0.0, 0.0, 63.0, 47.0));
        for which in [
            CocoKeypoint::Nose,
            CocoKeypoint::LeftEye,
            CocoKeypoint::RightEye,
            CocoKeypoint::LeftWrist,
        ] {
            assert_eq!(detection.keypoint(which), Keypoint::default(), "{}", which.name());
        }
        assert_eq!(
            detection.keypoint(CocoKeypoint::RightWrist),
            Keypoint::new(64.0, 48.0, 0.8)
        );
    }

    #[test]
    fn keypoint_indices_follow_coco_order() {
        assert_eq!(CocoKeypoint::Nose.index(), 0);
        assert_eq!(CocoKeypoint::LeftWrist.index(), 9);
        assert_eq!(CocoKeypoint::RightWrist.index(), 10);
        assert_eq!(CocoKeypoint::RightAnkle.index(), KEYPOINT_COUNT - 1);
    }
}
