//! Per-frame breach classification.
//!
//! Each frame is run through the pose capability; a person is in breach when
//! any confident critical landmark (nose, left wrist, right wrist) falls inside
//! or on the restricted-area polygon. Identities come from the optional face
//! matcher, cached per track so the matcher only runs every few frames.

use image::RgbImage;
use ml_core::{
    BoundingBox, CocoKeypoint, IdentityMatcher, ImageView, KEYPOINT_COUNT, Keypoint,
    PoseDetection, PoseError, PoseEstimator, PoseQuery, UNKNOWN_IDENTITY,
};
use serde::Serialize;
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::monitor::{
    annotation,
    identity::IdentityCache,
    roi::{PixelPolygon, Roi},
};

/// Landmarks that count toward a breach.
pub const CRITICAL_LANDMARKS: [CocoKeypoint; 3] = [
    CocoKeypoint::Nose,
    CocoKeypoint::LeftWrist,
    CocoKeypoint::RightWrist,
];

/// Minimum landmark confidence for the breach test.
pub const LANDMARK_CONFIDENCE: f32 = 0.5;

/// Padding applied around the face keypoints, as a fraction of the box side.
const FACE_PADDING: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Safe,
    Critical,
}

impl VerdictStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictStatus::Safe => "SAFE",
            VerdictStatus::Critical => "CRITICAL",
        }
    }
}

/// A person seen in the current frame.
#[derive(Clone, Debug)]
pub struct Subject {
    pub track_id: Option<u64>,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub keypoints: [Keypoint; KEYPOINT_COUNT],
    pub identity: String,
    pub breach: bool,
    /// Pixel positions of the critical landmarks found inside the region.
    pub breach_points: Vec<(i32, i32)>,
    pub face: Option<BoundingBox>,
}

impl Subject {
    pub fn is_known(&self) -> bool {
        self.identity != UNKNOWN_IDENTITY
    }
}

#[derive(Clone, Debug)]
pub struct FrameVerdict {
    pub subjects: Vec<Subject>,
    pub status: VerdictStatus,
}

impl FrameVerdict {
    pub fn safe() -> Self {
        Self {
            subjects: Vec::new(),
            status: VerdictStatus::Safe,
        }
    }

    fn from_subjects(subjects: Vec<Subject>) -> Self {
        let status = if subjects.iter().any(|s| s.breach) {
            VerdictStatus::Critical
        } else {
            VerdictStatus::Safe
        };
        Self { subjects, status }
    }

    pub fn is_critical(&self) -> bool {
        self.status == VerdictStatus::Critical
    }

    pub fn breach_count(&self) -> usize {
        self.subjects.iter().filter(|s| s.breach).count()
    }
}

/// Annotated RGB frame plus the decision made on it.
pub struct Adjudication {
    pub image: RgbImage,
    pub verdict: FrameVerdict,
}

#[derive(Clone, Copy, Debug)]
pub struct AdjudicatorSettings {
    pub confidence_threshold: f32,
    /// Frames between identity refreshes for one track.
    pub identity_interval: u64,
    /// Frames after which an unseen track is dropped from the identity cache.
    pub identity_eviction_frames: u64,
}

impl Default for AdjudicatorSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            identity_interval: 5,
            identity_eviction_frames: 150,
        }
    }
}

pub struct FrameAdjudicator {
    estimator: Box<dyn PoseEstimator>,
    matcher: Option<Box<dyn IdentityMatcher>>,
    identities: IdentityCache,
    query: PoseQuery,
    frame_index: u64,
}

impl FrameAdjudicator {
    pub fn new(
        estimator: Box<dyn PoseEstimator>,
        matcher: Option<Box<dyn IdentityMatcher>>,
        settings: AdjudicatorSettings,
    ) -> Self {
        if matcher.is_none() {
            warn!("face matching unavailable; every subject will be labelled {UNKNOWN_IDENTITY}");
        }
        Self {
            estimator,
            matcher,
            identities: IdentityCache::new(
                settings.identity_interval,
                settings.identity_eviction_frames,
            ),
            query: PoseQuery {
                confidence_threshold: settings.confidence_threshold,
                persist_tracks: true,
            },
            frame_index: 0,
        }
    }

    /// Classify one frame against `roi` and draw the result.
    pub fn adjudicate(&mut self, frame: &Frame, roi: &Roi) -> Adjudication {
        self.frame_index += 1;
        let polygon = roi.to_pixels(frame.width, frame.height);

        let mut image = annotation::frame_to_rgb(frame).unwrap_or_else(|| {
            RgbImage::new(frame.width.max(1) as u32, frame.height.max(1) as u32)
        });
        annotation::draw_roi(&mut image, &polygon);

        let detections = match ImageView::new(&frame.data, frame.width, frame.height)
            .and_then(|view| self.estimator.estimate(&view, &self.query))
        {
            Ok(detections) => detections,
            Err(err @ (PoseError::TimedOut(_) | PoseError::Busy)) => {
                debug!("pose estimation skipped, treating frame as safe: {err}");
                metrics::counter!("monitor_detector_timeouts_total").increment(1);
                return Adjudication {
                    image,
                    verdict: FrameVerdict::safe(),
                };
            }
            Err(err) => {
                warn!("pose estimation failed, treating frame as safe: {err}");
                metrics::counter!("monitor_detector_errors_total").increment(1);
                return Adjudication {
                    image,
                    verdict: FrameVerdict::safe(),
                };
            }
        };

        let subjects: Vec<Subject> = detections
            .into_iter()
            .map(|detection| self.classify(frame, &polygon, detection))
            .collect();
        self.identities.evict_stale(self.frame_index);

        for subject in &subjects {
            annotation::draw_subject(&mut image, subject);
        }

        let verdict = FrameVerdict::from_subjects(subjects);
        debug!(
            frame = self.frame_index,
            subjects = verdict.subjects.len(),
            status = verdict.status.as_str(),
            "frame adjudicated"
        );
        Adjudication { image, verdict }
    }

    fn classify(
        &mut self,
        frame: &Frame,
        polygon: &PixelPolygon,
        mut detection: PoseDetection,
    ) -> Subject {
        detection.sanitize(frame.width, frame.height);
        let breach_points = breach_points(&detection.keypoints, polygon);
        let face = face_region(&detection.keypoints, frame.width, frame.height);
        let identity = self.resolve_identity(frame, detection.track_id, face);

        Subject {
            track_id: detection.track_id,
            bbox: detection.bbox,
            confidence: detection.confidence,
            keypoints: detection.keypoints,
            identity,
            breach: !breach_points.is_empty(),
            breach_points,
            face,
        }
    }

    fn resolve_identity(
        &mut self,
        frame: &Frame,
        track_id: Option<u64>,
        face: Option<BoundingBox>,
    ) -> String {
        let Some(matcher) = self.matcher.as_mut() else {
            return UNKNOWN_IDENTITY.to_string();
        };
        let mut resolve = || match (face, ImageView::new(&frame.data, frame.width, frame.height)) {
            (Some(face), Ok(view)) => matcher
                .identify(&view, face)
                .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string()),
            _ => UNKNOWN_IDENTITY.to_string(),
        };
        match track_id {
            Some(id) => self.identities.label_for(id, self.frame_index, resolve),
            None => resolve(),
        }
    }
}

/// Critical landmarks with confidence >= 0.5 that lie inside or on `polygon`.
pub fn breach_points(
    keypoints: &[Keypoint; KEYPOINT_COUNT],
    polygon: &PixelPolygon,
) -> Vec<(i32, i32)> {
    CRITICAL_LANDMARKS
        .iter()
        .map(|which| keypoints[which.index()])
        .filter(|kp| kp.confidence >= LANDMARK_CONFIDENCE)
        .filter(|kp| kp.x.is_finite() && kp.y.is_finite())
        .map(|kp| (kp.x as i32, kp.y as i32))
        .filter(|&(x, y)| polygon.contains(x as f32, y as f32))
        .collect()
}

/// Square head box derived from the confident face keypoints (nose, eyes,
/// ears) that lie on the frame. Needs at least two of them; padded and
/// clamped to the frame.
pub fn face_region(
    keypoints: &[Keypoint; KEYPOINT_COUNT],
    width: i32,
    height: i32,
) -> Option<BoundingBox> {
    let face: Vec<&Keypoint> = keypoints[..=CocoKeypoint::RightEar.index()]
        .iter()
        .filter(|kp| kp.confidence > LANDMARK_CONFIDENCE && kp.is_within(width, height))
        .collect();
    if face.len() < 2 {
        return None;
    }

    let x1 = face.iter().map(|kp| kp.x).fold(f32::INFINITY, f32::min) as i64;
    let y1 = face.iter().map(|kp| kp.y).fold(f32::INFINITY, f32::min) as i64;
    let x2 = face.iter().map(|kp| kp.x).fold(f32::NEG_INFINITY, f32::max) as i64;
    let y2 = face.iter().map(|kp| kp.y).fold(f32::NEG_INFINITY, f32::max) as i64;

    let (cx, cy) = ((x1 + x2).div_euclid(2), (y1 + y2).div_euclid(2));
    let side = (x2 - x1).max(y2 - y1);
    let size = side + (side as f64 * FACE_PADDING) as i64;
    let half = size.div_euclid(2);

    Some(BoundingBox::new(
        (cx - half).max(0) as f32,
        (cy - half).max(0) as f32,
        (cx + half).min(i64::from(width)) as f32,
        (cy + half).min(i64::from(height)) as f32,
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use std::{thread, time::Duration};

    use super::*;

    /// Replays one prepared response per call; repeats the last when drained.
    /// Calls can be slowed down with per-call delays.
    pub(crate) struct ScriptedEstimator {
        pub(crate) script: VecDeque<Result<Vec<PoseDetection>, String>>,
        last: Vec<PoseDetection>,
        delays: VecDeque<Duration>,
    }

    impl ScriptedEstimator {
        pub(crate) fn new(script: Vec<Result<Vec<PoseDetection>, String>>) -> Self {
            Self {
                script: script.into(),
                last: Vec::new(),
                delays: VecDeque::new(),
            }
        }

        /// Sleep `delays[n]` before answering call `n`; later calls answer at once.
        pub(crate) fn with_delays(mut self, delays: Vec<Duration>) -> Self {
            self.delays = delays.into();
            self
        }
    }

    impl PoseEstimator for ScriptedEstimator {
        fn estimate(
            &mut self,
            _image: &ImageView<'_>,
            _query: &PoseQuery,
        ) -> Result<Vec<PoseDetection>, PoseError> {
            if let Some(delay) = self.delays.pop_front() {
                thread::sleep(delay);
            }
            match self.script.pop_front() {
                Some(Ok(detections)) => {
                    self.last = detections.clone();
                    Ok(detections)
                }
                Some(Err(msg)) => Err(PoseError::MalformedOutput(msg)),
                None => Ok(self.last.clone()),
            }
        }
    }

    struct CountingMatcher {
        calls: Arc<AtomicUsize>,
        name: &'static str,
    }

    impl IdentityMatcher for CountingMatcher {
        fn identify(&mut self, _image: &ImageView<'_>, _face: BoundingBox) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(self.name.to_string())
        }
    }

    pub(crate) fn blank_frame() -> Frame {
        Frame::bgr8(vec![0; 640 * 480 * 3], 640, 480, 0).unwrap()
    }

    /// Person whose only confident keypoints are the given ones.
    pub(crate) fn person(
        track_id: Option<u64>,
        points: &[(CocoKeypoint, f32, f32, f32)],
    ) -> PoseDetection {
        let mut detection = PoseDetection::new(BoundingBox::new(300.0, 100.0, 620.0, 470.0), 0.9);
        detection.track_id = track_id;
        for &(which, x, y, conf) in points {
            detection.keypoints[which.index()] = Keypoint::new(x, y, conf);
        }
        detection
    }

    pub(crate) fn intruder(track_id: Option<u64>) -> PoseDetection {
        person(track_id, &[(CocoKeypoint::RightWrist, 500.0, 200.0, 0.9)])
    }

    fn adjudicator(
        script: Vec<Result<Vec<PoseDetection>, String>>,
        matcher: Option<Box<dyn IdentityMatcher>>,
    ) -> FrameAdjudicator {
        FrameAdjudicator::new(
            Box::new(ScriptedEstimator::new(script)),
            matcher,
            AdjudicatorSettings::default(),
        )
    }

    #[test]
    fn wrist_inside_region_is_critical() {
        let mut adj = adjudicator(vec![Ok(vec![intruder(Some(1))])], None);
        let result = adj.adjudicate(&blank_frame(), &Roi::default());
        assert_eq!(result.verdict.status, VerdictStatus::Critical);
        assert_eq!(result.verdict.subjects.len(), 1);
        let subject = &result.verdict.subjects[0];
        assert!(subject.breach);
        assert_eq!(subject.breach_points, vec![(500, 200)]);
        assert_eq!(subject.identity, UNKNOWN_IDENTITY);
        assert_eq!((result.image.width(), result.image.height()), (640, 480));
    }

    #[test]
    fn low_confidence_landmarks_never_breach() {
        // Box covers the whole region, but every landmark is below 0.5.
        let mut detection = person(
            Some(1),
            &[
                (CocoKeypoint::Nose, 450.0, 250.0, 0.49),
                (CocoKeypoint::LeftWrist, 400.0, 200.0, 0.3),
                (CocoKeypoint::RightWrist, 500.0, 200.0, 0.0),
            ],
        );
        detection.bbox = BoundingBox::new(0.0, 0.0, 639.0, 479.0);
        let mut adj = adjudicator(vec![Ok(vec![detection])], None);
        let result = adj.adjudicate(&blank_frame(), &Roi::default());
        assert_eq!(result.verdict.status, VerdictStatus::Safe);
        assert!(!result.verdict.subjects[0].breach);
    }

    #[test]
    fn landmark_on_boundary_at_threshold_breaches() {
        let detection = person(None, &[(CocoKeypoint::Nose, 352.9, 250.0, 0.5)]);
        let mut adj = adjudicator(vec![Ok(vec![detection])], None);
        let result = adj.adjudicate(&blank_frame(), &Roi::default());
        assert!(result.verdict.is_critical());
        assert_eq!(result.verdict.subjects[0].breach_points, vec![(352, 250)]);
    }

    #[test]
    fn non_critical_landmarks_inside_region_are_ignored() {
        let detection = person(Some(3), &[(CocoKeypoint::LeftShoulder, 500.0, 200.0, 0.99)]);
        let mut adj = adjudicator(vec![Ok(vec![detection])], None);
        assert!(!adj.adjudicate(&blank_frame(), &Roi::default()).verdict.is_critical());
    }

    #[test]
    fn no_candidates_is_safe() {
        let mut adj = adjudicator(vec![Ok(Vec::new())], None);
        let result = adj.adjudicate(&blank_frame(), &Roi::default());
        assert_eq!(result.verdict.status, VerdictStatus::Safe);
        assert!(result.verdict.subjects.is_empty());
    }

    #[test]
    fn estimator_error_yields_safe_frame() {
        let mut adj = adjudicator(
            vec![Err("garbled output".into()), Ok(vec![intruder(Some(1))])],
            None,
        );
        let first = adj.adjudicate(&blank_frame(), &Roi::default());
        assert_eq!(first.verdict.status, VerdictStatus::Safe);
        assert!(first.verdict.subjects.is_empty());

        let second = adj.adjudicate(&blank_frame(), &Roi::default());
        assert!(second.verdict.is_critical());
    }

    #[test]
    fn identity_is_cached_per_track() {
        let calls = Arc::new(AtomicUsize::new(0));
        let face = [
            (CocoKeypoint::Nose, 100.0, 100.0, 0.9),
            (CocoKeypoint::LeftEye, 110.0, 90.0, 0.9),
        ];
        let tracked = person(Some(4), &face);
        let untracked = person(None, &face);
        let matcher = CountingMatcher {
            calls: calls.clone(),
            name: "alice",
        };
        let mut adj = adjudicator(
            vec![Ok(vec![tracked, untracked])],
            Some(Box::new(matcher)),
        );

        for _ in 0..5 {
            let result = adj.adjudicate(&blank_frame(), &Roi::default());
            assert!(result.verdict.subjects.iter().all(|s| s.identity == "alice"));
        }
        // One lookup for the tracked person, five for the untracked one.
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        adj.adjudicate(&blank_frame(), &Roi::default());
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn subjects_without_a_face_stay_unknown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let matcher = CountingMatcher {
            calls: calls.clone(),
            name: "bob",
        };
        let mut adj = adjudicator(vec![Ok(vec![intruder(None)])], Some(Box::new(matcher)));
        let result = adj.adjudicate(&blank_frame(), &Roi::default());
        assert_eq!(result.verdict.subjects[0].identity, UNKNOWN_IDENTITY);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn face_region_is_padded_square_clamped_to_frame() {
        let mut keypoints = [Keypoint::default(); KEYPOINT_COUNT];
        keypoints[CocoKeypoint::Nose.index()] = Keypoint::new(100.0, 100.0, 0.9);
        keypoints[CocoKeypoint::LeftEye.index()] = Keypoint::new(110.0, 90.0, 0.9);
        keypoints[CocoKeypoint::RightEye.index()] = Keypoint::new(90.0, 90.0, 0.9);
        // side 20, padding 16, size 36, centre (100, 95)
        let region = face_region(&keypoints, 640, 480).unwrap();
        assert_eq!(region, BoundingBox::new(82.0, 77.0, 118.0, 113.0));

        keypoints[CocoKeypoint::Nose.index()] = Keypoint::new(2.0, 2.0, 0.9);
        keypoints[CocoKeypoint::LeftEye.index()] = Keypoint::new(12.0, 4.0, 0.9);
        keypoints[CocoKeypoint::RightEye.index()].confidence = 0.5;
        let clamped = face_region(&keypoints, 640, 480).unwrap();
        assert_eq!((clamped.x1, clamped.y1), (0.0, 0.0));
    }

    #[test]
    fn far_off_frame_keypoints_are_discarded() {
        let mut detection = person(
            Some(9),
            &[
                (CocoKeypoint::Nose, 3e9, 3e9, 0.9),
                (CocoKeypoint::LeftEye, 3e9, 3e9, 0.9),
                (CocoKeypoint::RightEye, -3e9, -3e9, 0.9),
                (CocoKeypoint::LeftWrist, -3e9, 200.0, 0.9),
                (CocoKeypoint::RightWrist, f32::NAN, f32::INFINITY, 0.9),
                (CocoKeypoint::LeftShoulder, 500.0, 200.0, 0.9),
                (CocoKeypoint::RightShoulder, 520.0, 210.0, 0.9),
                (CocoKeypoint::RightElbow, 1.0e6, 220.0, 0.9),
            ],
        );
        detection.bbox = BoundingBox::new(-3e9, -3e9, 3e9, 3e9);
        let mut adj = adjudicator(vec![Ok(vec![detection])], None);

        let result = adj.adjudicate(&blank_frame(), &Roi::default());

        assert_eq!(result.verdict.status, VerdictStatus::Safe);
        let subject = &result.verdict.subjects[0];
        assert!(subject.breach_points.is_empty());
        assert!(subject.face.is_none());
        assert_eq!(subject.bbox, BoundingBox::new(0.0, 0.0, 639.0, 479.0));
        assert_eq!(subject.keypoints[CocoKeypoint::Nose.index()].confidence, 0.0);
        assert_eq!(subject.keypoints[CocoKeypoint::RightElbow.index()].confidence, 0.0);
        assert_eq!(subject.keypoints[CocoKeypoint::LeftShoulder.index()].confidence, 0.9);
        assert_eq!((result.image.width(), result.image.height()), (640, 480));
    }

    #[test]
    fn face_region_ignores_points_off_the_frame() {
        let mut keypoints = [Keypoint::default(); KEYPOINT_COUNT];
        keypoints[CocoKeypoint::Nose.index()] = Keypoint::new(3e9, 3e9, 0.9);
        keypoints[CocoKeypoint::LeftEye.index()] = Keypoint::new(3e9, 3e9, 0.9);
        keypoints[CocoKeypoint::RightEye.index()] = Keypoint::new(-3e9, 10.0, 0.9);
        assert!(face_region(&keypoints, 640, 480).is_none());
    }

    #[test]
    fn face_region_needs_two_confident_points() {
        let mut keypoints = [Keypoint::default(); KEYPOINT_COUNT];
        keypoints[CocoKeypoint::Nose.index()] = Keypoint::new(100.0, 100.0, 0.9);
        keypoints[CocoKeypoint::LeftEye.index()] = Keypoint::new(110.0, 90.0, 0.5);
        assert!(face_region(&keypoints, 640, 480).is_none());
    }
}
