use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

use crate::monitor::adjudicator::FrameVerdict;

#[derive(Debug, Default)]
struct Inner {
    total_detections: AtomicU64,
    authorized_count: AtomicU64,
    intruder_count: AtomicU64,
    alerts_sent: AtomicU64,
}

/// Monotonic session counters. Only the tick loop writes; any thread may read.
#[derive(Clone, Debug, Default)]
pub struct Counters(Arc<Inner>);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub total_detections: u64,
    pub authorized_count: u64,
    pub intruder_count: u64,
    pub alerts_sent: u64,
}

impl Counters {
    /// Fold one verdict in: every subject is a detection, breached subjects are
    /// intruders, and non-breached subjects with a known identity are authorized.
    pub fn record_verdict(&self, verdict: &FrameVerdict) {
        let subjects = verdict.subjects.len() as u64;
        if subjects == 0 {
            return;
        }
        let intruders = verdict.breach_count() as u64;
        let authorized = verdict
            .subjects
            .iter()
            .filter(|s| !s.breach && s.is_known())
            .count() as u64;

        self.0.total_detections.fetch_add(subjects, Ordering::Relaxed);
        self.0.intruder_count.fetch_add(intruders, Ordering::Relaxed);
        self.0.authorized_count.fetch_add(authorized, Ordering::Relaxed);
    }

    pub fn record_alert(&self) {
        self.0.alerts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_detections: self.0.total_detections.load(Ordering::Relaxed),
            authorized_count: self.0.authorized_count.load(Ordering::Relaxed),
            intruder_count: self.0.intruder_count.load(Ordering::Relaxed),
            alerts_sent: self.0.alerts_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use ml_core::{BoundingBox, KEYPOINT_COUNT, Keypoint};

    use super::*;
    use crate::monitor::adjudicator::{Subject, VerdictStatus};

    fn subject(identity: &str, breach: bool) -> Subject {
        Subject {
            track_id: None,
            bbox: BoundingBox::default(),
            confidence: 0.9,
            keypoints: [Keypoint::default(); KEYPOINT_COUNT],
            identity: identity.to_string(),
            breach,
            breach_points: Vec::new(),
            face: None,
        }
    }

    #[test]
    fn verdict_updates_per_subject_counts() {
        let counters = Counters::default();
        let verdict = FrameVerdict {
            subjects: vec![
                subject("Unknown", true),
                subject("alice", false),
                subject("Unknown", false),
                subject("bob", true),
            ],
            status: VerdictStatus::Critical,
        };
        counters.record_verdict(&verdict);
        counters.record_alert();

        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                total_detections: 4,
                authorized_count: 1,
                intruder_count: 2,
                alerts_sent: 1,
            }
        );
    }

    #[test]
    fn empty_verdict_changes_nothing() {
        let counters = Counters::default();
        counters.record_verdict(&FrameVerdict::safe());
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }
}
