//! Cooldown-gated escalation of critical frames into alerts.

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use image::RgbImage;
use tracing::{debug, error, warn};

use crate::monitor::{
    adjudicator::{FrameVerdict, VerdictStatus},
    evidence::EvidenceStore,
    notifier::Alert,
};

/// Anything that accepts alerts without blocking the caller.
pub trait AlertSink {
    fn submit(&self, alert: Alert);
}

/// Time of the last dispatched alert and the minimum spacing between alerts.
#[derive(Clone, Copy, Debug)]
pub struct AlertState {
    pub last_alert: Option<Instant>,
    pub cooldown: Duration,
}

/// What the gate decided for one verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    /// An alert was submitted; `artifact` is the saved evidence, if saving worked.
    Escalated { artifact: Option<PathBuf> },
    /// Critical, but an alert went out less than one cooldown ago.
    Cooldown { remaining: Duration },
    /// Critical while the system is disarmed.
    Disarmed,
    Safe,
}

pub struct AlertGate {
    state: AlertState,
    evidence: EvidenceStore,
}

impl AlertGate {
    pub fn new(cooldown: Duration, evidence: EvidenceStore) -> Self {
        Self {
            state: AlertState {
                last_alert: None,
                cooldown,
            },
            evidence,
        }
    }

    pub fn state(&self) -> AlertState {
        self.state
    }

    /// Escalate when armed, critical and the cooldown has fully elapsed.
    pub fn evaluate(
        &mut self,
        verdict: &FrameVerdict,
        image: &RgbImage,
        armed: bool,
        now: Instant,
        sink: &dyn AlertSink,
    ) -> GateOutcome {
        if !verdict.is_critical() {
            return GateOutcome::Safe;
        }
        if !armed {
            debug!("critical frame ignored: system disarmed");
            return GateOutcome::Disarmed;
        }
        if let Some(last) = self.state.last_alert {
            let elapsed = now.saturating_duration_since(last);
            if elapsed <= self.state.cooldown {
                let remaining = self.state.cooldown - elapsed;
                debug!(remaining_s = remaining.as_secs_f32(), "alert on cooldown");
                return GateOutcome::Cooldown { remaining };
            }
        }

        let raised_at = Local::now();
        warn!(subjects = verdict.breach_count(), "critical security breach detected");
        let artifact = match self.evidence.persist(image, raised_at) {
            Ok(path) => Some(path),
            Err(err) => {
                error!("failed to save alert evidence, sending without photo: {err}");
                None
            }
        };

        sink.submit(Alert {
            artifact: artifact.clone(),
            summary: alert_caption(raised_at, verdict.breach_count()),
            severity: VerdictStatus::Critical,
            raised_at,
        });
        self.state.last_alert = Some(now);
        GateOutcome::Escalated { artifact }
    }
}

fn alert_caption(at: DateTime<Local>, subjects: usize) -> String {
    format!(
        "🚨 SECURITY BREACH 🚨\nTime: {}\nThreat Level: CRITICAL\nSubjects in zone: {subjects}",
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use ml_core::{BoundingBox, KEYPOINT_COUNT, Keypoint};

    use super::*;
    use crate::monitor::adjudicator::Subject;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) alerts: Mutex<Vec<Alert>>,
    }

    impl AlertSink for RecordingSink {
        fn submit(&self, alert: Alert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    fn critical() -> FrameVerdict {
        FrameVerdict {
            subjects: vec![Subject {
                track_id: Some(1),
                bbox: BoundingBox::default(),
                confidence: 0.9,
                keypoints: [Keypoint::default(); KEYPOINT_COUNT],
                identity: "Unknown".into(),
                breach: true,
                breach_points: vec![(500, 200)],
                face: None,
            }],
            status: VerdictStatus::Critical,
        }
    }

    fn gate(dir: &tempfile::TempDir, cooldown_secs: u64) -> AlertGate {
        AlertGate::new(
            Duration::from_secs(cooldown_secs),
            EvidenceStore::new(dir.path(), 80),
        )
    }

    #[test]
    fn cooldown_allows_one_alert_per_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut gate = gate(&dir, 30);
        let sink = RecordingSink::default();
        let image = RgbImage::new(16, 16);
        let t0 = Instant::now();

        let first = gate.evaluate(&critical(), &image, true, t0, &sink);
        assert!(matches!(first, GateOutcome::Escalated { artifact: Some(_) }));

        let second = gate.evaluate(&critical(), &image, true, t0 + Duration::from_secs(10), &sink);
        assert_eq!(
            second,
            GateOutcome::Cooldown {
                remaining: Duration::from_secs(20)
            }
        );

        let third = gate.evaluate(&critical(), &image, true, t0 + Duration::from_secs(31), &sink);
        assert!(matches!(third, GateOutcome::Escalated { .. }));

        let alerts = sink.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].summary.contains("Threat Level: CRITICAL"));
        assert!(alerts[0].artifact.as_ref().unwrap().exists());
    }

    #[test]
    fn exactly_one_cooldown_later_is_still_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut gate = gate(&dir, 30);
        let sink = RecordingSink::default();
        let image = RgbImage::new(4, 4);
        let t0 = Instant::now();
        gate.evaluate(&critical(), &image, true, t0, &sink);
        let at_boundary = gate.evaluate(&critical(), &image, true, t0 + Duration::from_secs(30), &sink);
        assert!(matches!(at_boundary, GateOutcome::Cooldown { .. }));
    }

    #[test]
    fn disarmed_never_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let mut gate = gate(&dir, 0);
        let sink = RecordingSink::default();
        let image = RgbImage::new(4, 4);
        let t0 = Instant::now();
        for i in 0..10 {
            let outcome = gate.evaluate(&critical(), &image, false, t0 + Duration::from_secs(i), &sink);
            assert_eq!(outcome, GateOutcome::Disarmed);
        }
        assert!(sink.alerts.lock().unwrap().is_empty());
        assert!(gate.state().last_alert.is_none());
    }

    #[test]
    fn safe_verdict_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut gate = gate(&dir, 30);
        let sink = RecordingSink::default();
        let outcome = gate.evaluate(&FrameVerdict::safe(), &RgbImage::new(4, 4), true, Instant::now(), &sink);
        assert_eq!(outcome, GateOutcome::Safe);
    }

    #[test]
    fn alerts_in_any_window_are_bounded_by_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let cooldown = 7u64;
        let mut gate = gate(&dir, cooldown);
        let sink = RecordingSink::default();
        let image = RgbImage::new(2, 2);
        let t0 = Instant::now();

        // Critical every second for 60 s.
        let window = 60u64;
        for s in 0..window {
            gate.evaluate(&critical(), &image, true, t0 + Duration::from_secs(s), &sink);
        }
        let sent = sink.alerts.lock().unwrap().len() as u64;
        assert!(sent <= window.div_ceil(cooldown));
        assert!(sent >= window / (cooldown + 1));
    }

    #[test]
    fn evidence_failure_still_submits_alert() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let mut gate = AlertGate::new(Duration::from_secs(30), EvidenceStore::new(&blocker, 80));
        let sink = RecordingSink::default();

        let outcome = gate.evaluate(&critical(), &RgbImage::new(4, 4), true, Instant::now(), &sink);
        assert_eq!(outcome, GateOutcome::Escalated { artifact: None });
        assert_eq!(sink.alerts.lock().unwrap().len(), 1);
    }
}
