use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::monitor::{
    adjudicator::{FrameVerdict, VerdictStatus},
    armed::ArmedState,
    counters::{CounterSnapshot, Counters},
    notifier::ChannelState,
};

/// Latest annotated frame published by the tick loop.
#[derive(Clone)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) verdict: VerdictSummary,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct VerdictSummary {
    pub(crate) frame_number: u64,
    pub(crate) timestamp_ms: i64,
    pub(crate) status: VerdictStatus,
    pub(crate) subjects: usize,
    pub(crate) breaches: usize,
    pub(crate) identities: Vec<String>,
}

impl VerdictSummary {
    pub(crate) fn new(frame_number: u64, timestamp_ms: i64, verdict: &FrameVerdict) -> Self {
        Self {
            frame_number,
            timestamp_ms,
            status: verdict.status,
            subjects: verdict.subjects.len(),
            breaches: verdict.breach_count(),
            identities: verdict.subjects.iter().map(|s| s.identity.clone()).collect(),
        }
    }
}

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    pub(crate) armed: bool,
    pub(crate) mode: &'static str,
    pub(crate) notifier: ChannelState,
    pub(crate) counters: CounterSnapshot,
    pub(crate) last_verdict: Option<VerdictSummary>,
}

pub(crate) type SharedFrame = Arc<Mutex<Option<FramePacket>>>;

/// Plain-text status used for remote `/status` replies.
pub(crate) fn status_report(armed: &ArmedState, counters: &Counters) -> String {
    let snapshot = counters.snapshot();
    format!(
        "📊 System Status\n\nMode: {}\nDetections: {}\nAuthorized: {}\nIntruders: {}\nAlerts sent: {}",
        armed.label(),
        snapshot.total_detections,
        snapshot.authorized_count,
        snapshot.intruder_count,
        snapshot.alerts_sent,
    )
}
