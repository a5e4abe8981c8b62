//! Pose inference on a dedicated worker thread with a per-frame deadline.
//!
//! The tick hands each frame to the worker and waits at most `deadline` for
//! the answer. A late answer is discarded once it arrives; until then the
//! worker is busy and later frames are skipped instead of queued.

use std::{io, time::Duration};

use anyhow::anyhow;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use ml_core::{ImageView, PoseDetection, PoseError, PoseEstimator, PoseQuery};
use tracing::{debug, warn};

use crate::monitor::telemetry;

type InferenceResult = Result<Vec<PoseDetection>, PoseError>;

struct InferenceJob {
    data: Vec<u8>,
    width: i32,
    height: i32,
    query: PoseQuery,
    reply: Sender<InferenceResult>,
}

/// [`PoseEstimator`] that runs the wrapped estimator off the calling thread
/// and gives up after a deadline.
pub(crate) struct DeadlineEstimator {
    jobs: Sender<InferenceJob>,
    in_flight: Option<Receiver<InferenceResult>>,
    deadline: Duration,
}

impl DeadlineEstimator {
    pub(crate) fn spawn(mut estimator: Box<dyn PoseEstimator>, deadline: Duration) -> io::Result<Self> {
        let (jobs, queue) = crossbeam_channel::bounded::<InferenceJob>(1);
        telemetry::spawn_thread("pose-inference", move || {
            for job in queue.iter() {
                let result = ImageView::new(&job.data, job.width, job.height)
                    .and_then(|view| estimator.estimate(&view, &job.query));
                let _ = job.reply.send(result);
            }
            debug!("pose inference worker stopped");
        })?;
        Ok(Self {
            jobs,
            in_flight: None,
            deadline,
        })
    }

    /// Whether a timed-out frame is still being processed.
    fn still_busy(&mut self) -> bool {
        let Some(pending) = self.in_flight.take() else {
            return false;
        };
        match pending.try_recv() {
            Ok(_) => {
                debug!("discarding late pose result");
                false
            }
            Err(TryRecvError::Empty) => {
                self.in_flight = Some(pending);
                true
            }
            Err(TryRecvError::Disconnected) => false,
        }
    }
}

impl PoseEstimator for DeadlineEstimator {
    fn estimate(&mut self, image: &ImageView<'_>, query: &PoseQuery) -> InferenceResult {
        if self.still_busy() {
            return Err(PoseError::Busy);
        }

        let (reply, result) = crossbeam_channel::bounded(1);
        let job = InferenceJob {
            data: image.data.to_vec(),
            width: image.width,
            height: image.height,
            query: *query,
            reply,
        };
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(PoseError::Busy),
            Err(TrySendError::Disconnected(_)) => {
                return Err(PoseError::Backend(anyhow!("pose inference worker has stopped")));
            }
        }

        match result.recv_timeout(self.deadline) {
            Ok(detections) => detections,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    deadline_ms = self.deadline.as_millis() as u64,
                    "pose inference overran its deadline"
                );
                self.in_flight = Some(result);
                Err(PoseError::TimedOut(self.deadline))
            }
            Err(RecvTimeoutError::Disconnected) => Err(PoseError::Backend(anyhow!(
                "pose inference worker stopped mid-frame"
            ))),
        }
    }
}
