//! Background acquisition loop feeding the latest-frame mailbox.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    mailbox::{Delivery, FrameMailbox},
    types::{CaptureError, Frame},
};

/// A device that yields one frame per call. Implementations may block for up
/// to one frame interval; errors are treated as transient by [`FrameSource`].
pub trait CaptureDevice: Send + 'static {
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Free the underlying device. Called once from the acquisition thread.
    fn release(&mut self) {}

    fn describe(&self) -> String {
        "capture device".to_string()
    }
}

#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// Pause after a failed read before trying again.
    pub retry_backoff: Duration,
    pub thread_name: String,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(100),
            thread_name: "frame-source".to_string(),
        }
    }
}

/// Running totals maintained by the acquisition thread.
#[derive(Default)]
pub struct SourceStats {
    acquired: AtomicU64,
    superseded: AtomicU64,
    failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStatsSnapshot {
    pub acquired: u64,
    pub superseded: u64,
    pub failures: u64,
}

impl SourceStats {
    pub fn snapshot(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Owns a capture device and keeps the freshest frame available for a
/// consumer that runs at its own pace.
pub struct FrameSource {
    device: Option<Box<dyn CaptureDevice>>,
    mailbox: FrameMailbox,
    running: Arc<AtomicBool>,
    stats: Arc<SourceStats>,
    handle: Option<thread::JoinHandle<()>>,
    options: SourceOptions,
}

impl FrameSource {
    pub fn new(device: Box<dyn CaptureDevice>, options: SourceOptions) -> Self {
        Self {
            device: Some(device),
            mailbox: FrameMailbox::new(),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SourceStats::default()),
            handle: None,
            options,
        }
    }

    /// Spawn the acquisition thread. Calling `start` on a running source is a no-op.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let mut device = self.device.take().ok_or(CaptureError::Released)?;
        let description = device.describe();
        let mailbox = self.mailbox.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();
        let backoff = self.options.retry_backoff;

        running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(self.options.thread_name.clone())
            .spawn(move || {
                info!(device = %description, "frame acquisition started");
                acquisition_loop(device.as_mut(), &mailbox, &running, &stats, backoff);
                device.release();
                info!(device = %description, "frame acquisition stopped, device released");
            })
            .map_err(|err| {
                self.running.store(false, Ordering::SeqCst);
                CaptureError::Other(err.into())
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Latest unread frame, or `None` when nothing new has been acquired.
    pub fn read(&self) -> Option<Frame> {
        self.mailbox.take()
    }

    /// Stop acquisition and free the device. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("frame acquisition thread panicked");
            }
        } else if let Some(mut device) = self.device.take() {
            device.release();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.handle.is_some()
    }

    pub fn stats(&self) -> SourceStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn acquisition_loop(
    device: &mut dyn CaptureDevice,
    mailbox: &FrameMailbox,
    running: &AtomicBool,
    stats: &SourceStats,
    backoff: Duration,
) {
    let mut consecutive_failures: u64 = 0;
    while running.load(Ordering::Relaxed) {
        match device.read_frame() {
            Ok(frame) => {
                if consecutive_failures > 0 {
                    info!(
                        failures = consecutive_failures,
                        "capture recovered after failed reads"
                    );
                    consecutive_failures = 0;
                }
                stats.acquired.fetch_add(1, Ordering::Relaxed);
                if mailbox.post(frame) == Delivery::Superseded {
                    stats.superseded.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                consecutive_failures += 1;
                if consecutive_failures == 1 {
                    warn!("camera read failed: {err}");
                } else {
                    debug!(failures = consecutive_failures, "camera read failed: {err}");
                }
                thread::sleep(backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        time::{Duration, Instant},
    };

    use super::*;

    struct ScriptedDevice {
        script: VecDeque<Result<i64, ()>>,
        released: Arc<AtomicBool>,
    }

    impl CaptureDevice for ScriptedDevice {
        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            thread::sleep(Duration::from_millis(1));
            match self.script.pop_front() {
                Some(Ok(ts)) => Frame::bgr8(vec![0; 3], 1, 1, ts),
                Some(Err(())) | None => Err(CaptureError::EmptyFrame {
                    uri: "scripted".into(),
                }),
            }
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn options() -> SourceOptions {
        SourceOptions {
            retry_backoff: Duration::from_millis(2),
            thread_name: "test-source".into(),
        }
    }

    fn wait_until(deadline: Duration, mut f: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn read_before_start_reports_no_data() {
        let released = Arc::new(AtomicBool::new(false));
        let source = FrameSource::new(
            Box::new(ScriptedDevice {
                script: VecDeque::new(),
                released,
            }),
            options(),
        );
        assert!(source.read().is_none());
    }

    #[test]
    fn transient_failures_are_retried_and_latest_frame_wins() {
        let released = Arc::new(AtomicBool::new(false));
        let script = VecDeque::from(vec![Err(()), Err(()), Ok(1), Ok(2), Ok(3)]);
        let mut source = FrameSource::new(
            Box::new(ScriptedDevice {
                script,
                released: released.clone(),
            }),
            options(),
        );
        source.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || source.stats().acquired == 3));
        let frame = source.read().expect("frame available");
        assert_eq!(frame.timestamp_ms, 3);
        assert!(source.read().is_none());
        assert!(source.stats().failures >= 2);

        source.release();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn release_is_idempotent_and_blocks_restart() {
        let released = Arc::new(AtomicBool::new(false));
        let mut source = FrameSource::new(
            Box::new(ScriptedDevice {
                script: VecDeque::new(),
                released: released.clone(),
            }),
            options(),
        );
        source.start().unwrap();
        assert!(source.is_running());
        source.release();
        source.release();
        assert!(!source.is_running());
        assert!(released.load(Ordering::SeqCst));
        assert!(matches!(source.start(), Err(CaptureError::Released)));
    }

    #[test]
    fn never_acquiring_device_never_yields_frames() {
        let released = Arc::new(AtomicBool::new(false));
        let mut source = FrameSource::new(
            Box::new(ScriptedDevice {
                script: VecDeque::new(),
                released,
            }),
            options(),
        );
        source.start().unwrap();
        for _ in 0..20 {
            let started = Instant::now();
            assert!(source.read().is_none());
            assert!(started.elapsed() < Duration::from_millis(50));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(source.stats().acquired, 0);
        assert!(source.stats().failures > 0);
    }
}
