//! Single-slot frame hand-off between the acquisition thread and the consumer.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::types::Frame;

/// Outcome of posting a frame into the mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The slot was empty.
    Fresh,
    /// An unread older frame was discarded in favour of this one.
    Superseded,
}

/// Holds at most one unconsumed frame. Posting never blocks: a newer frame
/// replaces whatever the consumer has not picked up yet.
///
/// Only one thread may post; any number may take.
#[derive(Clone)]
pub struct FrameMailbox {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

impl Default for FrameMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameMailbox {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Store `frame`, evicting an unread predecessor if present.
    pub fn post(&self, frame: Frame) -> Delivery {
        let mut pending = frame;
        let mut delivery = Delivery::Fresh;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return delivery,
                Err(TrySendError::Full(frame)) => {
                    // The consumer may win the race for the stale frame; either way the
                    // slot is free on the next attempt.
                    if self.rx.try_recv().is_ok() {
                        delivery = Delivery::Superseded;
                    }
                    pending = frame;
                }
                // Both ends live in `self`, so the channel cannot disconnect.
                Err(TrySendError::Disconnected(_)) => return delivery,
            }
        }
    }

    /// Take the latest frame if one is waiting.
    pub fn take(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: i64) -> Frame {
        Frame::bgr8(vec![0; 3], 1, 1, ts).unwrap()
    }

    #[test]
    fn take_on_empty_mailbox_returns_none() {
        let mailbox = FrameMailbox::new();
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn newer_frame_supersedes_unread_one() {
        let mailbox = FrameMailbox::new();
        assert_eq!(mailbox.post(frame(1)), Delivery::Fresh);
        assert_eq!(mailbox.post(frame(2)), Delivery::Superseded);
        assert_eq!(mailbox.post(frame(3)), Delivery::Superseded);

        let latest = mailbox.take().unwrap();
        assert_eq!(latest.timestamp_ms, 3);
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn consumed_frame_is_not_returned_twice() {
        let mailbox = FrameMailbox::new();
        mailbox.post(frame(7));
        assert_eq!(mailbox.take().map(|f| f.timestamp_ms), Some(7));
        assert!(mailbox.is_empty());
        assert_eq!(mailbox.post(frame(8)), Delivery::Fresh);
    }

    #[test]
    fn concurrent_posting_never_blocks_and_keeps_newest() {
        let mailbox = FrameMailbox::new();
        let producer = mailbox.clone();
        let handle = std::thread::spawn(move || {
            for ts in 0..10_000 {
                producer.post(frame(ts));
            }
        });

        let mut last_seen = -1;
        while !handle.is_finished() {
            if let Some(f) = mailbox.take() {
                assert!(f.timestamp_ms > last_seen);
                last_seen = f.timestamp_ms;
            }
        }
        handle.join().unwrap();
        if let Some(f) = mailbox.take() {
            assert_eq!(f.timestamp_ms, 9_999);
        } else {
            assert_eq!(last_seen, 9_999);
        }
    }
}
