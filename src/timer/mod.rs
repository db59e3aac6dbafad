//! Deadline scheduling
//!
//! A process-wide [`TimerWheel`] holds every connection deadline; each
//! connection owns a [`DeadlineMailbox`] through which fires arrive as
//! messages on the connection's own task, keeping per-connection state
//! single-writer.

mod wheel;

pub use wheel::{TimerHandle, TimerWheel, DEFAULT_SLOTS};

use std::time::Duration;

use tokio::sync::mpsc;

/// The three independent timeout classes of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Full request head must arrive before this fires
    ResponseHeader,
    /// The whole request-to-response span
    Request,
    /// Idle keep-alive reclamation
    Idle,
}

impl TimeoutKind {
    fn index(self) -> usize {
        match self {
            TimeoutKind::ResponseHeader => 0,
            TimeoutKind::Request => 1,
            TimeoutKind::Idle => 2,
        }
    }
}

/// Per-connection deadline set
///
/// Arms at most one deadline per [`TimeoutKind`]; the wheel driver posts a
/// fire as a message into the mailbox rather than running connection logic
/// on the driver thread. Re-arming or disarming invalidates any fire
/// already in flight for that kind (sequence tokens), so a stale message is
/// discarded instead of cancelling the wrong wait.
pub struct DeadlineMailbox {
    wheel: TimerWheel,
    tx: mpsc::UnboundedSender<(TimeoutKind, u64)>,
    rx: mpsc::UnboundedReceiver<(TimeoutKind, u64)>,
    armed: [Option<TimerHandle>; 3],
    seq: [u64; 3],
}

impl DeadlineMailbox {
    /// Create a mailbox scheduling on the given wheel
    #[must_use]
    pub fn new(wheel: TimerWheel) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            wheel,
            tx,
            rx,
            armed: [None, None, None],
            seq: [0; 3],
        }
    }

    /// Arm (or re-arm) the deadline for `kind`
    pub fn arm(&mut self, kind: TimeoutKind, delay: Duration) {
        self.disarm(kind);

        let i = kind.index();
        let seq = self.seq[i];
        let tx = self.tx.clone();
        let handle = self.wheel.schedule(delay, move || {
            tx.send((kind, seq)).ok();
        });
        self.armed[i] = Some(handle);
    }

    /// Disarm the deadline for `kind`
    ///
    /// A fire already posted for this kind becomes stale and is discarded.
    pub fn disarm(&mut self, kind: TimeoutKind) {
        let i = kind.index();
        self.seq[i] += 1;
        if let Some(handle) = self.armed[i].take() {
            self.wheel.cancel(&handle);
        }
    }

    /// Disarm every deadline
    pub fn disarm_all(&mut self) {
        self.disarm(TimeoutKind::ResponseHeader);
        self.disarm(TimeoutKind::Request);
        self.disarm(TimeoutKind::Idle);
    }

    /// Wait for the next live deadline fire
    ///
    /// Stale fires (disarmed or re-armed since posting) are skipped.
    /// Cancel-safe: suitable as a `select!` branch.
    pub async fn fired(&mut self) -> TimeoutKind {
        loop {
            match self.rx.recv().await {
                Some((kind, seq)) if seq == self.seq[kind.index()] => {
                    self.armed[kind.index()] = None;
                    return kind;
                }
                Some(_) => continue, // stale
                // we hold a sender, so the channel cannot close
                None => std::future::pending::<()>().await,
            }
        }
    }
}

impl Drop for DeadlineMailbox {
    fn drop(&mut self) {
        for handle in self.armed.iter().flatten() {
            self.wheel.cancel(handle);
        }
    }
}

impl std::fmt::Debug for DeadlineMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineMailbox")
            .field("armed", &self.armed.iter().filter(|h| h.is_some()).count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_armed_deadline_delivers_kind() {
        let wheel = TimerWheel::with_slots(Duration::from_millis(10), 64);
        let mut mailbox = DeadlineMailbox::new(wheel.clone());

        mailbox.arm(TimeoutKind::Idle, Duration::from_millis(20));
        wheel.advance_by(3);

        let kind = tokio::time::timeout(Duration::from_secs(1), mailbox.fired())
            .await
            .unwrap();
        assert_eq!(kind, TimeoutKind::Idle);
    }

    #[tokio::test]
    async fn test_disarm_discards_in_flight_fire() {
        let wheel = TimerWheel::with_slots(Duration::from_millis(10), 64);
        let mut mailbox = DeadlineMailbox::new(wheel.clone());

        mailbox.arm(TimeoutKind::ResponseHeader, Duration::from_millis(10));
        // fire posts the message, then the disarm makes it stale
        wheel.advance_by(2);
        mailbox.disarm(TimeoutKind::ResponseHeader);

        mailbox.arm(TimeoutKind::Request, Duration::from_millis(10));
        wheel.advance_by(2);

        // the stale ResponseHeader fire must be skipped
        let kind = tokio::time::timeout(Duration::from_secs(1), mailbox.fired())
            .await
            .unwrap();
        assert_eq!(kind, TimeoutKind::Request);
    }

    #[tokio::test]
    async fn test_rearm_supersedes_previous() {
        let wheel = TimerWheel::with_slots(Duration::from_millis(10), 64);
        let mut mailbox = DeadlineMailbox::new(wheel.clone());

        mailbox.arm(TimeoutKind::Idle, Duration::from_millis(10));
        mailbox.arm(TimeoutKind::Idle, Duration::from_millis(100));

        // only the superseded deadline would have fired by now
        wheel.advance_by(5);
        let waited =
            tokio::time::timeout(Duration::from_millis(50), mailbox.fired()).await;
        assert!(waited.is_err(), "superseded deadline must not deliver");
    }
}
