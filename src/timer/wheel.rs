//! Hashed timer wheel with O(1) schedule and cancel
//!
//! A flat circular bucket array covers a fixed horizon of `slots × tick`.
//! Delays beyond the horizon are clamped to one revolution, so the wheel
//! must be sized to cover the longest configured timeout. Timeout semantics
//! are integer multiples of the tick; up to one tick of slack is accepted
//! in exchange for constant-cost scheduling across thousands of
//! connections.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Default number of wheel slots
pub const DEFAULT_SLOTS: usize = 8192;

/// Handle for a scheduled deadline
///
/// Inert once the deadline fires or the wheel shuts down; cancelling an
/// inert handle is a no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    slot: usize,
}

const INERT_SLOT: usize = usize::MAX;

impl TimerHandle {
    fn inert(id: u64) -> Self {
        Self {
            id,
            slot: INERT_SLOT,
        }
    }
}

struct Entry {
    id: u64,
    callback: Box<dyn FnOnce() + Send>,
}

struct WheelState {
    slots: Vec<Vec<Entry>>,
    cursor: usize,
}

struct WheelInner {
    tick: Duration,
    state: Mutex<WheelState>,
    shutdown: AtomicBool,
    next_id: AtomicU64,
    scheduled: AtomicUsize,
}

impl WheelInner {
    /// Advance the cursor by `steps` slots, firing everything crossed.
    ///
    /// Callbacks run after the slot lock is released so a callback may
    /// schedule or cancel without deadlocking.
    fn advance_by(&self, steps: u64) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        let mut fired: Vec<Entry> = Vec::new();
        {
            let mut state = self.state.lock().expect("wheel lock poisoned");
            let slot_count = state.slots.len();
            // one full revolution crosses every slot
            let steps = steps.min(slot_count as u64);
            for _ in 0..steps {
                state.cursor = (state.cursor + 1) % slot_count;
                let cursor = state.cursor;
                fired.append(&mut state.slots[cursor]);
            }
        }

        if !fired.is_empty() {
            self.scheduled.fetch_sub(fired.len(), Ordering::Relaxed);
            trace!(count = fired.len(), "firing deadlines");
            for entry in fired {
                (entry.callback)();
            }
        }
    }
}

/// Process-wide deadline scheduler
///
/// Cloning shares the same wheel. A dedicated driver task advances the
/// cursor at the tick granularity; `spawn_driver` must run inside a tokio
/// runtime.
#[derive(Clone)]
pub struct TimerWheel {
    inner: Arc<WheelInner>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TimerWheel {
    /// Create a wheel with the default slot count
    #[must_use]
    pub fn new(tick: Duration) -> Self {
        Self::with_slots(tick, DEFAULT_SLOTS)
    }

    /// Create a wheel covering a horizon of `slots × tick`
    ///
    /// # Panics
    ///
    /// Panics if `slots` is 0 or `tick` is zero (programming error)
    #[must_use]
    pub fn with_slots(tick: Duration, slots: usize) -> Self {
        assert!(slots > 0, "wheel must have at least one slot");
        assert!(!tick.is_zero(), "tick must be non-zero");

        let mut buckets = Vec::with_capacity(slots);
        buckets.resize_with(slots, Vec::new);

        Self {
            inner: Arc::new(WheelInner {
                tick,
                state: Mutex::new(WheelState {
                    slots: buckets,
                    cursor: 0,
                }),
                shutdown: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                scheduled: AtomicUsize::new(0),
            }),
            driver: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedule `callback` to fire after `delay`
    ///
    /// Delays beyond the wheel horizon are clamped to one revolution.
    /// The callback should be a cheap notification send; per-connection
    /// work belongs on the connection's own task.
    ///
    /// # Panics
    ///
    /// Panics if the wheel lock is poisoned
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if self.inner.shutdown.load(Ordering::Acquire) {
            return TimerHandle::inert(id);
        }

        let mut state = self.inner.state.lock().expect("wheel lock poisoned");
        let slot_count = state.slots.len();
        // round up and land at least one tick out, never in the live slot
        let ticks = delay
            .as_nanos()
            .div_ceil(self.inner.tick.as_nanos())
            .max(1)
            .min(slot_count as u128 - 1) as usize;
        let slot = (state.cursor + ticks) % slot_count;
        state.slots[slot].push(Entry {
            id,
            callback: Box::new(callback),
        });
        drop(state);

        self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
        TimerHandle { id, slot }
    }

    /// Cancel a scheduled deadline
    ///
    /// Safe to race with the driver firing the same deadline: a fired or
    /// already-cancelled handle is a no-op. Returns whether the deadline
    /// was still pending.
    ///
    /// # Panics
    ///
    /// Panics if the wheel lock is poisoned
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        if handle.slot == INERT_SLOT || self.inner.shutdown.load(Ordering::Acquire) {
            return false;
        }

        let removed = {
            let mut state = self.inner.state.lock().expect("wheel lock poisoned");
            let bucket = &mut state.slots[handle.slot];
            match bucket.iter().position(|e| e.id == handle.id) {
                Some(idx) => {
                    // drop outside the lock
                    Some(bucket.swap_remove(idx))
                }
                None => None,
            }
        };

        match removed {
            Some(_) => {
                self.inner.scheduled.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Number of pending deadlines
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.scheduled.load(Ordering::Relaxed)
    }

    /// Whether no deadlines are pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The wheel's tick granularity
    #[must_use]
    pub fn tick(&self) -> Duration {
        self.inner.tick
    }

    /// Advance the cursor by `steps` ticks, firing crossed deadlines
    ///
    /// Normally invoked by the internal driver; exposed for embedding the
    /// wheel under an external clock.
    pub fn advance_by(&self, steps: u64) {
        self.inner.advance_by(steps);
    }

    /// Spawn the driver task that advances the wheel at the tick rate
    ///
    /// Idempotent; a second call is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the driver lock is poisoned
    pub fn spawn_driver(&self) {
        let mut driver = self.driver.lock().expect("driver lock poisoned");
        if driver.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *driver = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut ticked: u64 = 0;
            let mut interval = tokio::time::interval(inner.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await; // completes immediately

            loop {
                interval.tick().await;
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                // catch up on every slot crossed since the last pass
                let due = (start.elapsed().as_nanos() / inner.tick.as_nanos()) as u64;
                let steps = due.saturating_sub(ticked);
                ticked = due;
                if steps > 0 {
                    inner.advance_by(steps);
                }
            }
        }));
    }

    /// Stop the driver and drop all pending deadlines without firing them
    ///
    /// Outstanding handles become permanently inert.
    ///
    /// # Panics
    ///
    /// Panics if the wheel lock is poisoned
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        if let Some(task) = self
            .driver
            .lock()
            .expect("driver lock poisoned")
            .take()
        {
            task.abort();
        }

        let dropped = {
            let mut state = self.inner.state.lock().expect("wheel lock poisoned");
            let mut dropped = 0;
            for bucket in &mut state.slots {
                dropped += bucket.len();
                bucket.clear();
            }
            dropped
        };
        if dropped > 0 {
            self.inner.scheduled.fetch_sub(dropped, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("tick", &self.inner.tick)
            .field("scheduled", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_wheel() -> (TimerWheel, Arc<AtomicUsize>) {
        (
            TimerWheel::with_slots(Duration::from_millis(10), 64),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    #[test]
    fn test_deadline_fires_exactly_once() {
        let (wheel, count) = counting_wheel();
        let c = Arc::clone(&count);
        wheel.schedule(Duration::from_millis(30), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        wheel.advance_by(2);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        wheel.advance_by(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // crossing the slot again must not re-fire
        wheel.advance_by(64);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_deadline_never_fires() {
        let (wheel, count) = counting_wheel();
        let c = Arc::clone(&count);
        let handle = wheel.schedule(Duration::from_millis(30), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wheel.cancel(&handle));
        wheel.advance_by(64);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let (wheel, count) = counting_wheel();
        let c = Arc::clone(&count);
        let handle = wheel.schedule(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        wheel.advance_by(2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!wheel.cancel(&handle));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_delay_lands_one_tick_out() {
        let (wheel, count) = counting_wheel();
        let c = Arc::clone(&count);
        wheel.schedule(Duration::ZERO, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        wheel.advance_by(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_over_horizon_delay_clamps_to_revolution() {
        let (wheel, count) = counting_wheel();
        let c = Arc::clone(&count);
        wheel.schedule(Duration::from_secs(3600), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        wheel.advance_by(63);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_suppresses_pending() {
        let (wheel, count) = counting_wheel();
        let c = Arc::clone(&count);
        let handle = wheel.schedule(Duration::from_millis(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        wheel.shutdown();
        wheel.advance_by(64);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        // handles are inert after shutdown
        assert!(!wheel.cancel(&handle));
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_callback_may_reschedule() {
        let (wheel, count) = counting_wheel();
        let c = Arc::clone(&count);
        let w = wheel.clone();
        wheel.schedule(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = Arc::clone(&c);
            w.schedule(Duration::from_millis(10), move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        wheel.advance_by(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        wheel.advance_by(1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_driver_fires_deadline() {
        let wheel = TimerWheel::with_slots(Duration::from_millis(5), 64);
        wheel.spawn_driver();

        let (tx, rx) = tokio::sync::oneshot::channel();
        wheel.schedule(Duration::from_millis(20), move || {
            tx.send(()).ok();
        });

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("deadline should fire within a second")
            .expect("callback should send");

        wheel.shutdown();
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Schedule { delay_ticks: u8 },
            Cancel { index: usize },
            Advance { steps: u8 },
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1..32u8).prop_map(|delay_ticks| Op::Schedule { delay_ticks }),
                (0..64usize).prop_map(|index| Op::Cancel { index }),
                (0..8u8).prop_map(|steps| Op::Advance { steps }),
            ]
        }

        proptest! {
            // For all schedule/cancel/advance interleavings, a cancelled
            // deadline fires zero times and a fired deadline exactly once.
            #[test]
            fn fire_at_most_once_and_never_after_cancel(ops in prop::collection::vec(op_strategy(), 1..64)) {
                let wheel = TimerWheel::with_slots(Duration::from_millis(10), 64);
                let mut handles: Vec<(TimerHandle, Arc<AtomicUsize>, bool)> = Vec::new();

                for op in ops {
                    match op {
                        Op::Schedule { delay_ticks } => {
                            let count = Arc::new(AtomicUsize::new(0));
                            let c = Arc::clone(&count);
                            let handle = wheel.schedule(
                                Duration::from_millis(u64::from(delay_ticks) * 10),
                                move || {
                                    c.fetch_add(1, Ordering::SeqCst);
                                },
                            );
                            handles.push((handle, count, false));
                        }
                        Op::Cancel { index } => {
                            if !handles.is_empty() {
                                let i = index % handles.len();
                                let was_pending = wheel.cancel(&handles[i].0);
                                if was_pending {
                                    handles[i].2 = true;
                                }
                            }
                        }
                        Op::Advance { steps } => {
                            wheel.advance_by(u64::from(steps));
                        }
                    }
                }

                // drain everything still pending
                wheel.advance_by(64);

                for (_, count, cancelled) in &handles {
                    let fired = count.load(Ordering::SeqCst);
                    if *cancelled {
                        prop_assert_eq!(fired, 0);
                    } else {
                        prop_assert_eq!(fired, 1);
                    }
                }
            }
        }
    }
}
