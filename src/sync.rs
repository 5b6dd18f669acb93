//! Waiting on deliveries that arrive on client event-loop tasks.
//!
//! An [`Expectation`] is owned by the scenario; delivery callbacks only ever
//! hold its [`EventSink`]. The sink bumps a monotonic counter and the
//! increment that reaches the target flips a one-shot flag with a single
//! compare-exchange, which in turn publishes the completion on a `watch`
//! channel. Duplicate or surplus deliveries only move the counter.
//!
//! [`Mailbox`] is the message-passing counterpart for scenarios that need the
//! delivered content itself rather than a count.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Latch {
    target: u64,
    observed: AtomicU64,
    fired: AtomicBool,
    signal: watch::Sender<bool>,
}

impl Latch {
    fn record(&self) -> bool {
        let now = self.observed.fetch_add(1, Ordering::AcqRel) + 1;
        // only the increment that lands exactly on the target may fire
        now == self.target && self.fire()
    }

    fn fire(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.signal.send_replace(true);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed { observed: u64 },
    TimedOut { observed: u64 },
}

impl WaitOutcome {
    pub fn completed(&self) -> bool {
        matches!(self, WaitOutcome::Completed { .. })
    }

    pub fn observed(&self) -> u64 {
        match *self {
            WaitOutcome::Completed { observed } | WaitOutcome::TimedOut { observed } => observed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuietOutcome {
    Silent,
    Disturbed { observed: u64 },
}

pub struct Expectation {
    latch: Arc<Latch>,
}

impl Expectation {
    /// Expect `n` qualifying events. `count(0)` is complete on creation.
    pub fn count(n: u64) -> Self {
        let (signal, _) = watch::channel(false);
        let latch = Arc::new(Latch {
            target: n,
            observed: AtomicU64::new(0),
            fired: AtomicBool::new(false),
            signal,
        });
        if n == 0 {
            latch.fire();
        }
        Self { latch }
    }

    /// An expectation used as a tripwire for negative windows.
    pub fn none() -> Self {
        Self::count(1)
    }

    pub fn sink(&self) -> EventSink {
        EventSink {
            latch: Arc::clone(&self.latch),
        }
    }

    pub fn target(&self) -> u64 {
        self.latch.target
    }

    pub fn observed(&self) -> u64 {
        self.latch.observed.load(Ordering::Acquire)
    }

    /// Suspends until the target is reached or `budget` elapses.
    pub async fn await_within(&self, budget: Duration) -> WaitOutcome {
        let mut rx = self.latch.signal.subscribe();
        let fired = matches!(
            tokio::time::timeout(budget, rx.wait_for(|fired| *fired)).await,
            Ok(Ok(_))
        );
        let observed = self.observed();
        if fired {
            WaitOutcome::Completed { observed }
        } else {
            WaitOutcome::TimedOut { observed }
        }
    }

    /// Lets the whole window elapse, then reports whether anything was ever
    /// recorded. Never returns early.
    pub async fn expect_none_within(&self, window: Duration) -> QuietOutcome {
        tokio::time::sleep(window).await;
        match self.observed() {
            0 => QuietOutcome::Silent,
            observed => QuietOutcome::Disturbed { observed },
        }
    }
}

/// Producer half of an [`Expectation`]; cheap to clone into callbacks.
#[derive(Clone)]
pub struct EventSink {
    latch: Arc<Latch>,
}

impl EventSink {
    /// Records one qualifying event. Returns `true` only for the call that
    /// completed the expectation.
    pub fn hit(&self) -> bool {
        self.latch.record()
    }

    /// Wraps the sink in a callback that counts only events satisfying
    /// `pred`; everything else is ignored without consuming the target.
    pub fn gate<T: ?Sized>(
        self,
        pred: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> impl Fn(&T) + Send + Sync + 'static {
        move |event: &T| {
            if pred(event) {
                self.hit();
            }
        }
    }
}

/// Unbounded handoff from delivery callbacks to the scenario task.
pub struct Mailbox<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T: Send + 'static> Mailbox<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<T> {
        self.tx.clone()
    }

    pub async fn recv_within(&mut self, budget: Duration) -> Option<T> {
        tokio::time::timeout(budget, self.rx.recv()).await.ok().flatten()
    }

    /// Collects everything that arrives during the whole window.
    pub async fn drain_within(&mut self, window: Duration) -> Vec<T> {
        let deadline = tokio::time::Instant::now() + window;
        let mut items = Vec::new();
        while let Ok(Some(item)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            items.push(item);
        }
        items
    }
}

impl<T: Send + 'static> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_count_zero_is_complete() {
        let exp = Expectation::count(0);
        let outcome = exp.await_within(Duration::from_millis(10)).await;
        assert_eq!(outcome, WaitOutcome::Completed { observed: 0 });
    }

    #[tokio::test]
    async fn test_times_out_without_events() {
        let exp = Expectation::count(2);
        exp.sink().hit();
        let outcome = exp.await_within(Duration::from_millis(50)).await;
        assert_eq!(outcome, WaitOutcome::TimedOut { observed: 1 });
    }

    #[tokio::test]
    async fn test_completion_before_wait_is_not_lost() {
        let exp = Expectation::count(1);
        assert!(exp.sink().hit());
        assert!(exp.await_within(Duration::from_millis(10)).await.completed());
    }

    #[test]
    fn test_only_the_reaching_hit_fires() {
        let exp = Expectation::count(3);
        let sink = exp.sink();
        let fired: Vec<bool> = (0..5).map(|_| sink.hit()).collect();
        assert_eq!(fired, vec![false, false, true, false, false]);
        assert_eq!(exp.observed(), 5);
    }

    #[tokio::test]
    async fn test_surplus_events_are_visible() {
        let exp = Expectation::count(1);
        let sink = exp.sink();
        assert!(sink.hit());
        assert!(!sink.hit());
        let outcome = exp.await_within(Duration::from_millis(10)).await;
        assert_eq!(outcome, WaitOutcome::Completed { observed: 2 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wakes_waiter_from_other_task() {
        let exp = Expectation::count(3);
        let sink = exp.sink();
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                sink.hit();
            }
        });
        assert!(exp.await_within(Duration::from_secs(5)).await.completed());
    }

    #[test]
    fn test_fires_exactly_once_under_racing_threads() {
        for _ in 0..50 {
            let exp = Expectation::count(16);
            let winners = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(std::sync::Barrier::new(8));

            let threads: Vec<_> = (0..8)
                .map(|_| {
                    let sink = exp.sink();
                    let winners = Arc::clone(&winners);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        for _ in 0..4 {
                            if sink.hit() {
                                winners.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }

            assert_eq!(winners.load(Ordering::SeqCst), 1);
            assert_eq!(exp.observed(), 32);
        }
    }

    #[tokio::test]
    async fn test_gate_ignores_non_matching() {
        let exp = Expectation::count(1);
        let callback = exp.sink().gate(|payload: &str| payload == "hello");
        callback("noise");
        callback("retained junk");
        assert_eq!(exp.observed(), 0);
        callback("hello");
        assert!(exp.await_within(Duration::from_millis(10)).await.completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_window_waits_full_duration() {
        let exp = Expectation::none();
        let sink = exp.sink();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(900)).await;
            sink.hit();
        });
        let started = tokio::time::Instant::now();
        let outcome = exp.expect_none_within(Duration::from_secs(1)).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(outcome, QuietOutcome::Disturbed { observed: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_window_silent() {
        let exp = Expectation::none();
        let outcome = exp.expect_none_within(Duration::from_secs(2)).await;
        assert_eq!(outcome, QuietOutcome::Silent);
    }

    #[tokio::test]
    async fn test_mailbox_drain_collects_window() {
        let mut mailbox = Mailbox::new();
        let tx = mailbox.sender();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(mailbox.recv_within(Duration::from_millis(10)).await, Some(1));
        assert_eq!(mailbox.drain_within(Duration::from_millis(20)).await, vec![2]);
        assert_eq!(mailbox.recv_within(Duration::from_millis(10)).await, None);
    }
}
