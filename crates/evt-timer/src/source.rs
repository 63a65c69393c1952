//! The timer source: one-shot and recurring deadlines on a background task

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{TimerError, TimerResult};

/// Callback run when a timer fires
///
/// Callbacks run on the timer task and should only hand work off (for
/// example to a worker pool); a slow callback delays every other timer.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct TimerEntry {
    callback: TimerCallback,
    interval: Option<Duration>,
    cancelled: AtomicBool,
    /// Held while the callback runs; cancel waits on it
    invoke_lock: Mutex<()>,
    /// Thread currently running the callback, so a callback can cancel itself
    firing_thread: Mutex<Option<ThreadId>>,
}

impl TimerEntry {
    fn invoke(&self, id: TimerId) {
        let _guard = self.invoke_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }

        *lock(&self.firing_thread) = Some(thread::current().id());
        let result = catch_unwind(AssertUnwindSafe(|| (self.callback)()));
        *lock(&self.firing_thread) = None;

        if result.is_err() {
            warn!(timer = ?id, "Timer callback panicked");
        }
    }
}

struct Slot {
    entry: Arc<TimerEntry>,
    /// Sequence number of the heap item currently representing this timer
    seq: u64,
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, u64, TimerId)>>,
    slots: HashMap<TimerId, Slot>,
}

struct Inner {
    state: Mutex<TimerState>,
    notify: Notify,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

/// Source of scheduled callbacks
///
/// Timers are kept in a deadline-ordered heap served by one tokio task,
/// started with [`TimerSource::start`]. Recurring timers are rescheduled at
/// `deadline + interval`, so their firing times stay on the grid
/// `start + N * interval` however late an individual firing runs; if the
/// task falls more than one interval behind, the missed grid points are
/// skipped rather than fired in a burst.
///
/// [`TimerSource::cancel`] guarantees that once it returns the callback will
/// not be invoked again: cancellation and the armed check before each
/// invocation are serialized on a per-timer lock.
#[derive(Clone)]
pub struct TimerSource {
    inner: Arc<Inner>,
}

impl TimerSource {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TimerState::default()),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
                next_seq: AtomicU64::new(1),
                running: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Start the timer task
    ///
    /// Timers added before the task starts are kept and fire once it runs.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Timer source already running");
            return None;
        }

        let inner = self.inner.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        info!("Starting timer source");

        Some(tokio::spawn(async move {
            loop {
                inner.fire_due(Instant::now());
                let next = inner.next_deadline();

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = inner.notify.notified() => {}
                    _ = sleep_until(next) => {}
                }
            }
            inner.running.store(false, Ordering::SeqCst);
            info!("Timer source stopped");
        }))
    }

    /// Stop the timer task; pending timers stay scheduled
    pub fn stop(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run `callback` once after `delay`
    pub fn after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(Instant::now() + delay, None, Arc::new(callback))
    }

    /// Run `callback` once at `deadline`
    pub fn at<F>(&self, deadline: Instant, callback: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(deadline, None, Arc::new(callback))
    }

    /// Run `callback` at `start_at` (default: now) and every `interval` after
    pub fn every<F>(
        &self,
        interval: Duration,
        start_at: Option<Instant>,
        callback: F,
    ) -> TimerResult<TimerId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(TimerError::ZeroInterval);
        }
        let start = start_at.unwrap_or_else(Instant::now);
        Ok(self.schedule(start, Some(interval), Arc::new(callback)))
    }

    /// Schedule a shared callback
    pub fn schedule(
        &self,
        deadline: Instant,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let id = TimerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(TimerEntry {
            callback,
            interval: interval.filter(|i| !i.is_zero()),
            cancelled: AtomicBool::new(false),
            invoke_lock: Mutex::new(()),
            firing_thread: Mutex::new(None),
        });

        {
            let mut state = self.inner.lock_state();
            state.heap.push(Reverse((deadline, seq, id)));
            state.slots.insert(id, Slot { entry, seq });
        }
        trace!(timer = ?id, ?interval, "Timer scheduled");
        self.inner.notify.notify_one();
        id
    }

    /// Cancel a timer
    ///
    /// Returns false if the timer already completed or was cancelled. After
    /// this returns the callback is never invoked again; if the callback is
    /// running on another thread right now, this waits for it to finish.
    /// A callback may cancel its own timer.
    pub fn cancel(&self, id: TimerId) -> bool {
        let slot = self.inner.lock_state().slots.remove(&id);
        let Some(slot) = slot else {
            return false;
        };

        slot.entry.cancelled.store(true, Ordering::SeqCst);
        let inside_callback = *lock(&slot.entry.firing_thread) == Some(thread::current().id());
        if !inside_callback {
            drop(slot.entry.invoke_lock.lock().unwrap_or_else(|e| e.into_inner()));
        }
        trace!(timer = ?id, "Timer cancelled");
        true
    }

    /// Number of timers still scheduled
    pub fn pending(&self) -> usize {
        self.inner.lock_state().slots.len()
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.inner.lock_state().slots.contains_key(&id)
    }
}

impl Default for TimerSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock_state().heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Invoke every timer whose deadline is at or before `now`
    fn fire_due(&self, now: Instant) {
        loop {
            let due = {
                let mut state = self.lock_state();
                match state.heap.peek() {
                    Some(Reverse((deadline, _, _))) if *deadline <= now => {}
                    _ => break,
                }
                let Some(Reverse((deadline, seq, id))) = state.heap.pop() else {
                    break;
                };
                match state.slots.get(&id) {
                    Some(slot) if slot.seq == seq => Some((deadline, id, slot.entry.clone())),
                    // cancelled or superseded
                    _ => None,
                }
            };

            let Some((deadline, id, entry)) = due else {
                continue;
            };

            entry.invoke(id);

            let mut state = self.lock_state();
            let still_scheduled = state
                .slots
                .get(&id)
                .is_some_and(|slot| Arc::ptr_eq(&slot.entry, &entry));
            if !still_scheduled {
                continue;
            }

            match entry.interval {
                Some(interval) if !entry.cancelled.load(Ordering::SeqCst) => {
                    let mut next = deadline + interval;
                    let mut skipped = 0u64;
                    while next <= now {
                        next += interval;
                        skipped += 1;
                    }
                    if skipped > 0 {
                        debug!(timer = ?id, skipped, "Recurring timer fell behind");
                    }
                    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                    state.heap.push(Reverse((next, seq, id)));
                    if let Some(slot) = state.slots.get_mut(&id) {
                        slot.seq = seq;
                    }
                }
                _ => {
                    state.slots.remove(&id);
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once() {
        let timers = TimerSource::new();
        timers.start();
        let (count, cb) = counter();

        let id = timers.after(Duration::from_millis(500), cb);
        assert!(timers.is_scheduled(id));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timers.pending(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_in_deadline_order() {
        let timers = TimerSource::new();
        timers.start();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, ms) in [("c", 300u64), ("a", 100), ("b", 200)] {
            let order = order.clone();
            timers.after(Duration::from_millis(ms), move || {
                order.lock().unwrap().push(name);
            });
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_deadline() {
        let timers = TimerSource::new();
        timers.start();
        let (count, cb) = counter();

        let id = timers.after(Duration::from_secs(1), cb);
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_timer_does_not_drift() {
        let timers = TimerSource::new();
        timers.start();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();

        let t0 = Instant::now() + Duration::from_secs(1);
        let interval = Duration::from_secs(1);
        let id = timers
            .every(interval, Some(t0), move || {
                sink.lock().unwrap().push(Instant::now());
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100_500)).await;
        timers.cancel(id);

        let fired = fired.lock().unwrap();
        assert!(fired.len() >= 100, "only {} firings", fired.len());
        for (n, at) in fired.iter().take(100).enumerate() {
            let expected = t0 + interval * n as u32;
            let error = if *at >= expected {
                *at - expected
            } else {
                expected - *at
            };
            assert!(
                error <= Duration::from_millis(10),
                "firing {} off by {:?}",
                n,
                error
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_cancel_stops_further_firings() {
        let timers = TimerSource::new();
        timers.start();
        let (count, cb) = counter();

        let id = timers.every(Duration::from_millis(100), None, cb).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        timers.cancel(id);
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_can_cancel_itself() {
        let timers = TimerSource::new();
        timers.start();
        let count = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None::<TimerId>));

        let t = timers.clone();
        let c = count.clone();
        let own = own_id.clone();
        let id = timers
            .every(Duration::from_millis(100), None, move || {
                if c.fetch_add(1, Ordering::SeqCst) == 2 {
                    if let Some(id) = *own.lock().unwrap() {
                        t.cancel(id);
                    }
                }
            })
            .unwrap();
        *own_id.lock().unwrap() = Some(id);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!timers.is_scheduled(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callback_does_not_stop_source() {
        let timers = TimerSource::new();
        timers.start();
        let (count, cb) = counter();

        timers.after(Duration::from_millis(10), || panic!("boom"));
        timers.after(Duration::from_millis(20), cb);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let timers = TimerSource::new();
        assert!(matches!(
            timers.every(Duration::ZERO, None, || {}),
            Err(TimerError::ZeroInterval)
        ));
    }

    #[test]
    fn test_cancel_blocks_until_callback_finishes() {
        let timers = TimerSource::new();
        let started = Arc::new(std::sync::Barrier::new(2));
        let finished = Arc::new(AtomicBool::new(false));

        let s = started.clone();
        let f = finished.clone();
        let id = timers.at(Instant::now(), move || {
            s.wait();
            std::thread::sleep(Duration::from_millis(50));
            f.store(true, Ordering::SeqCst);
        });

        // drive the heap by hand on another thread, as the timer task would
        let inner = timers.inner.clone();
        let firing = std::thread::spawn(move || {
            inner.fire_due(Instant::now() + Duration::from_secs(1));
        });

        started.wait();
        timers.cancel(id);
        assert!(finished.load(Ordering::SeqCst));
        firing.join().unwrap();
    }
}
