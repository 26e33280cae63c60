use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::error::LinkError;

/// A deferred unit of work.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Shared timer and deferred-call scheduler.
///
/// All components of a stack must run their callbacks on the same scheduler;
/// that is what makes the engine single-threaded in practice and lets it get
/// away without any cross-component locking at suspension points. Tests
/// substitute a manually pumped implementation.
pub trait Scheduler: Send + Sync {
    /// Run a callback on the next pass of the loop.
    fn call_soon(&self, callback: Callback) -> TimerHandle;

    /// Run a callback after a delay.
    fn call_later(&self, delay: Duration, callback: Callback) -> TimerHandle;

    /// Monotonic time since the loop was created.
    fn time(&self) -> Duration;

    /// True once the loop has shut down and will run nothing further.
    fn is_closed(&self) -> bool;
}

/// Cancellation handle for a scheduled callback.
///
/// Cancelling after the callback has run is a no-op. Holders keep the handle
/// until the timer fires or they explicitly cancel it.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub(crate) fn new() -> Self {
        TimerHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

enum WorkerEvent {
    Run {
        at: Option<Instant>,
        callback: Callback,
        handle: TimerHandle,
    },
    Shutdown,
}

/// The production scheduler: one worker thread draining a timer heap, in the
/// style of a soundmodem worker loop.
pub struct ThreadedLoop {
    event_tx: Sender<WorkerEvent>,
    epoch: Instant,
    closed: Arc<AtomicBool>,
}

impl ThreadedLoop {
    pub fn new() -> Self {
        let (event_tx, event_rx) = channel();
        let closed = Arc::new(AtomicBool::new(false));
        spawn_loop_worker(event_rx, closed.clone());
        ThreadedLoop {
            event_tx,
            epoch: Instant::now(),
            closed,
        }
    }

    /// Shut the worker down. Anything still queued is dropped.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        let _ = self.event_tx.send(WorkerEvent::Shutdown);
    }
}

impl Default for ThreadedLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadedLoop {
    fn call_soon(&self, callback: Callback) -> TimerHandle {
        let handle = TimerHandle::new();
        let _ = self.event_tx.send(WorkerEvent::Run {
            at: None,
            callback,
            handle: handle.clone(),
        });
        handle
    }

    fn call_later(&self, delay: Duration, callback: Callback) -> TimerHandle {
        let handle = TimerHandle::new();
        let _ = self.event_tx.send(WorkerEvent::Run {
            at: Some(Instant::now() + delay),
            callback,
            handle: handle.clone(),
        });
        handle
    }

    fn time(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    callback: Callback,
    handle: TimerHandle,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Inverted so the BinaryHeap yields the earliest entry first, with
        // arrival order breaking ties.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn spawn_loop_worker(event_rx: Receiver<WorkerEvent>, closed: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let mut timers: BinaryHeap<TimerEntry> = BinaryHeap::new();
        let mut seq = 0u64;
        loop {
            let event = match timers.peek() {
                Some(entry) => {
                    let timeout = entry.at.saturating_duration_since(Instant::now());
                    match event_rx.recv_timeout(timeout) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match event_rx.recv() {
                    Ok(event) => Some(event),
                    Err(_) => break,
                },
            };
            match event {
                Some(WorkerEvent::Run {
                    at,
                    callback,
                    handle,
                }) => {
                    timers.push(TimerEntry {
                        at: at.unwrap_or_else(Instant::now),
                        seq,
                        callback,
                        handle,
                    });
                    seq += 1;
                }
                Some(WorkerEvent::Shutdown) => break,
                None => {}
            }
            while timers
                .peek()
                .is_some_and(|entry| entry.at <= Instant::now())
            {
                let entry = timers.pop().unwrap();
                if !entry.handle.is_cancelled() {
                    // One bad callback must not take the loop down with it
                    let run = std::panic::AssertUnwindSafe(entry.callback);
                    if std::panic::catch_unwind(run).is_err() {
                        error!("scheduled callback panicked");
                    }
                }
            }
        }
        closed.store(true, AtomicOrdering::SeqCst);
        debug!("event loop worker finished");
    });
}

static SHARED_LOOP: Mutex<Option<Arc<dyn Scheduler>>> = Mutex::new(None);

/// Fetch the process-wide loop, creating one if none exists (or if the
/// previous one has shut down).
pub fn shared_loop() -> Arc<dyn Scheduler> {
    let mut stored = SHARED_LOOP.lock().unwrap();
    match stored.as_ref() {
        Some(existing) if !existing.is_closed() => existing.clone(),
        _ => {
            let fresh: Arc<dyn Scheduler> = Arc::new(ThreadedLoop::new());
            *stored = Some(fresh.clone());
            fresh
        }
    }
}

/// Define the process-wide loop. Passing `None` is ignored, so constructors
/// can forward their optional loop argument unconditionally. Replacing an
/// existing, different loop is refused.
pub fn set_shared_loop(new_loop: Option<Arc<dyn Scheduler>>) -> Result<(), LinkError> {
    let Some(new_loop) = new_loop else {
        return Ok(());
    };
    let mut stored = SHARED_LOOP.lock().unwrap();
    match stored.as_ref() {
        Some(existing) if Arc::ptr_eq(existing, &new_loop) => Ok(()),
        Some(_) => Err(LinkError::LoopConflict),
        None => {
            *stored = Some(new_loop);
            Ok(())
        }
    }
}

/// Drop the process-wide loop so the next `shared_loop()` creates a fresh
/// one. Intended for tests.
pub fn clear_shared_loop() {
    *SHARED_LOOP.lock().unwrap() = None;
}

/// Resolve a constructor's optional loop argument.
pub(crate) fn resolve_loop(chosen: Option<Arc<dyn Scheduler>>) -> Arc<dyn Scheduler> {
    match chosen {
        Some(scheduler) => scheduler,
        None => shared_loop(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ManualLoop;
    use std::sync::mpsc::channel;

    // The gateway is process-wide state; serialise the tests that poke it.
    static GATEWAY_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn threaded_loop_runs_soon_in_order() {
        let scheduler = ThreadedLoop::new();
        let (tx, rx) = channel();
        for i in 0..3 {
            let tx = tx.clone();
            scheduler.call_soon(Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(2));
        scheduler.close();
    }

    #[test]
    fn threaded_loop_orders_timers() {
        let scheduler = ThreadedLoop::new();
        let (tx, rx) = channel();
        let late_tx = tx.clone();
        scheduler.call_later(
            Duration::from_millis(60),
            Box::new(move || {
                let _ = late_tx.send("late");
            }),
        );
        scheduler.call_later(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = tx.send("early");
            }),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok("early"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok("late"));
        scheduler.close();
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let scheduler = ThreadedLoop::new();
        let (tx, rx) = channel();
        let cancelled_tx = tx.clone();
        let handle = scheduler.call_later(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = cancelled_tx.send("cancelled");
            }),
        );
        handle.cancel();
        scheduler.call_later(
            Duration::from_millis(50),
            Box::new(move || {
                let _ = tx.send("kept");
            }),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok("kept"));
        scheduler.close();
    }

    #[test]
    fn gateway_creates_and_returns_one_loop() {
        let _guard = GATEWAY_LOCK.lock().unwrap();
        clear_shared_loop();
        let first = shared_loop();
        let second = shared_loop();
        assert!(Arc::ptr_eq(&first, &second));
        clear_shared_loop();
    }

    #[test]
    fn gateway_refuses_overwrite() {
        let _guard = GATEWAY_LOCK.lock().unwrap();
        clear_shared_loop();
        let injected: Arc<dyn Scheduler> = ManualLoop::new();
        set_shared_loop(Some(injected.clone())).unwrap();
        // Same loop again is a no-op, None is ignored
        set_shared_loop(Some(injected.clone())).unwrap();
        set_shared_loop(None).unwrap();
        let other: Arc<dyn Scheduler> = ManualLoop::new();
        assert_eq!(set_shared_loop(Some(other)), Err(LinkError::LoopConflict));
        assert!(Arc::ptr_eq(&shared_loop(), &injected));
        clear_shared_loop();
    }

    #[test]
    fn gateway_replaces_closed_loop() {
        let _guard = GATEWAY_LOCK.lock().unwrap();
        clear_shared_loop();
        let first = shared_loop();
        let threaded = ThreadedLoop::new();
        threaded.close();
        // Wait for the worker to acknowledge the shutdown
        while !threaded.is_closed() {
            std::thread::yield_now();
        }
        clear_shared_loop();
        set_shared_loop(Some(Arc::new(threaded))).unwrap();
        let replacement = shared_loop();
        assert!(!Arc::ptr_eq(&first, &replacement));
        assert!(!replacement.is_closed());
        clear_shared_loop();
    }
}
