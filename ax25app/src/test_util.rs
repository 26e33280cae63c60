use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::TransportError;
use crate::event_loop::{Callback, Scheduler, TimerHandle};
use crate::kiss::{DeviceState, KissDevice, KissDeviceRef, KissTransport};

/// A scheduler pumped by hand, so tests control time and interleaving.
pub(crate) struct ManualLoop {
    state: Mutex<ManualState>,
}

struct ManualState {
    now: Duration,
    seq: u64,
    queue: Vec<ManualEntry>,
}

struct ManualEntry {
    at: Duration,
    seq: u64,
    callback: Option<Callback>,
    handle: TimerHandle,
}

impl ManualLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualLoop {
            state: Mutex::new(ManualState {
                now: Duration::ZERO,
                seq: 0,
                queue: Vec::new(),
            }),
        })
    }

    /// Number of live (not cancelled) scheduled calls.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .queue
            .iter()
            .filter(|entry| !entry.handle.is_cancelled())
            .count()
    }

    /// Delay until the earliest live scheduled call.
    pub fn next_delay(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        state
            .queue
            .iter()
            .filter(|entry| !entry.handle.is_cancelled())
            .map(|entry| entry.at.saturating_sub(state.now))
            .min()
    }

    /// Run everything due at the current time, including calls those
    /// callbacks schedule for "now". Returns how many callbacks ran.
    pub fn run_due(&self) -> usize {
        let mut ran = 0;
        loop {
            let callback = {
                let mut state = self.state.lock().unwrap();
                let now = state.now;
                let due = state
                    .queue
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.at <= now)
                    .min_by_key(|(_, entry)| (entry.at, entry.seq))
                    .map(|(idx, _)| idx);
                match due {
                    Some(idx) => {
                        let mut entry = state.queue.remove(idx);
                        if entry.handle.is_cancelled() {
                            continue;
                        }
                        entry.callback.take()
                    }
                    None => break,
                }
            };
            if let Some(callback) = callback {
                callback();
                ran += 1;
            }
        }
        ran
    }

    /// Move the clock forward and run everything that becomes due.
    pub fn advance(&self, delta: Duration) -> usize {
        self.state.lock().unwrap().now += delta;
        self.run_due()
    }

    fn push(&self, delay: Duration, callback: Callback) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.state.lock().unwrap();
        let at = state.now + delay;
        let seq = state.seq;
        state.seq += 1;
        state.queue.push(ManualEntry {
            at,
            seq,
            callback: Some(callback),
            handle: handle.clone(),
        });
        handle
    }
}

impl Scheduler for ManualLoop {
    fn call_soon(&self, callback: Callback) -> TimerHandle {
        self.push(Duration::ZERO, callback)
    }

    fn call_later(&self, delay: Duration, callback: Callback) -> TimerHandle {
        self.push(delay, callback)
    }

    fn time(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    fn is_closed(&self) -> bool {
        false
    }
}

/// Run all immediately-due work on a manual loop.
pub(crate) fn pump(scheduler: &ManualLoop) {
    scheduler.run_due();
}

/// Shared view of everything a `MemoryTransport` was asked to do.
#[derive(Clone, Default)]
pub(crate) struct TransportLog {
    transmitted: Arc<Mutex<Vec<u8>>>,
    open_calls: Arc<AtomicUsize>,
    close_calls: Arc<AtomicUsize>,
}

impl TransportLog {
    pub fn transmitted(&self) -> Vec<u8> {
        self.transmitted.lock().unwrap().clone()
    }

    pub fn take_transmitted(&self) -> Vec<u8> {
        std::mem::take(&mut self.transmitted.lock().unwrap())
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

/// In-memory stand-in for a TNC. Records raw writes; optionally fails on
/// command, or whenever a written chunk contains the poison byte.
pub(crate) struct MemoryTransport {
    log: TransportLog,
    pub fail_open: bool,
    pub fail_close: bool,
    pub fail_send: bool,
    pub poison: Option<u8>,
}

impl MemoryTransport {
    pub fn new(log: TransportLog) -> Self {
        MemoryTransport {
            log,
            fail_open: false,
            fail_close: false,
            fail_send: false,
            poison: None,
        }
    }
}

impl KissTransport for MemoryTransport {
    fn open(&mut self, _device: KissDeviceRef) -> Result<(), TransportError> {
        self.log.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(io::Error::other("open fails").into());
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.log.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(io::Error::other("close fails").into());
        }
        Ok(())
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.log.transmitted.lock().unwrap().extend_from_slice(data);
        if self.fail_send {
            return Err(io::Error::other("send fails").into());
        }
        if self.poison.is_some_and(|b| data.contains(&b)) {
            return Err(io::Error::other("send fails").into());
        }
        Ok(())
    }
}

/// Walk a freshly created device through its open sequence by acknowledging
/// each init command, leaving it in the `Open` state.
pub(crate) fn open_device(device: &KissDevice, scheduler: &ManualLoop) {
    device.open(None).unwrap();
    pump(scheduler);
    while device.state() == DeviceState::Opening {
        device.receive(b"ok\r");
        pump(scheduler);
    }
}
