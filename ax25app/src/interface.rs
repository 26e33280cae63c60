use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use log::{debug, error, info};

use ax25core::address::Callsign;
use ax25core::frame::Ax25Frame;

use crate::error::LinkError;
use crate::event_loop::{resolve_loop, Scheduler, TimerHandle};
use crate::future::{completion_ready, ensure_completion, Completion};
use crate::kiss::KissPort;
use crate::router::{FrameHandler, Router};

/// Legacy notification style: called once with the outcome of a transmit.
pub type TxCallback = Arc<dyn Fn(&Interface, &Ax25Frame, Option<LinkError>) + Send + Sync + 'static>;

pub struct InterfaceConfig {
    /// Base clear-to-send guard observed after any received activity.
    pub cts_delay: Duration,
    /// Upper bound of the random jitter added to the guard.
    pub cts_rand: Duration,
    /// Mint a completion for every transmit that was not given one.
    pub return_future: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig {
            cts_delay: Duration::from_millis(10),
            cts_rand: Duration::from_millis(10),
            return_future: false,
        }
    }
}

struct InterfaceInner {
    port: KissPort,
    router: Router,
    tx_queue: VecDeque<(Arc<Ax25Frame>, Option<Completion>)>,
    /// The one pending TX timer, armed whenever traffic is waiting.
    tx_pending: Option<TimerHandle>,
    /// Monotonic instant before which we must not transmit. Never decreases.
    cts_expiry: Duration,
    cts_delay: Duration,
    cts_rand: Duration,
    return_future: bool,
}

struct InterfaceShared {
    inner: Mutex<InterfaceInner>,
    scheduler: Arc<dyn Scheduler>,
}

/// A logical AX.25 interface above one KISS port.
///
/// Queues outgoing frames and releases one per clear-to-send window: a
/// short randomised guard that restarts on every received frame, so the
/// node avoids transmitting on top of a station it can hear. Inbound frames
/// are routed to bound receivers by destination address.
#[derive(Clone)]
pub struct Interface {
    shared: Arc<InterfaceShared>,
}

impl Interface {
    pub fn new(
        port: KissPort,
        config: InterfaceConfig,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Self {
        let scheduler = resolve_loop(scheduler);
        let cts_expiry = scheduler.time() + config.cts_delay + jitter(config.cts_rand);
        let shared = Arc::new(InterfaceShared {
            inner: Mutex::new(InterfaceInner {
                port: port.clone(),
                router: Router::default(),
                tx_queue: VecDeque::new(),
                tx_pending: None,
                cts_expiry,
                cts_delay: config.cts_delay,
                cts_rand: config.cts_rand,
                return_future: config.return_future,
            }),
            scheduler,
        });
        let weak = Arc::downgrade(&shared);
        port.received().connect(move |payload: &Vec<u8>| {
            if let Some(shared) = weak.upgrade() {
                Interface { shared }.on_receive_payload(payload);
            }
        });
        Interface { shared }
    }

    /// Bind a receiver for frames addressed to a callsign. `None` for the
    /// SSID makes it a wildcard over all SSIDs of that callsign.
    pub fn bind(&self, callsign: Callsign, ssid: Option<u8>, handler: FrameHandler) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.router.bind(callsign, ssid, handler);
    }

    pub fn unbind(&self, callsign: Callsign, ssid: Option<u8>) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.router.unbind(callsign, ssid);
    }

    /// Receiver for frames no bound route wanted.
    pub fn set_default_handler(&self, handler: Option<FrameHandler>) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.router.set_default_handler(handler);
    }

    /// Enqueue a frame for transmission.
    ///
    /// At most one of `callback` and `completion` may be given; the returned
    /// completion (if any) settles exactly once - success, cancelled,
    /// expired, or the transport's failure. To be able to cancel later, pass
    /// an `Arc<Ax25Frame>` and keep a clone of it.
    pub fn transmit(
        &self,
        frame: impl Into<Arc<Ax25Frame>>,
        callback: Option<TxCallback>,
        completion: Option<Completion>,
    ) -> Result<Option<Completion>, LinkError> {
        let frame = frame.into();
        let mut inner = self.shared.inner.lock().unwrap();
        let completion = match (callback, completion) {
            (Some(_), Some(_)) => return Err(LinkError::CallbackConflict),
            (Some(callback), None) => Some(self.bridge_callback(callback, &frame)),
            (None, completion) => ensure_completion(completion, inner.return_future),
        };
        debug!("adding to queue: {frame:?}");
        inner.tx_queue.push_back((frame, completion.clone()));
        if inner.tx_pending.is_none() {
            self.schedule_tx(&mut inner);
        }
        Ok(completion)
    }

    /// Withdraw a frame that has not yet gone to the port. Its completion,
    /// if still open, fails as cancelled. No-op if the frame is not queued.
    ///
    /// Matches the queue entry holding this same allocation, so a
    /// structurally identical frame queued separately is left alone.
    pub fn cancel_transmit(&self, frame: &Arc<Ax25Frame>) {
        let mut inner = self.shared.inner.lock().unwrap();
        debug!("removing from queue: {frame:?}");
        let Some(idx) = inner
            .tx_queue
            .iter()
            .position(|(queued, _)| Arc::ptr_eq(queued, frame))
        else {
            debug!("frame not found in queue");
            return;
        };
        let (_, completion) = inner.tx_queue.remove(idx).unwrap();
        drop(inner);
        if completion_ready(completion.as_ref()) {
            debug!("notifying caller of cancellation");
            completion.unwrap().fail(LinkError::Cancelled);
        }
    }

    /// Restart the clear-to-send guard after received activity.
    fn reset_cts(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        let now = self.shared.scheduler.time();
        let mut cts_expiry = now + inner.cts_delay + jitter(inner.cts_rand);
        if inner.cts_rand > Duration::ZERO {
            while cts_expiry < inner.cts_expiry {
                cts_expiry += jitter(inner.cts_rand);
            }
        } else if cts_expiry < inner.cts_expiry {
            cts_expiry = inner.cts_expiry;
        }
        inner.cts_expiry = cts_expiry;
        debug!("clear-to-send expiry at {cts_expiry:?}");
        if inner.tx_pending.is_some() {
            // We were waiting for a clear-to-send, so re-schedule.
            self.schedule_tx(&mut inner);
        }
    }

    fn on_receive_payload(&self, payload: &[u8]) {
        match Ax25Frame::decode(payload) {
            Ok(frame) => self.on_receive(&frame),
            Err(e) => debug!("dropping undecodable frame: {e:?}"),
        }
    }

    fn on_receive(&self, frame: &Ax25Frame) {
        self.reset_cts();
        let handler = {
            let inner = self.shared.inner.lock().unwrap();
            inner.router.lookup(&frame.header.destination)
        };
        match handler {
            Some(handler) => handler(frame),
            None => debug!("no route for {}", frame.header.destination),
        }
    }

    /// Arm the TX timer for the current CTS expiry, replacing any armed one.
    fn schedule_tx(&self, inner: &mut InterfaceInner) {
        if let Some(pending) = inner.tx_pending.take() {
            pending.cancel();
        }
        let interface = self.clone();
        let callback = Box::new(move || interface.tx_next());
        let now = self.shared.scheduler.time();
        inner.tx_pending = Some(if inner.cts_expiry > now {
            let delay = inner.cts_expiry - now;
            debug!("scheduling next transmission in {delay:?}");
            self.shared.scheduler.call_later(delay, callback)
        } else {
            debug!("scheduling next transmission ASAP");
            self.shared.scheduler.call_soon(callback)
        });
    }

    /// The TX timer fired: release the head of the queue to the port.
    fn tx_next(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.tx_pending = None;
        let Some((frame, caller)) = inner.tx_queue.pop_front() else {
            debug!("no traffic to transmit");
            return;
        };
        if let Some(deadline) = frame.deadline {
            if deadline < SystemTime::now() {
                info!("dropping expired frame: {frame:?}");
                self.schedule_tx(&mut inner);
                drop(inner);
                if completion_ready(caller.as_ref()) {
                    debug!("notifying caller of expiry");
                    caller.unwrap().fail(LinkError::Expired);
                }
                return;
            }
        }
        let port = inner.port.clone();
        drop(inner);

        let tx_future = Completion::new();
        let weak = Arc::downgrade(&self.shared);
        let sent_frame = frame.clone();
        tx_future.on_done(move |result| {
            if let Some(shared) = weak.upgrade() {
                Interface { shared }.on_tx_done(&sent_frame, caller, result);
            }
        });

        debug!("transmitting {frame:?}");
        if let Err(e) = port.send(&frame.encode(), Some(tx_future.clone())) {
            debug!("synchronous transmit failure for {frame:?}");
            tx_future.fail(e);
        }
    }

    /// The port settled the in-flight frame: forward the outcome, restart
    /// the CTS guard, and line up the next transmission.
    fn on_tx_done(
        &self,
        frame: &Ax25Frame,
        caller: Option<Completion>,
        result: Result<(), LinkError>,
    ) {
        match result {
            Err(error) => {
                error!("failed to transmit frame {frame:?}: {error}");
                if completion_ready(caller.as_ref()) {
                    caller.unwrap().fail(error);
                }
            }
            Ok(()) => {
                debug!("transmitted frame: {frame:?}");
                if completion_ready(caller.as_ref()) {
                    caller.unwrap().resolve();
                }
            }
        }
        self.reset_cts();
        let mut inner = self.shared.inner.lock().unwrap();
        if !inner.tx_queue.is_empty() {
            self.schedule_tx(&mut inner);
        }
    }

    fn bridge_callback(&self, callback: TxCallback, frame: &Arc<Ax25Frame>) -> Completion {
        let completion = Completion::new();
        let weak = Arc::downgrade(&self.shared);
        let frame = frame.clone();
        completion.on_done(move |result| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let interface = Interface { shared };
            let scheduler = interface.shared.scheduler.clone();
            scheduler.call_soon(Box::new(move || {
                callback(&interface, &frame, result.err());
            }));
        });
        completion
    }
}

fn jitter(range: Duration) -> Duration {
    range.mul_f64(rand::random::<f64>())
}
