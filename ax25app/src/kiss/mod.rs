use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, warn};

use ax25core::kiss::{KissFrame, FEND, RETURN_FROM_KISS};

use crate::error::{DeviceAction, DeviceFailure, LinkError, TransportError};
use crate::event_loop::{resolve_loop, Scheduler, TimerHandle};
use crate::future::{ensure_completion, Completion, CompletionQueue};
use crate::signal::Signal;

mod port;
pub mod serial;
pub mod tcp;

pub use port::KissPort;

/// KISS devices multiplex up to 16 logical ports.
pub const MAX_PORTS: u8 = 16;

/// Lifecycle of a KISS device.
///
/// Transitions only ever move forward through this graph; the one way back
/// out of `Failed` is an explicit `reset()`.
///
/// ```text
/// CLOSED --open-->   OPENING --init OK-->  OPEN
///                       |                    |
///                       +-- init fail ----> FAILED
/// OPEN   --close--> CLOSING --drain done--> CLOSED
/// any    --io fail--> FAILED --reset--> CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Opening,
    Open,
    Closing,
    Failed,
}

/// Byte-level access to a TNC.
///
/// Implementations deliver received bytes by calling `receive` on the
/// `KissDeviceRef` given to `open`, from a thread of their own or from a
/// loop callback - never synchronously inside `open` itself.
pub trait KissTransport: Send + 'static {
    fn open(&mut self, device: KissDeviceRef) -> Result<(), TransportError>;
    fn close(&mut self) -> Result<(), TransportError>;
    fn send_raw(&mut self, data: &[u8]) -> Result<(), TransportError>;
}

pub struct DeviceConfig {
    /// Commands sent, CR-terminated, to put the TNC into KISS mode.
    pub kiss_commands: Vec<String>,
    /// Largest chunk handed to the transport per drain step. 0 is unlimited.
    pub send_block_size: usize,
    /// Pause between consecutive chunks of the same frame.
    pub send_block_delay: Duration,
    /// Send the "return from KISS" byte before closing the transport.
    pub reset_on_close: bool,
    /// Mint a completion for every operation that was not given one.
    pub return_future: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            kiss_commands: vec!["INT KISS".to_owned(), "RESET".to_owned()],
            send_block_size: 128,
            send_block_delay: Duration::from_millis(100),
            reset_on_close: true,
            return_future: false,
        }
    }
}

struct TxEntry {
    bytes: Vec<u8>,
    completion: Option<Completion>,
    /// Wrap in FEND delimiters when drained. The "return from KISS" byte is
    /// the one frame sent naked.
    framed: bool,
}

struct DeviceInner {
    state: DeviceState,
    transport: Box<dyn KissTransport>,
    rx_buffer: Vec<u8>,
    tx_buffer: Vec<u8>,
    tx_queue: VecDeque<TxEntry>,
    /// Completion of the frame currently occupying `tx_buffer`.
    tx_future: Option<Completion>,
    /// The one scheduled drain step, if any.
    tx_sched: Option<TimerHandle>,
    ports: Vec<Option<KissPort>>,
    open_queue: CompletionQueue,
    close_queue: CompletionQueue,
    kiss_commands: Vec<String>,
    kiss_rem_commands: VecDeque<String>,
    send_block_size: usize,
    send_block_delay: Duration,
    reset_on_close: bool,
    return_future: bool,
}

struct DeviceShared {
    inner: Mutex<DeviceInner>,
    failed: Signal<DeviceFailure>,
    scheduler: Arc<dyn Scheduler>,
}

/// A TNC speaking KISS, multiplexing up to 16 logical radio ports.
///
/// The device owns its transport and its ports. All deferred work (RX
/// parsing, TX draining, init sequencing) runs on the loop, one step at a
/// time.
#[derive(Clone)]
pub struct KissDevice {
    shared: Arc<DeviceShared>,
}

/// Non-owning handle to a device, held by transports and ports.
#[derive(Clone)]
pub struct KissDeviceRef {
    shared: Weak<DeviceShared>,
}

impl KissDevice {
    pub fn new(
        transport: Box<dyn KissTransport>,
        config: DeviceConfig,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Self {
        KissDevice {
            shared: Arc::new(DeviceShared {
                inner: Mutex::new(DeviceInner {
                    state: DeviceState::Closed,
                    transport,
                    rx_buffer: Vec::new(),
                    tx_buffer: Vec::new(),
                    tx_queue: VecDeque::new(),
                    tx_future: None,
                    tx_sched: None,
                    ports: (0..MAX_PORTS).map(|_| None).collect(),
                    open_queue: CompletionQueue::default(),
                    close_queue: CompletionQueue::default(),
                    kiss_rem_commands: VecDeque::new(),
                    kiss_commands: config.kiss_commands,
                    send_block_size: config.send_block_size,
                    send_block_delay: config.send_block_delay,
                    reset_on_close: config.reset_on_close,
                    return_future: config.return_future,
                }),
                failed: Signal::new(),
                scheduler: resolve_loop(scheduler),
            }),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.shared.inner.lock().unwrap().state
    }

    /// Emitted whenever a transport operation fails and the device enters
    /// the `Failed` state.
    pub fn failed(&self) -> &Signal<DeviceFailure> {
        &self.shared.failed
    }

    pub fn downgrade(&self) -> KissDeviceRef {
        KissDeviceRef {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// The port handle for one logical radio port, created on first use.
    pub fn port(&self, port: u8) -> Result<KissPort, LinkError> {
        if port >= MAX_PORTS {
            return Err(LinkError::PortOutOfRange(port));
        }
        let mut inner = self.shared.inner.lock().unwrap();
        let slot = &mut inner.ports[port as usize];
        if slot.is_none() {
            *slot = Some(KissPort::new(self.downgrade(), port));
        }
        Ok(slot.as_ref().unwrap().clone())
    }

    /// Open the transport and begin the KISS initialisation sequence.
    ///
    /// From any state other than `Closed`/`Failed` this only queues the
    /// completion, which settles when the in-progress open finishes.
    pub fn open(&self, completion: Option<Completion>) -> Result<Option<Completion>, LinkError> {
        let mut inner = self.shared.inner.lock().unwrap();
        let completion = ensure_completion(completion, inner.return_future);
        match inner.state {
            DeviceState::Closed | DeviceState::Failed => {
                if let Some(c) = &completion {
                    inner.open_queue.push(c.clone());
                }
                match inner.transport.open(self.downgrade()) {
                    Ok(()) => {
                        inner.state = DeviceState::Opening;
                        let device = self.clone();
                        self.shared
                            .scheduler
                            .call_soon(Box::new(move || device.init_kiss()));
                        Ok(completion)
                    }
                    Err(e) => {
                        let error = LinkError::transport(DeviceAction::Open, e);
                        inner.state = DeviceState::Failed;
                        let mut open_queue = std::mem::take(&mut inner.open_queue);
                        drop(inner);
                        open_queue.fail_all(error.clone());
                        self.shared.failed.emit(&DeviceFailure {
                            action: DeviceAction::Open,
                            error: error.clone(),
                        });
                        Err(error)
                    }
                }
            }
            _ => {
                if let Some(c) = &completion {
                    inner.open_queue.push(c.clone());
                }
                Ok(completion)
            }
        }
    }

    /// Close the device, draining queued transmissions first.
    ///
    /// With `reset_on_close` the "return from KISS" byte is queued ahead of
    /// the close. The completion settles once the transport has closed.
    pub fn close(&self, completion: Option<Completion>) -> Result<Option<Completion>, LinkError> {
        let mut inner = self.shared.inner.lock().unwrap();
        let completion = ensure_completion(completion, inner.return_future);
        match inner.state {
            DeviceState::Open => {
                if let Some(c) = &completion {
                    inner.close_queue.push(c.clone());
                }
                inner.state = DeviceState::Closing;
                if inner.reset_on_close {
                    inner.tx_queue.push_back(TxEntry {
                        bytes: vec![RETURN_FROM_KISS],
                        completion: None,
                        framed: false,
                    });
                    self.schedule_send_data(&mut inner, None);
                } else if inner.tx_buffer.is_empty() && inner.tx_queue.is_empty() {
                    return match finish_close(&mut inner) {
                        Ok(mut close_queue) => {
                            drop(inner);
                            close_queue.resolve_all();
                            Ok(completion)
                        }
                        Err((mut close_queue, error)) => {
                            drop(inner);
                            close_queue.fail_all(error.clone());
                            self.shared.failed.emit(&DeviceFailure {
                                action: DeviceAction::Close,
                                error: error.clone(),
                            });
                            Err(error)
                        }
                    };
                }
                Ok(completion)
            }
            DeviceState::Closing => {
                if let Some(c) = &completion {
                    inner.close_queue.push(c.clone());
                }
                Ok(completion)
            }
            DeviceState::Closed => {
                drop(inner);
                if let Some(c) = &completion {
                    c.resolve();
                }
                Ok(completion)
            }
            state => {
                warn!("close() ignored in state {state:?}");
                Ok(completion)
            }
        }
    }

    /// Recover a `Failed` device back to `Closed`. Anything still pending is
    /// failed with a reset error. No-op in any other state.
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state != DeviceState::Failed {
            return;
        }
        inner.state = DeviceState::Closed;
        inner.rx_buffer.clear();
        inner.tx_buffer.clear();
        inner.kiss_rem_commands.clear();
        let entries: Vec<TxEntry> = inner.tx_queue.drain(..).collect();
        let tx_future = inner.tx_future.take();
        let mut open_queue = std::mem::take(&mut inner.open_queue);
        let mut close_queue = std::mem::take(&mut inner.close_queue);
        drop(inner);
        for entry in entries {
            if let Some(completion) = entry.completion {
                completion.fail(LinkError::DeviceReset);
            }
        }
        if let Some(completion) = tx_future {
            completion.fail(LinkError::DeviceReset);
        }
        open_queue.fail_all(LinkError::DeviceReset);
        close_queue.fail_all(LinkError::DeviceReset);
    }

    /// Transport delivers received bytes here. Parsing happens on the loop.
    pub fn receive(&self, data: &[u8]) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.rx_buffer.extend_from_slice(data);
        let opening = inner.state == DeviceState::Opening;
        drop(inner);
        let device = self.clone();
        if opening {
            self.shared
                .scheduler
                .call_soon(Box::new(move || device.check_open()));
        } else {
            self.shared
                .scheduler
                .call_soon(Box::new(move || device.receive_frame()));
        }
    }

    /// Queue a frame for transmission and kick the drain.
    pub(crate) fn send_frame(
        &self,
        frame: &KissFrame,
        completion: Option<Completion>,
    ) -> Option<Completion> {
        let mut inner = self.shared.inner.lock().unwrap();
        let completion = ensure_completion(completion, inner.return_future);
        inner.tx_queue.push_back(TxEntry {
            bytes: frame.to_raw(),
            completion: completion.clone(),
            framed: true,
        });
        self.schedule_send_data(&mut inner, None);
        completion
    }

    /// First step of the init sequence: send the first KISS command and keep
    /// the tail for `send_kiss_cmd` to work through.
    fn init_kiss(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state != DeviceState::Opening {
            return;
        }
        let remaining: VecDeque<String> = inner.kiss_commands.iter().skip(1).cloned().collect();
        inner.kiss_rem_commands = remaining;
        match inner.kiss_commands.first().cloned() {
            Some(command) => self.send_kiss_command(inner, &command),
            None => self.open_finished(inner),
        }
    }

    /// RX activity while opening; the TNC has reacted to the last command,
    /// so move the sequence along.
    fn check_open(&self) {
        let device = self.clone();
        self.shared
            .scheduler
            .call_soon(Box::new(move || device.send_kiss_cmd()));
    }

    /// Send the next queued init command, or declare the device open once
    /// they are all out.
    fn send_kiss_cmd(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state != DeviceState::Opening {
            return;
        }
        match inner.kiss_rem_commands.pop_front() {
            Some(command) => self.send_kiss_command(inner, &command),
            None => self.open_finished(inner),
        }
    }

    fn send_kiss_command(
        &self,
        mut inner: std::sync::MutexGuard<'_, DeviceInner>,
        command: &str,
    ) {
        debug!("sending KISS init command {command:?}");
        let mut bytes = command.as_bytes().to_vec();
        bytes.push(b'\r');
        if let Err(e) = inner.transport.send_raw(&bytes) {
            let error = LinkError::transport(DeviceAction::Open, e);
            inner.state = DeviceState::Failed;
            let mut open_queue = std::mem::take(&mut inner.open_queue);
            drop(inner);
            open_queue.fail_all(error.clone());
            self.shared.failed.emit(&DeviceFailure {
                action: DeviceAction::Open,
                error: error.clone(),
            });
            error!("KISS init failed: {error}");
        }
    }

    fn open_finished(&self, mut inner: std::sync::MutexGuard<'_, DeviceInner>) {
        inner.rx_buffer.clear();
        inner.state = DeviceState::Open;
        let mut open_queue = std::mem::take(&mut inner.open_queue);
        drop(inner);
        debug!("KISS device is open");
        open_queue.resolve_all();
    }

    /// One parse pass over the RX buffer: take the span between the first
    /// two FENDs as a frame and hand it off. Afterwards the buffer is either
    /// empty or starts with the FEND that opens the next frame.
    fn receive_frame(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        let Some(start) = inner.rx_buffer.iter().position(|b| *b == FEND) else {
            // No frame delimiter anywhere; all garbage.
            inner.rx_buffer.clear();
            return;
        };
        inner.rx_buffer.drain(..start);
        let Some(len) = inner.rx_buffer[1..].iter().position(|b| *b == FEND) else {
            // A frame has started but not yet finished.
            return;
        };
        let raw: Vec<u8> = inner.rx_buffer.drain(..len + 1).skip(1).collect();
        let more = inner.rx_buffer.len() > 1;
        drop(inner);
        if let Some(frame) = KissFrame::from_raw(&raw) {
            let device = self.clone();
            self.shared
                .scheduler
                .call_soon(Box::new(move || device.dispatch_rx_frame(frame)));
        }
        if more {
            let device = self.clone();
            self.shared
                .scheduler
                .call_soon(Box::new(move || device.receive_frame()));
        }
    }

    /// Hand a parsed frame to its port, or drop it if the port was never
    /// asked for. A panicking port handler only costs the one frame, never
    /// the device.
    fn dispatch_rx_frame(&self, frame: KissFrame) {
        let port = {
            let inner = self.shared.inner.lock().unwrap();
            inner.ports[frame.port as usize].clone()
        };
        match port {
            Some(port) => {
                if catch_unwind(AssertUnwindSafe(|| port.deliver(&frame))).is_err() {
                    warn!("handler for port {} panicked; frame dropped", frame.port);
                }
            }
            None => debug!("dropping frame for undefined port {}", frame.port),
        }
    }

    fn schedule_send_data(&self, inner: &mut DeviceInner, delay: Option<Duration>) {
        if inner.tx_sched.is_some() {
            return;
        }
        let device = self.clone();
        let callback = Box::new(move || device.send_data());
        inner.tx_sched = Some(match delay {
            Some(delay) => self.shared.scheduler.call_later(delay, callback),
            None => self.shared.scheduler.call_soon(callback),
        });
    }

    /// One drain step: load the next frame into the TX buffer if it is
    /// empty, push one block out of the transport, then either schedule the
    /// next step or finish a pending close.
    fn send_data(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.tx_sched = None;
        if matches!(inner.state, DeviceState::Closed | DeviceState::Failed) {
            return;
        }
        if inner.tx_buffer.is_empty() {
            if let Some(entry) = inner.tx_queue.pop_front() {
                if entry.framed {
                    inner.tx_buffer.push(FEND);
                    inner.tx_buffer.extend_from_slice(&entry.bytes);
                    inner.tx_buffer.push(FEND);
                } else {
                    inner.tx_buffer.extend_from_slice(&entry.bytes);
                }
                inner.tx_future = entry.completion;
            }
        }
        let mut finished: Option<Completion> = None;
        if !inner.tx_buffer.is_empty() {
            let block = match inner.send_block_size {
                0 => inner.tx_buffer.len(),
                limit => limit.min(inner.tx_buffer.len()),
            };
            let chunk: Vec<u8> = inner.tx_buffer[..block].to_vec();
            if let Err(e) = inner.transport.send_raw(&chunk) {
                let error = LinkError::transport(DeviceAction::Send, e);
                inner.state = DeviceState::Failed;
                let tx_future = inner.tx_future.take();
                drop(inner);
                if let Some(completion) = tx_future {
                    completion.fail(error.clone());
                }
                self.shared.failed.emit(&DeviceFailure {
                    action: DeviceAction::Send,
                    error: error.clone(),
                });
                error!("KISS send failed: {error}");
                return;
            }
            match mark_sent(&mut inner, &chunk) {
                Ok(done) => finished = done,
                Err(error) => {
                    let tx_future = inner.tx_future.take();
                    drop(inner);
                    if let Some(completion) = tx_future {
                        completion.fail(error.clone());
                    }
                    error!("KISS drain state error: {error}");
                    return;
                }
            }
        }
        if !inner.tx_buffer.is_empty() {
            let delay = inner.send_block_delay;
            self.schedule_send_data(&mut inner, Some(delay));
        } else if !inner.tx_queue.is_empty() {
            self.schedule_send_data(&mut inner, None);
        } else if inner.state == DeviceState::Closing {
            match finish_close(&mut inner) {
                Ok(mut close_queue) => {
                    drop(inner);
                    close_queue.resolve_all();
                    if let Some(completion) = finished {
                        completion.resolve();
                    }
                    return;
                }
                Err((mut close_queue, error)) => {
                    drop(inner);
                    close_queue.fail_all(error.clone());
                    self.shared.failed.emit(&DeviceFailure {
                        action: DeviceAction::Close,
                        error: error.clone(),
                    });
                    error!("KISS close failed: {error}");
                    if let Some(completion) = finished {
                        completion.resolve();
                    }
                    return;
                }
            }
        }
        drop(inner);
        if let Some(completion) = finished {
            completion.resolve();
        }
    }
}

impl KissDeviceRef {
    pub fn upgrade(&self) -> Option<KissDevice> {
        self.shared
            .upgrade()
            .map(|shared| KissDevice { shared })
    }

    /// Deliver received bytes. Returns false once the device is gone, which
    /// a transport reader should take as its cue to stop.
    pub fn receive(&self, data: &[u8]) -> bool {
        match self.upgrade() {
            Some(device) => {
                device.receive(data);
                true
            }
            None => false,
        }
    }
}

/// Account for a sent chunk: it must still be the prefix of the TX buffer.
/// Returns the frame's completion once the chunk finishes the frame.
fn mark_sent(inner: &mut DeviceInner, chunk: &[u8]) -> Result<Option<Completion>, LinkError> {
    if !inner.tx_buffer.starts_with(chunk) {
        return Err(LinkError::BufferMismatch);
    }
    inner.tx_buffer.drain(..chunk.len());
    if inner.tx_buffer.is_empty() {
        Ok(inner.tx_future.take())
    } else {
        Ok(None)
    }
}

/// The deferred tail of `close()`: shut the transport and settle the close
/// queue. Only called once all TX is drained.
fn finish_close(
    inner: &mut DeviceInner,
) -> Result<CompletionQueue, (CompletionQueue, LinkError)> {
    match inner.transport.close() {
        Ok(()) => {
            inner.state = DeviceState::Closed;
            Ok(std::mem::take(&mut inner.close_queue))
        }
        Err(e) => {
            let error = LinkError::transport(DeviceAction::Close, e);
            inner.state = DeviceState::Failed;
            Err((std::mem::take(&mut inner.close_queue), error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{open_device, pump, ManualLoop, MemoryTransport, TransportLog};

    fn build(
        config: DeviceConfig,
        adjust: impl FnOnce(&mut MemoryTransport),
    ) -> (Arc<ManualLoop>, TransportLog, KissDevice) {
        let scheduler = ManualLoop::new();
        let log = TransportLog::default();
        let mut transport = MemoryTransport::new(log.clone());
        adjust(&mut transport);
        let device = KissDevice::new(
            Box::new(transport),
            config,
            Some(scheduler.clone() as Arc<dyn Scheduler>),
        );
        (scheduler, log, device)
    }

    fn quiet_config() -> DeviceConfig {
        DeviceConfig {
            kiss_commands: vec![],
            send_block_size: 0,
            reset_on_close: false,
            ..DeviceConfig::default()
        }
    }

    fn failures(device: &KissDevice) -> Arc<Mutex<Vec<DeviceFailure>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        device.failed().connect(move |failure: &DeviceFailure| {
            sink.lock().unwrap().push(failure.clone());
        });
        seen
    }

    fn record_port(device: &KissDevice, port: u8) -> Arc<Mutex<Vec<Vec<u8>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        device
            .port(port)
            .unwrap()
            .received()
            .connect(move |payload: &Vec<u8>| {
                sink.lock().unwrap().push(payload.clone());
            });
        seen
    }

    fn set_rx_buffer(device: &KissDevice, data: &[u8]) {
        device.shared.inner.lock().unwrap().rx_buffer = data.to_vec();
    }

    fn rx_buffer(device: &KissDevice) -> Vec<u8> {
        device.shared.inner.lock().unwrap().rx_buffer.clone()
    }

    #[test]
    fn open_walks_the_init_sequence() {
        let (scheduler, log, device) = build(
            DeviceConfig {
                kiss_commands: vec!["INT KISS".to_owned(), "RESET".to_owned()],
                reset_on_close: false,
                ..DeviceConfig::default()
            },
            |_| {},
        );
        let fails = failures(&device);
        device.open(None).unwrap();
        assert_eq!(log.open_calls(), 1);
        assert_eq!(device.state(), DeviceState::Opening);

        // A second open while opening just queues its completion
        let queued = Completion::new();
        device.open(Some(queued.clone())).unwrap();
        assert_eq!(log.open_calls(), 1);

        pump(&scheduler);
        assert_eq!(log.transmitted(), b"INT KISS\r".to_vec());
        {
            let inner = device.shared.inner.lock().unwrap();
            assert_eq!(inner.kiss_rem_commands, VecDeque::from(["RESET".to_owned()]));
        }
        assert!(!queued.done());

        // Each burst of TNC output advances the sequence by one command
        device.receive(b"ok\r");
        pump(&scheduler);
        assert_eq!(log.transmitted(), b"INT KISS\rRESET\r".to_vec());
        assert_eq!(device.state(), DeviceState::Opening);

        device.receive(b"ok\r");
        pump(&scheduler);
        assert_eq!(device.state(), DeviceState::Open);
        assert!(rx_buffer(&device).is_empty());
        assert_eq!(queued.result(), Some(Ok(())));
        assert!(fails.lock().unwrap().is_empty());
    }

    #[test]
    fn open_failure_fails_queue_and_caller() {
        let (_scheduler, log, device) = build(quiet_config(), |t| t.fail_open = true);
        let fails = failures(&device);
        let completion = Completion::new();
        let error = device.open(Some(completion.clone())).unwrap_err();
        assert!(matches!(
            error,
            LinkError::Transport {
                action: DeviceAction::Open,
                ..
            }
        ));
        assert_eq!(log.open_calls(), 1);
        assert_eq!(device.state(), DeviceState::Failed);
        assert_eq!(completion.result(), Some(Err(error.clone())));
        let fails = fails.lock().unwrap();
        assert_eq!(fails.len(), 1);
        assert_eq!(fails[0].action, DeviceAction::Open);
        assert_eq!(fails[0].error, error);
    }

    #[test]
    fn close_without_reset_closes_at_once() {
        let (scheduler, log, device) = build(quiet_config(), |_| {});
        open_device(&device, &scheduler);
        let completion = Completion::new();
        device.close(Some(completion.clone())).unwrap();
        assert_eq!(log.close_calls(), 1);
        assert_eq!(device.state(), DeviceState::Closed);
        assert_eq!(completion.result(), Some(Ok(())));
    }

    #[test]
    fn close_with_reset_sends_return_frame_naked() {
        let (scheduler, log, device) = build(
            DeviceConfig {
                kiss_commands: vec![],
                send_block_size: 0,
                reset_on_close: true,
                ..DeviceConfig::default()
            },
            |_| {},
        );
        open_device(&device, &scheduler);
        let completion = Completion::new();
        device.close(Some(completion.clone())).unwrap();
        assert_eq!(device.state(), DeviceState::Closing);
        {
            let inner = device.shared.inner.lock().unwrap();
            assert_eq!(inner.tx_queue.len(), 1);
            assert_eq!(inner.tx_queue[0].bytes, vec![RETURN_FROM_KISS]);
            assert!(!inner.tx_queue[0].framed);
        }
        assert_eq!(log.close_calls(), 0);

        // A latecomer queues its completion on the same close
        let late = Completion::new();
        device.close(Some(late.clone())).unwrap();

        pump(&scheduler);
        assert_eq!(log.take_transmitted(), vec![RETURN_FROM_KISS]);
        assert_eq!(log.close_calls(), 1);
        assert_eq!(device.state(), DeviceState::Closed);
        assert_eq!(completion.result(), Some(Ok(())));
        assert_eq!(late.result(), Some(Ok(())));
    }

    #[test]
    fn close_failure_marks_device() {
        let (scheduler, log, device) = build(quiet_config(), |t| t.fail_close = true);
        open_device(&device, &scheduler);
        let fails = failures(&device);
        let error = device.close(None).unwrap_err();
        assert!(matches!(
            error,
            LinkError::Transport {
                action: DeviceAction::Close,
                ..
            }
        ));
        assert_eq!(log.close_calls(), 1);
        assert_eq!(device.state(), DeviceState::Failed);
        assert_eq!(fails.lock().unwrap()[0].action, DeviceAction::Close);
    }

    #[test]
    fn reset_recovers_failed_device() {
        let (_scheduler, _log, device) = build(quiet_config(), |t| t.fail_open = true);
        assert!(device.open(None).is_err());
        assert_eq!(device.state(), DeviceState::Failed);

        let pending = Completion::new();
        {
            let mut inner = device.shared.inner.lock().unwrap();
            inner.tx_queue.push_back(TxEntry {
                bytes: vec![1, 2, 3],
                completion: Some(pending.clone()),
                framed: true,
            });
        }
        device.reset();
        assert_eq!(device.state(), DeviceState::Closed);
        assert_eq!(pending.result(), Some(Err(LinkError::DeviceReset)));

        // From any other state it's a no-op
        device.reset();
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn receive_stashes_data_and_schedules_parse() {
        let (scheduler, _log, device) = build(quiet_config(), |_| {});
        open_device(&device, &scheduler);
        device.receive(b"test incoming data");
        assert_eq!(rx_buffer(&device), b"test incoming data".to_vec());
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn receive_frame_discards_garbage() {
        let (scheduler, _log, device) = build(quiet_config(), |_| {});
        set_rx_buffer(&device, b"this should be discarded");
        device.receive_frame();
        assert_eq!(rx_buffer(&device), b"".to_vec());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn receive_frame_keeps_from_first_fend() {
        let (scheduler, _log, device) = build(quiet_config(), |_| {});
        set_rx_buffer(&device, b"this should be discarded\xc0this should be kept");
        device.receive_frame();
        assert_eq!(rx_buffer(&device), b"\xc0this should be kept".to_vec());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn receive_frame_waits_on_lone_fend() {
        let (scheduler, _log, device) = build(quiet_config(), |_| {});
        set_rx_buffer(&device, b"\xc0");
        device.receive_frame();
        assert_eq!(rx_buffer(&device), b"\xc0".to_vec());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn receive_frame_discards_empty_frames() {
        let (scheduler, _log, device) = build(quiet_config(), |_| {});
        set_rx_buffer(&device, b"\xc0\xc0");
        device.receive_frame();
        assert_eq!(rx_buffer(&device), b"\xc0".to_vec());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn receive_frame_dispatches_single_frame() {
        let (scheduler, _log, device) = build(quiet_config(), |_| {});
        let seen = record_port(&device, 0);
        set_rx_buffer(&device, b"\xc0\x00a single KISS frame\xc0");
        device.receive_frame();
        assert_eq!(rx_buffer(&device), b"\xc0".to_vec());
        assert_eq!(scheduler.pending(), 1);
        pump(&scheduler);
        assert_eq!(&*seen.lock().unwrap(), &[b"a single KISS frame".to_vec()]);
    }

    #[test]
    fn receive_frame_reschedules_for_leftovers() {
        let (scheduler, _log, device) = build(quiet_config(), |_| {});
        let seen = record_port(&device, 0);
        set_rx_buffer(&device, b"\xc0\x00a single KISS frame\xc0more data");
        device.receive_frame();
        assert_eq!(rx_buffer(&device), b"\xc0more data".to_vec());
        // One dispatch, one re-parse
        assert_eq!(scheduler.pending(), 2);
        pump(&scheduler);
        assert_eq!(&*seen.lock().unwrap(), &[b"a single KISS frame".to_vec()]);
    }

    #[test]
    fn dispatch_drops_frames_for_undefined_ports() {
        let (_scheduler, _log, device) = build(quiet_config(), |_| {});
        let frame = KissFrame::new(14, 10, b"this should be dropped".to_vec()).unwrap();
        device.dispatch_rx_frame(frame);
    }

    #[test]
    fn panicking_port_handler_drops_only_the_frame() {
        let (_scheduler, _log, device) = build(quiet_config(), |_| {});
        device
            .port(0)
            .unwrap()
            .received()
            .connect(|_payload: &Vec<u8>| panic!("handler blew up"));
        let seen = record_port(&device, 1);

        device.dispatch_rx_frame(KissFrame::new(0, 0, b"boom".to_vec()).unwrap());
        // The device shrugs it off and keeps delivering elsewhere
        device.dispatch_rx_frame(KissFrame::new(1, 0, b"fine".to_vec()).unwrap());
        assert_eq!(device.state(), DeviceState::Closed);
        assert_eq!(&*seen.lock().unwrap(), &[b"fine".to_vec()]);
    }

    #[test]
    fn dispatch_delivers_to_known_port() {
        let (_scheduler, _log, device) = build(quiet_config(), |_| {});
        let seen = record_port(&device, 14);
        let frame = KissFrame::new(14, 0, b"this should be delivered".to_vec()).unwrap();
        device.dispatch_rx_frame(frame);
        assert_eq!(
            &*seen.lock().unwrap(),
            &[b"this should be delivered".to_vec()]
        );
    }

    #[test]
    fn port_send_queues_frame_and_drains() {
        let (scheduler, log, device) = build(quiet_config(), |_| {});
        open_device(&device, &scheduler);
        let port = device.port(0).unwrap();
        let completion = port
            .send(b"testing 1 2 3 4", Some(Completion::new()))
            .unwrap()
            .unwrap();
        {
            let inner = device.shared.inner.lock().unwrap();
            assert_eq!(inner.tx_queue.len(), 1);
            assert_eq!(
                inner.tx_queue[0].bytes,
                KissFrame::new(0, 0, b"testing 1 2 3 4".to_vec())
                    .unwrap()
                    .to_raw()
            );
        }
        assert_eq!(scheduler.pending(), 1);
        pump(&scheduler);
        assert_eq!(log.take_transmitted(), b"\xc0\x00testing 1 2 3 4\xc0".to_vec());
        assert_eq!(completion.result(), Some(Ok(())));
    }

    #[test]
    fn drain_respects_block_size_and_delay() {
        let (scheduler, log, device) = build(
            DeviceConfig {
                kiss_commands: vec![],
                send_block_size: 4,
                send_block_delay: Duration::from_secs(1),
                reset_on_close: false,
                ..DeviceConfig::default()
            },
            |_| {},
        );
        open_device(&device, &scheduler);
        device.shared.inner.lock().unwrap().tx_buffer = b"test output data".to_vec();
        device.send_data();
        assert_eq!(log.transmitted(), b"test".to_vec());
        assert_eq!(
            device.shared.inner.lock().unwrap().tx_buffer,
            b" output data".to_vec()
        );
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.next_delay(), Some(Duration::from_secs(1)));
        scheduler.advance(Duration::from_secs(1));
        scheduler.advance(Duration::from_secs(1));
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(log.transmitted(), b"test output data".to_vec());
    }

    #[test]
    fn no_drain_while_closed() {
        let (_scheduler, log, device) = build(quiet_config(), |_| {});
        device.shared.inner.lock().unwrap().tx_buffer = b"parked".to_vec();
        device.send_data();
        assert!(log.transmitted().is_empty());
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn send_failure_marks_device_and_fails_future() {
        let (scheduler, log, device) = build(quiet_config(), |t| t.fail_send = true);
        open_device(&device, &scheduler);
        let fails = failures(&device);
        let tx_future = Completion::new();
        {
            let mut inner = device.shared.inner.lock().unwrap();
            inner.tx_buffer = b"test output data".to_vec();
            inner.tx_future = Some(tx_future.clone());
        }
        device.send_data();
        // The write was attempted, then the device failed
        assert_eq!(log.transmitted(), b"test output data".to_vec());
        assert_eq!(device.state(), DeviceState::Failed);
        let fails = fails.lock().unwrap();
        assert_eq!(fails.len(), 1);
        assert_eq!(fails[0].action, DeviceAction::Send);
        assert_eq!(tx_future.result(), Some(Err(fails[0].error.clone())));
    }

    #[test]
    fn drain_finishes_pending_close() {
        let (scheduler, log, device) = build(
            DeviceConfig {
                kiss_commands: vec![],
                send_block_size: 4,
                send_block_delay: Duration::from_secs(1),
                reset_on_close: false,
                ..DeviceConfig::default()
            },
            |_| {},
        );
        open_device(&device, &scheduler);
        let port = device.port(0).unwrap();
        port.send(b"0123456789", None).unwrap();
        let completion = Completion::new();
        device.close(Some(completion.clone())).unwrap();
        assert_eq!(device.state(), DeviceState::Closing);
        assert_eq!(log.close_calls(), 0);

        // Frame is FEND + header + 10 bytes + FEND = 13 bytes, 4 per block
        pump(&scheduler);
        assert_eq!(log.close_calls(), 0);
        scheduler.advance(Duration::from_secs(1));
        scheduler.advance(Duration::from_secs(1));
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(log.close_calls(), 1);
        assert_eq!(device.state(), DeviceState::Closed);
        assert_eq!(completion.result(), Some(Ok(())));
        assert_eq!(log.take_transmitted(), b"\xc0\x000123456789\xc0".to_vec());
    }

    #[test]
    fn mark_sent_rejects_mismatched_chunk() {
        let (_scheduler, _log, device) = build(quiet_config(), |_| {});
        let mut inner = device.shared.inner.lock().unwrap();
        inner.tx_buffer = b"test output data".to_vec();
        assert_eq!(
            mark_sent(&mut inner, b"data not in buffer"),
            Err(LinkError::BufferMismatch)
        );
        // Buffer untouched after the mismatch
        assert_eq!(inner.tx_buffer, b"test output data".to_vec());
    }

    #[test]
    fn failing_init_command_fails_open() {
        let (scheduler, _log, device) = build(
            DeviceConfig {
                kiss_commands: vec!["!".to_owned()],
                reset_on_close: false,
                ..DeviceConfig::default()
            },
            |t| t.poison = Some(b'!'),
        );
        let fails = failures(&device);
        let completion = Completion::new();
        device.open(Some(completion.clone())).unwrap();
        pump(&scheduler);
        assert_eq!(device.state(), DeviceState::Failed);
        assert!(matches!(
            completion.result(),
            Some(Err(LinkError::Transport {
                action: DeviceAction::Open,
                ..
            }))
        ));
        assert_eq!(fails.lock().unwrap()[0].action, DeviceAction::Open);
    }

    #[test]
    fn one_port_handle_per_id() {
        let (_scheduler, _log, device) = build(quiet_config(), |_| {});
        let seen = record_port(&device, 7);
        // A second handle for the same id shares the signal
        let frame = KissFrame::new(7, 0, b"shared".to_vec()).unwrap();
        device.port(7).unwrap().deliver(&frame);
        assert_eq!(&*seen.lock().unwrap(), &[b"shared".to_vec()]);
        assert!(matches!(
            device.port(16),
            Err(LinkError::PortOutOfRange(16))
        ));
    }
}
