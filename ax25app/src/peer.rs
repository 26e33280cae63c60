use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};

use ax25core::address::{Address, Path};
use ax25core::frame::{Ax25Frame, Control, FrameHeader, FrmrReport};

use crate::event_loop::{Scheduler, TimerHandle};
use crate::signal::Signal;
use crate::station::StationShared;

/// AX.25 revision spoken by a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ax25Version {
    Unknown,
    V2_0,
    V2_2,
}

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    /// Probing an unknown-version peer before the first SABM(E).
    Negotiating,
    /// SABM(E) sent, waiting for UA.
    Connecting,
    Connected,
    /// DISC sent, waiting for UA.
    Disconnecting,
    /// SABM(E) received, waiting for the application to accept or reject.
    IncomingConnection,
}

/// What an arriving UA would acknowledge.
enum UaIntent {
    Connect,
    Disconnect,
}

/// Frames to send and events to emit, collected under the peer lock and
/// carried out after it is released so subscribers can call straight back
/// into the peer.
#[derive(Default)]
struct Actions {
    send: Vec<Ax25Frame>,
    emit_state: Option<PeerState>,
    request_connection: bool,
}

pub(crate) struct PeerOptions {
    pub address: Address,
    pub path: Path,
    pub locked_path: bool,
    pub modulo128: bool,
    pub max_retries: u8,
    pub ack_timeout: Duration,
    pub idle_timeout: Duration,
    pub incoming_timeout: Duration,
}

struct PeerInner {
    station: Weak<StationShared>,
    address: Address,
    path: Path,
    locked_path: bool,
    modulo128: bool,
    state: PeerState,
    protocol: Ax25Version,
    negotiated: bool,
    ua_intent: Option<UaIntent>,
    // Send/receive/ack state variables, owned by the numbered-frame
    // machinery layered above this FSM. Connect and disconnect must zero
    // them but otherwise leave them alone.
    vs: u8,
    vr: u8,
    va: u8,
    retries: u8,
    max_retries: u8,
    ack_timeout: Duration,
    idle_timeout: Duration,
    incoming_timeout: Duration,
    connect_timer: Option<TimerHandle>,
    idle_timer: Option<TimerHandle>,
    incoming_timer: Option<TimerHandle>,
    negotiate_timer: Option<TimerHandle>,
}

struct PeerShared {
    inner: Mutex<PeerInner>,
    state_changed: Signal<PeerState>,
    scheduler: Arc<dyn Scheduler>,
}

/// The data-link state machine for one remote station.
///
/// Created on demand by the owning `Station`. Drives the SABM(E)/UA/DM/DISC
/// handshake, negotiates AX.25 2.0 against 2.2, and keeps the connect,
/// idle and incoming-connection timers.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<PeerShared>,
}

impl Peer {
    pub(crate) fn new(
        station: Weak<StationShared>,
        options: PeerOptions,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Peer {
            shared: Arc::new(PeerShared {
                inner: Mutex::new(PeerInner {
                    station,
                    address: options.address,
                    path: options.path,
                    locked_path: options.locked_path,
                    modulo128: options.modulo128,
                    state: PeerState::Disconnected,
                    protocol: Ax25Version::Unknown,
                    negotiated: false,
                    ua_intent: None,
                    vs: 0,
                    vr: 0,
                    va: 0,
                    retries: 0,
                    max_retries: options.max_retries,
                    ack_timeout: options.ack_timeout,
                    idle_timeout: options.idle_timeout,
                    incoming_timeout: options.incoming_timeout,
                    connect_timer: None,
                    idle_timer: None,
                    incoming_timer: None,
                    negotiate_timer: None,
                }),
                state_changed: Signal::new(),
                scheduler,
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.shared.inner.lock().unwrap().address
    }

    pub fn state(&self) -> PeerState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn protocol(&self) -> Ax25Version {
        self.shared.inner.lock().unwrap().protocol
    }

    /// Record the remote station's AX.25 revision when it is known out of
    /// band, skipping the TEST probe on the next connect.
    pub fn set_protocol(&self, protocol: Ax25Version) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.protocol = protocol;
        inner.negotiated = protocol != Ax25Version::Unknown;
    }

    /// Emitted whenever the connection state changes.
    pub fn state_changed(&self) -> &Signal<PeerState> {
        &self.shared.state_changed
    }

    /// Start connecting. No-op unless currently disconnected.
    pub fn connect(&self) {
        let mut actions = Actions::default();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != PeerState::Disconnected {
                debug!("connect() ignored in state {:?}", inner.state);
                return;
            }
            self.negotiate(&mut inner, &mut actions);
        }
        self.run(actions);
    }

    /// Start an orderly disconnect. No-op unless currently connected.
    pub fn disconnect(&self) {
        let mut actions = Actions::default();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != PeerState::Connected {
                debug!("disconnect() ignored in state {:?}", inner.state);
                return;
            }
            inner.ua_intent = Some(UaIntent::Disconnect);
            if let Some(frame) = self.link_frame(&inner, Control::Disc { poll: true }, true) {
                actions.send.push(frame);
            }
            set_state(&mut inner, &mut actions, PeerState::Disconnecting);
            self.arm_connect_timer(&mut inner);
        }
        self.run(actions);
    }

    /// Accept an incoming connection announced via `connection_request`.
    pub fn accept(&self) {
        let mut actions = Actions::default();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != PeerState::IncomingConnection {
                debug!("accept() ignored in state {:?}", inner.state);
                return;
            }
            cancel_timer(&mut inner.incoming_timer);
            if let Some(frame) = self.link_frame(&inner, Control::Ua { fin: true }, false) {
                actions.send.push(frame);
            }
            set_state(&mut inner, &mut actions, PeerState::Connected);
            self.arm_idle_timer(&mut inner);
        }
        self.run(actions);
    }

    /// Refuse an incoming connection with DM.
    pub fn reject(&self) {
        let mut actions = Actions::default();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != PeerState::IncomingConnection {
                debug!("reject() ignored in state {:?}", inner.state);
                return;
            }
            cancel_timer(&mut inner.incoming_timer);
            if let Some(frame) = self.link_frame(&inner, Control::Dm { fin: true }, false) {
                actions.send.push(frame);
            }
            set_state(&mut inner, &mut actions, PeerState::Disconnected);
        }
        self.run(actions);
    }

    /// Update the digipeater path from a received frame's reply path,
    /// unless the path is locked.
    pub(crate) fn update_path(&self, received: &Path) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.locked_path {
            return;
        }
        let reply: Vec<Address> = received
            .repeaters()
            .iter()
            .rev()
            .map(|repeater| repeater.with_ch(false))
            .collect();
        if let Ok(path) = Path::new(reply) {
            inner.path = path;
        }
    }

    /// Entry point for every frame routed to this peer.
    pub(crate) fn on_receive(&self, frame: &Ax25Frame) {
        let mut actions = Actions::default();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            self.arm_idle_timer(&mut inner);
            match inner.state {
                PeerState::Connecting => {
                    self.on_receive_connecting(&mut inner, frame, &mut actions)
                }
                PeerState::Negotiating => {
                    self.on_receive_negotiating(&mut inner, frame, &mut actions)
                }
                PeerState::Connected => self.on_receive_connected(&mut inner, frame, &mut actions),
                PeerState::Disconnecting => {
                    self.on_receive_disconnecting(&mut inner, frame, &mut actions)
                }
                PeerState::Disconnected | PeerState::IncomingConnection => {
                    self.on_receive_disconnected(&mut inner, frame, &mut actions)
                }
            }
        }
        self.run(actions);
    }

    fn on_receive_connecting(
        &self,
        inner: &mut PeerInner,
        frame: &Ax25Frame,
        actions: &mut Actions,
    ) {
        match &frame.control {
            // AX.25 2.2 sect 6.3.1: FRMR and TEST say nothing about our SABM
            Control::Frmr { .. } => debug!("ignoring FRMR while connecting"),
            Control::Test { .. } => debug!("ignoring TEST while connecting"),
            Control::Ua { .. } => self.handle_ua(inner, actions),
            Control::Disc { .. } => {
                if let Some(ua) = self.link_frame(inner, Control::Ua { fin: true }, false) {
                    actions.send.push(ua);
                }
                self.on_disconnect(inner, actions);
            }
            // The DM handler stays armed for an established connection; a DM
            // here just means the connect was refused.
            Control::Dm { .. } => self.on_disconnect(inner, actions),
            Control::Sabm { .. } | Control::Sabme { .. } => {
                self.on_receive_sabm(inner, frame, actions)
            }
            other => debug!("ignoring {other:?} while connecting"),
        }
    }

    fn on_receive_negotiating(
        &self,
        inner: &mut PeerInner,
        frame: &Ax25Frame,
        actions: &mut Actions,
    ) {
        match &frame.control {
            Control::Test { .. } => {
                // The reply proves a 2.2-era implementation
                debug!("TEST probe answered by {}", inner.address);
                cancel_timer(&mut inner.negotiate_timer);
                inner.negotiated = true;
                inner.protocol = Ax25Version::V2_2;
                self.send_sabm(inner, actions);
            }
            Control::Dm { .. } => {
                // Alive but not talkative; try connecting anyway
                cancel_timer(&mut inner.negotiate_timer);
                inner.negotiated = true;
                self.send_sabm(inner, actions);
            }
            Control::Sabm { .. } | Control::Sabme { .. } => {
                self.on_receive_sabm(inner, frame, actions)
            }
            other => debug!("ignoring {other:?} while negotiating"),
        }
    }

    fn on_receive_connected(
        &self,
        inner: &mut PeerInner,
        frame: &Ax25Frame,
        actions: &mut Actions,
    ) {
        match &frame.control {
            Control::Disc { .. } => {
                if let Some(ua) = self.link_frame(inner, Control::Ua { fin: true }, false) {
                    actions.send.push(ua);
                }
                self.on_disconnect(inner, actions);
            }
            Control::Dm { .. } => self.on_disconnect(inner, actions),
            Control::Sabm { .. } | Control::Sabme { .. } => {
                self.on_receive_sabm(inner, frame, actions)
            }
            Control::Test { poll, payload } if frame.header.command => {
                let reply = Control::Test {
                    poll: *poll,
                    payload: payload.clone(),
                };
                if let Some(test) = self.link_frame(inner, reply, false) {
                    actions.send.push(test);
                }
            }
            Control::Frmr { .. } => {
                warn!("{} rejected a frame; resetting link", inner.address);
                self.on_disconnect(inner, actions);
            }
            Control::Information { .. } | Control::Supervisory { .. } => {
                // Numbered traffic is the business of the I/S machinery
            }
            other => debug!("ignoring {other:?} while connected"),
        }
    }

    fn on_receive_disconnecting(
        &self,
        inner: &mut PeerInner,
        frame: &Ax25Frame,
        actions: &mut Actions,
    ) {
        match &frame.control {
            Control::Ua { .. } => self.handle_ua(inner, actions),
            Control::Dm { .. } => self.on_disconnect(inner, actions),
            Control::Disc { .. } => {
                // Both sides are hanging up at once
                if let Some(ua) = self.link_frame(inner, Control::Ua { fin: true }, false) {
                    actions.send.push(ua);
                }
                self.on_disconnect(inner, actions);
            }
            other => debug!("ignoring {other:?} while disconnecting"),
        }
    }

    fn on_receive_disconnected(
        &self,
        inner: &mut PeerInner,
        frame: &Ax25Frame,
        actions: &mut Actions,
    ) {
        match &frame.control {
            Control::Sabm { .. } | Control::Sabme { .. } => {
                self.on_receive_sabm(inner, frame, actions)
            }
            Control::Disc { .. } => {
                if let Some(dm) = self.link_frame(inner, Control::Dm { fin: true }, false) {
                    actions.send.push(dm);
                }
            }
            Control::Test { poll, payload } if frame.header.command => {
                let reply = Control::Test {
                    poll: *poll,
                    payload: payload.clone(),
                };
                if let Some(test) = self.link_frame(inner, reply, false) {
                    actions.send.push(test);
                }
            }
            Control::Dm { .. } | Control::Ua { .. } => {}
            other => debug!("ignoring {other:?} while disconnected"),
        }
    }

    /// Decide how to reach the first SABM(E): straight away if the peer's
    /// revision is settled, otherwise after a TEST probe.
    fn negotiate(&self, inner: &mut PeerInner, actions: &mut Actions) {
        let station_protocol = inner
            .station
            .upgrade()
            .map(|station| station.protocol())
            .unwrap_or(Ax25Version::V2_0);
        if !inner.negotiated
            && inner.protocol == Ax25Version::Unknown
            && station_protocol == Ax25Version::V2_2
        {
            debug!("probing {} with TEST before connecting", inner.address);
            let probe = Control::Test {
                poll: true,
                payload: Vec::new(),
            };
            if let Some(frame) = self.link_frame(inner, probe, true) {
                actions.send.push(frame);
            }
            set_state(inner, actions, PeerState::Negotiating);
            let peer = self.clone();
            cancel_timer(&mut inner.negotiate_timer);
            inner.negotiate_timer = Some(self.shared.scheduler.call_later(
                inner.ack_timeout,
                Box::new(move || peer.on_negotiate_timeout()),
            ));
        } else {
            self.send_sabm(inner, actions);
        }
    }

    /// Send the connect request and start waiting for UA.
    fn send_sabm(&self, inner: &mut PeerInner, actions: &mut Actions) {
        let control = if inner.modulo128 {
            Control::Sabme { poll: true }
        } else {
            Control::Sabm { poll: true }
        };
        if let Some(frame) = self.link_frame(inner, control, true) {
            actions.send.push(frame);
        }
        inner.ua_intent = Some(UaIntent::Connect);
        inner.retries = inner.max_retries;
        set_state(inner, actions, PeerState::Connecting);
        self.arm_connect_timer(inner);
    }

    fn on_receive_sabm(&self, inner: &mut PeerInner, frame: &Ax25Frame, actions: &mut Actions) {
        let (extended, rejected_control) = match &frame.control {
            Control::Sabm { poll } => (false, 0x2fu8 | if *poll { 0x10 } else { 0 }),
            Control::Sabme { poll } => (true, 0x6fu8 | if *poll { 0x10 } else { 0 }),
            _ => return,
        };
        if extended {
            let station_protocol = inner
                .station
                .upgrade()
                .map(|station| station.protocol())
                .unwrap_or(Ax25Version::V2_0);
            if station_protocol == Ax25Version::V2_0 {
                // We are not running the extended protocol ourselves
                let frmr = Control::Frmr {
                    fin: false,
                    report: FrmrReport::invalid_control(rejected_control),
                };
                if let Some(frame) = self.link_frame(inner, frmr, false) {
                    actions.send.push(frame);
                }
                return;
            }
            match inner.protocol {
                Ax25Version::V2_0 => {
                    // A 2.0 peer asking for SABME is confused; refuse
                    if let Some(frame) =
                        self.link_frame(inner, Control::Dm { fin: true }, false)
                    {
                        actions.send.push(frame);
                    }
                    return;
                }
                Ax25Version::Unknown => inner.protocol = Ax25Version::V2_2,
                Ax25Version::V2_2 => {}
            }
        }
        self.init_connection(inner, extended);
        self.start_incoming_timer(inner);
        set_state(inner, actions, PeerState::IncomingConnection);
        actions.request_connection = true;
    }

    /// Zero the link state for a fresh connection.
    fn init_connection(&self, inner: &mut PeerInner, extended: bool) {
        inner.modulo128 = extended;
        inner.vs = 0;
        inner.vr = 0;
        inner.va = 0;
    }

    fn handle_ua(&self, inner: &mut PeerInner, actions: &mut Actions) {
        match inner.ua_intent.take() {
            Some(UaIntent::Connect) => {
                cancel_timer(&mut inner.connect_timer);
                inner.negotiated = true;
                if inner.modulo128 && inner.protocol == Ax25Version::Unknown {
                    // Only a 2.2 implementation acknowledges SABME
                    inner.protocol = Ax25Version::V2_2;
                }
                inner.vs = 0;
                inner.vr = 0;
                inner.va = 0;
                info!("connected to {}", inner.address);
                set_state(inner, actions, PeerState::Connected);
                self.arm_idle_timer(inner);
            }
            Some(UaIntent::Disconnect) => {
                cancel_timer(&mut inner.connect_timer);
                info!("disconnected from {}", inner.address);
                self.on_disconnect(inner, actions);
            }
            None => debug!("unexpected UA from {}", inner.address),
        }
    }

    /// Common tear-down once the link is gone, however that came about.
    fn on_disconnect(&self, inner: &mut PeerInner, actions: &mut Actions) {
        cancel_timer(&mut inner.connect_timer);
        cancel_timer(&mut inner.idle_timer);
        cancel_timer(&mut inner.incoming_timer);
        cancel_timer(&mut inner.negotiate_timer);
        inner.ua_intent = None;
        set_state(inner, actions, PeerState::Disconnected);
    }

    fn on_connect_timeout(&self) {
        let mut actions = Actions::default();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.state {
                PeerState::Connecting => {
                    if inner.retries > 0 {
                        inner.retries -= 1;
                        debug!(
                            "no UA from {}, retrying ({} left)",
                            inner.address, inner.retries
                        );
                        let control = if inner.modulo128 {
                            Control::Sabme { poll: true }
                        } else {
                            Control::Sabm { poll: true }
                        };
                        if let Some(frame) = self.link_frame(&inner, control, true) {
                            actions.send.push(frame);
                        }
                        self.arm_connect_timer(&mut inner);
                    } else {
                        info!("connection to {} failed", inner.address);
                        self.on_disconnect(&mut inner, &mut actions);
                    }
                }
                PeerState::Disconnecting => {
                    info!("disconnect from {} not acknowledged", inner.address);
                    self.on_disconnect(&mut inner, &mut actions);
                }
                _ => {}
            }
        }
        self.run(actions);
    }

    fn on_negotiate_timeout(&self) {
        let mut actions = Actions::default();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == PeerState::Negotiating {
                debug!("no answer to TEST probe from {}", inner.address);
                inner.negotiated = true;
                self.send_sabm(&mut inner, &mut actions);
            }
        }
        self.run(actions);
    }

    fn on_incoming_timeout(&self) {
        let mut actions = Actions::default();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == PeerState::IncomingConnection {
                info!("incoming connection from {} went unanswered", inner.address);
                if let Some(frame) = self.link_frame(&inner, Control::Dm { fin: true }, false) {
                    actions.send.push(frame);
                }
                self.on_disconnect(&mut inner, &mut actions);
            }
        }
        self.run(actions);
    }

    fn on_idle_timeout(&self) {
        let mut actions = Actions::default();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == PeerState::Connected {
                info!("link to {} idle too long, disconnecting", inner.address);
                inner.ua_intent = Some(UaIntent::Disconnect);
                if let Some(frame) = self.link_frame(&inner, Control::Disc { poll: true }, true) {
                    actions.send.push(frame);
                }
                set_state(&mut inner, &mut actions, PeerState::Disconnecting);
                self.arm_connect_timer(&mut inner);
            }
        }
        self.run(actions);
    }

    fn arm_connect_timer(&self, inner: &mut PeerInner) {
        cancel_timer(&mut inner.connect_timer);
        let peer = self.clone();
        inner.connect_timer = Some(self.shared.scheduler.call_later(
            inner.ack_timeout,
            Box::new(move || peer.on_connect_timeout()),
        ));
    }

    fn arm_idle_timer(&self, inner: &mut PeerInner) {
        cancel_timer(&mut inner.idle_timer);
        let peer = self.clone();
        inner.idle_timer = Some(self.shared.scheduler.call_later(
            inner.idle_timeout,
            Box::new(move || peer.on_idle_timeout()),
        ));
    }

    fn start_incoming_timer(&self, inner: &mut PeerInner) {
        cancel_timer(&mut inner.incoming_timer);
        let peer = self.clone();
        inner.incoming_timer = Some(self.shared.scheduler.call_later(
            inner.incoming_timeout,
            Box::new(move || peer.on_incoming_timeout()),
        ));
    }

    /// Build a frame addressed to this peer from the local station.
    fn link_frame(&self, inner: &PeerInner, control: Control, command: bool) -> Option<Ax25Frame> {
        let station = inner.station.upgrade()?;
        Some(Ax25Frame::new(
            FrameHeader {
                destination: inner.address,
                source: station.address(),
                repeaters: inner.path.clone(),
                command,
            },
            control,
        ))
    }

    fn station(&self) -> Option<Arc<StationShared>> {
        self.shared.inner.lock().unwrap().station.upgrade()
    }

    /// Perform the side effects collected under the lock.
    fn run(&self, actions: Actions) {
        if !actions.send.is_empty() {
            match self.station().and_then(|station| station.interface()) {
                Some(interface) => {
                    for frame in actions.send {
                        if let Err(e) = interface.transmit(frame, None, None) {
                            warn!("failed to queue frame: {e}");
                        }
                    }
                }
                None => warn!("station has no interface attached; dropping frames"),
            }
        }
        if let Some(state) = actions.emit_state {
            self.shared.state_changed.emit(&state);
        }
        if actions.request_connection {
            if let Some(station) = self.station() {
                station.request_connection(self.clone());
            }
        }
    }
}

fn set_state(inner: &mut PeerInner, actions: &mut Actions, state: PeerState) {
    if inner.state != state {
        inner.state = state;
        actions.emit_state = Some(state);
    }
}

fn cancel_timer(timer: &mut Option<TimerHandle>) {
    if let Some(timer) = timer.take() {
        timer.cancel();
    }
}
