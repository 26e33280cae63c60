use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use ax25core::address::{Address, Callsign, Path};
use ax25core::frame::Ax25Frame;

use crate::event_loop::{resolve_loop, Scheduler};
use crate::interface::Interface;
use crate::peer::{Ax25Version, Peer, PeerOptions};
use crate::signal::Signal;

pub struct StationConfig {
    /// The AX.25 revision this station runs. A 2.0 station refuses SABME.
    pub protocol: Ax25Version,
    /// SABM(E)/DISC retransmissions before giving up.
    pub max_retries: u8,
    /// How long to wait for a UA (and for the TEST probe reply).
    pub ack_timeout: Duration,
    /// Tear the link down after this long without traffic.
    pub idle_timeout: Duration,
    /// How long an incoming connection may sit unanswered before we DM it.
    pub incoming_timeout: Duration,
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            protocol: Ax25Version::V2_2,
            max_retries: 2,
            ack_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(900),
            incoming_timeout: Duration::from_secs(30),
        }
    }
}

struct StationInner {
    address: Address,
    protocol: Ax25Version,
    interface: Option<Interface>,
    peers: HashMap<(Callsign, u8), Peer>,
    max_retries: u8,
    ack_timeout: Duration,
    idle_timeout: Duration,
    incoming_timeout: Duration,
}

pub(crate) struct StationShared {
    inner: Mutex<StationInner>,
    connection_request: Signal<ConnectionRequest>,
    scheduler: Arc<dyn Scheduler>,
}

/// Emitted when a remote station asks to connect; call `peer.accept()` or
/// `peer.reject()` to answer.
#[derive(Clone)]
pub struct ConnectionRequest {
    pub peer: Peer,
}

/// The local station: owns one peer per remote address and fields their
/// connection requests.
#[derive(Clone)]
pub struct Station {
    shared: Arc<StationShared>,
}

impl Station {
    pub fn new(
        address: Address,
        config: StationConfig,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Self {
        Station {
            shared: Arc::new(StationShared {
                inner: Mutex::new(StationInner {
                    address,
                    protocol: config.protocol,
                    interface: None,
                    peers: HashMap::new(),
                    max_retries: config.max_retries,
                    ack_timeout: config.ack_timeout,
                    idle_timeout: config.idle_timeout,
                    incoming_timeout: config.incoming_timeout,
                }),
                connection_request: Signal::new(),
                scheduler: resolve_loop(scheduler),
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.shared.inner.lock().unwrap().address
    }

    pub fn protocol(&self) -> Ax25Version {
        self.shared.inner.lock().unwrap().protocol
    }

    /// Emitted for every incoming SABM(E) that initialises a connection.
    pub fn connection_request(&self) -> &Signal<ConnectionRequest> {
        &self.shared.connection_request
    }

    /// Attach to an interface: frames for our address start flowing to the
    /// peers, and peers transmit through it.
    pub fn attach(&self, interface: &Interface) {
        let address = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.interface = Some(interface.clone());
            inner.address
        };
        let weak = Arc::downgrade(&self.shared);
        interface.bind(
            address.callsign,
            Some(address.ssid),
            Arc::new(move |frame: &Ax25Frame| {
                if let Some(shared) = weak.upgrade() {
                    Station { shared }.on_receive(frame);
                }
            }),
        );
    }

    /// The peer for a remote address, created on first use.
    pub fn peer(&self, address: Address, path: Path) -> Peer {
        self.peer_with(address, path, false, false)
    }

    /// As `peer()`, but pinning the digipeater path and selecting the
    /// modulo-128 connect request.
    pub fn peer_with(
        &self,
        address: Address,
        path: Path,
        locked_path: bool,
        modulo128: bool,
    ) -> Peer {
        let mut inner = self.shared.inner.lock().unwrap();
        let key = (address.callsign, address.ssid);
        if let Some(peer) = inner.peers.get(&key) {
            return peer.clone();
        }
        debug!("creating peer for {address}");
        let peer = Peer::new(
            Arc::downgrade(&self.shared),
            PeerOptions {
                address: address.with_ch(false),
                path,
                locked_path,
                modulo128,
                max_retries: inner.max_retries,
                ack_timeout: inner.ack_timeout,
                idle_timeout: inner.idle_timeout,
                incoming_timeout: inner.incoming_timeout,
            },
            self.shared.scheduler.clone(),
        );
        inner.peers.insert(key, peer.clone());
        peer
    }

    fn on_receive(&self, frame: &Ax25Frame) {
        let peer = self.peer(frame.header.source.with_ch(false), Path::empty());
        peer.update_path(&frame.header.repeaters);
        peer.on_receive(frame);
    }
}

impl StationShared {
    pub(crate) fn address(&self) -> Address {
        self.inner.lock().unwrap().address
    }

    pub(crate) fn protocol(&self) -> Ax25Version {
        self.inner.lock().unwrap().protocol
    }

    pub(crate) fn interface(&self) -> Option<Interface> {
        self.inner.lock().unwrap().interface.clone()
    }

    pub(crate) fn request_connection(&self, peer: Peer) {
        self.connection_request.emit(&ConnectionRequest { peer });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ManualLoop;

    #[test]
    fn peers_are_created_once_per_address() {
        let scheduler = ManualLoop::new();
        let station = Station::new(
            Address::parse("VK4MSL-1").unwrap(),
            StationConfig::default(),
            Some(scheduler as Arc<dyn Scheduler>),
        );
        let first = station.peer(Address::parse("VK4BWI").unwrap(), Path::empty());
        let again = station.peer(Address::parse("VK4BWI").unwrap(), Path::empty());
        first.set_protocol(Ax25Version::V2_0);
        assert_eq!(again.protocol(), Ax25Version::V2_0);

        // A different SSID is a different peer
        let other = station.peer(Address::parse("VK4BWI-5").unwrap(), Path::empty());
        assert_eq!(other.protocol(), Ax25Version::Unknown);
    }

    #[test]
    fn station_reports_its_configuration() {
        let scheduler = ManualLoop::new();
        let station = Station::new(
            Address::parse("VK4MSL-1").unwrap(),
            StationConfig::default(),
            Some(scheduler as Arc<dyn Scheduler>),
        );
        assert_eq!(station.address().to_string(), "VK4MSL-1");
        assert_eq!(station.protocol(), Ax25Version::V2_2);
    }
}
