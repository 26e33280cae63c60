//! Accept AX.25 connections through a KISS TNC reachable over TCP, e.g.
//! Direwolf's KISS port:
//!
//! ```sh
//! cargo run --example tcp_listen -- localhost:8001 N0CALL-1
//! ```

use std::time::Duration;

use ax25app::interface::{Interface, InterfaceConfig};
use ax25app::kiss::{tcp::tcp_device, DeviceConfig};
use ax25app::peer::PeerState;
use ax25app::station::{ConnectionRequest, Station, StationConfig};
use ax25app::Address;

fn main() {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let target = args.next().expect("usage: tcp_listen <host:port> <callsign>");
    let callsign = args.next().expect("usage: tcp_listen <host:port> <callsign>");
    let address = Address::parse(&callsign).expect("invalid callsign");

    let device = tcp_device(&target, DeviceConfig::default(), None);
    device.open(None).expect("could not open KISS device");

    let interface = Interface::new(
        device.port(0).expect("port 0"),
        InterfaceConfig::default(),
        None,
    );
    let station = Station::new(address, StationConfig::default(), None);
    station.attach(&interface);

    station
        .connection_request()
        .connect(|request: &ConnectionRequest| {
            let peer = request.peer.clone();
            println!("connection request from {}", peer.address());
            peer.state_changed().connect({
                let peer = peer.clone();
                move |state: &PeerState| {
                    println!("{} is now {state:?}", peer.address());
                }
            });
            peer.accept();
        });

    println!("listening as {callsign} via {target}");
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
