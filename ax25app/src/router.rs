use std::sync::Arc;

use log::debug;

use ax25core::address::{Address, Callsign};
use ax25core::frame::Ax25Frame;

/// Receiver for routed frames.
pub type FrameHandler = Arc<dyn Fn(&Ax25Frame) + Send + Sync + 'static>;

/// Dispatches inbound frames by destination address.
///
/// A route binds a callsign with a specific SSID, or with `None` as a
/// wildcard over all SSIDs. Exact entries win over wildcards; anything
/// unmatched goes to the default handler if one is installed.
#[derive(Default)]
pub struct Router {
    routes: Vec<RouteEntry>,
    default_handler: Option<FrameHandler>,
}

struct RouteEntry {
    callsign: Callsign,
    ssid: Option<u8>,
    handler: FrameHandler,
}

impl Router {
    pub fn bind(&mut self, callsign: Callsign, ssid: Option<u8>, handler: FrameHandler) {
        self.unbind(callsign, ssid);
        self.routes.push(RouteEntry {
            callsign,
            ssid,
            handler,
        });
    }

    pub fn unbind(&mut self, callsign: Callsign, ssid: Option<u8>) {
        self.routes
            .retain(|route| !(route.callsign == callsign && route.ssid == ssid));
    }

    pub fn set_default_handler(&mut self, handler: Option<FrameHandler>) {
        self.default_handler = handler;
    }

    /// Find the handler for a destination: exact match, then wildcard, then
    /// the default.
    pub fn lookup(&self, destination: &Address) -> Option<FrameHandler> {
        let exact = self.routes.iter().find(|route| {
            route.callsign == destination.callsign && route.ssid == Some(destination.ssid)
        });
        let wildcard = || {
            self.routes
                .iter()
                .find(|route| route.callsign == destination.callsign && route.ssid.is_none())
        };
        exact
            .or_else(wildcard)
            .map(|route| route.handler.clone())
            .or_else(|| self.default_handler.clone())
    }

    /// Route one frame. Returns false if nobody wanted it.
    pub fn route(&self, frame: &Ax25Frame) -> bool {
        match self.lookup(&frame.header.destination) {
            Some(handler) => {
                handler(frame);
                true
            }
            None => {
                debug!("no route for {}", frame.header.destination);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax25core::address::Path;
    use ax25core::frame::{Control, FrameHeader};
    use std::sync::Mutex;

    fn frame_to(destination: &str) -> Ax25Frame {
        Ax25Frame::new(
            FrameHeader {
                destination: Address::parse(destination).unwrap(),
                source: Address::parse("VK4MSL").unwrap(),
                repeaters: Path::empty(),
                command: true,
            },
            Control::Ui {
                poll: false,
                pid: 0xf0,
                payload: vec![],
            },
        )
    }

    fn recording_handler() -> (Arc<Mutex<Vec<String>>>, FrameHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: FrameHandler = Arc::new(move |frame: &Ax25Frame| {
            sink.lock()
                .unwrap()
                .push(frame.header.destination.to_string());
        });
        (seen, handler)
    }

    #[test]
    fn exact_beats_wildcard() {
        let mut router = Router::default();
        let call = Callsign::new("VK4BWI").unwrap();
        let (wild_seen, wild) = recording_handler();
        let (exact_seen, exact) = recording_handler();
        router.bind(call, None, wild);
        router.bind(call, Some(2), exact);

        assert!(router.route(&frame_to("VK4BWI-2")));
        assert!(router.route(&frame_to("VK4BWI-3")));
        assert_eq!(&*exact_seen.lock().unwrap(), &["VK4BWI-2"]);
        assert_eq!(&*wild_seen.lock().unwrap(), &["VK4BWI-3"]);
    }

    #[test]
    fn default_handler_catches_rest() {
        let mut router = Router::default();
        let (seen, handler) = recording_handler();
        router.set_default_handler(Some(handler));
        assert!(router.route(&frame_to("VK4AAA")));
        assert_eq!(&*seen.lock().unwrap(), &["VK4AAA"]);
    }

    #[test]
    fn unmatched_frame_is_dropped() {
        let mut router = Router::default();
        let call = Callsign::new("VK4BWI").unwrap();
        let (seen, handler) = recording_handler();
        router.bind(call, Some(1), handler);
        assert!(!router.route(&frame_to("VK4AAA")));
        router.unbind(call, Some(1));
        assert!(!router.route(&frame_to("VK4BWI-1")));
        assert!(seen.lock().unwrap().is_empty());
    }
}
