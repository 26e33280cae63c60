use log::debug;

use ax25core::kiss::{KissFrame, CMD_DATA};

use crate::error::LinkError;
use crate::future::Completion;
use crate::kiss::KissDeviceRef;
use crate::signal::Signal;

/// One logical radio port on a KISS device.
///
/// A thin sender plus a receive signal: outgoing payloads are framed with
/// this port's id and queued on the device, incoming data frames for this
/// port arrive on `received`. The device hands out at most one port handle
/// per id; clones share the signal.
#[derive(Clone)]
pub struct KissPort {
    device: KissDeviceRef,
    port: u8,
    received: Signal<Vec<u8>>,
}

impl KissPort {
    pub(crate) fn new(device: KissDeviceRef, port: u8) -> Self {
        KissPort {
            device,
            port,
            received: Signal::new(),
        }
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    /// Deframed KISS payloads addressed to this port.
    pub fn received(&self) -> &Signal<Vec<u8>> {
        &self.received
    }

    /// Queue a payload for transmission as a KISS data frame on this port.
    pub fn send(
        &self,
        payload: &[u8],
        completion: Option<Completion>,
    ) -> Result<Option<Completion>, LinkError> {
        let device = self.device.upgrade().ok_or(LinkError::DeviceDetached)?;
        let frame = KissFrame::new(self.port, CMD_DATA, payload.to_vec())
            .map_err(|_| LinkError::PortOutOfRange(self.port))?;
        Ok(device.send_frame(&frame, completion))
    }

    /// Called by the device for each deframed KISS frame on this port.
    pub(crate) fn deliver(&self, frame: &KissFrame) {
        debug!(
            "port {} received {} byte frame",
            self.port,
            frame.payload.len()
        );
        self.received.emit(&frame.payload);
    }
}
