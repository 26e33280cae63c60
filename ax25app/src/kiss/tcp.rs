use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use log::debug;

use crate::error::TransportError;
use crate::event_loop::Scheduler;
use crate::kiss::{DeviceConfig, KissDevice, KissDeviceRef, KissTransport};

/// A KISS TNC reached over TCP, e.g. a networked soundmodem.
pub struct TcpTransport {
    target: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(target: &str) -> Self {
        TcpTransport {
            target: target.to_owned(),
            stream: None,
        }
    }
}

impl KissTransport for TcpTransport {
    fn open(&mut self, device: KissDeviceRef) -> Result<(), TransportError> {
        let addr = self
            .target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "no address for KISS host"))?;
        let stream = TcpStream::connect(addr)?;
        let mut reader = stream.try_clone()?;
        std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!("KISS TCP peer closed the connection");
                        break;
                    }
                    Ok(n) => {
                        if !device.receive(&buf[..n]) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("KISS TCP read finished: {e}");
                        break;
                    }
                }
            }
        });
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.take() {
            stream.shutdown(Shutdown::Both)?;
        }
        Ok(())
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "KISS socket not open"))?;
        Ok(stream.write_all(data)?)
    }
}

/// A KISS device over a TCP TNC.
pub fn tcp_device(
    target: &str,
    config: DeviceConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
) -> KissDevice {
    KissDevice::new(Box::new(TcpTransport::new(target)), config, scheduler)
}
