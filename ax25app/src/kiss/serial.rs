use std::io::{self, ErrorKind, Read};
use std::sync::mpsc::{channel, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use serialport::SerialPort;

use crate::error::TransportError;
use crate::event_loop::Scheduler;
use crate::kiss::{DeviceConfig, KissDevice, KissDeviceRef, KissTransport};

/// A KISS TNC on a serial line or pseudo-TTY.
pub struct SerialTransport {
    path: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
    end_tx: Mutex<Option<Sender<()>>>,
}

impl SerialTransport {
    pub fn new(path: &str, baud: u32) -> Self {
        SerialTransport {
            path: path.to_owned(),
            baud,
            port: None,
            end_tx: Mutex::new(None),
        }
    }
}

impl KissTransport for SerialTransport {
    fn open(&mut self, device: KissDeviceRef) -> Result<(), TransportError> {
        let port = serialport::new(&self.path, self.baud)
            .timeout(Duration::from_millis(250))
            .open()
            .map_err(io::Error::other)?;
        let reader = port
            .try_clone()
            .map_err(io::Error::other)?;
        let (end_tx, end_rx) = channel();
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 1024];
            loop {
                if end_rx.try_recv() != Err(TryRecvError::Empty) {
                    break;
                }
                match reader.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        if !device.receive(&buf[..n]) {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(e) => {
                        debug!("serial read finished: {e}");
                        break;
                    }
                }
            }
        });
        *self.end_tx.lock().unwrap() = Some(end_tx);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.end_tx.lock().unwrap().take();
        self.port = None;
        Ok(())
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "serial port not open"))?;
        Ok(port.write_all(data)?)
    }
}

/// A KISS device over a serial TNC.
pub fn serial_device(
    path: &str,
    baud: u32,
    config: DeviceConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
) -> KissDevice {
    KissDevice::new(Box::new(SerialTransport::new(path, baud)), config, scheduler)
}
