pub const FEND: u8 = 0xc0;
pub const FESC: u8 = 0xdb;
pub const TFEND: u8 = 0xdc;
pub const TFESC: u8 = 0xdd;

/// Command nibble for a data frame, the only one this stack emits.
pub const CMD_DATA: u8 = 0;

/// The "return from KISS" byte. Sent naked, without FEND delimiters, to ask
/// the TNC to drop out of KISS mode.
pub const RETURN_FROM_KISS: u8 = 0xff;

/// One KISS frame: logical port, command code and unescaped payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissFrame {
    pub port: u8,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

impl KissFrame {
    pub fn new(port: u8, cmd: u8, payload: Vec<u8>) -> Result<Self, KissError> {
        if port > 0x0f {
            return Err(KissError::PortOutOfRange(port));
        }
        if cmd > 0x0f {
            return Err(KissError::CommandOutOfRange(cmd));
        }
        Ok(KissFrame { port, cmd, payload })
    }

    /// Serialise to the raw on-wire form between the FEND delimiters: the
    /// header byte followed by the escaped payload. The delimiters themselves
    /// are applied by the device when the frame is queued for transmit.
    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 1);
        out.push((self.port << 4) | (self.cmd & 0x0f));
        escape_into(&self.payload, &mut out);
        out
    }

    /// Parse the raw bytes found between two FEND delimiters. Returns `None`
    /// for an empty span, which the protocol says to discard.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        let header = *raw.first()?;
        Some(KissFrame {
            port: header >> 4,
            cmd: header & 0x0f,
            payload: unescape(&raw[1..]),
        })
    }
}

/// True if the buffer holds nothing but at most one FEND. A lone trailing
/// delimiter is the start of a frame that has not arrived yet.
pub fn buffer_empty(buf: &[u8]) -> bool {
    buf.is_empty() || buf == [FEND]
}

pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    escape_into(data, &mut out);
    out
}

fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for b in data {
        match *b {
            FEND => out.extend_from_slice(&[FESC, TFEND]),
            FESC => out.extend_from_slice(&[FESC, TFESC]),
            b => out.push(b),
        }
    }
}

pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(b) = iter.next() {
        if *b == FESC {
            match iter.next() {
                Some(&TFEND) => out.push(FEND),
                Some(&TFESC) => out.push(FESC),
                // Not a valid escape; pass it through untouched.
                Some(&other) => {
                    log::debug!("invalid KISS escape 0x{other:02x}");
                    out.push(FESC);
                    out.push(other);
                }
                None => break,
            }
        } else {
            out.push(*b);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KissError {
    PortOutOfRange(u8),
    CommandOutOfRange(u8),
}
