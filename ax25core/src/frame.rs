use crate::address::{decode_address, encode_address, Address, AddressError, Path};
use std::time::SystemTime;

// Modulo-8 U frame control values with the P/F bit masked out.
const CONTROL_SABM: u8 = 0x2f;
const CONTROL_SABME: u8 = 0x6f;
const CONTROL_DISC: u8 = 0x43;
const CONTROL_UA: u8 = 0x63;
const CONTROL_DM: u8 = 0x0f;
const CONTROL_FRMR: u8 = 0x87;
const CONTROL_TEST: u8 = 0xe3;
const CONTROL_UI: u8 = 0x03;

const PF_BIT: u8 = 0x10;

/// Address block of any AX.25 frame.
///
/// `command` reflects the AX.25 v2 command/response convention: a command
/// frame sets the C bit in the destination field and clears it in the source
/// field, a response frame does the opposite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub destination: Address,
    pub source: Address,
    pub repeaters: Path,
    pub command: bool,
}

impl FrameHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        let destination = self.destination.with_ch(self.command);
        let source = self.source.with_ch(!self.command);
        out.extend_from_slice(&encode_address(&destination, false));
        let repeaters = self.repeaters.repeaters();
        out.extend_from_slice(&encode_address(&source, repeaters.is_empty()));
        for (i, repeater) in repeaters.iter().enumerate() {
            out.extend_from_slice(&encode_address(repeater, i == repeaters.len() - 1));
        }
    }

    fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        let (destination, last) = Self::decode_one(data, 0)?;
        if last {
            return Err(FrameError::Truncated);
        }
        let (source, mut last) = Self::decode_one(data, 7)?;
        let mut repeaters = Vec::new();
        let mut offset = 14;
        while !last {
            if repeaters.len() == 8 {
                return Err(FrameError::PathTooLong);
            }
            let decoded = Self::decode_one(data, offset)?;
            repeaters.push(decoded.0);
            last = decoded.1;
            offset += 7;
        }
        let header = FrameHeader {
            command: destination.ch,
            destination: destination.with_ch(false),
            source: source.with_ch(false),
            repeaters: Path::new(repeaters)?,
        };
        Ok((header, offset))
    }

    fn decode_one(data: &[u8], offset: usize) -> Result<(Address, bool), FrameError> {
        let field: &[u8; 7] = data
            .get(offset..offset + 7)
            .ok_or(FrameError::Truncated)?
            .try_into()
            .unwrap();
        Ok(decode_address(field)?)
    }
}

/// Control field variants this stack understands.
///
/// Numbered I and S frames are carried opaquely; connected-mode data transfer
/// is layered above this codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Set Asynchronous Balanced Mode, the modulo-8 connect request.
    Sabm { poll: bool },
    /// SABM Extended, the modulo-128 connect request (AX.25 2.2).
    Sabme { poll: bool },
    /// Disconnect request.
    Disc { poll: bool },
    /// Unnumbered acknowledge.
    Ua { fin: bool },
    /// Disconnected mode.
    Dm { fin: bool },
    /// Frame reject.
    Frmr { fin: bool, report: FrmrReport },
    /// Loopback test.
    Test { poll: bool, payload: Vec<u8> },
    /// Unnumbered information.
    Ui { poll: bool, pid: u8, payload: Vec<u8> },
    /// Any other unnumbered frame (e.g. XID), carried opaquely.
    Unnumbered { control: u8, payload: Vec<u8> },
    /// A supervisory frame (RR/RNR/REJ/SREJ), carried opaquely.
    Supervisory { control: u8 },
    /// A numbered information frame, carried opaquely.
    Information { control: u8, pid: u8, payload: Vec<u8> },
}

/// FRMR information field (modulo-8 form, AX.25 2.2 §4.3.3.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrmrReport {
    pub w: bool,
    pub x: bool,
    pub y: bool,
    pub z: bool,
    /// C/R bit of the rejected frame.
    pub cr: bool,
    pub vs: u8,
    pub vr: u8,
    /// Control field of the rejected frame.
    pub control: u8,
}

impl FrmrReport {
    pub fn invalid_control(control: u8) -> Self {
        FrmrReport {
            w: true,
            control,
            ..Default::default()
        }
    }

    fn encode(&self) -> [u8; 3] {
        let mut flags = 0u8;
        if self.w {
            flags |= 0x01;
        }
        if self.x {
            flags |= 0x02;
        }
        if self.y {
            flags |= 0x04;
        }
        if self.z {
            flags |= 0x08;
        }
        let mut counters = (self.vr << 5) | (self.vs << 1);
        if self.cr {
            counters |= 0x10;
        }
        [self.control, counters, flags]
    }

    fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() != 3 {
            return Err(FrameError::Truncated);
        }
        Ok(FrmrReport {
            w: data[2] & 0x01 != 0,
            x: data[2] & 0x02 != 0,
            y: data[2] & 0x04 != 0,
            z: data[2] & 0x08 != 0,
            cr: data[1] & 0x10 != 0,
            vs: (data[1] >> 1) & 0x07,
            vr: (data[1] >> 5) & 0x07,
            control: data[0],
        })
    }
}

/// One AX.25 frame as a value.
///
/// `deadline` never appears on the wire. A frame queued for transmission past
/// its deadline is dropped by the interface instead of being sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ax25Frame {
    pub header: FrameHeader,
    pub control: Control,
    pub deadline: Option<SystemTime>,
}

impl Ax25Frame {
    pub fn new(header: FrameHeader, control: Control) -> Self {
        Ax25Frame {
            header,
            control,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Serialise to the KISS data payload form (no flags, no FCS - the TNC
    /// owns the physical layer).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.header.encode(&mut out);
        match &self.control {
            Control::Sabm { poll } => out.push(control_byte(CONTROL_SABM, *poll)),
            Control::Sabme { poll } => out.push(control_byte(CONTROL_SABME, *poll)),
            Control::Disc { poll } => out.push(control_byte(CONTROL_DISC, *poll)),
            Control::Ua { fin } => out.push(control_byte(CONTROL_UA, *fin)),
            Control::Dm { fin } => out.push(control_byte(CONTROL_DM, *fin)),
            Control::Frmr { fin, report } => {
                out.push(control_byte(CONTROL_FRMR, *fin));
                out.extend_from_slice(&report.encode());
            }
            Control::Test { poll, payload } => {
                out.push(control_byte(CONTROL_TEST, *poll));
                out.extend_from_slice(payload);
            }
            Control::Ui { poll, pid, payload } => {
                out.push(control_byte(CONTROL_UI, *poll));
                out.push(*pid);
                out.extend_from_slice(payload);
            }
            Control::Unnumbered { control, payload } => {
                out.push(*control);
                out.extend_from_slice(payload);
            }
            Control::Supervisory { control } => out.push(*control),
            Control::Information {
                control,
                pid,
                payload,
            } => {
                out.push(*control);
                out.push(*pid);
                out.extend_from_slice(payload);
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let (header, offset) = FrameHeader::decode(data)?;
        let control = *data.get(offset).ok_or(FrameError::Truncated)?;
        let rest = &data[offset + 1..];
        let pf = control & PF_BIT != 0;
        let decoded = if control & 0x01 == 0 {
            // I frame
            let pid = *rest.first().ok_or(FrameError::Truncated)?;
            Control::Information {
                control,
                pid,
                payload: rest[1..].to_vec(),
            }
        } else if control & 0x03 == 0x01 {
            Control::Supervisory { control }
        } else {
            match control & !PF_BIT {
                CONTROL_SABM => Control::Sabm { poll: pf },
                CONTROL_SABME => Control::Sabme { poll: pf },
                CONTROL_DISC => Control::Disc { poll: pf },
                CONTROL_UA => Control::Ua { fin: pf },
                CONTROL_DM => Control::Dm { fin: pf },
                CONTROL_FRMR => Control::Frmr {
                    fin: pf,
                    report: FrmrReport::decode(rest)?,
                },
                CONTROL_TEST => Control::Test {
                    poll: pf,
                    payload: rest.to_vec(),
                },
                CONTROL_UI => {
                    let pid = *rest.first().ok_or(FrameError::Truncated)?;
                    Control::Ui {
                        poll: pf,
                        pid,
                        payload: rest[1..].to_vec(),
                    }
                }
                _ => Control::Unnumbered {
                    control,
                    payload: rest.to_vec(),
                },
            }
        };
        Ok(Ax25Frame {
            header,
            control: decoded,
            deadline: None,
        })
    }
}

fn control_byte(base: u8, pf: bool) -> u8 {
    if pf {
        base | PF_BIT
    } else {
        base
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Truncated,
    PathTooLong,
    Address(AddressError),
}

impl From<AddressError> for FrameError {
    fn from(e: AddressError) -> Self {
        FrameError::Address(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FrameHeader {
        FrameHeader {
            destination: Address::parse("VK4MSL").unwrap(),
            source: Address::parse("VK4MSL-1").unwrap(),
            repeaters: Path::new(vec![Address::parse("VK4RZB").unwrap()]).unwrap(),
            command: true,
        }
    }

    #[test]
    fn sabm_roundtrip() {
        let frame = Ax25Frame::new(header(), Control::Sabm { poll: true });
        let encoded = frame.encode();
        // 3 address fields then the control byte
        assert_eq!(encoded.len(), 22);
        assert_eq!(encoded[21], 0x3f);
        assert_eq!(Ax25Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn command_response_bits() {
        let frame = Ax25Frame::new(header(), Control::Ua { fin: true });
        let encoded = frame.encode();
        // command=true: C set on destination, clear on source
        assert_eq!(encoded[6] & 0x80, 0x80);
        assert_eq!(encoded[13] & 0x80, 0x00);
        let decoded = Ax25Frame::decode(&encoded).unwrap();
        assert!(decoded.header.command);

        let mut response = frame.clone();
        response.header.command = false;
        let encoded = response.encode();
        assert_eq!(encoded[6] & 0x80, 0x00);
        assert_eq!(encoded[13] & 0x80, 0x80);
    }

    #[test]
    fn u_frame_controls() {
        for (control, expect) in [
            (Control::Sabme { poll: false }, 0x6f),
            (Control::Disc { poll: true }, 0x53),
            (Control::Dm { fin: false }, 0x0f),
            (
                Control::Test {
                    poll: true,
                    payload: b"ping".to_vec(),
                },
                0xf3,
            ),
        ] {
            let frame = Ax25Frame::new(header(), control);
            let encoded = frame.encode();
            assert_eq!(encoded[21], expect);
            assert_eq!(Ax25Frame::decode(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn frmr_report_roundtrip() {
        let report = FrmrReport {
            w: true,
            x: false,
            y: true,
            z: false,
            cr: true,
            vs: 5,
            vr: 2,
            control: 0xaf,
        };
        let frame = Ax25Frame::new(
            header(),
            Control::Frmr {
                fin: false,
                report,
            },
        );
        let encoded = frame.encode();
        assert_eq!(&encoded[22..], &[0xaf, 0x5a, 0x05]);
        assert_eq!(Ax25Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn ui_roundtrip() {
        let frame = Ax25Frame::new(
            header(),
            Control::Ui {
                poll: false,
                pid: 0xf0,
                payload: b"hello aprs".to_vec(),
            },
        );
        assert_eq!(Ax25Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn numbered_frames_are_opaque() {
        let mut encoded = Ax25Frame::new(header(), Control::Ua { fin: false }).encode();
        let control_at = encoded.len() - 1;
        // RR with N(R)=3, P/F clear
        encoded[control_at] = 0x61;
        let decoded = Ax25Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.control, Control::Supervisory { control: 0x61 });
        // I frame needs a PID and payload
        encoded[control_at] = 0x00;
        encoded.extend_from_slice(&[0xf0, 1, 2, 3]);
        let decoded = Ax25Frame::decode(&encoded).unwrap();
        assert_eq!(
            decoded.control,
            Control::Information {
                control: 0x00,
                pid: 0xf0,
                payload: vec![1, 2, 3],
            }
        );
    }

    #[test]
    fn truncated_frames_rejected() {
        let encoded = Ax25Frame::new(header(), Control::Ua { fin: false }).encode();
        assert_eq!(
            Ax25Frame::decode(&encoded[..10]),
            Err(FrameError::Truncated)
        );
        assert_eq!(
            Ax25Frame::decode(&encoded[..21]),
            Err(FrameError::Truncated)
        );
    }
}
