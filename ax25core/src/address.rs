use core::fmt;

/// Station callsign, up to 6 ASCII characters.
///
/// Shorter callsigns are padded with trailing spaces, which is also how they
/// appear on the wire. Characters are stored uppercased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Callsign([u8; 6]);

impl Callsign {
    pub fn new(text: &str) -> Result<Self, AddressError> {
        if text.is_empty() || text.len() > 6 {
            return Err(AddressError::CallsignLength(text.len()));
        }
        let mut callsign = [b' '; 6];
        for (i, c) in text.bytes().enumerate() {
            let c = c.to_ascii_uppercase();
            if !(c.is_ascii_uppercase() || c.is_ascii_digit()) {
                return Err(AddressError::InvalidCharacter(c as char));
            }
            callsign[i] = c;
        }
        Ok(Callsign(callsign))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.iter().take_while(|c| **c != b' ') {
            write!(f, "{}", *c as char)?;
        }
        Ok(())
    }
}

/// A single AX.25 address: callsign plus SSID.
///
/// The C/H bit is the "command/response" bit in the destination and source
/// fields, and the "has been repeated" bit in a digipeater field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub callsign: Callsign,
    pub ssid: u8,
    pub ch: bool,
}

impl Address {
    pub fn new(callsign: Callsign, ssid: u8) -> Result<Self, AddressError> {
        if ssid > 15 {
            return Err(AddressError::SsidOutOfRange(ssid));
        }
        Ok(Address {
            callsign,
            ssid,
            ch: false,
        })
    }

    /// Parse a "CALL" or "CALL-SSID" string.
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        match text.split_once('-') {
            Some((call, ssid)) => {
                let ssid = ssid
                    .parse::<u8>()
                    .map_err(|_| AddressError::InvalidSsid)?;
                Address::new(Callsign::new(call)?, ssid)
            }
            None => Address::new(Callsign::new(text)?, 0),
        }
    }

    pub fn with_ch(self, ch: bool) -> Self {
        Address { ch, ..self }
    }

    /// True if callsign and SSID match, ignoring the C/H bit.
    pub fn matches(&self, other: &Address) -> bool {
        self.callsign == other.callsign && self.ssid == other.ssid
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.callsign)
        } else {
            write!(f, "{}-{}", self.callsign, self.ssid)
        }
    }
}

/// Digipeater path, in transmission order. AX.25 permits up to 8 entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path(Vec<Address>);

impl Path {
    pub fn new(repeaters: Vec<Address>) -> Result<Self, AddressError> {
        if repeaters.len() > 8 {
            return Err(AddressError::PathTooLong(repeaters.len()));
        }
        Ok(Path(repeaters))
    }

    pub fn empty() -> Self {
        Path(Vec::new())
    }

    pub fn repeaters(&self) -> &[Address] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, addr) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{addr}")?;
        }
        Ok(())
    }
}

/// Encode one address field. `last` sets the extension bit that terminates
/// the address block.
pub fn encode_address(address: &Address, last: bool) -> [u8; 7] {
    let mut out = [0u8; 7];
    for (i, c) in address.callsign.as_bytes().iter().enumerate() {
        out[i] = c << 1;
    }
    out[6] = 0x60 | (address.ssid << 1);
    if address.ch {
        out[6] |= 0x80;
    }
    if last {
        out[6] |= 0x01;
    }
    out
}

/// Decode one address field. Returns the address and whether the extension
/// bit marked it as the last in the block.
pub fn decode_address(encoded: &[u8; 7]) -> Result<(Address, bool), AddressError> {
    let mut callsign = [b' '; 6];
    for i in 0..6 {
        callsign[i] = encoded[i] >> 1;
    }
    // Trailing spaces are padding; anything else must be a callsign character.
    let mut seen_space = false;
    for c in callsign {
        if c == b' ' {
            seen_space = true;
        } else if seen_space || !(c.is_ascii_uppercase() || c.is_ascii_digit()) {
            return Err(AddressError::InvalidCharacter(c as char));
        }
    }
    let address = Address {
        callsign: Callsign(callsign),
        ssid: (encoded[6] >> 1) & 0x0f,
        ch: encoded[6] & 0x80 != 0,
    };
    Ok((address, encoded[6] & 0x01 != 0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    CallsignLength(usize),
    InvalidCharacter(char),
    InvalidSsid,
    SsidOutOfRange(u8),
    PathTooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callsign_padding_and_case() {
        let call = Callsign::new("vk4msl").unwrap();
        assert_eq!(call.as_bytes(), b"VK4MSL");
        let call = Callsign::new("N0A").unwrap();
        assert_eq!(call.as_bytes(), b"N0A   ");
        assert_eq!(format!("{call}"), "N0A");
    }

    #[test]
    fn callsign_rejects_invalid() {
        assert!(Callsign::new("").is_err());
        assert!(Callsign::new("TOOLONG").is_err());
        assert!(Callsign::new("AB-C").is_err());
    }

    #[test]
    fn address_parse() {
        let addr = Address::parse("VK4MSL-10").unwrap();
        assert_eq!(format!("{addr}"), "VK4MSL-10");
        let addr = Address::parse("VK4MSL").unwrap();
        assert_eq!(addr.ssid, 0);
        assert!(Address::parse("VK4MSL-16").is_err());
    }

    #[test]
    fn address_roundtrip() {
        let addr = Address::parse("AB1CD-5").unwrap().with_ch(true);
        let encoded = encode_address(&addr, true);
        let (decoded, last) = decode_address(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert!(last);
    }

    #[test]
    fn address_encode_shifts() {
        let addr = Address::parse("N0CALL").unwrap();
        let encoded = encode_address(&addr, false);
        assert_eq!(
            encoded,
            [b'N' << 1, b'0' << 1, b'C' << 1, b'A' << 1, b'L' << 1, b'L' << 1, 0x60]
        );
    }

    #[test]
    fn path_limits() {
        let addr = Address::parse("VK4RZB").unwrap();
        assert!(Path::new(vec![addr; 8]).is_ok());
        assert!(Path::new(vec![addr; 9]).is_err());
    }
}
