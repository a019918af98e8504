// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MAC address type.

use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// A 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Returns a new MAC address from the given bytes.
    pub const fn new(value: [u8; 6]) -> Self {
        Self(value)
    }

    /// Returns the bytes of the MAC address.
    pub const fn to_bytes(self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(value: [u8; 6]) -> Self {
        Self::new(value)
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Error returned when parsing a [`MacAddress`] fails.
#[derive(Debug, Error)]
#[error("invalid mac address")]
pub struct InvalidMacAddress;

impl FromStr for MacAddress {
    type Err = InvalidMacAddress;

    fn from_str(val: &str) -> Result<Self, InvalidMacAddress> {
        if val.len() != 17 {
            return Err(InvalidMacAddress);
        }
        let sep = val.as_bytes()[2];
        if sep != b':' && sep != b'-' {
            return Err(InvalidMacAddress);
        }
        let mut bytes = [0u8; 6];
        let mut parts = val.split(sep as char);
        for dst in &mut bytes {
            let part = parts.next().ok_or(InvalidMacAddress)?;
            if part.len() != 2 {
                return Err(InvalidMacAddress);
            }
            *dst = u8::from_str_radix(part, 16).map_err(|_| InvalidMacAddress)?;
        }
        if parts.next().is_some() {
            return Err(InvalidMacAddress);
        }
        Ok(MacAddress(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::MacAddress;

    #[test]
    fn parses_both_separators() {
        let mac: MacAddress = "00:16:3e:7a:b0:01".parse().unwrap();
        assert_eq!(mac.to_bytes(), [0x00, 0x16, 0x3e, 0x7a, 0xb0, 0x01]);
        let mac: MacAddress = "00-16-3E-7A-B0-01".parse().unwrap();
        assert_eq!(mac.to_bytes(), [0x00, 0x16, 0x3e, 0x7a, 0xb0, 0x01]);
        assert_eq!(mac.to_string(), "00:16:3e:7a:b0:01");
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "",
            "00:16:3e:7a:b0",
            "00:16:3e:7a:b0:01:02",
            "00.16.3e.7a.b0.01",
            "0016:3e:7a:b0:0102",
            "zz:16:3e:7a:b0:01",
            "00:16:3e:7a:b0:0",
        ] {
            assert!(bad.parse::<MacAddress>().is_err(), "{bad:?}");
        }
    }
}
