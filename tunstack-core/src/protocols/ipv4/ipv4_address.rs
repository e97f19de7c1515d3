use std::{
    fmt::{self, Display},
    str::FromStr,
};
use thiserror::Error as ThisError;

/// An IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    /// The address `0.0.0.0`.
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);

    pub const fn new(address: [u8; 4]) -> Self {
        Self(address)
    }

    pub fn to_u32(self) -> u32 {
        self.into()
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0
    }
}

impl Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl FromStr for Ipv4Address {
    type Err = AddressParseError;

    /// Parses dotted-quad notation such as `10.0.0.1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 4];
        let mut parts = s.trim().split('.');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| AddressParseError(s.to_string()))?;
            *octet = part
                .parse()
                .map_err(|_| AddressParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            Err(AddressParseError(s.to_string()))?
        }
        Ok(Self(octets))
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
#[error("Not a dotted-quad IPv4 address: {0:?}")]
pub struct AddressParseError(pub String);

impl From<u32> for Ipv4Address {
    fn from(n: u32) -> Self {
        Self(n.to_be_bytes())
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(n: [u8; 4]) -> Self {
        Self(n)
    }
}

impl From<Ipv4Address> for u32 {
    fn from(address: Ipv4Address) -> Self {
        u32::from_be_bytes(address.0)
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_quad() {
        let address: Ipv4Address = "192.168.7.254".parse().unwrap();
        assert_eq!(address, Ipv4Address::new([192, 168, 7, 254]));
        assert_eq!(address.to_string(), "192.168.7.254");
        assert_eq!(address.to_u32(), 0xc0a8_07fe);
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "10.0.0", "10.0.0.1.5", "10.0.0.256", "a.b.c.d"] {
            assert!(bad.parse::<Ipv4Address>().is_err(), "{bad}");
        }
    }
}
