use crate::protocols::utility::{BytesExt, Checksum};
use thiserror::Error as ThisError;

/// The number of bytes in an ICMP header
pub const HEADER_OCTETS: usize = 8;

/// An ICMP header. `rest` holds the type-specific word, which for echo
/// messages is the identifier and sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub rest: [u8; 4],
}

impl IcmpHeader {
    pub const fn new(icmp_type: u8, code: u8, rest: [u8; 4]) -> Self {
        Self {
            icmp_type,
            code,
            checksum: 0,
            rest,
        }
    }

    /// Parses the header from an iterator over the whole ICMP message. The
    /// checksum covers the data as well as the header.
    pub fn from_bytes(mut message: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        const HTS: ParseError = ParseError::HeaderTooShort;
        let icmp_type = message.next().ok_or(HTS)?;
        let code = message.next().ok_or(HTS)?;
        let expected = message.next_u16_be().ok_or(HTS)?;
        let mut rest = [0u8; 4];
        for byte in rest.iter_mut() {
            *byte = message.next().ok_or(HTS)?;
        }

        let mut checksum = Checksum::new();
        checksum.add_u8(icmp_type, code);
        checksum.add_u32(rest);
        checksum.accumulate_remainder(message);
        let actual = checksum.as_u16();
        if actual != expected {
            Err(ParseError::Checksum { actual, expected })?
        }

        Ok(Self {
            icmp_type,
            code,
            checksum: expected,
            rest,
        })
    }

    /// Serializes the header with a checksum computed over it and `data`.
    pub fn serialize(&self, data: impl Iterator<Item = u8>) -> Vec<u8> {
        let mut checksum = Checksum::new();
        checksum.add_u8(self.icmp_type, self.code);
        checksum.add_u32(self.rest);
        checksum.accumulate_remainder(data);

        let mut out = Vec::with_capacity(HEADER_OCTETS);
        out.push(self.icmp_type);
        out.push(self.code);
        out.extend_from_slice(&checksum.as_u16().to_be_bytes());
        out.extend_from_slice(&self.rest);
        out
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("Too few bytes to constitute an ICMP header")]
    HeaderTooShort,
    #[error(
        "The computed checksum {actual:#06x} did not match the header checksum {expected:#06x}"
    )]
    Checksum { actual: u16, expected: u16 },
}
