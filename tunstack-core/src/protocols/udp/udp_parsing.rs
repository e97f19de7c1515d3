use crate::protocols::{
    ipv4::{protocol_number, Ipv4Address},
    utility::{BytesExt, Checksum},
};
use thiserror::Error as ThisError;

/// The number of bytes in a UDP header
pub const HEADER_OCTETS: u16 = 8;

/// A parsed UDP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub source: u16,
    pub destination: u16,
    /// The length of the UDP packet in bytes, including the header
    pub length: u16,
    /// The checksum, zero if the sender did not compute one
    pub checksum: u16,
}

impl UdpHeader {
    /// Parses a UDP header from an iterator over the whole packet. The
    /// checksum is verified unless the sender left it zero.
    pub fn from_bytes_ipv4(
        mut packet: impl Iterator<Item = u8>,
        packet_len: usize,
        source_address: Ipv4Address,
        destination_address: Ipv4Address,
    ) -> Result<Self, ParseError> {
        use ParseError::HeaderTooShort as HTS;

        let header = Self {
            source: packet.next_u16_be().ok_or(HTS)?,
            destination: packet.next_u16_be().ok_or(HTS)?,
            length: packet.next_u16_be().ok_or(HTS)?,
            checksum: packet.next_u16_be().ok_or(HTS)?,
        };
        if header.length as usize != packet_len {
            Err(ParseError::LengthMismatch {
                header: header.length,
                actual: packet_len,
            })?
        }
        if header.checksum == 0 {
            return Ok(header);
        }

        let actual = header.compute_checksum(packet, source_address, destination_address);
        if actual != header.checksum {
            Err(ParseError::Checksum {
                actual,
                expected: header.checksum,
            })?
        }
        Ok(header)
    }

    /// Sums the header, `text` and the pseudo header. A result of zero is
    /// reported as all ones since zero on the wire means no checksum.
    fn compute_checksum(
        &self,
        text: impl Iterator<Item = u8>,
        source_address: Ipv4Address,
        destination_address: Ipv4Address,
    ) -> u16 {
        let mut checksum = Checksum::new();
        checksum.add_u16(self.source);
        checksum.add_u16(self.destination);
        checksum.add_u16(self.length);
        checksum.accumulate_remainder(text);
        checksum.add_pseudo_header(
            source_address,
            destination_address,
            protocol_number::UDP,
            self.length,
        );
        match checksum.as_u16() {
            0 => 0xffff,
            sum => sum,
        }
    }

    /// The header in wire format
    pub fn serialize(&self) -> Vec<u8> {
        [self.source, self.destination, self.length, self.checksum]
            .iter()
            .flat_map(|half| half.to_be_bytes())
            .collect()
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("Too few bytes to constitute a UDP header")]
    HeaderTooShort,
    #[error(
        "The computed checksum {actual:#06x} did not match the header checksum {expected:#06x}"
    )]
    Checksum { actual: u16, expected: u16 },
    #[error("The header length {header} differs from the {actual} bytes received")]
    LengthMismatch { header: u16, actual: usize },
}

/// Creates a serialized UDP packet header with the values provided
pub fn build_udp_header(
    source_address: Ipv4Address,
    source_port: u16,
    destination_address: Ipv4Address,
    destination_port: u16,
    text: impl Iterator<Item = u8>,
    text_len: usize,
) -> Result<Vec<u8>, BuildHeaderError> {
    let mut header = UdpHeader {
        source: source_port,
        destination: destination_port,
        length: (text_len + HEADER_OCTETS as usize)
            .try_into()
            .map_err(|_| BuildHeaderError::OverlyLongPayload)?,
        checksum: 0,
    };
    header.checksum = header.compute_checksum(text, source_address, destination_address);
    Ok(header.serialize())
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum BuildHeaderError {
    #[error("The UDP payload is longer than can fit into a single packet")]
    OverlyLongPayload,
}
