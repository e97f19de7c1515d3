use super::Ipv4Address;
use crate::protocols::utility::{BytesExt, Checksum};
use std::fmt;
use thiserror::Error as ThisError;

/// The number of `u32` words in a basic IPv4 header
pub const BASE_WORDS: u8 = 5;
/// The number of `u8` bytes in a basic IPv4 header
pub const BASE_OCTETS: u16 = BASE_WORDS as u16 * 4;
/// The largest fragment offset, in 8-byte blocks, that fits beside the flags
const MAX_FRAGMENT_OFFSET: u16 = (1 << 13) - 1;
/// The hop limit on datagrams this stack originates
pub const DEFAULT_TTL: u8 = 64;

/// An IPv4 header, as described in RFC791 p11 s3.1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Header {
    /// Internet Header Length, the number of `u32` words in the IPv4 header
    pub ihl: u8,
    pub type_of_service: u8,
    /// The length of the datagram in bytes, header included
    pub total_length: u16,
    /// Assigned by the sender to aid in assembling fragments
    pub identification: u16,
    /// Where in the datagram this fragment belongs in units of 8 bytes
    pub fragment_offset: u16,
    pub flags: ControlFlags,
    pub time_to_live: u8,
    /// The protocol carried in the data portion of the datagram
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Address,
    pub destination: Ipv4Address,
}

impl Ipv4Header {
    /// Parses a header from a byte iterator. Options are checksummed and
    /// skipped.
    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        use ParseError::HeaderTooShort as HTS;

        let first = bytes.next().ok_or(HTS)?;
        if first >> 4 != 4 {
            Err(ParseError::IncorrectIpv4Version)?
        }
        let ihl = first & 0x0f;
        if ihl < BASE_WORDS {
            Err(ParseError::InvalidHeaderLength(ihl))?
        }
        let type_of_service = bytes.next().ok_or(HTS)?;
        let total_length = bytes.next_u16_be().ok_or(HTS)?;
        let identification = bytes.next_u16_be().ok_or(HTS)?;
        let fragment_word = bytes.next_u16_be().ok_or(HTS)?;
        let time_to_live = bytes.next().ok_or(HTS)?;
        let protocol = bytes.next().ok_or(HTS)?;
        let expected = bytes.next_u16_be().ok_or(HTS)?;
        let source = bytes.next_ipv4addr().ok_or(HTS)?;
        let destination = bytes.next_ipv4addr().ok_or(HTS)?;

        if total_length < ihl as u16 * 4 {
            Err(ParseError::InvalidTotalLength(total_length))?
        }
        if fragment_word & 0x8000 != 0 {
            Err(ParseError::UsedReservedFlag)?
        }

        let mut header = Self {
            ihl,
            type_of_service,
            total_length,
            identification,
            fragment_offset: fragment_word & MAX_FRAGMENT_OFFSET,
            flags: ControlFlags::from((fragment_word >> 13) as u8),
            time_to_live,
            protocol,
            checksum: 0,
            source,
            destination,
        };

        let mut checksum = header.fixed_sum();
        for _ in BASE_WORDS..ihl {
            checksum.add_u32([
                bytes.next().ok_or(HTS)?,
                bytes.next().ok_or(HTS)?,
                bytes.next().ok_or(HTS)?,
                bytes.next().ok_or(HTS)?,
            ]);
        }
        let actual = checksum.as_u16();
        if actual != expected {
            Err(ParseError::Checksum { expected, actual })?
        }
        header.checksum = expected;
        Ok(header)
    }

    /// The header length in bytes.
    pub fn header_length(&self) -> u16 {
        self.ihl as u16 * 4
    }

    /// The payload length in bytes according to the header.
    pub fn payload_length(&self) -> u16 {
        self.total_length.saturating_sub(self.header_length())
    }

    /// The fragment offset in bytes rather than 8-byte blocks.
    pub fn byte_offset(&self) -> usize {
        self.fragment_offset as usize * 8
    }

    /// Whether this datagram is a piece of a larger one.
    pub fn is_fragment(&self) -> bool {
        self.fragment_offset != 0 || !self.flags.is_last_fragment()
    }

    /// Serializes the header with a freshly computed checksum. Options are
    /// never emitted, so the serialized header is always [`BASE_OCTETS`]
    /// long.
    pub fn serialize(&self) -> Vec<u8> {
        let mut basic = *self;
        basic.total_length = self.payload_length() + BASE_OCTETS;
        basic.ihl = BASE_WORDS;
        let checksum = basic.fixed_sum().as_u16();

        let mut out = vec![(4 << 4) | BASE_WORDS, self.type_of_service];
        for half in [
            basic.total_length,
            self.identification,
            basic.fragment_word(),
            u16::from_be_bytes([self.time_to_live, self.protocol]),
            checksum,
        ] {
            out.extend_from_slice(&half.to_be_bytes());
        }
        out.extend_from_slice(&self.source.to_bytes());
        out.extend_from_slice(&self.destination.to_bytes());
        out
    }

    fn fragment_word(&self) -> u16 {
        (self.flags.as_u8() as u16) << 13 | self.fragment_offset & MAX_FRAGMENT_OFFSET
    }

    /// The checksum over every fixed field except the checksum itself
    fn fixed_sum(&self) -> Checksum {
        let mut checksum = Checksum::new();
        checksum.add_u8((4 << 4) | self.ihl, self.type_of_service);
        checksum.add_u16(self.total_length);
        checksum.add_u16(self.identification);
        checksum.add_u16(self.fragment_word());
        checksum.add_u8(self.time_to_live, self.protocol);
        checksum.add_u32(self.source.into());
        checksum.add_u32(self.destination.into());
        checksum
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("The IPv4 header is incomplete")]
    HeaderTooShort,
    #[error("Expected version 4 in IPv4 header")]
    IncorrectIpv4Version,
    #[error("The reserved control flags bit was used")]
    UsedReservedFlag,
    #[error("An IHL of {0} words is shorter than the minimum header")]
    InvalidHeaderLength(u8),
    #[error("A total length of {0} bytes cannot hold the header")]
    InvalidTotalLength(u16),
    #[error(
        "The header checksum {expected:#06x} does not match the calculated checksum {actual:#06x}"
    )]
    Checksum { expected: u16, actual: u16 },
}

/// Starts from an unfragmented datagram of the given payload length and lets
/// the caller adjust the fragmentation fields.
#[derive(Debug)]
pub struct Ipv4HeaderBuilder {
    header: Ipv4Header,
    payload_length: u16,
}

impl Ipv4HeaderBuilder {
    pub fn new(
        source: Ipv4Address,
        destination: Ipv4Address,
        protocol: u8,
        payload_length: u16,
    ) -> Self {
        Self {
            header: Ipv4Header {
                ihl: BASE_WORDS,
                type_of_service: 0,
                total_length: 0,
                identification: 0,
                fragment_offset: 0,
                flags: ControlFlags::default(),
                time_to_live: DEFAULT_TTL,
                protocol,
                checksum: 0,
                source,
                destination,
            },
            payload_length,
        }
    }

    pub fn identification(mut self, identification: u16) -> Self {
        self.header.identification = identification;
        self
    }

    /// Sets the fragment offset in 8-byte blocks
    pub fn fragment_offset(mut self, fragment_offset: u16) -> Self {
        self.header.fragment_offset = fragment_offset;
        self
    }

    pub fn flags(mut self, flags: ControlFlags) -> Self {
        self.header.flags = flags;
        self
    }

    pub fn build(self) -> Result<Ipv4Header, HeaderBuildError> {
        let mut header = self.header;
        header.total_length = self
            .payload_length
            .checked_add(BASE_OCTETS)
            .ok_or(HeaderBuildError::OverlyLongPayload)?;
        if header.fragment_offset > MAX_FRAGMENT_OFFSET {
            Err(HeaderBuildError::OverlyLongFragmentOffset)?
        }
        Ok(header)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBuildError {
    #[error("The payload is longer than is allowed")]
    OverlyLongPayload,
    #[error("The fragment offset is too long to fit control flags in the header")]
    OverlyLongFragmentOffset,
}

/// The don't-fragment and more-fragments bits, stored as they sit in the
/// top of the fragment word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlFlags(u8);

impl ControlFlags {
    const MORE_FRAGMENTS: u8 = 0b01;
    const DONT_FRAGMENT: u8 = 0b10;

    pub const DEFAULT: Self = Self::new(true, true);

    pub const fn new(may_fragment: bool, is_last_fragment: bool) -> Self {
        let mut bits = 0;
        if !may_fragment {
            bits |= Self::DONT_FRAGMENT;
        }
        if !is_last_fragment {
            bits |= Self::MORE_FRAGMENTS;
        }
        Self(bits)
    }

    pub const fn may_fragment(&self) -> bool {
        self.0 & Self::DONT_FRAGMENT == 0
    }

    pub const fn is_last_fragment(&self) -> bool {
        self.0 & Self::MORE_FRAGMENTS == 0
    }

    pub fn set_is_last_fragment(&mut self, value: bool) {
        *self = Self::new(self.may_fragment(), value);
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for ControlFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlFlags")
            .field("may_fragment", &self.may_fragment())
            .field("is_last_fragment", &self.is_last_fragment())
            .finish()
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u8> for ControlFlags {
    fn from(bits: u8) -> Self {
        Self(bits & (Self::MORE_FRAGMENTS | Self::DONT_FRAGMENT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const REMOTE: Ipv4Address = Ipv4Address::new([93, 184, 216, 34]);

    /// An etherparse header for a 13-byte TCP payload with DF set
    fn etherparse_header() -> etherparse::Ipv4Header {
        etherparse::Ipv4Header::new(
            13,
            DEFAULT_TTL,
            etherparse::IpNumber::Tcp,
            LOCAL.to_bytes(),
            REMOTE.to_bytes(),
        )
    }

    fn wire(header: &etherparse::Ipv4Header) -> Vec<u8> {
        let mut out = vec![];
        header.write(&mut out).unwrap();
        out
    }

    #[test]
    fn agrees_with_etherparse() -> anyhow::Result<()> {
        let reference = etherparse_header();
        let bytes = wire(&reference);

        let parsed = Ipv4Header::from_bytes(bytes.iter().cloned())?;
        assert_eq!(parsed.total_length, 33);
        assert_eq!(parsed.flags, ControlFlags::new(false, true));
        assert_eq!(parsed.protocol, 6);
        assert_eq!(parsed.checksum, reference.calc_header_checksum()?);
        assert_eq!((parsed.source, parsed.destination), (LOCAL, REMOTE));
        assert!(!parsed.is_fragment());

        let built = Ipv4HeaderBuilder::new(LOCAL, REMOTE, 6, 13)
            .flags(ControlFlags::new(false, true))
            .build()?;
        assert_eq!(built.serialize(), bytes);
        Ok(())
    }

    #[test]
    fn fragment_fields_survive_serialization() -> anyhow::Result<()> {
        let bytes = Ipv4HeaderBuilder::new(LOCAL, REMOTE, 17, 1480)
            .identification(0xbeef)
            .fragment_offset(185)
            .flags(ControlFlags::new(true, false))
            .build()?
            .serialize();
        let slice = etherparse::Ipv4HeaderSlice::from_slice(&bytes)?;
        assert_eq!(slice.total_len(), 1500);
        assert_eq!(slice.identification(), 0xbeef);
        assert_eq!(slice.fragments_offset(), 185);
        assert!(slice.more_fragments() && !slice.dont_fragment());
        assert_eq!(
            slice.header_checksum(),
            slice.to_header().calc_header_checksum()?
        );

        let parsed = Ipv4Header::from_bytes(bytes.into_iter())?;
        assert!(parsed.is_fragment());
        assert_eq!(parsed.byte_offset(), 1480);
        Ok(())
    }

    #[test]
    fn options_count_toward_the_checksum() -> anyhow::Result<()> {
        let mut reference = etherparse_header();
        reference.set_options(&[1, 1, 1, 0])?;
        let bytes = wire(&reference);
        assert_eq!(bytes.len(), 24);

        let parsed = Ipv4Header::from_bytes(bytes.iter().cloned())?;
        assert_eq!(parsed.header_length(), 24);
        assert_eq!(parsed.payload_length(), 13);

        // Reserializing drops the options but keeps the payload length
        let basic = parsed.serialize();
        assert_eq!(basic.len(), BASE_OCTETS as usize);
        assert_eq!(Ipv4Header::from_bytes(basic.into_iter())?.total_length, 33);
        Ok(())
    }

    #[test]
    fn rejects_malformed_headers() {
        let bytes = wire(&etherparse_header());
        let parse = |bytes: &[u8]| Ipv4Header::from_bytes(bytes.iter().cloned());

        assert_eq!(parse(&bytes[..12]), Err(ParseError::HeaderTooShort));

        let mut damaged = bytes.clone();
        damaged[8] ^= 0xff;
        assert!(matches!(parse(&damaged), Err(ParseError::Checksum { .. })));

        let mut v6 = bytes.clone();
        v6[0] = 0x65;
        assert_eq!(parse(&v6), Err(ParseError::IncorrectIpv4Version));

        let mut short_ihl = bytes.clone();
        short_ihl[0] = 0x44;
        assert_eq!(parse(&short_ihl), Err(ParseError::InvalidHeaderLength(4)));

        let mut evil = bytes;
        evil[6] |= 0x80;
        assert_eq!(parse(&evil), Err(ParseError::UsedReservedFlag));
    }

    #[test]
    fn flags_round_trip_through_bits() {
        let mut flags = ControlFlags::new(false, true);
        flags.set_is_last_fragment(false);
        assert!(!flags.may_fragment() && !flags.is_last_fragment());
        assert_eq!(ControlFlags::from(flags.as_u8() | 0b100), flags);
        assert_eq!(ControlFlags::default(), ControlFlags::new(true, true));
    }
}
