use crate::protocols::{
    ipv4::{protocol_number, Ipv4Address},
    utility::Checksum,
};
use std::{fmt, ops::BitOr};
use thiserror::Error as ThisError;

/// The number of 32-bit words in a TCP header without options
const BASE_HEADER_WORDS: u8 = 5;
/// The number of bytes in a TCP header without options
pub const BASE_HEADER_OCTETS: u8 = BASE_HEADER_WORDS * 4;
/// Where the checksum sits in the fixed header
const CHECKSUM_AT: usize = 16;

const OPTION_END: u8 = 0;
const OPTION_NOP: u8 = 1;
const OPTION_MSS: u8 = 2;
const OPTION_MSS_LEN: u8 = 4;

/// The data for a TCP header
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// The sequence number of the first data octet in this segment, or the
    /// initial sequence number if SYN is present.
    pub seq: u32,
    /// The next sequence number the sender expects to receive when ACK is set
    pub ack: u32,
    /// The number of 32-bit words in the TCP header
    pub data_offset: u8,
    pub ctl: Control,
    /// The number of octets the sender is willing to accept
    pub wnd: u16,
    pub urg: u16,
    pub checksum: u16,
    /// The maximum segment size option, the only option this stack reads or
    /// writes
    pub mss: Option<u16>,
}

impl TcpHeader {
    /// Parses a TCP header. `segment` must yield the whole segment, payload
    /// included, since the checksum covers all of it.
    pub fn from_bytes(
        mut segment: impl Iterator<Item = u8>,
        segment_len: usize,
        source: Ipv4Address,
        destination: Ipv4Address,
    ) -> Result<Self, ParseError> {
        let mut fixed = [0u8; BASE_HEADER_OCTETS as usize];
        for byte in fixed.iter_mut() {
            *byte = segment.next().ok_or(ParseError::HeaderTooShort)?;
        }
        let half = |at: usize| u16::from_be_bytes([fixed[at], fixed[at + 1]]);
        let word = |at: usize| (half(at) as u32) << 16 | half(at + 2) as u32;

        let data_offset = fixed[12] >> 4;
        let header_len = data_offset as usize * 4;
        if data_offset < BASE_HEADER_WORDS || header_len > segment_len {
            Err(ParseError::InvalidDataOffset(data_offset))?
        }
        let options: Vec<u8> = segment
            .by_ref()
            .take(header_len - fixed.len())
            .collect();
        if options.len() + fixed.len() < header_len {
            Err(ParseError::HeaderTooShort)?
        }
        let mss = parse_mss(&options)?;

        let length: u16 = segment_len
            .try_into()
            .map_err(|_| ParseError::PacketTooLong)?;
        let mut checksum = Checksum::new();
        checksum.accumulate_remainder(
            fixed[..CHECKSUM_AT]
                .iter()
                .chain(&fixed[CHECKSUM_AT + 2..])
                .chain(&options)
                .cloned(),
        );
        checksum.accumulate_remainder(segment);
        checksum.add_pseudo_header(source, destination, protocol_number::TCP, length);

        let expected = half(CHECKSUM_AT);
        let actual = checksum.as_u16();
        if actual != expected {
            Err(ParseError::Checksum { actual, expected })?
        }

        Ok(Self {
            src_port: half(0),
            dst_port: half(2),
            seq: word(4),
            ack: word(8),
            data_offset,
            ctl: Control::from(fixed[13]),
            wnd: half(14),
            urg: half(18),
            checksum: expected,
            mss,
        })
    }

    /// Size of the header in bytes
    pub fn bytes(&self) -> u8 {
        self.data_offset * 4
    }

    /// The header in wire format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0; BASE_HEADER_OCTETS as usize];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = self.data_offset << 4;
        out[13] = self.ctl.into();
        out[14..16].copy_from_slice(&self.wnd.to_be_bytes());
        out[CHECKSUM_AT..CHECKSUM_AT + 2].copy_from_slice(&self.checksum.to_be_bytes());
        out[18..20].copy_from_slice(&self.urg.to_be_bytes());
        if let Some(mss) = self.mss {
            out.extend_from_slice(&mss_option(mss));
        }
        out
    }
}

fn mss_option(mss: u16) -> [u8; 4] {
    let [high, low] = mss.to_be_bytes();
    [OPTION_MSS, OPTION_MSS_LEN, high, low]
}

/// Walks the option list and returns the MSS value if one is present.
fn parse_mss(options: &[u8]) -> Result<Option<u16>, ParseError> {
    let mut mss = None;
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            OPTION_END => break,
            OPTION_NOP => i += 1,
            kind => {
                let len = *options.get(i + 1).ok_or(ParseError::MalformedOption(kind))? as usize;
                if len < 2 || i + len > options.len() {
                    Err(ParseError::MalformedOption(kind))?
                }
                if kind == OPTION_MSS {
                    if len != OPTION_MSS_LEN as usize {
                        Err(ParseError::MalformedOption(kind))?
                    }
                    mss = Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
                }
                i += len;
            }
        }
    }
    Ok(mss)
}

#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("Too few bytes to constitute a TCP header")]
    HeaderTooShort,
    #[error("The segment is longer than an IPv4 packet allows")]
    PacketTooLong,
    #[error(
        "The computed checksum {actual:#06x} did not match the header checksum {expected:#06x}"
    )]
    Checksum { actual: u16, expected: u16 },
    #[error("A data offset of {0} words does not fit the segment")]
    InvalidDataOffset(u8),
    #[error("Option kind {0} has an invalid length")]
    MalformedOption(u8),
}

/// Assembles a header field by field. [`TcpHeaderBuilder::build`] fills in
/// the data offset and checksum.
#[derive(Debug)]
pub struct TcpHeaderBuilder(TcpHeader);

impl TcpHeaderBuilder {
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self(TcpHeader {
            src_port,
            dst_port,
            seq,
            ack: 0,
            data_offset: BASE_HEADER_WORDS,
            ctl: Control::default(),
            wnd: 0,
            urg: 0,
            checksum: 0,
            mss: None,
        })
    }

    pub fn wnd(mut self, wnd: u16) -> Self {
        self.0.wnd = wnd;
        self
    }

    /// Sets the acknowledgment number along with the ACK flag
    pub fn ack(mut self, ack: u32) -> Self {
        self.0.ack = ack;
        self.0.ctl.insert(Control::ACK);
        self
    }

    pub fn psh(mut self) -> Self {
        self.0.ctl.insert(Control::PSH);
        self
    }

    pub fn rst(mut self) -> Self {
        self.0.ctl.insert(Control::RST);
        self
    }

    pub fn syn(mut self) -> Self {
        self.0.ctl.insert(Control::SYN);
        self
    }

    pub fn fin(mut self) -> Self {
        self.0.ctl.insert(Control::FIN);
        self
    }

    /// Attaches a maximum segment size option
    pub fn mss(mut self, mss: u16) -> Self {
        self.0.mss = Some(mss);
        self
    }

    /// Completes the header for a segment carrying `text` between the given
    /// addresses.
    pub fn build(
        self,
        source: Ipv4Address,
        destination: Ipv4Address,
        text: impl Iterator<Item = u8>,
        text_len: usize,
    ) -> Result<TcpHeader, BuildHeaderError> {
        let mut header = self.0;
        header.data_offset = BASE_HEADER_WORDS + header.mss.is_some() as u8;
        header.checksum = 0;
        let length: u16 = (text_len + header.bytes() as usize)
            .try_into()
            .map_err(|_| BuildHeaderError::OverlyLongPayload)?;

        let mut checksum = Checksum::new();
        checksum.accumulate_remainder(header.serialize().into_iter());
        checksum.accumulate_remainder(text);
        checksum.add_pseudo_header(source, destination, protocol_number::TCP, length);
        header.checksum = checksum.as_u16();
        Ok(header)
    }
}

#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum BuildHeaderError {
    #[error("The segment would be longer than an IPv4 packet allows")]
    OverlyLongPayload,
}

/// The set of control flags on a segment.
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Control(u8);

impl Control {
    pub const FIN: Self = Self(1);
    pub const SYN: Self = Self(1 << 1);
    pub const RST: Self = Self(1 << 2);
    pub const PSH: Self = Self(1 << 3);
    pub const ACK: Self = Self(1 << 4);
    pub const URG: Self = Self(1 << 5);

    const NAMED: [(Self, &'static str); 6] = [
        (Self::URG, "URG"),
        (Self::ACK, "ACK"),
        (Self::PSH, "PSH"),
        (Self::RST, "RST"),
        (Self::SYN, "SYN"),
        (Self::FIN, "FIN"),
    ];

    /// Whether every flag in `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn urg(self) -> bool {
        self.contains(Self::URG)
    }

    pub const fn ack(self) -> bool {
        self.contains(Self::ACK)
    }

    pub const fn psh(self) -> bool {
        self.contains(Self::PSH)
    }

    pub const fn rst(self) -> bool {
        self.contains(Self::RST)
    }

    pub const fn syn(self) -> bool {
        self.contains(Self::SYN)
    }

    pub const fn fin(self) -> bool {
        self.contains(Self::FIN)
    }
}

impl BitOr for Control {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Keeps the six flag bits and drops the reserved ones.
impl From<u8> for Control {
    fn from(n: u8) -> Self {
        Self(n & 0b11_1111)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<_> = Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Control({})", set.join(", "))
    }
}
