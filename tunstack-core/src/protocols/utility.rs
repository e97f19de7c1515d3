//! Helpers shared by the header codecs.

use super::ipv4::Ipv4Address;
use std::fmt::{self, Display};

/// The ones' complement sum used by the IPv4, TCP, UDP and ICMP checksums.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(u32);

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_u16(&mut self, value: u16) {
        self.0 += value as u32;
        self.fold();
    }

    /// Adds the `u16` formed by two big-endian bytes.
    pub fn add_u8(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    /// Adds both halves of a four byte value.
    pub fn add_u32(&mut self, value: [u8; 4]) {
        self.add_u8(value[0], value[1]);
        self.add_u8(value[2], value[3]);
    }

    /// Adds the rest of a byte stream two bytes at a time, padding an odd
    /// trailing byte with zero.
    pub fn accumulate_remainder(&mut self, mut bytes: impl Iterator<Item = u8>) {
        while let Some(a) = bytes.next() {
            self.add_u8(a, bytes.next().unwrap_or(0));
        }
    }

    /// Adds the pseudo header that TCP and UDP prepend to their checksums.
    pub fn add_pseudo_header(
        &mut self,
        source: Ipv4Address,
        destination: Ipv4Address,
        protocol: u8,
        length: u16,
    ) {
        self.add_u32(source.into());
        self.add_u32(destination.into());
        self.add_u8(0, protocol);
        self.add_u16(length);
    }

    fn fold(&mut self) {
        while self.0 > 0xffff {
            self.0 = (self.0 & 0xffff) + (self.0 >> 16);
        }
    }

    /// The final checksum, the complement of the folded sum.
    pub fn as_u16(&self) -> u16 {
        !(self.0 as u16)
    }
}

/// An address and port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub address: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Address, port: u16) -> Self {
        Self { address, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Reads fixed-width big-endian values off a byte iterator.
pub trait BytesExt: Iterator<Item = u8> {
    fn next_u16_be(&mut self) -> Option<u16> {
        Some(u16::from_be_bytes([self.next()?, self.next()?]))
    }

    fn next_u32_be(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes([
            self.next()?,
            self.next()?,
            self.next()?,
            self.next()?,
        ]))
    }

    fn next_ipv4addr(&mut self) -> Option<Ipv4Address> {
        self.next_u32_be().map(Ipv4Address::from)
    }
}

impl<T: Iterator<Item = u8>> BytesExt for T {}
