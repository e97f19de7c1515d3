//! Stack configuration and the tunnel handshake that produces it.

use crate::protocols::ipv4::{AddressParseError, Ipv4Address};
use std::{str::FromStr, time::Duration};
use thiserror::Error as ThisError;

/// The smallest MTU every IPv4 link must support, per RFC 791
pub const MIN_MTU: u16 = 68;
/// Bytes of each advertised MTU consumed by the tunnel's own framing
pub const DEFAULT_LINK_OVERHEAD: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConfig {
    /// Hold received payloads until a segment with PSH arrives, then deliver
    /// them as one message
    pub buffer_until_push: bool,
    /// How long a tracked segment may go unacknowledged before it is resent
    pub retransmit_interval: Duration,
    /// Resends allowed before a connection is abandoned
    pub max_retries: u8,
    /// The receive window advertised on every segment
    pub window: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            buffer_until_push: false,
            retransmit_interval: Duration::from_secs(1),
            max_retries: 3,
            window: u16::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    /// Our address on the tunnel
    pub local: Ipv4Address,
    /// The tunnel server's address
    pub peer: Ipv4Address,
    /// The largest frame the link carries
    pub mtu: u16,
    pub tcp: TcpConfig,
}

impl StackConfig {
    pub fn new(local: Ipv4Address, peer: Ipv4Address, mtu: u16) -> Self {
        Self {
            local,
            peer,
            mtu,
            tcp: TcpConfig::default(),
        }
    }

    /// The MSS a link of this MTU supports: room for minimal IPv4 and TCP
    /// headers.
    pub fn default_mss(&self) -> u16 {
        self.mtu.saturating_sub(40).max(1)
    }
}

/// The line the tunnel server sends before any frames:
/// `remote|local|mtu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub remote: Ipv4Address,
    pub local: Ipv4Address,
    pub mtu: u16,
}

impl Handshake {
    /// Builds a configuration whose MTU leaves room for `overhead` bytes of
    /// tunnel framing.
    pub fn into_config(self, overhead: u16) -> Result<StackConfig, HandshakeError> {
        let mtu = self.mtu.saturating_sub(overhead);
        if mtu < MIN_MTU {
            Err(HandshakeError::MtuTooSmall(mtu))?
        }
        Ok(StackConfig::new(self.local, self.remote, mtu))
    }
}

impl FromStr for Handshake {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.trim_end_matches(&['\r', '\n'][..]).split('|');
        let mut field = |name| fields.next().ok_or(HandshakeError::MissingField(name));
        let remote = field("remote address")?.parse()?;
        let local = field("local address")?.parse()?;
        let mtu_field = field("mtu")?;
        let mtu = mtu_field
            .trim()
            .parse()
            .map_err(|_| HandshakeError::InvalidMtu(mtu_field.to_string()))?;
        if fields.next().is_some() {
            Err(HandshakeError::TrailingFields)?
        }
        Ok(Self { remote, local, mtu })
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("The handshake has no {0}")]
    MissingField(&'static str),
    #[error("{0}")]
    Address(#[from] AddressParseError),
    #[error("The handshake MTU {0:?} is not a number")]
    InvalidMtu(String),
    #[error("The handshake has more than three fields")]
    TrailingFields,
    #[error("A link MTU of {0} bytes is below the IPv4 minimum")]
    MtuTooSmall(u16),
}
