//! The IPv4 codec plus outbound fragmentation and inbound reassembly.

mod ipv4_address;
pub use ipv4_address::{AddressParseError, Ipv4Address};

pub mod ipv4_parsing;
pub use ipv4_parsing::{ControlFlags, HeaderBuildError, Ipv4Header, Ipv4HeaderBuilder};

pub mod fragmentation;
pub use fragmentation::{fragment, FragmentError};

pub mod reassembly;
pub use reassembly::Reassembly;

/// IANA numbers for the protocols the stack dispatches on.
pub mod protocol_number {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}
