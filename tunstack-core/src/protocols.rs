//! The protocols the stack speaks, each with its header codec.

pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod udp;
pub mod utility;
