//! A user-space IPv4 stack for terminating a tunneled link.
//!
//! The stack speaks TCP, UDP and ICMP echo over a link that carries raw IPv4
//! frames. It never touches a socket or a clock itself: whoever owns the
//! [`Stack`] feeds it inbound frames with [`Stack::on_frame`], advances time
//! with [`Stack::tick`] and collects outbound frames with
//! [`Stack::take_frames`].
//!
//! # Organization
//! - [`Message`] holds packet bytes as headers are added and removed
//! - [`protocols`] contains each protocol with its header codec
//! - [`Link`](link::Link) fragments and queues outbound datagrams
//! - [`Stack`] owns every table and dispatches inbound frames
//!
//! TCP here is deliberately simple: each connection keeps a single segment
//! in flight and retransmits it on a fixed interval.

pub mod config;
pub use config::{Handshake, StackConfig, TcpConfig};

pub mod link;
pub mod logging;

pub mod message;
pub use message::Message;

pub mod protocols;

pub mod stack;
pub use stack::{DemuxError, Stack};
