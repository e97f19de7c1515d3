//! Structured events for the notable things that happen inside the stack.
//!
//! These are thin wrappers around `tracing::event!` so every emitter records
//! the same fields under the same target. Installing a subscriber is left to
//! the binary.

use crate::protocols::{ipv4::Ipv4Address, tcp::ConnectionId, tcp::tcb::State};
use std::fmt::Display;
use tracing::{event, Level};

/// A TCP connection moved between states.
pub fn state_event(id: &ConnectionId, from: State, to: State) {
    event!(
        target: "TCP",
        Level::DEBUG,
        local_port = id.local.port,
        remote = %id.remote,
        from = ?from,
        to = ?to,
        "state change"
    );
}

/// A tracked TCP segment was sent again.
pub fn retransmit_event(id: &ConnectionId, attempt: u8) {
    event!(
        target: "TCP",
        Level::INFO,
        local_port = id.local.port,
        remote = %id.remote,
        attempt,
        "retransmit"
    );
}

/// An inbound frame was discarded.
pub fn dropped_frame_event(source: Option<Ipv4Address>, reason: &dyn Display) {
    match source {
        Some(source) => event!(target: "LINK", Level::DEBUG, source = %source, reason = %reason, "dropped frame"),
        None => event!(target: "LINK", Level::DEBUG, reason = %reason, "dropped frame"),
    }
}
