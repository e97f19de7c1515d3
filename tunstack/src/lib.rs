//! Runs a [`tunstack_core::Stack`] over a tunnel connection.
//!
//! [`tunnel::run`] performs the handshake and then shuttles length-prefixed
//! frames between the tunnel and the stack. [`cli`] wires it to the command
//! line.

pub mod cli;
pub mod tunnel;
