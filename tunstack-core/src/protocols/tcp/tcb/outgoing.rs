use super::{Segment, Teardown};
use crate::message::Message;
use std::{fmt, time::Instant};

/// Called once with the outcome of a send, close or connect.
pub type Completion = Box<dyn FnOnce(Result<(), Teardown>)>;

/// An entry on the write queue. Entries leave the queue in the order they
/// were added.
pub enum Write {
    Data {
        text: Message,
        push: bool,
        on_result: Option<Completion>,
    },
    Close {
        on_result: Option<Completion>,
    },
}

impl Write {
    pub fn into_completion(self) -> Option<Completion> {
        match self {
            Write::Data { on_result, .. } | Write::Close { on_result } => on_result,
        }
    }
}

impl fmt::Debug for Write {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Write::Data { text, push, .. } => f
                .debug_struct("Data")
                .field("len", &text.len())
                .field("push", push)
                .finish(),
            Write::Close { .. } => f.write_str("Close"),
        }
    }
}

/// What the connection table should do with the frames of a transmitted
/// segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Kept for retransmission until acknowledged
    Tracked,
    /// Kept to answer duplicate segments
    Ack,
    /// Sent once and forgotten
    Plain,
}

/// A segment the connection wants sent.
#[derive(Debug, Clone)]
pub struct Transmit {
    pub segment: Segment,
    pub dont_fragment: bool,
    pub role: Role,
}

/// Work the connection hands to the connection table, in order.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Transmit(Transmit),
    /// Send the cached acknowledgment frames again
    ResendAck,
    /// Send the frames of the tracked segment again
    Retransmit,
}

/// Retransmission bookkeeping for the one tracked segment in flight.
#[derive(Debug, Clone)]
pub struct Retransmit {
    /// Whether the last tracked segment has been acknowledged
    pub idle: bool,
    pub sent_at: Option<Instant>,
    /// Consecutive retransmissions of the current segment
    pub retries: u8,
    pub frames: Vec<Vec<u8>>,
}

impl Retransmit {
    pub fn track(&mut self, now: Instant) {
        self.idle = false;
        self.sent_at = Some(now);
        self.retries = 0;
        self.frames.clear();
    }

    pub fn acknowledged(&mut self) {
        self.idle = true;
        self.sent_at = None;
        self.retries = 0;
        self.frames.clear();
    }
}

impl Default for Retransmit {
    fn default() -> Self {
        Self {
            idle: true,
            sent_at: None,
            retries: 0,
            frames: vec![],
        }
    }
}
