//! The per-connection TCP state machine.
//!
//! A [`Tcb`] never touches the link. Segments it wants sent are placed on an
//! outbox as [`Outgoing`] entries, which the connection table drains after
//! every call and turns into frames. At most one tracked segment (SYN, data or
//! FIN) is unacknowledged at a time; everything else waits on the write queue.

use super::{
    tcp_parsing::{Control, TcpHeader, TcpHeaderBuilder},
    ConnectionId, TcpHandler,
};
use crate::{config::TcpConfig, logging, message::Message};
use rustc_hash::FxHashMap;
use std::{collections::VecDeque, fmt, time::Instant};
use thiserror::Error as ThisError;

mod modular_cmp;
use modular_cmp::mod_leq;

mod outgoing;
pub use outgoing::{Completion, Outgoing, Retransmit, Role, Transmit, Write};

mod segment;
pub use segment::Segment;

mod state;
pub use state::State;


/// Why a connection was torn down, as reported to pending callbacks.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    #[error("The remote host reset the connection")]
    Reset,
    #[error("The connection was killed locally")]
    Killed,
    #[error("The remote host stopped acknowledging segments")]
    RetryExhausted,
    #[error("The remote host violated the protocol")]
    Violation,
    #[error("The connection closed before the operation completed")]
    Closed,
}

/// A segment that the state machine refuses to process. The connection is
/// reset when one of these is returned.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("Unexpected SYN in state {0:?}")]
    UnexpectedSyn(State),
    #[error("Expected a SYN before any other segment")]
    ExpectedSyn,
    #[error("Invalid sequence number {actual}, expected {expected}")]
    InvalidSequence { expected: u32, actual: u32 },
    #[error("Wrong acknowledgment number {actual}, expected {expected}")]
    WrongAck { expected: u32, actual: u32 },
}

/// The transmission control block for one connection.
pub struct Tcb {
    id: ConnectionId,
    state: State,
    config: TcpConfig,
    /// Initial send sequence number
    iss: u32,
    /// Next sequence number to send
    snd_nxt: u32,
    /// Next sequence number expected from the remote, known once its SYN
    /// arrives
    rcv_nxt: Option<u32>,
    /// Largest text this side puts in one segment
    mss: u16,
    /// The link's own limit on `mss`
    link_mss: u16,
    /// Sequence number of the last accepted data segment. Anything at or
    /// before it is a duplicate.
    last_consumed: Option<u32>,
    /// Frames of the most recent data acknowledgment
    last_ack: Vec<Vec<u8>>,
    queue: VecDeque<Write>,
    /// Callbacks keyed by the acknowledgment number that completes them
    on_ack: FxHashMap<u32, Vec<Completion>>,
    retransmit: Retransmit,
    on_connect: Option<Completion>,
    handler: TcpHandler,
    /// Payload held back until a PSH segment arrives
    buffered: Message,
    outbox: Vec<Outgoing>,
}

impl Tcb {
    fn new(
        id: ConnectionId,
        state: State,
        iss: u32,
        mss: u16,
        config: TcpConfig,
        handler: TcpHandler,
    ) -> Self {
        let mss = mss.max(1);
        Self {
            id,
            state,
            config,
            iss,
            snd_nxt: iss,
            rcv_nxt: None,
            mss,
            link_mss: mss,
            last_consumed: None,
            last_ack: vec![],
            queue: VecDeque::new(),
            on_ack: FxHashMap::default(),
            retransmit: Retransmit::default(),
            on_connect: None,
            handler,
            buffered: Message::default(),
            outbox: vec![],
        }
    }

    /// Starts an active open by sending a SYN that advertises `mss`.
    pub fn open(
        id: ConnectionId,
        iss: u32,
        mss: u16,
        config: TcpConfig,
        handler: TcpHandler,
        on_connect: Option<Completion>,
        now: Instant,
    ) -> Self {
        let mut tcb = Self::new(id, State::SynSent, iss, mss, config, handler);
        tcb.on_connect = on_connect;
        logging::state_event(&id, State::Closed, State::SynSent);
        tcb.send_syn(now);
        tcb
    }

    /// Creates the connection for a SYN that arrived on a listening port. The
    /// SYN itself must then be passed to [`Tcb::segment_arrives`].
    pub fn accept(
        id: ConnectionId,
        iss: u32,
        mss: u16,
        config: TcpConfig,
        handler: TcpHandler,
    ) -> Self {
        logging::state_event(&id, State::Closed, State::SynReceived);
        Self::new(id, State::SynReceived, iss, mss, config, handler)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn handler(&self) -> TcpHandler {
        self.handler.clone()
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }

    /// Whether nothing tracked is waiting for an acknowledgment
    pub fn is_idle(&self) -> bool {
        self.retransmit.idle
    }

    /// The number of entries waiting on the write queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Removes and returns everything the connection wants done on the link.
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Stores the frames produced for a transmitted segment so they can be
    /// replayed byte for byte.
    pub fn record_frames(&mut self, role: Role, frames: Vec<Vec<u8>>) {
        match role {
            Role::Tracked => self.retransmit.frames = frames,
            Role::Ack => self.last_ack = frames,
            Role::Plain => {}
        }
    }

    pub fn cached_ack(&self) -> &[Vec<u8>] {
        &self.last_ack
    }

    pub fn retransmit_frames(&self) -> &[Vec<u8>] {
        &self.retransmit.frames
    }

    /// Processes an arriving segment and returns any payload that is ready
    /// for the application.
    pub fn segment_arrives(
        &mut self,
        seg: Segment,
        now: Instant,
    ) -> Result<Option<Message>, Violation> {
        if self.state == State::Closed {
            self.send_rst();
            return Ok(None);
        }

        let Segment { header, text } = seg;

        if let Some(marker) = self.last_consumed {
            if mod_leq(header.seq, marker) {
                self.outbox.push(Outgoing::ResendAck);
                return Ok(None);
            }
        }

        let mut delivered = None;
        if header.ctl.syn() {
            match self.state {
                State::SynSent | State::SynReceived => {}
                state => Err(Violation::UnexpectedSyn(state))?,
            }
            self.rcv_nxt = Some(header.seq.wrapping_add(1));
            self.adopt_mss(&header);
            if self.state == State::SynReceived {
                self.send_syn(now);
            } else {
                self.send_ack(Role::Plain);
            }
            self.set_state(State::Established);
            if let Some(on_connect) = self.on_connect.take() {
                on_connect(Ok(()));
            }
        } else {
            let expected = self.rcv_nxt.ok_or(Violation::ExpectedSyn)?;
            if header.seq != expected {
                Err(Violation::InvalidSequence {
                    expected,
                    actual: header.seq,
                })?
            }

            if header.ctl.rst() {
                self.delete(Teardown::Reset);
                return Ok(None);
            }

            if !text.is_empty() {
                self.last_consumed = Some(expected);
                self.rcv_nxt = Some(expected.wrapping_add(text.len() as u32));
                self.send_ack(Role::Ack);
                delivered = self.deliver(text, header.ctl.psh());
            } else if header.ctl != Control::ACK {
                self.rcv_nxt = Some(expected.wrapping_add(1));
            }
            self.adopt_mss(&header);
        }

        if header.ctl.ack() {
            let expected = self.snd_nxt;
            if header.ack != expected {
                Err(Violation::WrongAck {
                    expected,
                    actual: header.ack,
                })?
            }
            for callback in self.on_ack.remove(&header.ack).into_iter().flatten() {
                callback(Ok(()));
            }
            self.retransmit.acknowledged();
            match self.state {
                State::Closing | State::LastAck => {
                    self.delete(Teardown::Closed);
                    return Ok(delivered);
                }
                State::FinWait1 => self.set_state(State::FinWait2),
                State::Established => self.advance(now),
                _ => {}
            }
        }

        if header.ctl.fin() {
            match self.state {
                State::FinWait1 | State::FinWait2 => {
                    self.send_ack(Role::Plain);
                    if header.ctl.ack() {
                        self.delete(Teardown::Closed);
                    } else {
                        self.set_state(State::Closing);
                    }
                }
                State::Closing | State::LastAck => {
                    self.send_ack(Role::Plain);
                    self.delete(Teardown::Closed);
                }
                _ => {
                    let header = self.header_builder(self.snd_nxt).fin();
                    self.emit(header, Message::default(), true, Role::Tracked, now);
                    self.snd_nxt = self.snd_nxt.wrapping_add(1);
                    self.set_state(State::LastAck);
                }
            }
        }

        Ok(delivered)
    }

    /// Queues `text` for delivery in segments of at most one MSS. Only the
    /// last segment carries PSH and completes `on_result`.
    pub fn send(&mut self, mut text: Message, on_result: Option<Completion>, now: Instant) {
        if text.is_empty() {
            if let Some(on_result) = on_result {
                on_result(Ok(()));
            }
            return;
        }

        let ready = self.is_ready();
        while !text.is_empty() {
            let chunk = text.cut(text.len().min(self.mss as usize));
            self.queue.push_back(Write::Data {
                text: chunk,
                push: false,
                on_result: None,
            });
        }
        if let Some(Write::Data {
            push,
            on_result: last_result,
            ..
        }) = self.queue.back_mut()
        {
            *push = true;
            *last_result = on_result;
        }
        if ready {
            self.advance(now);
        }
    }

    /// Sends a FIN once everything queued before it has been acknowledged.
    pub fn close(&mut self, on_result: Option<Completion>, now: Instant) {
        if self.is_ready() {
            self.send_fin(on_result, now);
        } else {
            self.queue.push_back(Write::Close { on_result });
        }
    }

    /// Sends a RST and deletes the connection.
    pub fn kill(&mut self, reason: Teardown) {
        self.send_rst();
        self.delete(reason);
    }

    /// Retransmits the tracked segment once per interval and abandons the
    /// connection once the retries are used up.
    pub fn tick(&mut self, now: Instant) {
        if self.state == State::Closed || self.retransmit.idle {
            return;
        }
        let Some(sent_at) = self.retransmit.sent_at else {
            return;
        };
        if now.saturating_duration_since(sent_at) < self.config.retransmit_interval {
            return;
        }
        if self.retransmit.retries >= self.config.max_retries {
            tracing::warn!("Abandoning {} after {} retries", self.id, self.retransmit.retries);
            self.kill(Teardown::RetryExhausted);
            return;
        }
        self.retransmit.retries += 1;
        self.retransmit.sent_at = Some(now);
        logging::retransmit_event(&self.id, self.retransmit.retries);
        self.outbox.push(Outgoing::Retransmit);
    }

    /// Moves to `Closed` and fails every callback still waiting.
    pub fn delete(&mut self, reason: Teardown) {
        self.set_state(State::Closed);
        self.retransmit.acknowledged();
        self.buffered = Message::default();
        let queued = std::mem::take(&mut self.queue);
        let pending = std::mem::take(&mut self.on_ack);
        let on_connect = self.on_connect.take();
        let callbacks = queued
            .into_iter()
            .filter_map(Write::into_completion)
            .chain(pending.into_values().flatten())
            .chain(on_connect);
        for callback in callbacks {
            callback(Err(reason));
        }
    }

    fn is_ready(&self) -> bool {
        self.retransmit.idle && self.state == State::Established && self.queue.is_empty()
    }

    /// Transmits the next entry on the write queue.
    fn advance(&mut self, now: Instant) {
        match self.queue.pop_front() {
            Some(Write::Data {
                text,
                push,
                on_result,
            }) => {
                let mut header = self.header_builder(self.snd_nxt);
                if push {
                    header = header.psh();
                }
                let len = text.len() as u32;
                self.emit(header, text, false, Role::Tracked, now);
                self.snd_nxt = self.snd_nxt.wrapping_add(len);
                self.register(on_result);
            }
            Some(Write::Close { on_result }) => self.send_fin(on_result, now),
            None => {}
        }
    }

    fn send_syn(&mut self, now: Instant) {
        let header = self.header_builder(self.iss).syn().mss(self.link_mss);
        self.emit(header, Message::default(), true, Role::Tracked, now);
        self.snd_nxt = self.iss.wrapping_add(1);
    }

    fn send_fin(&mut self, on_result: Option<Completion>, now: Instant) {
        let header = self.header_builder(self.snd_nxt).fin();
        self.emit(header, Message::default(), true, Role::Tracked, now);
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.set_state(State::FinWait1);
        self.register(on_result);
    }

    fn send_ack(&mut self, role: Role) {
        let header = self.header_builder(self.snd_nxt);
        self.push_segment(header, Message::default(), true, role);
    }

    fn send_rst(&mut self) {
        let header = TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, self.snd_nxt)
            .wnd(self.config.window)
            .rst();
        self.push_segment(header, Message::default(), true, Role::Plain);
    }

    fn register(&mut self, on_result: Option<Completion>) {
        if let Some(on_result) = on_result {
            self.on_ack.entry(self.snd_nxt).or_default().push(on_result);
        }
    }

    fn deliver(&mut self, text: Message, push: bool) -> Option<Message> {
        if !self.config.buffer_until_push {
            return Some(text);
        }
        self.buffered.concatenate(text);
        if push {
            Some(std::mem::take(&mut self.buffered))
        } else {
            None
        }
    }

    fn adopt_mss(&mut self, header: &TcpHeader) {
        if let Some(mss) = header.mss {
            self.mss = mss.clamp(1, self.link_mss);
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            logging::state_event(&self.id, self.state, state);
            self.state = state;
        }
    }

    /// A header with the window and, once the remote sequence is known, the
    /// acknowledgment filled in.
    fn header_builder(&self, seq: u32) -> TcpHeaderBuilder {
        let builder = TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, seq)
            .wnd(self.config.window);
        match self.rcv_nxt {
            Some(ack) => builder.ack(ack),
            None => builder,
        }
    }

    fn emit(
        &mut self,
        header: TcpHeaderBuilder,
        text: Message,
        dont_fragment: bool,
        role: Role,
        now: Instant,
    ) {
        if role == Role::Tracked {
            self.retransmit.track(now);
        }
        self.push_segment(header, text, dont_fragment, role);
    }

    fn push_segment(
        &mut self,
        header: TcpHeaderBuilder,
        text: Message,
        dont_fragment: bool,
        role: Role,
    ) {
        match header.build(
            self.id.local.address,
            self.id.remote.address,
            text.iter(),
            text.len(),
        ) {
            Ok(header) => self.outbox.push(Outgoing::Transmit(Transmit {
                segment: Segment::new(header, text),
                dont_fragment,
                role,
            })),
            Err(e) => tracing::error!("Dropping segment on {}: {}", self.id, e),
        }
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("snd_nxt", &self.snd_nxt)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("mss", &self.mss)
            .field("idle", &self.retransmit.idle)
            .field("queue", &self.queue)
            .finish()
    }
}
