//! An implementation of the [Transmission Control
//! Protocol](https://www.rfc-editor.org/rfc/rfc9293.html) with a single
//! segment in flight per connection.
//!
//! [`Tcp`] is the connection table. It routes arriving segments to their
//! [`Tcb`], accepts connections on listening ports, allocates ephemeral ports
//! and turns whatever each connection wants sent into frames on the [`Link`].

use self::{
    tcb::{Completion, Outgoing, Segment, State, Tcb, Teardown, Violation},
    tcp_parsing::TcpHeader,
};
use crate::{
    config::TcpConfig,
    link::{Link, SendError},
    message::Message,
    protocols::{
        ipv4::{protocol_number, Ipv4Address, Ipv4Header},
        utility::Endpoint,
    },
};
use rand::Rng;
use rustc_hash::FxHashMap;
use std::{
    fmt::{self, Display},
    ops::RangeInclusive,
    rc::Rc,
};
use thiserror::Error as ThisError;

pub mod tcb;
pub mod tcp_parsing;

/// Receives each payload a connection delivers, along with a handle for
/// answering on that connection.
pub type TcpHandler = Rc<dyn Fn(Message, &mut TcpConnection<'_>)>;

/// The built-in echo service, which cannot be unregistered
pub const ECHO_PORT: u16 = 7;
/// Local ports handed out to outgoing connections and random listeners
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 4097..=u16::MAX;
/// Random draws made before falling back to a linear scan
const RANDOM_PORT_ATTEMPTS: usize = 64;

/// Identifies a connection by its two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionId {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl ConnectionId {
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    #[error("{0}")]
    Violation(#[from] Violation),
    #[error("{0}")]
    Send(#[from] SendError),
    #[error("Every ephemeral port is in use")]
    PortsExhausted,
    #[error("Port {0} is not a valid port")]
    InvalidPort(u16),
    #[error("There is no connection {0}")]
    NoConnection(ConnectionId),
}

/// The connection table.
pub struct Tcp {
    local: Ipv4Address,
    /// The MSS advertised on, and used by default for, every connection
    mss: u16,
    config: TcpConfig,
    connections: FxHashMap<ConnectionId, Tcb>,
    listeners: FxHashMap<u16, TcpHandler>,
}

impl Tcp {
    /// Creates an empty table with the echo service on port 7.
    pub fn new(local: Ipv4Address, mss: u16, config: TcpConfig) -> Self {
        let mut listeners = FxHashMap::default();
        listeners.insert(ECHO_PORT, echo());
        Self {
            local,
            mss,
            config,
            connections: FxHashMap::default(),
            listeners,
        }
    }

    /// Accepts connections on `port` with `handler`. Fails if the port is
    /// zero or already has a listener.
    pub fn listen(&mut self, port: u16, handler: TcpHandler) -> bool {
        if port == 0 || self.listeners.contains_key(&port) {
            return false;
        }
        self.listeners.insert(port, handler);
        true
    }

    /// Stops accepting connections on `port`. Existing connections are left
    /// alone.
    pub fn unlisten(&mut self, port: u16) -> bool {
        port != ECHO_PORT && self.listeners.remove(&port).is_some()
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
    }

    /// Opens a connection to `remote` from a fresh ephemeral port.
    pub fn connect(
        &mut self,
        link: &mut Link,
        rng: &mut impl Rng,
        remote: Endpoint,
        handler: TcpHandler,
        on_connect: Option<Completion>,
    ) -> Result<ConnectionId, TcpError> {
        if remote.port == 0 {
            Err(TcpError::InvalidPort(remote.port))?
        }
        let port = self.allocate_port(remote, rng)?;
        let id = ConnectionId::new(Endpoint::new(self.local, port), remote);
        let tcb = Tcb::open(
            id,
            initial_sequence(rng),
            self.mss,
            self.config,
            handler,
            on_connect,
            link.now(),
        );
        self.connections.insert(id, tcb);
        self.flush(link, id)?;
        Ok(id)
    }

    /// Picks a local port that no listener holds and no connection to
    /// `remote` uses.
    pub fn allocate_port(&self, remote: Endpoint, rng: &mut impl Rng) -> Result<u16, TcpError> {
        pick_ephemeral_port(rng, |port| {
            self.listeners.contains_key(&port)
                || self.connections.contains_key(&ConnectionId::new(
                    Endpoint::new(self.local, port),
                    remote,
                ))
        })
        .ok_or(TcpError::PortsExhausted)
    }

    /// Routes an arriving segment to its connection, creating one if it is a
    /// SYN for a listening port. A protocol violation resets the connection
    /// and is then returned.
    pub fn segment_arrives(
        &mut self,
        link: &mut Link,
        rng: &mut impl Rng,
        ip: &Ipv4Header,
        header: TcpHeader,
        text: Message,
    ) -> Result<(), TcpError> {
        let id = ConnectionId::new(
            Endpoint::new(ip.destination, header.dst_port),
            Endpoint::new(ip.source, header.src_port),
        );

        if !self.connections.contains_key(&id) {
            if !header.ctl.syn() || header.ctl.ack() {
                tracing::debug!("Ignoring {:?} for unknown connection {}", header.ctl, id);
                return Ok(());
            }
            let Some(handler) = self.listeners.get(&header.dst_port).cloned() else {
                tracing::debug!("No listener for SYN to {}", id.local);
                return Ok(());
            };
            let tcb = Tcb::accept(id, initial_sequence(rng), self.mss, self.config, handler);
            self.connections.insert(id, tcb);
        }

        let now = link.now();
        let Some(tcb) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let handler = tcb.handler();
        let is_reset = header.ctl.rst();
        let delivered = match tcb.segment_arrives(Segment::new(header, text), now) {
            Ok(delivered) => delivered,
            Err(violation) => {
                tracing::warn!("Resetting {}: {}", id, violation);
                if is_reset {
                    // Never answer a reset with a reset
                    tcb.delete(Teardown::Reset);
                } else {
                    tcb.kill(Teardown::Violation);
                }
                self.flush(link, id)?;
                Err(violation)?
            }
        };
        self.flush(link, id)?;

        if let Some(text) = delivered {
            handler(
                text,
                &mut TcpConnection {
                    tcp: self,
                    link,
                    id,
                },
            );
        }
        Ok(())
    }

    /// Gives every connection a chance to retransmit or give up.
    pub fn tick(&mut self, link: &mut Link) {
        let now = link.now();
        let ids: Vec<_> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(tcb) = self.connections.get_mut(&id) {
                tcb.tick(now);
            }
            if let Err(e) = self.flush(link, id) {
                tracing::error!("{}", e);
            }
        }
    }

    pub fn state(&self, id: ConnectionId) -> Option<State> {
        self.connections.get(&id).map(Tcb::state)
    }

    pub fn tcb(&self, id: ConnectionId) -> Option<&Tcb> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sends whatever the connection queued and removes it once closed.
    fn flush(&mut self, link: &mut Link, id: ConnectionId) -> Result<(), TcpError> {
        let Some(tcb) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let mut result = Ok(());
        for outgoing in tcb.take_outgoing() {
            match outgoing {
                Outgoing::Transmit(transmit) => match link.send(
                    id.remote.address,
                    protocol_number::TCP,
                    transmit.dont_fragment,
                    transmit.segment.to_message(),
                ) {
                    Ok(frames) => tcb.record_frames(transmit.role, frames),
                    Err(e) => result = Err(e.into()),
                },
                Outgoing::ResendAck => link.resend(tcb.cached_ack()),
                Outgoing::Retransmit => link.resend(tcb.retransmit_frames()),
            }
        }
        if tcb.state() == State::Closed {
            self.connections.remove(&id);
            tracing::debug!("Removed connection {}", id);
        }
        result
    }
}

/// A handle for acting on one connection. Operations fail with
/// [`TcpError::NoConnection`] once the connection has been removed.
pub struct TcpConnection<'a> {
    tcp: &'a mut Tcp,
    link: &'a mut Link,
    id: ConnectionId,
}

impl<'a> TcpConnection<'a> {
    pub(crate) fn new(tcp: &'a mut Tcp, link: &'a mut Link, id: ConnectionId) -> Self {
        Self { tcp, link, id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection's state, or `None` once it is gone.
    pub fn state(&self) -> Option<State> {
        self.tcp.state(self.id)
    }

    pub fn send(&mut self, text: impl Into<Message>) -> Result<(), TcpError> {
        self.send_with(text, None)
    }

    /// Sends `text`, calling `on_result` once all of it is acknowledged or
    /// the connection is torn down.
    pub fn send_with(
        &mut self,
        text: impl Into<Message>,
        on_result: Option<Completion>,
    ) -> Result<(), TcpError> {
        let text = text.into();
        self.with_tcb(|tcb, now| tcb.send(text, on_result, now))
    }

    pub fn close(&mut self) -> Result<(), TcpError> {
        self.close_with(None)
    }

    /// Closes the connection once all queued data is acknowledged.
    /// `on_result` runs when the FIN is acknowledged.
    pub fn close_with(&mut self, on_result: Option<Completion>) -> Result<(), TcpError> {
        self.with_tcb(|tcb, now| tcb.close(on_result, now))
    }

    /// Resets the connection immediately.
    pub fn kill(&mut self) -> Result<(), TcpError> {
        self.with_tcb(|tcb, _| tcb.kill(Teardown::Killed))
    }

    fn with_tcb(&mut self, op: impl FnOnce(&mut Tcb, std::time::Instant)) -> Result<(), TcpError> {
        let now = self.link.now();
        let tcb = self
            .tcp
            .connections
            .get_mut(&self.id)
            .ok_or(TcpError::NoConnection(self.id))?;
        op(tcb, now);
        self.tcp.flush(self.link, self.id)
    }
}

/// Draws an ephemeral port for which `is_taken` is false. A bounded number
/// of random draws is followed by a scan of the whole range from a random
/// starting point, so `None` means every port is taken.
pub fn pick_ephemeral_port(rng: &mut impl Rng, is_taken: impl Fn(u16) -> bool) -> Option<u16> {
    for _ in 0..RANDOM_PORT_ATTEMPTS {
        let port = rng.gen_range(EPHEMERAL_PORTS);
        if !is_taken(port) {
            return Some(port);
        }
    }
    let first = *EPHEMERAL_PORTS.start() as u32;
    let span = *EPHEMERAL_PORTS.end() as u32 - first + 1;
    let start = rng.gen_range(0..span);
    (0..span)
        .map(|i| (first + (start + i) % span) as u16)
        .find(|port| !is_taken(*port))
}

/// A random 30-bit initial sequence number
fn initial_sequence(rng: &mut impl Rng) -> u32 {
    rng.gen::<u32>() & 0x3fff_ffff
}

/// Echoes every payload back, and closes on a lone newline.
fn echo() -> TcpHandler {
    Rc::new(|text: Message, connection: &mut TcpConnection<'_>| {
        let result = if text.iter().eq([b'\n']) {
            connection.close()
        } else {
            connection.send(text)
        };
        if let Err(e) = result {
            tracing::warn!("Echo on {}: {}", connection.id(), e);
        }
    })
}
