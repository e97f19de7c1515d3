//! An implementation of the [User Datagram
//! Protocol](https://datatracker.ietf.org/doc/html/rfc768).

use self::udp_parsing::{build_udp_header, BuildHeaderError, UdpHeader};
use crate::{
    link::{Link, SendError},
    message::Message,
    protocols::{
        ipv4::{protocol_number, Ipv4Header},
        tcp::{pick_ephemeral_port, ECHO_PORT},
        utility::Endpoint,
    },
};
use rand::Rng;
use rustc_hash::FxHashMap;
use std::rc::Rc;
use thiserror::Error as ThisError;

pub mod udp_parsing;

/// Receives each datagram for a port, along with the IP header it arrived in
/// and a handle for replying to its sender.
pub type UdpHandler = Rc<dyn Fn(Message, &Ipv4Header, &mut UdpReply<'_>)>;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    #[error("Port {0} is not a valid port")]
    InvalidPort(u16),
    #[error("Port {0} already has a listener")]
    PortInUse(u16),
    #[error("The listener on port {0} cannot be removed")]
    ProtectedPort(u16),
    #[error("Nothing is listening on port {0}")]
    NotListening(u16),
    #[error("Every ephemeral port is in use")]
    PortsExhausted,
    #[error("{0}")]
    Build(#[from] BuildHeaderError),
    #[error("{0}")]
    Send(#[from] SendError),
}

/// The UDP listener table.
pub struct Udp {
    listeners: FxHashMap<u16, UdpHandler>,
}

impl Udp {
    /// Creates a table with the echo service on port 7.
    pub fn new() -> Self {
        let mut listeners = FxHashMap::default();
        listeners.insert(ECHO_PORT, echo());
        Self { listeners }
    }

    pub fn listen(&mut self, port: u16, handler: UdpHandler) -> Result<(), UdpError> {
        if port == 0 {
            Err(UdpError::InvalidPort(port))?
        }
        if self.listeners.contains_key(&port) {
            Err(UdpError::PortInUse(port))?
        }
        self.listeners.insert(port, handler);
        Ok(())
    }

    /// Listens on an unused ephemeral port and returns it.
    pub fn listen_random(
        &mut self,
        rng: &mut impl Rng,
        handler: UdpHandler,
    ) -> Result<u16, UdpError> {
        let port = pick_ephemeral_port(rng, |port| self.listeners.contains_key(&port))
            .ok_or(UdpError::PortsExhausted)?;
        self.listeners.insert(port, handler);
        Ok(port)
    }

    pub fn unlisten(&mut self, port: u16) -> Result<(), UdpError> {
        if port == ECHO_PORT {
            Err(UdpError::ProtectedPort(port))?
        }
        self.listeners
            .remove(&port)
            .map(|_| ())
            .ok_or(UdpError::NotListening(port))
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
    }

    /// Hands a parsed datagram to the listener on its destination port.
    /// Datagrams for ports without a listener are dropped.
    pub fn datagram_arrives(
        &mut self,
        link: &mut Link,
        ip: &Ipv4Header,
        header: UdpHeader,
        payload: Message,
    ) {
        let Some(handler) = self.listeners.get(&header.destination).cloned() else {
            tracing::debug!("No UDP listener on port {}", header.destination);
            return;
        };
        handler(
            payload,
            ip,
            &mut UdpReply {
                link,
                local_port: header.destination,
                remote: Endpoint::new(ip.source, header.source),
            },
        );
    }

    /// Sends a datagram from `source_port` to `destination`.
    pub fn send(
        link: &mut Link,
        source_port: u16,
        destination: Endpoint,
        payload: impl Into<Message>,
    ) -> Result<(), UdpError> {
        if source_port == 0 {
            Err(UdpError::InvalidPort(source_port))?
        }
        if destination.port == 0 {
            Err(UdpError::InvalidPort(destination.port))?
        }
        let mut message = payload.into();
        let header = build_udp_header(
            link.local(),
            source_port,
            destination.address,
            destination.port,
            message.iter(),
            message.len(),
        )?;
        message.header(header);
        link.send(destination.address, protocol_number::UDP, false, message)?;
        Ok(())
    }
}

impl Default for Udp {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle for answering the sender of a datagram from the port it was
/// addressed to.
pub struct UdpReply<'a> {
    link: &'a mut Link,
    local_port: u16,
    remote: Endpoint,
}

impl<'a> UdpReply<'a> {
    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn send(&mut self, payload: impl Into<Message>) -> Result<(), UdpError> {
        Udp::send(self.link, self.local_port, self.remote, payload)
    }
}

fn echo() -> UdpHandler {
    Rc::new(|payload: Message, _: &Ipv4Header, reply: &mut UdpReply<'_>| {
        if let Err(e) = reply.send(payload) {
            tracing::warn!("UDP echo to {}: {}", reply.remote(), e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{
        ipv4::{Ipv4Address, Ipv4HeaderBuilder},
        tcp::EPHEMERAL_PORTS,
    };
    use rand::{rngs::SmallRng, SeedableRng};
    use std::{cell::RefCell, time::Instant};

    const LOCAL: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const REMOTE: Endpoint = Endpoint::new(Ipv4Address::new([10, 0, 0, 1]), 5353);

    fn nothing() -> UdpHandler {
        Rc::new(|_: Message, _: &Ipv4Header, _: &mut UdpReply<'_>| {})
    }

    fn arriving(destination: u16, payload: &[u8]) -> (Ipv4Header, UdpHeader, Message) {
        let ip = Ipv4HeaderBuilder::new(
            REMOTE.address,
            LOCAL,
            protocol_number::UDP,
            payload.len() as u16 + 8,
        )
        .build()
        .unwrap();
        let header = UdpHeader {
            source: REMOTE.port,
            destination,
            length: payload.len() as u16 + 8,
            checksum: 0,
        };
        (ip, header, Message::new(payload))
    }

    #[test]
    fn listener_registration() {
        let mut udp = Udp::new();
        assert!(udp.is_listening(ECHO_PORT));
        assert_eq!(udp.listen(0, nothing()), Err(UdpError::InvalidPort(0)));
        assert_eq!(udp.listen(9000, nothing()), Ok(()));
        assert_eq!(udp.listen(9000, nothing()), Err(UdpError::PortInUse(9000)));
        assert_eq!(udp.unlisten(9000), Ok(()));
        assert_eq!(udp.unlisten(9000), Err(UdpError::NotListening(9000)));
        assert_eq!(
            udp.unlisten(ECHO_PORT),
            Err(UdpError::ProtectedPort(ECHO_PORT))
        );
    }

    #[test]
    fn random_listeners_get_distinct_ephemeral_ports() {
        let mut udp = Udp::new();
        let mut rng = SmallRng::seed_from_u64(3);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let port = udp.listen_random(&mut rng, nothing()).unwrap();
            assert!(EPHEMERAL_PORTS.contains(&port));
            assert!(seen.insert(port));
        }
    }

    #[test]
    fn echo_replies_to_sender() {
        let mut udp = Udp::new();
        let mut link = Link::new(LOCAL, 1500, 0, Instant::now());
        let (ip, header, payload) = arriving(ECHO_PORT, b"ping");
        udp.datagram_arrives(&mut link, &ip, header, payload);

        let frames = link.take_frames();
        assert_eq!(frames.len(), 1);
        let reply = etherparse::SlicedPacket::from_ip(&frames[0]).unwrap();
        match reply.transport {
            Some(etherparse::TransportSlice::Udp(udp)) => {
                assert_eq!(udp.source_port(), ECHO_PORT);
                assert_eq!(udp.destination_port(), REMOTE.port);
            }
            _ => panic!("expected a UDP reply"),
        }
        assert_eq!(reply.payload, b"ping");
    }

    #[test]
    fn handler_sees_payload_and_sender() {
        let seen = Rc::new(RefCell::new(None));
        let mut udp = Udp::new();
        udp.listen(
            6000,
            Rc::new({
                let seen = seen.clone();
                move |payload: Message, ip: &Ipv4Header, reply: &mut UdpReply<'_>| {
                    *seen.borrow_mut() = Some((payload.to_vec(), ip.source, reply.remote()));
                }
            }),
        )
        .unwrap();
        let mut link = Link::new(LOCAL, 1500, 0, Instant::now());
        let (ip, header, payload) = arriving(6000, b"data");
        udp.datagram_arrives(&mut link, &ip, header, payload);

        assert_eq!(
            seen.borrow().clone(),
            Some((b"data".to_vec(), REMOTE.address, REMOTE))
        );
        assert_eq!(link.pending_frames(), 0);
    }

    #[test]
    fn unheard_datagrams_are_dropped() {
        let mut udp = Udp::new();
        let mut link = Link::new(LOCAL, 1500, 0, Instant::now());
        let (ip, header, payload) = arriving(6001, b"lost");
        udp.datagram_arrives(&mut link, &ip, header, payload);
        assert_eq!(link.pending_frames(), 0);
    }

    #[test]
    fn rejects_port_zero_on_send() {
        let mut link = Link::new(LOCAL, 1500, 0, Instant::now());
        assert_eq!(
            Udp::send(&mut link, 0, REMOTE, "x"),
            Err(UdpError::InvalidPort(0))
        );
        assert_eq!(
            Udp::send(&mut link, 4000, Endpoint::new(REMOTE.address, 0), "x"),
            Err(UdpError::InvalidPort(0))
        );
    }
}
