//! The stack context that owns every protocol table.

use crate::{
    config::StackConfig,
    link::{Link, SendError},
    logging::dropped_frame_event,
    message::Message,
    protocols::{
        icmp::{self, icmp_parsing::IcmpHeader},
        ipv4::{self, protocol_number, Ipv4Address, Ipv4Header, Reassembly},
        tcp::{
            self,
            tcb::{Completion, State},
            tcp_parsing::TcpHeader,
            ConnectionId, Tcp, TcpConnection, TcpError, TcpHandler,
        },
        udp::{
            self,
            udp_parsing::{UdpHeader, HEADER_OCTETS as UDP_HEADER_OCTETS},
            Udp, UdpError, UdpHandler,
        },
        utility::Endpoint,
    },
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::time::Instant;
use thiserror::Error as ThisError;

/// Why an inbound frame was not delivered.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum DemuxError {
    #[error("Malformed IPv4 header: {0}")]
    Ipv4(#[from] ipv4::ipv4_parsing::ParseError),
    #[error("Frame is addressed to {0}, not to us")]
    NotForUs(Ipv4Address),
    #[error("Frame holds {actual} bytes but its header claims {expected}")]
    Truncated { expected: usize, actual: usize },
    #[error("Unsupported protocol {0}")]
    UnknownProtocol(u8),
    #[error("Malformed ICMP message: {0}")]
    Icmp(#[from] icmp::icmp_parsing::ParseError),
    #[error("Malformed TCP segment: {0}")]
    Tcp(#[from] tcp::tcp_parsing::ParseError),
    #[error("Malformed UDP datagram: {0}")]
    Udp(#[from] udp::udp_parsing::ParseError),
    #[error("{0}")]
    Connection(#[from] TcpError),
    #[error("Could not reply: {0}")]
    Send(#[from] SendError),
}

impl DemuxError {
    /// Whether the frame itself was malformed.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::Ipv4(_) | Self::Truncated { .. } | Self::Icmp(_) | Self::Tcp(_) | Self::Udp(_)
        )
    }
}

/// Every protocol table of one host on the tunnel, and the link they share.
pub struct Stack {
    config: StackConfig,
    link: Link,
    reassembly: Reassembly,
    tcp: Tcp,
    udp: Udp,
    rng: SmallRng,
}

impl Stack {
    pub fn new(config: StackConfig) -> Self {
        Self::with_rng(config, SmallRng::from_entropy(), Instant::now())
    }

    /// Creates a stack whose random choices come from `rng` and whose clock
    /// starts at `now`.
    pub fn with_rng(config: StackConfig, mut rng: SmallRng, now: Instant) -> Self {
        let link = Link::new(config.local, config.mtu, rng.gen(), now);
        let tcp = Tcp::new(config.local, config.default_mss(), config.tcp);
        Self {
            config,
            link,
            reassembly: Reassembly::new(),
            tcp,
            udp: Udp::new(),
            rng,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn local(&self) -> Ipv4Address {
        self.config.local
    }

    /// The stack clock as of the last tick.
    pub fn now(&self) -> Instant {
        self.link.now()
    }

    /// Processes one inbound frame. Frames that cannot be delivered are
    /// logged and dropped.
    pub fn on_frame(&mut self, frame: &[u8]) {
        if let Err(e) = self.demux(frame) {
            let source = frame
                .get(12..16)
                .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
                .map(Ipv4Address::from);
            if e.is_malformed() {
                tracing::error!("Dropping malformed frame: {}", e);
            } else {
                tracing::debug!("Dropping frame: {}", e);
            }
            dropped_frame_event(source, &e);
        }
    }

    fn demux(&mut self, frame: &[u8]) -> Result<(), DemuxError> {
        let header = Ipv4Header::from_bytes(frame.iter().cloned())?;
        if header.destination != self.config.local {
            Err(DemuxError::NotForUs(header.destination))?
        }
        let total = header.total_length as usize;
        if frame.len() < total {
            Err(DemuxError::Truncated {
                expected: total,
                actual: frame.len(),
            })?
        }
        let body = Message::new(&frame[header.header_length() as usize..total]);

        let Some((ip, mut body)) = self.reassembly.ingest(header, body, self.link.now()) else {
            return Ok(());
        };

        match ip.protocol {
            protocol_number::ICMP => {
                let header = IcmpHeader::from_bytes(body.iter())?;
                body.remove_front(icmp::icmp_parsing::HEADER_OCTETS);
                icmp::message_arrives(&mut self.link, &ip, header, body)?;
            }
            protocol_number::TCP => {
                let header = TcpHeader::from_bytes(body.iter(), body.len(), ip.source, ip.destination)?;
                body.remove_front(header.bytes() as usize);
                self.tcp
                    .segment_arrives(&mut self.link, &mut self.rng, &ip, header, body)?;
            }
            protocol_number::UDP => {
                let header =
                    UdpHeader::from_bytes_ipv4(body.iter(), body.len(), ip.source, ip.destination)?;
                body.remove_front(UDP_HEADER_OCTETS as usize);
                self.udp.datagram_arrives(&mut self.link, &ip, header, body);
            }
            other => Err(DemuxError::UnknownProtocol(other))?,
        }
        Ok(())
    }

    /// Advances the clock to `now` without running any timers. Segments sent
    /// afterwards count their retransmission interval from `now`.
    pub fn set_now(&mut self, now: Instant) {
        self.link.set_now(now);
    }

    /// Advances the clock to `now`, retransmitting or abandoning stalled
    /// connections and discarding stale fragments.
    pub fn tick(&mut self, now: Instant) {
        self.link.set_now(now);
        self.tcp.tick(&mut self.link);
        let swept = self.reassembly.sweep(self.link.now());
        if swept > 0 {
            tracing::debug!("Discarded {} incomplete datagrams", swept);
        }
    }

    /// Removes and returns every frame waiting to go out on the link.
    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        self.link.take_frames()
    }

    /// Opens a TCP connection. `on_connect` runs once the handshake finishes
    /// or the attempt fails.
    pub fn tcp_connect(
        &mut self,
        address: Ipv4Address,
        port: u16,
        handler: TcpHandler,
        on_connect: Option<Completion>,
    ) -> Result<ConnectionId, TcpError> {
        self.tcp.connect(
            &mut self.link,
            &mut self.rng,
            Endpoint::new(address, port),
            handler,
            on_connect,
        )
    }

    pub fn tcp_listen(&mut self, port: u16, handler: TcpHandler) -> bool {
        self.tcp.listen(port, handler)
    }

    pub fn tcp_unlisten(&mut self, port: u16) -> bool {
        self.tcp.unlisten(port)
    }

    /// A handle for sending on, closing or killing a connection.
    pub fn connection(&mut self, id: ConnectionId) -> TcpConnection<'_> {
        TcpConnection::new(&mut self.tcp, &mut self.link, id)
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<State> {
        self.tcp.state(id)
    }

    pub fn tcp(&self) -> &Tcp {
        &self.tcp
    }

    pub fn udp_listen(&mut self, port: u16, handler: UdpHandler) -> Result<(), UdpError> {
        self.udp.listen(port, handler)
    }

    /// Listens on an unused ephemeral port and returns it.
    pub fn udp_listen_random(&mut self, handler: UdpHandler) -> Result<u16, UdpError> {
        self.udp.listen_random(&mut self.rng, handler)
    }

    pub fn udp_unlisten(&mut self, port: u16) -> Result<(), UdpError> {
        self.udp.unlisten(port)
    }

    pub fn udp_send(
        &mut self,
        source_port: u16,
        destination: Endpoint,
        payload: impl Into<Message>,
    ) -> Result<(), UdpError> {
        Udp::send(&mut self.link, source_port, destination, payload)
    }

    /// Datagrams still waiting on fragments.
    pub fn pending_reassemblies(&self) -> usize {
        self.reassembly.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{
        icmp::{ECHO_REPLY, ECHO_REQUEST},
        ipv4::{ControlFlags, Ipv4HeaderBuilder},
    };
    use std::time::Duration;
    use tracing_test::traced_test;

    const LOCAL: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const PEER: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);

    fn stack() -> Stack {
        Stack::with_rng(
            StackConfig::new(LOCAL, PEER, 1500),
            SmallRng::seed_from_u64(0),
            Instant::now(),
        )
    }

    fn frame(destination: Ipv4Address, protocol: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Ipv4HeaderBuilder::new(PEER, destination, protocol, payload.len() as u16)
            .build()
            .unwrap()
            .serialize();
        frame.extend_from_slice(payload);
        frame
    }

    fn ping(data: &[u8]) -> Vec<u8> {
        let mut icmp = IcmpHeader::new(ECHO_REQUEST, 0, [0, 9, 0, 1]).serialize(data.iter().cloned());
        icmp.extend_from_slice(data);
        icmp
    }

    #[test]
    fn answers_ping() -> anyhow::Result<()> {
        let mut stack = stack();
        stack.on_frame(&frame(LOCAL, protocol_number::ICMP, &ping(b"hello")));
        let frames = stack.take_frames();
        assert_eq!(frames.len(), 1);
        let ip = Ipv4Header::from_bytes(frames[0].iter().cloned())?;
        assert_eq!((ip.source, ip.destination), (LOCAL, PEER));
        let body = &frames[0][20..];
        let reply = IcmpHeader::from_bytes(body.iter().cloned())?;
        assert_eq!(reply.icmp_type, ECHO_REPLY);
        assert_eq!(reply.rest, [0, 9, 0, 1]);
        assert_eq!(&body[8..], b"hello");
        Ok(())
    }

    #[test]
    fn trailing_link_padding_is_ignored() {
        let mut stack = stack();
        let mut padded = frame(LOCAL, protocol_number::ICMP, &ping(b"pad"));
        padded.extend_from_slice(&[0; 6]);
        stack.on_frame(&padded);
        assert_eq!(stack.take_frames().len(), 1);
    }

    #[test]
    #[traced_test]
    fn drops_frames_for_other_hosts() {
        let mut stack = stack();
        let other = Ipv4Address::new([10, 0, 0, 3]);
        assert_eq!(
            stack.demux(&frame(other, protocol_number::ICMP, &ping(b"x"))),
            Err(DemuxError::NotForUs(other))
        );
        stack.on_frame(&frame(other, protocol_number::ICMP, &ping(b"x")));
        assert!(stack.take_frames().is_empty());
        assert!(logs_contain("not to us"));
    }

    #[test]
    #[traced_test]
    fn logs_malformed_frames() {
        let mut stack = stack();
        let mut corrupt = frame(LOCAL, protocol_number::ICMP, &ping(b"x"));
        corrupt[10] ^= 0xff;
        stack.on_frame(&corrupt);
        stack.on_frame(&[0x45, 0, 0]);
        assert!(stack.take_frames().is_empty());
        assert!(logs_contain("Dropping malformed frame"));
    }

    #[test]
    fn rejects_truncated_and_unknown_frames() {
        let mut stack = stack();
        let whole = frame(LOCAL, protocol_number::ICMP, &ping(b"abcdef"));
        assert_eq!(
            stack.demux(&whole[..whole.len() - 2]),
            Err(DemuxError::Truncated {
                expected: whole.len(),
                actual: whole.len() - 2
            })
        );
        assert_eq!(
            stack.demux(&frame(LOCAL, 89, b"ospf")),
            Err(DemuxError::UnknownProtocol(89))
        );
        let mut bad_ping = ping(b"abc");
        bad_ping[8] ^= 1;
        assert!(matches!(
            stack.demux(&frame(LOCAL, protocol_number::ICMP, &bad_ping)),
            Err(DemuxError::Icmp(_))
        ));
    }

    #[test]
    fn tick_discards_stale_fragments() {
        let mut stack = stack();
        let start = stack.now();
        let payload = [7u8; 16];
        let mut first = Ipv4HeaderBuilder::new(PEER, LOCAL, protocol_number::UDP, 16)
            .identification(42)
            .flags(ControlFlags::new(true, false))
            .build()
            .unwrap()
            .serialize();
        first.extend_from_slice(&payload);
        stack.on_frame(&first);
        assert_eq!(stack.pending_reassemblies(), 1);

        stack.tick(start + Duration::from_secs(30));
        assert_eq!(stack.pending_reassemblies(), 1);
        stack.tick(start + Duration::from_secs(31));
        assert_eq!(stack.pending_reassemblies(), 0);
    }

    #[test]
    fn udp_echo_answers_from_port_seven() -> anyhow::Result<()> {
        let mut stack = stack();
        let datagram = {
            let mut header = crate::protocols::udp::udp_parsing::build_udp_header(
                PEER,
                40000,
                LOCAL,
                7,
                b"echo".iter().cloned(),
                4,
            )?;
            header.extend_from_slice(b"echo");
            header
        };
        stack.on_frame(&frame(LOCAL, protocol_number::UDP, &datagram));
        let frames = stack.take_frames();
        assert_eq!(frames.len(), 1);
        let body = &frames[0][20..];
        let reply = UdpHeader::from_bytes_ipv4(body.iter().cloned(), body.len(), LOCAL, PEER)?;
        assert_eq!((reply.source, reply.destination), (7, 40000));
        assert_eq!(&body[8..], b"echo");
        Ok(())
    }
}
