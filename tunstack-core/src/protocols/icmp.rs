//! Answers [ICMP](https://datatracker.ietf.org/doc/html/rfc792) echo
//! requests. Every other message type is logged and dropped.

use self::icmp_parsing::IcmpHeader;
use crate::{
    link::{Link, SendError},
    message::Message,
    protocols::ipv4::{protocol_number, Ipv4Header},
};

pub mod icmp_parsing;

pub const ECHO_REPLY: u8 = 0;
pub const ECHO_REQUEST: u8 = 8;

/// Handles an arriving ICMP message. An echo request is answered with an
/// echo reply carrying the same identifier, sequence number and data.
pub fn message_arrives(
    link: &mut Link,
    ip: &Ipv4Header,
    header: IcmpHeader,
    data: Message,
) -> Result<(), SendError> {
    match header.icmp_type {
        ECHO_REQUEST => {
            let reply = IcmpHeader::new(ECHO_REPLY, 0, header.rest);
            let mut message = data;
            let header = reply.serialize(message.iter());
            message.header(header);
            link.send(ip.source, protocol_number::ICMP, false, message)?;
            Ok(())
        }
        other => {
            tracing::debug!("Unhandled ICMP type {} from {}", other, ip.source);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ipv4::{Ipv4Address, Ipv4HeaderBuilder};
    use std::time::Instant;

    const LOCAL: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const REMOTE: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);

    fn request_ip(len: u16) -> Ipv4Header {
        Ipv4HeaderBuilder::new(REMOTE, LOCAL, protocol_number::ICMP, len)
            .build()
            .unwrap()
    }

    #[test]
    fn echo_request_gets_reply() -> anyhow::Result<()> {
        let mut link = Link::new(LOCAL, 1500, 0, Instant::now());
        let request = IcmpHeader::new(ECHO_REQUEST, 0, [0xbe, 0xef, 0, 7]);
        message_arrives(&mut link, &request_ip(12), request, Message::new(b"ping"))?;

        let frames = link.take_frames();
        assert_eq!(frames.len(), 1);
        let ip = Ipv4Header::from_bytes(frames[0].iter().cloned())?;
        assert_eq!(ip.destination, REMOTE);
        assert_eq!(ip.protocol, protocol_number::ICMP);
        let body = &frames[0][ip.header_length() as usize..];
        let reply = IcmpHeader::from_bytes(body.iter().cloned())?;
        assert_eq!(reply.icmp_type, ECHO_REPLY);
        assert_eq!(reply.rest, [0xbe, 0xef, 0, 7]);
        assert_eq!(&body[8..], b"ping");
        Ok(())
    }

    #[test]
    fn other_types_are_ignored() -> anyhow::Result<()> {
        let mut link = Link::new(LOCAL, 1500, 0, Instant::now());
        let reply = IcmpHeader::new(ECHO_REPLY, 0, [0; 4]);
        message_arrives(&mut link, &request_ip(8), reply, Message::new(b""))?;
        assert_eq!(link.pending_frames(), 0);
        Ok(())
    }
}
