use crate::{message::Message, protocols::tcp::tcp_parsing::TcpHeader};

/// A TCP header together with the text it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: TcpHeader,
    pub text: Message,
}

impl Segment {
    pub fn new(header: TcpHeader, text: Message) -> Self {
        Self { header, text }
    }

    /// The header followed by the text, ready to hand to IPv4.
    pub fn to_message(&self) -> Message {
        let mut message = self.text.clone();
        message.header(self.header.serialize());
        message
    }
}
