//! Byte collections that protocols grow and shrink without copying.

use std::{collections::VecDeque, fmt::Display, sync::Arc};

/// A shared, immutable window into a byte buffer.
///
/// Chunks are what let a payload be queued for retransmission, delivered to an
/// application and sliced into segments all at once without copying it.
#[derive(Debug, Clone)]
pub struct Chunk {
    start: usize,
    end: usize,
    bytes: Arc<Vec<u8>>,
}

impl Chunk {
    /// Wraps the given bytes in a chunk.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            start: 0,
            end: bytes.len(),
            bytes: Arc::new(bytes),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn split_at(&self, at: usize) -> (Self, Self) {
        let mut front = self.clone();
        let mut back = self.clone();
        front.end = self.start + at;
        back.start = self.start + at;
        (front, back)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Chunk {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Chunk {
    fn from(bytes: &[u8; N]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for Chunk {
    fn from(bytes: [u8; N]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}

/// A byte sequence made of shared chunks.
///
/// Headers are prepended, payloads are concatenated and segments are cut off
/// the front. None of these operations copy the underlying bytes.
#[derive(Debug, Clone, Default)]
pub struct Message {
    chunks: VecDeque<Chunk>,
    len: usize,
}

impl Message {
    /// Creates a message holding the given bytes.
    ///
    /// ```
    /// # use tunstack_core::message::Message;
    /// let message = Message::new(b"payload");
    /// assert_eq!(message.len(), 7);
    /// ```
    pub fn new(body: impl Into<Chunk>) -> Self {
        let body = body.into();
        let len = body.len();
        let mut chunks = VecDeque::new();
        if len > 0 {
            chunks.push_back(body);
        }
        Self { chunks, len }
    }

    /// Prepends a header to the message.
    ///
    /// ```
    /// # use tunstack_core::message::Message;
    /// let mut message = Message::new(b"data");
    /// message.header(b"hdr");
    /// assert_eq!(message.to_vec(), b"hdrdata");
    /// ```
    pub fn header(&mut self, header: impl Into<Chunk>) {
        let header = header.into();
        if header.is_empty() {
            return;
        }
        self.len += header.len();
        self.chunks.push_front(header);
    }

    /// Appends another message to the end of this one.
    pub fn concatenate(&mut self, other: Message) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Splits off and returns the first `len` bytes. Panics if `len` exceeds
    /// the message length.
    pub fn cut(&mut self, len: usize) -> Self {
        assert!(len <= self.len, "cut past the end of a message");
        let mut front = VecDeque::new();
        let mut remaining = len;
        while remaining > 0 {
            let Some(head) = self.chunks.pop_front() else {
                break;
            };
            if head.len() <= remaining {
                remaining -= head.len();
                front.push_back(head);
            } else {
                let (taken, rest) = head.split_at(remaining);
                front.push_back(taken);
                self.chunks.push_front(rest);
                remaining = 0;
            }
        }
        self.len -= len;
        Self { chunks: front, len }
    }

    /// Drops the first `len` bytes.
    pub fn remove_front(&mut self, len: usize) {
        let _ = self.cut(len);
    }

    /// Drops every byte past `len`. Does nothing if the message is shorter.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            *self = self.cut(len);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over every byte of the message in order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + Clone + '_ {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.as_slice().iter().copied())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in self.chunks.iter() {
            out.extend_from_slice(chunk.as_slice());
        }
        out
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_vec()))
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for Message {}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::new(bytes)
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        Message::new(bytes)
    }
}

impl<const N: usize> From<[u8; N]> for Message {
    fn from(bytes: [u8; N]) -> Self {
        Message::new(bytes)
    }
}

impl<const N: usize> From<&[u8; N]> for Message {
    fn from(bytes: &[u8; N]) -> Self {
        Message::new(bytes)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::new(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_prepended() {
        let mut message = Message::new(b"body");
        message.header(b"tcp");
        message.header(b"ip");
        assert_eq!(message.len(), 9);
        assert_eq!(message.to_vec(), b"iptcpbody");
    }

    #[test]
    fn cut_splits_inside_a_chunk() {
        let mut message = Message::new("Hello, world");
        let front = message.cut(5);
        assert_eq!(front, Message::new("Hello"));
        assert_eq!(message, Message::new(", world"));
    }

    #[test]
    fn cut_across_chunks() {
        let mut message = Message::new("stuff");
        message.header(" and ");
        message.header("things");
        let front = message.cut(9);
        assert_eq!(front, Message::new("things an"));
        assert_eq!(message, Message::new("d stuff"));
        assert_eq!(message.len(), 7);
    }

    #[test]
    fn cut_everything_leaves_empty() {
        let mut message = Message::new("abc");
        let all = message.cut(3);
        assert_eq!(all.to_vec(), b"abc");
        assert!(message.is_empty());
        assert_eq!(message.iter().count(), 0);
    }

    #[test]
    fn remove_front_and_truncate() {
        let mut message = Message::new("payload");
        message.header("header");
        message.remove_front(6);
        message.truncate(4);
        assert_eq!(message.to_vec(), b"payl");
        message.truncate(10);
        assert_eq!(message.len(), 4);
    }

    #[test]
    fn concatenate() {
        let mut message = Message::new("Hello");
        message.concatenate(Message::new(" world!"));
        assert_eq!(message.to_vec(), b"Hello world!");
    }

    #[test]
    fn empty_message() {
        let message = Message::new("");
        assert!(message.is_empty());
        assert_eq!(message, Message::default());
    }
}
