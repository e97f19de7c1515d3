//! The outbound side of the tunneled link.
//!
//! Every datagram the stack originates passes through [`Link::send`], which
//! gives it an identification, fragments it to the MTU and queues the
//! resulting frames for the transport to collect.

use crate::{
    message::Message,
    protocols::ipv4::{
        fragment, ControlFlags, FragmentError, HeaderBuildError, Ipv4Address, Ipv4HeaderBuilder,
    },
};
use std::{collections::VecDeque, time::Instant};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("{0}")]
    Fragment(#[from] FragmentError),
    #[error("{0}")]
    Header(#[from] HeaderBuildError),
}

#[derive(Debug)]
pub struct Link {
    local: Ipv4Address,
    mtu: u16,
    /// Identification of the next datagram
    identification: u16,
    /// The stack clock, advanced by ticks
    now: Instant,
    frames: VecDeque<Vec<u8>>,
}

impl Link {
    pub fn new(local: Ipv4Address, mtu: u16, identification: u16, now: Instant) -> Self {
        Self {
            local,
            mtu,
            identification,
            now,
            frames: VecDeque::new(),
        }
    }

    pub fn local(&self) -> Ipv4Address {
        self.local
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn set_now(&mut self, now: Instant) {
        self.now = self.now.max(now);
    }

    /// Wraps `body` in an IPv4 header, fragments it if needed and queues the
    /// frames. The frames are also returned so callers can replay them.
    pub fn send(
        &mut self,
        destination: Ipv4Address,
        protocol: u8,
        dont_fragment: bool,
        body: Message,
    ) -> Result<Vec<Vec<u8>>, SendError> {
        let payload_length: u16 = body
            .len()
            .try_into()
            .map_err(|_| HeaderBuildError::OverlyLongPayload)?;
        let header = Ipv4HeaderBuilder::new(self.local, destination, protocol, payload_length)
            .identification(self.identification)
            .flags(ControlFlags::new(!dont_fragment, true))
            .build()?;
        let pieces = fragment(header, body, self.mtu)?;
        self.identification = self.identification.wrapping_add(1);

        let frames: Vec<Vec<u8>> = pieces
            .into_iter()
            .map(|(header, body)| {
                let mut frame = header.serialize();
                frame.extend(body.iter());
                frame
            })
            .collect();
        self.frames.extend(frames.iter().cloned());
        Ok(frames)
    }

    /// Queues previously produced frames again, unchanged.
    pub fn resend(&mut self, frames: &[Vec<u8>]) {
        self.frames.extend(frames.iter().cloned());
    }

    /// Removes and returns every queued frame in the order it was queued.
    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        self.frames.drain(..).collect()
    }

    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ipv4::{protocol_number, Ipv4Header};

    const LOCAL: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const REMOTE: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);

    #[test]
    fn small_datagram_is_one_frame() -> anyhow::Result<()> {
        let mut link = Link::new(LOCAL, 1500, 7, Instant::now());
        let frames = link.send(REMOTE, protocol_number::UDP, true, Message::new(b"hi"))?;
        assert_eq!(frames.len(), 1);
        let header = Ipv4Header::from_bytes(frames[0].iter().cloned())?;
        assert_eq!(header.identification, 7);
        assert_eq!(header.total_length, 22);
        assert!(!header.flags.may_fragment());
        assert_eq!(header.source, LOCAL);
        assert_eq!(header.destination, REMOTE);
        assert_eq!(&frames[0][20..], b"hi");
        assert_eq!(link.take_frames(), frames);
        assert_eq!(link.pending_frames(), 0);
        Ok(())
    }

    #[test]
    fn large_datagram_fragments_under_one_identification() -> anyhow::Result<()> {
        let mut link = Link::new(LOCAL, 576, 100, Instant::now());
        let frames = link.send(REMOTE, protocol_number::UDP, false, vec![1u8; 1200].into())?;
        assert_eq!(frames.len(), 3);
        for frame in frames.iter() {
            assert!(frame.len() <= 576);
            let header = Ipv4Header::from_bytes(frame.iter().cloned())?;
            assert_eq!(header.identification, 100);
            assert_eq!(header.total_length as usize, frame.len());
        }
        let next = link.send(REMOTE, protocol_number::UDP, false, Message::new(b"x"))?;
        assert_eq!(Ipv4Header::from_bytes(next[0].iter().cloned())?.identification, 101);
        Ok(())
    }

    #[test]
    fn oversized_dont_fragment_is_reported() {
        let mut link = Link::new(LOCAL, 576, 0, Instant::now());
        let result = link.send(REMOTE, protocol_number::TCP, true, vec![0u8; 1000].into());
        assert!(matches!(
            result,
            Err(SendError::Fragment(FragmentError::DontFragment { .. }))
        ));
        assert_eq!(link.pending_frames(), 0);
    }

    #[test]
    fn resend_replays_identical_frames() -> anyhow::Result<()> {
        let mut link = Link::new(LOCAL, 1500, 0, Instant::now());
        let frames = link.send(REMOTE, protocol_number::TCP, true, Message::new(b"segment"))?;
        link.take_frames();
        link.resend(&frames);
        assert_eq!(link.take_frames(), frames);
        Ok(())
    }
}
