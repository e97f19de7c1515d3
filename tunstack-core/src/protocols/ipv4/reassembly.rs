//! Rebuilds fragmented inbound datagrams.
//!
//! Fragments are buffered per `(identification, source)` until the piece at
//! offset zero, the terminal piece and every piece between them have arrived.
//! Incomplete datagrams are evicted by [`Reassembly::sweep`].

use super::{ipv4_parsing::Ipv4Header, Ipv4Address};
use crate::message::Message;
use rustc_hash::FxHashMap;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// How long an incomplete datagram is held before it is discarded
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufId {
    identification: u16,
    source: Ipv4Address,
}

impl BufId {
    pub fn from_header(header: &Ipv4Header) -> Self {
        Self {
            identification: header.identification,
            source: header.source,
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    created: Instant,
    /// Fragments keyed by byte offset
    pieces: BTreeMap<usize, (Ipv4Header, Message)>,
    /// Byte offset of the fragment without more-fragments set
    terminal: Option<usize>,
}

impl Pending {
    fn new(created: Instant) -> Self {
        Self {
            created,
            pieces: BTreeMap::new(),
            terminal: None,
        }
    }

    fn is_complete(&self) -> bool {
        let Some(terminal) = self.terminal else {
            return false;
        };
        let mut offset = 0;
        loop {
            let Some((_, body)) = self.pieces.get(&offset) else {
                return false;
            };
            if offset == terminal {
                return true;
            }
            if body.is_empty() {
                return false;
            }
            offset += body.len();
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Reassembly {
    pending: FxHashMap<BufId, Pending>,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a fragment and returns the whole datagram once it is complete.
    /// The returned header is that of the first fragment with its total
    /// length covering the reassembled payload and its fragmentation fields
    /// cleared. A datagram that was never fragmented is returned unchanged.
    pub fn ingest(
        &mut self,
        header: Ipv4Header,
        body: Message,
        now: Instant,
    ) -> Option<(Ipv4Header, Message)> {
        if !header.is_fragment() {
            return Some((header, body));
        }

        let buf_id = BufId::from_header(&header);
        let end = header.byte_offset() + body.len() + header.header_length() as usize;
        if end > u16::MAX as usize {
            tracing::debug!(
                "Discarding datagram {} from {}: fragments reach {} bytes",
                header.identification,
                header.source,
                end
            );
            self.pending.remove(&buf_id);
            return None;
        }
        let pending = self
            .pending
            .entry(buf_id)
            .or_insert_with(|| Pending::new(now));
        let offset = header.byte_offset();
        if header.flags.is_last_fragment() {
            pending.terminal = Some(offset);
        }
        pending.pieces.insert(offset, (header, body));

        if !pending.is_complete() {
            return None;
        }

        let pending = self.pending.remove(&buf_id)?;
        let terminal = pending.terminal?;
        let mut pieces = pending.pieces.into_iter();
        let (_, (mut first, mut message)) = pieces.next()?;
        let mut next = message.len();
        for (offset, (_, body)) in pieces {
            if offset > terminal {
                break;
            }
            // Overlapping retransmitted pieces are skipped
            if offset == next {
                next += body.len();
                message.concatenate(body);
            }
        }
        first.total_length = u16::try_from(first.header_length() as usize + message.len()).ok()?;
        first.fragment_offset = 0;
        first.flags.set_is_last_fragment(true);
        Some((first, message))
    }

    /// Drops incomplete datagrams older than [`REASSEMBLY_TIMEOUT`] and
    /// returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| now.saturating_duration_since(pending.created) <= REASSEMBLY_TIMEOUT);
        before - self.pending.len()
    }

    /// The number of datagrams awaiting fragments.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ipv4::{fragment, ControlFlags, Ipv4HeaderBuilder};

    fn fragments_of(len: usize, identification: u16) -> (Vec<u8>, Vec<(Ipv4Header, Message)>) {
        let bytes: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
        let header =
            Ipv4HeaderBuilder::new([10, 0, 0, 1].into(), [10, 0, 0, 2].into(), 17, len as u16)
                .identification(identification)
                .flags(ControlFlags::new(true, true))
                .build()
                .unwrap();
        let pieces = fragment(header, Message::new(bytes.clone()), 1500).unwrap();
        (bytes, pieces)
    }

    fn reassemble_in(order: &[usize]) -> Option<(Ipv4Header, Message)> {
        let (_, pieces) = fragments_of(3700, 42);
        let mut reassembly = Reassembly::new();
        let now = Instant::now();
        let mut result = None;
        for (i, &which) in order.iter().enumerate() {
            let (header, body) = pieces[which].clone();
            let out = reassembly.ingest(header, body, now);
            if i + 1 < order.len() {
                assert!(out.is_none(), "completed early at step {i}");
            } else {
                result = out;
            }
        }
        assert_eq!(reassembly.pending(), 0);
        result
    }

    #[test]
    fn any_arrival_order_reassembles() {
        let (bytes, _) = fragments_of(3700, 42);
        for order in [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ] {
            let (header, body) = reassemble_in(&order).unwrap();
            assert_eq!(body.to_vec(), bytes, "order {order:?}");
            assert_eq!(header.total_length, 3720);
            assert!(!header.is_fragment());
        }
    }

    #[test]
    fn unfragmented_datagram_passes_through() {
        let (_, pieces) = fragments_of(100, 1);
        let (header, body) = pieces[0].clone();
        let mut reassembly = Reassembly::new();
        assert_eq!(
            reassembly.ingest(header, body.clone(), Instant::now()),
            Some((header, body))
        );
    }

    #[test]
    fn interleaved_datagrams_stay_apart() {
        let (first_bytes, first) = fragments_of(3000, 1);
        let (second_bytes, second) = fragments_of(3000, 2);
        let mut reassembly = Reassembly::new();
        let now = Instant::now();
        for i in 0..first.len() - 1 {
            let (h, b) = first[i].clone();
            assert!(reassembly.ingest(h, b, now).is_none());
            let (h, b) = second[i].clone();
            assert!(reassembly.ingest(h, b, now).is_none());
        }
        let (h, b) = second.last().unwrap().clone();
        let (_, body) = reassembly.ingest(h, b, now).unwrap();
        assert_eq!(body.to_vec(), second_bytes);
        let (h, b) = first.last().unwrap().clone();
        let (_, body) = reassembly.ingest(h, b, now).unwrap();
        assert_eq!(body.to_vec(), first_bytes);
    }

    #[test]
    fn datagrams_longer_than_ipv4_allows_are_discarded() {
        let piece = |offset_blocks: u16, len: usize, last: bool| {
            let header =
                Ipv4HeaderBuilder::new([10, 0, 0, 1].into(), [10, 0, 0, 2].into(), 17, len as u16)
                    .identification(5)
                    .fragment_offset(offset_blocks)
                    .flags(ControlFlags::new(true, last))
                    .build()
                    .unwrap();
            (header, Message::new(vec![0u8; len]))
        };
        let mut reassembly = Reassembly::new();
        let now = Instant::now();
        let (h, b) = piece(0, 1480, false);
        assert!(reassembly.ingest(h, b, now).is_none());
        assert_eq!(reassembly.pending(), 1);

        // 65440 + 200 bytes of data plus the header overflows the length field
        let (h, b) = piece(8180, 200, true);
        assert!(reassembly.ingest(h, b, now).is_none());
        assert_eq!(reassembly.pending(), 0);
    }

    #[test]
    fn sweep_evicts_stale_entries() {
        let (_, pieces) = fragments_of(3700, 9);
        let mut reassembly = Reassembly::new();
        let start = Instant::now();
        let (h, b) = pieces[0].clone();
        assert!(reassembly.ingest(h, b, start).is_none());
        assert_eq!(reassembly.sweep(start + Duration::from_secs(30)), 0);
        assert_eq!(reassembly.sweep(start + Duration::from_secs(31)), 1);
        assert_eq!(reassembly.pending(), 0);

        // The remaining pieces now start a fresh, incomplete entry
        let (h, b) = pieces[1].clone();
        assert!(reassembly.ingest(h, b, start).is_none());
        let (h, b) = pieces[2].clone();
        assert!(reassembly.ingest(h, b, start).is_none());
    }
}
