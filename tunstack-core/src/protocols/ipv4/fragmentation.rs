//! Splits outbound datagrams to fit the link MTU, following the procedure in
//! RFC 791 section 3.2 page 26.

use super::ipv4_parsing::Ipv4Header;
use crate::message::Message;
use thiserror::Error as ThisError;

/// A piece of a datagram
pub type Fragment = (Ipv4Header, Message);

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum FragmentError {
    #[error("A {length} byte datagram exceeds the {mtu} byte MTU and may not be fragmented")]
    DontFragment { length: usize, mtu: u16 },
    #[error("An MTU of {0} bytes cannot carry any payload")]
    MtuTooSmall(u16),
}

/// Divides a datagram into pieces that each fit within `mtu` bytes. The
/// header's total length is taken from `body`, and every returned header
/// carries the total length of its own piece. A datagram that already fits is
/// returned as a single piece.
pub fn fragment(
    mut header: Ipv4Header,
    mut body: Message,
    mtu: u16,
) -> Result<Vec<Fragment>, FragmentError> {
    let header_length = header.header_length() as usize;
    let length = header_length + body.len();
    if length <= mtu as usize {
        header.total_length = length as u16;
        return Ok(vec![(header, body)]);
    }
    if !header.flags.may_fragment() {
        Err(FragmentError::DontFragment { length, mtu })?
    }

    // NFB <- (MTU-IHL*4)/8
    let fragment_blocks = (mtu as usize).saturating_sub(header_length) / 8;
    if fragment_blocks == 0 {
        Err(FragmentError::MtuTooSmall(mtu))?
    }

    let original_is_last = header.flags.is_last_fragment();
    let mut fragments = Vec::with_capacity(body.len() / (fragment_blocks * 8) + 1);
    while header_length + body.len() > mtu as usize {
        let piece = body.cut(fragment_blocks * 8);
        let mut first = header;
        first.flags.set_is_last_fragment(false);
        first.total_length = (header_length + piece.len()) as u16;
        fragments.push((first, piece));
        header.fragment_offset += fragment_blocks as u16;
    }
    header.flags.set_is_last_fragment(original_is_last);
    header.total_length = (header_length + body.len()) as u16;
    fragments.push((header, body));
    Ok(fragments)
}
