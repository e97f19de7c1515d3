//! Comparisons on the 32-bit sequence number ring.

/// a < b under modular arithmetic
pub fn mod_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// a <= b under modular arithmetic
pub fn mod_leq(a: u32, b: u32) -> bool {
    a == b || mod_le(a, b)
}
