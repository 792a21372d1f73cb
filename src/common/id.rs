//! Chord ring identifier and circular interval arithmetic.
use std::fmt::{self, Debug, Display, Formatter};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// The bit width `m` of the ring space; there are `2^m` identifiers.
pub const RING_BITS: u32 = 32;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Position of a node (or a lookup target) on the `2^RING_BITS` ring.
pub struct RingId(pub u32);

impl RingId {
    /// Hash an address into the ring space.
    ///
    /// Takes the leading [RING_BITS] bits of the SHA-1 digest of the `host:port` string.
    pub fn from_addr(address: &SocketAddr) -> RingId {
        let digest = sha1_smol::Sha1::from(address.to_string()).digest().bytes();

        RingId(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    /// Returns `(self + 2^i) mod 2^RING_BITS`, the start of finger `i`.
    pub fn finger_start(&self, i: u32) -> RingId {
        debug_assert!(i < RING_BITS);

        RingId(self.0.wrapping_add(1u32 << i))
    }

    /// Returns true if `self` lies strictly inside the open ring interval `(a, b)`.
    ///
    /// See [between_exclusive].
    pub fn is_between(&self, a: RingId, b: RingId) -> bool {
        between_exclusive(self.0 as u64, a.0 as u64, b.0 as u64, RING_BITS)
    }
}

/// Open interval test on a ring of `2^bits` points.
///
/// Walking in increasing direction from just after `a` to just before `b`, is `x` visited?
/// When `a == b` the interval is the full circle minus `a` itself, and when `b` directly
/// follows `a` the interval is empty.
pub fn between_exclusive(x: u64, a: u64, b: u64, bits: u32) -> bool {
    let mask = if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };
    let (x, a, b) = (x & mask, a & mask, b & mask);

    // Distances measured clockwise from `a`.
    let to_x = x.wrapping_sub(a) & mask;
    let to_b = b.wrapping_sub(a) & mask;

    if to_b == 0 {
        return to_x != 0;
    }

    to_x != 0 && to_x < to_b
}

impl Display for RingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl Debug for RingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RingId({})", self)
    }
}

impl From<u32> for RingId {
    fn from(value: u32) -> Self {
        RingId(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wraps_around_zero() {
        assert!(between_exclusive(5, 250, 10, 8));
        assert!(!between_exclusive(250, 5, 10, 8));
        assert!(between_exclusive(255, 250, 10, 8));
        assert!(between_exclusive(0, 250, 10, 8));
        assert!(!between_exclusive(10, 250, 10, 8));
        assert!(!between_exclusive(250, 250, 10, 8));
    }

    #[test]
    fn plain_interval() {
        assert!(between_exclusive(7, 5, 10, 8));
        assert!(!between_exclusive(5, 5, 10, 8));
        assert!(!between_exclusive(11, 5, 10, 8));
    }

    #[test]
    fn degenerate_full_circle() {
        for bits in [3, 8, 16, 32] {
            let size = 1u64 << bits;
            let a = size / 3;

            assert!(!between_exclusive(a, a, a, bits));
            assert!(between_exclusive(a + 1, a, a, bits));
            assert!(between_exclusive(a.wrapping_sub(1) % size, a, a, bits));
            assert!(between_exclusive(0, a, a, bits));
        }
    }

    #[test]
    fn adjacent_is_empty() {
        for x in 0..8 {
            assert!(!between_exclusive(x, 3, 4, 3));
            assert!(!between_exclusive(x, 7, 0, 3));
        }
    }

    #[test]
    fn ring_id_between() {
        let a = RingId(u32::MAX - 2);
        let b = RingId(3);

        assert!(RingId(0).is_between(a, b));
        assert!(RingId(u32::MAX).is_between(a, b));
        assert!(!RingId(3).is_between(a, b));
        assert!(!RingId(100).is_between(a, b));
    }

    #[test]
    fn finger_start_wraps() {
        let id = RingId(u32::MAX);

        assert_eq!(id.finger_start(0), RingId(0));
        assert_eq!(id.finger_start(31), RingId((1 << 31) - 1));
    }

    #[test]
    fn address_hash_is_stable() {
        let address: SocketAddr = "127.0.0.1:7000".parse().unwrap();

        assert_eq!(RingId::from_addr(&address), RingId::from_addr(&address));
        assert_ne!(
            RingId::from_addr(&address),
            RingId::from_addr(&"127.0.0.1:7001".parse().unwrap())
        );
    }
}
