//! Log sequence numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a segment file. Ids start at 1; 0 never names a file.
pub type SegmentId = u64;

/// Log sequence number: (segment_id, offset_within_segment) packed as
/// a single u64: `segment_id << 40 | offset`. This gives ~1TB per
/// segment and ~16 million segments.
///
/// An LSN carries end-offset semantics: a record's LSN is the byte
/// offset just *after* it in its segment. The LSN recorded as flushed
/// is therefore exactly the position replay resumes from, and LSN
/// order equals on-disk order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(u64);

impl Lsn {
    pub(crate) const OFFSET_BITS: u64 = 40;
    pub(crate) const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    /// The zero sentinel: no records, no progress.
    pub const ZERO: Lsn = Lsn(0);

    pub fn new(segment_id: SegmentId, offset: u64) -> Self {
        debug_assert!(offset <= Self::OFFSET_MASK, "offset too large");
        Self((segment_id << Self::OFFSET_BITS) | offset)
    }

    pub fn segment_id(&self) -> SegmentId {
        self.0 >> Self::OFFSET_BITS
    }

    pub fn offset(&self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id(), self.offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_lsn_pack_unpack() {
        let lsn = Lsn::new(3, 4096);
        assert_eq!(lsn.segment_id(), 3);
        assert_eq!(lsn.offset(), 4096);
        assert_eq!(Lsn::from_u64(lsn.as_u64()), lsn);
    }

    #[test]
    fn test_lsn_zero() {
        assert!(Lsn::ZERO.is_zero());
        assert_eq!(Lsn::ZERO.segment_id(), 0);
        assert_eq!(Lsn::ZERO.offset(), 0);
        assert!(!Lsn::new(1, 0).is_zero());
    }

    #[test]
    fn test_lsn_ordering_across_segments() {
        // Any offset in a later segment orders after any offset in an
        // earlier one.
        let end_of_first = Lsn::new(1, Lsn::OFFSET_MASK);
        let start_of_second = Lsn::new(2, 0);
        assert!(end_of_first < start_of_second);
        assert!(Lsn::new(1, 100) < Lsn::new(1, 101));
    }

    #[test]
    fn test_lsn_display() {
        assert_eq!(Lsn::new(2, 77).to_string(), "2:77");
    }

    proptest! {
        #[test]
        fn prop_lsn_roundtrip(segment in 1u64..(1 << 20), offset in 0u64..=Lsn::OFFSET_MASK) {
            let lsn = Lsn::new(segment, offset);
            prop_assert_eq!(lsn.segment_id(), segment);
            prop_assert_eq!(lsn.offset(), offset);
        }

        #[test]
        fn prop_lsn_order_matches_position(
            seg_a in 1u64..1000, off_a in 0u64..=Lsn::OFFSET_MASK,
            seg_b in 1u64..1000, off_b in 0u64..=Lsn::OFFSET_MASK,
        ) {
            let a = Lsn::new(seg_a, off_a);
            let b = Lsn::new(seg_b, off_b);
            prop_assert_eq!(a < b, (seg_a, off_a) < (seg_b, off_b));
        }
    }
}
