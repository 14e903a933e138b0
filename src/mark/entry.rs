use std::fmt;

use crate::util::constants::LOG_PARTIAL_ARRAY_MIN_SIZE;
use crate::util::Address;

//
// Mark stack entry layout
// -----------------------
//
//   6
//   3                                                                    2 1 0
//  +----------------------------------------------------------------------+-+-+
//  |11111111 11111111 11111111 11111111 11111111 11111111 11111111 11111|1|1|1|
//  +----------------------------------------------------------------------+-+-+
//  |                                                                      | | |
//  |                      0-0 Finalizable flag (1-bit) -------------------+-+ |
//  |                      1-1 Partial array flag (1-bit) -----------------+   |
//  |                                                                      |
//  +-- object entry:      2-2 Follow flag (1-bit),                        |
//  |                     63-3 Object address (61-bits)                    |
//  |                                                                      |
//  +-- partial array:    31-2 Length in references (30-bits) -------------+
//                       63-32 Offset, address >> granule shift (32-bits)
//

const FINALIZABLE_BIT: u64 = 1 << 0;
const PARTIAL_ARRAY_BIT: u64 = 1 << 1;
const FOLLOW_BIT: u64 = 1 << 2;

const OBJECT_ADDRESS_SHIFT: u32 = 3;
const OBJECT_ADDRESS_BITS: u32 = 61;

const PARTIAL_LENGTH_SHIFT: u32 = 2;
const PARTIAL_LENGTH_BITS: u32 = 30;
const PARTIAL_OFFSET_SHIFT: u32 = 32;
const PARTIAL_OFFSET_BITS: u32 = 32;

/// One word of deferred marking work: either an object reference to mark and
/// follow, or a partial-array slice whose references remain to be scanned.
/// Every entry decodes to exactly one variant and encoding is lossless for
/// the documented field widths.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MarkStackEntry(u64);

const _: () = assert!(std::mem::size_of::<MarkStackEntry>() == 8);

impl MarkStackEntry {
    pub fn object(addr: Address, follow: bool, finalizable: bool) -> Self {
        debug_assert!((addr.as_usize() as u64) < (1 << OBJECT_ADDRESS_BITS));
        let mut entry = (addr.as_usize() as u64) << OBJECT_ADDRESS_SHIFT;
        if follow {
            entry |= FOLLOW_BIT;
        }
        if finalizable {
            entry |= FINALIZABLE_BIT;
        }
        MarkStackEntry(entry)
    }

    pub fn partial_array(offset: usize, length: usize, finalizable: bool) -> Self {
        debug_assert!((offset as u64) < (1u64 << PARTIAL_OFFSET_BITS));
        debug_assert!((length as u64) < (1 << PARTIAL_LENGTH_BITS));
        let mut entry = ((offset as u64) << PARTIAL_OFFSET_SHIFT)
            | ((length as u64) << PARTIAL_LENGTH_SHIFT)
            | PARTIAL_ARRAY_BIT;
        if finalizable {
            entry |= FINALIZABLE_BIT;
        }
        MarkStackEntry(entry)
    }

    pub fn is_partial_array(self) -> bool {
        self.0 & PARTIAL_ARRAY_BIT != 0
    }

    pub fn finalizable(self) -> bool {
        self.0 & FINALIZABLE_BIT != 0
    }

    pub fn follow(self) -> bool {
        debug_assert!(!self.is_partial_array());
        self.0 & FOLLOW_BIT != 0
    }

    pub fn object_address(self) -> Address {
        debug_assert!(!self.is_partial_array());
        Address::from_usize((self.0 >> OBJECT_ADDRESS_SHIFT) as usize)
    }

    pub fn partial_array_offset(self) -> usize {
        debug_assert!(self.is_partial_array());
        (self.0 >> PARTIAL_OFFSET_SHIFT) as usize
    }

    pub fn partial_array_length(self) -> usize {
        debug_assert!(self.is_partial_array());
        ((self.0 >> PARTIAL_LENGTH_SHIFT) & ((1 << PARTIAL_LENGTH_BITS) - 1)) as usize
    }

    /// The slice's starting address, recovered from the granule-aligned
    /// offset.
    pub fn partial_array_address(self) -> Address {
        Address::from_usize(self.partial_array_offset() << LOG_PARTIAL_ARRAY_MIN_SIZE)
    }
}

impl fmt::Debug for MarkStackEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_partial_array() {
            write!(
                f,
                "PartialArray({}, {} refs, finalizable: {})",
                self.partial_array_address(),
                self.partial_array_length(),
                self.finalizable()
            )
        } else {
            write!(
                f,
                "Object({}, follow: {}, finalizable: {})",
                self.object_address(),
                self.follow(),
                self.finalizable()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::PARTIAL_ARRAY_MIN_SIZE;

    #[test]
    fn object_round_trip() {
        for addr in [0usize, 0x10, 0xdead_beef0, (1 << 61) - 8] {
            for follow in [false, true] {
                for finalizable in [false, true] {
                    let entry =
                        MarkStackEntry::object(Address::from_usize(addr), follow, finalizable);
                    assert!(!entry.is_partial_array());
                    assert_eq!(entry.object_address().as_usize(), addr);
                    assert_eq!(entry.follow(), follow);
                    assert_eq!(entry.finalizable(), finalizable);
                }
            }
        }
    }

    #[test]
    fn partial_array_round_trip() {
        for offset in [0usize, 1, 0xffff, u32::MAX as usize] {
            for length in [0usize, 1, 512, (1 << 30) - 1] {
                for finalizable in [false, true] {
                    let entry = MarkStackEntry::partial_array(offset, length, finalizable);
                    assert!(entry.is_partial_array());
                    assert_eq!(entry.partial_array_offset(), offset);
                    assert_eq!(entry.partial_array_length(), length);
                    assert_eq!(entry.finalizable(), finalizable);
                }
            }
        }
    }

    #[test]
    fn partial_array_address_recovers_granule_aligned_address() {
        let addr = Address::from_usize(13 * PARTIAL_ARRAY_MIN_SIZE);
        let offset = addr.as_usize() >> super::LOG_PARTIAL_ARRAY_MIN_SIZE;
        let entry = MarkStackEntry::partial_array(offset, 42, false);
        assert_eq!(entry.partial_array_address(), addr);
    }

    #[test]
    fn variants_are_disjoint() {
        let object = MarkStackEntry::object(Address::from_usize(0x1000), true, false);
        let partial = MarkStackEntry::partial_array(1, 1, false);
        assert!(!object.is_partial_array());
        assert!(partial.is_partial_array());
        assert_ne!(object, partial);
    }
}
