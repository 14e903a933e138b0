//! The seams between this crate and the heap it serves.
//!
//! The page table, object layout and root sets live outside this crate. The
//! director consumes a read-only occupancy snapshot; the marker consumes a
//! page lookup, page-level mark/live operations, and object scanning hooks.
//! Implementations are expected to be cheap and lock-free: every operation
//! here sits on the marking hot path.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::util::Address;

/// Occupancy view the director samples once per tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapSnapshot {
    /// The heap's target ceiling. May be below the hard ceiling.
    pub soft_max_capacity: usize,
    pub used: usize,
    /// Has any allocation stalled since the previous cycle started?
    pub has_alloc_stalled: bool,
    /// Memory reserved so relocation can proceed without in-place fallback.
    pub relocation_headroom: usize,
    /// Heap usage when the previous relocation phase finished.
    pub used_at_last_relocate_end: usize,
}

/// How the director observes the heap.
pub trait DirectorHeap: Send + Sync {
    fn snapshot(&self) -> HeapSnapshot;
}

/// Outcome of a page-level mark attempt. The mark bit is set with a CAS;
/// exactly one caller wins per object and strength.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageMark {
    /// This call set the bit. `inc_live` is true when the object was not
    /// counted live before (a finalizable-to-strong upgrade wins the race
    /// but does not count the object again).
    Won { inc_live: bool },
    /// Another thread already marked the object at this strength.
    Lost,
}

/// Page-level operations the marker performs.
pub trait MarkablePage: Sync {
    fn start(&self) -> Address;

    /// Pages still being allocated into hold implicitly marked objects.
    fn is_allocating(&self) -> bool;

    fn mark_object(&self, addr: Address, finalizable: bool) -> PageMark;

    /// Accumulate live object/byte counts. Called from per-worker caches,
    /// typically once per page per worker and cycle.
    fn inc_live(&self, objects: usize, bytes: usize);

    fn object_alignment(&self) -> usize;
}

/// The object model and page lookup the mark engine is generic over.
///
/// Visitor callbacks receive object references, never raw field addresses;
/// null references must be filtered by the implementation.
pub trait HeapModel: 'static + Send + Sync {
    type Page: MarkablePage;

    /// Page lookup by address. The address is a reference previously pushed
    /// into the engine, so it is always backed by a page.
    fn page_for(&self, addr: Address) -> &Self::Page;

    fn object_size(&self, addr: Address) -> usize;

    fn is_object_array(&self, addr: Address) -> bool;

    /// Base address and byte size of an object array's reference payload.
    fn object_array_slice(&self, addr: Address) -> (Address, usize);

    /// Visit every reference held by the object at `addr`.
    fn scan_object(&self, addr: Address, visitor: &mut dyn FnMut(Address));

    /// Visit the references reachable through an object array's class. The
    /// payload itself is scanned separately, possibly split across workers.
    fn scan_array_class(&self, addr: Address, visitor: &mut dyn FnMut(Address));

    /// Visit `nrefs` reference slots starting at `addr`.
    fn scan_slice(&self, addr: Address, nrefs: usize, visitor: &mut dyn FnMut(Address));

    /// Visit this worker's share of the strong roots. Workers partition the
    /// root set among themselves; every root must be visited by exactly one
    /// worker.
    fn scan_roots(&self, worker_id: u32, nworkers: u32, visitor: &mut dyn FnMut(Address));
}

/// Global mark sequence number. Incremented when a cycle prepares marking,
/// invalidating marking state cached on pages by earlier cycles. Pages read
/// it on first touch of a cycle.
static GLOBAL_SEQNUM: AtomicU32 = AtomicU32::new(1);

pub fn global_seqnum() -> u32 {
    GLOBAL_SEQNUM.load(Ordering::Acquire)
}

pub(crate) fn increment_global_seqnum() {
    GLOBAL_SEQNUM.fetch_add(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::serial_test;

    #[test]
    fn seqnum_increments_monotonically() {
        serial_test(|| {
            let before = global_seqnum();
            increment_global_seqnum();
            increment_global_seqnum();
            assert_eq!(global_seqnum(), before + 2);
        });
    }
}
