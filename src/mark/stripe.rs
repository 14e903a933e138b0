//! Stripes shard the object-address space so workers mostly stay on their
//! own slice of the heap. The stripe for an address is a fixed hash over the
//! bits above the page shift, so all references into one page share a stripe
//! for the whole cycle.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::constants::{LOG_BYTES_IN_PAGE, MARK_STRIPES_LIMIT};
use crate::util::Address;

use super::stack::{MarkStackAllocator, StackList};

/// Bitmap over stripe ids. Fits the low half of the termination word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StripeMap(u32);

impl StripeMap {
    pub fn empty() -> Self {
        StripeMap(0)
    }

    pub fn single(stripe_id: usize) -> Self {
        debug_assert!(stripe_id < MARK_STRIPES_LIMIT);
        StripeMap(1 << stripe_id)
    }

    pub fn all(nstripes: usize) -> Self {
        debug_assert!(nstripes >= 1 && nstripes <= MARK_STRIPES_LIMIT);
        if nstripes == MARK_STRIPES_LIMIT {
            StripeMap(u32::MAX)
        } else {
            StripeMap((1 << nstripes) - 1)
        }
    }

    pub fn set(&mut self, stripe_id: usize) {
        debug_assert!(stripe_id < MARK_STRIPES_LIMIT);
        self.0 |= 1 << stripe_id;
    }

    pub fn get(&self, stripe_id: usize) -> bool {
        debug_assert!(stripe_id < MARK_STRIPES_LIMIT);
        self.0 & (1 << stripe_id) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for StripeMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StripeMap({:#034b})", self.0)
    }
}

/// One stripe: a stable id and a lock-free overflow list of full mark
/// stacks. Owning workers publish; any worker whose stripe map covers this
/// stripe may steal.
pub struct Stripe {
    id: usize,
    overflow: StackList,
}

impl Stripe {
    fn new(id: usize) -> Self {
        Stripe {
            id,
            overflow: StackList::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(super) fn publish_stack(&self, allocator: &MarkStackAllocator, idx: u32) {
        self.overflow.push(idx, allocator.links());
    }

    pub(super) fn steal_stack(&self, allocator: &MarkStackAllocator) -> Option<u32> {
        self.overflow.pop(allocator.links())
    }

    pub fn is_empty(&self) -> bool {
        self.overflow.is_empty()
    }
}

/// The cycle's set of stripes. All [`MARK_STRIPES_LIMIT`] stripes exist for
/// the lifetime of the engine; `set_nstripes` narrows how many are in use
/// for the coming cycle.
pub struct StripeSet {
    nstripes: AtomicUsize,
    stripes: Vec<Stripe>,
}

impl StripeSet {
    pub fn new() -> Self {
        StripeSet {
            nstripes: AtomicUsize::new(1),
            stripes: (0..MARK_STRIPES_LIMIT).map(Stripe::new).collect(),
        }
    }

    /// Set the stripe count for the next cycle. Called between cycles only.
    pub fn set_nstripes(&self, nstripes: usize) {
        assert!(nstripes.is_power_of_two());
        assert!(nstripes >= 1 && nstripes <= MARK_STRIPES_LIMIT);
        self.nstripes.store(nstripes, Ordering::Relaxed);
        debug!("Using {} mark stripes", nstripes);
    }

    pub fn nstripes(&self) -> usize {
        self.nstripes.load(Ordering::Relaxed)
    }

    pub fn stripe_at(&self, stripe_id: usize) -> &Stripe {
        debug_assert!(stripe_id < self.nstripes());
        &self.stripes[stripe_id]
    }

    /// The stripe an address hashes to. Stable within a cycle; ignores the
    /// in-page bits so one page never spans stripes.
    pub fn stripe_for_addr(&self, addr: Address) -> &Stripe {
        let index = (addr.as_usize() >> LOG_BYTES_IN_PAGE) & (self.nstripes() - 1);
        &self.stripes[index]
    }

    /// Cyclic successor of `stripe`.
    pub fn stripe_next(&self, stripe: &Stripe) -> &Stripe {
        let index = (stripe.id() + 1) & (self.nstripes() - 1);
        &self.stripes[index]
    }

    /// The home stripe for a worker. Each stripe gets at least
    /// `nworkers / nstripes` natural workers; the remainder spill over
    /// evenly across the stripes.
    pub fn stripe_for_worker(&self, nworkers: u32, worker_id: u32) -> &Stripe {
        let nstripes = self.nstripes();
        let nworkers = nworkers as usize;
        let worker_id = worker_id as usize;
        debug_assert!(worker_id < nworkers);
        let spillover_limit = (nworkers / nstripes) * nstripes;

        let index = if worker_id < spillover_limit {
            // Not a spillover worker, use the natural stripe.
            worker_id & (nstripes - 1)
        } else {
            // Distribute spillover workers evenly across stripes.
            let spillover_nworkers = nworkers - spillover_limit;
            let spillover_worker_id = worker_id - spillover_limit;
            let spillover_chunk = nstripes as f64 / spillover_nworkers as f64;
            (spillover_worker_id as f64 * spillover_chunk) as usize
        };

        debug_assert!(index < nstripes);
        &self.stripes[index]
    }

    /// True when no in-use stripe holds a published stack.
    pub fn is_empty(&self) -> bool {
        self.stripes[..self.nstripes()].iter().all(Stripe::is_empty)
    }
}

impl Default for StripeSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::{BYTES_IN_PAGE, MARK_STACK_BYTES};

    #[test]
    fn stripe_map_operations() {
        let mut map = StripeMap::empty();
        assert!(map.is_empty());
        map.set(0);
        map.set(5);
        assert!(map.get(0));
        assert!(map.get(5));
        assert!(!map.get(1));
        assert_eq!(map.bits(), 0b100001);
        assert_eq!(StripeMap::all(4).bits(), 0b1111);
        assert_eq!(StripeMap::all(MARK_STRIPES_LIMIT).bits(), u32::MAX);
        assert_eq!(StripeMap::single(3).bits(), 0b1000);
    }

    #[test]
    fn addresses_in_one_page_share_a_stripe() {
        let stripes = StripeSet::new();
        stripes.set_nstripes(8);
        let page_base = Address::from_usize(7 * BYTES_IN_PAGE);
        let first = stripes.stripe_for_addr(page_base).id();
        for offset in [8, 256, BYTES_IN_PAGE - 8] {
            assert_eq!(stripes.stripe_for_addr(page_base + offset).id(), first);
        }
        // The next page may hash elsewhere, but stays stable.
        let next = stripes.stripe_for_addr(page_base + BYTES_IN_PAGE).id();
        assert_eq!(
            stripes.stripe_for_addr(page_base + BYTES_IN_PAGE).id(),
            next
        );
    }

    #[test]
    fn stripe_next_cycles() {
        let stripes = StripeSet::new();
        stripes.set_nstripes(4);
        let mut stripe = stripes.stripe_at(0);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(stripe.id());
            stripe = stripes.stripe_next(stripe);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(stripe.id(), 0);
    }

    #[test]
    fn single_stripe_wraps_to_itself() {
        let stripes = StripeSet::new();
        stripes.set_nstripes(1);
        let stripe = stripes.stripe_at(0);
        assert_eq!(stripes.stripe_next(stripe).id(), 0);
        assert_eq!(
            stripes
                .stripe_for_addr(Address::from_usize(123 * BYTES_IN_PAGE))
                .id(),
            0
        );
    }

    #[test]
    fn worker_assignment_covers_every_stripe() {
        let stripes = StripeSet::new();
        for &(nworkers, nstripes) in
            &[(1u32, 1usize), (4, 4), (5, 4), (7, 4), (8, 4), (9, 8), (13, 8), (32, 16)]
        {
            stripes.set_nstripes(nstripes);
            let mut per_stripe = vec![0usize; nstripes];
            for worker_id in 0..nworkers {
                per_stripe[stripes.stripe_for_worker(nworkers, worker_id).id()] += 1;
            }
            let natural = nworkers as usize / nstripes;
            for (stripe_id, &count) in per_stripe.iter().enumerate() {
                assert!(
                    count >= natural,
                    "stripe {} got {} workers (nworkers={}, nstripes={})",
                    stripe_id,
                    count,
                    nworkers,
                    nstripes
                );
            }
        }
    }

    #[test]
    fn publish_and_steal_round_trip() {
        let allocator = MarkStackAllocator::new(8 * MARK_STACK_BYTES).unwrap();
        let stripes = StripeSet::new();
        stripes.set_nstripes(2);
        let stripe = stripes.stripe_at(1);
        assert!(stripe.is_empty());
        assert!(stripe.steal_stack(&allocator).is_none());

        let idx = allocator.alloc_stack().unwrap();
        stripe.publish_stack(&allocator, idx);
        assert!(!stripe.is_empty());
        assert!(!stripes.is_empty());

        assert_eq!(stripe.steal_stack(&allocator), Some(idx));
        assert!(stripes.is_empty());
    }
}
