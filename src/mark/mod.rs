//! The concurrent marker: a parallel, work-stealing object-graph traversal
//! partitioned into stripes.
//!
//! A cycle runs `start` → `mark(true)` → `end`, looping back through
//! `mark(false)` while `end` reports leftover work. Workers drain their home
//! stripe, steal published stacks from other stripes, and coordinate
//! termination through a single lock-free state word. Mutators keep marking
//! through the write barrier the whole time; their thread-local buffers are
//! drained by periodic handshakes rather than safepoints.

mod affinity;
mod cache;
mod context;
mod entry;
mod flush;
mod stack;
mod stripe;
mod terminate;

pub use entry::MarkStackEntry;
pub use flush::MutatorHandle;
pub use stack::ThreadLocalStacks;
pub use stripe::{Stripe, StripeMap, StripeSet};
pub use terminate::TerminationState;

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::heap::{self, HeapModel, MarkablePage, PageMark};
use crate::util::constants::*;
use crate::util::conversions::{raw_align_down, raw_align_up, round_down_power_of_two};
use crate::util::options::Options;
use crate::util::Address;
use crate::workers::{WorkerTask, Workers};

use affinity::MarkAffinity;
use cache::MarkCache;
use context::{ConcurrentContext, EndContext, MarkContext};
use flush::{FlushStop, StackTable};
use stack::MarkStackAllocator;

pub struct MarkEngine<H: HeapModel> {
    heap: Arc<H>,
    workers: Arc<Workers>,
    allocator: MarkStackAllocator,
    stripes: StripeSet,
    terminate: TerminationState,
    mutators: StackTable,
    nworkers: AtomicU32,
    nrestart: AtomicU32,
    ncomplete: AtomicU32,
    ncontinue: AtomicU32,
    stripes_max: usize,
    restart_max: u32,
    end_timeout: Duration,
    flush_interval: Duration,
}

impl<H: HeapModel> MarkEngine<H> {
    pub fn new(heap: Arc<H>, workers: Arc<Workers>, options: &Options) -> io::Result<Self> {
        Ok(MarkEngine {
            heap,
            workers,
            allocator: MarkStackAllocator::new(options.mark_stack_space_limit)?,
            stripes: StripeSet::new(),
            terminate: TerminationState::new(),
            mutators: StackTable::new(),
            nworkers: AtomicU32::new(0),
            nrestart: AtomicU32::new(0),
            ncomplete: AtomicU32::new(0),
            ncontinue: AtomicU32::new(0),
            stripes_max: options.mark_stripes_max,
            restart_max: options.mark_restart_max,
            end_timeout: Duration::from_micros(options.mark_end_timeout_us),
            flush_interval: Duration::from_millis(options.mark_flush_interval_ms),
        })
    }

    /// Register the calling thread as a mutator. The returned handle feeds
    /// the thread's write barrier and is the target of flush handshakes.
    pub fn attach_mutator(&self) -> MutatorHandle {
        self.mutators.attach()
    }

    /// Unregister a mutator, publishing and releasing its marking state.
    pub fn detach_mutator(&self, mutator: MutatorHandle) {
        self.mutators.detach(&mutator);
        let mut stacks = mutator.lock();
        let published = stacks.flush(&self.allocator, &self.stripes);
        self.terminate.set_active_stripes(published);
        stacks.free(&self.allocator);
    }

    /// Write-barrier entry point: push an object reference onto the calling
    /// mutator's stacks. `publish` flags newly overflowed stacks in the
    /// termination state so idle workers pick them up.
    pub fn mark_object(
        &self,
        mutator: &MutatorHandle,
        addr: Address,
        follow: bool,
        finalizable: bool,
        publish: bool,
    ) {
        debug_assert!(!addr.is_zero());
        let stripe = self.stripes.stripe_for_addr(addr);
        let entry = MarkStackEntry::object(addr, follow, finalizable);
        mutator
            .lock()
            .push(&self.allocator, &self.terminate, stripe, entry, publish);
    }

    /// Flush one mutator's stacks to the stripes, as a handshake closure
    /// would.
    pub fn flush_mutator(&self, mutator: &MutatorHandle, free_magazine: bool) {
        let mut stacks = mutator.lock();
        self.flush_stacks(&mut stacks, free_magazine);
    }

    /// Begin a cycle. No marking may be in progress.
    pub fn start(&self) {
        self.verify_all_stacks_empty();
        self.prepare_mark();
    }

    fn prepare_mark(&self) {
        // Invalidate marking information cached on pages by earlier cycles.
        heap::increment_global_seqnum();

        self.nrestart.store(0, Ordering::Relaxed);
        self.ncomplete.store(0, Ordering::Relaxed);
        self.ncontinue.store(0, Ordering::Relaxed);

        let nworkers = self.workers.nconcurrent();
        self.nworkers.store(nworkers, Ordering::Relaxed);

        let nstripes = round_down_power_of_two(nworkers as usize).min(self.stripes_max);
        self.stripes.set_nstripes(nstripes);

        if log_enabled!(log::Level::Debug) {
            debug!("Mark Worker/Stripe Distribution");
            for worker_id in 0..nworkers {
                let stripe = self.stripes.stripe_for_worker(nworkers, worker_id);
                debug!(
                    "  Worker {}({}) -> Stripe {}({})",
                    worker_id,
                    nworkers,
                    stripe.id(),
                    nstripes
                );
            }
        }
    }

    /// Run a concurrent mark pass. `initial` additionally scans the strong
    /// roots first. Restarts the pass while periodic flushes surface more
    /// work, up to the restart bound.
    pub fn mark(&self, initial: bool) {
        let nworkers = self.nworkers.load(Ordering::Relaxed);

        if initial {
            self.workers
                .run_concurrent(&ConcurrentRootsTask { engine: self }, nworkers);
        }

        loop {
            let stop = FlushStop::new();
            thread::scope(|scope| {
                thread::Builder::new()
                    .name("gc-mark-flush".into())
                    .spawn_scoped(scope, || self.periodic_flush(&stop))
                    .unwrap();
                self.terminate.reset(nworkers);
                self.workers
                    .run_concurrent(&ConcurrentMarkTask { engine: self }, nworkers);
                stop.stop();
            });

            if !self.restart() {
                break;
            }
        }
    }

    fn periodic_flush(&self, stop: &FlushStop) {
        while !stop.wait(self.flush_interval) {
            trace!("Concurrent Mark Flush Periodic");
            self.flush_mutators(false);
        }
    }

    fn restart(&self) -> bool {
        // Restart a limited number of times per continuation.
        let max = self.restart_max * (self.ncontinue.load(Ordering::Relaxed) + 1);
        if self.nrestart.load(Ordering::Relaxed) == max {
            return false;
        }

        trace!("Concurrent Mark Flush Restart");
        self.flush_mutators(true);

        // Restart marking if the flush surfaced work.
        if self.terminate.has_active_stripes() {
            self.nrestart.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Finish the cycle inside the mark-end pause. Returns `false` when the
    /// pause budget ran out and the driver should loop back to another
    /// concurrent pass.
    pub fn end(&self) -> bool {
        if !self.complete() {
            // Continue concurrent mark
            self.ncontinue.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.verify_all_stacks_empty();

        info!(
            "Mark: {} stack restarts, {} completions, {} continuations",
            self.nrestart.load(Ordering::Relaxed),
            self.ncomplete.load(Ordering::Relaxed),
            self.ncontinue.load(Ordering::Relaxed)
        );
        true
    }

    fn complete(&self) -> bool {
        // Flush every thread. The driver guarantees the world is stopped
        // here, so this is the one flush that is a safepoint in disguise.
        self.flush_mutators(true);
        self.rearm_stripe_flags();
        self.verify_termination();

        if self.terminate.has_active_stripes() {
            // More work is available. Continue marking inside the pause for
            // a bounded amount of time, on a single worker to avoid the cost
            // of starting and stopping the pool.
            self.terminate.reset(1);
            self.workers.run_serial(&EndMarkTask { engine: self });
            self.ncomplete.fetch_add(1, Ordering::Relaxed);
            self.verify_termination();
        }

        !self.terminate.has_active_stripes()
    }

    fn flush_mutators(&self, free_magazine: bool) {
        for stacks in self.mutators.snapshot() {
            let mut stacks = stacks.lock().unwrap();
            self.flush_stacks(&mut stacks, free_magazine);
        }
    }

    fn flush_stacks(&self, stacks: &mut ThreadLocalStacks, free_magazine: bool) {
        let published = stacks.flush(&self.allocator, &self.stripes);
        self.terminate.set_active_stripes(published);
        if free_magazine {
            stacks.free(&self.allocator);
        }
    }

    /// Flag every stripe that holds a stack. Closes the gap for stacks that
    /// reached a stripe without publishing, which is only decidable once the
    /// world is stopped.
    fn rearm_stripe_flags(&self) {
        let mut pending = StripeMap::empty();
        for stripe_id in 0..self.stripes.nstripes() {
            if !self.stripes.stripe_at(stripe_id).is_empty() {
                pending.set(stripe_id);
            }
        }
        self.terminate.set_active_stripes(pending);
    }

    fn verify_all_stacks_empty(&self) {
        for stacks in self.mutators.snapshot() {
            let stacks = stacks.lock().unwrap();
            assert!(stacks.is_empty(&self.allocator), "Should be empty");
            assert!(stacks.is_freed(), "Should be freed");
        }
        assert!(self.stripes.is_empty(), "Should be empty");
    }

    fn verify_termination(&self) {
        // Work sitting on a stripe must be flagged; the flags may lag behind
        // an emptied stripe until the workers consume them.
        assert!(
            self.stripes.is_empty() || self.terminate.has_active_stripes(),
            "Termination state mismatch"
        );
    }

    /// The per-worker loop: drain the home stripe, publish, steal, idle.
    fn work<C: MarkContext>(&self, nworkers: u32, worker_id: u32, context: &mut C) {
        let mut stacks = ThreadLocalStacks::new();
        let mut cache = MarkCache::new(self.stripes.nstripes());
        let affinity = MarkAffinity::for_worker(&self.stripes, nworkers, worker_id);
        let home = self.stripes.stripe_at(affinity.home_stripe());
        let map = affinity.stripe_map();

        loop {
            if !self.drain_and_publish(home, &mut stacks, &mut cache, context) {
                // Timed out
                break;
            }

            if self.steal(home, &mut stacks, map) {
                // Stole work
                continue;
            }

            if self.terminate.idle(map) {
                // Terminate
                break;
            }
        }

        // All work was drained or published; return the stacks.
        debug_assert!(stacks.is_empty(&self.allocator));
        stacks.free(&self.allocator);
    }

    fn drain<'h, C: MarkContext>(
        &'h self,
        stripe: &Stripe,
        stacks: &mut ThreadLocalStacks,
        cache: &mut MarkCache<'h, H::Page>,
        context: &mut C,
    ) -> bool {
        while let Some(entry) = stacks.pop(&self.allocator, stripe) {
            self.mark_and_follow(stacks, cache, entry);

            if context.should_timeout() {
                return false;
            }
        }
        true
    }

    fn drain_and_publish<'h, C: MarkContext>(
        &'h self,
        stripe: &Stripe,
        stacks: &mut ThreadLocalStacks,
        cache: &mut MarkCache<'h, H::Page>,
        context: &mut C,
    ) -> bool {
        let success = self.drain(stripe, stacks, cache, context);
        self.flush_stacks(stacks, false);
        success
    }

    fn steal(&self, home: &Stripe, stacks: &mut ThreadLocalStacks, map: StripeMap) -> bool {
        // Walk the other stripes in stripe order, starting after home.
        let mut victim = self.stripes.stripe_next(home);
        while victim.id() != home.id() {
            if map.get(victim.id()) {
                if let Some(stolen) = victim.steal_stack(&self.allocator) {
                    // The stolen stack is consumed as if it were home work.
                    stacks.install(&self.allocator, home.id(), stolen);
                    return true;
                }
            }
            victim = self.stripes.stripe_next(victim);
        }
        false
    }

    fn mark_and_follow<'h>(
        &'h self,
        stacks: &mut ThreadLocalStacks,
        cache: &mut MarkCache<'h, H::Page>,
        entry: MarkStackEntry,
    ) {
        let finalizable = entry.finalizable();

        if entry.is_partial_array() {
            self.follow_partial_array(stacks, entry, finalizable);
            return;
        }

        let addr = entry.object_address();

        if !self.try_mark_object(cache, addr, finalizable) {
            // Already marked
            return;
        }

        if self.heap.is_object_array(addr) {
            // The follow flag is only relevant for object arrays.
            if entry.follow() {
                self.follow_array_object(stacks, addr, finalizable);
            }
        } else {
            self.follow_object(stacks, addr, finalizable);
        }
    }

    fn try_mark_object<'h>(
        &'h self,
        cache: &mut MarkCache<'h, H::Page>,
        addr: Address,
        finalizable: bool,
    ) -> bool {
        let page = self.heap.page_for(addr);
        if page.is_allocating() {
            // Newly allocated objects are implicitly marked.
            return false;
        }

        match page.mark_object(addr, finalizable) {
            PageMark::Won { inc_live } => {
                if inc_live {
                    // Count the aligned size; alignment padding can never be
                    // reclaimed.
                    let size = self.heap.object_size(addr);
                    let aligned_size = raw_align_up(size, page.object_alignment());
                    cache.inc_live(page, aligned_size);
                }
                true
            }
            PageMark::Lost => false,
        }
    }

    /// The barrier closure used while tracing: mark the referent for
    /// following, flagging its stripe if the push overflows.
    fn mark_and_push(&self, stacks: &mut ThreadLocalStacks, reference: Address, finalizable: bool) {
        if reference.is_zero() {
            return;
        }
        let stripe = self.stripes.stripe_for_addr(reference);
        let entry = MarkStackEntry::object(reference, true, finalizable);
        stacks.push(&self.allocator, &self.terminate, stripe, entry, true);
    }

    fn follow_object(&self, stacks: &mut ThreadLocalStacks, addr: Address, finalizable: bool) {
        self.heap
            .scan_object(addr, &mut |reference| {
                self.mark_and_push(stacks, reference, finalizable)
            });
    }

    fn follow_array_object(
        &self,
        stacks: &mut ThreadLocalStacks,
        addr: Address,
        finalizable: bool,
    ) {
        self.heap
            .scan_array_class(addr, &mut |reference| {
                self.mark_and_push(stacks, reference, finalizable)
            });
        let (base, size) = self.heap.object_array_slice(addr);
        self.follow_array(stacks, base, size, finalizable);
    }

    fn follow_array(
        &self,
        stacks: &mut ThreadLocalStacks,
        addr: Address,
        size: usize,
        finalizable: bool,
    ) {
        if size <= PARTIAL_ARRAY_MIN_SIZE {
            self.follow_small_array(stacks, addr, size, finalizable);
        } else {
            self.follow_large_array(stacks, addr, size, finalizable);
        }
    }

    fn follow_small_array(
        &self,
        stacks: &mut ThreadLocalStacks,
        addr: Address,
        size: usize,
        finalizable: bool,
    ) {
        debug_assert!(size <= PARTIAL_ARRAY_MIN_SIZE);
        trace!("Array follow small: {} ({})", addr, size);

        self.heap
            .scan_slice(addr, size / BYTES_IN_WORD, &mut |reference| {
                self.mark_and_push(stacks, reference, finalizable)
            });
    }

    fn follow_large_array(
        &self,
        stacks: &mut ThreadLocalStacks,
        addr: Address,
        size: usize,
        finalizable: bool,
    ) {
        debug_assert!(size > PARTIAL_ARRAY_MIN_SIZE);
        let start = addr.as_usize();
        let end = start + size;

        // Calculate the aligned middle range. Biasing the middle start past
        // `start` guarantees the leading part is non-empty, so every split
        // does some follow work instead of only splitting.
        let middle_start = raw_align_up(start + 1, PARTIAL_ARRAY_MIN_SIZE);
        let middle_size = raw_align_down(end - middle_start, PARTIAL_ARRAY_MIN_SIZE);
        let middle_end = middle_start + middle_size;

        trace!(
            "Array follow large: {}-{:#x} ({}), middle: {:#x}-{:#x} ({})",
            addr,
            end,
            size,
            middle_start,
            middle_end,
            middle_size
        );

        // Push the unaligned trailing part.
        if end > middle_end {
            self.push_partial_array(
                stacks,
                Address::from_usize(middle_end),
                end - middle_end,
                finalizable,
            );
        }

        // Push the aligned middle, halving from the right into
        // logarithmically many granule-aligned chunks.
        let mut partial_addr = middle_end;
        while partial_addr > middle_start {
            let partial_size =
                raw_align_up((partial_addr - middle_start) / 2, PARTIAL_ARRAY_MIN_SIZE);
            partial_addr -= partial_size;
            self.push_partial_array(
                stacks,
                Address::from_usize(partial_addr),
                partial_size,
                finalizable,
            );
        }

        // Follow the unaligned leading part inline.
        debug_assert!(start < middle_start);
        self.follow_small_array(stacks, addr, middle_start - start, finalizable);
    }

    fn push_partial_array(
        &self,
        stacks: &mut ThreadLocalStacks,
        addr: Address,
        size: usize,
        finalizable: bool,
    ) {
        debug_assert!(addr.is_aligned_to(PARTIAL_ARRAY_MIN_SIZE));
        let stripe = self.stripes.stripe_for_addr(addr);
        let offset = addr.as_usize() >> LOG_PARTIAL_ARRAY_MIN_SIZE;
        let length = size / BYTES_IN_WORD;
        let entry = MarkStackEntry::partial_array(offset, length, finalizable);

        trace!(
            "Array push partial: {} ({}), stripe: {}",
            addr,
            size,
            stripe.id()
        );

        stacks.push(&self.allocator, &self.terminate, stripe, entry, false);
    }

    fn follow_partial_array(
        &self,
        stacks: &mut ThreadLocalStacks,
        entry: MarkStackEntry,
        finalizable: bool,
    ) {
        let addr = entry.partial_array_address();
        let size = entry.partial_array_length() * BYTES_IN_WORD;
        self.follow_array(stacks, addr, size, finalizable);
    }
}

/// Scans each worker's share of the strong roots, then publishes. The stacks
/// are flushed and freed here because the set of workers running root
/// scanning can differ from the set running mark.
struct ConcurrentRootsTask<'e, H: HeapModel> {
    engine: &'e MarkEngine<H>,
}

impl<H: HeapModel> WorkerTask for ConcurrentRootsTask<'_, H> {
    fn work(&self, worker_id: u32) {
        let engine = self.engine;
        let nworkers = engine.nworkers.load(Ordering::Relaxed);
        let mut stacks = ThreadLocalStacks::new();
        engine
            .heap
            .scan_roots(worker_id, nworkers, &mut |reference| {
                engine.mark_and_push(&mut stacks, reference, false)
            });
        engine.flush_stacks(&mut stacks, true);
    }
}

struct ConcurrentMarkTask<'e, H: HeapModel> {
    engine: &'e MarkEngine<H>,
}

impl<H: HeapModel> WorkerTask for ConcurrentMarkTask<'_, H> {
    fn work(&self, worker_id: u32) {
        let nworkers = self.engine.nworkers.load(Ordering::Relaxed);
        self.engine
            .work(nworkers, worker_id, &mut ConcurrentContext);
    }
}

struct EndMarkTask<'e, H: HeapModel> {
    engine: &'e MarkEngine<H>,
}

impl<H: HeapModel> WorkerTask for EndMarkTask<'_, H> {
    fn work(&self, worker_id: u32) {
        let mut context = EndContext::new(self.engine.end_timeout);
        self.engine.work(1, worker_id, &mut context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{MockHeap, MockHeapBuilder};

    fn test_options() -> Options {
        let mut options = Options::default();
        options.mark_stack_space_limit = 4 << 20;
        options
    }

    fn engine_with(heap: MockHeap, nworkers: u32) -> MarkEngine<MockHeap> {
        MarkEngine::new(
            Arc::new(heap),
            Arc::new(Workers::new(nworkers)),
            &test_options(),
        )
        .unwrap()
    }

    fn run_cycle(engine: &MarkEngine<MockHeap>) {
        engine.start();
        engine.mark(true);
        let mut npasses = 0;
        while !engine.end() {
            npasses += 1;
            assert!(npasses < 100, "marking never completed");
            engine.mark(false);
        }
    }

    fn expected_live_bytes(heap: &MockHeap, objects: &[Address]) -> usize {
        objects
            .iter()
            .map(|&a| raw_align_up(heap.object_size(a), BYTES_IN_WORD))
            .sum()
    }

    #[test]
    fn empty_heap_cycle_terminates() {
        let heap = MockHeapBuilder::new().build();
        let engine = engine_with(heap, 2);
        run_cycle(&engine);
        assert_eq!(engine.heap.live_objects(), 0);
        // A second cycle starts from a clean slate.
        run_cycle(&engine);
    }

    #[test]
    fn single_worker_marks_object_graph() {
        let mut builder = MockHeapBuilder::new();
        let leaf_a = builder.leaf();
        let leaf_b = builder.leaf();
        let inner = builder.object(vec![leaf_a, leaf_b]);
        let root = builder.object(vec![inner, leaf_a]);
        builder.root(root);
        // Unreachable object stays unmarked.
        let garbage = builder.leaf();
        let heap = builder.build();

        let engine = engine_with(heap, 1);
        run_cycle(&engine);

        let heap = &engine.heap;
        for addr in [root, inner, leaf_a, leaf_b] {
            assert!(heap.is_strongly_marked(addr), "{} not marked", addr);
        }
        assert!(!heap.is_marked(garbage));
        assert_eq!(heap.live_objects(), 4);
        assert_eq!(
            heap.live_bytes(),
            expected_live_bytes(heap, &[root, inner, leaf_a, leaf_b])
        );
    }

    #[test]
    fn shared_references_are_counted_once() {
        let mut builder = MockHeapBuilder::new();
        let shared = builder.leaf();
        let left = builder.object(vec![shared]);
        let right = builder.object(vec![shared]);
        builder.root(left);
        builder.root(right);
        let heap = builder.build();

        let engine = engine_with(heap, 2);
        run_cycle(&engine);

        assert!(engine.heap.is_strongly_marked(shared));
        assert!(engine.heap.is_strongly_marked(left));
        assert!(engine.heap.is_strongly_marked(right));
        assert_eq!(engine.heap.live_objects(), 3);
    }

    #[test]
    fn large_array_is_split_and_fully_scanned() {
        let _ = env_logger::builder().is_test(true).try_init();

        // An object array with 10000 references: the payload is far larger
        // than the partial-array granule, so it is split into chunks that
        // are stolen and drained across four workers.
        let mut builder = MockHeapBuilder::new();
        let leaves: Vec<Address> = (0..10_000).map(|_| builder.leaf()).collect();
        let array = builder.array(leaves.clone());
        builder.root(array);
        let heap = builder.build();

        let engine = engine_with(heap, 4);
        run_cycle(&engine);

        let heap = &engine.heap;
        assert!(heap.is_strongly_marked(array));
        for &leaf in &leaves {
            assert!(heap.is_strongly_marked(leaf));
        }
        // Every object was counted live exactly once.
        assert_eq!(heap.live_objects(), 10_001);
        let mut all = leaves;
        all.push(array);
        assert_eq!(heap.live_bytes(), expected_live_bytes(heap, &all));
    }

    #[test]
    fn array_straddling_granule_boundaries_scans_every_slot() {
        // Sized so the payload is just past one granule, exercising the
        // unaligned leading and trailing parts of the split.
        let nrefs = (PARTIAL_ARRAY_MIN_SIZE / BYTES_IN_WORD) + 3;
        let mut builder = MockHeapBuilder::new();
        let leaves: Vec<Address> = (0..nrefs).map(|_| builder.leaf()).collect();
        let array = builder.array(leaves.clone());
        builder.root(array);
        let heap = builder.build();

        let engine = engine_with(heap, 2);
        run_cycle(&engine);

        let heap = &engine.heap;
        for &leaf in &leaves {
            assert!(heap.is_strongly_marked(leaf));
        }
        assert_eq!(heap.live_objects(), nrefs + 1);
    }

    #[test]
    fn mutator_barrier_feeds_marking() {
        let mut builder = MockHeapBuilder::new();
        let leaf = builder.leaf();
        let obj = builder.object(vec![leaf]);
        let heap = builder.build();

        let engine = engine_with(heap, 2);
        let mutator = engine.attach_mutator();

        engine.start();
        engine.mark(true);
        // Concurrent mark found nothing; the barrier now surfaces work, as
        // a store into a live object would.
        engine.mark_object(&mutator, obj, true, false, true);
        engine.flush_mutator(&mutator, false);
        engine.mark(false);
        assert!(engine.end());

        assert!(engine.heap.is_strongly_marked(obj));
        assert!(engine.heap.is_strongly_marked(leaf));
        engine.detach_mutator(mutator);
    }

    #[test]
    fn finalizable_mark_upgrades_to_strong_without_double_count() {
        let mut builder = MockHeapBuilder::new();
        let leaf = builder.leaf();
        let heap = builder.build();

        let engine = engine_with(heap, 1);
        let mutator = engine.attach_mutator();

        engine.start();
        engine.mark(true);

        engine.mark_object(&mutator, leaf, false, true, true);
        engine.flush_mutator(&mutator, false);
        engine.mark(false);
        assert!(engine.heap.is_marked(leaf));
        assert!(!engine.heap.is_strongly_marked(leaf));

        engine.mark_object(&mutator, leaf, false, false, true);
        engine.flush_mutator(&mutator, false);
        engine.mark(false);
        assert!(engine.end());

        assert!(engine.heap.is_strongly_marked(leaf));
        assert_eq!(engine.heap.live_objects(), 1);
        engine.detach_mutator(mutator);
    }

    #[test]
    fn end_pause_timeout_continues_concurrently() {
        // A tiny end budget with work that only shows up at mark end: the
        // first end() must give up and request another concurrent pass.
        let mut builder = MockHeapBuilder::new();
        let mut chain = Address::ZERO;
        for _ in 0..20_000 {
            chain = if chain.is_zero() {
                builder.leaf()
            } else {
                builder.object(vec![chain])
            };
        }
        let heap = builder.build();

        let mut options = test_options();
        options.mark_stack_space_limit = 16 << 20;
        options.mark_end_timeout_us = 1;
        let engine =
            MarkEngine::new(Arc::new(heap), Arc::new(Workers::new(1)), &options).unwrap();
        let mutator = engine.attach_mutator();

        engine.start();
        // Only the mutator knows about the chain; concurrent mark sees
        // nothing until the final flush.
        engine.mark_object(&mutator, chain, true, false, false);
        assert!(!engine.end());

        let mut npasses = 0;
        loop {
            engine.mark(false);
            if engine.end() {
                break;
            }
            npasses += 1;
            assert!(npasses < 100, "marking never completed");
        }
        assert_eq!(engine.heap.live_objects(), 20_000);
        engine.detach_mutator(mutator);
    }

    #[test]
    fn worker_count_determines_stripe_count() {
        let heap = MockHeapBuilder::new().build();
        let workers = Arc::new(Workers::new(6));
        let engine =
            MarkEngine::new(Arc::new(heap), workers.clone(), &test_options()).unwrap();

        engine.start();
        // Six workers round down to four stripes.
        assert_eq!(engine.stripes.nstripes(), 4);
        engine.mark(true);
        assert!(engine.end());

        workers.set_nconcurrent(1);
        engine.start();
        assert_eq!(engine.stripes.nstripes(), 1);
        engine.mark(true);
        assert!(engine.end());
    }

    #[test]
    fn detach_publishes_pending_work() {
        let mut builder = MockHeapBuilder::new();
        let leaf = builder.leaf();
        let heap = builder.build();

        let engine = engine_with(heap, 1);
        engine.start();
        let mutator = engine.attach_mutator();
        engine.mark_object(&mutator, leaf, false, false, false);
        engine.detach_mutator(mutator);

        engine.mark(true);
        assert!(engine.end());
        assert!(engine.heap.is_strongly_marked(leaf));
    }
}
