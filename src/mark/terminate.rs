//! Lock-free termination coordination for the mark workers.
//!
//! All coordination state lives in one 64-bit word: the high half counts
//! workers that are not idle, the low half is a bitmap of stripes known to
//! hold published work. A worker that finds nothing to drain or steal tries
//! to go idle; the last worker to do so with no active stripes flips the
//! word to the terminate sentinel, which no later transition can undo.

use std::thread;
use std::time::Duration;

use atomic::{Atomic, Ordering};

use super::stripe::StripeMap;

/// Worker-count value marking the terminated state.
const TERMINATE: u32 = u32::MAX;

/// Back-off while idling between termination attempts.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

//
// Termination state layout
// ------------------------
//
//   6                                 3 3
//   3                                 2 1                                 0
//  +-----------------------------------+-----------------------------------+
//  |11111111 11111111 11111111 11111111|11111111 11111111 11111111 11111111|
//  +-----------------------------------+-----------------------------------+
//  |                                   |
//  |                                   * 31-0 Active stripe flags (32-bits)
//  |
//  * 63-32 Number of active workers (32-bits)
//
#[derive(Clone, Copy, PartialEq, Eq, bytemuck::NoUninit)]
#[repr(transparent)]
struct TerminateWord(u64);

impl TerminateWord {
    fn new(nactive_workers: u32, active_stripes: u32) -> Self {
        TerminateWord(((nactive_workers as u64) << 32) | active_stripes as u64)
    }

    fn nactive_workers(self) -> u32 {
        (self.0 >> 32) as u32
    }

    fn active_stripes(self) -> u32 {
        self.0 as u32
    }

    fn is_cleared(self) -> bool {
        self.0 == 0
    }
}

pub struct TerminationState {
    state: Atomic<TerminateWord>,
}

impl TerminationState {
    pub fn new() -> Self {
        TerminationState {
            state: Atomic::new(TerminateWord::new(0, 0)),
        }
    }

    /// Arm the state for a task run with `nworkers` workers.
    pub fn reset(&self, nworkers: u32) {
        self.state
            .store(TerminateWord::new(nworkers, 0), Ordering::Release);
    }

    /// Flag the stripes in `map` as holding published work.
    pub fn set_active_stripes(&self, map: StripeMap) {
        let mut old = self.state.load(Ordering::Acquire);
        loop {
            let new_stripes = old.active_stripes() | map.bits();
            if new_stripes == old.active_stripes() {
                // Already set
                return;
            }
            let new = TerminateWord::new(old.nactive_workers(), new_stripes);
            match self
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    pub fn has_active_stripes(&self) -> bool {
        self.state.load(Ordering::Acquire).active_stripes() != 0
    }

    /// If none of the worker's watched stripes are flagged, decrement the
    /// active-worker count and report that the worker should idle.
    /// Otherwise clear those flags and keep the worker active.
    fn enter_idle_mode(&self, map: StripeMap) -> bool {
        let mut old = self.state.load(Ordering::Acquire);
        loop {
            debug_assert!(!old.is_cleared());
            let new_stripes = old.active_stripes() & !map.bits();
            let should_idle = new_stripes == old.active_stripes();
            let new_workers = if should_idle {
                old.nactive_workers() - 1
            } else {
                old.nactive_workers()
            };
            let new = TerminateWord::new(new_workers, new_stripes);
            match self
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return should_idle,
                Err(current) => old = current,
            }
        }
    }

    /// Leave idle mode if any watched stripe was flagged since. The flags
    /// stay set so other idlers also notice; they are cleared when workers
    /// on those stripes enter idle mode again.
    fn exit_idle_mode(&self, map: StripeMap) -> bool {
        let mut old = self.state.load(Ordering::Acquire);
        loop {
            if old.active_stripes() & map.bits() == 0 {
                // Stripe flags cleared
                return false;
            }
            if old.nactive_workers() == TERMINATE {
                // Workers are terminating
                return false;
            }
            debug_assert!(!old.is_cleared());
            let new = TerminateWord::new(old.nactive_workers() + 1, old.active_stripes());
            match self
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => old = current,
            }
        }
    }

    /// Enter the terminate state if every worker is idle and no stripe is
    /// flagged. The terminate sentinel keeps other workers from leaving
    /// idle mode, so they observe termination on their next attempt.
    fn enter_terminate_mode(&self) -> bool {
        let mut old = self.state.load(Ordering::Acquire);
        loop {
            if old.nactive_workers() == TERMINATE {
                return true;
            }
            if old.nactive_workers() != 0 || old.active_stripes() != 0 {
                // More work is available or some worker is still active
                return false;
            }
            let new = TerminateWord::new(TERMINATE, 0);
            match self
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => old = current,
            }
        }
    }

    /// The worker wait loop. Returns `true` when marking has terminated and
    /// `false` when the worker should resume, either because its stripes
    /// were flagged before it went idle or because new work was published
    /// while it idled.
    pub fn idle(&self, map: StripeMap) -> bool {
        if !self.enter_idle_mode(map) {
            return false;
        }

        loop {
            if self.enter_terminate_mode() {
                return true;
            }
            if self.exit_idle_mode(map) {
                return false;
            }
            thread::sleep(IDLE_SLEEP);
        }
    }

    #[cfg(test)]
    pub(super) fn nactive_workers(&self) -> u32 {
        self.state.load(Ordering::Acquire).nactive_workers()
    }

    #[cfg(test)]
    pub(super) fn active_stripes(&self) -> u32 {
        self.state.load(Ordering::Acquire).active_stripes()
    }
}

impl Default for TerminationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_packs_both_fields() {
        let word = TerminateWord::new(3, 0b101);
        assert_eq!(word.nactive_workers(), 3);
        assert_eq!(word.active_stripes(), 0b101);
        assert!(!word.is_cleared());
        assert!(TerminateWord::new(0, 0).is_cleared());
    }

    #[test]
    fn last_worker_terminates() {
        let terminate = TerminationState::new();
        terminate.reset(1);
        assert!(terminate.idle(StripeMap::all(4)));
        // Terminated state is sticky.
        assert!(terminate.enter_terminate_mode());
    }

    #[test]
    fn flagged_stripe_keeps_worker_active() {
        let terminate = TerminationState::new();
        terminate.reset(1);
        terminate.set_active_stripes(StripeMap::single(2));
        // The worker's map covers stripe 2, so it must not idle; the flag is
        // consumed in the process.
        assert!(!terminate.idle(StripeMap::all(4)));
        assert_eq!(terminate.active_stripes(), 0);
        assert_eq!(terminate.nactive_workers(), 1);
        // Nothing flagged now, so the worker terminates.
        assert!(terminate.idle(StripeMap::all(4)));
    }

    #[test]
    fn set_active_stripes_accumulates() {
        let terminate = TerminationState::new();
        terminate.reset(2);
        terminate.set_active_stripes(StripeMap::single(0));
        terminate.set_active_stripes(StripeMap::single(3));
        assert_eq!(terminate.active_stripes(), 0b1001);
        assert!(terminate.has_active_stripes());
    }

    #[test]
    fn idler_resumes_when_work_is_published() {
        let terminate = TerminationState::new();
        terminate.reset(2);

        std::thread::scope(|scope| {
            // Worker 0 goes idle; nothing is flagged yet and worker 1 is
            // still notionally active, so it cannot terminate.
            let idler = scope.spawn(|| terminate.idle(StripeMap::all(4)));

            // Worker 1 publishes work, waking the idler, then terminates
            // itself once its own stripes are clean.
            std::thread::sleep(Duration::from_millis(10));
            terminate.set_active_stripes(StripeMap::single(1));
            let resumed = !idler.join().unwrap();
            assert!(resumed);
        });

        // Worker 0 resumed and will re-enter idle after draining; worker 1
        // still counts as active.
        assert_eq!(terminate.nactive_workers(), 2);
    }

    #[test]
    fn two_workers_terminate_together() {
        crate::util::test_util::panic_after(5000, || {
            let terminate = TerminationState::new();
            terminate.reset(2);

            std::thread::scope(|scope| {
                let workers: Vec<_> = (0..2)
                    .map(|_| scope.spawn(|| terminate.idle(StripeMap::all(4))))
                    .collect();
                for worker in workers {
                    assert!(worker.join().unwrap());
                }
            });
        });
    }

    #[test]
    fn no_exit_from_terminate() {
        let terminate = TerminationState::new();
        terminate.reset(1);
        assert!(terminate.idle(StripeMap::all(4)));
        // Publishing after termination flags the stripe but cannot revive
        // workers.
        terminate.set_active_stripes(StripeMap::single(0));
        assert!(!terminate.exit_idle_mode(StripeMap::all(4)));
        assert_eq!(terminate.nactive_workers(), TERMINATE);
    }
}
