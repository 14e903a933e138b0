//! Mutator-side marking state and the flush handshake.
//!
//! Every attached mutator owns a [`ThreadLocalStacks`] behind a per-thread
//! lock registered in the engine's side table. The owner's barrier pushes
//! take that (uncontended) lock; a flush handshake is another thread taking
//! the same lock and running the flush closure against the target's stacks.
//! This is a per-thread stop-and-run rendezvous, not a global safepoint: at
//! no point do all mutators have to be stopped at once for the periodic
//! flush. Only the final flush at mark end runs under the driver's
//! world-stopped contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::stack::ThreadLocalStacks;

/// A mutator's registration with the mark engine. One per attached thread;
/// the embedding stores it in the thread's local data and passes it to the
/// write barrier.
pub struct MutatorHandle {
    id: u64,
    stacks: Arc<Mutex<ThreadLocalStacks>>,
}

impl MutatorHandle {
    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, ThreadLocalStacks> {
        self.stacks.lock().unwrap()
    }
}

/// Side table of all attached mutators' stacks, keyed by a stable id.
pub(super) struct StackTable {
    next_id: AtomicU64,
    mutators: Mutex<HashMap<u64, Arc<Mutex<ThreadLocalStacks>>>>,
}

impl StackTable {
    pub fn new() -> Self {
        StackTable {
            next_id: AtomicU64::new(0),
            mutators: Mutex::new(HashMap::new()),
        }
    }

    pub fn attach(&self) -> MutatorHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stacks = Arc::new(Mutex::new(ThreadLocalStacks::new()));
        self.mutators.lock().unwrap().insert(id, stacks.clone());
        MutatorHandle { id, stacks }
    }

    /// Remove the handle's registration. The caller still holds the handle's
    /// own reference and is responsible for flushing and freeing the stacks.
    pub fn detach(&self, handle: &MutatorHandle) {
        let removed = self.mutators.lock().unwrap().remove(&handle.id());
        debug_assert!(removed.is_some());
    }

    /// The current set of registered stacks. Taken as a snapshot so flush
    /// handshakes do not hold the table lock while visiting threads.
    pub fn snapshot(&self) -> Vec<Arc<Mutex<ThreadLocalStacks>>> {
        self.mutators.lock().unwrap().values().cloned().collect()
    }
}

/// Stop signal for the periodic flush thread that runs alongside each
/// concurrent mark pass.
pub(super) struct FlushStop {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl FlushStop {
    pub fn new() -> Self {
        FlushStop {
            stopped: Mutex::new(false),
            changed: Condvar::new(),
        }
    }

    /// Sleep for one flush interval. Returns `true` once stopped; a spurious
    /// early wakeup only causes an early flush.
    pub fn wait(&self, interval: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap();
        if *stopped {
            return true;
        }
        let (stopped, _) = self.changed.wait_timeout(stopped, interval).unwrap();
        *stopped
    }

    pub fn stop(&self) {
        *self.stopped.lock().unwrap() = true;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn attach_detach_round_trip() {
        let table = StackTable::new();
        let first = table.attach();
        let second = table.attach();
        assert_ne!(first.id(), second.id());
        assert_eq!(table.snapshot().len(), 2);
        table.detach(&first);
        assert_eq!(table.snapshot().len(), 1);
        table.detach(&second);
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn stop_wakes_waiter() {
        let stop = FlushStop::new();
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let began = Instant::now();
                while !stop.wait(Duration::from_secs(60)) {}
                began.elapsed()
            });
            std::thread::sleep(Duration::from_millis(10));
            stop.stop();
            // The waiter did not sit out the full interval.
            assert!(waiter.join().unwrap() < Duration::from_secs(10));
        });
    }

    #[test]
    fn wait_times_out_when_not_stopped() {
        let stop = FlushStop::new();
        assert!(!stop.wait(Duration::from_millis(1)));
        stop.stop();
        assert!(stop.wait(Duration::from_millis(1)));
    }
}
