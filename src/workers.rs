//! A minimal facade over the worker pool the mark engine schedules onto.
//!
//! Workers are plain OS threads fanned out per phase and joined before the
//! phase ends, so a task borrow never outlives its run. The concurrent
//! worker count may be retargeted between cycles (the driver applies the
//! director's recommendation); it is read once per cycle in `prepare_mark`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

/// A unit of work fanned out over the pool. `work` is called once per
/// worker with that worker's id.
pub trait WorkerTask: Sync {
    fn work(&self, worker_id: u32);
}

pub struct Workers {
    nconcurrent: AtomicU32,
}

impl Workers {
    pub fn new(nconcurrent: u32) -> Self {
        assert!(nconcurrent > 0);
        Workers {
            nconcurrent: AtomicU32::new(nconcurrent),
        }
    }

    /// Number of workers the next concurrent phase will use.
    pub fn nconcurrent(&self) -> u32 {
        self.nconcurrent.load(Ordering::Relaxed)
    }

    /// Retarget the pool. Takes effect at the next cycle's prepare.
    pub fn set_nconcurrent(&self, nworkers: u32) {
        self.nconcurrent.store(nworkers.max(1), Ordering::Relaxed);
    }

    /// Run `task` on `nworkers` threads and join them all.
    pub fn run_concurrent<T: WorkerTask>(&self, task: &T, nworkers: u32) {
        debug_assert!(nworkers > 0);
        thread::scope(|scope| {
            for worker_id in 0..nworkers {
                thread::Builder::new()
                    .name(format!("gc-worker-{}", worker_id))
                    .spawn_scoped(scope, move || task.work(worker_id))
                    .unwrap();
            }
        });
    }

    /// Run `task` on the calling thread as worker 0.
    pub fn run_serial<T: WorkerTask>(&self, task: &T) {
        task.work(0);
    }
}
