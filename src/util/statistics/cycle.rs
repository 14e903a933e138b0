use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use atomic_refcell::AtomicRefCell;
use enum_map::EnumMap;

use super::rate::RateStats;
use crate::driver::Cause;

/// Cycles to complete before the heap is considered warm.
const WARMUP_CYCLES: u32 = 3;

/// Window for the per-cycle time statistics. The decaying terms dominate the
/// director's estimates; the window only serves the plain average.
const CYCLE_TIME_WINDOW: usize = 10;

/// Decaying estimate of a per-cycle time component, in seconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeEstimate {
    pub davg: f64,
    pub dsd: f64,
}

/// Rolling statistics over collection cycles.
///
/// The driver reports cycle boundaries; the director reads the aggregate
/// state on its tick. A cycle's wall time is split into the serial part and
/// the parallelizable part, each tracked separately so the director can
/// predict the duration of a cycle run with a different worker count.
pub struct CycleStats {
    ncycles: AtomicU32,
    nwarmup_cycles: AtomicU32,
    last_active_workers: AtomicU32,
    /// Only touched by the driver at cycle boundaries.
    current_cause: AtomicRefCell<Option<Cause>>,
    /// Written by the driver, read by the director on its tick.
    end_of_last: Mutex<Instant>,
    serial_time: Mutex<RateStats>,
    parallelizable_time: Mutex<RateStats>,
    ncompleted: EnumMap<Cause, AtomicU32>,
}

impl CycleStats {
    pub fn new() -> Self {
        CycleStats {
            ncycles: AtomicU32::new(0),
            nwarmup_cycles: AtomicU32::new(0),
            last_active_workers: AtomicU32::new(0),
            current_cause: AtomicRefCell::new(None),
            // Heap initialization counts as the end of a zeroth cycle, so
            // time_since_last is well defined from the first tick.
            end_of_last: Mutex::new(Instant::now()),
            serial_time: Mutex::new(RateStats::new(CYCLE_TIME_WINDOW)),
            parallelizable_time: Mutex::new(RateStats::new(CYCLE_TIME_WINDOW)),
            ncompleted: EnumMap::default(),
        }
    }

    /// Called by the driver when a cycle starts.
    pub fn at_start(&self, cause: Cause, nworkers: u32) {
        if cause == Cause::Warmup {
            self.nwarmup_cycles.fetch_add(1, Ordering::Relaxed);
        }
        self.last_active_workers.store(nworkers, Ordering::Relaxed);
        *self.current_cause.borrow_mut() = Some(cause);
    }

    /// Called by the driver when a cycle completes, with the measured serial
    /// and parallelizable wall times in seconds.
    pub fn at_end(&self, serial_seconds: f64, parallelizable_seconds: f64) {
        self.serial_time.lock().unwrap().add(serial_seconds);
        self.parallelizable_time
            .lock()
            .unwrap()
            .add(parallelizable_seconds);
        self.ncycles.fetch_add(1, Ordering::Relaxed);
        if let Some(cause) = self.current_cause.borrow_mut().take() {
            self.ncompleted[cause].fetch_add(1, Ordering::Relaxed);
        }
        *self.end_of_last.lock().unwrap() = Instant::now();
    }

    /// True once enough cycles have completed that the warmup rule should
    /// stay out of the way.
    pub fn is_warm(&self) -> bool {
        self.ncycles.load(Ordering::Relaxed) >= WARMUP_CYCLES
    }

    /// True once at least one cycle has contributed time samples.
    pub fn is_time_trustable(&self) -> bool {
        self.ncycles.load(Ordering::Relaxed) > 0
    }

    pub fn nwarmup_cycles(&self) -> u32 {
        self.nwarmup_cycles.load(Ordering::Relaxed)
    }

    pub fn last_active_workers(&self) -> u32 {
        self.last_active_workers.load(Ordering::Relaxed)
    }

    /// Seconds since the last cycle ended.
    pub fn time_since_last(&self) -> f64 {
        self.end_of_last.lock().unwrap().elapsed().as_secs_f64()
    }

    pub fn serial_time(&self) -> TimeEstimate {
        let stats = self.serial_time.lock().unwrap();
        TimeEstimate {
            davg: stats.davg(),
            dsd: stats.dsd(),
        }
    }

    pub fn parallelizable_time(&self) -> TimeEstimate {
        let stats = self.parallelizable_time.lock().unwrap();
        TimeEstimate {
            davg: stats.davg(),
            dsd: stats.dsd(),
        }
    }

    pub fn ncompleted(&self, cause: Cause) -> u32 {
        self.ncompleted[cause].load(Ordering::Relaxed)
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}
