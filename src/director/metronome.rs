use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A fixed-rate tick source.
///
/// Ticks are laid out on a grid anchored at construction time, so a late
/// wakeup does not shift subsequent ticks; a caller that falls behind gets
/// its missed ticks back-to-back until it catches up. Stopping is
/// cooperative and wakes a blocked waiter immediately.
pub struct Metronome {
    interval: Duration,
    start: Instant,
    sync: Mutex<MetronomeSync>,
    stopped_or_tick: Condvar,
}

struct MetronomeSync {
    nticks: u64,
    stopped: bool,
}

impl Metronome {
    pub fn new(hz: u32) -> Self {
        debug_assert!(hz > 0);
        Metronome {
            interval: Duration::from_secs(1) / hz,
            start: Instant::now(),
            sync: Mutex::new(MetronomeSync {
                nticks: 0,
                stopped: false,
            }),
            stopped_or_tick: Condvar::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleep until the next tick. Returns `false` once stopped.
    pub fn wait_for_tick(&self) -> bool {
        let mut sync = self.sync.lock().unwrap();
        let next =
            self.start + Duration::from_nanos(self.interval.as_nanos() as u64 * (sync.nticks + 1));
        loop {
            if sync.stopped {
                return false;
            }
            let now = Instant::now();
            if now >= next {
                sync.nticks += 1;
                return true;
            }
            let (guard, _) = self
                .stopped_or_tick
                .wait_timeout(sync, next - now)
                .unwrap();
            sync = guard;
        }
    }

    pub fn nticks(&self) -> u64 {
        self.sync.lock().unwrap().nticks
    }

    pub fn stop(&self) {
        self.sync.lock().unwrap().stopped = true;
        self.stopped_or_tick.notify_all();
    }
}
