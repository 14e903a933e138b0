use std::time::{Duration, Instant};

/// Entries drained between deadline checks in the end context. Reading the
/// clock per entry would dominate the cost of small objects.
const TIMEOUT_CHECK_INTERVAL: u64 = 100;

/// Policy parameterizing the worker loop. Checked after every drained entry.
pub trait MarkContext {
    fn should_timeout(&mut self) -> bool;
}

/// Concurrent marking runs to completion; mutators keep running alongside.
pub struct ConcurrentContext;

impl MarkContext for ConcurrentContext {
    #[inline]
    fn should_timeout(&mut self) -> bool {
        false
    }
}

/// Mark-end marking runs inside a pause and must give up at its deadline so
/// the pause stays bounded; the caller then falls back to another concurrent
/// pass.
pub struct EndContext {
    deadline: Instant,
    ndrained: u64,
    check_at: u64,
    expired: bool,
}

impl EndContext {
    pub fn new(timeout: Duration) -> Self {
        EndContext {
            deadline: Instant::now() + timeout,
            ndrained: 0,
            check_at: TIMEOUT_CHECK_INTERVAL,
            expired: false,
        }
    }
}

impl MarkContext for EndContext {
    fn should_timeout(&mut self) -> bool {
        if self.expired {
            return true;
        }
        self.ndrained += 1;
        if self.ndrained < self.check_at {
            return false;
        }
        self.check_at = self.ndrained + TIMEOUT_CHECK_INTERVAL;
        self.expired = Instant::now() >= self.deadline;
        self.expired
    }
}
