//! The seam between the director and the driver that executes collection
//! cycles. The director only ever emits requests; stopping the world,
//! relocating and running the mark engine are the driver's business.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use enum_map::Enum;

/// Why a collection cycle was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Enum)]
pub enum Cause {
    AllocStall,
    Warmup,
    Timer,
    AllocRate,
    HighUsage,
    Proactive,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Cause::AllocStall => "Allocation Stall",
            Cause::Warmup => "Warmup",
            Cause::Timer => "Timer",
            Cause::AllocRate => "Allocation Rate",
            Cause::HighUsage => "High Usage",
            Cause::Proactive => "Proactive",
        };
        f.write_str(s)
    }
}

/// A director decision. `cause == None` means "do not collect"; the worker
/// count is still the director's current recommendation either way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverRequest {
    pub cause: Option<Cause>,
    pub nworkers: u32,
}

impl DriverRequest {
    pub fn new(cause: Cause, nworkers: u32) -> Self {
        DriverRequest {
            cause: Some(cause),
            nworkers,
        }
    }

    pub fn no_gc(nworkers: u32) -> Self {
        DriverRequest {
            cause: None,
            nworkers,
        }
    }

    pub fn should_collect(&self) -> bool {
        self.cause.is_some()
    }
}

/// What the director needs from a driver: a cheap busy probe and a way to
/// hand over a firing request. The driver may clamp the suggested worker
/// count before acting on it.
pub trait Driver: Send + Sync {
    fn is_busy(&self) -> bool;
    fn collect(&self, request: DriverRequest);
}

/// A request mailbox for driver threads.
///
/// The director posts requests through the [`Driver`] impl; a driver thread
/// blocks in [`wait_for_request`](CollectRequester::wait_for_request) and
/// reports cycle completion with [`done`](CollectRequester::done). The atomic
/// flag lets `is_busy`/`collect` stay off the mutex on the repeated-request
/// path.
pub struct CollectRequester {
    request_flag: AtomicBool,
    busy: AtomicBool,
    request: Mutex<Option<DriverRequest>>,
    request_posted: Condvar,
}

impl CollectRequester {
    pub fn new() -> Self {
        CollectRequester {
            request_flag: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            request: Mutex::new(None),
            request_posted: Condvar::new(),
        }
    }

    /// Block until a request arrives, then claim it. The requester counts as
    /// busy until [`done`](CollectRequester::done) is called.
    pub fn wait_for_request(&self) -> DriverRequest {
        let mut pending = self.request.lock().unwrap();
        loop {
            if let Some(request) = pending.take() {
                self.busy.store(true, Ordering::Relaxed);
                self.request_flag.store(false, Ordering::Relaxed);
                return request;
            }
            pending = self.request_posted.wait(pending).unwrap();
        }
    }

    /// Report that the claimed cycle has finished.
    pub fn done(&self) {
        self.busy.store(false, Ordering::Relaxed);
    }
}

impl Default for CollectRequester {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for CollectRequester {
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed) || self.request_flag.load(Ordering::Relaxed)
    }

    fn collect(&self, request: DriverRequest) {
        debug_assert!(request.should_collect());
        if self.request_flag.swap(true, Ordering::Relaxed) {
            // A request is already pending.
            return;
        }
        *self.request.lock().unwrap() = Some(request);
        self.request_posted.notify_one();
    }
}
