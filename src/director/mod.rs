//! The director: a heuristic controller deciding when to start a collection
//! cycle and how many workers the cycle should use.
//!
//! A dedicated thread ticks at `sample_hz`, samples the allocation rate, and
//! evaluates an ordered rule list against the heap occupancy and the cycle
//! history. The first rule that wants a collection wins and its request is
//! forwarded to the driver; everything else is a no-op until the next tick.

mod metronome;

pub use metronome::Metronome;

use std::sync::Arc;
use std::thread;

use crate::driver::{Cause, Driver, DriverRequest};
use crate::heap::{DirectorHeap, HeapSnapshot};
use crate::util::options::Options;
use crate::util::statistics::{AllocRateSampler, CycleStats, TimeEstimate};

/// One-tailed z-score for p = 0.001. "Max" estimates are formed as
/// `avg + sd * ONE_IN_1000`, bounding the odds of a sample beyond the
/// estimate to one in a thousand.
const ONE_IN_1000: f64 = 3.290527;

/// Wall-time a single cycle should stay under, in seconds. Worker selection
/// adds workers rather than let a cycle stretch past this.
const AVOID_LONG_GC_WALLTIME: f64 = 10.0;

/// Relative standard deviation above which the allocation rate is treated
/// as volatile.
const ALLOC_RATE_SD_THRESHOLD: f64 = 0.15;

const M: f64 = (1 << 20) as f64;

/// Tunables copied out of [`Options`] at spawn; the director re-reads none
/// of them afterwards.
#[derive(Clone, Debug)]
pub struct DirectorTunables {
    pub sample_interval: f64,
    pub collection_interval: f64,
    pub spike_tolerance: f64,
    pub proactive: bool,
    pub conc_gc_threads: u32,
    pub use_dynamic_gc_threads: bool,
}

impl DirectorTunables {
    fn from_options(options: &Options) -> Self {
        DirectorTunables {
            sample_interval: 1.0 / options.sample_hz as f64,
            collection_interval: options.collection_interval,
            spike_tolerance: options.allocation_spike_tolerance,
            proactive: options.proactive,
            conc_gc_threads: options.conc_gc_threads,
            use_dynamic_gc_threads: options.use_dynamic_gc_threads,
        }
    }
}

/// Everything a tick's rule evaluation reads, snapshotted up front so the
/// rules are pure functions of this struct.
struct RuleInputs {
    heap: HeapSnapshot,
    alloc_rate_avg: f64,
    alloc_rate_sd: f64,
    serial_time: TimeEstimate,
    parallelizable_time: TimeEstimate,
    is_warm: bool,
    is_time_trustable: bool,
    nwarmup_cycles: u32,
    last_active_workers: u32,
    time_since_last: f64,
    tunables: DirectorTunables,
}

struct DirectorShared {
    metronome: Metronome,
    heap: Arc<dyn DirectorHeap>,
    driver: Arc<dyn Driver>,
    sampler: Arc<AllocRateSampler>,
    cycle_stats: Arc<CycleStats>,
    tunables: DirectorTunables,
}

impl DirectorShared {
    fn rule_inputs(&self) -> RuleInputs {
        RuleInputs {
            heap: self.heap.snapshot(),
            alloc_rate_avg: self.sampler.avg(),
            alloc_rate_sd: self.sampler.sd(),
            serial_time: self.cycle_stats.serial_time(),
            parallelizable_time: self.cycle_stats.parallelizable_time(),
            is_warm: self.cycle_stats.is_warm(),
            is_time_trustable: self.cycle_stats.is_time_trustable(),
            nwarmup_cycles: self.cycle_stats.nwarmup_cycles(),
            last_active_workers: self.cycle_stats.last_active_workers(),
            time_since_last: self.cycle_stats.time_since_last(),
            tunables: self.tunables.clone(),
        }
    }
}

/// The director thread. Stops cooperatively on drop.
pub struct Director {
    shared: Arc<DirectorShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Director {
    pub fn spawn(
        heap: Arc<dyn DirectorHeap>,
        driver: Arc<dyn Driver>,
        sampler: Arc<AllocRateSampler>,
        cycle_stats: Arc<CycleStats>,
        options: &Options,
    ) -> Director {
        let shared = Arc::new(DirectorShared {
            metronome: Metronome::new(options.sample_hz),
            heap,
            driver,
            sampler,
            cycle_stats,
            tunables: DirectorTunables::from_options(options),
        });
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("gc-director".into())
                .spawn(move || run_service(&shared))
                .unwrap()
        };
        Director {
            shared,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.shared.metronome.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Director {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_service(shared: &DirectorShared) {
    while shared.metronome.wait_for_tick() {
        sample_allocation_rate(shared);
        if !shared.driver.is_busy() {
            let request = make_gc_decision(&shared.rule_inputs());
            if request.should_collect() {
                shared.driver.collect(request);
            }
        }
    }
}

fn sample_allocation_rate(shared: &DirectorShared) {
    // Sample the allocation rate. This feeds the allocation-rate rule's
    // estimate of the time we have until we run out of memory.
    let bytes_per_second = shared.sampler.sample_and_reset();

    debug!(
        "Allocation Rate: {:.1}MB/s, Avg: {:.1}(+/-{:.1})MB/s",
        bytes_per_second / M,
        shared.sampler.avg() / M,
        shared.sampler.sd() / M
    );
}

fn make_gc_decision(inputs: &RuleInputs) -> DriverRequest {
    const RULES: &[fn(&RuleInputs) -> DriverRequest] = &[
        rule_allocation_stall,
        rule_warmup,
        rule_timer,
        rule_allocation_rate,
        rule_high_usage,
        rule_proactive,
    ];

    for rule in RULES {
        let request = rule(inputs);
        if request.should_collect() {
            return request;
        }
    }

    DriverRequest::no_gc(inputs.tunables.conc_gc_threads)
}

/// Free memory available to mutators, net of the relocation headroom.
fn free_memory(heap: &HeapSnapshot) -> usize {
    let free_including_headroom = heap.soft_max_capacity - heap.used.min(heap.soft_max_capacity);
    free_including_headroom - heap.relocation_headroom.min(free_including_headroom)
}

/// Upper confidence bound of a time estimate.
fn upper_bound(estimate: TimeEstimate) -> f64 {
    estimate.davg + estimate.dsd * ONE_IN_1000
}

fn rule_allocation_stall(inputs: &RuleInputs) -> DriverRequest {
    // Collect if we've observed at least one allocation stall since the
    // last cycle started.
    let stall_since_last_gc = inputs.heap.has_alloc_stalled;

    debug!(
        "Rule: Allocation Stall Since Last GC: {}",
        if stall_since_last_gc { "Yes" } else { "No" }
    );

    if !stall_since_last_gc {
        return DriverRequest::no_gc(inputs.tunables.conc_gc_threads);
    }

    DriverRequest::new(Cause::AllocStall, inputs.tunables.conc_gc_threads)
}

fn rule_warmup(inputs: &RuleInputs) -> DriverRequest {
    if inputs.is_warm {
        // Rule disabled
        return DriverRequest::no_gc(inputs.tunables.conc_gc_threads);
    }

    // Collect when heap usage passes 10/20/30% on a cold heap. This buys
    // early samples of the cycle duration, which the other rules need.
    let used_threshold_percent = (inputs.nwarmup_cycles + 1) as f64 * 0.1;
    let used_threshold = (inputs.heap.soft_max_capacity as f64 * used_threshold_percent) as usize;

    debug!(
        "Rule: Warmup {:.0}%, Used: {:.0}MB, UsedThreshold: {:.0}MB",
        used_threshold_percent * 100.0,
        inputs.heap.used as f64 / M,
        used_threshold as f64 / M
    );

    if inputs.heap.used < used_threshold {
        return DriverRequest::no_gc(inputs.tunables.conc_gc_threads);
    }

    DriverRequest::new(Cause::Warmup, inputs.tunables.conc_gc_threads)
}

fn rule_timer(inputs: &RuleInputs) -> DriverRequest {
    let interval = inputs.tunables.collection_interval;
    if interval <= 0.0 {
        // Rule disabled
        return DriverRequest::no_gc(inputs.tunables.conc_gc_threads);
    }

    // Collect if the timer has expired.
    let time_until_gc = interval - inputs.time_since_last;

    debug!(
        "Rule: Timer, Interval: {:.3}s, TimeUntilGC: {:.3}s",
        interval, time_until_gc
    );

    if time_until_gc > 0.0 {
        return DriverRequest::no_gc(inputs.tunables.conc_gc_threads);
    }

    DriverRequest::new(Cause::Timer, inputs.tunables.conc_gc_threads)
}

fn estimated_gc_workers(
    serial_gc_time: f64,
    parallelizable_gc_time: f64,
    time_until_deadline: f64,
) -> f64 {
    let parallelizable_time_until_deadline = (time_until_deadline - serial_gc_time).max(0.001);
    parallelizable_gc_time / parallelizable_time_until_deadline
}

fn discrete_gc_workers(gc_workers: f64, nworkers_limit: u32) -> u32 {
    (gc_workers.ceil() as i64).clamp(1, nworkers_limit as i64) as u32
}

fn select_gc_workers(
    inputs: &RuleInputs,
    serial_gc_time: f64,
    parallelizable_gc_time: f64,
    time_until_oom: f64,
) -> f64 {
    // Number of workers needed to keep the cycle short, and to finish
    // before the heap runs dry.
    let avoid_long_gc_workers =
        estimated_gc_workers(serial_gc_time, parallelizable_gc_time, AVOID_LONG_GC_WALLTIME);
    let avoid_oom_gc_workers =
        estimated_gc_workers(serial_gc_time, parallelizable_gc_time, time_until_oom);
    let gc_workers = avoid_long_gc_workers.max(avoid_oom_gc_workers);
    let actual_gc_workers = discrete_gc_workers(gc_workers, inputs.tunables.conc_gc_threads);
    let last_gc_workers = inputs.last_active_workers;

    if actual_gc_workers < last_gc_workers {
        // Before shrinking the crew, check whether the next cycle would
        // have to grow it again: fewer workers stretch this cycle, which
        // eats into the allocation headroom the next cycle starts with.
        let gc_duration_delta = parallelizable_gc_time / actual_gc_workers as f64
            - parallelizable_gc_time / last_gc_workers as f64;
        let additional_time_for_allocations =
            inputs.time_since_last - gc_duration_delta - inputs.tunables.sample_interval;
        let next_time_until_oom = time_until_oom + additional_time_for_allocations;
        let next_avoid_oom_gc_workers =
            estimated_gc_workers(serial_gc_time, parallelizable_gc_time, next_time_until_oom);
        let next_gc_workers = avoid_long_gc_workers.max(next_avoid_oom_gc_workers);

        // Half a worker of friction against lowering too eagerly.
        return (next_gc_workers + 0.5).ceil().min(last_gc_workers as f64);
    }

    gc_workers
}

fn rule_allocation_rate_dynamic(inputs: &RuleInputs) -> DriverRequest {
    let nworkers_limit = inputs.tunables.conc_gc_threads;
    if !inputs.is_time_trustable {
        // Rule disabled
        return DriverRequest::no_gc(nworkers_limit);
    }

    let free = free_memory(&inputs.heap) as f64;

    // Estimate the time until OOM from the free memory and the max
    // allocation rate: the moving average scaled by the spike tolerance,
    // plus ~3.3 sigma for the variance. One extra byte per second guards
    // the division.
    let alloc_rate_avg = inputs.alloc_rate_avg;
    let alloc_rate_sd = inputs.alloc_rate_sd;
    let alloc_rate_sd_percent = alloc_rate_sd / (alloc_rate_avg + 1.0);
    let alloc_rate_steady = alloc_rate_sd_percent < ALLOC_RATE_SD_THRESHOLD;
    let alloc_rate =
        alloc_rate_avg * inputs.tunables.spike_tolerance + alloc_rate_sd * ONE_IN_1000 + 1.0;
    let mut time_until_oom = free / alloc_rate;

    if !alloc_rate_steady {
        // The estimate leans on the observed rate; when the rate is
        // volatile, deflate the estimate to react promptly to a spike.
        time_until_oom /= 1.0 + alloc_rate_sd_percent;
    }

    let serial_gc_time = upper_bound(inputs.serial_time);
    let parallelizable_gc_time = upper_bound(inputs.parallelizable_time);

    let mut gc_workers =
        select_gc_workers(inputs, serial_gc_time, parallelizable_gc_time, time_until_oom);

    if !alloc_rate_steady {
        // Never shrink the crew while the allocation rate is volatile.
        gc_workers = gc_workers.max(inputs.last_active_workers as f64);
    }

    let actual_gc_workers = discrete_gc_workers(gc_workers, nworkers_limit);
    let actual_gc_duration =
        serial_gc_time + parallelizable_gc_time / actual_gc_workers as f64;
    let last_gc_workers = inputs.last_active_workers;

    // Deduct the sample interval so we do not overshoot the target and
    // start too late in the next interval, and keep extra slack when
    // running with fewer workers than the limit allows.
    let sample_interval = inputs.tunables.sample_interval;
    let more_safety_for_fewer_workers =
        (nworkers_limit - actual_gc_workers) as f64 * sample_interval;
    let time_until_gc =
        time_until_oom - actual_gc_duration - sample_interval - more_safety_for_fewer_workers;

    debug!(
        "Rule: Allocation Rate (Dynamic GC Threads), MaxAllocRate: {:.1}MB/s (+/-{:.1}%), \
         Free: {:.0}MB, GCDuration: {:.3}s, TimeUntilOOM: {:.3}s, TimeUntilGC: {:.3}s, \
         GCWorkers: {} -> {}",
        alloc_rate / M,
        alloc_rate_sd_percent * 100.0,
        free / M,
        actual_gc_duration,
        time_until_oom,
        time_until_gc,
        last_gc_workers,
        actual_gc_workers
    );

    if actual_gc_workers <= last_gc_workers && time_until_gc > 0.0 {
        return DriverRequest::no_gc(actual_gc_workers);
    }

    DriverRequest::new(Cause::AllocRate, actual_gc_workers)
}

fn rule_allocation_rate_static(inputs: &RuleInputs) -> DriverRequest {
    let nworkers = inputs.tunables.conc_gc_threads;
    if !inputs.is_time_trustable {
        // Rule disabled
        return DriverRequest::no_gc(nworkers);
    }

    // Collect if the estimated max allocation rate says we will run out of
    // memory before a full-crew cycle could finish.
    let free = free_memory(&inputs.heap) as f64;

    let max_alloc_rate = inputs.alloc_rate_avg * inputs.tunables.spike_tolerance
        + inputs.alloc_rate_sd * ONE_IN_1000;
    let time_until_oom = free / (max_alloc_rate + 1.0);

    let serial_gc_time = upper_bound(inputs.serial_time);
    let parallelizable_gc_time = upper_bound(inputs.parallelizable_time);
    let gc_duration = serial_gc_time + parallelizable_gc_time / nworkers as f64;

    let time_until_gc = time_until_oom - gc_duration - inputs.tunables.sample_interval;

    debug!(
        "Rule: Allocation Rate (Static GC Threads), MaxAllocRate: {:.1}MB/s, Free: {:.0}MB, \
         GCDuration: {:.3}s, TimeUntilGC: {:.3}s",
        max_alloc_rate / M,
        free / M,
        gc_duration,
        time_until_gc
    );

    if time_until_gc > 0.0 {
        return DriverRequest::no_gc(nworkers);
    }

    DriverRequest::new(Cause::AllocRate, nworkers)
}

fn rule_allocation_rate(inputs: &RuleInputs) -> DriverRequest {
    if inputs.tunables.use_dynamic_gc_threads {
        rule_allocation_rate_dynamic(inputs)
    } else {
        rule_allocation_rate_static(inputs)
    }
}

fn rule_high_usage(inputs: &RuleInputs) -> DriverRequest {
    // Collect when free memory drops to 5% or less. This catches the case
    // of a very low allocation rate, where the allocation-rate rule never
    // triggers but the heap still drains slowly but surely towards zero.
    let free = free_memory(&inputs.heap);
    let free_percent = free as f64 / inputs.heap.soft_max_capacity as f64 * 100.0;

    debug!(
        "Rule: High Usage, Free: {:.0}MB({:.1}%)",
        free as f64 / M,
        free_percent
    );

    if free_percent > 5.0 {
        return DriverRequest::no_gc(inputs.tunables.conc_gc_threads);
    }

    DriverRequest::new(Cause::HighUsage, inputs.tunables.conc_gc_threads)
}

fn rule_proactive(inputs: &RuleInputs) -> DriverRequest {
    let nworkers = inputs.tunables.conc_gc_threads;
    if !inputs.tunables.proactive || !inputs.is_warm {
        // Rule disabled
        return DriverRequest::no_gc(nworkers);
    }

    // Collect if the throughput cost of doing so is acceptable. This keeps
    // the heap size down even when plenty of free memory remains. Only
    // considered once usage has grown by 10% of the soft max since the
    // previous cycle, or 5 minutes have passed, to avoid superfluous cycles
    // under very low allocation rates.
    let used_threshold =
        inputs.heap.used_at_last_relocate_end + inputs.heap.soft_max_capacity / 10;
    let time_since_last_gc_threshold = 5.0 * 60.0;
    if inputs.heap.used < used_threshold
        && inputs.time_since_last < time_since_last_gc_threshold
    {
        debug!(
            "Rule: Proactive, UsedUntilEnabled: {:.0}MB, TimeUntilEnabled: {:.3}s",
            (used_threshold - inputs.heap.used) as f64 / M,
            time_since_last_gc_threshold - inputs.time_since_last
        );
        return DriverRequest::no_gc(nworkers);
    }

    let assumed_throughput_drop_during_gc = 0.50;
    let acceptable_throughput_drop = 0.01;
    let serial_gc_time = upper_bound(inputs.serial_time);
    let parallelizable_gc_time = upper_bound(inputs.parallelizable_time);
    let gc_duration = serial_gc_time + parallelizable_gc_time / nworkers as f64;
    let acceptable_gc_interval =
        gc_duration * (assumed_throughput_drop_during_gc / acceptable_throughput_drop - 1.0);
    let time_until_gc = acceptable_gc_interval - inputs.time_since_last;

    debug!(
        "Rule: Proactive, AcceptableGCInterval: {:.3}s, TimeSinceLastGC: {:.3}s, TimeUntilGC: {:.3}s",
        acceptable_gc_interval, inputs.time_since_last, time_until_gc
    );

    if time_until_gc > 0.0 {
        return DriverRequest::no_gc(nworkers);
    }

    DriverRequest::new(Cause::Proactive, nworkers)
}
