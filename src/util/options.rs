use std::env;

use crate::util::constants::{MARK_STACK_BYTES, MARK_STRIPES_LIMIT};

/// Prefix for environment variables that override option defaults, e.g.
/// `STRIPEGC_SAMPLE_HZ=20`.
const ENV_PREFIX: &str = "STRIPEGC_";

/// Runtime tunables. All of them are read at cycle boundaries or at director
/// ticks, never on a mutator hot path, so plain fields are sufficient.
///
/// Each option can be set from a string via [`Options::set_from_str`], which
/// validates the value and refuses invalid ones, leaving the old value in
/// place.
#[derive(Clone, Debug)]
pub struct Options {
    /// Director tick frequency.
    pub sample_hz: u32,
    /// Force a collection this many seconds after the previous one. Zero
    /// disables the timer rule.
    pub collection_interval: f64,
    /// Multiplier on the mean allocation rate guarding against unforeseen
    /// phase changes in the allocation behavior.
    pub allocation_spike_tolerance: f64,
    /// Allow proactive collections when the heap is otherwise idle.
    pub proactive: bool,
    /// Upper bound on the number of concurrent mark workers per cycle.
    pub conc_gc_threads: u32,
    /// Let the director pick a per-cycle worker count below the bound instead
    /// of always using all of them.
    pub use_dynamic_gc_threads: bool,
    /// Upper bound on the number of mark stripes. Power of two, at most 32.
    pub mark_stripes_max: usize,
    /// Bound on concurrent-mark restarts per continuation.
    pub mark_restart_max: u32,
    /// Wall-clock budget, in microseconds, for finishing marking inside the
    /// mark-end pause.
    pub mark_end_timeout_us: u64,
    /// Interval, in milliseconds, between periodic mutator flush handshakes
    /// during concurrent mark.
    pub mark_flush_interval_ms: u64,
    /// Size of the mark stack slab. Must be a multiple of the stack size.
    pub mark_stack_space_limit: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            sample_hz: 10,
            collection_interval: 0.0,
            allocation_spike_tolerance: 2.0,
            proactive: false,
            conc_gc_threads: (num_cpus::get() / 4).max(1) as u32,
            use_dynamic_gc_threads: true,
            mark_stripes_max: 16,
            mark_restart_max: 5,
            mark_end_timeout_us: 1000,
            mark_flush_interval_ms: 100,
            mark_stack_space_limit: 64 << 20,
        }
    }
}

impl Options {
    /// Default options with overrides applied from `STRIPEGC_*` environment
    /// variables. Invalid values are logged and skipped.
    pub fn from_env() -> Self {
        let mut options = Options::default();
        for (key, value) in env::vars() {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                let name = name.to_lowercase();
                if !options.set_from_str(&name, &value) {
                    warn!("Invalid option {}={}, ignored", key, value);
                }
            }
        }
        options
    }

    /// Set one option from its string representation. Returns `true` if the
    /// key is known and the value parsed and validated.
    pub fn set_from_str(&mut self, name: &str, value: &str) -> bool {
        trace!("Processing option pair ({}, {})", name, value);
        match name {
            "sample_hz" => set_checked(&mut self.sample_hz, value, |v| *v > 0),
            "collection_interval" => {
                set_checked(&mut self.collection_interval, value, |v| *v >= 0.0)
            }
            "allocation_spike_tolerance" => {
                set_checked(&mut self.allocation_spike_tolerance, value, |v| *v >= 1.0)
            }
            "proactive" => set_checked(&mut self.proactive, value, |_| true),
            "conc_gc_threads" => set_checked(&mut self.conc_gc_threads, value, |v| *v > 0),
            "use_dynamic_gc_threads" => {
                set_checked(&mut self.use_dynamic_gc_threads, value, |_| true)
            }
            "mark_stripes_max" => set_checked(&mut self.mark_stripes_max, value, |v| {
                v.is_power_of_two() && *v <= MARK_STRIPES_LIMIT
            }),
            "mark_restart_max" => set_checked(&mut self.mark_restart_max, value, |v| *v > 0),
            "mark_end_timeout_us" => set_checked(&mut self.mark_end_timeout_us, value, |v| *v > 0),
            "mark_flush_interval_ms" => {
                set_checked(&mut self.mark_flush_interval_ms, value, |v| *v > 0)
            }
            "mark_stack_space_limit" => set_checked(&mut self.mark_stack_space_limit, value, |v| {
                *v > 0 && v % MARK_STACK_BYTES == 0
            }),
            _ => false,
        }
    }
}

fn set_checked<T: std::str::FromStr>(
    slot: &mut T,
    value: &str,
    validate: impl FnOnce(&T) -> bool,
) -> bool {
    match value.parse() {
        Ok(parsed) if validate(&parsed) => {
            *slot = parsed;
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_valid() {
        let mut options = Options::default();
        assert!(options.set_from_str("sample_hz", "20"));
        assert_eq!(options.sample_hz, 20);
        assert!(options.set_from_str("mark_stripes_max", "8"));
        assert_eq!(options.mark_stripes_max, 8);
        assert!(options.set_from_str("proactive", "true"));
        assert!(options.proactive);
    }

    #[test]
    fn reject_invalid_value() {
        let mut options = Options::default();
        assert!(!options.set_from_str("sample_hz", "0"));
        assert_eq!(options.sample_hz, 10);
        assert!(!options.set_from_str("sample_hz", "fast"));
        // Stripes must be a power of two within the bitmap width.
        assert!(!options.set_from_str("mark_stripes_max", "12"));
        assert!(!options.set_from_str("mark_stripes_max", "64"));
        assert_eq!(options.mark_stripes_max, 16);
    }

    #[test]
    fn reject_unknown_key() {
        let mut options = Options::default();
        assert!(!options.set_from_str("no_such_option", "1"));
    }
}
