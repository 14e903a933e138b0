//! Online statistics feeding the director: the mutator allocation rate and
//! the per-cycle time history.

mod alloc_rate;
mod cycle;
mod rate;

pub use alloc_rate::AllocRateSampler;
pub use cycle::{CycleStats, TimeEstimate};
pub use rate::RateStats;
