//! Core of a pauseless, concurrent, striped tracing collector: the
//! [`Director`](director::Director), which decides when to collect and with
//! how many workers, and the [`MarkEngine`](mark::MarkEngine), a parallel
//! work-stealing marker with lock-free termination and handshake-based
//! flushing.
//!
//! The heap itself lives outside this crate. An embedding provides the page
//! table, object model and root sets behind the traits in [`heap`], executes
//! the director's requests through a [`driver`], and feeds the statistics in
//! [`util::statistics`] at cycle boundaries.

#[macro_use]
extern crate log;

pub mod director;
pub mod driver;
pub mod heap;
pub mod mark;
pub mod util;
pub mod workers;

pub use director::Director;
pub use driver::{Cause, CollectRequester, Driver, DriverRequest};
pub use heap::{DirectorHeap, HeapModel, HeapSnapshot, MarkablePage, PageMark};
pub use mark::{MarkEngine, MutatorHandle};
pub use util::options::Options;
pub use util::Address;
pub use workers::Workers;
