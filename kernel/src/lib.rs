// Oplogtail Kernel
//
// Tails a replication log and aggregates what it sees into
// monitoring counters.

pub mod adapters;
pub mod config;
pub mod log;
pub mod metrics;
pub mod stats;
pub mod tail;

pub use config::TailConfig;
pub use stats::{OplogTailStats, TailHandle};
