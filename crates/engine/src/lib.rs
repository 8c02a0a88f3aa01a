//! Stateful flow-aggregation and detection engine shared by every
//! detector: the bounded state table, bloom pair, rolling interval
//! accumulator, host-profile aggregator, sweep scheduler, rule engine and
//! event emitter (spec components C2-C7, C9).

pub mod bloom;
pub mod config;
pub mod emitter;
pub mod haddrscan;
pub mod host;
pub mod interval;
pub mod rules;
pub mod scheduler;
pub mod table;

pub use config::Config;
pub use host::HostRecord;
pub use scheduler::Engine;
