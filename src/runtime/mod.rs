//! Instance lifecycle management and durability orchestration.
//!
//! [`ChartRunner`] is the public entry point for executing charts: it
//! creates, starts, feeds, cancels, and removes instances, serializes each
//! instance's macrosteps behind a per-instance gate, and snapshots state
//! according to the configured [`RuntimeConfig`].

pub mod config;
pub mod runner;

pub use config::{AutosavePolicy, RuntimeConfig};
pub use runner::{ChartRunner, InstanceInit, RunnerError, RunnerEvent, RunnerEventKind};
