//! Durable execution state: the transaction log and snapshot stores.
//!
//! Two cooperating mechanisms make instances resumable:
//!
//! - the [`TransactionLog`] records every context mutation in order, so
//!   replaying it over a fresh context reproduces the state exactly, and
//! - [`InstanceSnapshot`]s capture the whole context at a point in time so
//!   the log can be truncated instead of growing without bound.
//!
//! The runner snapshots after macrosteps (see
//! [`crate::runtime::ChartRunner`]), marks the covered log prefix flushed,
//! and truncates it. Restoring an instance loads the latest snapshot and
//! resumes sequence numbering where it left off.

pub mod log;
pub mod snapshot;
#[cfg(feature = "sqlite")]
pub mod store_sqlite;

pub use log::{LogEntry, LogRecord, TransactionLog};
pub use snapshot::{InMemorySnapshotStore, InstanceSnapshot, PersistedContext, SnapshotStore};
#[cfg(feature = "sqlite")]
pub use store_sqlite::SqliteSnapshotStore;

use miette::Diagnostic;
use thiserror::Error;

use crate::context::ReplayError;

/// Failure in the persistence layer.
///
/// Persistence errors are fatal to the affected instance only; the runner
/// marks it `Failed` and other instances keep running.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("snapshot serialization failed: {0}")]
    #[diagnostic(code(harelite::persistence::serialization))]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot references state '{doc_id}' which does not exist in chart '{chart}'")]
    #[diagnostic(
        code(harelite::persistence::unknown_state),
        help("the snapshot was probably written against a different chart revision")
    )]
    UnknownState { chart: String, doc_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Replay(#[from] ReplayError),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    #[diagnostic(code(harelite::persistence::database))]
    Database(#[from] sqlx::Error),
}
