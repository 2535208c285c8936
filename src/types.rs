//! Core identifier and status types for the harelite statechart runtime.
//!
//! This module defines the fundamental types used throughout the system for
//! addressing states in a compiled chart and for reporting the lifecycle of a
//! running machine instance.
//!
//! # Key Types
//!
//! - [`StateId`]: Stable integer address of a state node inside a compiled chart
//! - [`InstanceStatus`]: Lifecycle of the interpreter engine for one instance
//! - [`Completion`]: Final outcome reported through the instance API
//!
//! # Examples
//!
//! ```rust
//! use harelite::types::InstanceStatus;
//!
//! let status = InstanceStatus::Running;
//! assert!(!status.is_terminal());
//!
//! // Encode for persistence
//! assert_eq!(status.encode(), "Running");
//! assert_eq!(InstanceStatus::decode("Running"), InstanceStatus::Running);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::datamodel::DataModelValue;
use crate::event::EventObject;

/// Stable integer address of a state node within a compiled [`StateChart`].
///
/// All cross-references inside the model (parent links, transition targets,
/// ancestor paths) are expressed as `StateId` indices into the chart's flat
/// node arena, avoiding ownership cycles and making model-relative references
/// trivially persistable.
///
/// [`StateChart`]: crate::model::StateChart
pub type StateId = usize;

/// Lifecycle of the interpreter engine for a single machine instance.
///
/// The engine moves `Uninitialized → Running → {Done, Failed}`. `Running` is
/// re-entered after each external event while not terminal; the terminal
/// states are absorbing.
///
/// # Persistence
///
/// `InstanceStatus` supports serialization through both serde and the
/// [`encode`](Self::encode)/[`decode`](Self::decode) methods.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Instance exists but [`start`](crate::runtime::ChartRunner::start_instance)
    /// has not run yet. Events sent in this state are queued with no effect.
    #[default]
    Uninitialized,

    /// The instance is live and will react to external events.
    Running,

    /// A top-level final state was entered; the instance result carries the
    /// final state's done-data.
    Done,

    /// The instance aborted: a persistence failure, an invariant violation,
    /// or an explicit cancellation.
    Failed,
}

impl InstanceStatus {
    /// Returns `true` for the absorbing states `Done` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Encode the status into its persisted string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Running => "Running",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }

    /// Decode a persisted string form back into an `InstanceStatus`.
    ///
    /// Unrecognized encodings decode to `Failed` so that a corrupted status
    /// field is never mistaken for a runnable instance.
    pub fn decode(s: &str) -> Self {
        match s {
            "Uninitialized" => Self::Uninitialized,
            "Running" => Self::Running,
            "Done" => Self::Done,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Final outcome of a machine instance, retrieved through the instance API.
///
/// Carries enough detail to diagnose a failure (the error event's name and
/// payload) without any panic or exception crossing the instance boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Completion {
    /// The instance reached a top-level final state; the payload is the
    /// evaluated done-data of that final state.
    Completed(DataModelValue),

    /// The instance aborted. The event is the error event that describes the
    /// failure (`error.execution`, `error.communication`, or a synthesized
    /// `error.platform` event for persistence and invariant failures).
    Failed(EventObject),

    /// The instance was cancelled through the instance API before reaching a
    /// final state.
    Cancelled,
}

impl Completion {
    /// Returns `true` if the instance completed normally.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}
