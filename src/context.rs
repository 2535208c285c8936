//! Mutable runtime state of one machine instance.
//!
//! [`EvaluationContext`] bundles everything that changes while a chart runs:
//! the active configuration, the data store, the internal and external event
//! queues, recorded history, live invocations, and the instance lifecycle.
//! Every mutation goes through a method that first appends a
//! [`LogRecord`](crate::persistence::LogRecord) to the owned transaction log
//! and then applies the effect, so the log is always a faithful prefix of the
//! in-memory state.
//!
//! Replaying a log over a fresh context (see [`EvaluationContext::replay`])
//! reproduces the state exactly, which is the foundation of crash recovery.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

use crate::datamodel::{DataModelValue, DataStore};
use crate::event::EventObject;
use crate::model::{StateChart, StateKind};
use crate::persistence::{LogEntry, LogRecord, TransactionLog};
use crate::types::{Completion, InstanceStatus, StateId};

/// Violation of the configuration consistency invariant.
///
/// These indicate interpreter bugs, not chart bugs: a well-formed microstep
/// can never produce an inconsistent configuration. The runner treats them as
/// fatal for the affected instance.
#[derive(Debug, Error, Diagnostic)]
pub enum ConsistencyError {
    #[error("active state '{state}' has an inactive ancestor '{ancestor}'")]
    #[diagnostic(code(harelite::context::orphaned_state))]
    OrphanedState { state: String, ancestor: String },

    #[error("active compound '{state}' has {active_children} active children, expected exactly 1")]
    #[diagnostic(code(harelite::context::compound_arity))]
    CompoundArity {
        state: String,
        active_children: usize,
    },

    #[error("active parallel '{state}' is missing active region '{region}'")]
    #[diagnostic(code(harelite::context::parallel_region_inactive))]
    ParallelRegionInactive { state: String, region: String },

    #[error("history state '{state}' is present in the active configuration")]
    #[diagnostic(code(harelite::context::history_active))]
    HistoryActive { state: String },
}

/// Failure while replaying a transaction log over a chart.
#[derive(Debug, Error, Diagnostic)]
pub enum ReplayError {
    #[error("log references state '{doc_id}' which does not exist in chart '{chart}'")]
    #[diagnostic(
        code(harelite::context::unknown_state_in_log),
        help("the log was probably written against a different chart revision")
    )]
    UnknownState { chart: String, doc_id: String },

    #[error("log dequeues from an empty {queue} queue at seq {seq}")]
    #[diagnostic(code(harelite::context::dequeue_underflow))]
    DequeueUnderflow { queue: &'static str, seq: u64 },
}

/// The complete mutable state of one running instance.
#[derive(Clone, Debug, Default)]
pub struct EvaluationContext {
    configuration: FxHashSet<StateId>,
    data: DataStore,
    internal_queue: VecDeque<EventObject>,
    external_queue: VecDeque<EventObject>,
    history: FxHashMap<StateId, Vec<StateId>>,
    invocations: FxHashMap<String, StateId>,
    status: InstanceStatus,
    result: Option<Completion>,
    log: TransactionLog,
}

impl EvaluationContext {
    /// Fresh context for a not-yet-started instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Accessors -------------------------------------------------------------

    /// The active configuration as an unordered set.
    #[must_use]
    pub fn configuration(&self) -> &FxHashSet<StateId> {
        &self.configuration
    }

    /// Returns `true` when `state` is in the active configuration.
    #[must_use]
    pub fn is_active(&self, state: StateId) -> bool {
        self.configuration.contains(&state)
    }

    /// Active atomic and final states in document order. This is the
    /// iteration order for transition selection.
    #[must_use]
    pub fn active_atoms(&self, chart: &StateChart) -> Vec<StateId> {
        let mut atoms: Vec<StateId> = self
            .configuration
            .iter()
            .copied()
            .filter(|&s| chart.state(s).is_atomic())
            .collect();
        atoms.sort_by_key(|&s| chart.state(s).doc_order);
        atoms
    }

    #[must_use]
    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    #[must_use]
    pub fn result(&self) -> Option<&Completion> {
        self.result.as_ref()
    }

    #[must_use]
    pub fn data(&self) -> &DataStore {
        &self.data
    }

    /// Stored history for a history pseudo-state, if any exit has been
    /// recorded.
    #[must_use]
    pub fn history_for(&self, history: StateId) -> Option<&[StateId]> {
        self.history.get(&history).map(Vec::as_slice)
    }

    /// Invoke ids of invocations owned by `state`.
    #[must_use]
    pub fn invocations_of(&self, state: StateId) -> Vec<String> {
        self.invocations
            .iter()
            .filter(|&(_, &owner)| owner == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns `true` when an invocation with this id is live.
    #[must_use]
    pub fn has_invocation(&self, invoke_id: &str) -> bool {
        self.invocations.contains_key(invoke_id)
    }

    /// All live invoke ids.
    pub fn live_invocations(&self) -> impl Iterator<Item = &String> {
        self.invocations.keys()
    }

    #[must_use]
    pub fn internal_queue_len(&self) -> usize {
        self.internal_queue.len()
    }

    #[must_use]
    pub fn external_queue_len(&self) -> usize {
        self.external_queue.len()
    }

    /// Internal queue contents in FIFO order.
    pub fn internal_events(&self) -> impl Iterator<Item = &EventObject> {
        self.internal_queue.iter()
    }

    /// External queue contents in FIFO order.
    pub fn external_events(&self) -> impl Iterator<Item = &EventObject> {
        self.external_queue.iter()
    }

    /// All recorded history snapshots.
    pub fn history_entries(&self) -> impl Iterator<Item = (StateId, &[StateId])> {
        self.history.iter().map(|(&h, stored)| (h, stored.as_slice()))
    }

    /// All live invocations as (invoke id, owner state) pairs.
    pub fn invocation_entries(&self) -> impl Iterator<Item = (&String, StateId)> {
        self.invocations.iter().map(|(id, &owner)| (id, owner))
    }

    /// Read-only view of the owned transaction log.
    #[must_use]
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// Rebuild a context from snapshot parts. Used only by the persistence
    /// layer; the log starts at the sequence number the snapshot covers.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_snapshot_parts(
        configuration: FxHashSet<StateId>,
        data: DataStore,
        internal_queue: VecDeque<EventObject>,
        external_queue: VecDeque<EventObject>,
        history: FxHashMap<StateId, Vec<StateId>>,
        invocations: FxHashMap<String, StateId>,
        status: InstanceStatus,
        result: Option<Completion>,
        log: TransactionLog,
    ) -> Self {
        Self {
            configuration,
            data,
            internal_queue,
            external_queue,
            history,
            invocations,
            status,
            result,
            log,
        }
    }

    /// Mutable access to the log, used by the runner to mark flushed entries
    /// after a snapshot is durably stored.
    pub fn log_mut(&mut self) -> &mut TransactionLog {
        &mut self.log
    }

    // Logged mutations ------------------------------------------------------

    /// Add a state to the configuration.
    pub fn enter_state(&mut self, chart: &StateChart, state: StateId) {
        self.log.append(&LogRecord::EnterState {
            state: chart.state(state).doc_id.clone(),
        });
        self.configuration.insert(state);
    }

    /// Remove a state from the configuration.
    pub fn exit_state(&mut self, chart: &StateChart, state: StateId) {
        self.log.append(&LogRecord::ExitState {
            state: chart.state(state).doc_id.clone(),
        });
        self.configuration.remove(&state);
    }

    /// Write a data-store location.
    ///
    /// Non-finite numbers are normalized to `Null` before logging; they have
    /// no JSON form, so an un-normalized write would replay differently than
    /// it applied.
    pub fn set_data(&mut self, location: &str, value: DataModelValue) {
        let value = value.normalized();
        self.log.append(&LogRecord::DataSet {
            location: location.to_string(),
            value: value.clone(),
        });
        self.data.set_path(location, value);
    }

    /// Record the configuration snapshot for a history pseudo-state.
    pub fn set_history(&mut self, chart: &StateChart, history: StateId, stored: Vec<StateId>) {
        self.log.append(&LogRecord::HistorySet {
            history: chart.state(history).doc_id.clone(),
            stored: stored
                .iter()
                .map(|&s| chart.state(s).doc_id.clone())
                .collect(),
        });
        self.history.insert(history, stored);
    }

    /// Register a started invocation against its owner state.
    pub fn invoke_started(&mut self, chart: &StateChart, invoke_id: &str, owner: StateId) {
        self.log.append(&LogRecord::InvokeStarted {
            invoke_id: invoke_id.to_string(),
            owner: chart.state(owner).doc_id.clone(),
        });
        self.invocations.insert(invoke_id.to_string(), owner);
    }

    /// Deregister a finished or cancelled invocation.
    pub fn invoke_stopped(&mut self, invoke_id: &str) {
        self.log.append(&LogRecord::InvokeStopped {
            invoke_id: invoke_id.to_string(),
        });
        self.invocations.remove(invoke_id);
    }

    /// Push onto the internal queue. Event payloads are normalized the same
    /// way as data writes.
    pub fn enqueue_internal(&mut self, mut event: EventObject) {
        event.data = event.data.normalized();
        debug!(event = %event, "internal enqueue");
        self.log
            .append(&LogRecord::InternalEnqueued { event: event.clone() });
        self.internal_queue.push_back(event);
    }

    /// Pop the internal queue head.
    pub fn dequeue_internal(&mut self) -> Option<EventObject> {
        let event = self.internal_queue.pop_front()?;
        self.log.append(&LogRecord::InternalDequeued);
        Some(event)
    }

    /// Push onto the external queue. Event payloads are normalized the same
    /// way as data writes.
    pub fn enqueue_external(&mut self, mut event: EventObject) {
        event.data = event.data.normalized();
        debug!(event = %event, "external enqueue");
        self.log
            .append(&LogRecord::ExternalEnqueued { event: event.clone() });
        self.external_queue.push_back(event);
    }

    /// Pop the external queue head.
    pub fn dequeue_external(&mut self) -> Option<EventObject> {
        let event = self.external_queue.pop_front()?;
        self.log.append(&LogRecord::ExternalDequeued);
        Some(event)
    }

    /// Advance the instance lifecycle.
    pub fn set_status(&mut self, status: InstanceStatus) {
        if self.status == status {
            return;
        }
        self.log.append(&LogRecord::StatusChanged { status });
        self.status = status;
    }

    /// Record the final completion value.
    pub fn set_result(&mut self, completion: Completion) {
        self.log.append(&LogRecord::ResultSet {
            completion: completion.clone(),
        });
        self.result = Some(completion);
    }

    // Queries over configuration --------------------------------------------

    /// Returns `true` when `state` counts as "in a final state":
    /// a compound with a final child active, or a parallel whose regions are
    /// all in a final state.
    #[must_use]
    pub fn in_final(&self, chart: &StateChart, state: StateId) -> bool {
        let node = chart.state(state);
        match node.kind {
            StateKind::Compound { .. } => node.children.iter().any(|&c| {
                matches!(chart.state(c).kind, StateKind::Final) && self.is_active(c)
            }),
            StateKind::Parallel => node
                .children
                .iter()
                .filter(|&&c| !matches!(chart.state(c).kind, StateKind::History { .. }))
                .all(|&c| {
                    self.is_active(c)
                        && (matches!(chart.state(c).kind, StateKind::Final)
                            || self.in_final(chart, c))
                }),
            _ => false,
        }
    }

    /// Verify configuration consistency: ancestors of every active state are
    /// active, active compounds have exactly one active child, active
    /// parallels have every region active, and no history pseudo-state is
    /// active.
    pub fn assert_consistent(&self, chart: &StateChart) -> Result<(), ConsistencyError> {
        for &state in &self.configuration {
            let node = chart.state(state);
            if matches!(node.kind, StateKind::History { .. }) {
                return Err(ConsistencyError::HistoryActive {
                    state: node.doc_id.clone(),
                });
            }
            for &ancestor in &node.ancestors {
                if ancestor != chart.root() && !self.is_active(ancestor) {
                    return Err(ConsistencyError::OrphanedState {
                        state: node.doc_id.clone(),
                        ancestor: chart.state(ancestor).doc_id.clone(),
                    });
                }
            }
            match node.kind {
                StateKind::Compound { .. } => {
                    let active_children = node
                        .children
                        .iter()
                        .filter(|&&c| self.is_active(c))
                        .count();
                    if active_children != 1 {
                        return Err(ConsistencyError::CompoundArity {
                            state: node.doc_id.clone(),
                            active_children,
                        });
                    }
                }
                StateKind::Parallel => {
                    for &region in &node.children {
                        if matches!(chart.state(region).kind, StateKind::History { .. }) {
                            continue;
                        }
                        if !self.is_active(region) {
                            return Err(ConsistencyError::ParallelRegionInactive {
                                state: node.doc_id.clone(),
                                region: chart.state(region).doc_id.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // Replay -----------------------------------------------------------------

    /// Rebuild a context by replaying log entries against a chart.
    ///
    /// Entries with unknown kinds are skipped (see
    /// [`LogEntry::decode`]); entries referencing states the chart no longer
    /// declares fail the replay.
    pub fn replay(chart: &StateChart, entries: &[LogEntry]) -> Result<Self, ReplayError> {
        let mut ctx = Self::new();
        for entry in entries {
            let Some(record) = entry.decode() else {
                continue;
            };
            ctx.apply(chart, &record, entry.seq)?;
        }
        Ok(ctx)
    }

    fn apply(
        &mut self,
        chart: &StateChart,
        record: &LogRecord,
        seq: u64,
    ) -> Result<(), ReplayError> {
        let lookup = |doc_id: &str| -> Result<StateId, ReplayError> {
            chart.lookup(doc_id).ok_or_else(|| ReplayError::UnknownState {
                chart: chart.name().to_string(),
                doc_id: doc_id.to_string(),
            })
        };
        match record {
            LogRecord::EnterState { state } => {
                let id = lookup(state)?;
                self.configuration.insert(id);
            }
            LogRecord::ExitState { state } => {
                let id = lookup(state)?;
                self.configuration.remove(&id);
            }
            LogRecord::DataSet { location, value } => {
                self.data.set_path(location, value.clone());
            }
            LogRecord::HistorySet { history, stored } => {
                let id = lookup(history)?;
                let stored = stored
                    .iter()
                    .map(|s| lookup(s))
                    .collect::<Result<Vec<_>, _>>()?;
                self.history.insert(id, stored);
            }
            LogRecord::InvokeStarted { invoke_id, owner } => {
                let owner = lookup(owner)?;
                self.invocations.insert(invoke_id.clone(), owner);
            }
            LogRecord::InvokeStopped { invoke_id } => {
                self.invocations.remove(invoke_id);
            }
            LogRecord::InternalEnqueued { event } => {
                self.internal_queue.push_back(event.clone());
            }
            LogRecord::InternalDequeued => {
                self.internal_queue
                    .pop_front()
                    .ok_or(ReplayError::DequeueUnderflow {
                        queue: "internal",
                        seq,
                    })?;
            }
            LogRecord::ExternalEnqueued { event } => {
                self.external_queue.push_back(event.clone());
            }
            LogRecord::ExternalDequeued => {
                self.external_queue
                    .pop_front()
                    .ok_or(ReplayError::DequeueUnderflow {
                        queue: "external",
                        seq,
                    })?;
            }
            LogRecord::StatusChanged { status } => {
                self.status = *status;
            }
            LogRecord::ResultSet { completion } => {
                self.result = Some(completion.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChartBuilder;

    fn two_state_chart() -> StateChart {
        ChartBuilder::new("c")
            .atomic("a")
            .atomic("b")
            .initial("a")
            .build()
            .unwrap()
    }

    #[test]
    fn replayed_context_matches_the_original() {
        let chart = two_state_chart();
        let a = chart.lookup("a").unwrap();
        let b = chart.lookup("b").unwrap();

        let mut ctx = EvaluationContext::new();
        ctx.set_status(InstanceStatus::Running);
        ctx.enter_state(&chart, a);
        ctx.enqueue_external(EventObject::named("go"));
        ctx.dequeue_external();
        ctx.exit_state(&chart, a);
        ctx.enter_state(&chart, b);
        ctx.set_data("count", DataModelValue::Number(2.0));

        let replayed = EvaluationContext::replay(&chart, ctx.log().entries()).unwrap();
        assert_eq!(replayed.configuration(), ctx.configuration());
        assert_eq!(replayed.status(), InstanceStatus::Running);
        assert_eq!(
            replayed.data().get_path("count"),
            DataModelValue::Number(2.0)
        );
        assert_eq!(replayed.external_queue_len(), 0);
    }

    #[test]
    fn non_finite_writes_replay_the_same_as_they_applied() {
        let chart = two_state_chart();
        let mut ctx = EvaluationContext::new();
        ctx.set_data("ratio", DataModelValue::Number(f64::NAN));
        ctx.enqueue_external(EventObject::new(
            "measured",
            DataModelValue::Number(f64::INFINITY),
        ));

        // The write is normalized before it is logged, so memory and log
        // agree and the record still decodes.
        assert_eq!(ctx.data().get_path("ratio"), DataModelValue::Null);
        let replayed = EvaluationContext::replay(&chart, ctx.log().entries()).unwrap();
        assert_eq!(replayed.data().get_path("ratio"), DataModelValue::Null);
        assert_eq!(
            replayed.external_events().next().map(|e| e.data.clone()),
            Some(DataModelValue::Null)
        );
    }

    #[test]
    fn replay_rejects_states_missing_from_the_chart() {
        let chart = two_state_chart();
        let entry = LogEntry::new(
            1,
            &LogRecord::EnterState {
                state: "ghost".to_string(),
            },
        );
        let err = EvaluationContext::replay(&chart, &[entry]).unwrap_err();
        assert!(matches!(err, ReplayError::UnknownState { .. }));
    }

    #[test]
    fn fresh_contexts_start_uninitialized() {
        assert_eq!(
            EvaluationContext::new().status(),
            InstanceStatus::Uninitialized
        );
        assert_eq!(
            EvaluationContext::default().status(),
            InstanceStatus::Uninitialized
        );
    }

    #[test]
    fn invocations_are_indexed_by_owner() {
        let chart = two_state_chart();
        let a = chart.lookup("a").unwrap();
        let b = chart.lookup("b").unwrap();

        let mut ctx = EvaluationContext::new();
        ctx.invoke_started(&chart, "job-1", a);
        ctx.invoke_started(&chart, "job-2", b);

        assert_eq!(ctx.invocations_of(a), vec!["job-1".to_string()]);
        assert_eq!(ctx.invocations_of(b), vec!["job-2".to_string()]);
        assert!(ctx.has_invocation("job-1"));

        ctx.invoke_stopped("job-1");
        assert!(ctx.invocations_of(a).is_empty());
    }

    #[test]
    fn consistency_catches_orphaned_children() {
        let chart = ChartBuilder::new("c")
            .compound("p", "x")
            .atomic_in("p", "x")
            .build()
            .unwrap();
        let x = chart.lookup("x").unwrap();

        let mut ctx = EvaluationContext::new();
        ctx.enter_state(&chart, x); // parent never entered
        let err = ctx.assert_consistent(&chart).unwrap_err();
        assert!(matches!(err, ConsistencyError::OrphanedState { .. }));
    }
}
