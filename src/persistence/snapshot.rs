//! Durable snapshots of instance state and the stores that keep them.
//!
//! A snapshot is a serde model of everything an
//! [`EvaluationContext`](crate::context::EvaluationContext) holds, with all
//! state references flattened to document ids so restoration can re-link
//! against a freshly compiled chart. Restoring never revives behavior: data
//! only, and running invocations are deliberately dropped with a warning
//! since their tasks did not survive the process.
//!
//! [`SnapshotStore`] is the pluggable durability seam; the crate ships an
//! in-memory store for tests and embedding, plus a SQLite store behind the
//! `sqlite` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::warn;

use super::{PersistenceError, TransactionLog};
use crate::context::EvaluationContext;
use crate::datamodel::DataStore;
use crate::event::EventObject;
use crate::model::StateChart;
use crate::types::{Completion, InstanceStatus, StateId};

/// Serde model of a context, with state references as document ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedContext {
    pub configuration: Vec<String>,
    pub data: DataStore,
    pub internal_queue: Vec<EventObject>,
    pub external_queue: Vec<EventObject>,
    pub history: Vec<(String, Vec<String>)>,
    /// Invoke id to owner state. Retained for diagnostics; restoration does
    /// not restart these services.
    pub invocations: Vec<(String, String)>,
    pub status: String,
    pub result: Option<Completion>,
}

/// One durable snapshot of one instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub chart_name: String,
    pub saved_at: DateTime<Utc>,
    /// Highest log sequence number this snapshot covers.
    pub last_seq: u64,
    pub context: PersistedContext,
}

impl InstanceSnapshot {
    /// Capture the current context of an instance.
    #[must_use]
    pub fn capture(instance_id: &str, chart: &StateChart, ctx: &EvaluationContext) -> Self {
        let doc = |id: StateId| chart.state(id).doc_id.clone();

        let mut configuration: Vec<StateId> = ctx.configuration().iter().copied().collect();
        configuration.sort_by_key(|&s| chart.state(s).doc_order);

        let mut history: Vec<(String, Vec<String>)> = ctx
            .history_entries()
            .map(|(h, stored)| (doc(h), stored.iter().map(|&s| doc(s)).collect()))
            .collect();
        history.sort();

        let mut invocations: Vec<(String, String)> = ctx
            .invocation_entries()
            .map(|(id, owner)| (id.clone(), doc(owner)))
            .collect();
        invocations.sort();

        Self {
            instance_id: instance_id.to_string(),
            chart_name: chart.name().to_string(),
            saved_at: Utc::now(),
            last_seq: ctx.log().last_seq(),
            context: PersistedContext {
                configuration: configuration.into_iter().map(doc).collect(),
                data: ctx.data().clone(),
                internal_queue: ctx.internal_events().cloned().collect(),
                external_queue: ctx.external_events().cloned().collect(),
                history,
                invocations,
                status: ctx.status().encode().to_string(),
                result: ctx.result().cloned(),
            },
        }
    }

    /// Re-link the snapshot against a chart and rebuild the context.
    ///
    /// Fails when the snapshot references a state the chart no longer
    /// declares. Live invocations recorded in the snapshot are dropped with
    /// a warning; the services they named died with the original process.
    pub fn restore(&self, chart: &StateChart) -> Result<EvaluationContext, PersistenceError> {
        let lookup = |doc_id: &str| -> Result<StateId, PersistenceError> {
            chart
                .lookup(doc_id)
                .ok_or_else(|| PersistenceError::UnknownState {
                    chart: chart.name().to_string(),
                    doc_id: doc_id.to_string(),
                })
        };

        let mut configuration: FxHashSet<StateId> = FxHashSet::default();
        for doc_id in &self.context.configuration {
            configuration.insert(lookup(doc_id)?);
        }

        let mut history: FxHashMap<StateId, Vec<StateId>> = FxHashMap::default();
        for (h, stored) in &self.context.history {
            let stored = stored
                .iter()
                .map(|s| lookup(s))
                .collect::<Result<Vec<_>, _>>()?;
            history.insert(lookup(h)?, stored);
        }

        if !self.context.invocations.is_empty() {
            warn!(
                instance_id = %self.instance_id,
                dropped = self.context.invocations.len(),
                "snapshot recorded live invocations; they are not restarted"
            );
        }

        Ok(EvaluationContext::from_snapshot_parts(
            configuration,
            self.context.data.clone(),
            self.context.internal_queue.iter().cloned().collect::<VecDeque<_>>(),
            self.context.external_queue.iter().cloned().collect::<VecDeque<_>>(),
            history,
            FxHashMap::default(),
            InstanceStatus::decode(&self.context.status),
            self.context.result.clone(),
            TransactionLog::resume_from(self.last_seq),
        ))
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from stored bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistenceError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Pluggable durability backend for instance snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot, replacing any previous one for the instance.
    async fn save(&self, snapshot: &InstanceSnapshot) -> Result<(), PersistenceError>;

    /// Load the latest snapshot for an instance, if one exists.
    async fn load(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>, PersistenceError>;

    /// Remove an instance's snapshot.
    async fn delete(&self, instance_id: &str) -> Result<(), PersistenceError>;

    /// Instance ids with a stored snapshot.
    async fn list_instances(&self) -> Result<Vec<String>, PersistenceError>;
}

/// Snapshot store backed by a process-local map. Snapshots do not survive
/// the process; intended for tests and ephemeral embedding.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<FxHashMap<String, InstanceSnapshot>>,
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: &InstanceSnapshot) -> Result<(), PersistenceError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.instance_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>, PersistenceError> {
        Ok(self.snapshots.read().await.get(instance_id).cloned())
    }

    async fn delete(&self, instance_id: &str) -> Result<(), PersistenceError> {
        self.snapshots.write().await.remove(instance_id);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, PersistenceError> {
        let mut ids: Vec<String> = self.snapshots.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
