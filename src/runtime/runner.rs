//! Multi-instance runner: the public instance API.
//!
//! A [`ChartRunner`] owns many instances of one chart. Each instance is held
//! behind its own async mutex, which is the per-instance gate guaranteeing
//! at most one in-flight macrostep; different instances run fully
//! concurrently and share nothing but the chart.
//!
//! The runner is also where durability happens: after macrosteps it
//! snapshots the instance according to the configured autosave policy, marks
//! the covered transaction-log prefix flushed, and truncates it.

use flume::{Receiver, Sender};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::config::{AutosavePolicy, RuntimeConfig};
use crate::capability::CapabilityRegistry;
use crate::context::EvaluationContext;
use crate::datamodel::DataModelValue;
use crate::event::{EventObject, ORIGIN_TYPE_PLATFORM};
use crate::interpreter::Interpreter;
use crate::invoke::InvocationManager;
use crate::model::StateChart;
use crate::persistence::{InstanceSnapshot, PersistenceError, SnapshotStore};
use crate::types::{Completion, InstanceStatus};

/// Instance API failure.
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("no instance with id '{instance_id}'")]
    #[diagnostic(code(harelite::runtime::unknown_instance))]
    UnknownInstance { instance_id: String },

    #[error("instance '{instance_id}' already exists")]
    #[diagnostic(code(harelite::runtime::duplicate_instance))]
    DuplicateInstance { instance_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persistence(#[from] PersistenceError),
}

/// How an instance came into being.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceInit {
    /// Brand new instance with an empty context.
    Fresh { instance_id: String },
    /// Context restored from a stored snapshot.
    Resumed { instance_id: String },
}

impl InstanceInit {
    /// The instance id regardless of how it was initialized.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        match self {
            Self::Fresh { instance_id } | Self::Resumed { instance_id } => instance_id,
        }
    }
}

/// Diagnostic event published on the runner's broadcast stream.
#[derive(Clone, Debug)]
pub struct RunnerEvent {
    pub instance_id: String,
    pub kind: RunnerEventKind,
}

#[derive(Clone, Debug)]
pub enum RunnerEventKind {
    Created { resumed: bool },
    Started,
    MacrostepCompleted { microsteps: usize },
    SnapshotSaved { last_seq: u64 },
    Completed { completion: Completion },
    Failed { message: String },
}

struct MachineInstance {
    instance_id: String,
    ctx: EvaluationContext,
    invocations: InvocationManager,
    macrosteps: u64,
}

/// Runs and persists many instances of one compiled chart.
pub struct ChartRunner {
    interpreter: Interpreter,
    store: Arc<dyn SnapshotStore>,
    config: RuntimeConfig,
    instances: RwLock<FxHashMap<String, Arc<Mutex<MachineInstance>>>>,
    diagnostics_tx: Sender<RunnerEvent>,
    diagnostics_rx: Receiver<RunnerEvent>,
}

impl ChartRunner {
    pub fn new(
        chart: Arc<StateChart>,
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn SnapshotStore>,
        config: RuntimeConfig,
    ) -> Self {
        let (diagnostics_tx, diagnostics_rx) = flume::unbounded();
        Self {
            interpreter: Interpreter::new(chart, registry),
            store,
            config,
            instances: RwLock::new(FxHashMap::default()),
            diagnostics_tx,
            diagnostics_rx,
        }
    }

    /// The chart this runner executes.
    #[must_use]
    pub fn chart(&self) -> &Arc<StateChart> {
        self.interpreter.chart()
    }

    /// Subscribe to the diagnostic event stream.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<RunnerEvent> {
        self.diagnostics_rx.clone()
    }

    fn publish(&self, instance_id: &str, kind: RunnerEventKind) {
        // Nobody listening is fine; the stream is purely diagnostic.
        let _ = self.diagnostics_tx.send(RunnerEvent {
            instance_id: instance_id.to_string(),
            kind,
        });
    }

    async fn instance(&self, instance_id: &str) -> Result<Arc<Mutex<MachineInstance>>, RunnerError> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownInstance {
                instance_id: instance_id.to_string(),
            })
    }

    /// Create an instance, restoring from a stored snapshot when one exists.
    ///
    /// Passing `None` generates a fresh id (and skips snapshot lookup, since
    /// a generated id cannot have history).
    #[instrument(skip(self))]
    pub async fn create_instance(
        &self,
        instance_id: Option<&str>,
    ) -> Result<InstanceInit, RunnerError> {
        let (instance_id, lookup) = match instance_id {
            Some(id) => (id.to_string(), true),
            None => (Uuid::new_v4().to_string(), false),
        };
        {
            let instances = self.instances.read().await;
            if instances.contains_key(&instance_id) {
                return Err(RunnerError::DuplicateInstance { instance_id });
            }
        }

        let (ctx, resumed) = if lookup {
            match self.store.load(&instance_id).await? {
                Some(snapshot) => (snapshot.restore(self.chart())?, true),
                None => (EvaluationContext::new(), false),
            }
        } else {
            (EvaluationContext::new(), false)
        };

        let machine = MachineInstance {
            instance_id: instance_id.clone(),
            ctx,
            invocations: InvocationManager::default(),
            macrosteps: 0,
        };
        self.instances
            .write()
            .await
            .insert(instance_id.clone(), Arc::new(Mutex::new(machine)));
        self.publish(&instance_id, RunnerEventKind::Created { resumed });
        debug!(instance_id, resumed, "instance created");

        let init = if resumed {
            InstanceInit::Resumed { instance_id }
        } else {
            InstanceInit::Fresh { instance_id }
        };
        Ok(init)
    }

    /// Start an instance, seeding its data store with the initial payload.
    ///
    /// An object payload lands as top-level data entries; any other defined
    /// value is stored under `payload`. Starting a resumed instance that is
    /// already running is a no-op, so callers can create-and-start without
    /// caring which path `create_instance` took. External events queued
    /// before start stay queued until the next [`send_event`](Self::send_event)
    /// or [`drain_completions`](Self::drain_completions).
    #[instrument(skip(self, payload))]
    pub async fn start_instance(
        &self,
        instance_id: &str,
        payload: DataModelValue,
    ) -> Result<(), RunnerError> {
        let machine = self.instance(instance_id).await?;
        let mut machine = machine.lock().await;

        if machine.ctx.status() == InstanceStatus::Uninitialized {
            match payload {
                DataModelValue::Undefined => {}
                DataModelValue::Object(pairs) => {
                    for (key, value) in pairs {
                        machine.ctx.set_data(&key, value);
                    }
                }
                other => machine.ctx.set_data("payload", other),
            }
            let MachineInstance {
                ctx, invocations, ..
            } = &mut *machine;
            if let Err(error) = self.interpreter.start(ctx, invocations) {
                self.fail_instance(&mut machine, &error).await;
                return Ok(());
            }
            self.publish(instance_id, RunnerEventKind::Started);
        }
        self.after_step(&mut machine).await;
        Ok(())
    }

    /// Enqueue an external event and, if the instance is running, process
    /// macrosteps until the external queue is drained.
    ///
    /// Events sent to a not-yet-started instance are queued with no effect.
    #[instrument(skip(self, event), fields(event = %event))]
    pub async fn send_event(
        &self,
        instance_id: &str,
        event: EventObject,
    ) -> Result<(), RunnerError> {
        let machine = self.instance(instance_id).await?;
        let mut machine = machine.lock().await;

        if machine.ctx.status().is_terminal() {
            warn!(instance_id, event = %event, "event for terminal instance dropped");
            return Ok(());
        }
        machine.ctx.enqueue_external(event);
        if machine.ctx.status() == InstanceStatus::Running {
            self.pump(&mut machine).await;
            self.after_step(&mut machine).await;
        }
        Ok(())
    }

    /// Collect buffered invocation completions and process the resulting
    /// events. Call this (or `send_event`) to let `done.invoke` results
    /// advance the instance.
    #[instrument(skip(self))]
    pub async fn drain_completions(&self, instance_id: &str) -> Result<(), RunnerError> {
        let machine = self.instance(instance_id).await?;
        let mut machine = machine.lock().await;
        if machine.ctx.status() != InstanceStatus::Running {
            return Ok(());
        }
        self.pump(&mut machine).await;
        self.after_step(&mut machine).await;
        Ok(())
    }

    /// Cancel a running instance. Its completion becomes `Cancelled` and all
    /// invocations are cancelled.
    #[instrument(skip(self))]
    pub async fn cancel_instance(&self, instance_id: &str) -> Result<(), RunnerError> {
        let machine = self.instance(instance_id).await?;
        let mut machine = machine.lock().await;
        if machine.ctx.status().is_terminal() {
            return Ok(());
        }
        machine.invocations.cancel_all();
        let live: Vec<String> = machine.ctx.live_invocations().cloned().collect();
        for invoke_id in live {
            machine.ctx.invoke_stopped(&invoke_id);
        }
        machine.ctx.set_result(Completion::Cancelled);
        machine.ctx.set_status(InstanceStatus::Failed);
        self.publish(
            instance_id,
            RunnerEventKind::Completed {
                completion: Completion::Cancelled,
            },
        );
        self.snapshot(&mut machine, true).await;
        Ok(())
    }

    /// Current lifecycle status of an instance.
    pub async fn status(&self, instance_id: &str) -> Result<InstanceStatus, RunnerError> {
        let machine = self.instance(instance_id).await?;
        let machine = machine.lock().await;
        Ok(machine.ctx.status())
    }

    /// Final outcome of an instance, once terminal.
    pub async fn completion(&self, instance_id: &str) -> Result<Option<Completion>, RunnerError> {
        let machine = self.instance(instance_id).await?;
        let machine = machine.lock().await;
        Ok(machine.ctx.result().cloned())
    }

    /// Active configuration of an instance as document ids, in document
    /// order.
    pub async fn configuration(&self, instance_id: &str) -> Result<Vec<String>, RunnerError> {
        let machine = self.instance(instance_id).await?;
        let machine = machine.lock().await;
        let chart = self.chart();
        let mut ids: Vec<_> = machine.ctx.configuration().iter().copied().collect();
        ids.sort_by_key(|&s| chart.state(s).doc_order);
        Ok(ids.into_iter().map(|s| chart.state(s).doc_id.clone()).collect())
    }

    /// Drop an instance from the runner and delete its stored snapshot.
    #[instrument(skip(self))]
    pub async fn remove_instance(&self, instance_id: &str) -> Result<(), RunnerError> {
        let removed = self.instances.write().await.remove(instance_id);
        if removed.is_none() {
            return Err(RunnerError::UnknownInstance {
                instance_id: instance_id.to_string(),
            });
        }
        self.store.delete(instance_id).await?;
        Ok(())
    }

    /// Instance ids with a stored snapshot, resumable via
    /// [`create_instance`](Self::create_instance).
    pub async fn persisted_instances(&self) -> Result<Vec<String>, RunnerError> {
        Ok(self.store.list_instances().await?)
    }

    // Internals --------------------------------------------------------------

    /// Process macrosteps until the external queue is empty, draining
    /// invocation completions between macrosteps.
    async fn pump(&self, machine: &mut MachineInstance) {
        loop {
            let MachineInstance {
                ctx, invocations, ..
            } = &mut *machine;
            invocations.drain(ctx);
            if ctx.status() != InstanceStatus::Running || ctx.external_queue_len() == 0 {
                break;
            }
            match self.interpreter.macrostep(ctx, invocations) {
                Ok(report) => {
                    machine.macrosteps += 1;
                    self.publish(
                        &machine.instance_id,
                        RunnerEventKind::MacrostepCompleted {
                            microsteps: report.microsteps,
                        },
                    );
                    if !report.consumed_external {
                        break;
                    }
                }
                Err(error) => {
                    self.fail_instance(machine, &error).await;
                    break;
                }
            }
        }
    }

    /// Post-step bookkeeping shared by every entry point: terminal
    /// notification and autosave.
    async fn after_step(&self, machine: &mut MachineInstance) {
        if machine.ctx.status() == InstanceStatus::Done
            && let Some(completion) = machine.ctx.result().cloned()
        {
            self.publish(
                &machine.instance_id,
                RunnerEventKind::Completed { completion },
            );
        }
        let force = machine.ctx.status().is_terminal();
        let due = match self.config.autosave {
            AutosavePolicy::Disabled => false,
            AutosavePolicy::EveryMacrosteps(n) => {
                n > 0 && machine.macrosteps % u64::from(n) == 0
            }
        };
        if force || due {
            self.snapshot(machine, force).await;
        }
    }

    /// Snapshot the instance; on success, flush and truncate the covered log
    /// prefix. A failed snapshot is fatal to the instance when forced,
    /// otherwise retried on the next cadence hit.
    async fn snapshot(&self, machine: &mut MachineInstance, forced: bool) {
        let snapshot = InstanceSnapshot::capture(&machine.instance_id, self.chart(), &machine.ctx);
        let last_seq = snapshot.last_seq;
        match self.store.save(&snapshot).await {
            Ok(()) => {
                machine.ctx.log_mut().mark_flushed(last_seq);
                machine.ctx.log_mut().truncate_flushed();
                self.publish(
                    &machine.instance_id,
                    RunnerEventKind::SnapshotSaved { last_seq },
                );
            }
            Err(persistence_error) => {
                error!(
                    instance_id = %machine.instance_id,
                    error = %persistence_error,
                    "snapshot write failed"
                );
                // The store is already failing; skip the final-state save a
                // normal failure path would attempt.
                if !forced && !machine.ctx.status().is_terminal() {
                    self.mark_failed(machine, &persistence_error);
                }
            }
        }
    }

    /// Mark an instance failed with a platform error event as its
    /// completion, then flush a final snapshot. Fatal errors never cross to
    /// other instances.
    async fn fail_instance(&self, machine: &mut MachineInstance, error: &dyn std::error::Error) {
        self.mark_failed(machine, error);
        self.snapshot(machine, true).await;
    }

    fn mark_failed(&self, machine: &mut MachineInstance, error: &dyn std::error::Error) {
        error!(instance_id = %machine.instance_id, error = %error, "instance failed");
        machine.invocations.cancel_all();
        let live: Vec<String> = machine.ctx.live_invocations().cloned().collect();
        for invoke_id in live {
            machine.ctx.invoke_stopped(&invoke_id);
        }
        let mut event = EventObject::new(
            "error.platform",
            DataModelValue::object([(
                "message",
                DataModelValue::String(error.to_string()),
            )]),
        );
        event.origin_type = Some(ORIGIN_TYPE_PLATFORM.to_string());
        machine.ctx.set_result(Completion::Failed(event));
        machine.ctx.set_status(InstanceStatus::Failed);
        self.publish(
            &machine.instance_id,
            RunnerEventKind::Failed {
                message: error.to_string(),
            },
        );
    }
}
