//! Invoked services and their lifecycle management.
//!
//! A state can declare that entering it starts an external service and
//! exiting it cancels the service. Services run as tokio tasks owned by an
//! [`InvocationManager`]; their completions flow back through a channel and
//! are converted into `done.invoke.<id>` / `error.communication` events the
//! next time the runner drains the manager.
//!
//! Cancellation is cooperative but prompt: the task is aborted and the
//! invoke id is marked discarded, so a completion that raced the
//! cancellation is dropped instead of being delivered to a state that no
//! longer exists.

use async_trait::async_trait;
use flume::{Receiver, Sender};
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::context::EvaluationContext;
use crate::datamodel::DataModelValue;
use crate::event::EventObject;

/// Invocation failure surfaced as an `error.communication` event.
#[derive(Debug, Error, Diagnostic)]
pub enum InvokeError {
    #[error("no service factory registered for kind '{kind}'")]
    #[diagnostic(
        code(harelite::invoke::unknown_kind),
        help("register a ServiceFactory for this kind on the capability registry")
    )]
    UnknownKind { kind: String },

    #[error("factory for '{kind}' failed to create service from '{src}': {reason}")]
    #[diagnostic(code(harelite::invoke::factory))]
    Factory {
        kind: String,
        src: String,
        reason: String,
    },

    #[error("invocation '{invoke_id}' does not accept forwarded events")]
    #[diagnostic(code(harelite::invoke::forwarding_unsupported))]
    ForwardingUnsupported { invoke_id: String },

    #[error("forward to invocation '{invoke_id}' failed: {reason}")]
    #[diagnostic(code(harelite::invoke::forward_failed))]
    ForwardFailed { invoke_id: String, reason: String },
}

/// Terminal result of a service run.
#[derive(Clone, Debug, PartialEq)]
pub enum InvokeOutcome {
    /// Service finished; the payload becomes the `done.invoke.<id>` event
    /// data.
    Done(DataModelValue),
    /// Service failed; the message becomes the `error.communication` event
    /// data.
    Failed(String),
}

/// A running external service.
///
/// `run` is the service body; it is driven on a spawned task and its return
/// value is the invocation outcome. Forwarding and cancellation have default
/// implementations for services that want neither.
#[async_trait]
pub trait InvokedService: Send + Sync {
    /// Execute the service to completion.
    async fn run(&self, payload: DataModelValue) -> InvokeOutcome;

    /// Whether external events may be forwarded into this service.
    fn accepts_forwarding(&self) -> bool {
        false
    }

    /// Deliver a forwarded event.
    async fn forward(&self, event: EventObject) -> Result<(), InvokeError> {
        Err(InvokeError::ForwardingUnsupported {
            invoke_id: event.invoke_id.unwrap_or_default(),
        })
    }

    /// Cooperative cleanup before the task is aborted.
    async fn cancel(&self) {}
}

/// Creates service instances for one invoke kind.
pub trait ServiceFactory: Send + Sync {
    /// Instantiate a service for the given source locator and payload.
    fn create(
        &self,
        src: &str,
        payload: &DataModelValue,
    ) -> Result<Arc<dyn InvokedService>, InvokeError>;
}

enum InvocationSignal {
    Completed {
        invoke_id: String,
        outcome: InvokeOutcome,
    },
    ForwardFailed {
        invoke_id: String,
        message: String,
    },
}

struct PendingInvocation {
    service: Arc<dyn InvokedService>,
    handle: JoinHandle<()>,
    auto_forward: bool,
}

/// Owns the running invocations of one machine instance.
///
/// Must be used from within a tokio runtime; starting an invocation spawns a
/// task.
pub struct InvocationManager {
    tx: Sender<InvocationSignal>,
    rx: Receiver<InvocationSignal>,
    pending: FxHashMap<String, PendingInvocation>,
    discarded: FxHashSet<String>,
}

impl Default for InvocationManager {
    fn default() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            pending: FxHashMap::default(),
            discarded: FxHashSet::default(),
        }
    }
}

impl InvocationManager {
    /// Start a service under the given invoke id.
    #[instrument(skip(self, service, payload))]
    pub fn start(
        &mut self,
        invoke_id: &str,
        service: Arc<dyn InvokedService>,
        payload: DataModelValue,
        auto_forward: bool,
    ) {
        let tx = self.tx.clone();
        let runner = Arc::clone(&service);
        let id = invoke_id.to_string();
        let handle = tokio::spawn(async move {
            let outcome = runner.run(payload).await;
            // Receiver dropping just means the instance is gone.
            let _ = tx.send(InvocationSignal::Completed {
                invoke_id: id,
                outcome,
            });
        });
        self.discarded.remove(invoke_id);
        self.pending.insert(
            invoke_id.to_string(),
            PendingInvocation {
                service,
                handle,
                auto_forward,
            },
        );
    }

    /// Cancel a running invocation.
    ///
    /// The task is aborted after the service's cooperative `cancel` hook is
    /// scheduled, and any completion that already raced onto the channel will
    /// be discarded at drain time.
    #[instrument(skip(self))]
    pub fn cancel(&mut self, invoke_id: &str) {
        let Some(pending) = self.pending.remove(invoke_id) else {
            return;
        };
        debug!(invoke_id, "cancelling invocation");
        let service = Arc::clone(&pending.service);
        tokio::spawn(async move { service.cancel().await });
        pending.handle.abort();
        self.discarded.insert(invoke_id.to_string());
    }

    /// Returns `true` when an invocation with this id is still running.
    #[must_use]
    pub fn is_pending(&self, invoke_id: &str) -> bool {
        self.pending.contains_key(invoke_id)
    }

    /// Forward an external event to one invocation by id.
    pub fn forward_to(&self, invoke_id: &str, event: EventObject) -> Result<(), InvokeError> {
        let Some(pending) = self.pending.get(invoke_id) else {
            return Err(InvokeError::ForwardFailed {
                invoke_id: invoke_id.to_string(),
                reason: "no such invocation".to_string(),
            });
        };
        if !pending.service.accepts_forwarding() {
            return Err(InvokeError::ForwardingUnsupported {
                invoke_id: invoke_id.to_string(),
            });
        }
        self.spawn_forward(invoke_id, &pending.service, event);
        Ok(())
    }

    /// Forward an external event to every invocation that opted into
    /// auto-forwarding.
    pub fn auto_forward(&self, event: &EventObject) {
        for (invoke_id, pending) in &self.pending {
            if pending.auto_forward && pending.service.accepts_forwarding() {
                self.spawn_forward(invoke_id, &pending.service, event.clone());
            }
        }
    }

    fn spawn_forward(&self, invoke_id: &str, service: &Arc<dyn InvokedService>, event: EventObject) {
        let tx = self.tx.clone();
        let service = Arc::clone(service);
        let id = invoke_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = service.forward(event).await {
                let _ = tx.send(InvocationSignal::ForwardFailed {
                    invoke_id: id,
                    message: error.to_string(),
                });
            }
        });
    }

    /// Convert buffered completions into external events on the context.
    ///
    /// Completions from discarded (cancelled) invocations are dropped here;
    /// this is the guarantee that a cancelled service never produces a
    /// `done.invoke` event. Returns the number of events enqueued.
    pub fn drain(&mut self, ctx: &mut EvaluationContext) -> usize {
        let mut delivered = 0;
        while let Ok(signal) = self.rx.try_recv() {
            match signal {
                InvocationSignal::Completed { invoke_id, outcome } => {
                    if self.discarded.remove(&invoke_id) {
                        debug!(invoke_id, "dropping completion of cancelled invocation");
                        continue;
                    }
                    if self.pending.remove(&invoke_id).is_none() {
                        warn!(invoke_id, "completion for unknown invocation");
                        continue;
                    }
                    ctx.invoke_stopped(&invoke_id);
                    let event = match outcome {
                        InvokeOutcome::Done(data) => EventObject::done_invoke(invoke_id, data),
                        InvokeOutcome::Failed(message) => {
                            EventObject::error_communication(invoke_id, message)
                        }
                    };
                    ctx.enqueue_external(event);
                    delivered += 1;
                }
                InvocationSignal::ForwardFailed { invoke_id, message } => {
                    // The invocation itself keeps running; only the forward
                    // attempt is reported.
                    if self.discarded.contains(&invoke_id) {
                        continue;
                    }
                    ctx.enqueue_external(EventObject::error_communication(invoke_id, message));
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Cancel everything, dropping all not-yet-drained completions.
    pub fn cancel_all(&mut self) {
        let ids: Vec<String> = self.pending.keys().cloned().collect();
        for id in ids {
            self.cancel(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceStatus;

    struct Immediate(DataModelValue);

    #[async_trait]
    impl InvokedService for Immediate {
        async fn run(&self, _payload: DataModelValue) -> InvokeOutcome {
            InvokeOutcome::Done(self.0.clone())
        }
    }

    struct Stuck;

    #[async_trait]
    impl InvokedService for Stuck {
        async fn run(&self, _payload: DataModelValue) -> InvokeOutcome {
            std::future::pending().await
        }
    }

    /// Completes with the payload of the first event forwarded into it.
    struct Relay {
        tx: Sender<EventObject>,
        rx: Receiver<EventObject>,
    }

    impl Relay {
        fn new() -> Self {
            let (tx, rx) = flume::unbounded();
            Self { tx, rx }
        }
    }

    #[async_trait]
    impl InvokedService for Relay {
        async fn run(&self, _payload: DataModelValue) -> InvokeOutcome {
            match self.rx.recv_async().await {
                Ok(event) => InvokeOutcome::Done(event.data),
                Err(_) => InvokeOutcome::Failed("inbox closed".to_string()),
            }
        }

        fn accepts_forwarding(&self) -> bool {
            true
        }

        async fn forward(&self, event: EventObject) -> Result<(), InvokeError> {
            self.tx
                .send_async(event)
                .await
                .map_err(|_| InvokeError::ForwardFailed {
                    invoke_id: "relay".to_string(),
                    reason: "inbox closed".to_string(),
                })
        }
    }

    /// Claims to accept forwarding but rejects every delivery.
    struct Deaf;

    #[async_trait]
    impl InvokedService for Deaf {
        async fn run(&self, _payload: DataModelValue) -> InvokeOutcome {
            std::future::pending().await
        }

        fn accepts_forwarding(&self) -> bool {
            true
        }

        async fn forward(&self, event: EventObject) -> Result<(), InvokeError> {
            Err(InvokeError::ForwardFailed {
                invoke_id: event.invoke_id.unwrap_or_default(),
                reason: "delivery refused".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn completion_becomes_a_done_invoke_event() {
        let mut manager = InvocationManager::default();
        let mut ctx = EvaluationContext::new();
        ctx.set_status(InstanceStatus::Running);

        manager.start(
            "job",
            Arc::new(Immediate(DataModelValue::Number(5.0))),
            DataModelValue::Undefined,
            false,
        );
        // Give the spawned task a chance to finish.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(manager.drain(&mut ctx), 1);
        let event = ctx.dequeue_external().unwrap();
        assert_eq!(event.name, "done.invoke.job");
        assert_eq!(event.data, DataModelValue::Number(5.0));
        assert!(!manager.is_pending("job"));
    }

    #[tokio::test]
    async fn cancelled_invocations_never_deliver() {
        let mut manager = InvocationManager::default();
        let mut ctx = EvaluationContext::new();

        manager.start(
            "job",
            Arc::new(Immediate(DataModelValue::Null)),
            DataModelValue::Undefined,
            false,
        );
        manager.cancel("job");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(manager.drain(&mut ctx), 0);
        assert_eq!(ctx.external_queue_len(), 0);
    }

    #[tokio::test]
    async fn auto_forwarded_events_reach_an_opted_in_service() {
        let mut manager = InvocationManager::default();
        let mut ctx = EvaluationContext::new();
        ctx.set_status(InstanceStatus::Running);

        manager.start(
            "relay",
            Arc::new(Relay::new()),
            DataModelValue::Undefined,
            true,
        );
        manager.auto_forward(&EventObject::new(
            "ping",
            DataModelValue::Number(3.0),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(manager.drain(&mut ctx), 1);
        let event = ctx.dequeue_external().unwrap();
        assert_eq!(event.name, "done.invoke.relay");
        assert_eq!(event.data, DataModelValue::Number(3.0));
    }

    #[tokio::test]
    async fn forward_to_rejects_services_that_do_not_opt_in() {
        let mut manager = InvocationManager::default();
        manager.start("stuck", Arc::new(Stuck), DataModelValue::Undefined, false);

        let err = manager
            .forward_to("stuck", EventObject::named("ping"))
            .unwrap_err();
        assert!(matches!(err, InvokeError::ForwardingUnsupported { .. }));

        let err = manager
            .forward_to("nobody", EventObject::named("ping"))
            .unwrap_err();
        assert!(matches!(err, InvokeError::ForwardFailed { .. }));
    }

    #[tokio::test]
    async fn failed_forwards_surface_without_killing_the_invocation() {
        let mut manager = InvocationManager::default();
        let mut ctx = EvaluationContext::new();
        ctx.set_status(InstanceStatus::Running);

        manager.start("deaf", Arc::new(Deaf), DataModelValue::Undefined, false);
        manager
            .forward_to("deaf", EventObject::named("ping"))
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(manager.drain(&mut ctx), 1);
        let event = ctx.dequeue_external().unwrap();
        assert_eq!(event.name, "error.communication");
        // Only the forward attempt failed; the service is still running.
        assert!(manager.is_pending("deaf"));
    }

    #[tokio::test]
    async fn aborting_a_stuck_service_leaves_no_pending_entry() {
        let mut manager = InvocationManager::default();
        manager.start(
            "stuck",
            Arc::new(Stuck),
            DataModelValue::Undefined,
            false,
        );
        assert!(manager.is_pending("stuck"));
        manager.cancel("stuck");
        assert!(!manager.is_pending("stuck"));
    }
}
