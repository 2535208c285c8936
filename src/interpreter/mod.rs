//! The run-to-completion interpreter engine.
//!
//! An [`Interpreter`] binds a compiled [`StateChart`] to a
//! [`CapabilityRegistry`] and drives one instance's
//! [`EvaluationContext`](crate::context::EvaluationContext) through
//! macrosteps. A macrostep consumes at most one external event and runs
//! microsteps until quiescence: eventless transitions first, then internal
//! events in strict FIFO priority, and only when both are exhausted the next
//! external event.
//!
//! The engine is deliberately synchronous. Everything asynchronous
//! (invocation completion, persistence, the per-instance gate that keeps
//! macrosteps serialized) lives in [`crate::runtime`] and
//! [`crate::invoke`]; the engine just consumes whatever those layers have
//! already enqueued. That keeps run-to-completion a property of the
//! algorithm rather than of any particular scheduler.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use harelite::capability::CapabilityRegistry;
//! use harelite::context::EvaluationContext;
//! use harelite::event::EventObject;
//! use harelite::interpreter::Interpreter;
//! use harelite::invoke::InvocationManager;
//! use harelite::model::{ChartBuilder, Transition};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let chart = Arc::new(
//!     ChartBuilder::new("toggle")
//!         .atomic("off")
//!         .atomic("on")
//!         .transition("off", Transition::on("flip").to("on"))
//!         .transition("on", Transition::on("flip").to("off"))
//!         .initial("off")
//!         .build()
//!         .unwrap(),
//! );
//! let engine = Interpreter::new(chart.clone(), Arc::new(CapabilityRegistry::default()));
//! let mut ctx = EvaluationContext::new();
//! let mut invocations = InvocationManager::default();
//!
//! engine.start(&mut ctx, &mut invocations).unwrap();
//! assert!(ctx.is_active(chart.lookup("off").unwrap()));
//!
//! ctx.enqueue_external(EventObject::named("flip"));
//! engine.macrostep(&mut ctx, &mut invocations).unwrap();
//! assert!(ctx.is_active(chart.lookup("on").unwrap()));
//! # }
//! ```

mod selection;
mod step;

use miette::Diagnostic;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info_span, instrument};

use crate::capability::CapabilityRegistry;
use crate::context::{ConsistencyError, EvaluationContext};
use crate::invoke::InvocationManager;
use crate::model::{StateChart, StateKind};
use crate::types::InstanceStatus;

/// Ceiling on processing passes within a single macrostep. A chart that
/// exceeds it is looping through eventless transitions or self-raised
/// events; a pass that selects nothing (a repeatedly failing eventless
/// guard raising `error.execution` forever) counts too.
pub const MICROSTEP_LIMIT: usize = 4096;

/// Fatal interpreter failure.
///
/// Everything here aborts the affected instance; recoverable problems
/// (guard errors, action failures, invocation failures) never surface as
/// `InterpreterError`, they become `error.*` events inside the chart.
#[derive(Debug, Error, Diagnostic)]
pub enum InterpreterError {
    #[error("instance already started (status {status})")]
    #[diagnostic(code(harelite::interpreter::already_started))]
    AlreadyStarted { status: InstanceStatus },

    #[error("microstep limit of {limit} exceeded within one macrostep")]
    #[diagnostic(
        code(harelite::interpreter::microstep_limit),
        help("the chart loops through eventless transitions or self-raised events")
    )]
    MicrostepLimit { limit: usize },

    #[error("state '{state}' entered twice in one microstep")]
    #[diagnostic(code(harelite::interpreter::double_entry))]
    DoubleEntry { state: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Inconsistent(#[from] ConsistencyError),
}

/// What a macrostep did, mostly useful for tests and runner bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MacrostepReport {
    /// Number of microsteps executed.
    pub microsteps: usize,
    /// Whether an external event was dequeued.
    pub consumed_external: bool,
}

/// Drives macrosteps of one chart. Cheap to clone and shareable across
/// instances of the same chart; all per-instance state lives in the context
/// and the invocation manager passed into each call.
#[derive(Clone)]
pub struct Interpreter {
    chart: Arc<StateChart>,
    registry: Arc<CapabilityRegistry>,
}

impl Interpreter {
    pub fn new(chart: Arc<StateChart>, registry: Arc<CapabilityRegistry>) -> Self {
        Self { chart, registry }
    }

    /// The chart this engine interprets.
    #[must_use]
    pub fn chart(&self) -> &Arc<StateChart> {
        &self.chart
    }

    /// Enter the initial configuration and run eventless and internal work
    /// to quiescence.
    ///
    /// External events queued before start stay queued; they are only
    /// consumed by later macrosteps.
    #[instrument(skip_all, fields(chart = %self.chart.name()))]
    pub fn start(
        &self,
        ctx: &mut EvaluationContext,
        invocations: &mut InvocationManager,
    ) -> Result<(), InterpreterError> {
        if ctx.status() != InstanceStatus::Uninitialized {
            return Err(InterpreterError::AlreadyStarted {
                status: ctx.status(),
            });
        }
        ctx.set_status(InstanceStatus::Running);

        let StateKind::Compound { initial } = self.chart.state(self.chart.root()).kind else {
            unreachable!("the root is always compiled as a compound state");
        };
        let entry = self.compute_entry_set(ctx, &[initial], self.chart.root());
        self.enter_states(ctx, invocations, None, &entry)?;

        self.run_loop(ctx, invocations, false)?;
        ctx.assert_consistent(&self.chart)?;
        Ok(())
    }

    /// Run exactly one macrostep: eventless and internal work to quiescence,
    /// consuming at most one external event along the way.
    ///
    /// A no-op on instances that are not `Running`.
    #[instrument(skip_all, fields(chart = %self.chart.name()))]
    pub fn macrostep(
        &self,
        ctx: &mut EvaluationContext,
        invocations: &mut InvocationManager,
    ) -> Result<MacrostepReport, InterpreterError> {
        if ctx.status() != InstanceStatus::Running {
            return Ok(MacrostepReport::default());
        }
        let report = self.run_loop(ctx, invocations, true)?;
        ctx.assert_consistent(&self.chart)?;
        Ok(report)
    }

    fn run_loop(
        &self,
        ctx: &mut EvaluationContext,
        invocations: &mut InvocationManager,
        allow_external: bool,
    ) -> Result<MacrostepReport, InterpreterError> {
        let mut report = MacrostepReport::default();
        let mut passes = 0_usize;
        let evaluator = self.registry.evaluator();

        loop {
            if ctx.status() != InstanceStatus::Running {
                break;
            }
            // Bounds passes, not just executed microsteps, so a pass that
            // only raises and consumes error events cannot spin forever.
            passes += 1;
            if passes > MICROSTEP_LIMIT {
                return Err(InterpreterError::MicrostepLimit {
                    limit: MICROSTEP_LIMIT,
                });
            }

            let (eventless, errors) =
                selection::select(&self.chart, ctx, evaluator.as_ref(), None);
            for error in errors {
                ctx.enqueue_internal(error);
            }
            if !eventless.is_empty() {
                let span = info_span!("microstep", trigger = "eventless");
                let _guard = span.enter();
                self.microstep(ctx, invocations, None, &eventless)?;
                report.microsteps += 1;
                continue;
            }

            if let Some(event) = ctx.dequeue_internal() {
                let span = info_span!("microstep", trigger = %event.name, queue = "internal");
                let _guard = span.enter();
                let (selected, errors) =
                    selection::select(&self.chart, ctx, evaluator.as_ref(), Some(&event));
                for error in errors {
                    ctx.enqueue_internal(error);
                }
                if !selected.is_empty() {
                    self.microstep(ctx, invocations, Some(&event), &selected)?;
                    report.microsteps += 1;
                }
                continue;
            }

            if allow_external
                && !report.consumed_external
                && let Some(event) = ctx.dequeue_external()
            {
                report.consumed_external = true;
                invocations.auto_forward(&event);
                let span = info_span!("microstep", trigger = %event.name, queue = "external");
                let _guard = span.enter();
                let (selected, errors) =
                    selection::select(&self.chart, ctx, evaluator.as_ref(), Some(&event));
                for error in errors {
                    ctx.enqueue_internal(error);
                }
                if !selected.is_empty() {
                    self.microstep(ctx, invocations, Some(&event), &selected)?;
                    report.microsteps += 1;
                }
                continue;
            }

            break;
        }
        Ok(report)
    }
}
