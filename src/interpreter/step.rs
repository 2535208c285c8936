//! Microstep execution: exit and entry sets, executable content, history
//! capture, invocation lifecycle, and done-event processing.

use rustc_hash::FxHashSet;
use tracing::debug;
use uuid::Uuid;

use super::selection::{self, TransitionRef};
use super::{Interpreter, InterpreterError};
use crate::context::EvaluationContext;
use crate::datamodel::DataModelValue;
use crate::event::EventObject;
use crate::invoke::InvocationManager;
use crate::model::{Action, DoneData, InvokeNode, StateKind};
use crate::types::{Completion, InstanceStatus, StateId};

impl Interpreter {
    /// Execute one microstep for an already-selected, conflict-free
    /// transition set.
    pub(super) fn microstep(
        &self,
        ctx: &mut EvaluationContext,
        invocations: &mut InvocationManager,
        event: Option<&EventObject>,
        selected: &[TransitionRef],
    ) -> Result<(), InterpreterError> {
        // Union exit set over all selected transitions, ordered child-first.
        let mut exit_ids: FxHashSet<StateId> = FxHashSet::default();
        for transition in selected {
            exit_ids.extend(selection::exit_set(&self.chart, ctx, transition.node(&self.chart)));
        }
        let mut exits: Vec<StateId> = exit_ids.into_iter().collect();
        self.chart.sort_exit_order(&mut exits);

        // History is captured against the configuration as it stood before
        // any state left it.
        let pre_exit: FxHashSet<StateId> = ctx.configuration().clone();

        for &state in &exits {
            self.run_actions(ctx, invocations, event, &self.chart.state(state).on_exit.clone());
            self.record_history(ctx, state, &pre_exit);
            for invoke_id in ctx.invocations_of(state) {
                invocations.cancel(&invoke_id);
                ctx.invoke_stopped(&invoke_id);
            }
            ctx.exit_state(&self.chart, state);
        }

        for transition in selected {
            let actions = transition.node(&self.chart).actions.clone();
            self.run_actions(ctx, invocations, event, &actions);
        }

        let mut entry_ids: FxHashSet<StateId> = FxHashSet::default();
        for transition in selected {
            let node = transition.node(&self.chart);
            if node.targets.is_empty() {
                continue;
            }
            let domain = self.chart.transition_domain(node);
            entry_ids.extend(self.compute_entry_set(ctx, &node.targets, domain));
        }
        let mut entries: Vec<StateId> = entry_ids.into_iter().collect();
        self.chart.sort_entry_order(&mut entries);

        self.enter_states(ctx, invocations, event, &entries)
    }

    /// Add states to the configuration in entry order, run their entry
    /// content, start their invocations, and process any entered finals.
    pub(super) fn enter_states(
        &self,
        ctx: &mut EvaluationContext,
        invocations: &mut InvocationManager,
        event: Option<&EventObject>,
        entries: &[StateId],
    ) -> Result<(), InterpreterError> {
        let mut entered_finals: Vec<StateId> = Vec::new();

        for &state in entries {
            if ctx.is_active(state) {
                return Err(InterpreterError::DoubleEntry {
                    state: self.chart.state(state).doc_id.clone(),
                });
            }
            debug!(state = %self.chart.state(state).doc_id, "entering");
            ctx.enter_state(&self.chart, state);
            self.run_actions(ctx, invocations, event, &self.chart.state(state).on_entry.clone());
            if matches!(self.chart.state(state).kind, StateKind::Final) {
                entered_finals.push(state);
            }
        }

        for &state in entries {
            let nodes = self.chart.state(state).invokes.clone();
            for invoke in &nodes {
                self.start_invocation(ctx, invocations, event, state, invoke);
            }
        }

        self.process_entered_finals(ctx, invocations, event, &entered_finals);
        Ok(())
    }

    /// Full entry set for a target list bounded by `domain`: the targets,
    /// their ancestors below the domain, default completions of entered
    /// compounds, all regions of entered parallels, and history resolution.
    pub(super) fn compute_entry_set(
        &self,
        ctx: &EvaluationContext,
        targets: &[StateId],
        domain: StateId,
    ) -> Vec<StateId> {
        let mut set: FxHashSet<StateId> = FxHashSet::default();
        for &target in targets {
            self.add_with_descendants(ctx, &mut set, target);
            self.add_ancestors(ctx, &mut set, target, domain);
        }
        let mut ordered: Vec<StateId> = set.into_iter().collect();
        self.chart.sort_entry_order(&mut ordered);
        ordered
    }

    fn add_with_descendants(
        &self,
        ctx: &EvaluationContext,
        set: &mut FxHashSet<StateId>,
        state: StateId,
    ) {
        let node = self.chart.state(state);
        if let StateKind::History {
            ref default_targets,
            ..
        } = node.kind
        {
            // Shallow and deep history both store the exact state set to
            // restore; depth was resolved at capture time.
            let parent = node.parent.unwrap_or(self.chart.root());
            let restored: Vec<StateId> = match ctx.history_for(state) {
                Some(stored) => stored.to_vec(),
                None => default_targets.clone(),
            };
            for target in restored {
                self.add_with_descendants(ctx, set, target);
                self.add_ancestors(ctx, set, target, parent);
            }
            return;
        }

        if !set.insert(state) {
            return;
        }
        match node.kind {
            StateKind::Compound { initial } => {
                self.add_with_descendants(ctx, set, initial);
            }
            StateKind::Parallel => {
                for &region in &node.children {
                    if matches!(self.chart.state(region).kind, StateKind::History { .. }) {
                        continue;
                    }
                    self.add_with_descendants(ctx, set, region);
                }
            }
            _ => {}
        }
    }

    fn add_ancestors(
        &self,
        ctx: &EvaluationContext,
        set: &mut FxHashSet<StateId>,
        state: StateId,
        domain: StateId,
    ) {
        for &ancestor in &self.chart.state(state).ancestors {
            if ancestor == domain || ancestor == self.chart.root() {
                break;
            }
            if ctx.is_active(ancestor) || !set.insert(ancestor) {
                continue;
            }
            if matches!(self.chart.state(ancestor).kind, StateKind::Parallel) {
                for &region in &self.chart.state(ancestor).children {
                    let region_node = self.chart.state(region);
                    if matches!(region_node.kind, StateKind::History { .. }) {
                        continue;
                    }
                    let covered = set
                        .iter()
                        .any(|&s| s == region || self.chart.is_descendant(s, region));
                    if !covered {
                        self.add_with_descendants(ctx, set, region);
                    }
                }
            }
        }
    }

    /// Record history snapshots for every history child of an exiting state.
    fn record_history(
        &self,
        ctx: &mut EvaluationContext,
        exiting: StateId,
        pre_exit: &FxHashSet<StateId>,
    ) {
        let history_children: Vec<StateId> = self
            .chart
            .state(exiting)
            .children
            .iter()
            .copied()
            .filter(|&c| matches!(self.chart.state(c).kind, StateKind::History { .. }))
            .collect();
        for history in history_children {
            let StateKind::History { deep, .. } = self.chart.state(history).kind else {
                continue;
            };
            let stored: Vec<StateId> = if deep {
                let mut atoms: Vec<StateId> = pre_exit
                    .iter()
                    .copied()
                    .filter(|&s| {
                        self.chart.state(s).is_atomic() && self.chart.is_descendant(s, exiting)
                    })
                    .collect();
                atoms.sort_by_key(|&s| self.chart.state(s).doc_order);
                atoms
            } else {
                self.chart
                    .state(exiting)
                    .children
                    .iter()
                    .copied()
                    .filter(|c| pre_exit.contains(c))
                    .collect()
            };
            ctx.set_history(&self.chart, history, stored);
        }
    }

    // Invocations -----------------------------------------------------------

    fn start_invocation(
        &self,
        ctx: &mut EvaluationContext,
        invocations: &mut InvocationManager,
        event: Option<&EventObject>,
        owner: StateId,
        invoke: &InvokeNode,
    ) {
        let owner_doc = &self.chart.state(owner).doc_id;
        let invoke_id = if invoke.id.is_empty() {
            format!("{owner_doc}.{}", Uuid::new_v4())
        } else {
            invoke.id.clone()
        };

        let payload = match &invoke.payload_expr {
            None => DataModelValue::Undefined,
            Some(expr) => match self.registry.evaluator().eval_value(expr, ctx.data(), event) {
                Ok(value) => value,
                Err(error) => {
                    ctx.enqueue_internal(EventObject::error_execution(error.to_string()));
                    return;
                }
            },
        };

        let Some(factory) = self.registry.service(&invoke.kind) else {
            ctx.enqueue_internal(EventObject::error_communication(
                invoke_id,
                format!("no service factory registered for kind '{}'", invoke.kind),
            ));
            return;
        };
        match factory.create(&invoke.src, &payload) {
            Ok(service) => {
                invocations.start(&invoke_id, service, payload, invoke.auto_forward);
                ctx.invoke_started(&self.chart, &invoke_id, owner);
            }
            Err(error) => {
                ctx.enqueue_internal(EventObject::error_communication(
                    invoke_id,
                    error.to_string(),
                ));
            }
        }
    }

    // Done processing -------------------------------------------------------

    fn process_entered_finals(
        &self,
        ctx: &mut EvaluationContext,
        invocations: &mut InvocationManager,
        event: Option<&EventObject>,
        finals: &[StateId],
    ) {
        let mut signalled_parallels: FxHashSet<StateId> = FxHashSet::default();

        for &final_state in finals {
            let Some(parent) = self.chart.state(final_state).parent else {
                continue;
            };
            if parent == self.chart.root() {
                let data = self.evaluate_done_data(ctx, event, final_state);
                ctx.set_result(Completion::Completed(data));
                ctx.set_status(InstanceStatus::Done);
                let live: Vec<String> = ctx.live_invocations().cloned().collect();
                for invoke_id in live {
                    invocations.cancel(&invoke_id);
                    ctx.invoke_stopped(&invoke_id);
                }
                return;
            }

            let parent_node = self.chart.state(parent);
            match parent_node.kind {
                StateKind::Compound { .. } => {
                    let data = self.evaluate_done_data(ctx, event, final_state);
                    ctx.enqueue_internal(EventObject::done_state(&parent_node.doc_id, data));
                    if let Some(grandparent) = parent_node.parent
                        && matches!(self.chart.state(grandparent).kind, StateKind::Parallel)
                        && ctx.in_final(&self.chart, grandparent)
                        && signalled_parallels.insert(grandparent)
                    {
                        let aggregated = self.aggregate_parallel_done(ctx, event, grandparent);
                        ctx.enqueue_internal(EventObject::done_state(
                            &self.chart.state(grandparent).doc_id,
                            aggregated,
                        ));
                    }
                }
                StateKind::Parallel => {
                    if ctx.in_final(&self.chart, parent) && signalled_parallels.insert(parent) {
                        let aggregated = self.aggregate_parallel_done(ctx, event, parent);
                        ctx.enqueue_internal(EventObject::done_state(
                            &parent_node.doc_id,
                            aggregated,
                        ));
                    }
                }
                _ => {}
            }
        }
    }

    /// Done-data of a completed parallel: one entry per region, keyed by the
    /// region's document id, valued with the done-data of its active final.
    fn aggregate_parallel_done(
        &self,
        ctx: &mut EvaluationContext,
        event: Option<&EventObject>,
        parallel: StateId,
    ) -> DataModelValue {
        let regions: Vec<StateId> = self
            .chart
            .state(parallel)
            .children
            .iter()
            .copied()
            .filter(|&c| !matches!(self.chart.state(c).kind, StateKind::History { .. }))
            .collect();
        let mut pairs = Vec::with_capacity(regions.len());
        for region in regions {
            let region_node = self.chart.state(region);
            let value = if matches!(region_node.kind, StateKind::Final) {
                self.evaluate_done_data(ctx, event, region)
            } else {
                region_node
                    .children
                    .iter()
                    .copied()
                    .find(|&c| {
                        matches!(self.chart.state(c).kind, StateKind::Final) && ctx.is_active(c)
                    })
                    .map_or(DataModelValue::Undefined, |f| {
                        self.evaluate_done_data(ctx, event, f)
                    })
            };
            pairs.push((self.chart.state(region).doc_id.clone(), value));
        }
        DataModelValue::Object(pairs)
    }

    fn evaluate_done_data(
        &self,
        ctx: &mut EvaluationContext,
        event: Option<&EventObject>,
        final_state: StateId,
    ) -> DataModelValue {
        let Some(done_data) = self.chart.state(final_state).done_data.clone() else {
            return DataModelValue::Undefined;
        };
        let DoneData {
            content_expr,
            params,
        } = done_data;
        let evaluator = self.registry.evaluator();

        if let Some(expr) = content_expr {
            return match evaluator.eval_value(&expr, ctx.data(), event) {
                Ok(value) => value,
                Err(error) => {
                    ctx.enqueue_internal(EventObject::error_execution(error.to_string()));
                    DataModelValue::Undefined
                }
            };
        }

        let mut pairs = Vec::with_capacity(params.len());
        for (name, expr) in params {
            match evaluator.eval_value(&expr, ctx.data(), event) {
                Ok(value) => pairs.push((name, value)),
                Err(error) => {
                    ctx.enqueue_internal(EventObject::error_execution(error.to_string()));
                }
            }
        }
        DataModelValue::Object(pairs)
    }

    // Executable content ----------------------------------------------------

    /// Run one content block. A failing action raises its error event and
    /// aborts the remainder of the block, never the surrounding step.
    pub(super) fn run_actions(
        &self,
        ctx: &mut EvaluationContext,
        invocations: &mut InvocationManager,
        event: Option<&EventObject>,
        actions: &[Action],
    ) {
        for action in actions {
            if let Err(error_event) = self.run_action(ctx, invocations, event, action) {
                ctx.enqueue_internal(error_event);
                break;
            }
        }
    }

    fn run_action(
        &self,
        ctx: &mut EvaluationContext,
        invocations: &mut InvocationManager,
        event: Option<&EventObject>,
        action: &Action,
    ) -> Result<(), EventObject> {
        let evaluator = self.registry.evaluator();
        match action {
            Action::Raise { event: name } => {
                ctx.enqueue_internal(EventObject::named(name.clone()));
                Ok(())
            }
            Action::Assign { location, expr } => {
                let value = evaluator
                    .eval_value(expr, ctx.data(), event)
                    .map_err(|e| EventObject::error_execution(e.to_string()))?;
                ctx.set_data(location, value);
                Ok(())
            }
            Action::Script { src } => {
                // Scripts run against a scratch copy so every resulting write
                // still flows through the logged mutation path.
                let mut scratch = ctx.data().clone();
                evaluator
                    .exec_script(src, &mut scratch, event)
                    .map_err(|e| EventObject::error_execution(e.to_string()))?;
                let changed: Vec<(String, DataModelValue)> = scratch
                    .iter()
                    .filter(|(key, value)| ctx.data().get_path(key) != **value)
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                for (location, value) in changed {
                    ctx.set_data(&location, value);
                }
                Ok(())
            }
            Action::Log { label, expr } => {
                let value = evaluator
                    .eval_value(expr, ctx.data(), event)
                    .map_err(|e| EventObject::error_execution(e.to_string()))?;
                tracing::info!(
                    target: "harelite::chart",
                    label = label.as_deref().unwrap_or(""),
                    value = ?value,
                    "chart log"
                );
                Ok(())
            }
            Action::Send {
                event: name,
                target,
                data_expr,
            } => {
                let data = match data_expr {
                    None => DataModelValue::Undefined,
                    Some(expr) => evaluator
                        .eval_value(expr, ctx.data(), event)
                        .map_err(|e| EventObject::error_execution(e.to_string()))?,
                };
                match target.as_deref() {
                    None => {
                        ctx.enqueue_external(EventObject::new(name.clone(), data));
                        Ok(())
                    }
                    Some(address) => {
                        let Some(invoke_id) = address.strip_prefix("#_") else {
                            return Err(EventObject::error_communication(
                                address,
                                format!("unsupported send target '{address}'"),
                            ));
                        };
                        let mut forwarded = EventObject::new(name.clone(), data);
                        forwarded.invoke_id = Some(invoke_id.to_string());
                        invocations.forward_to(invoke_id, forwarded).map_err(|e| {
                            EventObject::error_communication(invoke_id, e.to_string())
                        })
                    }
                }
            }
            Action::Foreach {
                array_expr,
                item,
                index,
                body,
            } => {
                let value = evaluator
                    .eval_value(array_expr, ctx.data(), event)
                    .map_err(|e| EventObject::error_execution(e.to_string()))?;
                let DataModelValue::Array(items) = value else {
                    return Err(EventObject::error_execution(format!(
                        "foreach expression '{array_expr}' evaluated to {}, expected array",
                        value.type_name()
                    )));
                };
                for (position, element) in items.into_iter().enumerate() {
                    ctx.set_data(item, element);
                    if let Some(index_var) = index {
                        #[allow(clippy::cast_precision_loss)]
                        ctx.set_data(index_var, DataModelValue::Number(position as f64));
                    }
                    for nested in body {
                        self.run_action(ctx, invocations, event, nested)?;
                    }
                }
                Ok(())
            }
        }
    }
}
