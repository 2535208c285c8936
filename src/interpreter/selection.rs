//! Transition selection and conflict resolution.
//!
//! Selection walks each active atomic state up through its ancestors and
//! stops at the first state that has any enabled transition for the current
//! trigger. Among enabled transitions on that state, the longest-prefix
//! descriptor match wins; equally specific matches fall back to document
//! order.
//!
//! Because parallel regions select independently, the raw selection can
//! contain transitions whose exit sets overlap. Conflicts are resolved in
//! favor of the transition sourced on the ancestor state; between unrelated
//! sources the earlier selection (document order of the triggering atom)
//! wins.

use rustc_hash::FxHashSet;

use crate::capability::Evaluator;
use crate::context::EvaluationContext;
use crate::event::EventObject;
use crate::model::{StateChart, TransitionNode};
use crate::types::StateId;

/// Reference to a transition by its position in the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TransitionRef {
    pub state: StateId,
    pub index: usize,
}

impl TransitionRef {
    pub(crate) fn node<'a>(&self, chart: &'a StateChart) -> &'a TransitionNode {
        &chart.state(self.state).transitions[self.index]
    }
}

/// Exit set of a transition: every active state strictly inside its domain.
/// Targetless transitions exit nothing.
pub(crate) fn exit_set(
    chart: &StateChart,
    ctx: &EvaluationContext,
    transition: &TransitionNode,
) -> FxHashSet<StateId> {
    if transition.targets.is_empty() {
        return FxHashSet::default();
    }
    let domain = chart.transition_domain(transition);
    ctx.configuration()
        .iter()
        .copied()
        .filter(|&s| chart.is_descendant(s, domain))
        .collect()
}

/// Select the transition set for one trigger.
///
/// `event` is `None` for the eventless pass. Guard evaluation failures are
/// treated as `false`; the corresponding `error.execution` events are
/// returned for the caller to enqueue.
pub(crate) fn select(
    chart: &StateChart,
    ctx: &EvaluationContext,
    evaluator: &dyn Evaluator,
    event: Option<&EventObject>,
) -> (Vec<TransitionRef>, Vec<EventObject>) {
    let mut selected: Vec<TransitionRef> = Vec::new();
    let mut errors: Vec<EventObject> = Vec::new();

    for atom in ctx.active_atoms(chart) {
        let path = std::iter::once(atom).chain(chart.state(atom).ancestors.iter().copied());
        'path: for state in path {
            let node = chart.state(state);
            let mut best: Option<(usize, usize)> = None; // (specificity, index)
            for (index, transition) in node.transitions.iter().enumerate() {
                let specificity = match event {
                    None => {
                        if !transition.is_eventless() {
                            continue;
                        }
                        0
                    }
                    Some(event) => {
                        if transition.is_eventless() {
                            continue;
                        }
                        match transition.match_specificity(&event.name) {
                            Some(s) => s,
                            None => continue,
                        }
                    }
                };
                if !guard_enabled(evaluator, ctx, event, transition, &mut errors) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_spec, _)) => specificity > best_spec,
                };
                if better {
                    best = Some((specificity, index));
                }
            }
            if let Some((_, index)) = best {
                let chosen = TransitionRef { state, index };
                if !selected.contains(&chosen) {
                    selected.push(chosen);
                }
                break 'path;
            }
        }
    }

    (resolve_conflicts(chart, ctx, selected), errors)
}

fn guard_enabled(
    evaluator: &dyn Evaluator,
    ctx: &EvaluationContext,
    event: Option<&EventObject>,
    transition: &TransitionNode,
    errors: &mut Vec<EventObject>,
) -> bool {
    let Some(guard) = &transition.guard else {
        return true;
    };
    match evaluator.eval_guard(guard, ctx.data(), event) {
        Ok(enabled) => enabled,
        Err(error) => {
            errors.push(EventObject::error_execution(error.to_string()));
            false
        }
    }
}

/// Drop transitions whose exit sets collide, keeping the ancestor-sourced
/// transition of each colliding pair.
fn resolve_conflicts(
    chart: &StateChart,
    ctx: &EvaluationContext,
    selected: Vec<TransitionRef>,
) -> Vec<TransitionRef> {
    let mut kept: Vec<(TransitionRef, FxHashSet<StateId>)> = Vec::new();

    'candidates: for candidate in selected {
        let exits = exit_set(chart, ctx, candidate.node(chart));
        let mut preempted: Vec<usize> = Vec::new();
        for (i, (existing, existing_exits)) in kept.iter().enumerate() {
            if exits.is_disjoint(existing_exits) {
                continue;
            }
            if existing.state == candidate.state
                || chart.is_descendant(candidate.state, existing.state)
            {
                // The kept transition is sourced at or above the candidate.
                continue 'candidates;
            }
            if chart.is_descendant(existing.state, candidate.state) {
                preempted.push(i);
            } else {
                // Unrelated sources: first selection wins.
                continue 'candidates;
            }
        }
        for i in preempted.into_iter().rev() {
            kept.remove(i);
        }
        kept.push((candidate, exits));
    }

    kept.into_iter().map(|(t, _)| t).collect()
}
