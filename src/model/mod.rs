//! Compiled statechart model.
//!
//! A [`StateChart`] is the immutable, shared representation of a statechart:
//! a flat arena of [`StateNode`]s addressed by [`StateId`] indices, with all
//! cross-references (parent links, transition targets, ancestor paths)
//! expressed as indices. It is built once by [`ChartBuilder`], validated at
//! build time, and referenced read-only by every running instance.
//!
//! The chart never contains behavior: invoked services and the expression
//! language live behind capability interfaces and are resolved by string
//! discriminators recorded on the model nodes.
//!
//! # Examples
//!
//! ```rust
//! use harelite::model::{ChartBuilder, Transition};
//!
//! let chart = ChartBuilder::new("traffic")
//!     .atomic("red")
//!     .atomic("green")
//!     .transition("red", Transition::on("tick").to("green"))
//!     .transition("green", Transition::on("tick").to("red"))
//!     .initial("red")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(chart.state_count(), 3); // root + red + green
//! ```

pub mod builder;

pub use builder::{ChartBuilder, InvokeSpec, ModelError, Transition};

use serde::{Deserialize, Serialize};

use crate::event::EventDescriptor;
use crate::types::StateId;
use rustc_hash::FxHashMap;

/// Kind of a state node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateKind {
    /// Leaf state with no children.
    Atomic,
    /// Composite state with exactly one designated initial child.
    Compound { initial: StateId },
    /// Orthogonal state; all children are active simultaneously and there is
    /// no initial child.
    Parallel,
    /// Terminal state of its parent region.
    Final,
    /// History pseudo-state. When targeted it restores the configuration
    /// captured at the most recent exit of its parent, falling back to
    /// `default_targets` if no exit has been recorded yet.
    History {
        deep: bool,
        default_targets: Vec<StateId>,
    },
}

impl StateKind {
    /// Returns `true` for `Atomic` and `Final`, the kinds that terminate a
    /// configuration path.
    #[must_use]
    pub fn is_atomic(&self) -> bool {
        matches!(self, Self::Atomic | Self::Final)
    }
}

/// Whether a transition exits its source state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransitionKind {
    /// The default: exits up to the least common compound ancestor of source
    /// and targets.
    #[default]
    External,
    /// Does not exit the source when every target is a proper descendant of
    /// it.
    Internal,
}

/// One unit of executable content attached to a transition or an
/// entry/exit block.
///
/// Expressions are opaque strings handed to the registered
/// [`Evaluator`](crate::capability::Evaluator); the interpreter only
/// sequences them and converts failures into `error.execution` events.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Enqueue an event on the instance's internal queue.
    Raise { event: String },
    /// Evaluate `expr` and write the result to a dotted location.
    Assign { location: String, expr: String },
    /// Run a script through the evaluator.
    Script { src: String },
    /// Evaluate `expr` and record it on the diagnostic stream.
    Log { label: Option<String>, expr: String },
    /// Send an event. `target: None` posts to the instance's own external
    /// queue; `Some("#_<invokeid>")` forwards to a running invocation.
    Send {
        event: String,
        target: Option<String>,
        data_expr: Option<String>,
    },
    /// Iterate an array expression, binding `item` (and optionally `index`)
    /// in the data store for each element of the body.
    Foreach {
        array_expr: String,
        item: String,
        index: Option<String>,
        body: Vec<Action>,
    },
}

/// Declared external service invocation, started on entering its owner state
/// and cancelled on exiting it.
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeNode {
    /// Static invoke id; empty means the interpreter generates one per start.
    pub id: String,
    /// Service-factory discriminator (resolved via the capability registry).
    pub kind: String,
    /// Service source locator, passed through to the factory.
    pub src: String,
    /// Expression producing the invocation payload.
    pub payload_expr: Option<String>,
    /// Whether external events addressed to this instance are forwarded to
    /// the running service.
    pub auto_forward: bool,
}

/// Done-data declaration on a final state.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct DoneData {
    /// Expression producing the whole payload; takes precedence over params.
    pub content_expr: Option<String>,
    /// Named params, each an expression, aggregated into an object payload.
    pub params: Vec<(String, String)>,
}

/// A transition in the compiled model.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionNode {
    /// State this transition is declared on.
    pub source: StateId,
    /// Event descriptors; empty means eventless.
    pub events: Vec<EventDescriptor>,
    /// Guard expression; absent means always enabled.
    pub guard: Option<String>,
    /// Target states; empty means a targetless (stay) transition that only
    /// runs its actions.
    pub targets: Vec<StateId>,
    pub kind: TransitionKind,
    /// Executable content run between exit and entry.
    pub actions: Vec<Action>,
}

impl TransitionNode {
    /// Returns `true` when the descriptor set is empty.
    #[must_use]
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    /// Specificity of the best-matching descriptor for `event_name`, or
    /// `None` when nothing matches.
    #[must_use]
    pub fn match_specificity(&self, event_name: &str) -> Option<usize> {
        self.events
            .iter()
            .filter(|d| d.matches(event_name))
            .map(EventDescriptor::specificity)
            .max()
    }
}

/// One state in the compiled chart.
///
/// `ancestors` is the precomputed ancestor path, nearest-first, ending at the
/// root; `depth` and `doc_order` drive entry/exit ordering without any link
/// walking at runtime.
#[derive(Clone, Debug)]
pub struct StateNode {
    pub id: StateId,
    /// Document id, unique within the chart. Persistence re-links by this id.
    pub doc_id: String,
    pub parent: Option<StateId>,
    pub kind: StateKind,
    /// Children in document order.
    pub children: Vec<StateId>,
    /// Transitions in document order.
    pub transitions: Vec<TransitionNode>,
    pub on_entry: Vec<Action>,
    pub on_exit: Vec<Action>,
    pub invokes: Vec<InvokeNode>,
    /// Only meaningful on final states.
    pub done_data: Option<DoneData>,
    /// Ancestor path, nearest-first.
    pub ancestors: Vec<StateId>,
    pub depth: usize,
    pub doc_order: usize,
}

impl StateNode {
    /// Returns `true` for atomic and final states.
    #[must_use]
    pub fn is_atomic(&self) -> bool {
        self.kind.is_atomic()
    }

    /// History children of this state, if any.
    pub fn history_children<'a>(&'a self, chart: &'a StateChart) -> impl Iterator<Item = &'a StateNode> {
        self.children
            .iter()
            .map(|&c| chart.state(c))
            .filter(|s| matches!(s.kind, StateKind::History { .. }))
    }
}

/// Immutable compiled statechart: a flat arena of state nodes plus the
/// document-id index used by persistence to re-link restored state.
#[derive(Clone, Debug)]
pub struct StateChart {
    name: String,
    states: Vec<StateNode>,
    root: StateId,
    by_doc_id: FxHashMap<String, StateId>,
}

impl StateChart {
    pub(crate) fn from_parts(
        name: String,
        states: Vec<StateNode>,
        root: StateId,
        by_doc_id: FxHashMap<String, StateId>,
    ) -> Self {
        Self {
            name,
            states,
            root,
            by_doc_id,
        }
    }

    /// Chart name, used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The implicit root state.
    #[must_use]
    pub fn root(&self) -> StateId {
        self.root
    }

    /// Total number of states, including the root.
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Fetch a state node by id.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range id; ids only originate from this chart, so
    /// an invalid id is a programming error, not a runtime condition.
    #[must_use]
    pub fn state(&self, id: StateId) -> &StateNode {
        &self.states[id]
    }

    /// Resolve a document id to its state id.
    #[must_use]
    pub fn lookup(&self, doc_id: &str) -> Option<StateId> {
        self.by_doc_id.get(doc_id).copied()
    }

    /// Iterate all states in document order.
    pub fn states(&self) -> impl Iterator<Item = &StateNode> {
        self.states.iter()
    }

    /// Returns `true` when `descendant` is a proper descendant of `ancestor`.
    #[must_use]
    pub fn is_descendant(&self, descendant: StateId, ancestor: StateId) -> bool {
        self.states[descendant].ancestors.contains(&ancestor)
    }

    /// Nearest ancestor of `state` (inclusive) that satisfies `pred`.
    fn self_or_ancestor_where(
        &self,
        state: StateId,
        pred: impl Fn(&StateNode) -> bool,
    ) -> Option<StateId> {
        if pred(&self.states[state]) {
            return Some(state);
        }
        self.states[state]
            .ancestors
            .iter()
            .copied()
            .find(|&a| pred(&self.states[a]))
    }

    /// Least common compound ancestor of a set of states: the nearest state
    /// that is a compound (or the root) and a proper ancestor of every member.
    #[must_use]
    pub fn lcca(&self, states: &[StateId]) -> StateId {
        let first = states[0];
        for &candidate in &self.states[first].ancestors {
            let node = &self.states[candidate];
            let is_container =
                matches!(node.kind, StateKind::Compound { .. }) || candidate == self.root;
            if !is_container {
                continue;
            }
            if states
                .iter()
                .all(|&s| s != candidate && self.is_descendant(s, candidate))
            {
                return candidate;
            }
        }
        self.root
    }

    /// Transition domain: the state bounding the exit/entry sets.
    ///
    /// An internal transition whose source is compound and whose targets are
    /// all proper descendants of the source is bounded by the source itself;
    /// every other transition is bounded by the LCCA of source and targets.
    #[must_use]
    pub fn transition_domain(&self, transition: &TransitionNode) -> StateId {
        let source = transition.source;
        if transition.kind == TransitionKind::Internal
            && matches!(self.states[source].kind, StateKind::Compound { .. })
            && transition
                .targets
                .iter()
                .all(|&t| self.is_descendant(t, source))
        {
            return source;
        }
        let mut all = Vec::with_capacity(transition.targets.len() + 1);
        all.push(source);
        all.extend_from_slice(&transition.targets);
        self.lcca(&all)
    }

    /// Nearest compound-or-root ancestor, used when falling back from
    /// malformed target sets.
    #[must_use]
    pub fn nearest_compound_ancestor(&self, state: StateId) -> StateId {
        self.self_or_ancestor_where(state, |n| {
            matches!(n.kind, StateKind::Compound { .. }) || n.id == self.root
        })
        .unwrap_or(self.root)
    }

    /// Sort ids into entry order: parents before children, document order
    /// among siblings.
    pub fn sort_entry_order(&self, ids: &mut [StateId]) {
        ids.sort_by_key(|&id| (self.states[id].depth, self.states[id].doc_order));
    }

    /// Sort ids into exit order: children before parents, reverse document
    /// order among siblings.
    pub fn sort_exit_order(&self, ids: &mut [StateId]) {
        ids.sort_by_key(|&id| {
            (
                std::cmp::Reverse(self.states[id].depth),
                std::cmp::Reverse(self.states[id].doc_order),
            )
        });
    }
}
