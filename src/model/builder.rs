//! Fluent construction and validation of [`StateChart`]s.
//!
//! [`ChartBuilder`] accepts a flat sequence of declarations keyed by document
//! id, then resolves every cross-reference and runs structural validation in
//! [`build`](ChartBuilder::build). Nothing is partially constructed: either
//! the whole chart is well-formed or a [`ModelError`] pinpoints the first
//! problem.
//!
//! # Examples
//!
//! ```rust
//! use harelite::model::{ChartBuilder, Transition};
//!
//! let chart = ChartBuilder::new("door")
//!     .compound("operational", "closed")
//!     .atomic_in("operational", "closed")
//!     .atomic_in("operational", "open")
//!     .final_state("broken")
//!     .transition("closed", Transition::on("open").to("open"))
//!     .transition("open", Transition::on("close").to("closed"))
//!     .transition("operational", Transition::on("smash").to("broken"))
//!     .initial("operational")
//!     .build()
//!     .unwrap();
//!
//! assert!(chart.lookup("closed").is_some());
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::{
    Action, DoneData, InvokeNode, StateChart, StateKind, StateNode, TransitionKind, TransitionNode,
};
use crate::event::EventDescriptor;
use crate::types::StateId;

/// Structural validation failure raised by [`ChartBuilder::build`].
#[derive(Debug, Error, Diagnostic)]
pub enum ModelError {
    #[error("duplicate state id '{id}'")]
    #[diagnostic(
        code(harelite::model::duplicate_id),
        help("every state needs a unique document id within the chart")
    )]
    DuplicateId { id: String },

    #[error("state '{id}' references unknown state '{reference}'")]
    #[diagnostic(
        code(harelite::model::unknown_reference),
        help("declare the referenced state before calling build()")
    )]
    UnknownReference { id: String, reference: String },

    #[error("initial state '{initial}' of compound '{id}' is not one of its children")]
    #[diagnostic(code(harelite::model::initial_not_child))]
    InitialNotChild { id: String, initial: String },

    #[error("compound state '{id}' has no children")]
    #[diagnostic(
        code(harelite::model::empty_compound),
        help("a compound state needs at least one child to enter")
    )]
    EmptyCompound { id: String },

    #[error("parallel state '{id}' has no regions")]
    #[diagnostic(code(harelite::model::empty_parallel))]
    EmptyParallel { id: String },

    #[error("final state '{id}' cannot have children or transitions")]
    #[diagnostic(code(harelite::model::malformed_final))]
    MalformedFinal { id: String },

    #[error("history state '{id}' must be a child of a compound or parallel state")]
    #[diagnostic(code(harelite::model::misplaced_history))]
    MisplacedHistory { id: String },

    #[error("history state '{id}' default target '{target}' is not a descendant of its parent")]
    #[diagnostic(code(harelite::model::history_default_outside_parent))]
    HistoryDefaultOutsideParent { id: String, target: String },

    #[error("transition on '{id}' targets the root state")]
    #[diagnostic(code(harelite::model::root_target))]
    RootTarget { id: String },
}

#[derive(Clone, Debug)]
enum KindDecl {
    Atomic,
    Compound { initial: String },
    Parallel,
    Final,
    History { deep: bool, defaults: Vec<String> },
}

#[derive(Clone, Debug)]
struct StateDecl {
    doc_id: String,
    parent: Option<String>,
    kind: KindDecl,
    on_entry: Vec<Action>,
    on_exit: Vec<Action>,
    invokes: Vec<InvokeSpec>,
    done_data: Option<DoneData>,
}

/// Declarative form of a transition, resolved against state ids at build time.
#[derive(Clone, Debug, Default)]
pub struct Transition {
    events: Vec<String>,
    guard: Option<String>,
    targets: Vec<String>,
    internal: bool,
    actions: Vec<Action>,
}

impl Transition {
    /// Transition triggered by events matching `descriptor`.
    pub fn on(descriptor: impl Into<String>) -> Self {
        Self {
            events: vec![descriptor.into()],
            ..Self::default()
        }
    }

    /// Eventless transition, checked after every microstep.
    #[must_use]
    pub fn eventless() -> Self {
        Self::default()
    }

    /// Add another event descriptor to the trigger set.
    #[must_use]
    pub fn or_on(mut self, descriptor: impl Into<String>) -> Self {
        self.events.push(descriptor.into());
        self
    }

    /// Guard expression; the transition is enabled only when the registered
    /// evaluator reports it truthy.
    #[must_use]
    pub fn guard(mut self, expr: impl Into<String>) -> Self {
        self.guard = Some(expr.into());
        self
    }

    /// Add a target state.
    #[must_use]
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Mark the transition internal: the source is not exited when all
    /// targets sit below it.
    #[must_use]
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Append executable content, run between the exit and entry phases.
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}

/// Declarative form of an `<invoke>` on a state.
#[derive(Clone, Debug)]
pub struct InvokeSpec {
    /// Static invoke id; empty means one is generated per activation.
    pub id: String,
    /// Service-factory discriminator.
    pub kind: String,
    /// Source locator passed to the factory.
    pub src: String,
    /// Expression producing the invocation payload.
    pub payload_expr: Option<String>,
    /// Forward external events to the running service.
    pub auto_forward: bool,
}

impl InvokeSpec {
    /// Invoke spec with a generated id, no payload, and no forwarding.
    pub fn new(kind: impl Into<String>, src: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind: kind.into(),
            src: src.into(),
            payload_expr: None,
            auto_forward: false,
        }
    }

    /// Pin the invoke id so done/error events are addressable by name.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Payload expression evaluated at invocation start.
    #[must_use]
    pub fn with_payload(mut self, expr: impl Into<String>) -> Self {
        self.payload_expr = Some(expr.into());
        self
    }

    /// Forward external events to the running service.
    #[must_use]
    pub fn auto_forward(mut self) -> Self {
        self.auto_forward = true;
        self
    }
}

/// Builder for [`StateChart`]s.
///
/// States are declared flat, each naming its parent (or none for a top-level
/// state). Order of declaration fixes document order, which in turn fixes
/// entry/exit ordering and transition priority among siblings.
pub struct ChartBuilder {
    name: String,
    decls: Vec<StateDecl>,
    transitions: Vec<(String, Transition)>,
    root_initial: Option<String>,
}

impl ChartBuilder {
    /// Start a chart with the given name. The name doubles as the document id
    /// of the implicit root state.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decls: Vec::new(),
            transitions: Vec::new(),
            root_initial: None,
        }
    }

    fn declare(&mut self, doc_id: impl Into<String>, parent: Option<String>, kind: KindDecl) {
        self.decls.push(StateDecl {
            doc_id: doc_id.into(),
            parent,
            kind,
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            invokes: Vec::new(),
            done_data: None,
        });
    }

    /// Top-level atomic state.
    #[must_use]
    pub fn atomic(mut self, id: impl Into<String>) -> Self {
        self.declare(id, None, KindDecl::Atomic);
        self
    }

    /// Atomic state under `parent`.
    #[must_use]
    pub fn atomic_in(mut self, parent: impl Into<String>, id: impl Into<String>) -> Self {
        self.declare(id, Some(parent.into()), KindDecl::Atomic);
        self
    }

    /// Top-level compound state with the given initial child.
    #[must_use]
    pub fn compound(mut self, id: impl Into<String>, initial: impl Into<String>) -> Self {
        self.declare(
            id,
            None,
            KindDecl::Compound {
                initial: initial.into(),
            },
        );
        self
    }

    /// Compound state under `parent`.
    #[must_use]
    pub fn compound_in(
        mut self,
        parent: impl Into<String>,
        id: impl Into<String>,
        initial: impl Into<String>,
    ) -> Self {
        self.declare(
            id,
            Some(parent.into()),
            KindDecl::Compound {
                initial: initial.into(),
            },
        );
        self
    }

    /// Top-level parallel state.
    #[must_use]
    pub fn parallel(mut self, id: impl Into<String>) -> Self {
        self.declare(id, None, KindDecl::Parallel);
        self
    }

    /// Parallel state under `parent`.
    #[must_use]
    pub fn parallel_in(mut self, parent: impl Into<String>, id: impl Into<String>) -> Self {
        self.declare(id, Some(parent.into()), KindDecl::Parallel);
        self
    }

    /// Top-level final state. Entering it completes the whole instance.
    #[must_use]
    pub fn final_state(mut self, id: impl Into<String>) -> Self {
        self.declare(id, None, KindDecl::Final);
        self
    }

    /// Final state under `parent`.
    #[must_use]
    pub fn final_state_in(mut self, parent: impl Into<String>, id: impl Into<String>) -> Self {
        self.declare(id, Some(parent.into()), KindDecl::Final);
        self
    }

    /// Shallow history child of `parent`, restoring only the immediate child
    /// that was active at last exit.
    #[must_use]
    pub fn shallow_history(
        mut self,
        parent: impl Into<String>,
        id: impl Into<String>,
        defaults: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.declare(
            id,
            Some(parent.into()),
            KindDecl::History {
                deep: false,
                defaults: defaults.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    /// Deep history child of `parent`, restoring the full nested
    /// configuration that was active at last exit.
    #[must_use]
    pub fn deep_history(
        mut self,
        parent: impl Into<String>,
        id: impl Into<String>,
        defaults: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.declare(
            id,
            Some(parent.into()),
            KindDecl::History {
                deep: true,
                defaults: defaults.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    /// Declare a transition on `source`.
    #[must_use]
    pub fn transition(mut self, source: impl Into<String>, spec: Transition) -> Self {
        self.transitions.push((source.into(), spec));
        self
    }

    /// Append entry actions to a declared state.
    ///
    /// # Panics
    ///
    /// Panics when `id` has not been declared yet; declaration order is under
    /// the caller's control.
    #[must_use]
    pub fn on_entry(mut self, id: &str, actions: impl IntoIterator<Item = Action>) -> Self {
        self.decl_mut(id).on_entry.extend(actions);
        self
    }

    /// Append exit actions to a declared state.
    #[must_use]
    pub fn on_exit(mut self, id: &str, actions: impl IntoIterator<Item = Action>) -> Self {
        self.decl_mut(id).on_exit.extend(actions);
        self
    }

    /// Attach a service invocation to a declared state.
    #[must_use]
    pub fn invoke(mut self, id: &str, spec: InvokeSpec) -> Self {
        self.decl_mut(id).invokes.push(spec);
        self
    }

    /// Attach done-data to a declared final state.
    #[must_use]
    pub fn done_data(mut self, id: &str, done_data: DoneData) -> Self {
        self.decl_mut(id).done_data = Some(done_data);
        self
    }

    /// Set the chart's initial top-level state. Defaults to the first
    /// declared top-level state.
    #[must_use]
    pub fn initial(mut self, id: impl Into<String>) -> Self {
        self.root_initial = Some(id.into());
        self
    }

    fn decl_mut(&mut self, id: &str) -> &mut StateDecl {
        self.decls
            .iter_mut()
            .find(|d| d.doc_id == id)
            .unwrap_or_else(|| panic!("state '{id}' has not been declared"))
    }

    /// Resolve references, validate structure, and produce the compiled
    /// chart.
    pub fn build(self) -> Result<StateChart, ModelError> {
        const ROOT: StateId = 0;

        let mut by_doc_id: FxHashMap<String, StateId> = FxHashMap::default();
        by_doc_id.insert(self.name.clone(), ROOT);
        for (offset, decl) in self.decls.iter().enumerate() {
            let id = ROOT + 1 + offset;
            if by_doc_id.insert(decl.doc_id.clone(), id).is_some() {
                return Err(ModelError::DuplicateId {
                    id: decl.doc_id.clone(),
                });
            }
        }

        let resolve = |owner: &str, reference: &str| -> Result<StateId, ModelError> {
            by_doc_id
                .get(reference)
                .copied()
                .ok_or_else(|| ModelError::UnknownReference {
                    id: owner.to_string(),
                    reference: reference.to_string(),
                })
        };

        // Root is an implicit compound; its initial child is patched below.
        let mut states = vec![StateNode {
            id: ROOT,
            doc_id: self.name.clone(),
            parent: None,
            kind: StateKind::Compound { initial: ROOT },
            children: Vec::new(),
            transitions: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            invokes: Vec::new(),
            done_data: None,
            ancestors: Vec::new(),
            depth: 0,
            doc_order: 0,
        }];

        for (offset, decl) in self.decls.iter().enumerate() {
            let id = ROOT + 1 + offset;
            let parent = match &decl.parent {
                Some(p) => resolve(&decl.doc_id, p)?,
                None => ROOT,
            };
            let kind = match &decl.kind {
                KindDecl::Atomic => StateKind::Atomic,
                KindDecl::Compound { initial } => StateKind::Compound {
                    initial: resolve(&decl.doc_id, initial)?,
                },
                KindDecl::Parallel => StateKind::Parallel,
                KindDecl::Final => StateKind::Final,
                KindDecl::History { deep, defaults } => StateKind::History {
                    deep: *deep,
                    default_targets: defaults
                        .iter()
                        .map(|t| resolve(&decl.doc_id, t))
                        .collect::<Result<_, _>>()?,
                },
            };
            states.push(StateNode {
                id,
                doc_id: decl.doc_id.clone(),
                parent: Some(parent),
                kind,
                children: Vec::new(),
                transitions: Vec::new(),
                on_entry: decl.on_entry.clone(),
                on_exit: decl.on_exit.clone(),
                invokes: decl
                    .invokes
                    .iter()
                    .map(|spec| InvokeNode {
                        id: spec.id.clone(),
                        kind: spec.kind.clone(),
                        src: spec.src.clone(),
                        payload_expr: spec.payload_expr.clone(),
                        auto_forward: spec.auto_forward,
                    })
                    .collect(),
                done_data: decl.done_data.clone(),
                ancestors: Vec::new(),
                depth: 0,
                doc_order: id,
            });
        }

        for id in ROOT + 1..states.len() {
            let parent = states[id].parent.unwrap_or(ROOT);
            states[parent].children.push(id);
        }

        // Ancestor paths; declaration requires parents to exist, and parent
        // ids are always smaller only for forward declarations, so walk links.
        for id in ROOT + 1..states.len() {
            let mut path = Vec::new();
            let mut cursor = states[id].parent;
            while let Some(p) = cursor {
                path.push(p);
                cursor = states[p].parent;
            }
            states[id].depth = path.len();
            states[id].ancestors = path;
        }

        // Patch the root initial.
        let root_initial = match &self.root_initial {
            Some(doc_id) => resolve(&self.name, doc_id)?,
            None => states[ROOT]
                .children
                .iter()
                .copied()
                .find(|&c| !matches!(states[c].kind, StateKind::History { .. }))
                .ok_or_else(|| ModelError::EmptyCompound {
                    id: self.name.clone(),
                })?,
        };
        states[ROOT].kind = StateKind::Compound {
            initial: root_initial,
        };

        for (source_doc, spec) in &self.transitions {
            let source = resolve(source_doc, source_doc)?;
            let targets = spec
                .targets
                .iter()
                .map(|t| resolve(source_doc, t))
                .collect::<Result<Vec<_>, _>>()?;
            if targets.contains(&ROOT) {
                return Err(ModelError::RootTarget {
                    id: source_doc.clone(),
                });
            }
            states[source].transitions.push(TransitionNode {
                source,
                events: spec.events.iter().map(|e| EventDescriptor::parse(e)).collect(),
                guard: spec.guard.clone(),
                targets,
                kind: if spec.internal {
                    TransitionKind::Internal
                } else {
                    TransitionKind::External
                },
                actions: spec.actions.clone(),
            });
        }

        Self::validate(&states)?;

        Ok(StateChart::from_parts(self.name, states, ROOT, by_doc_id))
    }

    fn validate(states: &[StateNode]) -> Result<(), ModelError> {
        for node in states {
            match &node.kind {
                StateKind::Compound { initial } => {
                    let non_history = node
                        .children
                        .iter()
                        .any(|&c| !matches!(states[c].kind, StateKind::History { .. }));
                    if !non_history {
                        return Err(ModelError::EmptyCompound {
                            id: node.doc_id.clone(),
                        });
                    }
                    if !node.children.contains(initial) {
                        return Err(ModelError::InitialNotChild {
                            id: node.doc_id.clone(),
                            initial: states[*initial].doc_id.clone(),
                        });
                    }
                }
                StateKind::Parallel => {
                    let regions = node
                        .children
                        .iter()
                        .filter(|&&c| !matches!(states[c].kind, StateKind::History { .. }))
                        .count();
                    if regions == 0 {
                        return Err(ModelError::EmptyParallel {
                            id: node.doc_id.clone(),
                        });
                    }
                }
                StateKind::Final => {
                    if !node.children.is_empty() || !node.transitions.is_empty() {
                        return Err(ModelError::MalformedFinal {
                            id: node.doc_id.clone(),
                        });
                    }
                }
                StateKind::History {
                    default_targets, ..
                } => {
                    let parent = node.parent.unwrap_or_default();
                    if !matches!(
                        states[parent].kind,
                        StateKind::Compound { .. } | StateKind::Parallel
                    ) {
                        return Err(ModelError::MisplacedHistory {
                            id: node.doc_id.clone(),
                        });
                    }
                    for &target in default_targets {
                        if !states[target].ancestors.contains(&parent) {
                            return Err(ModelError::HistoryDefaultOutsideParent {
                                id: node.doc_id.clone(),
                                target: states[target].doc_id.clone(),
                            });
                        }
                    }
                }
                StateKind::Atomic => {}
            }
        }
        Ok(())
    }
}
