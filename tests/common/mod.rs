//! Shared fixtures for integration tests.

use std::sync::Arc;

use harelite::capability::CapabilityRegistry;
use harelite::context::EvaluationContext;
use harelite::interpreter::Interpreter;
use harelite::invoke::InvocationManager;
use harelite::model::{ChartBuilder, StateChart, Transition};

/// Two-state machine: A reaches B on "go".
pub fn toggle_chart() -> StateChart {
    ChartBuilder::new("toggle")
        .atomic("A")
        .atomic("B")
        .transition("A", Transition::on("go").to("B"))
        .initial("A")
        .build()
        .expect("fixture chart builds")
}

/// Parallel state P with regions R1 and R2, each reaching a final on its own
/// event, plus a top-level final entered on `done.state.P`.
pub fn parallel_chart() -> StateChart {
    ChartBuilder::new("split")
        .parallel("P")
        .compound_in("P", "R1", "a1")
        .atomic_in("R1", "a1")
        .final_state_in("R1", "f1")
        .compound_in("P", "R2", "a2")
        .atomic_in("R2", "a2")
        .final_state_in("R2", "f2")
        .final_state("all_done")
        .transition("a1", Transition::on("x").to("f1"))
        .transition("a2", Transition::on("y").to("f2"))
        .transition("a1", Transition::on("both").to("f1"))
        .transition("a2", Transition::on("both").to("f2"))
        .transition("P", Transition::on("done.state.P").to("all_done"))
        .initial("P")
        .build()
        .expect("fixture chart builds")
}

/// Compound with a shallow history marker, exited and re-entered through it.
pub fn history_chart() -> StateChart {
    ChartBuilder::new("door")
        .compound("operational", "closed")
        .atomic_in("operational", "closed")
        .atomic_in("operational", "open")
        .shallow_history("operational", "h", ["closed"])
        .atomic("maintenance")
        .transition("closed", Transition::on("toggle").to("open"))
        .transition("open", Transition::on("toggle").to("closed"))
        .transition("operational", Transition::on("breakdown").to("maintenance"))
        .transition("maintenance", Transition::on("fixed").to("h"))
        .initial("operational")
        .build()
        .expect("fixture chart builds")
}

/// Engine plus a fresh context and invocation manager for direct-drive
/// tests.
pub fn engine_for(chart: StateChart) -> (Interpreter, EvaluationContext, InvocationManager) {
    let interpreter = Interpreter::new(
        Arc::new(chart),
        Arc::new(CapabilityRegistry::default()),
    );
    (
        interpreter,
        EvaluationContext::new(),
        InvocationManager::default(),
    )
}

/// Active configuration as document-ordered document ids.
pub fn active_ids(interpreter: &Interpreter, ctx: &EvaluationContext) -> Vec<String> {
    let chart = interpreter.chart();
    let mut ids: Vec<_> = ctx.configuration().iter().copied().collect();
    ids.sort_by_key(|&s| chart.state(s).doc_order);
    ids.into_iter()
        .map(|s| chart.state(s).doc_id.clone())
        .collect()
}
