//! Interpreter semantics: macrostep ordering, parallel completion, history,
//! conflict resolution, and error conversion.

mod common;

use common::{active_ids, engine_for, history_chart, parallel_chart, toggle_chart};
use harelite::datamodel::DataModelValue;
use harelite::event::EventObject;
use harelite::interpreter::InterpreterError;
use harelite::model::{Action, ChartBuilder, DoneData, Transition};
use harelite::persistence::LogRecord;
use harelite::types::{Completion, InstanceStatus};

#[test]
fn events_before_start_are_queued_with_no_effect() {
    let (engine, mut ctx, mut invocations) = engine_for(toggle_chart());

    ctx.enqueue_external(EventObject::named("go"));
    assert_eq!(ctx.status(), InstanceStatus::Uninitialized);

    engine.start(&mut ctx, &mut invocations).unwrap();
    assert_eq!(active_ids(&engine, &ctx), vec!["A"]);
    assert_eq!(ctx.external_queue_len(), 1);

    engine.macrostep(&mut ctx, &mut invocations).unwrap();
    assert_eq!(active_ids(&engine, &ctx), vec!["B"]);
}

#[test]
fn unmatched_events_are_consumed_without_a_microstep() {
    let (engine, mut ctx, mut invocations) = engine_for(toggle_chart());
    engine.start(&mut ctx, &mut invocations).unwrap();

    ctx.enqueue_external(EventObject::named("nonsense"));
    let report = engine.macrostep(&mut ctx, &mut invocations).unwrap();
    assert!(report.consumed_external);
    assert_eq!(report.microsteps, 0);
    assert_eq!(active_ids(&engine, &ctx), vec!["A"]);
}

#[test]
fn internal_events_preempt_queued_external_events() {
    let chart = ChartBuilder::new("rtc")
        .atomic("A")
        .atomic("B")
        .atomic("C")
        .atomic("D")
        .transition(
            "A",
            Transition::on("go").to("B").action(Action::Raise {
                event: "ping".to_string(),
            }),
        )
        .transition("B", Transition::on("ping").to("C"))
        .transition("B", Transition::on("go").to("D"))
        .initial("A")
        .build()
        .unwrap();
    let (engine, mut ctx, mut invocations) = engine_for(chart);
    engine.start(&mut ctx, &mut invocations).unwrap();

    ctx.enqueue_external(EventObject::named("go"));
    ctx.enqueue_external(EventObject::named("go"));

    // One macrostep: first "go" enters B, the raised "ping" is processed
    // before the second "go" is even looked at.
    let report = engine.macrostep(&mut ctx, &mut invocations).unwrap();
    assert_eq!(report.microsteps, 2);
    assert_eq!(active_ids(&engine, &ctx), vec!["C"]);
    assert_eq!(ctx.external_queue_len(), 1);
}

#[test]
fn parallel_regions_complete_independently() {
    let (engine, mut ctx, mut invocations) = engine_for(parallel_chart());
    engine.start(&mut ctx, &mut invocations).unwrap();
    assert_eq!(active_ids(&engine, &ctx), vec!["P", "R1", "a1", "R2", "a2"]);

    ctx.enqueue_external(EventObject::named("x"));
    engine.macrostep(&mut ctx, &mut invocations).unwrap();
    assert_eq!(active_ids(&engine, &ctx), vec!["P", "R1", "f1", "R2", "a2"]);
    // R2 is not final yet, so no done event for P has fired.
    assert_eq!(ctx.status(), InstanceStatus::Running);

    ctx.enqueue_external(EventObject::named("y"));
    engine.macrostep(&mut ctx, &mut invocations).unwrap();
    assert_eq!(ctx.status(), InstanceStatus::Done);
}

#[test]
fn parallel_done_is_raised_exactly_once_when_both_regions_finish_together() {
    let (engine, mut ctx, mut invocations) = engine_for(parallel_chart());
    engine.start(&mut ctx, &mut invocations).unwrap();

    ctx.enqueue_external(EventObject::named("both"));
    engine.macrostep(&mut ctx, &mut invocations).unwrap();
    assert_eq!(ctx.status(), InstanceStatus::Done);

    let done_p_raised = ctx
        .log()
        .entries()
        .iter()
        .filter_map(harelite::persistence::LogEntry::decode)
        .filter(|record| {
            matches!(
                record,
                LogRecord::InternalEnqueued { event } if event.name == "done.state.P"
            )
        })
        .count();
    assert_eq!(done_p_raised, 1);
}

#[test]
fn parallel_done_data_aggregates_region_results() {
    let chart = ChartBuilder::new("agg")
        .parallel("P")
        .compound_in("P", "R1", "a1")
        .atomic_in("R1", "a1")
        .final_state_in("R1", "f1")
        .compound_in("P", "R2", "a2")
        .atomic_in("R2", "a2")
        .final_state_in("R2", "f2")
        .final_state("all_done")
        .done_data(
            "f1",
            DoneData {
                content_expr: Some("'one'".to_string()),
                params: vec![],
            },
        )
        .done_data(
            "f2",
            DoneData {
                content_expr: Some("'two'".to_string()),
                params: vec![],
            },
        )
        .done_data(
            "all_done",
            DoneData {
                content_expr: Some("outcome".to_string()),
                params: vec![],
            },
        )
        .transition("a1", Transition::on("finish").to("f1"))
        .transition("a2", Transition::on("finish").to("f2"))
        .transition(
            "P",
            Transition::on("done.state.P").to("all_done").action(Action::Assign {
                location: "outcome".to_string(),
                expr: "_event.data".to_string(),
            }),
        )
        .initial("P")
        .build()
        .unwrap();
    let (engine, mut ctx, mut invocations) = engine_for(chart);
    engine.start(&mut ctx, &mut invocations).unwrap();

    ctx.enqueue_external(EventObject::named("finish"));
    engine.macrostep(&mut ctx, &mut invocations).unwrap();

    assert_eq!(ctx.status(), InstanceStatus::Done);
    let expected = DataModelValue::object([
        ("R1", DataModelValue::String("one".to_string())),
        ("R2", DataModelValue::String("two".to_string())),
    ]);
    assert_eq!(ctx.result(), Some(&Completion::Completed(expected)));
}

#[test]
fn shallow_history_restores_the_last_active_child() {
    let (engine, mut ctx, mut invocations) = engine_for(history_chart());
    engine.start(&mut ctx, &mut invocations).unwrap();
    assert_eq!(active_ids(&engine, &ctx), vec!["operational", "closed"]);

    for event in ["toggle", "breakdown", "fixed"] {
        ctx.enqueue_external(EventObject::named(event));
        engine.macrostep(&mut ctx, &mut invocations).unwrap();
    }
    // toggle moved to "open", breakdown recorded it, fixed restored it.
    assert_eq!(active_ids(&engine, &ctx), vec!["operational", "open"]);
}

#[test]
fn history_without_a_prior_exit_enters_the_default_target() {
    let (engine, mut ctx, mut invocations) = engine_for(
        ChartBuilder::new("door")
            .compound("operational", "closed")
            .atomic_in("operational", "closed")
            .atomic_in("operational", "open")
            .shallow_history("operational", "h", ["open"])
            .atomic("idle")
            .transition("idle", Transition::on("resume").to("h"))
            .initial("idle")
            .build()
            .unwrap(),
    );
    engine.start(&mut ctx, &mut invocations).unwrap();

    ctx.enqueue_external(EventObject::named("resume"));
    engine.macrostep(&mut ctx, &mut invocations).unwrap();
    assert_eq!(active_ids(&engine, &ctx), vec!["operational", "open"]);
}

#[test]
fn deep_history_restores_nested_configuration() {
    let chart = ChartBuilder::new("deep")
        .compound("outer", "mid")
        .compound_in("outer", "mid", "leaf_a")
        .atomic_in("mid", "leaf_a")
        .atomic_in("mid", "leaf_b")
        .deep_history("outer", "dh", ["leaf_a"])
        .atomic("away")
        .transition("leaf_a", Transition::on("step").to("leaf_b"))
        .transition("outer", Transition::on("leave").to("away"))
        .transition("away", Transition::on("back").to("dh"))
        .initial("outer")
        .build()
        .unwrap();
    let (engine, mut ctx, mut invocations) = engine_for(chart);
    engine.start(&mut ctx, &mut invocations).unwrap();

    for event in ["step", "leave", "back"] {
        ctx.enqueue_external(EventObject::named(event));
        engine.macrostep(&mut ctx, &mut invocations).unwrap();
    }
    assert_eq!(active_ids(&engine, &ctx), vec!["outer", "mid", "leaf_b"]);
}

#[test]
fn transitions_sourced_on_ancestors_preempt_region_transitions() {
    let chart = ChartBuilder::new("conflict")
        .parallel("P")
        .compound_in("P", "R1", "a1")
        .atomic_in("R1", "a1")
        .compound_in("P", "R2", "a2")
        .atomic_in("R2", "a2")
        .atomic_in("R2", "b2")
        .atomic("X")
        .transition("a2", Transition::on("evt").to("b2"))
        .transition("P", Transition::on("evt").to("X"))
        .initial("P")
        .build()
        .unwrap();
    let (engine, mut ctx, mut invocations) = engine_for(chart);
    engine.start(&mut ctx, &mut invocations).unwrap();

    ctx.enqueue_external(EventObject::named("evt"));
    engine.macrostep(&mut ctx, &mut invocations).unwrap();
    assert_eq!(active_ids(&engine, &ctx), vec!["X"]);
}

#[test]
fn failing_guards_raise_error_execution_instead_of_firing() {
    let chart = ChartBuilder::new("guards")
        .atomic("A")
        .atomic("B")
        .atomic("err")
        .transition("A", Transition::on("go").guard("a + b").to("B"))
        .transition("A", Transition::on("error.execution").to("err"))
        .initial("A")
        .build()
        .unwrap();
    let (engine, mut ctx, mut invocations) = engine_for(chart);
    engine.start(&mut ctx, &mut invocations).unwrap();

    ctx.enqueue_external(EventObject::named("go"));
    engine.macrostep(&mut ctx, &mut invocations).unwrap();
    assert_eq!(active_ids(&engine, &ctx), vec!["err"]);
}

#[test]
fn failing_actions_abort_only_the_rest_of_their_block() {
    let chart = ChartBuilder::new("blocks")
        .atomic("A")
        .atomic("B")
        .transition(
            "A",
            Transition::on("go")
                .to("B")
                .action(Action::Assign {
                    location: "before".to_string(),
                    expr: "1".to_string(),
                })
                .action(Action::Assign {
                    location: "broken".to_string(),
                    expr: "a + b".to_string(),
                })
                .action(Action::Assign {
                    location: "after".to_string(),
                    expr: "2".to_string(),
                }),
        )
        .initial("A")
        .build()
        .unwrap();
    let (engine, mut ctx, mut invocations) = engine_for(chart);
    engine.start(&mut ctx, &mut invocations).unwrap();

    ctx.enqueue_external(EventObject::named("go"));
    engine.macrostep(&mut ctx, &mut invocations).unwrap();

    // The transition still completes; only the remainder of the action
    // block was skipped.
    assert_eq!(active_ids(&engine, &ctx), vec!["B"]);
    assert_eq!(ctx.data().get_path("before"), DataModelValue::Number(1.0));
    assert!(ctx.data().get_path("after").is_undefined());
}

#[test]
fn runaway_eventless_loops_hit_the_microstep_limit() {
    let chart = ChartBuilder::new("runaway")
        .atomic("spin")
        .atomic("other")
        .transition("spin", Transition::eventless().to("spin"))
        .initial("spin")
        .build()
        .unwrap();
    let (engine, mut ctx, mut invocations) = engine_for(chart);
    let err = engine.start(&mut ctx, &mut invocations).unwrap_err();
    assert!(matches!(err, InterpreterError::MicrostepLimit { .. }));
}

#[test]
fn eventless_transitions_with_failing_guards_also_hit_the_limit() {
    // The guard never evaluates, so no microstep ever runs; each pass just
    // raises and consumes an error.execution event. The limit must still
    // trip instead of looping forever.
    let chart = ChartBuilder::new("stuck")
        .atomic("A")
        .atomic("B")
        .transition("A", Transition::eventless().guard("a + b").to("B"))
        .initial("A")
        .build()
        .unwrap();
    let (engine, mut ctx, mut invocations) = engine_for(chart);
    let err = engine.start(&mut ctx, &mut invocations).unwrap_err();
    assert!(matches!(err, InterpreterError::MicrostepLimit { .. }));
}

#[test]
fn configuration_stays_consistent_after_every_macrostep() {
    let (engine, mut ctx, mut invocations) = engine_for(parallel_chart());
    engine.start(&mut ctx, &mut invocations).unwrap();
    for event in ["x", "nothing", "y"] {
        ctx.enqueue_external(EventObject::named(event));
        engine.macrostep(&mut ctx, &mut invocations).unwrap();
        ctx.assert_consistent(engine.chart()).unwrap();
    }
}
