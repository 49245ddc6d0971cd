// SPDX-License-Identifier: Apache-2.0
//! End-to-end engine cycle tests: push ingestion, per-cycle modification
//! stamps, window eviction reporting, reference rebinding, error capture,
//! self-scheduling, and shutdown.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::time::Duration;

use pulse_core::{
    DictPatch, Engine, EngineConfig, EngineError, EvalCtx, GraphPlan, InputPlan, InputSource, Key,
    Kind, NodeBody, NodeError, NodePlan, OutputSpec, Tag, TsDelta, Value,
};

fn value_of(engine: &mut Engine, node: &str) -> Option<Value> {
    let id = engine.graph().node_by_name(node)?;
    let output = engine.graph().node_output(id)?;
    engine.graph_mut().value(output)
}

fn modified(engine: &Engine, node: &str) -> bool {
    let Some(id) = engine.graph().node_by_name(node) else {
        return false;
    };
    let Some(output) = engine.graph().node_output(id) else {
        return false;
    };
    engine.graph().modified(output)
}

#[test]
fn pushed_values_land_in_their_own_cycle() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("a", 0, OutputSpec::Scalar(Kind::Int)))
        .with_node(NodePlan::push("b", 0, OutputSpec::Scalar(Kind::Int)));
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let a = engine.push_handle("a")?;
    let b = engine.push_handle("b")?;

    a.push(Value::Int(5));
    let t1 = engine.step()?;
    assert!(t1.is_some(), "a push must trigger a cycle");
    assert_eq!(value_of(&mut engine, "a"), Some(Value::Int(5)));
    assert!(modified(&engine, "a"), "a was written this cycle");

    b.push(Value::Int(7));
    let t2 = engine.step()?;
    assert!(t2 > t1, "cycle times are strictly increasing");
    assert_eq!(value_of(&mut engine, "b"), Some(Value::Int(7)));
    assert!(modified(&engine, "b"));
    // a retains its value but is no longer marked modified.
    assert_eq!(value_of(&mut engine, "a"), Some(Value::Int(5)));
    assert!(!modified(&engine, "a"), "a did not tick in b's cycle");
    Ok(())
}

#[test]
fn unfoldable_pushes_carry_over_to_the_next_cycle() -> Result<(), EngineError> {
    let plan = GraphPlan::new().with_node(NodePlan::push("src", 0, OutputSpec::Scalar(Kind::Int)));
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let src = engine.push_handle("src")?;

    src.push(Value::Int(1));
    src.push(Value::Int(2));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "src"),
        Some(Value::Int(1)),
        "first value lands alone; the second must not overwrite it"
    );
    engine.step()?;
    assert_eq!(value_of(&mut engine, "src"), Some(Value::Int(2)));
    Ok(())
}

#[test]
fn elide_nodes_collapse_queued_values_to_the_latest() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("src", 0, OutputSpec::Scalar(Kind::Int)).elide());
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let src = engine.push_handle("src")?;

    src.push(Value::Int(1));
    src.push(Value::Int(2));
    src.push(Value::Int(3));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "src"), Some(Value::Int(3)));
    assert_eq!(engine.step()?, None, "nothing carried over");
    Ok(())
}

#[test]
fn fixed_window_gates_on_min_size_and_reports_evictions_once() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push(
            "w",
            0,
            // min_size matches capacity: the first readable view is the
            // full window.
            OutputSpec::FixedWindow {
                elem: Kind::Int,
                capacity: 3,
                min_size: 3,
            },
        ))
        .with_node(
            // Records the first evicted value seen on each tick.
            NodePlan::compute("evictions", 1, || {
                |ctx: &mut EvalCtx<'_>| {
                    if let Some(TsDelta::Window(delta)) = ctx.input_delta("w") {
                        if let Some(evicted) = delta.removed.first() {
                            ctx.apply(evicted.clone())?;
                        }
                    }
                    Ok(())
                }
            })
            .with_output(OutputSpec::Scalar(Kind::Int))
            .with_input(InputPlan::node("w", "w")),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let w = engine.push_handle("w")?;

    for n in 1..=2i64 {
        w.push(Value::Int(n));
        engine.step()?;
        assert_eq!(
            value_of(&mut engine, "w"),
            None,
            "window reads as invalid below min_size"
        );
    }
    w.push(Value::Int(3));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "w"),
        Some(Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
    );
    assert_eq!(
        value_of(&mut engine, "evictions"),
        None,
        "no eviction yet"
    );

    w.push(Value::Int(4));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "w"),
        Some(Value::List(vec![Value::Int(2), Value::Int(3), Value::Int(4)]))
    );
    assert_eq!(
        value_of(&mut engine, "evictions"),
        Some(Value::Int(1)),
        "the rolled-out sample surfaces through the delta exactly once"
    );
    Ok(())
}

#[test]
fn references_rebind_an_input_between_producers() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("asrc", 0, OutputSpec::Scalar(Kind::Int)))
        .with_node(NodePlan::push("bsrc", 0, OutputSpec::Scalar(Kind::Int)))
        .with_node(NodePlan::push("pick", 0, OutputSpec::Scalar(Kind::Bool)))
        .with_node(
            NodePlan::compute("sel", 1, || {
                |ctx: &mut EvalCtx<'_>| {
                    let pick = ctx.input("pick").and_then(|v| v.as_bool()).unwrap_or(false);
                    let chosen = if pick {
                        ctx.input_ref("a")
                    } else {
                        ctx.input_ref("b")
                    };
                    ctx.bind_ref("in", &chosen)?;
                    if let Some(v) = ctx.input("in") {
                        ctx.apply(v)?;
                    }
                    Ok(())
                }
            })
            .with_output(OutputSpec::Scalar(Kind::Int))
            .with_input(InputPlan::node("pick", "pick"))
            .with_input(InputPlan::node("a", "asrc").passive())
            .with_input(InputPlan::node("b", "bsrc").passive())
            .with_input(InputPlan::stub("in")),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let asrc = engine.push_handle("asrc")?;
    let bsrc = engine.push_handle("bsrc")?;
    let pick = engine.push_handle("pick")?;

    asrc.push(Value::Int(10));
    bsrc.push(Value::Int(20));
    pick.push(Value::Bool(true));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sel"), Some(Value::Int(10)));

    pick.push(Value::Bool(false));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sel"), Some(Value::Int(20)));

    // The rebound input is active: a write to bsrc wakes sel.
    bsrc.push(Value::Int(25));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sel"), Some(Value::Int(25)));

    // asrc is only held through a passive input now; sel stays put.
    asrc.push(Value::Int(99));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sel"), Some(Value::Int(25)));
    Ok(())
}

#[test]
fn weak_removal_of_a_missing_key_is_a_no_op() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("d", 0, OutputSpec::Dict(Kind::Int)).capture_errors());
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let d = engine.push_handle("d")?;

    d.push_dict(DictPatch::new().remove_if_exists("ghost"));
    engine.step()?;
    assert!(modified(&engine, "d"), "an empty effective patch still ticks");
    let node = engine.graph().node_by_name("d").unwrap();
    assert!(
        engine.graph().node_error_output(node).is_some(),
        "capture_errors grants an error output"
    );
    let err_out = engine.graph().node_error_output(node).unwrap();
    assert_eq!(engine.graph_mut().value(err_out), None, "no error raised");
    Ok(())
}

#[test]
fn strong_removal_of_a_missing_key_is_captured() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("d", 0, OutputSpec::Dict(Kind::Int)).capture_errors());
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let d = engine.push_handle("d")?;

    d.push_dict(DictPatch::new().remove("ghost"));
    engine.step()?;
    let node = engine.graph().node_by_name("d").unwrap();
    let err_out = engine.graph().node_error_output(node).unwrap();
    let err = engine.graph_mut().value(err_out);
    assert!(err.is_some(), "strong removal of an absent key must fail");
    Ok(())
}

#[test]
fn invalidating_a_dictionary_drops_its_membership() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("tick", 0, OutputSpec::Scalar(Kind::Int)))
        .with_node(
            NodePlan::compute("d", 1, || {
                |ctx: &mut EvalCtx<'_>| {
                    let n = ctx.state::<i64>().map_or(0, |s| *s) + 1;
                    ctx.set_state(n);
                    match n {
                        1 => ctx.apply_dict(DictPatch::new().set("a", 1i64).set("b", 2i64))?,
                        2 => ctx.invalidate(),
                        _ => ctx.apply_dict(DictPatch::new().set("a", 9i64))?,
                    }
                    Ok(())
                }
            })
            .with_output(OutputSpec::Dict(Kind::Int))
            .with_input(InputPlan::node("t", "tick")),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let tick = engine.push_handle("tick")?;

    tick.push(Value::Int(0));
    engine.step()?;
    let expected: std::collections::BTreeMap<Key, Value> = [
        (Key::from("a"), Value::Int(1)),
        (Key::from("b"), Value::Int(2)),
    ]
    .into_iter()
    .collect();
    assert_eq!(value_of(&mut engine, "d"), Some(Value::Map(expected)));

    tick.push(Value::Int(0));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "d"),
        None,
        "an invalidated dictionary reads as invalid"
    );

    // Re-validation starts from empty membership: "b" must not resurface.
    tick.push(Value::Int(0));
    engine.step()?;
    let expected: std::collections::BTreeMap<Key, Value> =
        [(Key::from("a"), Value::Int(9))].into_iter().collect();
    assert_eq!(value_of(&mut engine, "d"), Some(Value::Map(expected)));
    Ok(())
}

#[test]
fn same_cycle_set_then_remove_pushes_fold_without_error() -> Result<(), EngineError> {
    let plan = GraphPlan::new().with_node(NodePlan::push("d", 0, OutputSpec::Dict(Kind::Int)));
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let d = engine.push_handle("d")?;

    // Both messages land in one drain. The key only ever existed inside the
    // folded batch, so the removal must not demand prior membership.
    d.push_dict(DictPatch::new().set("k", 1i64));
    d.push_dict(DictPatch::new().remove("k"));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "d"),
        Some(Value::Map(std::collections::BTreeMap::new())),
        "the folded batch nets to an empty dictionary"
    );
    Ok(())
}

#[test]
fn consumers_sit_out_cycles_without_an_input_tick_or_alarm() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("src", 0, OutputSpec::Scalar(Kind::Int)))
        .with_node(
            NodePlan::compute("count", 1, || {
                |ctx: &mut EvalCtx<'_>| {
                    let n = ctx.state::<i64>().map_or(0, |s| *s) + 1;
                    ctx.set_state(n);
                    ctx.apply(Value::Int(n))?;
                    Ok(())
                }
            })
            .with_output(OutputSpec::Scalar(Kind::Int))
            .with_input(InputPlan::node("x", "src")),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;

    // The first cycle runs the source's turn, but its consumer has no
    // ticked input and no alarm, so the unconditional body never fires.
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "count"),
        None,
        "a consumer takes no turn without a tick or alarm"
    );

    let src = engine.push_handle("src")?;
    src.push(Value::Int(7));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "count"),
        Some(Value::Int(1)),
        "the first real tick is the first evaluation"
    );
    Ok(())
}

#[test]
fn uncaptured_body_errors_abort_the_run_with_context() {
    let plan = GraphPlan::new().with_node(
        NodePlan::compute("bad", 1, || {
            |_ctx: &mut EvalCtx<'_>| -> Result<(), NodeError> { Err(NodeError::custom("boom")) }
        })
        .with_output(OutputSpec::Scalar(Kind::Int)),
    );
    let mut engine = Engine::new(&plan, EngineConfig::default()).unwrap();
    match engine.step() {
        Err(EngineError::Node { node, .. }) => assert_eq!(node.as_ref(), "bad"),
        other => panic!("expected a node error, got {other:?}"),
    }
}

#[test]
fn self_scheduling_generator_runs_to_completion() -> Result<(), EngineError> {
    let plan = GraphPlan::new().with_node(
        NodePlan::compute("gen", 1, || {
            |ctx: &mut EvalCtx<'_>| {
                let n = ctx.state::<i64>().map_or(0, |s| *s) + 1;
                ctx.set_state(n);
                ctx.apply(Value::Int(n))?;
                if n < 3 {
                    ctx.schedule_in(Duration::from_millis(1))?;
                }
                Ok(())
            }
        })
        .with_output(OutputSpec::Scalar(Kind::Int)),
    );
    // Simulation mode: the run completes as soon as the generator stops
    // rescheduling itself.
    let mut engine = pulse_core::run(&plan, EngineConfig::default())?;
    assert_eq!(value_of(&mut engine, "gen"), Some(Value::Int(3)));
    assert!(
        engine.graph().now() >= engine.graph().start_time() + Duration::from_millis(2),
        "three evaluations span two 1ms hops"
    );
    Ok(())
}

#[test]
fn tagged_alarms_fire_in_time_order_and_cancel_cleanly() -> Result<(), EngineError> {
    let plan = GraphPlan::new().with_node(
        NodePlan::compute("alarms", 1, || {
            |ctx: &mut EvalCtx<'_>| {
                let armed = ctx.state::<bool>().copied().unwrap_or(false);
                if !armed {
                    ctx.set_state(true);
                    ctx.schedule_tagged(Tag::new("soon"), ctx.now() + Duration::from_millis(1))?;
                    ctx.schedule_tagged(Tag::new("later"), ctx.now() + Duration::from_millis(2))?;
                    ctx.schedule_tagged(Tag::new("never"), ctx.now() + Duration::from_millis(3))?;
                    ctx.cancel(&Tag::new("never"));
                    return Ok(());
                }
                // A wake left behind by the canceled tag fires nothing.
                if ctx.fired(&Tag::new("soon")) {
                    ctx.apply(Value::Int(1))?;
                } else if ctx.fired(&Tag::new("later")) {
                    ctx.apply(Value::Int(2))?;
                }
                Ok(())
            }
        })
        .with_output(OutputSpec::Scalar(Kind::Int)),
    );
    let mut engine = pulse_core::run(&plan, EngineConfig::default())?;
    assert_eq!(value_of(&mut engine, "alarms"), Some(Value::Int(2)));
    Ok(())
}

#[test]
fn composite_inputs_assemble_independent_parts() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("x", 0, OutputSpec::Scalar(Kind::Int)))
        .with_node(NodePlan::push("y", 0, OutputSpec::Scalar(Kind::Int)))
        .with_node(
            NodePlan::compute("pair", 1, || {
                |ctx: &mut EvalCtx<'_>| {
                    if let Some(v) = ctx.input("xy") {
                        ctx.apply(v)?;
                    }
                    Ok(())
                }
            })
            .with_output(OutputSpec::List {
                arity: 2,
                elem: Kind::Int,
            })
            .with_input(InputPlan::parts(
                "xy",
                vec![
                    InputSource::Node("x".to_owned()),
                    InputSource::Node("y".to_owned()),
                ],
            )),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let x = engine.push_handle("x")?;
    let y = engine.push_handle("y")?;

    x.push(Value::Int(1));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "pair"),
        None,
        "a composite with an unwritten part reads as empty"
    );

    y.push(Value::Int(2));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "pair"),
        Some(Value::List(vec![Value::Int(1), Value::Int(2)]))
    );
    Ok(())
}

struct Latch;

impl NodeBody for Latch {
    fn eval(&mut self, ctx: &mut EvalCtx<'_>) -> Result<(), NodeError> {
        if let Some(v) = ctx.input("in") {
            ctx.apply(v)?;
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &mut EvalCtx<'_>) -> Result<(), NodeError> {
        ctx.apply(Value::Int(-1))?;
        Ok(())
    }
}

#[test]
fn stop_request_finishes_carried_pushes_then_runs_stop_hooks() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("src", 0, OutputSpec::Scalar(Kind::Int)))
        .with_node(
            NodePlan::compute("latch", 1, || Latch)
                .with_output(OutputSpec::Scalar(Kind::Int))
                .with_input(InputPlan::node("in", "src")),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let src = engine.push_handle("src")?;
    let stop = engine.stop_handle();

    src.push(Value::Int(1));
    src.push(Value::Int(2));
    stop.stop();
    src.push(Value::Int(3)); // arrives after the stop request; dropped
    engine.run()?;

    // Both queued values got their cycles (the second carried over), then
    // the stop hook wrote its sentinel on the shutdown cycle.
    assert_eq!(value_of(&mut engine, "src"), Some(Value::Int(2)));
    assert_eq!(value_of(&mut engine, "latch"), Some(Value::Int(-1)));
    Ok(())
}

#[test]
fn harness_drives_a_single_body() -> Result<(), EngineError> {
    use pulse_core::harness::NodeHarness;

    let node = NodePlan::compute("double", 1, || {
        |ctx: &mut EvalCtx<'_>| {
            if let Some(Value::Int(n)) = ctx.input("x") {
                ctx.apply(Value::Int(n * 2))?;
            }
            Ok(())
        }
    })
    .with_output(OutputSpec::Scalar(Kind::Int));
    let mut harness = NodeHarness::new(node, &[("x", OutputSpec::Scalar(Kind::Int))])?;

    harness.set_input("x", Value::Int(21));
    harness.step()?;
    assert_eq!(harness.output_value(), Some(Value::Int(42)));
    Ok(())
}
