// SPDX-License-Identifier: Apache-2.0
//! Dynamic graph tests: per-key nested instances under map nodes and
//! incremental reduction over dictionary inputs.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;

use pulse_core::{
    DictPatch, Engine, EngineConfig, EngineError, EvalCtx, GraphPlan, InputPlan, Key, Kind,
    NodePlan, OutputSpec, TsDelta, Value,
};

fn value_of(engine: &mut Engine, node: &str) -> Option<Value> {
    let id = engine.graph().node_by_name(node)?;
    let output = engine.graph().node_output(id)?;
    engine.graph_mut().value(output)
}

fn delta_of(engine: &mut Engine, node: &str) -> Option<TsDelta> {
    let id = engine.graph().node_by_name(node)?;
    let output = engine.graph().node_output(id)?;
    engine.graph_mut().delta_value(output)
}

fn int_map(entries: &[(&str, i64)]) -> Value {
    Value::Map(
        entries
            .iter()
            .map(|(k, v)| (Key::from(*k), Value::Int(*v)))
            .collect(),
    )
}

#[test]
fn reduce_tracks_dictionary_membership_incrementally() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("src", 0, OutputSpec::Dict(Kind::Int)))
        .with_node(
            NodePlan::reduce("sum", 1, Value::Int(0), |a, b| {
                Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0))
            })
            .with_input(InputPlan::node("in", "src")),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let src = engine.push_handle("src")?;

    src.push_dict(DictPatch::new());
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "sum"),
        Some(Value::Int(0)),
        "an empty dictionary reduces to the identity"
    );

    src.push_dict(DictPatch::new().set("a", 1i64));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sum"), Some(Value::Int(1)));

    src.push_dict(DictPatch::new().set("b", 2i64));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sum"), Some(Value::Int(3)));

    src.push_dict(DictPatch::new().remove("a"));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sum"), Some(Value::Int(2)));

    src.push_dict(DictPatch::new().remove("b"));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sum"), Some(Value::Int(0)));
    Ok(())
}

#[test]
fn reduce_survives_value_overwrites() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("src", 0, OutputSpec::Dict(Kind::Int)))
        .with_node(
            NodePlan::reduce("sum", 1, Value::Int(0), |a, b| {
                Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0))
            })
            .with_input(InputPlan::node("in", "src")),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let src = engine.push_handle("src")?;

    src.push_dict(DictPatch::new().set("a", 10i64).set("b", 20i64));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sum"), Some(Value::Int(30)));

    // Overwriting a key replaces its leaf, not the membership.
    src.push_dict(DictPatch::new().set("a", 5i64));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sum"), Some(Value::Int(25)));
    Ok(())
}

fn plus_one_nested() -> Arc<GraphPlan> {
    Arc::new(
        GraphPlan::new()
            .with_node(
                NodePlan::compute("plus", 1, || {
                    |ctx: &mut EvalCtx<'_>| {
                        if let Some(Value::Int(n)) = ctx.input("x") {
                            ctx.apply(Value::Int(n + 1))?;
                        }
                        Ok(())
                    }
                })
                .with_output(OutputSpec::Scalar(Kind::Int))
                .with_input(InputPlan::stub("x")),
            )
            .with_output_node("plus"),
    )
}

#[test]
fn map_instances_track_key_membership() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("src", 0, OutputSpec::Dict(Kind::Int)))
        .with_node(
            NodePlan::map("mapped", 1, plus_one_nested(), &["x"], Kind::Int)
                .with_input(InputPlan::node("x", "src")),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let src = engine.push_handle("src")?;

    src.push_dict(DictPatch::new().set("a", 2i64));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "mapped"),
        Some(int_map(&[("a", 3)])),
        "a fresh key grows a nested instance in its arrival cycle"
    );

    src.push_dict(DictPatch::new().set("b", 3i64));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "mapped"),
        Some(int_map(&[("a", 3), ("b", 4)]))
    );
    match delta_of(&mut engine, "mapped") {
        Some(TsDelta::Dict(delta)) => {
            assert_eq!(delta.added.get(&Key::from("b")), Some(&Value::Int(4)));
            assert!(
                !delta.added.contains_key(&Key::from("a")),
                "untouched keys do not reappear in the delta"
            );
        }
        other => panic!("expected a dictionary delta, got {other:?}"),
    }

    // Modifying an existing key re-evaluates only that instance.
    src.push_dict(DictPatch::new().set("a", 10i64));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "mapped"),
        Some(int_map(&[("a", 11), ("b", 4)]))
    );

    src.push_dict(DictPatch::new().remove("a"));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "mapped"), Some(int_map(&[("b", 4)])));
    match delta_of(&mut engine, "mapped") {
        Some(TsDelta::Dict(delta)) => {
            assert!(
                delta.removed.contains(&Key::from("a")),
                "a gone key is reported removed from the result"
            );
        }
        other => panic!("expected a dictionary delta, got {other:?}"),
    }
    Ok(())
}

fn gated_sum_nested() -> Arc<GraphPlan> {
    Arc::new(
        GraphPlan::new()
            .with_node(
                NodePlan::compute("sum", 1, || {
                    |ctx: &mut EvalCtx<'_>| {
                        let x = ctx.input("x").and_then(|v| v.as_int()).unwrap_or(0);
                        let y = ctx.input("y").and_then(|v| v.as_int()).unwrap_or(0);
                        ctx.apply(Value::Int(x + y))?;
                        Ok(())
                    }
                })
                .with_output(OutputSpec::Scalar(Kind::Int))
                .with_input(InputPlan::stub("x").require_valid())
                .with_input(InputPlan::stub("y").require_valid()),
            )
            .with_output_node("sum"),
    )
}

#[test]
fn gated_instances_sit_out_while_a_mapped_key_is_one_sided() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("lhs", 0, OutputSpec::Dict(Kind::Int)))
        .with_node(NodePlan::push("rhs", 0, OutputSpec::Dict(Kind::Int)))
        .with_node(
            NodePlan::map("sums", 1, gated_sum_nested(), &["x", "y"], Kind::Int)
                .with_input(InputPlan::node("x", "lhs"))
                .with_input(InputPlan::node("y", "rhs")),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let lhs = engine.push_handle("lhs")?;
    let rhs = engine.push_handle("rhs")?;

    // "b" exists on one side only; its instance's other stub is wired to a
    // never-valid placeholder, so the validity gate must hold even on the
    // instance's creation turn.
    lhs.push_dict(DictPatch::new().set("a", 1i64).set("b", 2i64));
    rhs.push_dict(DictPatch::new().set("a", 10i64));
    engine.step()?;
    assert_eq!(
        value_of(&mut engine, "sums"),
        Some(int_map(&[("a", 11)])),
        "a one-sided key produces no result"
    );

    // A later write on the bound side wakes the instance, but the gate
    // still holds.
    lhs.push_dict(DictPatch::new().set("b", 5i64));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "sums"), Some(int_map(&[("a", 11)])));
    Ok(())
}

#[test]
fn map_results_feed_a_downstream_reduce() -> Result<(), EngineError> {
    let plan = GraphPlan::new()
        .with_node(NodePlan::push("src", 0, OutputSpec::Dict(Kind::Int)))
        .with_node(
            NodePlan::map("mapped", 1, plus_one_nested(), &["x"], Kind::Int)
                .with_input(InputPlan::node("x", "src")),
        )
        .with_node(
            NodePlan::reduce("total", 2, Value::Int(0), |a, b| {
                Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0))
            })
            .with_input(InputPlan::node("in", "mapped")),
        );
    let mut engine = Engine::new(&plan, EngineConfig::default())?;
    let src = engine.push_handle("src")?;

    src.push_dict(DictPatch::new().set("a", 1i64).set("b", 2i64));
    engine.step()?;
    // (1+1) + (2+1), folded in the same cycle the instances appear.
    assert_eq!(value_of(&mut engine, "total"), Some(Value::Int(5)));

    src.push_dict(DictPatch::new().remove("b"));
    engine.step()?;
    assert_eq!(value_of(&mut engine, "total"), Some(Value::Int(2)));
    Ok(())
}
