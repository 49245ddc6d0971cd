// SPDX-License-Identifier: Apache-2.0
//! pulse-core: push/pull time-series dataflow runtime.
//!
//! A computation is a graph of nodes exchanging time series: each node owns
//! at most one typed output, reads named inputs bound to other outputs, and
//! is evaluated by a rank-ordered cooperative scheduler in discrete engine
//! cycles. Collections (dictionaries, sets, lists, windows) carry per-cycle
//! deltas alongside their assembled values; references make topology a
//! first-class, reboundable value; map and reduce nodes grow and shrink
//! dynamic sub-graphs at runtime. Values are ingested from other threads
//! through a push queue and drained exactly once per cycle.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod context;
mod delta;
mod engine;
mod graph;
/// Single-node test harness for exercising bodies cycle by cycle.
pub mod harness;
mod ident;
mod input;
mod map;
mod node;
mod output;
mod plan;
mod push;
mod reduce;
mod reference;
mod time;
mod value;
mod window;

// Re-exports for stable public API
/// Run-scoped resource registry threaded through evaluation.
pub use context::RunContext;
/// Per-cycle collection deltas and their merge laws.
pub use delta::{DictDelta, DictOp, DictPatch, SetDelta, TsDelta, WindowDelta};
/// The engine, its configuration, and the body-side evaluation context.
pub use engine::{run, Engine, EngineConfig, EngineError, EvalCtx, Mode};
/// The graph arena (read/apply surface used by harnesses and tools).
pub use graph::Graph;
/// Arena ids and scheduler tags.
pub use ident::{InputId, NodeId, OutputId, SubGraphId, Tag};
/// Input binding errors.
pub use input::BindError;
/// Node behavior trait and node-level errors.
pub use node::{NodeBody, NodeError, ScheduleError};
/// Output apply errors.
pub use output::ApplyError;
/// Graph plans: nodes, inputs, output shapes, validation.
pub use plan::{
    GraphPlan, InputPlan, InputSource, NodeKindPlan, NodePlan, OutputSpec, PlanError,
};
/// Cross-thread ingestion handles.
pub use push::{PushHandle, PushValue, StopHandle};
/// Reduce combine-step signature.
pub use reduce::ReduceOp;
/// Reboundable time-series references.
pub use reference::TsRef;
/// The engine's logical clock.
pub use time::EngineTime;
/// Dynamic values, kinds, and keys.
pub use value::{Key, Kind, Value};
