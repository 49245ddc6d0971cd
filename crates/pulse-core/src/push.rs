// SPDX-License-Identifier: Apache-2.0

//! Cross-thread ingestion into push nodes.
//!
//! Producer threads push values through cloneable handles into one shared
//! queue; the engine drains the queue exactly once per cycle and applies
//! each message to the target push node's output during that node's turn.
//! A value arriving for an output already written this cycle is carried
//! over to the next cycle, so no push is ever dropped and no output is
//! written twice at one time.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::delta::{DictPatch, SetDelta};
use crate::ident::NodeId;
use crate::value::Value;

/// A value pushed from outside the engine thread.
#[derive(Debug, Clone)]
pub enum PushValue {
    /// Direct value for a scalar, list, or window output.
    Value(Value),
    /// Keyed patch for a dictionary output.
    Dict(DictPatch),
    /// Membership delta for a set output.
    Set(SetDelta),
}

/// One queued ingestion message.
#[derive(Debug, Clone)]
pub(crate) struct PushMsg {
    pub node: NodeId,
    pub value: PushValue,
}

#[derive(Debug, Default)]
struct QueueInner {
    queue: VecDeque<PushMsg>,
    stopped: bool,
}

/// The shared ingestion queue: one per engine, any number of producers.
#[derive(Debug, Default)]
pub(crate) struct PushQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl PushQueue {
    pub(crate) fn push(&self, msg: PushMsg) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.stopped {
            // Late pushes after stop are dropped; the run is already ending.
            return;
        }
        inner.queue.push_back(msg);
        drop(inner);
        self.cond.notify_one();
    }

    /// Requests a graceful stop and wakes the engine if it is waiting.
    pub(crate) fn stop(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.stopped = true;
        }
        self.cond.notify_all();
    }

    /// Takes everything queued so far, in arrival order, plus the stop flag.
    pub(crate) fn drain(&self) -> (Vec<PushMsg>, bool) {
        self.inner.lock().map_or_else(
            |_| (Vec::new(), true),
            |mut inner| (inner.queue.drain(..).collect(), inner.stopped),
        )
    }

    /// True when a stop was requested or producers queued messages.
    pub(crate) fn has_work(&self) -> bool {
        self.inner
            .lock()
            .map_or(true, |inner| inner.stopped || !inner.queue.is_empty())
    }

    /// Blocks until a message or stop arrives, or until `deadline` passes.
    /// Used by real-time runs so idle cycles cost no CPU.
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        loop {
            if inner.stopped || !inner.queue.is_empty() {
                return;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    let timeout = deadline.saturating_duration_since(now);
                    match self.cond.wait_timeout(inner, timeout) {
                        Ok((guard, result)) => {
                            if result.timed_out() {
                                return;
                            }
                            inner = guard;
                        }
                        Err(_) => return,
                    }
                }
                None => match self.cond.wait(inner) {
                    Ok(guard) => inner = guard,
                    Err(_) => return,
                },
            }
        }
    }
}

/// Per-node state of a push node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PushState {
    /// When set, multiple direct values queued for one cycle collapse to the
    /// latest instead of spilling into later cycles.
    pub elide: bool,
}

/// Producer-side handle for one push node. Cloneable and sendable; pushing
/// never blocks beyond the queue lock.
#[derive(Debug, Clone)]
pub struct PushHandle {
    node: NodeId,
    queue: Arc<PushQueue>,
}

impl PushHandle {
    pub(crate) fn new(node: NodeId, queue: Arc<PushQueue>) -> Self {
        PushHandle { node, queue }
    }

    /// Queues a direct value for the push node's output.
    pub fn push(&self, value: Value) {
        self.queue.push(PushMsg {
            node: self.node,
            value: PushValue::Value(value),
        });
    }

    /// Queues a dictionary patch for the push node's output.
    pub fn push_dict(&self, patch: DictPatch) {
        self.queue.push(PushMsg {
            node: self.node,
            value: PushValue::Dict(patch),
        });
    }

    /// Queues a set membership delta for the push node's output.
    pub fn push_set(&self, delta: SetDelta) {
        self.queue.push(PushMsg {
            node: self.node,
            value: PushValue::Set(delta),
        });
    }
}

/// Handle that ends a run from outside the engine thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    queue: Arc<PushQueue>,
}

impl StopHandle {
    pub(crate) fn new(queue: Arc<PushQueue>) -> Self {
        StopHandle { queue }
    }

    /// Requests a graceful stop: the engine finishes the current cycle,
    /// runs node stop hooks in reverse start order, and returns.
    pub fn stop(&self) {
        self.queue.stop();
    }
}

/// Ignore wait deadlines shorter than this; sleeping for a few microseconds
/// costs more than it saves.
pub(crate) const MIN_WAIT: Duration = Duration::from_micros(50);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_arrival_order() {
        let queue = Arc::new(PushQueue::default());
        let handle = PushHandle::new(NodeId(0), Arc::clone(&queue));
        handle.push(Value::Int(1));
        handle.push(Value::Int(2));
        let (msgs, stopped) = queue.drain();
        assert!(!stopped);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(&msgs[0].value, PushValue::Value(Value::Int(1))));
        assert!(matches!(&msgs[1].value, PushValue::Value(Value::Int(2))));
        assert!(queue.drain().0.is_empty(), "drain takes everything");
    }

    #[test]
    fn stop_drops_late_pushes() {
        let queue = Arc::new(PushQueue::default());
        let handle = PushHandle::new(NodeId(0), Arc::clone(&queue));
        StopHandle::new(Arc::clone(&queue)).stop();
        handle.push(Value::Int(1));
        let (msgs, stopped) = queue.drain();
        assert!(stopped);
        assert!(msgs.is_empty());
    }

    #[test]
    fn pushes_cross_threads() {
        let queue = Arc::new(PushQueue::default());
        let handle = PushHandle::new(NodeId(0), Arc::clone(&queue));
        let worker = std::thread::spawn(move || {
            for i in 0..10 {
                handle.push(Value::Int(i));
            }
        });
        worker.join().ok();
        assert_eq!(queue.drain().0.len(), 10);
    }
}
