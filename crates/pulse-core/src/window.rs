// SPDX-License-Identifier: Apache-2.0

//! Rolling window buffers backing windowed outputs.
//!
//! Two flavors: a fixed-capacity circular buffer of the last N samples, and
//! a deque bounded by an engine-time duration. Both surface evicted values
//! through a one-cycle `removed` batch that the graph resets from its
//! end-of-cycle cleanup queue, so consumers observe each eviction exactly
//! once.

use std::collections::VecDeque;
use std::time::Duration;

use crate::time::EngineTime;
use crate::value::{Kind, Value};

/// Fixed-capacity rolling buffer of the last `capacity` samples.
#[derive(Debug, Clone)]
pub(crate) struct FixedWindow {
    pub(crate) elem: Kind,
    capacity: usize,
    min_size: usize,
    buf: Vec<Value>,
    times: Vec<EngineTime>,
    head: usize,
    len: usize,
    removed: Vec<Value>,
}

impl FixedWindow {
    pub(crate) fn new(elem: Kind, capacity: usize, min_size: usize) -> Self {
        debug_assert!(capacity >= 1, "window capacity must be at least 1");
        FixedWindow {
            elem,
            capacity: capacity.max(1),
            min_size: min_size.max(1),
            buf: Vec::new(),
            times: Vec::new(),
            head: 0,
            len: 0,
            removed: Vec::new(),
        }
    }

    /// Appends a sample, evicting the oldest when full. The evicted value is
    /// captured into the `removed` batch.
    pub(crate) fn push(&mut self, value: Value, at: EngineTime) {
        if self.len < self.capacity {
            self.buf.push(value);
            self.times.push(at);
            self.len += 1;
        } else {
            let evicted = std::mem::replace(&mut self.buf[self.head], value);
            self.times[self.head] = at;
            self.head = (self.head + 1) % self.capacity;
            self.removed.push(evicted);
        }
    }

    /// The logical (oldest-first) contents, or `None` until `min_size`
    /// samples have been captured.
    pub(crate) fn view(&self) -> Option<Vec<Value>> {
        if self.len < self.min_size {
            return None;
        }
        if self.len < self.capacity {
            // Dense prefix; no rotation has happened yet.
            return Some(self.buf.clone());
        }
        let mut out = Vec::with_capacity(self.capacity);
        for i in 0..self.capacity {
            out.push(self.buf[(self.head + i) % self.capacity].clone());
        }
        Some(out)
    }

    /// Samples captured exactly at `at` (this cycle's appends).
    pub(crate) fn appended(&self, at: EngineTime) -> Vec<Value> {
        (0..self.len)
            .map(|i| self.physical(i))
            .filter(|&p| self.times[p] == at)
            .map(|p| self.buf[p].clone())
            .collect()
    }

    /// Physical buffer index of the i-th oldest sample.
    fn physical(&self, logical: usize) -> usize {
        if self.len < self.capacity {
            logical
        } else {
            (self.head + logical) % self.capacity
        }
    }

    pub(crate) fn removed(&self) -> &[Value] {
        &self.removed
    }

    pub(crate) fn reset_removed(&mut self) {
        self.removed.clear();
    }

    pub(crate) fn has_removed(&self) -> bool {
        !self.removed.is_empty()
    }

    /// Drops all samples. Invalidation, not a roll: nothing is reported
    /// through the `removed` batch.
    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.times.clear();
        self.head = 0;
        self.len = 0;
    }
}

/// Rolling buffer bounded by an engine-time duration.
#[derive(Debug, Clone)]
pub(crate) struct TimeWindow {
    pub(crate) elem: Kind,
    duration: Duration,
    min_window: Duration,
    buf: VecDeque<(Value, EngineTime)>,
    removed: Vec<Value>,
}

impl TimeWindow {
    pub(crate) fn new(elem: Kind, duration: Duration, min_window: Duration) -> Self {
        TimeWindow {
            elem,
            duration,
            min_window,
            buf: VecDeque::new(),
            removed: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, value: Value, at: EngineTime) {
        self.buf.push_back((value, at));
    }

    /// Evicts entries older than `duration` relative to `now`, capturing
    /// them into the `removed` batch. Called lazily, on read.
    pub(crate) fn roll(&mut self, now: EngineTime) {
        let cutoff = now.since(EngineTime::ZERO);
        loop {
            let expired = self
                .buf
                .front()
                .is_some_and(|(_, at)| {
                    cutoff.saturating_sub(at.since(EngineTime::ZERO)) > self.duration
                });
            if !expired {
                break;
            }
            if let Some((value, _)) = self.buf.pop_front() {
                self.removed.push(value);
            }
        }
    }

    /// True once the graph has run at least `min_window` since `start`.
    pub(crate) fn ready(&self, start: EngineTime, now: EngineTime) -> bool {
        now.since(start) >= self.min_window
    }

    /// Samples captured exactly at `at` (this cycle's appends).
    pub(crate) fn appended(&self, at: EngineTime) -> Vec<Value> {
        self.buf
            .iter()
            .filter(|(_, t)| *t == at)
            .map(|(v, _)| v.clone())
            .collect()
    }

    /// The in-window contents (oldest first), filtered against `now` without
    /// mutating eviction state.
    pub(crate) fn view(&self, start: EngineTime, now: EngineTime) -> Option<Vec<Value>> {
        if !self.ready(start, now) {
            return None;
        }
        let cutoff = now.since(EngineTime::ZERO);
        Some(
            self.buf
                .iter()
                .filter(|(_, at)| cutoff.saturating_sub(at.since(EngineTime::ZERO)) <= self.duration)
                .map(|(v, _)| v.clone())
                .collect(),
        )
    }

    pub(crate) fn removed(&self) -> &[Value] {
        &self.removed
    }

    pub(crate) fn reset_removed(&mut self) {
        self.removed.clear();
    }

    pub(crate) fn has_removed(&self) -> bool {
        !self.removed.is_empty()
    }

    /// Drops all samples. Invalidation, not a roll: nothing is reported
    /// through the `removed` batch.
    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Payload of a windowed output.
#[derive(Debug, Clone)]
pub(crate) enum WindowPayload {
    Fixed(FixedWindow),
    Timed(TimeWindow),
}

impl WindowPayload {
    pub(crate) fn elem_kind(&self) -> Kind {
        match self {
            WindowPayload::Fixed(w) => w.elem,
            WindowPayload::Timed(w) => w.elem,
        }
    }

    pub(crate) fn reset_removed(&mut self) {
        match self {
            WindowPayload::Fixed(w) => w.reset_removed(),
            WindowPayload::Timed(w) => w.reset_removed(),
        }
    }

    pub(crate) fn clear(&mut self) {
        match self {
            WindowPayload::Fixed(w) => w.clear(),
            WindowPayload::Timed(w) => w.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: u64) -> EngineTime {
        EngineTime::from_secs(secs)
    }

    #[test]
    fn fixed_window_reports_each_eviction_once() {
        // Capacity 3 fed v1..v5: logical order ends [3,4,5] and the two
        // oldest applies each come out of the removed channel exactly once.
        let mut w = FixedWindow::new(Kind::Int, 3, 1);
        for (i, v) in (1i64..=5).enumerate() {
            w.push(Value::Int(v), t(i as u64 + 1));
        }
        assert_eq!(
            w.view(),
            Some(vec![Value::Int(3), Value::Int(4), Value::Int(5)])
        );
        assert_eq!(w.removed(), &[Value::Int(1), Value::Int(2)]);
        w.reset_removed();
        assert!(!w.has_removed());
    }

    #[test]
    fn fixed_window_gates_on_min_size() {
        let mut w = FixedWindow::new(Kind::Int, 3, 2);
        w.push(Value::Int(1), t(1));
        assert_eq!(w.view(), None, "one sample is below min_size");
        w.push(Value::Int(2), t(2));
        assert_eq!(w.view(), Some(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn time_window_rolls_lazily_on_read() {
        let mut w = TimeWindow::new(Kind::Int, Duration::from_secs(5), Duration::ZERO);
        w.push(Value::Int(1), t(1));
        w.push(Value::Int(2), t(4));
        w.push(Value::Int(3), t(8));
        w.roll(t(8));
        assert_eq!(w.removed(), &[Value::Int(1)], "t=1 is older than 5s at t=8");
        assert_eq!(
            w.view(t(0), t(8)),
            Some(vec![Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn time_window_ready_requires_min_window() {
        let w = TimeWindow::new(Kind::Int, Duration::from_secs(5), Duration::from_secs(10));
        assert!(!w.ready(t(0), t(9)));
        assert!(w.ready(t(0), t(10)));
        assert_eq!(w.view(t(0), t(9)), None);
    }
}
