//! One-shot timers keyed by monotonic deadline.
//!
//! The heap orders handles by deadline, then by priority for deadlines that
//! collide. Cancellation just drops the live record, and stale heap entries
//! are skipped when they surface; this keeps `timer_del` cheap and
//! idempotent.

use crate::Priority;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub(crate) u64);

pub(crate) struct TimerRec<F> {
    pub deadline: Instant,
    pub callback: F,
}

pub(crate) struct TimerWheel<F> {
    /// Min-heap of (deadline, priority rank, handle); rank 0 is High so
    /// same-instant timers fire high priority first.
    heap: BinaryHeap<Reverse<(Instant, u8, u64)>>,
    live: HashMap<u64, TimerRec<F>>,
}

fn rank(p: Priority) -> u8 {
    Priority::High as u8 - p as u8
}

impl<F> TimerWheel<F> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    pub fn add(&mut self, handle: u64, priority: Priority, after: Duration, callback: F) {
        let deadline = Instant::now() + after;
        self.heap.push(Reverse((deadline, rank(priority), handle)));
        self.live.insert(handle, TimerRec { deadline, callback });
    }

    /// Idempotent: deleting an expired or unknown handle reports `false`.
    pub fn del(&mut self, handle: TimerHandle) -> bool {
        self.live.remove(&handle.0).is_some()
    }

    pub fn is_running(&self, handle: TimerHandle) -> bool {
        self.live.contains_key(&handle.0)
    }

    /// Time left before `handle` fires; zero when it is past or gone.
    pub fn remaining(&self, handle: TimerHandle) -> Duration {
        self.live
            .get(&handle.0)
            .map(|rec| rec.deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Deadline of the earliest live timer, skimming cancelled entries off
    /// the top of the heap as a side effect.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, _, handle))) = self.heap.peek().copied() {
            if self.live.contains_key(&handle) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops the earliest expired timer, if any.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(u64, F)> {
        loop {
            let Reverse((deadline, _, handle)) = *self.heap.peek()?;
            if deadline > now {
                return None;
            }
            self.heap.pop();
            // Entries whose record is gone were cancelled; skip them.
            match self.live.remove(&handle) {
                Some(rec) => return Some((handle, rec.callback)),
                None => continue,
            }
        }
    }
}
