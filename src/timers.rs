//! Delayed events for the cooperative event loop.
//!
//! The gateway owns one [`Timers`] queue. Components arm a timer with a typed event
//! and keep the returned [`TimerId`]; the loop sleeps until [`Timers::next_deadline`]
//! and hands every due event back to its owner. Cancelling a timer that already fired
//! (or never existed) is a no-op.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Everything the gateway schedules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// No reply from a node within the transaction timeout: resolve as success.
    TransactionTimeout { addr: u8 },
    DiscoveryRetry,
}

pub struct Timers<E> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    events: HashMap<u64, E>,
    next_seq: u64,
}

impl<E> Default for Timers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Timers<E> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            events: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn call_later(&mut self, delay: Duration, event: E, now: Instant) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((now + delay, seq)));
        self.events.insert(seq, event);
        TimerId(seq)
    }

    /// Returns true when the timer was still armed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        // The heap entry is left behind and skipped lazily
        self.events.remove(&id.0).is_some()
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.events.contains_key(&id.0)
    }

    /// Earliest deadline among armed timers.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if self.events.contains_key(&seq) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every event due at `now`, earliest first. Timers sharing a
    /// deadline come out in the order they were armed.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerId, E)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(event) = self.events.remove(&seq) {
                due.push((TimerId(seq), event));
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
