//! Discovery scheduler
//!
//! Watches state-tracker change notifications for any hint of a node or service whose
//! description we don't have yet, and asks for it. Work items sit in a queue until
//! the node is idle (no pending transaction) and the randomized retry timer fires; at
//! most one request is issued per pass so a busy network is probed gently.
//!
//! * Node discovery requests the service manager: `{"to": N, "type": "request", "serviceId": 0}`.
//! * Service discovery requests its description: `{"to": N, "type": "request", "serviceId": S, "dataType": "dataType"}`.
//!
//! Once a node or service is marked discovered it is left alone unless flagged stale
//! with [`DiscoveryAgent::mark_stale`].

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::protocol::{Message, FIELD_DATA_TYPE, FIELD_SERVICE_ID, FIELD_TO, FIELD_TYPE, SERVICE_MANAGER_ID};
use crate::state::changeset::{ChangePath, ChangeSet};
use crate::state::{StateTracker, SubscriberId};
use crate::timers::{TimerEvent, TimerId, Timers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryTarget {
    Node(u8),
    Service(u8, u8),
}

impl DiscoveryTarget {
    pub fn node(&self) -> u8 {
        match self {
            DiscoveryTarget::Node(n) | DiscoveryTarget::Service(n, _) => *n,
        }
    }

    /// The read request that discovers this target.
    pub fn request(&self) -> Message {
        let msg = Message::new()
            .with(FIELD_TO, self.node())
            .with(FIELD_TYPE, "request");
        match self {
            DiscoveryTarget::Node(_) => msg.with(FIELD_SERVICE_ID, SERVICE_MANAGER_ID),
            DiscoveryTarget::Service(_, s) => msg
                .with(FIELD_SERVICE_ID, *s)
                .with(FIELD_DATA_TYPE, "dataType"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub enabled: bool,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5000),
        }
    }
}

pub struct DiscoveryAgent {
    queue: VecDeque<DiscoveryTarget>,
    stale: HashSet<DiscoveryTarget>,
    timer: Option<TimerId>,
    options: DiscoveryOptions,
    rng: StdRng,
    notify_tx: mpsc::UnboundedSender<ChangeSet>,
    notify_rx: mpsc::UnboundedReceiver<ChangeSet>,
    subscription: Option<SubscriberId>,
}

/// Targets implied by a change-set that still lack a description.
pub fn get_undiscovered(tracker: &StateTracker, changes: &ChangeSet) -> Vec<DiscoveryTarget> {
    let tree = tracker.state_tree();
    let mut out = Vec::new();

    for addr in changes.nodes() {
        // Node may be gone after a rollback
        let Some(node) = tree.node(addr) else {
            continue;
        };
        if !node.discovered {
            out.push(DiscoveryTarget::Node(addr));
        }

        let mut services: BTreeSet<u8> = BTreeSet::new();
        for path in changes.iter().filter(|p| p.node() == addr) {
            match path {
                ChangePath::Node(_) => services.extend(node.services.keys().copied()),
                other => services.extend(other.service()),
            }
        }
        services.extend(node.listed_services());

        for id in services {
            if id == SERVICE_MANAGER_ID {
                continue;
            }
            if !node.service(id).is_some_and(|svc| svc.discovered) {
                out.push(DiscoveryTarget::Service(addr, id));
            }
        }
    }
    out
}

impl DiscoveryAgent {
    pub fn new(options: DiscoveryOptions) -> Self {
        Self::with_rng(options, StdRng::from_entropy())
    }

    /// Deterministic delays, for tests.
    pub fn with_seed(options: DiscoveryOptions, seed: u64) -> Self {
        Self::with_rng(options, StdRng::seed_from_u64(seed))
    }

    fn with_rng(options: DiscoveryOptions, rng: StdRng) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            queue: VecDeque::new(),
            stale: HashSet::new(),
            timer: None,
            options,
            rng,
            notify_tx,
            notify_rx,
            subscription: None,
        }
    }

    /// Start receiving the tracker's change notifications.
    pub fn subscribe(&mut self, tracker: &mut StateTracker) {
        if self.subscription.is_some() {
            return;
        }
        let tx = self.notify_tx.clone();
        let id = tracker.subscribe_changes(Box::new(move |changes: &ChangeSet, _error: bool| {
            let _ = tx.send(changes.clone());
        }));
        self.subscription = Some(id);
    }

    pub fn unsubscribe(&mut self, tracker: &mut StateTracker) {
        if let Some(id) = self.subscription.take() {
            tracker.unsubscribe_changes(id);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn queued(&self) -> impl Iterator<Item = &DiscoveryTarget> {
        self.queue.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn timer(&self) -> Option<TimerId> {
        self.timer
    }

    fn push(&mut self, target: DiscoveryTarget) {
        if !self.queue.contains(&target) {
            trace!("Queueing discovery of {:?}", target);
            self.queue.push_back(target);
        }
    }

    /// Drain change notifications received since the last call and queue whatever
    /// they implicate.
    pub fn process_notifications(
        &mut self,
        tracker: &StateTracker,
        timers: &mut Timers<TimerEvent>,
        now: Instant,
    ) {
        let mut seen = false;
        while let Ok(changes) = self.notify_rx.try_recv() {
            seen = true;
            if !self.options.enabled {
                continue;
            }
            for target in get_undiscovered(tracker, &changes) {
                self.push(target);
            }
        }
        if seen && self.options.enabled && !self.queue.is_empty() {
            self.update(false, tracker, timers, now);
        }
    }

    /// Flag a target for re-discovery even if it was discovered before.
    pub fn mark_stale(
        &mut self,
        target: DiscoveryTarget,
        tracker: &StateTracker,
        timers: &mut Timers<TimerEvent>,
        now: Instant,
    ) {
        self.stale.insert(target);
        self.push(target);
        self.update(false, tracker, timers, now);
    }

    fn still_wanted(&self, tracker: &StateTracker, target: &DiscoveryTarget) -> bool {
        if self.stale.contains(target) {
            return true;
        }
        let tree = tracker.state_tree();
        match target {
            DiscoveryTarget::Node(n) => tree.node(*n).is_some_and(|node| !node.discovered),
            DiscoveryTarget::Service(n, s) => tree
                .node(*n)
                .is_some_and(|node| !node.service(*s).is_some_and(|svc| svc.discovered)),
        }
    }

    /// Walk the queue once. With `run_now`, the first target whose node is idle is
    /// returned as a request to send; everything else stays queued. A retry is
    /// scheduled when some queued target's node is idle.
    pub fn update(
        &mut self,
        run_now: bool,
        tracker: &StateTracker,
        timers: &mut Timers<TimerEvent>,
        now: Instant,
    ) -> Option<Message> {
        let mut request = None;
        let mut fired_node = None;
        let mut retry = false;
        let mut requeue = VecDeque::with_capacity(self.queue.len());

        while let Some(target) = self.queue.pop_front() {
            if !self.still_wanted(tracker, &target) {
                trace!("{:?} no longer needs discovery", target);
                continue;
            }
            let idle = tracker.queue_empty(target.node());
            if run_now && request.is_none() && idle {
                debug!("Discovering {:?}", target);
                request = Some(target.request());
                fired_node = Some(target.node());
                self.stale.remove(&target);
            } else if idle && fired_node != Some(target.node()) {
                retry = true;
            }
            // Stays queued until the node reports it as discovered
            requeue.push_back(target);
        }
        self.queue = requeue;

        if retry {
            self.schedule(timers, now);
        }
        request
    }

    /// (Re-)arm the single retry timer with a random delay in `[min_delay, max_delay)`.
    pub fn schedule(&mut self, timers: &mut Timers<TimerEvent>, now: Instant) -> Duration {
        if let Some(old) = self.timer.take() {
            timers.cancel(old);
        }
        let min = self.options.min_delay.as_millis() as u64;
        let max = self.options.max_delay.as_millis() as u64;
        let delay = if max > min {
            Duration::from_millis(self.rng.gen_range(min..max))
        } else {
            self.options.min_delay
        };
        self.timer = Some(timers.call_later(delay, TimerEvent::DiscoveryRetry, now));
        delay
    }

    /// Called when a `DiscoveryRetry` timer fires. Returns false for a timer this
    /// agent no longer owns.
    pub fn on_retry(&mut self, id: TimerId) -> bool {
        if self.timer == Some(id) {
            self.timer = None;
            true
        } else {
            false
        }
    }
}
