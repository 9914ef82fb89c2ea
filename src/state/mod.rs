//! # State Tracker
//!
//! Owns the live [`StateTree`], the per-node pending-transaction table and the
//! [`Store`] history. Every validated message goes through one of the `handle_*`
//! entry points:
//!
//! - `publish` resolves the sender's pending transaction as success, then updates the tree.
//! - `set` (outgoing) is enqueued, applied speculatively and rolled back if the node
//!   answers with an error.
//! - `request` (outgoing) is only enqueued.
//! - `err` resolves the pending transaction of its sender, or of the last addressed
//!   node when the error carries no `from`, as failure.
//!
//! At most one transaction is pending per node. Enqueueing a new one resolves the
//! previous one as success first, and an unanswered transaction resolves as success
//! when its timer fires.
//!
//! Subscribers registered with [`StateTracker::subscribe_changes`] are called in
//! registration order with the minimal [`ChangeSet`] after every update, and again with
//! `error = true` when a speculative update is rolled back.

pub mod changeset;
pub mod tree;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::errors::{ProtocolError, StoreError};
use crate::metrics;
use crate::protocol::{
    value_list, Message, MessageType, Scalar, ENVELOPE_FIELDS, FIELD_COUNT, FIELD_DATA_TYPE,
    FIELD_SERVICE_ID, SERVICE_MANAGER_ID,
};
use crate::storage::{RecordRef, RecordValue, Store};
use crate::timers::{TimerEvent, TimerId, Timers};

use changeset::{ChangePath, ChangeSet};
use tree::{ChannelCounts, Node, Service, StateTree};

pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(20);

pub type ChangeHandler = Box<dyn FnMut(&ChangeSet, bool)>;

/// Completion callback of an enqueued message: `(original, outcome, error reply)`.
pub type TransactionCallback = Box<dyn FnOnce(&Message, Outcome, Option<&Message>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NoError,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Result of applying one message to the tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub changes: ChangeSet,
    pub records: Vec<RecordRef>,
}

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub transaction_timeout: Duration,
    /// Treat a reply that fails validation as an error reply.
    pub invalid_reply_is_failure: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            invalid_reply_is_failure: true,
        }
    }
}

struct PendingTransaction {
    message: Message,
    kind: MessageType,
    callback: Option<TransactionCallback>,
    /// Node state before the message was applied, `None` if the node was new.
    snapshot: Option<Node>,
    changes: ChangeSet,
    records: Vec<RecordRef>,
    timer: TimerId,
}

pub struct StateTracker {
    tree: StateTree,
    store: Store,
    pending: HashMap<u8, PendingTransaction>,
    subscribers: Vec<(SubscriberId, ChangeHandler)>,
    next_subscriber: u64,
    last_addressed: Option<u8>,
    options: TrackerOptions,
}

/// Split a service description into per-type channel counts.
///
/// `count` is optional: a missing first element means every type is published, a
/// missing second element means the remaining types are accepted.
pub fn describe(types: &[String], counts: &[u32]) -> BTreeMap<String, ChannelCounts> {
    let published = counts.first().copied().unwrap_or(types.len() as u32) as usize;
    let accepted = counts
        .get(1)
        .copied()
        .map(|c| c as usize)
        .unwrap_or(types.len().saturating_sub(published));

    let mut out: BTreeMap<String, ChannelCounts> = BTreeMap::new();
    for (num, data_type) in types.iter().enumerate().take(published + accepted) {
        let entry = out.entry(data_type.to_ascii_lowercase()).or_default();
        if num < published {
            entry.publish += 1;
        } else {
            entry.accept += 1;
        }
    }
    out
}

fn is_value_field(field: &str, has_description: bool) -> bool {
    if ENVELOPE_FIELDS.contains(&field) || field == FIELD_SERVICE_ID {
        return false;
    }
    if has_description && (field == FIELD_DATA_TYPE || field == FIELD_COUNT) {
        return false;
    }
    true
}

impl StateTracker {
    pub fn new(store: Store, options: TrackerOptions) -> Self {
        Self {
            tree: StateTree::new(),
            store,
            pending: HashMap::new(),
            subscribers: Vec::new(),
            next_subscriber: 0,
            last_addressed: None,
            options,
        }
    }

    /// Rebuild the in-memory tree from the store.
    pub fn load(&mut self) -> Result<(), StoreError> {
        self.tree = self.store.get_tree_current()?;
        info!("Loaded state of {} nodes", self.tree.len());
        Ok(())
    }

    pub fn close(mut self) -> Result<(), StoreError> {
        if !self.pending.is_empty() {
            warn!(
                "Closing with {} unresolved transactions",
                self.pending.len()
            );
        }
        self.store.discard_staged();
        self.store.close()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn options(&self) -> &TrackerOptions {
        &self.options
    }

    pub fn subscribe_changes(&mut self, handler: ChangeHandler) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        self.subscribers.push((id, handler));
        id
    }

    pub fn unsubscribe_changes(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    fn notify(&mut self, changes: &ChangeSet, error: bool) {
        debug!("Changes{}: {}", if error { " (reverted)" } else { "" }, changes);
        for (_, handler) in self.subscribers.iter_mut() {
            handler(changes, error);
        }
    }

    pub fn state_tree(&self) -> &StateTree {
        &self.tree
    }

    pub fn state_at(&self, at: DateTime<Utc>) -> Result<StateTree, StoreError> {
        self.store.get_tree_at_timestamp(Some(at))
    }

    /// Base the node was last heard through, for routing outgoing messages.
    pub fn get_base_for_addr(&self, addr: u8) -> Option<&str> {
        self.tree.node(addr).and_then(|n| n.base.as_deref())
    }

    /// True while no transaction is outstanding for `addr`.
    pub fn queue_empty(&self, addr: u8) -> bool {
        !self.pending.contains_key(&addr)
    }

    pub fn last_addressed(&self) -> Option<u8> {
        self.last_addressed
    }

    /// Check a publish against the counts its service declared. Unknown nodes and
    /// services are accepted since they may be in the middle of discovery.
    pub fn validate_incoming_publish(&self, msg: &Message) -> Result<(), ProtocolError> {
        let addr = msg
            .from_addr()
            .ok_or(ProtocolError::MissingAddress("from"))?;
        let Some(main_id) = msg.main_service_id() else {
            return Ok(());
        };
        let Some(service) = self.tree.service(addr, main_id) else {
            return Ok(());
        };
        let has_description = msg.contains(FIELD_DATA_TYPE);

        for (field, value) in msg.iter() {
            if !is_value_field(field, has_description) {
                continue;
            }
            let Some(counts) = service.counts.get(field) else {
                continue;
            };
            let given = value_list(value).len();
            if given > counts.publish as usize {
                return Err(ProtocolError::TooManyPublished {
                    field: field.to_string(),
                    given,
                    declared: counts.publish,
                });
            }
        }
        Ok(())
    }

    /// Check a set against what the destination service declared it accepts.
    pub fn validate_outgoing_set(&self, msg: &Message) -> Result<(), ProtocolError> {
        let addr = msg.to_addr().ok_or(ProtocolError::MissingAddress("to"))?;
        let node = self
            .tree
            .node(addr)
            .ok_or(ProtocolError::UnknownNode(addr))?;
        let main_id = msg
            .main_service_id()
            .ok_or(ProtocolError::UnknownService(0))?;
        let service = node
            .service(main_id)
            .ok_or(ProtocolError::UnknownService(main_id))?;
        if main_id == SERVICE_MANAGER_ID {
            return Err(ProtocolError::ReadOnlyService);
        }

        for (field, value) in msg.iter() {
            if !is_value_field(field, false) {
                continue;
            }
            let declared = service
                .accept_count(field)
                .ok_or_else(|| ProtocolError::UndeclaredType(field.to_string()))?;
            let given = value_list(value).len();
            if given > declared as usize {
                return Err(ProtocolError::TooManyAccepted {
                    field: field.to_string(),
                    given,
                    declared,
                });
            }
        }
        Ok(())
    }

    /// Apply a publish or set to the tree, persist every change and notify subscribers.
    ///
    /// All writes are committed together. If anything fails the node is restored to
    /// its state before the call and nothing is persisted.
    pub fn update_state(
        &mut self,
        ts: DateTime<Utc>,
        msg: &Message,
        addr: u8,
        base: Option<&str>,
        is_set: bool,
    ) -> Result<StateUpdate, StoreError> {
        let snapshot = self.tree.node(addr).cloned();

        let applied = self
            .apply_message(ts, msg, addr, base, is_set)
            .and_then(|update| self.store.commit().map(|_| update));
        let (paths, records) = match applied {
            Ok(update) => update,
            Err(e) => {
                self.store.discard_staged();
                self.restore_node(addr, snapshot);
                return Err(e);
            }
        };

        let changes = ChangeSet::minimal(paths);
        if !changes.is_empty() {
            self.notify(&changes, false);
        }
        Ok(StateUpdate { changes, records })
    }

    fn restore_node(&mut self, addr: u8, snapshot: Option<Node>) {
        match snapshot {
            Some(node) => self.tree.insert_node(node),
            None => {
                self.tree.remove_node(addr);
            }
        }
    }

    fn apply_message(
        &mut self,
        ts: DateTime<Utc>,
        msg: &Message,
        addr: u8,
        base: Option<&str>,
        is_set: bool,
    ) -> Result<(Vec<ChangePath>, Vec<RecordRef>), StoreError> {
        let mut paths = Vec::new();
        let mut records = Vec::new();
        let store = &mut self.store;

        let mut node_dirty = false;
        if self.tree.node(addr).is_none() {
            debug!("New node {}", addr);
            self.tree.insert_node(Node::new(addr));
            paths.push(ChangePath::Node(addr));
            node_dirty = true;
        }
        let Some(node) = self.tree.node_mut(addr) else {
            return Ok((paths, records));
        };
        if let Some(base) = base {
            if node.base.as_deref() != Some(base) {
                node.base = Some(base.to_string());
                paths.push(ChangePath::Node(addr));
                node_dirty = true;
            }
        }

        let mut service_ids = msg.service_ids();
        if service_ids.is_empty() {
            warn!("Message for node {} names no service", addr);
            return Ok((paths, records));
        }
        let main_id = service_ids.remove(0);

        let mut service_dirty = false;
        if !node.services.contains_key(&main_id) {
            node.services.insert(main_id, Service::new(main_id));
            paths.push(ChangePath::Service(addr, main_id));
            service_dirty = true;
        }
        let mut node_discovered = node.discovered;
        let Some(service) = node.services.get_mut(&main_id) else {
            return Ok((paths, records));
        };

        let has_description = msg.contains(FIELD_DATA_TYPE);
        if has_description {
            let types: Vec<String> = msg
                .value_list(FIELD_DATA_TYPE)
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            let counts: Vec<u32> = msg
                .value_list(FIELD_COUNT)
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.as_u64().map(|c| c as u32))
                .collect();

            for (data_type, declared) in describe(&types, &counts) {
                if service.counts.get(&data_type) == Some(&declared) {
                    continue;
                }
                let path = ChangePath::DataType(addr, main_id, data_type.clone());
                records.push(store.save_value(ts, &path, RecordValue::Counts(declared))?);
                service.counts.insert(data_type, declared);
                paths.push(path);
            }
            if !service.discovered {
                service.discovered = true;
                service_dirty = true;
                paths.push(ChangePath::Service(addr, main_id));
            }
        }

        let mut fields: Vec<(String, Vec<Value>)> = msg
            .iter()
            .filter(|(field, _)| is_value_field(field, has_description))
            .map(|(field, value)| (field.to_string(), value_list(value)))
            .collect();

        if is_set && fields.is_empty() && service_ids.is_empty() {
            if let Some((data_type, slot)) = service.toggle_target() {
                let current = service.value(data_type, slot).and_then(Scalar::as_bool);
                let next = !current.unwrap_or(false);
                debug!(
                    "Toggling node {} service {} '{}' to {}",
                    addr, main_id, data_type, next
                );
                fields.push((data_type.to_string(), vec![Value::Bool(next)]));
            }
        }
        if !service_ids.is_empty() {
            let aux = service_ids.iter().map(|id| Value::from(*id)).collect();
            fields.push((FIELD_SERVICE_ID.to_string(), aux));
        }

        for (field, values) in fields {
            let offset = if is_set {
                service.publish_count(&field) as usize
            } else {
                0
            };
            if !service.values.contains_key(&field) {
                paths.push(ChangePath::DataType(addr, main_id, field.clone()));
            }
            for (num, value) in values.iter().enumerate() {
                let pos = offset + num;
                let scalar = Scalar::from_json_lossy(value);
                if !service.set_value(&field, pos, scalar.clone()) {
                    continue;
                }
                let path = ChangePath::Channel(addr, main_id, field.clone(), pos as u32);
                records.push(store.save_value(ts, &path, RecordValue::Channel(scalar))?);
                paths.push(path);
            }
        }

        if service_dirty {
            let path = ChangePath::Service(addr, main_id);
            let value = RecordValue::Service {
                discovered: service.discovered,
            };
            records.push(store.save_value(ts, &path, value)?);
        }

        // A service manager publish doubles as the node description
        if main_id == SERVICE_MANAGER_ID && !is_set && !node_discovered {
            node_discovered = true;
            paths.push(ChangePath::Node(addr));
            node_dirty = true;
        }
        node.discovered = node_discovered;

        if node_dirty {
            let value = RecordValue::Node {
                discovered: node.discovered,
                base: node.base.clone(),
            };
            records.push(store.save_value(ts, &ChangePath::Node(addr), value)?);
        }

        Ok((paths, records))
    }

    /// Record an outgoing request or set as the node's pending transaction.
    fn enqueue(
        &mut self,
        msg: Message,
        kind: MessageType,
        callback: Option<TransactionCallback>,
        timers: &mut Timers<TimerEvent>,
        now: Instant,
    ) -> Option<u8> {
        let Some(addr) = msg.to_addr() else {
            warn!("Not tracking message without destination: {}", msg);
            return None;
        };

        // No error so far means the previous operation went through
        if self.pending.contains_key(&addr) {
            self.queued_success(addr, timers);
        }

        let timer = timers.call_later(
            self.options.transaction_timeout,
            TimerEvent::TransactionTimeout { addr },
            now,
        );
        self.pending.insert(
            addr,
            PendingTransaction {
                message: msg,
                kind,
                callback,
                snapshot: self.tree.node(addr).cloned(),
                changes: ChangeSet::default(),
                records: Vec::new(),
                timer,
            },
        );
        self.last_addressed = Some(addr);
        metrics::inc_transactions_started();
        Some(addr)
    }

    /// Resolve the node's pending transaction as success. Returns false if none was
    /// pending.
    pub fn queued_success(&mut self, addr: u8, timers: &mut Timers<TimerEvent>) -> bool {
        let Some(tx) = self.pending.remove(&addr) else {
            return false;
        };
        timers.cancel(tx.timer);
        metrics::inc_transactions_succeeded();
        debug!("Transaction for node {} succeeded", addr);
        if let Some(callback) = tx.callback {
            callback(&tx.message, Outcome::NoError, None);
        }
        true
    }

    /// Resolve the node's pending transaction as failure, undoing a speculative set.
    ///
    /// The set's rows are voided first and the tree is only rolled back once that
    /// commit succeeded. The transaction is resolved either way.
    pub fn queued_failure(
        &mut self,
        addr: u8,
        error: Option<&Message>,
        timers: &mut Timers<TimerEvent>,
    ) -> Result<bool, StoreError> {
        let Some(tx) = self.pending.remove(&addr) else {
            return Ok(false);
        };
        timers.cancel(tx.timer);
        metrics::inc_transactions_failed();
        info!("Transaction for node {} failed: {}", addr, tx.message);

        let mut result = Ok(true);
        if tx.kind == MessageType::Set {
            for record in &tx.records {
                self.store.mark_saved_value_failure(record);
            }
            match self.store.commit() {
                Ok(()) => {
                    self.restore_node(addr, tx.snapshot);
                    if !tx.changes.is_empty() {
                        self.notify(&tx.changes, true);
                    }
                }
                Err(e) => {
                    self.store.discard_staged();
                    error!("Could not void set rows for node {}: {}", addr, e);
                    result = Err(e);
                }
            }
        }

        if let Some(callback) = tx.callback {
            callback(&tx.message, Outcome::Error, error);
        }
        result
    }

    /// Timer expiry for `addr`. Stale timer ids (transaction already replaced) are
    /// ignored.
    pub fn handle_transaction_timeout(
        &mut self,
        addr: u8,
        id: TimerId,
        timers: &mut Timers<TimerEvent>,
    ) -> bool {
        if self.pending.get(&addr).map(|tx| tx.timer) != Some(id) {
            return false;
        }
        debug!("No reply from node {}, assuming success", addr);
        metrics::inc_transactions_timed_out();
        self.queued_success(addr, timers)
    }

    /// Resolve every outstanding transaction as success.
    pub fn resolve_all_pending(&mut self, timers: &mut Timers<TimerEvent>) {
        let addrs: Vec<u8> = self.pending.keys().copied().collect();
        for addr in addrs {
            self.queued_success(addr, timers);
        }
    }

    pub fn handle_publish(
        &mut self,
        ts: DateTime<Utc>,
        msg: &Message,
        base: Option<&str>,
        timers: &mut Timers<TimerEvent>,
    ) -> Result<StateUpdate, StoreError> {
        let Some(addr) = msg.from_addr() else {
            warn!("Dropping publish without source: {}", msg);
            return Ok(StateUpdate::default());
        };
        self.queued_success(addr, timers);
        self.update_state(ts, msg, addr, base, false)
    }

    /// A node (or its Base) reported an error for the last message sent to it.
    pub fn handle_error(
        &mut self,
        msg: &Message,
        timers: &mut Timers<TimerEvent>,
    ) -> Result<bool, StoreError> {
        let Some(addr) = msg.from_addr().or(self.last_addressed) else {
            debug!("Error with no transaction to blame: {}", msg);
            return Ok(false);
        };
        self.queued_failure(addr, Some(msg), timers)
    }

    pub fn handle_request(
        &mut self,
        msg: Message,
        callback: Option<TransactionCallback>,
        timers: &mut Timers<TimerEvent>,
        now: Instant,
    ) {
        self.enqueue(msg, MessageType::Request, callback, timers, now);
    }

    /// Enqueue an outgoing set and apply it speculatively.
    pub fn handle_set(
        &mut self,
        ts: DateTime<Utc>,
        msg: Message,
        callback: Option<TransactionCallback>,
        timers: &mut Timers<TimerEvent>,
        now: Instant,
    ) -> Result<StateUpdate, StoreError> {
        let Some(addr) = self.enqueue(msg.clone(), MessageType::Set, callback, timers, now)
        else {
            return Ok(StateUpdate::default());
        };
        let update = match self.update_state(ts, &msg, addr, None, true) {
            Ok(update) => update,
            Err(e) => {
                // Nothing was applied, so there is nothing left to track
                if let Some(tx) = self.pending.remove(&addr) {
                    timers.cancel(tx.timer);
                    metrics::inc_transactions_failed();
                    if let Some(callback) = tx.callback {
                        callback(&tx.message, Outcome::Error, None);
                    }
                }
                return Err(e);
            }
        };
        if let Some(tx) = self.pending.get_mut(&addr) {
            tx.changes = update.changes.clone();
            tx.records = update.records.clone();
        }
        Ok(update)
    }

    /// A set one node sent to another, seen on the air. Updates the destination's
    /// consumer channels without any transaction tracking.
    pub fn handle_incoming_set(
        &mut self,
        ts: DateTime<Utc>,
        msg: &Message,
    ) -> Result<StateUpdate, StoreError> {
        let Some(addr) = msg.to_addr() else {
            return Ok(StateUpdate::default());
        };
        self.update_state(ts, msg, addr, None, true)
    }

    /// A reply that parsed but failed validation. Optionally treated as an error
    /// reply for the node it came from, or for the last addressed node.
    pub fn handle_invalid_incoming(
        &mut self,
        msg: &Message,
        timers: &mut Timers<TimerEvent>,
    ) -> Result<bool, StoreError> {
        if !self.options.invalid_reply_is_failure {
            return Ok(false);
        }
        let addr = msg.from_addr().or(self.last_addressed);
        match addr {
            Some(addr) if !self.queue_empty(addr) => self.queued_failure(addr, Some(msg), timers),
            _ => Ok(false),
        }
    }

    /// An outgoing message that failed validation is still sent but not tracked; the
    /// destination's previous transaction is resolved as success.
    pub fn handle_invalid_outgoing(&mut self, msg: &Message, timers: &mut Timers<TimerEvent>) {
        if let Some(addr) = msg.to_addr() {
            self.queued_success(addr, timers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreBuilder;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::tempdir;

    fn tracker() -> (tempfile::TempDir, StateTracker) {
        let dir = tempdir().unwrap();
        let store = StoreBuilder::new(dir.path().join("db")).open().unwrap();
        (dir, StateTracker::new(store, TrackerOptions::default()))
    }

    fn msg(raw: &str) -> Message {
        Message::from_json_str(raw).unwrap()
    }

    #[test]
    fn description_counts_split_types() {
        let types: Vec<String> = ["switch", "temperature", "switch", "switch"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = describe(&types, &[2]);
        assert_eq!(
            out["switch"],
            ChannelCounts {
                publish: 1,
                accept: 2
            }
        );
        assert_eq!(
            out["temperature"],
            ChannelCounts {
                publish: 1,
                accept: 0
            }
        );
        assert_eq!(describe(&types, &[])["switch"].publish, 3);
        // Types beyond both counts are ignored
        assert!(!describe(&types, &[0, 1]).contains_key("temperature"));
    }

    #[test]
    fn first_publish_creates_node_and_service() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let update = t
            .handle_publish(
                Utc::now(),
                &msg(r#"{"from": 5, "type": "publish", "serviceId": 2, "temperature": 21.5}"#),
                Some("attic"),
                &mut timers,
            )
            .unwrap();
        assert_eq!(
            update.changes.iter().cloned().collect::<Vec<_>>(),
            vec![ChangePath::Node(5)]
        );
        assert_eq!(t.get_base_for_addr(5), Some("attic"));
        assert_eq!(
            t.state_tree().service(5, 2).unwrap().values("temperature"),
            &[Scalar::Float(21.5)]
        );
        // Node, service and one channel row
        assert_eq!(update.records.len(), 3);
    }

    #[test]
    fn unchanged_values_produce_no_changes() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let publish = msg(r#"{"from": 5, "serviceId": 2, "temperature": [21, 22]}"#);
        t.handle_publish(Utc::now(), &publish, None, &mut timers)
            .unwrap();
        let again = t
            .handle_publish(
                Utc::now(),
                &msg(r#"{"from": 5, "serviceId": 2, "temperature": [21, 23]}"#),
                None,
                &mut timers,
            )
            .unwrap();
        assert_eq!(
            again.changes.iter().cloned().collect::<Vec<_>>(),
            vec![ChangePath::Channel(5, 2, "temperature".into(), 1)]
        );
        assert_eq!(again.records.len(), 1);
    }

    #[test]
    fn subscribers_are_called_in_order() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            t.subscribe_changes(Box::new(move |_: &ChangeSet, error: bool| {
                seen.borrow_mut().push((tag, error));
            }));
        }
        let third = {
            let seen = seen.clone();
            t.subscribe_changes(Box::new(move |_: &ChangeSet, _: bool| {
                seen.borrow_mut().push(("third", false))
            }))
        };
        assert!(t.unsubscribe_changes(third));
        assert!(!t.unsubscribe_changes(third));

        t.handle_publish(
            Utc::now(),
            &msg(r#"{"from": 1, "serviceId": 1, "switch": true}"#),
            None,
            &mut timers,
        )
        .unwrap();
        assert_eq!(*seen.borrow(), vec![("first", false), ("second", false)]);
    }

    #[test]
    fn stateful_publish_validation_uses_declared_counts() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        t.handle_publish(
            Utc::now(),
            &msg(r#"{"from": 5, "serviceId": 2, "dataType": ["switch", "switch"], "count": [1, 1]}"#),
            None,
            &mut timers,
        )
        .unwrap();
        assert!(t
            .validate_incoming_publish(&msg(r#"{"from": 5, "serviceId": 2, "switch": true}"#))
            .is_ok());
        assert!(matches!(
            t.validate_incoming_publish(&msg(
                r#"{"from": 5, "serviceId": 2, "switch": [true, false]}"#
            )),
            Err(ProtocolError::TooManyPublished { .. })
        ));
        // Unknown service: nothing to check against yet
        assert!(t
            .validate_incoming_publish(&msg(r#"{"from": 5, "serviceId": 7, "switch": [1, 2]}"#))
            .is_ok());
    }

    #[test]
    fn stateful_set_validation() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        assert_eq!(
            t.validate_outgoing_set(&msg(r#"{"to": 5, "serviceId": 2, "switch": true}"#)),
            Err(ProtocolError::UnknownNode(5))
        );
        t.handle_publish(
            Utc::now(),
            &msg(r#"{"from": 5, "serviceId": 2, "dataType": ["switch"], "count": [0, 1]}"#),
            None,
            &mut timers,
        )
        .unwrap();
        t.handle_publish(
            Utc::now(),
            &msg(r#"{"from": 5, "serviceId": [0, 2]}"#),
            None,
            &mut timers,
        )
        .unwrap();

        assert!(t
            .validate_outgoing_set(&msg(r#"{"to": 5, "serviceId": 2, "switch": true}"#))
            .is_ok());
        assert_eq!(
            t.validate_outgoing_set(&msg(r#"{"to": 5, "serviceId": 3, "switch": true}"#)),
            Err(ProtocolError::UnknownService(3))
        );
        assert_eq!(
            t.validate_outgoing_set(&msg(r#"{"to": 5, "serviceId": 0, "switch": true}"#)),
            Err(ProtocolError::ReadOnlyService)
        );
        assert_eq!(
            t.validate_outgoing_set(&msg(r#"{"to": 5, "serviceId": 2, "power": 1}"#)),
            Err(ProtocolError::UndeclaredType("power".into()))
        );
        assert!(matches!(
            t.validate_outgoing_set(&msg(r#"{"to": 5, "serviceId": 2, "switch": [true, true]}"#)),
            Err(ProtocolError::TooManyAccepted { .. })
        ));
    }

    #[test]
    fn service_manager_publish_discovers_node() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let update = t
            .handle_publish(
                Utc::now(),
                &msg(r#"{"from": 9, "serviceId": [0, 1, 4]}"#),
                None,
                &mut timers,
            )
            .unwrap();
        let node = t.state_tree().node(9).unwrap();
        assert!(node.discovered);
        assert_eq!(node.listed_services(), vec![1, 4]);
        assert!(update.changes.contains(&ChangePath::Node(9)));

        // Reconstruction from the store agrees with memory
        assert_eq!(t.store().get_tree_current().unwrap(), *t.state_tree());
    }

    #[test]
    fn set_writes_consumer_slots_after_published_ones() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let now = Instant::now();
        t.handle_publish(
            Utc::now(),
            &msg(r#"{"from": 3, "serviceId": 1, "dataType": ["switch", "switch"], "count": [1, 1], "switch": false}"#),
            None,
            &mut timers,
        )
        .unwrap();
        let update = t
            .handle_set(
                Utc::now(),
                msg(r#"{"to": 3, "type": "set", "serviceId": 1, "switch": true}"#),
                None,
                &mut timers,
                now,
            )
            .unwrap();
        assert_eq!(
            t.state_tree().service(3, 1).unwrap().values("switch"),
            &[Scalar::Bool(false), Scalar::Bool(true)]
        );
        assert!(update
            .changes
            .contains(&ChangePath::Channel(3, 1, "switch".into(), 1)));
        assert!(!t.queue_empty(3));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn second_enqueue_resolves_the_first_as_success() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let now = Instant::now();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        for n in 0..2 {
            let outcomes = outcomes.clone();
            t.handle_request(
                msg(r#"{"to": 8, "type": "request", "serviceId": 0}"#),
                Some(Box::new(move |_: &Message, outcome: Outcome, _: Option<&Message>| {
                    outcomes.borrow_mut().push((n, outcome))
                })),
                &mut timers,
                now,
            );
        }
        assert_eq!(*outcomes.borrow(), vec![(0, Outcome::NoError)]);
        assert!(!t.queue_empty(8));
        assert_eq!(timers.len(), 1);

        t.queued_success(8, &mut timers);
        assert!(t.queue_empty(8));
        assert_eq!(outcomes.borrow().len(), 2);
        assert!(!t.queued_success(8, &mut timers));
    }

    #[test]
    fn stale_timer_ids_are_ignored() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let now = Instant::now();
        let req = r#"{"to": 4, "type": "request", "serviceId": 0}"#;
        t.handle_request(msg(req), None, &mut timers, now);
        let first: Vec<_> = timers.pop_due(now + Duration::from_secs(30));
        let (old_id, _) = first[0].clone();
        t.handle_request(msg(req), None, &mut timers, now);
        assert!(!t.queue_empty(4));

        // The first transaction's timer no longer matches the pending one
        assert!(!t.handle_transaction_timeout(4, old_id, &mut timers));
        assert!(!t.queue_empty(4));
    }

    #[test]
    fn error_without_source_blames_last_addressed_node() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let now = Instant::now();
        t.handle_request(
            msg(r#"{"to": 6, "type": "request", "serviceId": 0}"#),
            None,
            &mut timers,
            now,
        );
        assert_eq!(t.last_addressed(), Some(6));
        assert!(t
            .handle_error(&msg(r#"{"error": "xmitError"}"#), &mut timers)
            .unwrap());
        assert!(t.queue_empty(6));
        assert!(timers.is_empty());
    }

    #[test]
    fn failed_set_on_new_node_removes_it() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let now = Instant::now();
        t.handle_set(
            Utc::now(),
            msg(r#"{"to": 11, "type": "set", "serviceId": 1, "switch": true}"#),
            None,
            &mut timers,
            now,
        )
        .unwrap();
        assert!(t.state_tree().node(11).is_some());

        t.handle_error(&msg(r#"{"from": 11, "type": "err"}"#), &mut timers)
            .unwrap();
        assert!(t.state_tree().node(11).is_none());
        assert!(t.store().get_tree_current().unwrap().node(11).is_none());
    }

    #[test]
    fn failed_void_keeps_set_values_in_memory() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let now = Instant::now();
        let path = ChangePath::Channel(11, 1, "switch".into(), 0);
        t.handle_set(
            Utc::now(),
            msg(r#"{"to": 11, "type": "set", "serviceId": 1, "switch": true}"#),
            None,
            &mut timers,
            now,
        )
        .unwrap();

        t.store_mut().fail_next_commit();
        assert!(t
            .handle_error(&msg(r#"{"from": 11, "type": "err"}"#), &mut timers)
            .is_err());

        assert!(t.queue_empty(11));
        assert_eq!(
            t.state_tree().service(11, 1).unwrap().value("switch", 0),
            Some(&Scalar::Bool(true))
        );
        assert_eq!(
            t.store().get_value_current(&path).unwrap(),
            Some(RecordValue::Channel(Scalar::Bool(true)))
        );
    }

    #[test]
    fn unpersisted_set_is_not_left_pending() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let now = Instant::now();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let seen = outcomes.clone();

        t.store_mut().fail_next_commit();
        let result = t.handle_set(
            Utc::now(),
            msg(r#"{"to": 11, "type": "set", "serviceId": 1, "switch": true}"#),
            Some(Box::new(move |_: &Message, outcome: Outcome, _: Option<&Message>| {
                seen.borrow_mut().push(outcome);
            })),
            &mut timers,
            now,
        );

        assert!(result.is_err());
        assert!(t.queue_empty(11));
        assert!(t.state_tree().node(11).is_none());
        assert_eq!(*outcomes.borrow(), vec![Outcome::Error]);
        assert!(timers.is_empty());
    }

    #[test]
    fn invalid_replies_fail_the_pending_transaction_when_configured() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        let now = Instant::now();
        let req = r#"{"to": 2, "type": "request", "serviceId": 0}"#;

        let bogus = msg(r#"{"type": "reboot"}"#);

        t.handle_request(msg(req), None, &mut timers, now);
        assert!(t.handle_invalid_incoming(&bogus, &mut timers).unwrap());
        assert!(t.queue_empty(2));

        t.options.invalid_reply_is_failure = false;
        t.handle_request(msg(req), None, &mut timers, now);
        assert!(!t.handle_invalid_incoming(&bogus, &mut timers).unwrap());
        assert!(!t.queue_empty(2));

        t.handle_invalid_outgoing(&msg(r#"{"to": 2, "serviceId": 9}"#), &mut timers);
        assert!(t.queue_empty(2));
    }

    #[test]
    fn incoming_set_updates_destination_consumer_channels() {
        let (_dir, mut t) = tracker();
        let mut timers = Timers::new();
        t.handle_publish(
            Utc::now(),
            &msg(r#"{"from": 7, "serviceId": 3, "dataType": ["switch", "switch"], "count": [1, 1]}"#),
            None,
            &mut timers,
        )
        .unwrap();
        t.handle_incoming_set(
            Utc::now(),
            &msg(r#"{"from": 1, "to": 7, "type": "set", "serviceId": 3, "switch": true}"#),
        )
        .unwrap();
        assert_eq!(
            t.state_tree().service(7, 3).unwrap().values("switch"),
            &[Scalar::Null, Scalar::Bool(true)]
        );
        assert!(t.queue_empty(7));
    }
}
