//! # Gateway Module - the owning context
//!
//! [`Gateway`] ties the pieces together: Base connections, the state tracker and
//! its store, discovery, timers and the console log. All of it is driven from one
//! task; Base connections only hand it [`BaseEvent`]s.
//!
//! Incoming objects go through parse, stateless then stateful validation, the
//! console log and finally the tracker. User commands take the reverse path and are
//! sent to the Base the destination node was last heard through.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::base::{self, BaseEvent, BaseRegistry, Transport};
use crate::config::Config;
use crate::console::ConsoleLog;
use crate::discovery::DiscoveryAgent;
use crate::errors::{CommandError, RejectReason, StoreError, TransportError};
use crate::logutil::escape_line;
use crate::metrics;
use crate::protocol::validate::{validate_incoming, validate_outgoing};
use crate::protocol::{Message, MessageType};
use crate::state::tree::StateTree;
use crate::state::{StateTracker, TransactionCallback};
use crate::storage::{Store, StoreBuilder};
use crate::timers::{TimerEvent, Timers};

const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// What became of a submitted command that was sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Validated and tracked as a pending transaction.
    Tracked,
    /// Sent as asked but not tracked, because it failed validation.
    Untracked(RejectReason),
}

pub struct Gateway {
    config: Config,
    tracker: StateTracker,
    discovery: DiscoveryAgent,
    timers: Timers<TimerEvent>,
    console: ConsoleLog,
    bases: BaseRegistry,
    floorplan: Option<String>,
}

impl Gateway {
    /// Open the configured store and build a gateway around it.
    pub fn open(config: Config) -> Result<Self> {
        if let Some(parent) = Path::new(&config.storage.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow!("Failed to create data directory {}: {}", parent.display(), e)
                })?;
            }
        }
        let store = StoreBuilder::new(&config.storage.db_path)
            .range_limit(config.storage.range_limit)
            .console_history(config.storage.console_history)
            .open()
            .map_err(|e| anyhow!("Failed to open store {}: {}", config.storage.db_path, e))?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Store) -> Self {
        let discovery = DiscoveryAgent::new(config.discovery.options());
        Self::with_parts(config, store, discovery)
    }

    /// Build around an already configured discovery agent (seeded ones in tests).
    pub fn with_parts(config: Config, store: Store, mut discovery: DiscoveryAgent) -> Self {
        let mut tracker = StateTracker::new(store, config.transactions.tracker_options());
        discovery.subscribe(&mut tracker);
        let console = ConsoleLog::new(config.storage.console_lines);
        Self {
            config,
            tracker,
            discovery,
            timers: Timers::new(),
            console,
            bases: BaseRegistry::new(),
            floorplan: None,
        }
    }

    /// Restore tree, console tail and floorplan from the store.
    pub fn load(&mut self) -> Result<(), StoreError> {
        self.tracker.load()?;
        self.console.load(self.tracker.store())?;
        self.floorplan = self.tracker.store().get_floorplan_current()?;
        Ok(())
    }

    /// Resolve what is still pending and flush the store.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.tracker.resolve_all_pending(&mut self.timers);
        self.discovery.unsubscribe(&mut self.tracker);
        self.tracker.close()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut StateTracker {
        &mut self.tracker
    }

    pub fn discovery(&self) -> &DiscoveryAgent {
        &self.discovery
    }

    pub fn console(&self) -> &ConsoleLog {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut ConsoleLog {
        &mut self.console
    }

    pub fn bases(&self) -> &BaseRegistry {
        &self.bases
    }

    pub fn timers(&self) -> &Timers<TimerEvent> {
        &self.timers
    }

    pub fn state_tree(&self) -> &StateTree {
        self.tracker.state_tree()
    }

    pub fn state_at(&self, at: DateTime<Utc>) -> Result<StateTree, StoreError> {
        self.tracker.state_at(at)
    }

    pub fn register_base(
        &mut self,
        name: &str,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Result<(), TransportError> {
        self.bases.register(name, outbound)?;
        info!("Base '{}' online ({} connected)", name, self.bases.len());
        Ok(())
    }

    pub fn unregister_base(&mut self, name: &str) -> bool {
        self.bases.unregister(name)
    }

    pub fn handle_base_event(&mut self, event: BaseEvent, now: Instant) {
        match event {
            BaseEvent::Registered {
                name,
                outbound,
                ack,
            } => {
                let accepted = match self.register_base(&name, outbound) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Rejecting Base: {}", e);
                        false
                    }
                };
                let _ = ack.send(accepted);
            }
            BaseEvent::Object { base, raw } => {
                if let Err(reason) = self.handle_base_object(&base, &raw, now) {
                    debug!("Object from '{}' rejected: {}", base, reason);
                }
            }
            BaseEvent::Disconnected { name } => {
                if self.unregister_base(&name) {
                    info!("Base '{}' offline", name);
                }
            }
        }
    }

    fn check_incoming(&self, msg: &Message) -> Result<MessageType, RejectReason> {
        let kind = validate_incoming(msg)?;
        if kind == MessageType::Publish {
            self.tracker.validate_incoming_publish(msg)?;
        }
        Ok(kind)
    }

    fn check_outgoing(&self, msg: &Message) -> Result<MessageType, RejectReason> {
        let kind = validate_outgoing(msg)?;
        if kind == MessageType::Set {
            self.tracker.validate_outgoing_set(msg)?;
        }
        Ok(kind)
    }

    fn record_console(&mut self, incoming: bool, valid: bool, raw: &str, ts: DateTime<Utc>) {
        if let Err(e) = self
            .console
            .handle_line(self.tracker.store_mut(), incoming, valid, raw, ts)
        {
            error!("Failed to store console line: {}", e);
        }
    }

    /// One object received from a Base.
    pub fn handle_base_object(
        &mut self,
        base: &str,
        raw: &str,
        now: Instant,
    ) -> Result<MessageType, RejectReason> {
        let ts = Utc::now();
        metrics::inc_messages_received();

        let parsed = Message::from_json_str(raw);
        let verdict = match &parsed {
            Ok(msg) => self.check_incoming(msg),
            Err(e) => Err(RejectReason::from(e.clone())),
        };
        self.record_console(true, verdict.is_ok(), raw, ts);

        match (&verdict, parsed) {
            (Ok(kind), Ok(msg)) => {
                let result = match kind {
                    MessageType::Publish => self
                        .tracker
                        .handle_publish(ts, &msg, Some(base), &mut self.timers)
                        .map(|_| ()),
                    MessageType::Set => self.tracker.handle_incoming_set(ts, &msg).map(|_| ()),
                    MessageType::Request => {
                        debug!("Request seen on '{}': {}", base, msg);
                        Ok(())
                    }
                    MessageType::Error => {
                        warn!("Error reported via '{}': {}", base, msg);
                        self.tracker
                            .handle_error(&msg, &mut self.timers)
                            .map(|_| ())
                    }
                };
                if let Err(e) = result {
                    error!("Failed to apply message from '{}': {}", base, e);
                }
            }
            (Err(reason), parsed) => {
                metrics::inc_messages_invalid();
                warn!(
                    "Invalid message from '{}': {} ({})",
                    base,
                    reason,
                    escape_line(raw)
                );
                // Only structured replies count against a pending transaction
                if let Ok(msg) = parsed {
                    if let Err(e) = self.tracker.handle_invalid_incoming(&msg, &mut self.timers) {
                        error!("Failed to roll back after invalid reply: {}", e);
                    }
                }
            }
            (Ok(_), Err(_)) => {}
        }

        self.pump_discovery(now);
        // A reply may have freed a node the retry timer already skipped
        if self.discovery.timer().is_none() && !self.discovery.is_empty() {
            self.discovery
                .update(false, &self.tracker, &mut self.timers, now);
        }
        verdict
    }

    /// Base to send a message through: the one the destination was last heard
    /// through if it is still connected, otherwise the first connected Base.
    pub fn route(&self, msg: &Message) -> Result<String, TransportError> {
        if let Some(base) = msg
            .to_addr()
            .and_then(|addr| self.tracker.get_base_for_addr(addr))
        {
            if self.bases.contains(base) {
                return Ok(base.to_string());
            }
        }
        self.bases.first_base().ok_or(TransportError::NoBase)
    }

    /// A user command: a `request` or `set` as raw JSON.
    pub fn submit_command(
        &mut self,
        raw: &str,
        callback: Option<TransactionCallback>,
        now: Instant,
    ) -> Result<Submission, CommandError> {
        metrics::inc_commands_submitted();
        let msg = Message::from_json_str(raw).map_err(CommandError::BadJson)?;
        self.send_outgoing(msg, callback, now)
    }

    fn send_outgoing(
        &mut self,
        msg: Message,
        callback: Option<TransactionCallback>,
        now: Instant,
    ) -> Result<Submission, CommandError> {
        let ts = Utc::now();
        let base = self.route(&msg)?;
        let verdict = self.check_outgoing(&msg);
        let line = msg.to_json_string();

        self.bases.send_json(&base, &line)?;
        self.record_console(false, verdict.is_ok(), &line, ts);

        let submission = match verdict {
            Ok(MessageType::Set) => {
                if let Err(e) = self
                    .tracker
                    .handle_set(ts, msg, callback, &mut self.timers, now)
                {
                    error!("Failed to apply set: {}", e);
                }
                Submission::Tracked
            }
            Ok(_) => {
                self.tracker
                    .handle_request(msg, callback, &mut self.timers, now);
                Submission::Tracked
            }
            Err(reason) => {
                metrics::inc_messages_invalid();
                warn!("Sending invalid message to '{}': {}", base, reason);
                self.tracker.handle_invalid_outgoing(&msg, &mut self.timers);
                Submission::Untracked(reason)
            }
        };

        self.pump_discovery(now);
        Ok(submission)
    }

    fn send_discovery_request(&mut self, msg: Message, now: Instant) {
        metrics::inc_discovery_requests();
        if let Err(e) = self.send_outgoing(msg, None, now) {
            debug!("Discovery request not sent: {}", e);
            self.discovery.schedule(&mut self.timers, now);
        }
    }

    /// Let discovery look at whatever changed since the last call.
    pub fn pump_discovery(&mut self, now: Instant) {
        self.discovery
            .process_notifications(&self.tracker, &mut self.timers, now);
    }

    /// Run every timer due at `now`. Returns how many fired.
    pub fn fire_due_timers(&mut self, now: Instant) -> usize {
        let due = self.timers.pop_due(now);
        let fired = due.len();
        for (id, event) in due {
            match event {
                TimerEvent::TransactionTimeout { addr } => {
                    if self
                        .tracker
                        .handle_transaction_timeout(addr, id, &mut self.timers)
                    {
                        // Node is idle again
                        self.discovery
                            .update(false, &self.tracker, &mut self.timers, now);
                    }
                }
                TimerEvent::DiscoveryRetry => {
                    if !self.discovery.on_retry(id) {
                        continue;
                    }
                    if let Some(request) =
                        self.discovery
                            .update(true, &self.tracker, &mut self.timers, now)
                    {
                        self.send_discovery_request(request, now);
                    }
                }
            }
        }
        self.pump_discovery(now);
        fired
    }

    pub fn floorplan(&self) -> Option<&str> {
        self.floorplan.as_deref()
    }

    pub fn floorplan_at(&self, at: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        self.tracker.store().get_floorplan_at_timestamp(Some(at))
    }

    /// Store a new version of the floorplan document.
    pub fn update_floorplan(&mut self, document: &str) -> Result<(), StoreError> {
        let store = self.tracker.store_mut();
        store.save_floorplan_version(Utc::now(), document)?;
        store.commit()?;
        self.floorplan = Some(document.to_string());
        Ok(())
    }

    /// Serve Bases on `listener` until `shutdown` completes, then close.
    pub async fn run_until<F>(mut self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(base::serve(
            listener,
            events_tx,
            self.config.server.max_line_bytes,
        ));
        tokio::pin!(shutdown);

        let mut metrics_tick = tokio::time::interval(METRICS_INTERVAL);
        metrics_tick.tick().await;

        loop {
            let deadline = self.timers.next_deadline();
            let wake = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
                event = events_rx.recv() => match event {
                    Some(event) => self.handle_base_event(event, Instant::now()),
                    None => {
                        warn!("Base server stopped");
                        break;
                    }
                },
                _ = wake => {
                    self.fire_due_timers(Instant::now());
                }
                _ = metrics_tick.tick() => {
                    info!("metrics: {}", metrics::snapshot());
                }
            }
        }

        server.abort();
        self.close()?;
        Ok(())
    }

    pub async fn run(self, listener: TcpListener) -> Result<()> {
        self.run_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl-C handler: {}", e);
            }
        })
        .await
    }
}
