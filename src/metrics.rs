//! Process-wide counters, logged periodically by the gateway loop.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static MESSAGES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_INVALID: AtomicU64 = AtomicU64::new(0);
static COMMANDS_SUBMITTED: AtomicU64 = AtomicU64::new(0);
static TRANSACTIONS_STARTED: AtomicU64 = AtomicU64::new(0);
static TRANSACTIONS_SUCCEEDED: AtomicU64 = AtomicU64::new(0);
static TRANSACTIONS_FAILED: AtomicU64 = AtomicU64::new(0);
static TRANSACTIONS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static DISCOVERY_REQUESTS: AtomicU64 = AtomicU64::new(0);

pub fn inc_messages_received() {
    MESSAGES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_invalid() {
    MESSAGES_INVALID.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_submitted() {
    COMMANDS_SUBMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transactions_started() {
    TRANSACTIONS_STARTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transactions_succeeded() {
    TRANSACTIONS_SUCCEEDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transactions_failed() {
    TRANSACTIONS_FAILED.fetch_add(1, Ordering::Relaxed);
}
/// Timed-out transactions also count as succeeded.
pub fn inc_transactions_timed_out() {
    TRANSACTIONS_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_discovery_requests() {
    DISCOVERY_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub messages_received: u64,
    pub messages_invalid: u64,
    pub commands_submitted: u64,
    pub transactions_started: u64,
    pub transactions_succeeded: u64,
    pub transactions_failed: u64,
    pub transactions_timed_out: u64,
    pub discovery_requests: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        messages_received: MESSAGES_RECEIVED.load(Ordering::Relaxed),
        messages_invalid: MESSAGES_INVALID.load(Ordering::Relaxed),
        commands_submitted: COMMANDS_SUBMITTED.load(Ordering::Relaxed),
        transactions_started: TRANSACTIONS_STARTED.load(Ordering::Relaxed),
        transactions_succeeded: TRANSACTIONS_SUCCEEDED.load(Ordering::Relaxed),
        transactions_failed: TRANSACTIONS_FAILED.load(Ordering::Relaxed),
        transactions_timed_out: TRANSACTIONS_TIMED_OUT.load(Ordering::Relaxed),
        discovery_requests: DISCOVERY_REQUESTS.load(Ordering::Relaxed),
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx={} invalid={} commands={} tx_started={} tx_ok={} tx_failed={} tx_timeout={} discovery={}",
            self.messages_received,
            self.messages_invalid,
            self.commands_submitted,
            self.transactions_started,
            self.transactions_succeeded,
            self.transactions_failed,
            self.transactions_timed_out,
            self.discovery_requests
        )
    }
}
