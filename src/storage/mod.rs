//! # Storage Module - Time-Indexed State History
//!
//! Every change the gateway learns about is appended to a sled database and never
//! overwritten. Three trees are kept:
//!
//! ```text
//! values     <path><ts_ms><seq>  → StoredRow { value, success }
//! console    <ts_ms><seq>        → line
//! floorplan  <ts_ms><seq>        → document
//! ```
//!
//! Writes are staged with `save_*` and become visible together on [`Store::commit`],
//! which applies the whole batch in a single sled transaction. A row written during a
//! transaction that later fails is not deleted; its `success` bit is cleared with
//! [`Store::mark_saved_value_failure`] and every query skips it.
//!
//! Timestamps are truncated to milliseconds. Point queries use an inclusive upper bound,
//! range queries a half-open `[t0, t1)` interval.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use sensorino::protocol::Scalar;
//! use sensorino::state::changeset::ChangePath;
//! use sensorino::storage::{RecordValue, StoreBuilder};
//!
//! # fn main() -> Result<(), sensorino::errors::StoreError> {
//! let mut store = StoreBuilder::new("./data/sensorino.db").open()?;
//! let path = ChangePath::Channel(5, 2, "switch".into(), 0);
//! store.save_value(Utc::now(), &path, RecordValue::Channel(Scalar::Bool(true)))?;
//! store.commit()?;
//! assert!(store.get_value_current(&path)?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod keys;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{IVec, Transactional};

use crate::errors::StoreError;
use crate::protocol::Scalar;
use crate::state::changeset::ChangePath;
use crate::state::tree::{ChannelCounts, StateTree};

const TREE_VALUES: &str = "values";
const TREE_CONSOLE: &str = "console";
const TREE_FLOORPLAN: &str = "floorplan";

pub const DEFAULT_RANGE_LIMIT: usize = 1024;
pub const DEFAULT_CONSOLE_HISTORY: usize = 64;

/// What a value row holds; the variant matches the depth of the row's path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordValue {
    Node {
        discovered: bool,
        base: Option<String>,
    },
    Service {
        discovered: bool,
    },
    Counts(ChannelCounts),
    Channel(Scalar),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    value: RecordValue,
    success: bool,
}

/// Identifies one value row, used to void it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub path: ChangePath,
    pub timestamp_ms: u64,
    pub seq: u64,
}

impl RecordRef {
    fn key(&self) -> Vec<u8> {
        keys::row_key(&self.path, self.timestamp_ms, self.seq)
    }
}

enum StagedWrite {
    Value(Vec<u8>, Vec<u8>),
    MarkFailure(Vec<u8>),
    Console(Vec<u8>, String),
    Floorplan(Vec<u8>, String),
}

pub fn to_millis(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

pub fn from_millis(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms.min(i64::MAX as u64) as i64)
        .single()
        .unwrap_or_default()
}

fn upper_bound(at: Option<DateTime<Utc>>) -> u64 {
    at.map(to_millis).unwrap_or(u64::MAX)
}

/// Helper builder so tests can easily create throwaway stores.
pub struct StoreBuilder {
    path: PathBuf,
    range_limit: usize,
    console_history: usize,
    temporary: bool,
}

impl StoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            range_limit: DEFAULT_RANGE_LIMIT,
            console_history: DEFAULT_CONSOLE_HISTORY,
            temporary: false,
        }
    }

    /// Maximum rows returned by a range query.
    pub fn range_limit(mut self, limit: usize) -> Self {
        self.range_limit = limit;
        self
    }

    /// Lines returned by a console-at-timestamp query.
    pub fn console_history(mut self, lines: usize) -> Self {
        self.console_history = lines;
        self
    }

    /// Delete the database when the store is dropped.
    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn open(self) -> Result<Store, StoreError> {
        std::fs::create_dir_all(&self.path)?;
        let db = sled::Config::new()
            .path(&self.path)
            .temporary(self.temporary)
            .open()?;
        let values = db.open_tree(TREE_VALUES)?;
        let console = db.open_tree(TREE_CONSOLE)?;
        let floorplan = db.open_tree(TREE_FLOORPLAN)?;
        debug!("Opened store at {}", self.path.display());
        Ok(Store {
            db,
            values,
            console,
            floorplan,
            staged: Vec::new(),
            range_limit: self.range_limit,
            console_history: self.console_history,
            #[cfg(test)]
            fail_next_commit: false,
        })
    }
}

/// Sled-backed append-only history of the state tree, console and floorplan.
pub struct Store {
    db: sled::Db,
    values: sled::Tree,
    console: sled::Tree,
    floorplan: sled::Tree,
    staged: Vec<StagedWrite>,
    range_limit: usize,
    console_history: usize,
    #[cfg(test)]
    fail_next_commit: bool,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        StoreBuilder::new(path.as_ref()).open()
    }

    fn decode_row(bytes: &IVec) -> Result<StoredRow, StoreError> {
        Ok(bincode::deserialize::<StoredRow>(bytes)?)
    }

    fn next_seq(&self) -> Result<u64, StoreError> {
        Ok(self.db.generate_id()?)
    }

    /// Stage a successful value row. Returns the reference needed to void it.
    pub fn save_value(
        &mut self,
        ts: DateTime<Utc>,
        path: &ChangePath,
        value: RecordValue,
    ) -> Result<RecordRef, StoreError> {
        let record = RecordRef {
            path: path.clone(),
            timestamp_ms: to_millis(ts),
            seq: self.next_seq()?,
        };
        let row = bincode::serialize(&StoredRow {
            value,
            success: true,
        })?;
        self.staged.push(StagedWrite::Value(record.key(), row));
        Ok(record)
    }

    /// Stage clearing the success bit of a previously saved row.
    pub fn mark_saved_value_failure(&mut self, record: &RecordRef) {
        self.staged.push(StagedWrite::MarkFailure(record.key()));
    }

    pub fn save_console_line(&mut self, ts: DateTime<Utc>, line: &str) -> Result<(), StoreError> {
        let key = keys::time_key(to_millis(ts), self.next_seq()?).to_vec();
        self.staged.push(StagedWrite::Console(key, line.to_string()));
        Ok(())
    }

    pub fn save_floorplan_version(
        &mut self,
        ts: DateTime<Utc>,
        document: &str,
    ) -> Result<(), StoreError> {
        let key = keys::time_key(to_millis(ts), self.next_seq()?).to_vec();
        self.staged
            .push(StagedWrite::Floorplan(key, document.to_string()));
        Ok(())
    }

    /// Make the next non-empty commit fail without applying anything.
    #[cfg(test)]
    pub(crate) fn fail_next_commit(&mut self) {
        self.fail_next_commit = true;
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Drop staged writes without applying them.
    pub fn discard_staged(&mut self) {
        if !self.staged.is_empty() {
            warn!("Discarding {} staged store writes", self.staged.len());
        }
        self.staged.clear();
    }

    /// Apply all staged writes atomically. On failure nothing is applied and the
    /// staged batch is dropped.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.staged);
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_commit) {
            return Err(StoreError::Corrupt("commit refused".into()));
        }

        let result = (&self.values, &self.console, &self.floorplan).transaction(
            |(values, console, floorplan)| {
                for write in &staged {
                    match write {
                        StagedWrite::Value(key, row) => {
                            values.insert(key.as_slice(), row.as_slice())?;
                        }
                        StagedWrite::MarkFailure(key) => {
                            let Some(bytes) = values.get(key.as_slice())? else {
                                warn!("No stored row to mark as failed");
                                continue;
                            };
                            let mut row = Self::decode_row(&bytes)
                                .map_err(ConflictableTransactionError::Abort)?;
                            row.success = false;
                            let encoded = bincode::serialize(&row).map_err(|e| {
                                ConflictableTransactionError::Abort(StoreError::Bincode(e))
                            })?;
                            values.insert(key.as_slice(), encoded)?;
                        }
                        StagedWrite::Console(key, line) => {
                            console.insert(key.as_slice(), line.as_bytes())?;
                        }
                        StagedWrite::Floorplan(key, doc) => {
                            floorplan.insert(key.as_slice(), doc.as_bytes())?;
                        }
                    }
                }
                Ok(())
            },
        );

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(StoreError::Sled(e)),
        }
        self.db.flush()?;
        Ok(())
    }

    /// Most recent successful value at exactly `path` as of `at` (inclusive), or the
    /// latest one when `at` is `None`.
    pub fn get_value_at_timestamp(
        &self,
        path: &ChangePath,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<RecordValue>, StoreError> {
        self.latest_success(path, upper_bound(at))
    }

    fn latest_success(
        &self,
        path: &ChangePath,
        limit_ms: u64,
    ) -> Result<Option<RecordValue>, StoreError> {
        let start = keys::row_key(path, 0, 0);
        let end = keys::row_key(path, limit_ms, u64::MAX);
        for entry in self.values.range(start..=end).rev() {
            let (_, bytes) = entry?;
            let row = Self::decode_row(&bytes)?;
            if row.success {
                return Ok(Some(row.value));
            }
        }
        Ok(None)
    }

    pub fn get_value_current(&self, path: &ChangePath) -> Result<Option<RecordValue>, StoreError> {
        self.get_value_at_timestamp(path, None)
    }

    /// Rebuild the whole state tree from the latest successful row of every path.
    ///
    /// Seeks once per distinct path and walks back from `at`, so the cost follows
    /// the number of paths rather than the length of the history.
    pub fn get_tree_at_timestamp(
        &self,
        at: Option<DateTime<Utc>>,
    ) -> Result<StateTree, StoreError> {
        let limit = upper_bound(at);
        let mut latest: BTreeMap<ChangePath, RecordValue> = BTreeMap::new();
        let mut from = Bound::Unbounded;
        loop {
            let Some(entry) = self.values.range::<Vec<u8>, _>((from, Bound::Unbounded)).next()
            else {
                break;
            };
            let (key, _) = entry?;
            let (path, _, _) = keys::decode_row_key(&key)?;
            from = Bound::Excluded(keys::last_row_key(&path));
            if let Some(value) = self.latest_success(&path, limit)? {
                latest.insert(path, value);
            }
        }

        // ChangePath orders shallow paths first
        let mut tree = StateTree::new();
        for (path, value) in &latest {
            tree.apply_record(path, value);
        }
        Ok(tree)
    }

    pub fn get_tree_current(&self) -> Result<StateTree, StoreError> {
        self.get_tree_at_timestamp(None)
    }

    /// Successful values of `path` within `[t0, t1)`, oldest first. When more rows
    /// exist than the range limit, the most recent ones are returned.
    pub fn get_values_within_period(
        &self,
        path: &ChangePath,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, RecordValue)>, StoreError> {
        let start = keys::row_key(path, to_millis(t0), 0);
        let end = keys::row_key(path, to_millis(t1), 0);
        if start >= end {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in self.values.range(start..end).rev() {
            if out.len() >= self.range_limit {
                break;
            }
            let (key, bytes) = entry?;
            let row = Self::decode_row(&bytes)?;
            if !row.success {
                continue;
            }
            let (_, ts, _) = keys::decode_row_key(&key)?;
            out.push((from_millis(ts), row.value));
        }
        out.reverse();
        Ok(out)
    }

    /// Last console lines up to `at` (inclusive), oldest first.
    pub fn get_console_at_timestamp(
        &self,
        at: Option<DateTime<Utc>>,
    ) -> Result<Vec<(DateTime<Utc>, String)>, StoreError> {
        let end = keys::time_key(upper_bound(at), u64::MAX);
        let mut out = Vec::new();
        for entry in self.console.range(..=end.as_slice()).rev() {
            if out.len() >= self.console_history {
                break;
            }
            let (key, line) = entry?;
            let (ts, _) = keys::decode_time_key(&key)?;
            out.push((from_millis(ts), String::from_utf8_lossy(&line).into_owned()));
        }
        out.reverse();
        Ok(out)
    }

    pub fn get_console_current(&self) -> Result<Vec<(DateTime<Utc>, String)>, StoreError> {
        self.get_console_at_timestamp(None)
    }

    pub fn get_floorplan_at_timestamp(
        &self,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<String>, StoreError> {
        let end = keys::time_key(upper_bound(at), u64::MAX);
        match self.floorplan.range(..=end.as_slice()).next_back() {
            Some(entry) => {
                let (_, doc) = entry?;
                Ok(Some(String::from_utf8_lossy(&doc).into_owned()))
            }
            None => Ok(None),
        }
    }

    pub fn get_floorplan_current(&self) -> Result<Option<String>, StoreError> {
        self.get_floorplan_at_timestamp(None)
    }

    /// Number of value rows, voided ones included.
    pub fn value_row_count(&self) -> usize {
        self.values.len()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), StoreError> {
        self.discard_staged();
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = StoreBuilder::new(dir.path().join("db")).open().unwrap();
        (dir, store)
    }

    fn chan(v: Scalar) -> RecordValue {
        RecordValue::Channel(v)
    }

    #[test]
    fn staged_rows_are_invisible_until_commit() {
        let (_dir, mut store) = store();
        let path = ChangePath::Channel(5, 2, "switch".into(), 0);
        store
            .save_value(Utc::now(), &path, chan(Scalar::Bool(true)))
            .unwrap();
        assert!(store.has_staged());
        assert_eq!(store.get_value_current(&path).unwrap(), None);
        store.commit().unwrap();
        assert_eq!(
            store.get_value_current(&path).unwrap(),
            Some(chan(Scalar::Bool(true)))
        );
    }

    #[test]
    fn point_query_uses_inclusive_upper_bound() {
        let (_dir, mut store) = store();
        let path = ChangePath::Channel(1, 1, "temperature".into(), 0);
        let t0 = Utc.timestamp_millis_opt(1_000_000).unwrap();
        store.save_value(t0, &path, chan(Scalar::Float(20.0))).unwrap();
        store
            .save_value(t0 + Duration::seconds(10), &path, chan(Scalar::Float(21.0)))
            .unwrap();
        store.commit().unwrap();

        let at = |s| store.get_value_at_timestamp(&path, Some(t0 + Duration::seconds(s)));
        assert_eq!(at(-1).unwrap(), None);
        assert_eq!(at(0).unwrap(), Some(chan(Scalar::Float(20.0))));
        assert_eq!(at(9).unwrap(), Some(chan(Scalar::Float(20.0))));
        assert_eq!(at(10).unwrap(), Some(chan(Scalar::Float(21.0))));
    }

    #[test]
    fn voided_rows_are_skipped() {
        let (_dir, mut store) = store();
        let path = ChangePath::Channel(5, 2, "switch".into(), 0);
        let t0 = Utc::now();
        store.save_value(t0, &path, chan(Scalar::Bool(true))).unwrap();
        store.commit().unwrap();
        let r = store
            .save_value(t0 + Duration::milliseconds(5), &path, chan(Scalar::Bool(false)))
            .unwrap();
        store.commit().unwrap();
        store.mark_saved_value_failure(&r);
        store.commit().unwrap();

        assert_eq!(
            store.get_value_current(&path).unwrap(),
            Some(chan(Scalar::Bool(true)))
        );
        assert_eq!(store.value_row_count(), 2);
    }

    #[test]
    fn failure_mark_in_same_batch_applies_after_insert() {
        let (_dir, mut store) = store();
        let path = ChangePath::Service(3, 1);
        let r = store
            .save_value(Utc::now(), &path, RecordValue::Service { discovered: false })
            .unwrap();
        store.mark_saved_value_failure(&r);
        store.commit().unwrap();
        assert_eq!(store.get_value_current(&path).unwrap(), None);
    }

    #[test]
    fn sibling_paths_do_not_leak_into_point_queries() {
        let (_dir, mut store) = store();
        let t = Utc::now();
        store
            .save_value(t, &ChangePath::Channel(5, 2, "switch".into(), 1), chan(Scalar::Bool(true)))
            .unwrap();
        store
            .save_value(t, &ChangePath::DataType(5, 2, "switch".into()), RecordValue::Counts(ChannelCounts { publish: 1, accept: 1 }))
            .unwrap();
        store.commit().unwrap();
        assert_eq!(
            store
                .get_value_current(&ChangePath::Channel(5, 2, "switch".into(), 0))
                .unwrap(),
            None
        );
    }

    #[test]
    fn range_query_is_half_open_and_capped() {
        let dir = tempdir().unwrap();
        let mut store = StoreBuilder::new(dir.path().join("db"))
            .range_limit(3)
            .open()
            .unwrap();
        let path = ChangePath::Channel(2, 1, "voltage".into(), 0);
        let t0 = Utc.timestamp_millis_opt(5_000_000).unwrap();
        for i in 0..6 {
            store
                .save_value(t0 + Duration::seconds(i), &path, chan(Scalar::Int(i)))
                .unwrap();
        }
        store.commit().unwrap();

        let got = store
            .get_values_within_period(&path, t0 + Duration::seconds(1), t0 + Duration::seconds(5))
            .unwrap();
        let values: Vec<_> = got.iter().map(|(_, v)| v.clone()).collect();
        // Rows 1..=4 fall in range, the newest three are kept, oldest first
        assert_eq!(
            values,
            vec![chan(Scalar::Int(2)), chan(Scalar::Int(3)), chan(Scalar::Int(4))]
        );
        assert_eq!(got[0].0, t0 + Duration::seconds(2));
    }

    #[test]
    fn console_and_floorplan_follow_timestamps() {
        let dir = tempdir().unwrap();
        let mut store = StoreBuilder::new(dir.path().join("db"))
            .console_history(2)
            .open()
            .unwrap();
        let t0 = Utc.timestamp_millis_opt(9_000_000).unwrap();
        for (i, line) in ["a", "b", "c"].iter().enumerate() {
            store
                .save_console_line(t0 + Duration::seconds(i as i64), line)
                .unwrap();
        }
        store.save_floorplan_version(t0, "{\"v\":1}").unwrap();
        store
            .save_floorplan_version(t0 + Duration::seconds(2), "{\"v\":2}")
            .unwrap();
        store.commit().unwrap();

        let lines: Vec<_> = store
            .get_console_current()
            .unwrap()
            .into_iter()
            .map(|(_, l)| l)
            .collect();
        assert_eq!(lines, vec!["b", "c"]);
        let early: Vec<_> = store
            .get_console_at_timestamp(Some(t0))
            .unwrap()
            .into_iter()
            .map(|(_, l)| l)
            .collect();
        assert_eq!(early, vec!["a"]);

        assert_eq!(
            store
                .get_floorplan_at_timestamp(Some(t0 + Duration::seconds(1)))
                .unwrap()
                .as_deref(),
            Some("{\"v\":1}")
        );
        assert_eq!(
            store.get_floorplan_current().unwrap().as_deref(),
            Some("{\"v\":2}")
        );
        assert_eq!(
            store
                .get_floorplan_at_timestamp(Some(t0 - Duration::seconds(1)))
                .unwrap(),
            None
        );
    }

    #[test]
    fn tree_reconstruction_honours_timestamp() {
        let (_dir, mut store) = store();
        let t0 = Utc.timestamp_millis_opt(2_000_000).unwrap();
        store
            .save_value(t0, &ChangePath::Node(5), RecordValue::Node { discovered: false, base: Some("b".into()) })
            .unwrap();
        store
            .save_value(t0, &ChangePath::Channel(5, 2, "switch".into(), 0), chan(Scalar::Bool(true)))
            .unwrap();
        store
            .save_value(
                t0 + Duration::seconds(1),
                &ChangePath::Channel(5, 2, "switch".into(), 0),
                chan(Scalar::Bool(false)),
            )
            .unwrap();
        store.commit().unwrap();

        let then = store.get_tree_at_timestamp(Some(t0)).unwrap();
        assert_eq!(
            then.service(5, 2).unwrap().values("switch"),
            &[Scalar::Bool(true)]
        );
        let now = store.get_tree_current().unwrap();
        assert_eq!(
            now.service(5, 2).unwrap().values("switch"),
            &[Scalar::Bool(false)]
        );
        assert_eq!(now.node(5).unwrap().base.as_deref(), Some("b"));
        assert!(store
            .get_tree_at_timestamp(Some(t0 - Duration::milliseconds(1)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn tree_skips_voided_tail_of_long_history() {
        let (_dir, mut store) = store();
        let t0 = Utc.timestamp_millis_opt(5_000_000).unwrap();
        let temp = ChangePath::Channel(3, 1, "temperature".into(), 0);
        let switch = ChangePath::Channel(3, 1, "switch".into(), 0);
        for i in 0..200 {
            store
                .save_value(t0 + Duration::seconds(i), &temp, chan(Scalar::Int(i)))
                .unwrap();
        }
        store.save_value(t0, &switch, chan(Scalar::Bool(false))).unwrap();
        let last = store
            .save_value(t0 + Duration::seconds(200), &temp, chan(Scalar::Int(-1)))
            .unwrap();
        store.mark_saved_value_failure(&last);
        store.commit().unwrap();

        let tree = store.get_tree_current().unwrap();
        let svc = tree.service(3, 1).unwrap();
        assert_eq!(svc.values("temperature"), &[Scalar::Int(199)]);
        assert_eq!(svc.values("switch"), &[Scalar::Bool(false)]);

        let earlier = store
            .get_tree_at_timestamp(Some(t0 + Duration::seconds(50)))
            .unwrap();
        assert_eq!(
            earlier.service(3, 1).unwrap().values("temperature"),
            &[Scalar::Int(50)]
        );
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = ChangePath::Channel(9, 1, "presence".into(), 0);
        {
            let mut store = Store::open(dir.path().join("db")).unwrap();
            store.save_value(Utc::now(), &path, chan(Scalar::Bool(true))).unwrap();
            store.commit().unwrap();
            store.close().unwrap();
        }
        let store = Store::open(dir.path().join("db")).unwrap();
        assert_eq!(
            store.get_value_current(&path).unwrap(),
            Some(chan(Scalar::Bool(true)))
        );
    }
}
