//! Durable experiment store backed by redb.
//!
//! # Table design
//!
//! ```text
//! KEYS               [ seq: u64 BE ]                     -> api key
//! EXPERIMENTS        experiment id                       -> JSON object
//! EXPERIMENT_INDEX   [ ts_ms: u64 BE | experiment id ]   -> experiment id
//! EXPERIMENT_TS      experiment id                       -> ts_ms
//! AGENT_RESULTS      [ experiment id | 0x00 | seq: u64 BE ] -> JSON AgentResult
//! ```
//!
//! Big-endian prefixes make byte order equal chronological (or insertion)
//! order, so listings are plain range scans.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::workload::AgentResult;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store database error: {0}")]
    Db(String),

    #[error("corrupt store record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Db(e.to_string())
}

/// Storage operations the orchestrator and CLI depend on.
pub trait ExperimentStore: Send + Sync {
    /// Append an API key to the pool.
    fn push_key(&self, key: &str) -> Result<(), StoreError>;

    /// The oldest pooled key, left in place.
    fn peek_key(&self) -> Result<Option<String>, StoreError>;

    /// Merge `fields` into the experiment's metadata and index it at `at`.
    fn store_experiment(
        &self,
        exp_id: &str,
        fields: &Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn get_experiment(&self, exp_id: &str) -> Result<Option<Map<String, Value>>, StoreError>;

    /// Experiment ids, oldest first.
    fn list_experiments(&self) -> Result<Vec<String>, StoreError>;

    fn push_agent_result(&self, exp_id: &str, result: &AgentResult) -> Result<(), StoreError>;

    /// Results for one experiment in insertion order.
    fn agent_results(&self, exp_id: &str) -> Result<Vec<AgentResult>, StoreError>;
}

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const KEYS: TableDefinition<&[u8], &str> = TableDefinition::new("keys");
const EXPERIMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("experiments");
const EXPERIMENT_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("experiment_index");
const EXPERIMENT_TS: TableDefinition<&str, u64> = TableDefinition::new("experiment_ts");
const AGENT_RESULTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("agent_results");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

/// Trailing big-endian sequence number of a key.
fn seq_of(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    if key.len() >= 8 {
        buf.copy_from_slice(&key[key.len() - 8..]);
    }
    u64::from_be_bytes(buf)
}

fn index_key(ts_ms: u64, exp_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + exp_id.len());
    key.extend_from_slice(&ts_ms.to_be_bytes());
    key.extend_from_slice(exp_id.as_bytes());
    key
}

fn result_key(exp_id: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(exp_id.len() + 9);
    key.extend_from_slice(exp_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(db_err)?;
            }
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(KEYS).map_err(db_err)?;
        wt.open_table(EXPERIMENTS).map_err(db_err)?;
        wt.open_table(EXPERIMENT_INDEX).map_err(db_err)?;
        wt.open_table(EXPERIMENT_TS).map_err(db_err)?;
        wt.open_table(AGENT_RESULTS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }
}

impl ExperimentStore for RedbStore {
    fn push_key(&self, key: &str) -> Result<(), StoreError> {
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(KEYS).map_err(db_err)?;
            let next = match table.last().map_err(db_err)? {
                Some((k, _)) => seq_of(k.value()) + 1,
                None => 0,
            };
            table
                .insert(next.to_be_bytes().as_slice(), key)
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn peek_key(&self) -> Result<Option<String>, StoreError> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(KEYS).map_err(db_err)?;
        let first = table.first().map_err(db_err)?;
        Ok(first.map(|(_, v)| v.value().to_string()))
    }

    fn store_experiment(
        &self,
        exp_id: &str,
        fields: &Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ts_ms = at.timestamp_millis().max(0) as u64;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut experiments = wt.open_table(EXPERIMENTS).map_err(db_err)?;
            let existing = experiments
                .get(exp_id)
                .map_err(db_err)?
                .map(|g| g.value().to_vec());
            let mut merged: Map<String, Value> = match existing {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => Map::new(),
            };
            merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            let value = serde_json::to_vec(&merged)?;
            experiments
                .insert(exp_id, value.as_slice())
                .map_err(db_err)?;

            // Re-indexing moves the experiment to its new timestamp.
            let mut ts_table = wt.open_table(EXPERIMENT_TS).map_err(db_err)?;
            let previous = ts_table.get(exp_id).map_err(db_err)?.map(|g| g.value());
            let mut index = wt.open_table(EXPERIMENT_INDEX).map_err(db_err)?;
            if let Some(old) = previous {
                index
                    .remove(index_key(old, exp_id).as_slice())
                    .map_err(db_err)?;
            }
            index
                .insert(index_key(ts_ms, exp_id).as_slice(), exp_id)
                .map_err(db_err)?;
            ts_table.insert(exp_id, ts_ms).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn get_experiment(&self, exp_id: &str) -> Result<Option<Map<String, Value>>, StoreError> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(EXPERIMENTS).map_err(db_err)?;
        match table.get(exp_id).map_err(db_err)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_experiments(&self) -> Result<Vec<String>, StoreError> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(EXPERIMENT_INDEX).map_err(db_err)?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            ids.push(v.value().to_string());
        }
        Ok(ids)
    }

    fn push_agent_result(&self, exp_id: &str, result: &AgentResult) -> Result<(), StoreError> {
        let value = serde_json::to_vec(result)?;
        let lower = result_key(exp_id, 0);
        let upper = result_key(exp_id, u64::MAX);
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(AGENT_RESULTS).map_err(db_err)?;
            let next = {
                let mut range = table
                    .range(lower.as_slice()..=upper.as_slice())
                    .map_err(db_err)?;
                match range.next_back() {
                    Some(entry) => {
                        let (k, _) = entry.map_err(db_err)?;
                        seq_of(k.value()) + 1
                    }
                    None => 0,
                }
            };
            table
                .insert(result_key(exp_id, next).as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn agent_results(&self, exp_id: &str) -> Result<Vec<AgentResult>, StoreError> {
        let lower = result_key(exp_id, 0);
        let upper = result_key(exp_id, u64::MAX);
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(AGENT_RESULTS).map_err(db_err)?;
        let mut results = Vec::new();
        for entry in table
            .range(lower.as_slice()..=upper.as_slice())
            .map_err(db_err)?
        {
            let (_, v) = entry.map_err(db_err)?;
            results.push(serde_json::from_slice(v.value())?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadStatus;
    use chrono::TimeZone;
    use serde_json::json;

    fn open_tmp() -> (RedbStore, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("results/experiments.redb")).unwrap();
        (store, dir)
    }

    fn fields(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn result(agent_id: &str, status: WorkloadStatus) -> AgentResult {
        AgentResult {
            agent_id: agent_id.into(),
            intent: "a".into(),
            label: "Metric Optimization".into(),
            cohort: 1,
            hs_key: "hs_abcdefghi...".into(),
            city_id: format!("city-{agent_id}"),
            status,
            failure: None,
            total_tokens: Some(10),
            cost_usd: None,
        }
    }

    #[test]
    fn key_pool_peeks_the_oldest_key() {
        let (store, _dir) = open_tmp();
        assert_eq!(store.peek_key().unwrap(), None);
        store.push_key("hs_first").unwrap();
        store.push_key("hs_second").unwrap();
        assert_eq!(store.peek_key().unwrap().as_deref(), Some("hs_first"));
        // Peeking does not consume.
        assert_eq!(store.peek_key().unwrap().as_deref(), Some("hs_first"));
    }

    #[test]
    fn experiments_list_chronologically() {
        let (store, _dir) = open_tmp();
        let t = |s| Utc.timestamp_opt(s, 0).unwrap();
        store
            .store_experiment("20260102_000000", &fields(json!({"n_pairs": 2})), t(2_000))
            .unwrap();
        store
            .store_experiment("20260101_000000", &fields(json!({"n_pairs": 1})), t(1_000))
            .unwrap();
        store
            .store_experiment("20260103_000000", &fields(json!({"n_pairs": 3})), t(3_000))
            .unwrap();
        assert_eq!(
            store.list_experiments().unwrap(),
            vec!["20260101_000000", "20260102_000000", "20260103_000000"]
        );
    }

    #[test]
    fn storing_twice_merges_fields_and_reindexes() {
        let (store, _dir) = open_tmp();
        let t = |s| Utc.timestamp_opt(s, 0).unwrap();
        store
            .store_experiment("x", &fields(json!({"status": "running", "model": "m"})), t(10))
            .unwrap();
        store
            .store_experiment("y", &fields(json!({"status": "done"})), t(20))
            .unwrap();
        store
            .store_experiment("x", &fields(json!({"status": "done"})), t(30))
            .unwrap();

        let x = store.get_experiment("x").unwrap().unwrap();
        assert_eq!(x.get("status"), Some(&json!("done")));
        assert_eq!(x.get("model"), Some(&json!("m")));
        assert_eq!(store.list_experiments().unwrap(), vec!["y", "x"]);
        assert!(store.get_experiment("missing").unwrap().is_none());
    }

    #[test]
    fn agent_results_append_in_order_per_experiment() {
        let (store, _dir) = open_tmp();
        store
            .push_agent_result("exp1", &result("a-01", WorkloadStatus::Completed))
            .unwrap();
        store
            .push_agent_result("exp10", &result("z-01", WorkloadStatus::Failed))
            .unwrap();
        store
            .push_agent_result("exp1", &result("b-01", WorkloadStatus::Failed))
            .unwrap();

        let ids: Vec<String> = store
            .agent_results("exp1")
            .unwrap()
            .into_iter()
            .map(|r| r.agent_id)
            .collect();
        assert_eq!(ids, vec!["a-01", "b-01"]);
        assert_eq!(store.agent_results("exp10").unwrap().len(), 1);
        assert!(store.agent_results("other").unwrap().is_empty());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.push_key("hs_persisted").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.peek_key().unwrap().as_deref(), Some("hs_persisted"));
    }
}
