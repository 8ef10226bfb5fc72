//! JSON file-backed persistence for Tempo.
//!
//! Provides [`JsonStore`], a generic per-table snapshot store, and
//! [`Database`]/[`Session`], a document store with copy-on-begin transactional
//! sessions. One archival run owns one session; the run either commits every
//! table atomically or discards the working copy on drop.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("row {id} not found in table '{table}'")]
    NotFound { table: String, id: i64 },
}

// ─── JsonStore ───────────────────────────────────────────────────────────────

/// A simple JSON file-backed store for a single domain of data.
///
/// Keeps data in memory and snapshots to `{state_path}/state/{domain}.json`
/// on every write.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(state_path: &Path, domain: &str) -> Self {
        let path = state_path.join("state").join(format!("{domain}.json"));
        Self { path }
    }

    /// Load data from disk. Returns an empty map if the file doesn't exist.
    pub fn load<T: for<'de> Deserialize<'de>>(&self) -> HashMap<String, T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                HashMap::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                HashMap::new()
            }
        }
    }

    /// Save data to disk. Creates directories as needed.
    pub fn save<T: Serialize>(&self, data: &HashMap<String, T>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, content)
    }
}

// ─── Tables ──────────────────────────────────────────────────────────────────

/// One table: rows keyed by stringified surrogate id plus the id counter.
#[derive(Debug, Clone, Default)]
pub struct Table {
    next_id: i64,
    rows: BTreeMap<String, Value>,
}

impl Table {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn from_rows(rows: HashMap<String, Value>) -> Self {
        let next_id = rows
            .keys()
            .filter_map(|k| k.parse::<i64>().ok())
            .max()
            .unwrap_or(0);
        Self {
            next_id,
            rows: rows.into_iter().collect(),
        }
    }

    fn to_rows(&self) -> HashMap<String, Value> {
        self.rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

type Tables = HashMap<String, Table>;

// ─── Database ────────────────────────────────────────────────────────────────

/// The shared document store. All local state — appointments, action log,
/// entity associations, audit log, reversible operations, archive
/// configurations — lives in named tables, snapshotted per table under
/// `{state_path}/state/`.
#[derive(Clone)]
pub struct Database {
    state_path: PathBuf,
    tables: Arc<Mutex<Tables>>,
}

impl Database {
    /// Open (or create) the database rooted at `state_path`. Every
    /// `state/{table}.json` snapshot present is loaded.
    pub fn open(state_path: &Path) -> Self {
        let mut tables = Tables::new();
        let state_dir = state_path.join("state");
        if let Ok(entries) = std::fs::read_dir(&state_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let rows = JsonStore::new(state_path, name).load::<Value>();
                tables.insert(name.to_string(), Table::from_rows(rows));
            }
        }
        debug!(tables = tables.len(), path = %state_path.display(), "database opened");
        Self {
            state_path: state_path.to_path_buf(),
            tables: Arc::new(Mutex::new(tables)),
        }
    }

    /// Begin a transactional session over a copy of the current state.
    pub fn begin(&self) -> Session {
        let snapshot = self.tables.lock().clone();
        Session {
            db: self.clone(),
            inner: Arc::new(Mutex::new(SessionInner {
                work: snapshot,
                committed: false,
            })),
        }
    }

    /// Read a row outside any session.
    pub fn peek(&self, table: &str, id: i64) -> Option<Value> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.rows.get(&id.to_string()).cloned())
    }

    fn apply(&self, work: &Tables) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        *tables = work.clone();
        for (name, table) in tables.iter() {
            JsonStore::new(&self.state_path, name).save(&table.to_rows())?;
        }
        Ok(())
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

struct SessionInner {
    work: Tables,
    committed: bool,
}

/// A transactional working copy of the database. Clones of a session share
/// the same working state, so every store participating in one archival run
/// sees the same uncommitted writes. Dropping all clones without `commit`
/// discards the run's writes.
#[derive(Clone)]
pub struct Session {
    db: Database,
    inner: Arc<Mutex<SessionInner>>,
}

impl Session {
    /// Insert a row, allocating a surrogate id.
    pub fn insert(&self, table: &str, row: Value) -> i64 {
        let mut inner = self.inner.lock();
        let t = inner.work.entry(table.to_string()).or_default();
        let id = t.allocate_id();
        t.rows.insert(id.to_string(), row);
        id
    }

    pub fn get(&self, table: &str, id: i64) -> Option<Value> {
        self.inner
            .lock()
            .work
            .get(table)
            .and_then(|t| t.rows.get(&id.to_string()).cloned())
    }

    pub fn update(&self, table: &str, id: i64, row: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let t = inner
            .work
            .get_mut(table)
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id,
            })?;
        match t.rows.get_mut(&id.to_string()) {
            Some(slot) => {
                *slot = row;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                table: table.to_string(),
                id,
            }),
        }
    }

    pub fn delete(&self, table: &str, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let t = inner
            .work
            .get_mut(table)
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id,
            })?;
        t.rows
            .remove(&id.to_string())
            .map(|_| ())
            .ok_or(StoreError::NotFound {
                table: table.to_string(),
                id,
            })
    }

    /// All rows of a table in id order.
    pub fn scan(&self, table: &str) -> Vec<(i64, Value)> {
        let inner = self.inner.lock();
        let Some(t) = inner.work.get(table) else {
            return Vec::new();
        };
        let mut rows: Vec<(i64, Value)> = t
            .rows
            .iter()
            .filter_map(|(k, v)| k.parse::<i64>().ok().map(|id| (id, v.clone())))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows
    }

    pub fn count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .work
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Apply the working copy to the database and snapshot every table.
    pub fn commit(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        self.db.apply(&inner.work)?;
        inner.committed = true;
        debug!("session committed");
        Ok(())
    }

    /// Discard the working copy and reload committed state.
    pub fn rollback(&self) {
        let mut inner = self.inner.lock();
        inner.work = self.db.tables.lock().clone();
        debug!("session rolled back");
    }

    pub fn is_committed(&self) -> bool {
        self.inner.lock().committed
    }
}

// ─── UTC-naive datetime codec ────────────────────────────────────────────────

/// Serde adapter for datetime columns: rows store UTC-naive strings, the
/// domain layer exchanges `DateTime<Utc>`.
pub mod utc_naive {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.naive_utc().format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        let naive = NaiveDateTime::parse_from_str(&raw, FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S"))
            .map_err(serde::de::Error::custom)?;
        Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
    }

    /// Adapter for `Option<DateTime<Utc>>` columns.
    pub mod option {
        use super::FORMAT;
        use chrono::{DateTime, NaiveDateTime, Utc};
        use serde::{self, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            dt: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => s.serialize_some(&dt.naive_utc().format(FORMAT).to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            match raw {
                None => Ok(None),
                Some(raw) => {
                    let naive = NaiveDateTime::parse_from_str(&raw, FORMAT)
                        .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S"))
                        .map_err(serde::de::Error::custom)?;
                    Ok(Some(DateTime::from_naive_utc_and_offset(naive, Utc)))
                }
            }
        }
    }
}
