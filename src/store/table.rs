//! Keyed record tables for violations and incidents
//!
//! A `RecordTable` holds rows keyed by id with a secondary index on status.
//! When opened on a directory it journals every insert and update as a JSON
//! line; replay applies them in order, so the last write for a key wins.
//! A torn final line is cut before replay, as in the event journal.

use crate::error::{AuditError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;

/// A row that can live in a `RecordTable`
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Primary key
    fn key(&self) -> &str;

    /// Value of the indexed status column
    fn status(&self) -> &'static str;
}

struct Rows<T> {
    rows: BTreeMap<String, T>,
    by_status: HashMap<&'static str, BTreeSet<String>>,
}

impl<T: Record> Rows<T> {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            by_status: HashMap::new(),
        }
    }

    fn put(&mut self, row: T) {
        let key = row.key().to_string();
        if let Some(old) = self.rows.get(&key) {
            if let Some(set) = self.by_status.get_mut(old.status()) {
                set.remove(&key);
            }
        }
        self.by_status
            .entry(row.status())
            .or_default()
            .insert(key.clone());
        self.rows.insert(key, row);
    }
}

/// Keyed table with a status index and optional JSONL journal
pub struct RecordTable<T: Record> {
    name: &'static str,
    journal: Option<PathBuf>,
    inner: RwLock<Rows<T>>,
}

impl<T: Record> RecordTable<T> {
    /// Table that lives only in memory
    pub fn in_memory(name: &'static str) -> Self {
        Self {
            name,
            journal: None,
            inner: RwLock::new(Rows::new()),
        }
    }

    /// Table journaled to `<dir>/<name>.jsonl`, replaying existing rows
    pub async fn open(dir: impl AsRef<Path>, name: &'static str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await.map_err(|e| {
            AuditError::StoreUnavailable(format!(
                "Failed to create {} directory {}: {}",
                name,
                dir.display(),
                e
            ))
        })?;
        let path = dir.join(format!("{}.jsonl", name));
        super::file::repair_journal_tail(&path).await?;

        let mut rows = Rows::new();
        if let Ok(file) = fs::File::open(&path).await {
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<T>(&line) {
                    Ok(row) => rows.put(row),
                    Err(e) => tracing::warn!(table = name, error = %e, "Skipping unreadable row"),
                }
            }
        }
        tracing::debug!(table = name, rows = rows.rows.len(), "Record table opened");

        Ok(Self {
            name,
            journal: Some(path),
            inner: RwLock::new(rows),
        })
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Insert a row unless its key already exists; returns whether it was added
    pub async fn insert_new(&self, row: T) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.rows.contains_key(row.key()) {
            return Ok(false);
        }
        self.persist(&row).await?;
        inner.put(row);
        Ok(true)
    }

    /// Apply `f` to an existing row and persist the result
    pub async fn update<F>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        let mut inner = self.inner.write().await;
        let mut row = inner
            .rows
            .get(key)
            .cloned()
            .ok_or_else(|| AuditError::NotFound(format!("{} '{}'", self.name, key)))?;
        f(&mut row);
        self.persist(&row).await?;
        inner.put(row.clone());
        Ok(row)
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        self.inner.read().await.rows.get(key).cloned()
    }

    /// Rows whose status column equals `status`
    pub async fn with_status(&self, status: &str) -> Vec<T> {
        let inner = self.inner.read().await;
        inner
            .by_status
            .get(status)
            .map(|keys| keys.iter().filter_map(|k| inner.rows.get(k).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn all(&self) -> Vec<T> {
        self.inner.read().await.rows.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    async fn persist(&self, row: &T) -> Result<()> {
        let Some(path) = &self.journal else {
            return Ok(());
        };
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| {
                AuditError::StoreUnavailable(format!(
                    "Failed to open {} journal {}: {}",
                    self.name,
                    path.display(),
                    e
                ))
            })?;
        file.write_all(line.as_bytes()).await.map_err(|e| {
            AuditError::Storage(format!("Failed to write {} row: {}", self.name, e))
        })?;
        file.sync_data().await.map_err(|e| {
            AuditError::Storage(format!("Failed to sync {} journal: {}", self.name, e))
        })?;
        Ok(())
    }
}
