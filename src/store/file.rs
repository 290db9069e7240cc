//! JSONL-backed durable event store
//!
//! Every batch is appended to `events.jsonl` and synced before it becomes
//! visible through the indexes. On open the journal is replayed to rebuild
//! the indexes; duplicate ids left by a retried partial write collapse
//! during replay. A torn final line left by a crash is cut off before the
//! first append so new records never merge into it. Retention pruning
//! rewrites the journal atomically via a temp file + rename.

use super::{EventIndex, EventStore};
use crate::error::{AuditError, Result};
use crate::types::{AuditEvent, EventFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;

const JOURNAL_FILE: &str = "events.jsonl";

/// Durable append-only event store
pub struct FileEventStore {
    path: PathBuf,
    index: RwLock<EventIndex>,
}

impl FileEventStore {
    /// Open (or create) the store under `dir`, replaying any existing journal
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await.map_err(|e| {
            AuditError::StoreUnavailable(format!(
                "Failed to create audit directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(JOURNAL_FILE);
        repair_journal_tail(&path).await?;
        let index = replay(&path).await?;
        tracing::info!(
            path = %path.display(),
            events = index.len(),
            "File event store opened"
        );

        Ok(Self {
            path,
            index: RwLock::new(index),
        })
    }

    /// Path of the active journal
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Truncate a JSONL journal back to its last complete line
///
/// Returns the number of bytes cut. A missing file is left alone.
pub(super) async fn repair_journal_tail(path: &Path) -> Result<u64> {
    let bytes = match fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(AuditError::StoreUnavailable(format!(
                "Failed to read journal {}: {}",
                path.display(),
                e
            )))
        }
    };
    if bytes.last().map_or(true, |b| *b == b'\n') {
        return Ok(0);
    }

    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1) as u64;
    let cut = bytes.len() as u64 - keep;
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| {
            AuditError::StoreUnavailable(format!(
                "Failed to open journal {}: {}",
                path.display(),
                e
            ))
        })?;
    file.set_len(keep)
        .await
        .map_err(|e| AuditError::Storage(format!("Failed to truncate torn journal tail: {}", e)))?;
    file.sync_data()
        .await
        .map_err(|e| AuditError::Storage(format!("Failed to sync audit journal: {}", e)))?;

    tracing::warn!(path = %path.display(), bytes = cut, "Cut torn journal tail");
    Ok(cut)
}

async fn replay(path: &Path) -> Result<EventIndex> {
    let mut index = EventIndex::new();
    let file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(e) => {
            return Err(AuditError::StoreUnavailable(format!(
                "Failed to open journal {}: {}",
                path.display(),
                e
            )))
        }
    };

    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => {
                index.insert(event);
            }
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping unreadable journal line");
            }
        }
    }
    Ok(index)
}

fn encode_lines<'a>(events: impl Iterator<Item = &'a AuditEvent>) -> Result<String> {
    let mut buf = String::new();
    for event in events {
        buf.push_str(&serde_json::to_string(event)?);
        buf.push('\n');
    }
    Ok(buf)
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append_batch(&self, events: &[AuditEvent]) -> Result<usize> {
        let mut index = self.index.write().await;

        let mut seen = std::collections::HashSet::new();
        let fresh: Vec<&AuditEvent> = events
            .iter()
            .filter(|e| !index.contains(&e.id) && seen.insert(e.id.as_str()))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let buf = encode_lines(fresh.iter().copied())?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                AuditError::StoreUnavailable(format!(
                    "Failed to open journal {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| AuditError::Storage(format!("Failed to append audit batch: {}", e)))?;
        file.sync_data()
            .await
            .map_err(|e| AuditError::Storage(format!("Failed to sync audit journal: {}", e)))?;

        let written = fresh.len();
        for event in fresh {
            index.insert(event.clone());
        }
        tracing::debug!(batch = events.len(), written, "File store appended batch");
        Ok(written)
    }

    async fn get(&self, id: &str) -> Result<Option<AuditEvent>> {
        Ok(self.index.read().await.get(id).cloned())
    }

    async fn query(&self, filter: &EventFilter, limit: usize) -> Result<Vec<AuditEvent>> {
        Ok(self.index.read().await.query(filter, limit))
    }

    async fn count_matching(&self, filter: &EventFilter) -> Result<u64> {
        Ok(self.index.read().await.count(filter))
    }

    async fn distinct_resources(&self, filter: &EventFilter) -> Result<u64> {
        Ok(self.index.read().await.distinct_resources(filter))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut index = self.index.write().await;
        let removed = index.remove_before(cutoff);
        if removed == 0 {
            return Ok(0);
        }

        let buf = encode_lines(index.chronological())?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, buf).await.map_err(|e| {
            AuditError::Storage(format!(
                "Failed to write journal {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            AuditError::Storage(format!(
                "Failed to rename journal {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::info!(removed, cutoff = %cutoff, "Pruned audit events");
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.index.read().await.len())
    }

    async fn health(&self) -> Result<bool> {
        match fs::metadata(self.path.parent().unwrap_or(&self.path)).await {
            Ok(_) => Ok(true),
            Err(e) => Err(AuditError::StoreUnavailable(format!(
                "Audit directory unreachable: {}",
                e
            ))),
        }
    }

    fn name(&self) -> &str {
        "file"
    }
}
