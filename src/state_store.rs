//! Durable journal of pending entries.
//!
//! Write-ahead pattern: entries are appended as `pending` records before
//! dispatch and marked `delivered` afterwards. On restart, replaying the
//! journal yields exactly the undelivered entries in their original
//! order. Compaction rewrites the file with only the pending records so
//! the log does not grow without bound.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::Entry;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Append pending records for entries about to be dispatched.
    async fn journal(&self, entries: &[Entry]) -> Result<()>;

    /// Mark entries as delivered; they will not be replayed again.
    async fn mark_delivered(&self, ids: &[Uuid]) -> Result<()>;

    /// Return all undelivered entries in append order.
    async fn replay(&self) -> Result<Vec<Entry>>;

    /// Rewrite the journal, dropping delivered records.
    async fn compact(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record {
    Pending { entry: Entry },
    Delivered { id: Uuid },
}

/// Append-only JSON-lines journal on the local filesystem.
pub struct FileStore {
    path: PathBuf,
    // Serializes writers; readers also take it so compaction cannot race
    // an append.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append_records(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut lines = String::new();
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| Error::Persistence(format!("encode journal record: {e}")))?;
            lines.push_str(&line);
            lines.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::Persistence(format!("open journal {}: {e}", self.path.display())))?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| Error::Persistence(format!("append journal: {e}")))?;
        file.flush()
            .await
            .map_err(|e| Error::Persistence(format!("flush journal: {e}")))?;
        Ok(())
    }

    async fn read_pending(&self) -> Result<Vec<Entry>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "read journal {}: {e}",
                    self.path.display()
                )))
            }
        };

        let mut pending: Vec<Entry> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut delivered: HashSet<Uuid> = HashSet::new();

        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            // A torn final line from a crash mid-append is expected; skip it.
            let record: Record = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        target: "coalescer::state_store",
                        line = lineno + 1,
                        error = %e,
                        "skipping unreadable journal record"
                    );
                    continue;
                }
            };
            match record {
                Record::Pending { entry } => {
                    if seen.insert(entry.id) {
                        pending.push(entry);
                    }
                }
                Record::Delivered { id } => {
                    delivered.insert(id);
                }
            }
        }

        pending.retain(|entry| !delivered.contains(&entry.id));
        Ok(pending)
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn journal(&self, entries: &[Entry]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let records: Vec<Record> = entries
            .iter()
            .map(|entry| Record::Pending {
                entry: entry.clone(),
            })
            .collect();
        self.append_records(&records).await
    }

    async fn mark_delivered(&self, ids: &[Uuid]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let records: Vec<Record> = ids.iter().map(|id| Record::Delivered { id: *id }).collect();
        self.append_records(&records).await
    }

    async fn replay(&self) -> Result<Vec<Entry>> {
        let _guard = self.lock.lock().await;
        self.read_pending().await
    }

    async fn compact(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let pending = self.read_pending().await?;

        let mut lines = String::new();
        for entry in &pending {
            let record = Record::Pending {
                entry: entry.clone(),
            };
            let line = serde_json::to_string(&record)
                .map_err(|e| Error::Persistence(format!("encode journal record: {e}")))?;
            lines.push_str(&line);
            lines.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, lines.as_bytes())
            .await
            .map_err(|e| Error::Persistence(format!("write compacted journal: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Persistence(format!("swap compacted journal: {e}")))?;

        tracing::debug!(
            target: "coalescer::state_store",
            pending = pending.len(),
            "journal compacted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    fn entry(seq: u64) -> Entry {
        Entry::new("mon-1", json!({ "seq": seq }), EventType::Text)
    }

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("journal.jsonl"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_replay_returns_undelivered_in_order() {
        let (_dir, store) = store();
        let entries: Vec<Entry> = (0..5).map(entry).collect();
        store.journal(&entries).await.unwrap();

        // Deliver the second and fourth.
        store
            .mark_delivered(&[entries[1].id, entries[3].id])
            .await
            .unwrap();

        let pending = store.replay().await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![entries[0].id, entries[2].id, entries[4].id]);
    }

    #[tokio::test]
    async fn test_replay_empty_when_no_journal() {
        let (_dir, store) = store();
        assert!(store.replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_pending_records_replay_once() {
        let (_dir, store) = store();
        let e = entry(1);
        store.journal(std::slice::from_ref(&e)).await.unwrap();
        store.journal(std::slice::from_ref(&e)).await.unwrap();

        let pending = store.replay().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, e.id);
    }

    #[tokio::test]
    async fn test_compact_keeps_exactly_pending_set() {
        let (_dir, store) = store();
        let entries: Vec<Entry> = (0..4).map(entry).collect();
        store.journal(&entries).await.unwrap();
        store
            .mark_delivered(&[entries[0].id, entries[2].id])
            .await
            .unwrap();

        store.compact().await.unwrap();

        // After compaction, the file holds only pending records.
        let contents = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert_eq!(contents.lines().count(), 2);

        let pending = store.replay().await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![entries[1].id, entries[3].id]);
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_skipped() {
        let (_dir, store) = store();
        store.journal(&[entry(1), entry(2)]).await.unwrap();

        // Simulate a crash mid-append.
        let mut contents = tokio::fs::read_to_string(store.path()).await.unwrap();
        contents.push_str("{\"op\":\"pending\",\"entry\":{\"id\":");
        tokio::fs::write(store.path(), contents).await.unwrap();

        let pending = store.replay().await.unwrap();
        assert_eq!(pending.len(), 2);
    }
}
