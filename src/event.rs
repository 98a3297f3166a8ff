use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Kind of producer activity an entry originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Move,
    Click,
    Scroll,
    Text,
    Periodic,
}

/// Immutable unit of work flowing through the pipeline.
///
/// The payload is opaque to this crate; producers attach whatever the
/// downstream analysis layer expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub group_key: String,
    pub payload: serde_json::Value,
    pub created_at: SystemTime,
    pub event_type: EventType,
}

impl Entry {
    pub fn new(
        group_key: impl Into<String>,
        payload: serde_json::Value,
        event_type: EventType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_key: group_key.into(),
            payload,
            created_at: SystemTime::now(),
            event_type,
        }
    }

    /// Wall-clock age of this entry. Clock skew collapses to zero.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or_default()
    }
}

/// Why a buffer was closed out into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Time,
    Size,
    Activity,
    Manual,
    Shutdown,
    Stale,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Time => "time",
            FlushReason::Size => "size",
            FlushReason::Activity => "activity",
            FlushReason::Manual => "manual",
            FlushReason::Shutdown => "shutdown",
            FlushReason::Stale => "stale",
        }
    }
}

/// Immutable snapshot of a flushed buffer, handed to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub group_key: String,
    pub entries: Vec<Entry>,
    pub created_at: SystemTime,
    pub flush_reason: FlushReason,
}

impl Batch {
    pub fn new(group_key: impl Into<String>, entries: Vec<Entry>, flush_reason: FlushReason) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            group_key: group_key.into(),
            entries,
            created_at: SystemTime::now(),
            flush_reason,
        }
    }

    /// Wrap a single entry, used for the staleness and degraded paths.
    pub fn single(entry: Entry, flush_reason: FlushReason) -> Self {
        let group_key = entry.group_key.clone();
        Self::new(group_key, vec![entry], flush_reason)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split into sub-batches of at most `max_size` entries, preserving
    /// entry order. Returns the batch untouched when it already fits.
    pub fn split(self, max_size: usize) -> Vec<Batch> {
        if max_size == 0 || self.entries.len() <= max_size {
            return vec![self];
        }

        let Batch {
            group_key,
            entries,
            created_at,
            flush_reason,
            ..
        } = self;

        let mut parts = Vec::with_capacity(entries.len().div_ceil(max_size));
        let mut entries = entries.into_iter().peekable();
        while entries.peek().is_some() {
            let chunk: Vec<Entry> = entries.by_ref().take(max_size).collect();
            parts.push(Batch {
                batch_id: Uuid::new_v4(),
                group_key: group_key.clone(),
                entries: chunk,
                created_at,
                flush_reason,
            });
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(n: u64) -> Entry {
        Entry::new("mon-1", json!({ "seq": n }), EventType::Click)
    }

    #[test]
    fn test_split_preserves_order() {
        let entries: Vec<Entry> = (0..12).map(entry).collect();
        let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();

        let batch = Batch::new("mon-1", entries, FlushReason::Size);
        let parts = batch.split(5);

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 5);
        assert_eq!(parts[1].len(), 5);
        assert_eq!(parts[2].len(), 2);

        let flat: Vec<Uuid> = parts
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.id))
            .collect();
        assert_eq!(flat, ids);
    }

    #[test]
    fn test_split_small_batch_untouched() {
        let batch = Batch::new("mon-1", vec![entry(1), entry(2)], FlushReason::Time);
        let id = batch.batch_id;
        let parts = batch.split(50);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].batch_id, id);
    }

    #[test]
    fn test_entry_roundtrip() {
        let e = entry(7);
        let encoded = serde_json::to_string(&e).unwrap();
        let decoded: Entry = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, e.id);
        assert_eq!(decoded.group_key, "mon-1");
        assert_eq!(decoded.event_type, EventType::Click);
    }
}
