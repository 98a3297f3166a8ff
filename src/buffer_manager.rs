//! Per-key accumulation of entries into flushable buffers.
//!
//! Each group key owns an independent buffer with three flush triggers:
//! a time window, a size cap, and a count of significant activity.
//! Whichever fires first closes the buffer into a batch that is queued
//! for the scheduler; enqueue itself never touches the network.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::event::{Batch, Entry, EventType, FlushReason};
use crate::scheduler::BatchQueue;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// How long a buffer may collect before its time trigger fires.
    #[serde(with = "humantime_serde")]
    pub time_cap: Duration,
    /// Entry count that forces an immediate flush.
    pub size_cap: usize,
    /// Significant-entry count that triggers an activity flush.
    pub activity_cap: u32,
    /// Minimum spacing between consecutive activity flushes.
    #[serde(with = "humantime_serde")]
    pub activity_cooldown: Duration,
    /// Event types that count toward the activity trigger.
    pub significant: HashSet<EventType>,
    /// Entries older than this bypass batching entirely.
    #[serde(with = "humantime_serde")]
    pub staleness: Duration,
    /// Idle empty buffers are evicted after this long.
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            time_cap: Duration::from_secs(300),
            size_cap: 150,
            activity_cap: 3,
            activity_cooldown: Duration::from_secs(30),
            significant: HashSet::from([EventType::Click, EventType::Scroll, EventType::Text]),
            staleness: Duration::from_secs(300),
            idle_ttl: Duration::from_secs(900),
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.time_cap.is_zero() {
            return Err(Error::Config("time_cap must be greater than 0".into()));
        }
        if self.size_cap == 0 {
            return Err(Error::Config("size_cap must be greater than 0".into()));
        }
        if self.activity_cap == 0 {
            return Err(Error::Config("activity_cap must be greater than 0".into()));
        }
        if self.staleness.is_zero() {
            return Err(Error::Config("staleness must be greater than 0".into()));
        }
        Ok(())
    }
}

struct Buffer {
    entries: Vec<Entry>,
    window_start: Instant,
    activity_count: u32,
    last_flush: Option<Instant>,
    last_touched: Instant,
    evicted: bool,
}

impl Buffer {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            entries: Vec::new(),
            window_start: now,
            activity_count: 0,
            last_flush: None,
            last_touched: now,
            evicted: false,
        }
    }
}

/// Close out a buffer into a batch and reset its window.
///
/// Resets the window even when the buffer is empty so an expired time
/// trigger does not refire immediately.
fn flush_buffer(buffer: &mut Buffer, group_key: &str, reason: FlushReason) -> Option<Batch> {
    let now = Instant::now();
    buffer.window_start = now;
    buffer.activity_count = 0;
    buffer.last_flush = Some(now);

    if buffer.entries.is_empty() {
        return None;
    }

    let entries = std::mem::take(&mut buffer.entries);
    tracing::info!(
        target: "coalescer::buffer_manager",
        group_key,
        count = entries.len(),
        reason = reason.as_str(),
        "flushing buffer"
    );
    Some(Batch::new(group_key, entries, reason))
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub group_key: String,
    pub len: usize,
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
    pub activity_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferManagerStatus {
    pub total_buffers: usize,
    pub total_entries: usize,
    pub buffers: Vec<BufferStatus>,
}

pub struct BufferManager {
    config: BufferConfig,
    buffers: RwLock<HashMap<String, Arc<Mutex<Buffer>>>>,
    queue: BatchQueue,
}

impl BufferManager {
    pub fn new(config: BufferConfig, queue: BatchQueue) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            buffers: RwLock::new(HashMap::new()),
            queue,
        }))
    }

    /// Add an entry to its group's buffer, firing whichever flush
    /// trigger it completes. Synchronous: the resulting batch is queued
    /// for the scheduler, never dispatched inline.
    pub fn enqueue(self: &Arc<Self>, entry: Entry) -> Result<()> {
        let key = entry.group_key.clone();
        let buffer = self.buffer_for(&key)?;

        let mut queued: Vec<Batch> = Vec::new();
        {
            let mut buf = buffer
                .lock()
                .map_err(|_| Error::Internal("buffer lock poisoned".into()))?;

            // Guard against a cap lowered at runtime: never insert past it.
            if buf.entries.len() >= self.config.size_cap {
                queued.extend(flush_buffer(&mut buf, &key, FlushReason::Size));
            }

            let significant = self.config.significant.contains(&entry.event_type);
            buf.entries.push(entry);
            if significant {
                buf.activity_count += 1;
            }
            buf.last_touched = Instant::now();

            if buf.entries.len() >= self.config.size_cap {
                queued.extend(flush_buffer(&mut buf, &key, FlushReason::Size));
            } else if buf.activity_count >= self.config.activity_cap
                && buf
                    .last_flush
                    .map_or(true, |t| t.elapsed() >= self.config.activity_cooldown)
            {
                queued.extend(flush_buffer(&mut buf, &key, FlushReason::Activity));
            } else {
                // Anything that has already waited past the staleness
                // threshold skips the batch path.
                for stale in take_stale_locked(&mut buf, &self.config) {
                    queued.push(Batch::single(stale, FlushReason::Stale));
                }
            }
        }

        for batch in queued {
            self.queue.push(batch);
        }
        Ok(())
    }

    fn buffer_for(self: &Arc<Self>, key: &str) -> Result<Arc<Mutex<Buffer>>> {
        {
            let buffers = self
                .buffers
                .read()
                .map_err(|_| Error::Internal("buffer map lock poisoned".into()))?;
            if let Some(buffer) = buffers.get(key) {
                return Ok(Arc::clone(buffer));
            }
        }

        let mut buffers = self
            .buffers
            .write()
            .map_err(|_| Error::Internal("buffer map lock poisoned".into()))?;
        if let Some(buffer) = buffers.get(key) {
            return Ok(Arc::clone(buffer));
        }

        let buffer = Arc::new(Mutex::new(Buffer::new()));
        buffers.insert(key.to_string(), Arc::clone(&buffer));
        tracing::debug!(target: "coalescer::buffer_manager", group_key = key, "buffer created");

        // One lightweight task per active key drives its time trigger.
        let time_cap = self.config.time_cap;
        let queue = self.queue.clone();
        let task_key = key.to_string();
        let task_buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            loop {
                let deadline = match task_buffer.lock() {
                    Ok(buf) => {
                        if buf.evicted {
                            break;
                        }
                        buf.window_start + time_cap
                    }
                    Err(_) => break,
                };
                tokio::time::sleep_until(deadline).await;

                let batch = match task_buffer.lock() {
                    Ok(mut buf) => {
                        if buf.evicted {
                            break;
                        }
                        if buf.window_start.elapsed() >= time_cap {
                            flush_buffer(&mut buf, &task_key, FlushReason::Time)
                        } else {
                            None
                        }
                    }
                    Err(_) => break,
                };
                if let Some(batch) = batch {
                    queue.push(batch);
                }
            }
        });

        Ok(buffer)
    }

    /// Flush one key on demand. Returns the batch that was queued, if
    /// the buffer held anything.
    pub fn force_flush(&self, key: &str) -> Result<Option<Batch>> {
        let buffer = {
            let buffers = self
                .buffers
                .read()
                .map_err(|_| Error::Internal("buffer map lock poisoned".into()))?;
            buffers.get(key).cloned()
        };
        let Some(buffer) = buffer else {
            return Ok(None);
        };

        let batch = {
            let mut buf = buffer
                .lock()
                .map_err(|_| Error::Internal("buffer lock poisoned".into()))?;
            flush_buffer(&mut buf, key, FlushReason::Manual)
        };
        if let Some(batch) = &batch {
            self.queue.push(batch.clone());
        }
        Ok(batch)
    }

    /// Flush every non-empty buffer on demand.
    pub fn force_flush_all(&self) -> Result<Vec<Batch>> {
        self.flush_everything(FlushReason::Manual)
    }

    /// Drain all buffers ahead of process exit. Every entry still held
    /// is queued, trigger state notwithstanding.
    pub fn drain(&self) -> Result<usize> {
        let batches = self.flush_everything(FlushReason::Shutdown)?;
        Ok(batches.len())
    }

    fn flush_everything(&self, reason: FlushReason) -> Result<Vec<Batch>> {
        let buffers: Vec<(String, Arc<Mutex<Buffer>>)> = {
            let map = self
                .buffers
                .read()
                .map_err(|_| Error::Internal("buffer map lock poisoned".into()))?;
            map.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        let mut flushed = Vec::new();
        for (key, buffer) in buffers {
            let batch = {
                let mut buf = buffer
                    .lock()
                    .map_err(|_| Error::Internal("buffer lock poisoned".into()))?;
                flush_buffer(&mut buf, &key, reason)
            };
            if let Some(batch) = batch {
                self.queue.push(batch.clone());
                flushed.push(batch);
            }
        }
        Ok(flushed)
    }

    /// Pull every entry that has exceeded the staleness threshold out of
    /// its buffer, preserving the order of what remains. Called from the
    /// periodic sweep.
    pub fn take_stale(&self) -> Result<Vec<Entry>> {
        let buffers: Vec<Arc<Mutex<Buffer>>> = {
            let map = self
                .buffers
                .read()
                .map_err(|_| Error::Internal("buffer map lock poisoned".into()))?;
            map.values().cloned().collect()
        };

        let mut stale = Vec::new();
        for buffer in buffers {
            let mut buf = buffer
                .lock()
                .map_err(|_| Error::Internal("buffer lock poisoned".into()))?;
            stale.extend(take_stale_locked(&mut buf, &self.config));
        }
        Ok(stale)
    }

    /// Evict buffers that are empty and untouched beyond the idle TTL,
    /// stopping their timer tasks.
    pub fn evict_idle(&self) -> Result<usize> {
        let mut map = self
            .buffers
            .write()
            .map_err(|_| Error::Internal("buffer map lock poisoned".into()))?;

        let before = map.len();
        map.retain(|key, buffer| {
            let Ok(mut buf) = buffer.lock() else {
                return false;
            };
            let idle = buf.entries.is_empty() && buf.last_touched.elapsed() >= self.config.idle_ttl;
            if idle {
                buf.evicted = true;
                tracing::debug!(
                    target: "coalescer::buffer_manager",
                    group_key = %key,
                    "evicting idle buffer"
                );
            }
            !idle
        });
        Ok(before - map.len())
    }

    pub fn status(&self) -> Result<BufferManagerStatus> {
        let map = self
            .buffers
            .read()
            .map_err(|_| Error::Internal("buffer map lock poisoned".into()))?;

        let mut buffers = Vec::with_capacity(map.len());
        let mut total_entries = 0;
        for (key, buffer) in map.iter() {
            let buf = buffer
                .lock()
                .map_err(|_| Error::Internal("buffer lock poisoned".into()))?;
            let elapsed = buf.window_start.elapsed();
            total_entries += buf.entries.len();
            buffers.push(BufferStatus {
                group_key: key.clone(),
                len: buf.entries.len(),
                elapsed_secs: elapsed.as_secs(),
                remaining_secs: self.config.time_cap.saturating_sub(elapsed).as_secs(),
                activity_count: buf.activity_count,
            });
        }
        buffers.sort_by(|a, b| a.group_key.cmp(&b.group_key));

        Ok(BufferManagerStatus {
            total_buffers: map.len(),
            total_entries,
            buffers,
        })
    }

    pub fn staleness(&self) -> Duration {
        self.config.staleness
    }
}

fn take_stale_locked(buffer: &mut Buffer, config: &BufferConfig) -> Vec<Entry> {
    if buffer.entries.is_empty() {
        return Vec::new();
    }
    let has_stale = buffer
        .entries
        .iter()
        .any(|entry| entry.age() > config.staleness);
    if !has_stale {
        return Vec::new();
    }

    let drained = std::mem::take(&mut buffer.entries);
    let (stale, keep): (Vec<Entry>, Vec<Entry>) = drained
        .into_iter()
        .partition(|entry| entry.age() > config.staleness);
    buffer.entries = keep;
    buffer.activity_count = buffer
        .entries
        .iter()
        .filter(|entry| config.significant.contains(&entry.event_type))
        .count() as u32;
    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::SystemTime;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn entry(key: &str, seq: u64, event_type: EventType) -> Entry {
        Entry::new(key, json!({ "seq": seq }), event_type)
    }

    fn aged_entry(key: &str, age: Duration) -> Entry {
        let mut e = entry(key, 0, EventType::Periodic);
        e.created_at = SystemTime::now() - age;
        e
    }

    fn manager(config: BufferConfig) -> (Arc<BufferManager>, UnboundedReceiver<Batch>) {
        let (queue, rx) = BatchQueue::unbounded();
        (BufferManager::new(config, queue).unwrap(), rx)
    }

    fn small_config() -> BufferConfig {
        BufferConfig {
            time_cap: Duration::from_secs(5),
            size_cap: 10,
            activity_cap: 100,
            ..BufferConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_then_remainder_on_time() {
        // 12 entries against size_cap=10, time_cap=5s: a batch of 10 on
        // the size trigger, then the trailing 2 on the time trigger.
        let (manager, mut rx) = manager(small_config());
        for seq in 0..12 {
            manager.enqueue(entry("mon-1", seq, EventType::Move)).unwrap();
        }

        let first = rx.try_recv().unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first.flush_reason, FlushReason::Size);
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(6)).await;
        let second = rx.try_recv().unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second.flush_reason, FlushReason::Time);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_never_exceeds_size_cap() {
        let (manager, mut rx) = manager(small_config());
        for seq in 0..35 {
            manager.enqueue(entry("mon-1", seq, EventType::Move)).unwrap();
            let status = manager.status().unwrap();
            assert!(status.buffers[0].len < 10);
        }
        while let Ok(batch) = rx.try_recv() {
            assert!(batch.len() <= 10);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_order_preserved_within_key() {
        let (manager, mut rx) = manager(small_config());
        for seq in 0..10 {
            manager.enqueue(entry("mon-1", seq, EventType::Move)).unwrap();
        }
        let batch = rx.try_recv().unwrap();
        let seqs: Vec<u64> = batch
            .entries
            .iter()
            .map(|e| e.payload["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_trigger_counts_significant_only() {
        let config = BufferConfig {
            time_cap: Duration::from_secs(600),
            size_cap: 100,
            activity_cap: 3,
            activity_cooldown: Duration::ZERO,
            ..BufferConfig::default()
        };
        let (manager, mut rx) = manager(config);

        // Moves are not significant: no flush however many arrive.
        for seq in 0..5 {
            manager.enqueue(entry("mon-1", seq, EventType::Move)).unwrap();
        }
        assert!(rx.try_recv().is_err());

        manager.enqueue(entry("mon-1", 5, EventType::Click)).unwrap();
        manager.enqueue(entry("mon-1", 6, EventType::Click)).unwrap();
        assert!(rx.try_recv().is_err());
        manager.enqueue(entry("mon-1", 7, EventType::Click)).unwrap();

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.flush_reason, FlushReason::Activity);
        assert_eq!(batch.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_cooldown_spaces_flushes() {
        let config = BufferConfig {
            time_cap: Duration::from_secs(600),
            size_cap: 100,
            activity_cap: 2,
            activity_cooldown: Duration::from_secs(30),
            ..BufferConfig::default()
        };
        let (manager, mut rx) = manager(config);

        manager.enqueue(entry("mon-1", 0, EventType::Click)).unwrap();
        manager.enqueue(entry("mon-1", 1, EventType::Click)).unwrap();
        assert_eq!(rx.try_recv().unwrap().flush_reason, FlushReason::Activity);

        // Threshold reached again inside the cooldown: held back.
        manager.enqueue(entry("mon-1", 2, EventType::Click)).unwrap();
        manager.enqueue(entry("mon-1", 3, EventType::Click)).unwrap();
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(31)).await;
        manager.enqueue(entry("mon-1", 4, EventType::Click)).unwrap();
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.flush_reason, FlushReason::Activity);
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_buffer_independently() {
        let (manager, mut rx) = manager(small_config());
        for seq in 0..10 {
            manager.enqueue(entry("mon-1", seq, EventType::Move)).unwrap();
            manager.enqueue(entry("mon-2", seq, EventType::Move)).unwrap();
        }
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_ne!(first.group_key, second.group_key);
        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush_returns_batch() {
        let (manager, mut rx) = manager(small_config());
        manager.enqueue(entry("mon-1", 0, EventType::Move)).unwrap();

        let batch = manager.force_flush("mon-1").unwrap().unwrap();
        assert_eq!(batch.flush_reason, FlushReason::Manual);
        assert_eq!(batch.len(), 1);
        assert_eq!(rx.try_recv().unwrap().batch_id, batch.batch_id);

        assert!(manager.force_flush("mon-1").unwrap().is_none());
        assert!(manager.force_flush("absent").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_flushes_everything_as_shutdown() {
        let (manager, mut rx) = manager(small_config());
        manager.enqueue(entry("mon-1", 0, EventType::Move)).unwrap();
        manager.enqueue(entry("mon-2", 0, EventType::Move)).unwrap();

        assert_eq!(manager.drain().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap().flush_reason, FlushReason::Shutdown);
        assert_eq!(rx.try_recv().unwrap().flush_reason, FlushReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_bypasses_batching_on_enqueue() {
        let (manager, mut rx) = manager(small_config());
        manager
            .enqueue(aged_entry("mon-1", Duration::from_secs(600)))
            .unwrap();

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.flush_reason, FlushReason::Stale);
        assert_eq!(batch.len(), 1);
        assert_eq!(manager.status().unwrap().total_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_stale_keeps_fresh_entries() {
        let (manager, _rx) = manager(small_config());
        manager.enqueue(entry("mon-1", 0, EventType::Move)).unwrap();
        assert_eq!(manager.status().unwrap().buffers[0].len, 1);

        let stale = manager.take_stale().unwrap();
        assert!(stale.is_empty());
        assert_eq!(manager.status().unwrap().total_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_spares_active_buffers() {
        let config = BufferConfig {
            idle_ttl: Duration::from_secs(10),
            time_cap: Duration::from_secs(2),
            ..BufferConfig::default()
        };
        let (manager, _rx) = manager(config);

        manager.enqueue(entry("idle", 0, EventType::Move)).unwrap();
        manager.force_flush("idle").unwrap();

        // Time passes; the flushed buffer sits empty.
        tokio::time::sleep(Duration::from_secs(11)).await;
        manager.enqueue(entry("busy", 0, EventType::Move)).unwrap();

        assert_eq!(manager.evict_idle().unwrap(), 1);
        let status = manager.status().unwrap();
        assert_eq!(status.total_buffers, 1);
        assert_eq!(status.buffers[0].group_key, "busy");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (queue, _rx) = BatchQueue::unbounded();
        let config = BufferConfig {
            size_cap: 0,
            ..BufferConfig::default()
        };
        assert!(BufferManager::new(config, queue).is_err());
    }
}
