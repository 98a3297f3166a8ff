//! Background batch dispatch.
//!
//! The scheduler owns the only code path that performs network-bound
//! work. Producers hand it batches through an unbounded queue; it splits
//! oversize batches, wraps every dispatch in a bounded timeout, retries
//! transient failures with exponential backoff, and degrades to
//! per-entry dispatch before ever dropping data. A periodic sweep pushes
//! stale entries past the batching path, prunes rate-limiter state and
//! evicts idle buffers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::buffer_manager::BufferManager;
use crate::dispatcher::{DispatchError, Dispatcher, EntryOutput};
use crate::error::{Error, Result};
use crate::event::{Batch, FlushReason};
use crate::rate_limiter::RateLimiter;
use crate::state_store::StateStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Largest batch handed to the dispatcher in one call; bigger batches
    /// are split in order.
    pub max_dispatch_size: usize,
    #[serde(with = "humantime_serde")]
    pub dispatch_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_dispatch_size: 50,
            dispatch_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_dispatch_size == 0 {
            return Err(Error::Config("max_dispatch_size must be greater than 0".into()));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(Error::Config("dispatch_timeout must be greater than 0".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("sweep_interval must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Producer-side handle to the scheduler's queue.
///
/// Pushing never blocks; the backlog gauge feeds the stats surface.
#[derive(Clone)]
pub struct BatchQueue {
    tx: mpsc::UnboundedSender<Batch>,
    backlog: Arc<AtomicUsize>,
}

impl BatchQueue {
    pub fn unbounded() -> (Self, mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                backlog: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub fn push(&self, batch: Batch) {
        self.backlog.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(batch).is_err() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!(
                target: "coalescer::scheduler",
                "batch queue closed, dropping batch"
            );
        }
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    fn mark_done(&self) {
        self.backlog.fetch_sub(1, Ordering::Relaxed);
    }
}

/// What actually happened to a dispatched batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The whole batch went through in one call.
    Batched { outputs: Vec<EntryOutput> },
    /// Bulk dispatch kept failing; entries were sent one at a time.
    Degraded {
        delivered: usize,
        failed: Vec<FailedEntry>,
    },
    /// The batch was permanently rejected.
    Rejected { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedEntry {
    pub entry_id: Uuid,
    pub error: String,
}

/// Fan-out notification for subscribers awaiting results.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchEvent {
    pub batch_id: Uuid,
    pub group_key: String,
    pub flush_reason: FlushReason,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub backlog: usize,
    pub batches_dispatched: u64,
    pub entries_dispatched: u64,
    pub entries_degraded: u64,
    pub entries_failed: u64,
}

pub struct BatchScheduler {
    config: SchedulerConfig,
    dispatcher: Arc<dyn Dispatcher>,
    store: Option<Arc<dyn StateStore>>,
    queue: BatchQueue,
    events: broadcast::Sender<DispatchEvent>,
    batches_dispatched: AtomicU64,
    entries_dispatched: AtomicU64,
    entries_degraded: AtomicU64,
    entries_failed: AtomicU64,
}

impl BatchScheduler {
    pub fn new(
        config: SchedulerConfig,
        dispatcher: Arc<dyn Dispatcher>,
        store: Option<Arc<dyn StateStore>>,
        queue: BatchQueue,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            config,
            dispatcher,
            store,
            queue,
            events,
            batches_dispatched: AtomicU64::new(0),
            entries_dispatched: AtomicU64::new(0),
            entries_degraded: AtomicU64::new(0),
            entries_failed: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            backlog: self.queue.backlog(),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            entries_dispatched: self.entries_dispatched.load(Ordering::Relaxed),
            entries_degraded: self.entries_degraded.load(Ordering::Relaxed),
            entries_failed: self.entries_failed.load(Ordering::Relaxed),
        }
    }

    /// Main dispatch loop. Runs until shutdown is signalled, then drains
    /// whatever is still queued so no flushed batch is lost.
    pub async fn run_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Batch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(batch) => {
                        self.handle_batch(batch).await;
                        self.queue.mark_done();
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    while let Ok(batch) = rx.try_recv() {
                        self.handle_batch(batch).await;
                        self.queue.mark_done();
                    }
                    break;
                }
            }
        }
        tracing::info!(target: "coalescer::scheduler", "dispatch loop stopped");
    }

    /// Periodic sweep: staleness fallback, rate-limiter cleanup, idle
    /// buffer eviction, journal compaction.
    pub async fn run_sweep(
        self: Arc<Self>,
        buffers: Arc<BufferManager>,
        rate_limiter: Arc<RateLimiter>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match buffers.take_stale() {
                        Ok(stale) => {
                            for entry in stale {
                                let batch = Batch::single(entry, FlushReason::Stale);
                                self.handle_batch(batch).await;
                            }
                        }
                        Err(e) => {
                            tracing::error!(target: "coalescer::scheduler", error = %e, "stale sweep failed");
                        }
                    }
                    if let Err(e) = rate_limiter.cleanup() {
                        tracing::error!(target: "coalescer::scheduler", error = %e, "rate limiter cleanup failed");
                    }
                    if let Err(e) = buffers.evict_idle() {
                        tracing::error!(target: "coalescer::scheduler", error = %e, "buffer eviction failed");
                    }
                    if let Some(store) = &self.store {
                        if let Err(e) = store.compact().await {
                            tracing::error!(target: "coalescer::scheduler", error = %e, "journal compaction failed");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!(target: "coalescer::scheduler", "sweep loop stopped");
    }

    async fn handle_batch(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }

        // Journal before dispatch; a write failure never blocks the
        // in-memory path.
        if let Some(store) = &self.store {
            if let Err(e) = store.journal(&batch.entries).await {
                tracing::error!(
                    target: "coalescer::scheduler",
                    batch_id = %batch.batch_id,
                    error = %e,
                    "failed to journal batch"
                );
            }
        }

        let batch_id = batch.batch_id;
        let group_key = batch.group_key.clone();
        let flush_reason = batch.flush_reason;

        for part in batch.split(self.config.max_dispatch_size) {
            let outcome = self.dispatch_with_retry(&part).await;
            self.record_outcome(&part, &outcome).await;
            let _ = self.events.send(DispatchEvent {
                batch_id,
                group_key: group_key.clone(),
                flush_reason,
                outcome,
            });
        }

        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    async fn dispatch_with_retry(&self, batch: &Batch) -> DispatchOutcome {
        let mut attempt = 0u32;
        loop {
            match self.try_send(batch).await {
                Ok(response) => {
                    return DispatchOutcome::Batched {
                        outputs: response.outputs,
                    }
                }
                Err(DispatchError::Rejected(reason)) => {
                    tracing::error!(
                        target: "coalescer::scheduler",
                        batch_id = %batch.batch_id,
                        reason = %reason,
                        "batch permanently rejected"
                    );
                    return DispatchOutcome::Rejected { reason };
                }
                Err(DispatchError::Transient(reason)) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::warn!(
                            target: "coalescer::scheduler",
                            batch_id = %batch.batch_id,
                            attempts = attempt,
                            "retries exhausted, degrading to per-entry dispatch"
                        );
                        return self.dispatch_individually(batch).await;
                    }
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        target: "coalescer::scheduler",
                        batch_id = %batch.batch_id,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        reason = %reason,
                        "transient dispatch failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Last-resort path: one dispatch attempt per entry so a single bad
    /// entry cannot sink its whole batch.
    async fn dispatch_individually(&self, batch: &Batch) -> DispatchOutcome {
        let mut delivered = 0usize;
        let mut failed: Vec<FailedEntry> = Vec::new();

        for entry in &batch.entries {
            let single = Batch::single(entry.clone(), batch.flush_reason);
            match self.try_send(&single).await {
                Ok(_) => {
                    delivered += 1;
                }
                Err(e) => {
                    tracing::error!(
                        target: "coalescer::scheduler",
                        entry_id = %entry.id,
                        group_key = %entry.group_key,
                        error = %e,
                        "entry failed in degraded dispatch"
                    );
                    failed.push(FailedEntry {
                        entry_id: entry.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        DispatchOutcome::Degraded { delivered, failed }
    }

    async fn try_send(
        &self,
        batch: &Batch,
    ) -> std::result::Result<crate::dispatcher::DispatchResponse, DispatchError> {
        match tokio::time::timeout(self.config.dispatch_timeout, self.dispatcher.send(batch)).await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Transient(format!(
                "dispatch timed out after {}s",
                self.config.dispatch_timeout.as_secs()
            ))),
        }
    }

    async fn record_outcome(&self, batch: &Batch, outcome: &DispatchOutcome) {
        let delivered_ids: Vec<Uuid> = match outcome {
            DispatchOutcome::Batched { .. } => {
                self.entries_dispatched
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                batch.entries.iter().map(|e| e.id).collect()
            }
            DispatchOutcome::Degraded { failed, .. } => {
                let failed_ids: std::collections::HashSet<Uuid> =
                    failed.iter().map(|f| f.entry_id).collect();
                self.entries_degraded
                    .fetch_add((batch.len() - failed.len()) as u64, Ordering::Relaxed);
                self.entries_failed
                    .fetch_add(failed.len() as u64, Ordering::Relaxed);
                batch
                    .entries
                    .iter()
                    .map(|e| e.id)
                    .filter(|id| !failed_ids.contains(id))
                    .collect()
            }
            DispatchOutcome::Rejected { .. } => {
                self.entries_failed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                // Permanent rejection: replaying these on restart would
                // fail again, so clear them from the journal.
                batch.entries.iter().map(|e| e.id).collect()
            }
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.mark_delivered(&delivered_ids).await {
                tracing::error!(
                    target: "coalescer::scheduler",
                    batch_id = %batch.batch_id,
                    error = %e,
                    "failed to mark entries delivered"
                );
            }
        }
    }
}
