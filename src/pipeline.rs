//! Wiring of the aggregation pipeline.
//!
//! A `Pipeline` is an explicitly constructed instance owning the rate
//! limiter, the optional debounce pre-stage, the per-key buffers and the
//! background scheduler, with a defined shutdown path that drains every
//! stage before the process exits. Nothing in this crate is a global.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::buffer_manager::{BufferConfig, BufferManager, BufferManagerStatus};
use crate::debouncer::{DebounceConfig, DebounceConsumer, Debouncer};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::event::Entry;
use crate::rate_limiter::{Admission, RateLimiter, RateLimiterConfig, RateLimiterStats};
use crate::scheduler::{BatchQueue, BatchScheduler, DispatchEvent, SchedulerConfig, SchedulerStats};
use crate::state_store::StateStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub rate_limiter: RateLimiterConfig,
    pub buffer: BufferConfig,
    pub debounce: DebounceConfig,
    pub scheduler: SchedulerConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.rate_limiter.validate()?;
        self.buffer.validate()?;
        self.debounce.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }

    /// Load from a JSON file; missing fields fall back to defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let config: PipelineConfig = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }
}

/// Bridges debounced deliveries into the buffer stage.
struct BufferSink {
    buffers: Arc<BufferManager>,
}

#[async_trait]
impl DebounceConsumer for BufferSink {
    async fn deliver(&self, group_key: &str, entries: Vec<Entry>) {
        for entry in entries {
            if let Err(e) = self.buffers.enqueue(entry) {
                tracing::error!(
                    target: "coalescer::pipeline",
                    group_key,
                    error = %e,
                    "failed to enqueue debounced entry"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub rate_limiter: RateLimiterStats,
    pub buffers: BufferManagerStatus,
    pub scheduler: SchedulerStats,
}

pub struct Pipeline {
    rate_limiter: Arc<RateLimiter>,
    buffers: Arc<BufferManager>,
    debouncer: Option<Arc<Debouncer>>,
    scheduler: Arc<BatchScheduler>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build and start a pipeline. Replays any undelivered journal
    /// entries into the buffers before background dispatch begins.
    pub async fn new(
        config: PipelineConfig,
        dispatcher: Arc<dyn Dispatcher>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone())?);
        let (queue, rx) = BatchQueue::unbounded();
        let buffers = BufferManager::new(config.buffer.clone(), queue.clone())?;
        let scheduler = Arc::new(BatchScheduler::new(
            config.scheduler.clone(),
            dispatcher,
            store.clone(),
            queue,
        )?);

        let debouncer = if config.debounce.enabled {
            let sink = Arc::new(BufferSink {
                buffers: Arc::clone(&buffers),
            });
            Some(Arc::new(Debouncer::new(&config.debounce, sink)?))
        } else {
            None
        };

        // Crash recovery: undelivered entries re-enter the buffers ahead
        // of any new producer traffic. Old entries go straight out
        // through the staleness path on the first sweep.
        if let Some(store) = &store {
            let pending = store.replay().await?;
            if !pending.is_empty() {
                tracing::info!(
                    target: "coalescer::pipeline",
                    count = pending.len(),
                    "replaying undelivered entries from journal"
                );
                for entry in pending {
                    buffers.enqueue(entry)?;
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(Arc::clone(&scheduler).run_loop(rx, shutdown_rx.clone()));
        let sweep = tokio::spawn(Arc::clone(&scheduler).run_sweep(
            Arc::clone(&buffers),
            Arc::clone(&rate_limiter),
            shutdown_rx,
        ));

        Ok(Arc::new(Self {
            rate_limiter,
            buffers,
            debouncer,
            scheduler,
            shutdown_tx,
            tasks: Mutex::new(vec![run, sweep]),
        }))
    }

    /// Rate-limit admission for an endpoint key. Independent of the
    /// buffering path; callers compose the two as needed.
    pub fn admit(&self, endpoint: &str) -> Result<Admission> {
        self.rate_limiter.admit(endpoint)
    }

    /// Feed an accepted entry into the aggregation stages.
    pub fn ingest(&self, entry: Entry) -> Result<()> {
        match &self.debouncer {
            Some(debouncer) => debouncer.submit(entry),
            None => self.buffers.enqueue(entry),
        }
    }

    /// Flush one key's buffer, or every buffer when `key` is `None`.
    /// Returns the number of batches queued.
    pub fn force_flush(&self, key: Option<&str>) -> Result<usize> {
        match key {
            Some(key) => Ok(self.buffers.force_flush(key)?.map_or(0, |_| 1)),
            None => Ok(self.buffers.force_flush_all()?.len()),
        }
    }

    /// Reset one endpoint's rate-limit window, or all of them.
    pub fn reset_rate_limit(&self, endpoint: Option<&str>) -> Result<()> {
        match endpoint {
            Some(endpoint) => self.rate_limiter.reset(endpoint),
            None => self.rate_limiter.reset_all(),
        }
    }

    /// Subscribe to dispatch results for fan-out to callers.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.scheduler.subscribe()
    }

    pub fn stats(&self) -> Result<PipelineStats> {
        Ok(PipelineStats {
            rate_limiter: self.rate_limiter.stats()?,
            buffers: self.buffers.status()?,
            scheduler: self.scheduler.stats(),
        })
    }

    /// Drain every stage and stop the background tasks. No pending
    /// entry is dropped: debounced entries flow into the buffers, the
    /// buffers drain into the queue, and the dispatch loop empties the
    /// queue before exiting.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(target: "coalescer::pipeline", "pipeline shutting down");

        if let Some(debouncer) = &self.debouncer {
            debouncer.flush_all().await?;
        }
        let drained = self.buffers.drain()?;
        if drained > 0 {
            tracing::info!(
                target: "coalescer::pipeline",
                batches = drained,
                "drained buffers on shutdown"
            );
        }

        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(target: "coalescer::pipeline", error = %e, "background task panicked");
            }
        }
        Ok(())
    }
}
