//! Outbound dispatch boundary.
//!
//! The scheduler hands finished batches to a [`Dispatcher`]; what happens
//! on the other side (bulk AI analysis, in the deployed system) is opaque
//! to this crate.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::event::Batch;

/// Dispatch failure classification. Transient failures are retried with
/// backoff; rejections are permanent and surfaced per entry.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("transient dispatch failure: {0}")]
    Transient(String),

    #[error("batch rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryOutput {
    pub entry_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResponse {
    pub outputs: Vec<EntryOutput>,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(&self, batch: &Batch) -> Result<DispatchResponse, DispatchError>;
}

/// Dispatcher that only logs what it receives. Stands in for the real
/// analysis backend when running the service without one configured.
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn send(&self, batch: &Batch) -> Result<DispatchResponse, DispatchError> {
        tracing::info!(
            target: "coalescer::dispatcher",
            batch_id = %batch.batch_id,
            group_key = %batch.group_key,
            entries = batch.len(),
            reason = batch.flush_reason.as_str(),
            "dispatching batch"
        );
        let outputs = batch
            .entries
            .iter()
            .map(|entry| EntryOutput {
                entry_id: entry.id,
                content: String::new(),
            })
            .collect();
        Ok(DispatchResponse { outputs })
    }
}
