//! Audit writer trait

use async_trait::async_trait;
use strata_core::AuditEvent;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Recorder worker failed: {0}")]
    Worker(String),
}

pub type WriterResult<T> = Result<T, WriterError>;

/// Destination for batches of audit events
#[async_trait]
pub trait AuditWriter: Send + Sync {
    /// Write a single event
    async fn write_event(&self, event: &AuditEvent) -> WriterResult<()>;

    /// Write a batch of events
    async fn write_batch(&self, events: &[AuditEvent]) -> WriterResult<()> {
        for event in events {
            self.write_event(event).await?;
        }
        Ok(())
    }

    /// Flush any pending writes
    async fn flush(&self) -> WriterResult<()> {
        Ok(())
    }
}
