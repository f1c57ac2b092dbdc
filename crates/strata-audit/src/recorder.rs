//! Batching audit recorder
//!
//! `AuditRecorder` is the production `AuditSink`: `record` only enqueues
//! onto a bounded channel, and a background task flushes batches to every
//! configured writer. A full buffer drops the event with a warning instead
//! of stalling the pipeline stage that emitted it.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_core::{AuditEvent, AuditSink};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::writer::{AuditWriter, WriterError, WriterResult};

/// Configuration for the audit recorder
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Maximum events to buffer before flushing
    pub batch_size: usize,
    /// Maximum time to wait before flushing (milliseconds)
    pub batch_timeout_ms: u64,
    /// Size of the channel buffer
    pub channel_buffer_size: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_ms: 200,
            channel_buffer_size: 10_000,
        }
    }
}

pub struct AuditRecorder {
    tx: Mutex<Option<mpsc::Sender<AuditEvent>>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AuditRecorder {
    pub fn new(writers: Vec<Arc<dyn AuditWriter>>) -> Self {
        Self::with_config(writers, RecorderConfig::default())
    }

    pub fn with_config(writers: Vec<Arc<dyn AuditWriter>>, config: RecorderConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer_size.max(1));

        let worker_handle = tokio::spawn(async move {
            Self::worker_loop(rx, writers, config).await;
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker_handle: Mutex::new(Some(worker_handle)),
        }
    }

    /// Enqueue an event without waiting.
    /// Returns false if the event was dropped.
    pub fn try_record(&self, event: AuditEvent) -> bool {
        let sender = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            tracing::warn!(event_type = %event.event_type, "Audit recorder is shut down, dropping event");
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event_type = %event.event_type, "Audit buffer full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("Audit recorder channel closed");
                false
            }
        }
    }

    async fn worker_loop(
        mut rx: mpsc::Receiver<AuditEvent>,
        writers: Vec<Arc<dyn AuditWriter>>,
        config: RecorderConfig,
    ) {
        let mut buffer = Vec::with_capacity(config.batch_size);
        let mut interval =
            tokio::time::interval(Duration::from_millis(config.batch_timeout_ms.max(1)));

        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    buffer.push(event);
                    if buffer.len() >= config.batch_size {
                        Self::flush_buffer(&writers, &mut buffer).await;
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        Self::flush_buffer(&writers, &mut buffer).await;
                    }
                }
                else => {
                    // Channel closed
                    if !buffer.is_empty() {
                        Self::flush_buffer(&writers, &mut buffer).await;
                    }
                    break;
                }
            }
        }

        tracing::debug!("Audit recorder worker loop exited");
    }

    async fn flush_buffer(writers: &[Arc<dyn AuditWriter>], buffer: &mut Vec<AuditEvent>) {
        if buffer.is_empty() {
            return;
        }

        let events = std::mem::take(buffer);
        let event_count = events.len();

        let futures: Vec<_> = writers
            .iter()
            .map(|writer| {
                let writer = Arc::clone(writer);
                let events = &events;
                async move {
                    writer.write_batch(events).await?;
                    writer.flush().await
                }
            })
            .collect();

        let results = futures::future::join_all(futures).await;

        for (i, result) in results.iter().enumerate() {
            if let Err(e) = result {
                tracing::error!(
                    writer = i,
                    error = %e,
                    event_count = event_count,
                    "Failed to write audit events"
                );
            }
        }
    }

    /// Stop accepting events, flush everything buffered and wait for the worker
    pub async fn shutdown(&self) -> WriterResult<()> {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }

        let handle = match self.worker_handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };

        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| WriterError::Worker(e.to_string()))?;
            tracing::info!("Audit recorder shutdown complete");
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for AuditRecorder {
    async fn record(&self, event: AuditEvent) -> strata_core::Result<()> {
        if self.try_record(event) {
            Ok(())
        } else {
            Err(strata_core::Error::Internal(
                WriterError::ChannelSend.to_string(),
            ))
        }
    }
}

impl Drop for AuditRecorder {
    fn drop(&mut self) {
        let pending = self
            .worker_handle
            .get_mut()
            .map(|handle| handle.is_some())
            .unwrap_or(false);
        if pending {
            tracing::warn!(
                "AuditRecorder dropped without calling shutdown(). \
                 Buffered audit events may not be flushed."
            );
        }
    }
}

/// Builder for AuditRecorder
pub struct RecorderBuilder {
    writers: Vec<Arc<dyn AuditWriter>>,
    config: RecorderConfig,
}

impl RecorderBuilder {
    pub fn new() -> Self {
        Self {
            writers: Vec::new(),
            config: RecorderConfig::default(),
        }
    }

    pub fn add_writer(mut self, writer: Arc<dyn AuditWriter>) -> Self {
        self.writers.push(writer);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size.max(1);
        self
    }

    pub fn batch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.batch_timeout_ms = timeout_ms;
        self
    }

    pub fn channel_buffer_size(mut self, size: usize) -> Self {
        self.config.channel_buffer_size = size;
        self
    }

    pub fn build(self) -> AuditRecorder {
        AuditRecorder::with_config(self.writers, self.config)
    }
}

impl Default for RecorderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{AuditEmitter, AuditOutcome};

    #[derive(Default)]
    struct CollectingWriter {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl AuditWriter for CollectingWriter {
        async fn write_event(&self, event: &AuditEvent) -> WriterResult<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct BrokenWriter;

    #[async_trait]
    impl AuditWriter for BrokenWriter {
        async fn write_event(&self, _event: &AuditEvent) -> WriterResult<()> {
            Err(WriterError::Io(std::io::Error::other("disk full")))
        }
    }

    fn event(n: usize) -> AuditEvent {
        AuditEvent::new("raw_event.ingest", AuditOutcome::Success, "raw_event", n.to_string())
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffered_events() {
        let writer = Arc::new(CollectingWriter::default());
        let recorder = RecorderBuilder::new()
            .add_writer(writer.clone())
            .batch_size(1000)
            .batch_timeout_ms(60_000)
            .build();

        for n in 0..25 {
            assert!(recorder.try_record(event(n)));
        }
        recorder.shutdown().await.unwrap();

        let events = writer.events.lock().unwrap();
        assert_eq!(events.len(), 25);
        assert_eq!(events[0].resource_id, "0");
        assert_eq!(events[24].resource_id, "24");
    }

    #[tokio::test]
    async fn test_record_after_shutdown_is_rejected() {
        let recorder = AuditRecorder::new(vec![]);
        recorder.shutdown().await.unwrap();
        assert!(!recorder.try_record(event(1)));
        assert!(recorder.record(event(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_broken_writer_does_not_block_others() {
        let good = Arc::new(CollectingWriter::default());
        let recorder = AuditRecorder::new(vec![Arc::new(BrokenWriter), good.clone()]);

        let emitter = AuditEmitter::new(Arc::new(recorder));
        emitter.emit(event(7)).await;

        // Give the worker a tick to flush
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(good.events.lock().unwrap().len(), 1);
    }
}
