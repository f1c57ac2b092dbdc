//! Background worker pool
//!
//! `pool_size` workers consume a bounded queue of tenant ids fed by the
//! ingestion path; a sweep task runs `run_if_needed` over all tenants on an
//! interval to pick up anything the queue missed (dropped notifications,
//! retries coming due, crashes), and prunes the rate-limit log.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use strata_core::TenantId;

use crate::config::WorkerConfig;
use crate::orchestrator::{Orchestrator, PipelineTrigger};
use crate::ratelimit::RateLimiter;

pub struct PipelineWorker;

impl PipelineWorker {
    /// Spawn the worker tasks and the sweep task
    pub fn spawn(
        orchestrator: Arc<Orchestrator>,
        rate_limiter: Arc<RateLimiter>,
        config: WorkerConfig,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::channel::<TenantId>(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));

        let mut tasks = Vec::with_capacity(config.pool_size + 1);
        for worker_id in 0..config.pool_size {
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                orchestrator.clone(),
                rx.clone(),
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(sweep_loop(
            orchestrator,
            rate_limiter,
            config.clone(),
            shutdown_rx,
        )));

        tracing::info!(
            pool_size = config.pool_size,
            sweep_interval_secs = config.sweep_interval_secs,
            "Pipeline workers started"
        );

        WorkerHandle {
            tx,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }
}

/// Handle to a running worker pool
pub struct WorkerHandle {
    tx: mpsc::Sender<TenantId>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Queue a tenant for processing. Never blocks; returns `false` if the
    /// queue is full or the pool has shut down (the sweep will catch up).
    pub fn notify(&self, tenant_id: TenantId) -> bool {
        match self.tx.try_send(tenant_id) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(tenant_id = %tenant_id, "Worker queue full, notification dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(tenant_id = %tenant_id, "Worker pool stopped, notification dropped");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    /// Signal every task to stop and wait for them. Batches in flight finish first.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Pipeline worker task panicked");
            }
        }
        tracing::info!("Pipeline workers stopped");
    }
}

#[async_trait]
impl PipelineTrigger for WorkerHandle {
    async fn on_ingested(&self, tenant_id: TenantId) {
        self.notify(tenant_id);
    }
}

async fn worker_loop(
    worker_id: usize,
    orchestrator: Arc<Orchestrator>,
    rx: Arc<Mutex<mpsc::Receiver<TenantId>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                tenant_id = rx.recv() => tenant_id,
                _ = shutdown.changed() => None,
            }
        };

        let Some(tenant_id) = next else {
            break;
        };

        match orchestrator.run_tenant(tenant_id).await {
            Ok(report) if report.skipped => {
                tracing::trace!(worker_id, tenant_id = %tenant_id, "Tenant busy, skipped");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(worker_id, tenant_id = %tenant_id, error = %e, "Worker batch failed");
            }
        }
    }
    tracing::debug!(worker_id, "Pipeline worker exiting");
}

async fn sweep_loop(
    orchestrator: Arc<Orchestrator>,
    rate_limiter: Arc<RateLimiter>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = config.sweep_interval();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(interval) => {
                match orchestrator.run_if_needed(None).await {
                    Ok(report) if !report.is_empty() => {
                        tracing::info!(
                            tenants = report.batches.len(),
                            raw_processed = report.raw_processed(),
                            promoted = report.promoted(),
                            errors = report.errors(),
                            "Sweep complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Sweep failed"),
                }

                if let Err(e) = orchestrator.status(None).await {
                    tracing::warn!(error = %e, "Failed to refresh backlog gauges");
                }

                match rate_limiter.prune(Utc::now()).await {
                    Ok(0) => {}
                    Ok(pruned) => tracing::debug!(pruned, "Pruned rate limit log"),
                    Err(e) => tracing::warn!(error = %e, "Failed to prune rate limit log"),
                }
            }
        }
    }
    tracing::debug!("Sweep task exiting");
}
