//! Readiness probe backed by the pipeline store

use async_trait::async_trait;
use std::sync::Arc;
use strata_core::PipelineStore;
use strata_observability::{ComponentStatus, ReadinessChecker};
use strata_pipeline::WorkerHandle;

pub struct StoreReadiness {
    store: Arc<dyn PipelineStore>,
    worker: Option<Arc<WorkerHandle>>,
}

impl StoreReadiness {
    pub fn new(store: Arc<dyn PipelineStore>, worker: Option<Arc<WorkerHandle>>) -> Self {
        Self { store, worker }
    }
}

#[async_trait]
impl ReadinessChecker for StoreReadiness {
    async fn check(&self) -> Vec<ComponentStatus> {
        let mut components = Vec::with_capacity(2);

        components.push(match self.store.ping().await {
            Ok(()) => ComponentStatus::healthy("store"),
            Err(e) => ComponentStatus::unhealthy("store", e.to_string()),
        });

        if let Some(worker) = &self.worker {
            components.push(if worker.is_running() {
                ComponentStatus::healthy("workers")
            } else {
                ComponentStatus::unhealthy("workers", "worker pool is shut down")
            });
        }

        components
    }
}
