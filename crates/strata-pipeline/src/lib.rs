//! Strata Pipeline
//!
//! This crate moves events through the three layers:
//! - Ingestion with sliding-window rate limiting and risk scoring
//! - Validation and enrichment into staging records
//! - Promotion into the business-layer entity graph
//! - The orchestrator that drives both stages per tenant
//! - A background worker pool with a periodic sweep
//!
//! The batch functions are the same whether the pipeline runs inline after
//! ingestion (`TriggerMode::Immediate`) or in the background
//! (`TriggerMode::Deferred`); only the `PipelineTrigger` handed to the
//! ingestor differs.

pub mod business;
pub mod config;
pub mod enrich;
pub mod ingest;
pub mod orchestrator;
pub mod ratelimit;
pub mod staging;
pub mod worker;

pub use business::{GraphBuilder, PromotionOutcome};
pub use config::{
    OrchestratorConfig, PipelineConfig, RateLimitConfig, RiskConfig, StagingConfig, TriggerMode,
    WorkerConfig,
};
pub use ingest::{IngestRequest, IngestResponse, Ingestor};
pub use orchestrator::{BatchReport, Orchestrator, Phase, PipelineTrigger, RunReport};
pub use ratelimit::{RateLimitDecision, RateLimiter, RiskAssessment, RiskScorer};
pub use staging::Stager;
pub use worker::{PipelineWorker, WorkerHandle};

use std::sync::Arc;
use strata_core::{AuditEmitter, PipelineStore};
use strata_observability::Metrics;

/// Orchestrator, ingestor and (optionally) worker pool wired together
pub struct Pipeline {
    orchestrator: Arc<Orchestrator>,
    ingestor: Arc<Ingestor>,
    worker: Option<Arc<WorkerHandle>>,
}

impl Pipeline {
    pub fn builder(store: Arc<dyn PipelineStore>, config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            store,
            config,
            audit: AuditEmitter::disabled(),
            metrics: None,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn worker(&self) -> Option<&Arc<WorkerHandle>> {
        self.worker.as_ref()
    }

    /// Stop the worker pool, if one was started
    pub async fn shutdown(&self) {
        if let Some(worker) = &self.worker {
            worker.shutdown().await;
        }
    }
}

pub struct PipelineBuilder {
    store: Arc<dyn PipelineStore>,
    config: PipelineConfig,
    audit: AuditEmitter,
    metrics: Option<Arc<Metrics>>,
}

impl PipelineBuilder {
    pub fn audit(mut self, audit: AuditEmitter) -> Self {
        self.audit = audit;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build without background workers.
    ///
    /// In immediate mode ingestion runs the tenant's batch inline; in
    /// deferred mode accepted events wait for `run_once` (or a worker pool
    /// in another process).
    pub fn build(self) -> Pipeline {
        let orchestrator = Arc::new(self.orchestrator());
        let trigger: Option<Arc<dyn PipelineTrigger>> = match self.config.orchestrator.trigger_mode
        {
            TriggerMode::Immediate => Some(orchestrator.clone() as Arc<dyn PipelineTrigger>),
            TriggerMode::Deferred => None,
        };
        let ingestor = Arc::new(self.ingestor(trigger));
        Pipeline {
            orchestrator,
            ingestor,
            worker: None,
        }
    }

    /// Build and start the worker pool. Must be called inside a tokio runtime.
    ///
    /// In deferred mode ingestion queues the tenant for the pool; in
    /// immediate mode the pool only runs the periodic sweep.
    pub fn spawn(self) -> Pipeline {
        let orchestrator = Arc::new(self.orchestrator());
        let rate_limiter = Arc::new(RateLimiter::new(
            self.store.clone(),
            self.config.rate_limit.clone(),
        ));
        let worker = Arc::new(PipelineWorker::spawn(
            orchestrator.clone(),
            rate_limiter,
            self.config.worker.clone(),
        ));
        let trigger: Arc<dyn PipelineTrigger> = match self.config.orchestrator.trigger_mode {
            TriggerMode::Immediate => orchestrator.clone(),
            TriggerMode::Deferred => worker.clone(),
        };
        let ingestor = Arc::new(self.ingestor(Some(trigger)));
        Pipeline {
            orchestrator,
            ingestor,
            worker: Some(worker),
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        let orchestrator = Orchestrator::new(self.store.clone(), &self.config, self.audit.clone());
        match &self.metrics {
            Some(metrics) => orchestrator.with_metrics(metrics.clone()),
            None => orchestrator,
        }
    }

    fn ingestor(&self, trigger: Option<Arc<dyn PipelineTrigger>>) -> Ingestor {
        let mut ingestor = Ingestor::new(self.store.clone(), &self.config, self.audit.clone());
        if let Some(metrics) = &self.metrics {
            ingestor = ingestor.with_metrics(metrics.clone());
        }
        if let Some(trigger) = trigger {
            ingestor = ingestor.with_trigger(trigger);
        }
        ingestor
    }
}
