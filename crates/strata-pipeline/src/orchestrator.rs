//! Pipeline orchestrator
//!
//! Drives Raw -> Staging -> Business for one tenant at a time:
//!
//! ```text
//! IDLE -> STAGING (raw -> staging) -> PROMOTING (staging -> business) -> IDLE
//! ```
//!
//! Batches are bounded by item counts and a deadline; a batch that runs out
//! of time returns what it finished, and the next run picks up the rest.
//! At most one batch runs per tenant at a time (an overlapping call is
//! reported as skipped); different tenants run concurrently.
//!
//! Failures are isolated per record. Transient raw-processing failures are
//! retried with exponential backoff and parked in ERROR once retries are
//! exhausted; promotion failures are counted on the staging record, which is
//! parked after too many attempts or on an invariant violation.

use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::Instrument;

use strata_core::{
    AuditEmitter, AuditEvent, AuditOutcome, Error, PipelineStore, Result, TenantId,
    types::{PipelineStatus, RawEvent, StagingRecord, ValidationStatus},
};
use strata_observability::Metrics;

use crate::business::GraphBuilder;
use crate::config::{OrchestratorConfig, PipelineConfig};
use crate::staging::Stager;

const ACTOR: &str = "system:orchestrator";

/// Receives a notification after every accepted ingestion.
///
/// The orchestrator implements it by running the tenant's batch inline
/// (immediate mode); the worker handle implements it by queueing the tenant
/// (deferred mode).
#[async_trait]
pub trait PipelineTrigger: Send + Sync {
    async fn on_ingested(&self, tenant_id: TenantId);
}

/// What a tenant's batch is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Staging,
    Promoting,
}

/// Counts of one tenant batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub tenant_id: TenantId,
    /// Another batch for the tenant was already running
    pub skipped: bool,
    /// The deadline expired before the batch finished
    pub timed_out: bool,

    pub raw_fetched: u64,
    pub raw_processed: u64,
    pub staged_valid: u64,
    pub staged_invalid: u64,
    pub staged_suspicious: u64,
    pub raw_retried: u64,
    pub raw_errored: u64,

    pub staging_fetched: u64,
    pub promoted: u64,
    pub promotion_failed: u64,
    pub promotion_parked: u64,

    pub duration_ms: u64,
}

impl BatchReport {
    fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            skipped: false,
            timed_out: false,
            raw_fetched: 0,
            raw_processed: 0,
            staged_valid: 0,
            staged_invalid: 0,
            staged_suspicious: 0,
            raw_retried: 0,
            raw_errored: 0,
            staging_fetched: 0,
            promoted: 0,
            promotion_failed: 0,
            promotion_parked: 0,
            duration_ms: 0,
        }
    }

    fn skipped(tenant_id: TenantId) -> Self {
        Self {
            skipped: true,
            ..Self::new(tenant_id)
        }
    }
}

/// A tenant whose batch could not run at all (e.g. the store was unreachable)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantFailure {
    pub tenant_id: TenantId,
    pub error: String,
}

/// Aggregate of a run over one or more tenants
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub batches: Vec<BatchReport>,
    pub failures: Vec<TenantFailure>,
}

impl RunReport {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty() && self.failures.is_empty()
    }

    pub fn raw_processed(&self) -> u64 {
        self.batches.iter().map(|b| b.raw_processed).sum()
    }

    pub fn promoted(&self) -> u64 {
        self.batches.iter().map(|b| b.promoted).sum()
    }

    /// Records that failed in this run (retried, errored or failed promotion)
    pub fn errors(&self) -> u64 {
        self.batches
            .iter()
            .map(|b| b.raw_retried + b.raw_errored + b.promotion_failed)
            .sum()
    }

    pub fn timed_out(&self) -> bool {
        self.batches.iter().any(|b| b.timed_out)
    }
}

/// Resets a tenant's phase to idle when the batch ends, however it ends
struct PhaseGuard<'a> {
    phases: &'a DashMap<TenantId, Phase>,
    tenant_id: TenantId,
}

impl<'a> PhaseGuard<'a> {
    fn new(phases: &'a DashMap<TenantId, Phase>, tenant_id: TenantId) -> Self {
        Self { phases, tenant_id }
    }

    fn set(&self, phase: Phase) {
        self.phases.insert(self.tenant_id, phase);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phases.remove(&self.tenant_id);
    }
}

pub struct Orchestrator {
    store: Arc<dyn PipelineStore>,
    stager: Stager,
    builder: GraphBuilder,
    config: OrchestratorConfig,
    promote_suspicious: bool,
    audit: AuditEmitter,
    metrics: Option<Arc<Metrics>>,
    locks: DashMap<TenantId, Arc<Mutex<()>>>,
    phases: DashMap<TenantId, Phase>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn PipelineStore>, config: &PipelineConfig, audit: AuditEmitter) -> Self {
        Self {
            stager: Stager::new(store.clone(), config.staging.clone()),
            builder: GraphBuilder::new(store.clone()),
            store,
            config: config.orchestrator.clone(),
            promote_suspicious: config.staging.promote_suspicious,
            audit,
            metrics: None,
            locks: DashMap::new(),
            phases: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    /// Current phase of a tenant's batch
    pub fn phase(&self, tenant_id: TenantId) -> Phase {
        self.phases
            .get(&tenant_id)
            .map(|phase| *phase)
            .unwrap_or(Phase::Idle)
    }

    /// Run one bounded batch for the given tenant, or for every known tenant
    pub async fn run_once(&self, scope: Option<TenantId>) -> Result<RunReport> {
        let tenants = match scope {
            Some(tenant_id) => vec![tenant_id],
            None => {
                let mut tenants: BTreeSet<TenantId> = self
                    .store
                    .list_tenants()
                    .await?
                    .into_iter()
                    .map(|t| t.tenant_id)
                    .collect();
                tenants.extend(self.backlog().await?);
                tenants.into_iter().collect()
            }
        };
        Ok(self.run_tenants(tenants).await)
    }

    /// Like `run_once`, but only for tenants that have work due
    pub async fn run_if_needed(&self, scope: Option<TenantId>) -> Result<RunReport> {
        let tenants: Vec<TenantId> = self
            .backlog()
            .await?
            .into_iter()
            .filter(|tenant_id| scope.is_none_or(|scoped| scoped == *tenant_id))
            .collect();

        if tenants.is_empty() {
            tracing::trace!("No backlog, nothing to run");
            return Ok(RunReport::default());
        }
        Ok(self.run_tenants(tenants).await)
    }

    /// Run one bounded batch for a tenant. Returns a skipped report if a
    /// batch for the tenant is already running.
    pub async fn run_tenant(&self, tenant_id: TenantId) -> Result<BatchReport> {
        let lock = self.locks.entry(tenant_id).or_default().clone();
        let Ok(_guard) = lock.try_lock_owned() else {
            tracing::debug!(tenant_id = %tenant_id, "Batch already running, skipping");
            return Ok(BatchReport::skipped(tenant_id));
        };

        let span = tracing::info_span!("pipeline_batch", tenant_id = %tenant_id);
        self.run_batch(tenant_id).instrument(span).await
    }

    /// Backlog and throughput snapshot. "Today" starts at UTC midnight.
    pub async fn status(&self, scope: Option<TenantId>) -> Result<PipelineStatus> {
        let day_start = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
        let status = self
            .store
            .pipeline_status(
                scope,
                day_start,
                self.promote_suspicious,
                self.config.max_promotion_attempts,
            )
            .await?;

        if scope.is_none()
            && let Some(metrics) = &self.metrics
        {
            metrics.set_backlog("raw_pending", status.raw_pending);
            metrics.set_backlog("raw_error", status.raw_error);
            metrics.set_backlog("staging_unpromoted", status.staging_unpromoted);
            metrics.set_backlog("staging_parked", status.staging_parked);
        }
        Ok(status)
    }

    async fn backlog(&self) -> Result<Vec<TenantId>> {
        self.store
            .tenants_with_backlog(
                Utc::now(),
                self.promote_suspicious,
                self.config.max_promotion_attempts,
            )
            .await
    }

    async fn run_tenants(&self, tenants: Vec<TenantId>) -> RunReport {
        let results = join_all(tenants.into_iter().map(|tenant_id| async move {
            (tenant_id, self.run_tenant(tenant_id).await)
        }))
        .await;

        let mut report = RunReport::default();
        for (tenant_id, result) in results {
            match result {
                Ok(batch) => report.batches.push(batch),
                Err(e) => {
                    tracing::error!(tenant_id = %tenant_id, error = %e, "Pipeline batch failed");
                    report.failures.push(TenantFailure {
                        tenant_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn run_batch(&self, tenant_id: TenantId) -> Result<BatchReport> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.batch_deadline();
        let phase = PhaseGuard::new(&self.phases, tenant_id);
        let mut report = BatchReport::new(tenant_id);

        // raw -> staging
        phase.set(Phase::Staging);
        let raw_events = self
            .store
            .fetch_pending(Some(tenant_id), self.config.max_raw_per_batch, Utc::now())
            .await?;
        report.raw_fetched = raw_events.len() as u64;

        for raw in &raw_events {
            if tokio::time::Instant::now() >= deadline
                || tokio::time::timeout_at(deadline, self.stage_one(raw, &mut report))
                    .await
                    .is_err()
            {
                report.timed_out = true;
                break;
            }
        }
        self.observe_phase("staging", started);

        // staging -> business
        if !report.timed_out {
            phase.set(Phase::Promoting);
            let promoting = Instant::now();
            let records = self
                .store
                .fetch_unpromoted(
                    Some(tenant_id),
                    self.config.max_staging_per_batch,
                    self.promote_suspicious,
                    self.config.max_promotion_attempts,
                )
                .await?;
            report.staging_fetched = records.len() as u64;

            for record in &records {
                if tokio::time::Instant::now() >= deadline
                    || tokio::time::timeout_at(deadline, self.promote_one(record, &mut report))
                        .await
                        .is_err()
                {
                    report.timed_out = true;
                    break;
                }
            }
            self.observe_phase("promotion", promoting);
        }

        report.duration_ms = started.elapsed().as_millis() as u64;

        if report.timed_out {
            tracing::warn!(
                raw_processed = report.raw_processed,
                promoted = report.promoted,
                "Batch deadline reached, returning partial results"
            );
        } else if report.raw_fetched > 0 || report.staging_fetched > 0 {
            tracing::info!(
                raw_processed = report.raw_processed,
                raw_retried = report.raw_retried,
                raw_errored = report.raw_errored,
                promoted = report.promoted,
                promotion_failed = report.promotion_failed,
                duration_ms = report.duration_ms,
                "Batch complete"
            );
        }

        Ok(report)
    }

    fn observe_phase(&self, phase: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_batch_duration(phase, started.elapsed().as_secs_f64());
        }
    }

    async fn stage_one(&self, raw: &RawEvent, report: &mut BatchReport) {
        let operation = "staging.process";
        let resource_id = raw.raw_id.to_string();
        self.audit
            .emit(
                AuditEvent::new(operation, AuditOutcome::Attempt, "raw_event", &resource_id)
                    .with_tenant(raw.tenant_id)
                    .with_actor(ACTOR)
                    .with_details(json!({"retry_count": raw.retry_count})),
            )
            .await;

        match self.stager.process_raw(raw).await {
            Ok(record) => {
                report.raw_processed += 1;
                match record.validation_status {
                    ValidationStatus::Valid => report.staged_valid += 1,
                    ValidationStatus::Invalid => report.staged_invalid += 1,
                    ValidationStatus::Suspicious => report.staged_suspicious += 1,
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_raw_outcome("processed");
                    metrics.record_staging(record.validation_status.as_str());
                }
                self.audit
                    .emit(
                        AuditEvent::new(operation, AuditOutcome::Success, "raw_event", resource_id)
                            .with_tenant(raw.tenant_id)
                            .with_actor(ACTOR)
                            .with_details(json!({
                                "staging_id": record.staging_id,
                                "validation_status": record.validation_status.as_str(),
                                "quality_score": record.quality_score,
                                "validation_errors": record.validation_errors,
                            })),
                    )
                    .await;
            }
            Err(e) => self.handle_raw_failure(raw, e, report).await,
        }
    }

    async fn handle_raw_failure(&self, raw: &RawEvent, error: Error, report: &mut BatchReport) {
        let message = error.to_string();
        let park = !error.is_transient() || raw.retry_count >= self.config.max_retries;

        if park {
            report.raw_errored += 1;
            tracing::error!(
                tenant_id = %raw.tenant_id,
                raw_id = raw.raw_id,
                retry_count = raw.retry_count,
                error = %message,
                "Raw event parked in ERROR"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_raw_outcome("error");
                metrics.record_parked("raw");
            }
            if let Err(e) = self.store.mark_error(raw.raw_id, &message).await {
                tracing::error!(raw_id = raw.raw_id, error = %e, "Failed to mark raw event as ERROR");
            }
        } else {
            report.raw_retried += 1;
            let delay = self.config.retry_backoff(raw.retry_count);
            let next_attempt_at =
                Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            tracing::warn!(
                tenant_id = %raw.tenant_id,
                raw_id = raw.raw_id,
                retry_count = raw.retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Raw event processing failed, will retry"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_raw_outcome("retried");
                metrics.record_retry("staging");
            }
            if let Err(e) = self
                .store
                .record_retry(raw.raw_id, &message, next_attempt_at)
                .await
            {
                tracing::error!(raw_id = raw.raw_id, error = %e, "Failed to record retry");
            }
        }

        self.audit
            .emit(
                AuditEvent::new(
                    "staging.process",
                    AuditOutcome::Failure,
                    "raw_event",
                    raw.raw_id.to_string(),
                )
                .with_tenant(raw.tenant_id)
                .with_actor(ACTOR)
                .with_details(json!({
                    "error": message,
                    "retry_count": raw.retry_count,
                    "parked": park,
                })),
            )
            .await;
    }

    async fn promote_one(&self, record: &StagingRecord, report: &mut BatchReport) {
        let operation = "promotion.promote";
        let resource_id = record.staging_id.to_string();
        self.audit
            .emit(
                AuditEvent::new(operation, AuditOutcome::Attempt, "staging_record", &resource_id)
                    .with_tenant(record.tenant_id)
                    .with_actor(ACTOR)
                    .with_details(json!({"attempts": record.promotion_attempts})),
            )
            .await;

        match self.builder.promote(record).await {
            Ok(outcome) => {
                if outcome.newly_promoted {
                    report.promoted += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_promotion("promoted");
                    }
                }
                self.audit
                    .emit(
                        AuditEvent::new(
                            operation,
                            AuditOutcome::Success,
                            "staging_record",
                            resource_id,
                        )
                        .with_tenant(record.tenant_id)
                        .with_actor(ACTOR)
                        .with_details(serde_json::to_value(&outcome).unwrap_or_default()),
                    )
                    .await;
            }
            Err(e) => {
                let message = e.to_string();
                let attempts = record.promotion_attempts + 1;
                let park = !e.is_transient() || attempts >= self.config.max_promotion_attempts;

                report.promotion_failed += 1;
                if e.is_invariant_violation() {
                    tracing::error!(
                        tenant_id = %record.tenant_id,
                        staging_id = record.staging_id,
                        error = %message,
                        "Invariant violation during promotion, record parked"
                    );
                } else {
                    tracing::warn!(
                        tenant_id = %record.tenant_id,
                        staging_id = record.staging_id,
                        attempts,
                        parked = park,
                        error = %message,
                        "Promotion failed"
                    );
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_promotion("failed");
                    if park {
                        metrics.record_parked("promotion");
                    }
                }
                if park {
                    report.promotion_parked += 1;
                }
                if let Err(store_err) = self
                    .store
                    .record_promotion_failure(record.staging_id, &message, park)
                    .await
                {
                    tracing::error!(
                        staging_id = record.staging_id,
                        error = %store_err,
                        "Failed to record promotion failure"
                    );
                }

                self.audit
                    .emit(
                        AuditEvent::new(
                            operation,
                            AuditOutcome::Failure,
                            "staging_record",
                            resource_id,
                        )
                        .with_tenant(record.tenant_id)
                        .with_actor(ACTOR)
                        .with_details(json!({
                            "error": message,
                            "attempts": attempts,
                            "parked": park,
                            "invariant_violation": e.is_invariant_violation(),
                        })),
                    )
                    .await;
            }
        }
    }
}

#[async_trait]
impl PipelineTrigger for Orchestrator {
    async fn on_ingested(&self, tenant_id: TenantId) {
        if let Err(e) = self.run_tenant(tenant_id).await {
            tracing::error!(tenant_id = %tenant_id, error = %e, "Inline pipeline run failed");
        }
    }
}
