//! Ingestion
//!
//! The synchronous entry point of the pipeline. A request is either
//! rejected (caller-visible, nothing stored) or appended as a PENDING raw
//! event. Acceptance and suspicion are independent: a suspicious request is
//! still accepted unless the rate limit is exhausted.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use strata_core::{
    AuditEmitter, AuditEvent, AuditOutcome, PipelineStore, RequestContext, Result, TenantId,
    types::{NewRawEvent, RawId},
};
use strata_observability::Metrics;

use crate::config::PipelineConfig;
use crate::orchestrator::PipelineTrigger;
use crate::ratelimit::{RateLimiter, RiskScorer};

const OPERATION: &str = "raw_event.ingest";
const RATE_LIMITED: &str = "rate limit exceeded";

/// One inbound event as handed over by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source_address: String,
    pub user_agent: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub event_id: Option<RawId>,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub suspicious: bool,
    pub risk_score: f64,
}

impl IngestResponse {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            event_id: None,
            accepted: false,
            reason: Some(reason.into()),
            suspicious: false,
            risk_score: 0.0,
        }
    }
}

pub struct Ingestor {
    store: Arc<dyn PipelineStore>,
    rate_limiter: RateLimiter,
    risk_scorer: RiskScorer,
    audit: AuditEmitter,
    metrics: Option<Arc<Metrics>>,
    trigger: Option<Arc<dyn PipelineTrigger>>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn PipelineStore>, config: &PipelineConfig, audit: AuditEmitter) -> Self {
        Self {
            rate_limiter: RateLimiter::new(store.clone(), config.rate_limit.clone()),
            risk_scorer: RiskScorer::new(store.clone(), config.risk.clone()),
            store,
            audit,
            metrics: None,
            trigger: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Notified with the tenant after every accepted event
    pub fn with_trigger(mut self, trigger: Arc<dyn PipelineTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Ingest one event.
    ///
    /// Rejections come back as `Ok` with `accepted = false`; `Err` means the
    /// store failed and the caller may retry.
    pub async fn ingest(
        &self,
        ctx: &RequestContext,
        request: IngestRequest,
    ) -> Result<IngestResponse> {
        let result = self.ingest_inner(ctx, request).await;
        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(response) if response.accepted => "accepted",
                Ok(response) if response.reason.as_deref() == Some(RATE_LIMITED) => "rate_limited",
                Ok(_) => "rejected",
                Err(_) => "error",
            };
            metrics.record_ingest(outcome);
        }
        result
    }

    async fn ingest_inner(
        &self,
        ctx: &RequestContext,
        request: IngestRequest,
    ) -> Result<IngestResponse> {
        let Ok(tenant_id) = ctx.require_tenant() else {
            tracing::warn!(request_id = %ctx.request_id, "Ingestion without a resolved tenant");
            self.audit_rejection(ctx, None, "tenant required").await;
            return Ok(IngestResponse::rejected("tenant required"));
        };

        self.audit
            .emit(
                AuditEvent::new(OPERATION, AuditOutcome::Attempt, "raw_event", &ctx.request_id)
                    .with_tenant(tenant_id)
                    .with_actor(&ctx.actor)
                    .with_details(json!({"source_address": request.source_address})),
            )
            .await;

        let source_address = request.source_address.clone();
        let result = self.ingest_for_tenant(ctx, tenant_id, request).await;
        if let Err(e) = &result {
            tracing::error!(tenant_id = %tenant_id, error = %e, "Ingestion failed");
            self.audit
                .emit(
                    AuditEvent::new(OPERATION, AuditOutcome::Failure, "raw_event", &ctx.request_id)
                        .with_tenant(tenant_id)
                        .with_actor(&ctx.actor)
                        .with_details(json!({
                            "error": e.to_string(),
                            "transient": e.is_transient(),
                            "source_address": source_address,
                        })),
                )
                .await;
        }
        result
    }

    async fn ingest_for_tenant(
        &self,
        ctx: &RequestContext,
        tenant_id: TenantId,
        request: IngestRequest,
    ) -> Result<IngestResponse> {
        let reason = match self.store.get_tenant(tenant_id).await? {
            None => Some("unknown tenant"),
            Some(tenant) if !tenant.active => Some("tenant inactive"),
            Some(_) if !request.payload.is_object() => Some("payload must be a JSON object"),
            Some(_) => None,
        };
        if let Some(reason) = reason {
            self.audit_rejection(ctx, Some(tenant_id), reason).await;
            return Ok(IngestResponse::rejected(reason));
        }

        let rate_config = self.rate_limiter.config();
        if rate_config.enabled {
            let now = Utc::now();
            let decision = self
                .rate_limiter
                .check_at(&request.source_address, &rate_config.endpoint, now)
                .await?;
            if !decision.allowed {
                if let Some(metrics) = &self.metrics {
                    metrics.record_rate_limited(&rate_config.endpoint);
                }
                tracing::info!(
                    tenant_id = %tenant_id,
                    source_address = %request.source_address,
                    count = decision.current_count,
                    "Ingestion rate limited"
                );
                self.audit
                    .emit(
                        AuditEvent::new(
                            OPERATION,
                            AuditOutcome::Failure,
                            "raw_event",
                            &ctx.request_id,
                        )
                        .with_tenant(tenant_id)
                        .with_actor(&ctx.actor)
                        .with_details(json!({
                            "reason": RATE_LIMITED,
                            "source_address": request.source_address,
                            "retry_after_secs": decision.retry_after_secs(now),
                        })),
                    )
                    .await;
                return Ok(IngestResponse::rejected(RATE_LIMITED));
            }
        }

        let risk = self
            .risk_scorer
            .score(&request.source_address, &request.user_agent, &request.payload)
            .await?;
        if risk.suspicious {
            if let Some(metrics) = &self.metrics {
                metrics.record_suspicious(&rate_config.endpoint);
            }
            tracing::warn!(
                tenant_id = %tenant_id,
                source_address = %request.source_address,
                risk_score = risk.score,
                reasons = ?risk.reasons,
                "Suspicious request accepted"
            );
        }

        let raw_id = self
            .store
            .append_raw(NewRawEvent {
                tenant_id,
                received_at: Utc::now(),
                source_address: request.source_address,
                user_agent: request.user_agent,
                payload: request.payload,
                risk_score: risk.score,
                suspicious: risk.suspicious,
            })
            .await?;

        tracing::debug!(tenant_id = %tenant_id, raw_id, "Raw event appended");
        self.audit
            .emit(
                AuditEvent::new(
                    OPERATION,
                    AuditOutcome::Success,
                    "raw_event",
                    raw_id.to_string(),
                )
                .with_tenant(tenant_id)
                .with_actor(&ctx.actor)
                .with_details(json!({
                    "request_id": ctx.request_id,
                    "risk_score": risk.score,
                    "suspicious": risk.suspicious,
                    "risk_reasons": risk.reasons,
                })),
            )
            .await;

        if let Some(trigger) = &self.trigger {
            trigger.on_ingested(tenant_id).await;
        }

        Ok(IngestResponse {
            event_id: Some(raw_id),
            accepted: true,
            reason: None,
            suspicious: risk.suspicious,
            risk_score: risk.score,
        })
    }

    async fn audit_rejection(&self, ctx: &RequestContext, tenant_id: Option<TenantId>, reason: &str) {
        let mut event = AuditEvent::new(OPERATION, AuditOutcome::Failure, "raw_event", &ctx.request_id)
            .with_actor(&ctx.actor)
            .with_details(json!({"reason": reason}));
        if let Some(tenant_id) = tenant_id {
            event = event.with_tenant(tenant_id);
        }
        self.audit.emit(event).await;
    }
}
