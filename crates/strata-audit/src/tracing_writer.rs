//! Audit writer that emits each event as a structured log line on the
//! `audit` target, so any `tracing` subscriber (JSON logs, log shipping)
//! can act as the audit sink.

use async_trait::async_trait;
use strata_core::{AuditEvent, AuditOutcome};

use crate::writer::{AuditWriter, WriterResult};

#[derive(Debug, Clone, Default)]
pub struct TracingAuditWriter;

impl TracingAuditWriter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditWriter for TracingAuditWriter {
    async fn write_event(&self, event: &AuditEvent) -> WriterResult<()> {
        let tenant_id = event.tenant_id.map(|t| t.to_string()).unwrap_or_default();
        let details = serde_json::to_string(&event.details)?;

        match event.outcome() {
            Some(AuditOutcome::Failure) => tracing::warn!(
                target: "audit",
                event_type = %event.event_type,
                resource_type = %event.resource_type,
                resource_id = %event.resource_id,
                actor = %event.actor,
                tenant_id = %tenant_id,
                details = %details,
                timestamp = %event.timestamp.to_rfc3339(),
                "audit"
            ),
            _ => tracing::info!(
                target: "audit",
                event_type = %event.event_type,
                resource_type = %event.resource_type,
                resource_id = %event.resource_id,
                actor = %event.actor,
                tenant_id = %tenant_id,
                details = %details,
                timestamp = %event.timestamp.to_rfc3339(),
                "audit"
            ),
        }
        Ok(())
    }
}
