//! Audit emission contract
//!
//! Every stage emits an audit record on attempt, success and failure of a
//! mutating operation. Emission is fire-and-forget: `AuditEmitter` never
//! lets a sink failure (error or panic) reach the operation it describes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use crate::{Result, TenantId};

/// Phase of the audited operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Attempt,
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Attempt => "attempt",
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// `<operation>.<outcome>`, e.g. `raw_event.ingest.success`
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: String,
    pub actor: String,
    pub tenant_id: Option<TenantId>,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        operation: &str,
        outcome: AuditOutcome,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: format!("{}.{}", operation, outcome),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            actor: "system".to_string(),
            tenant_id: None,
            details: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn outcome(&self) -> Option<AuditOutcome> {
        match self.event_type.rsplit('.').next()? {
            "attempt" => Some(AuditOutcome::Attempt),
            "success" => Some(AuditOutcome::Success),
            "failure" => Some(AuditOutcome::Failure),
            _ => None,
        }
    }
}

/// External append-only audit sink
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

/// Fire-and-forget wrapper around an `AuditSink`
#[derive(Clone)]
pub struct AuditEmitter {
    sink: Arc<dyn AuditSink>,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Emitter that drops every record
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopAuditSink))
    }

    /// Emit an audit record. Sink errors and panics are logged and swallowed.
    pub async fn emit(&self, event: AuditEvent) {
        let event_type = event.event_type.clone();
        let result = AssertUnwindSafe(self.sink.record(event))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(event_type = %event_type, error = %e, "Failed to emit audit event");
            }
            Err(_) => {
                tracing::error!(event_type = %event_type, "Audit sink panicked");
            }
        }
    }
}

struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _event: AuditEvent) -> Result<()> {
        Ok(())
    }
}

/// In-memory audit sink for tests and embedding
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        Ok(())
    }
}
