//! Tenant types and the authenticated request context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Unique identifier for a tenant.
///
/// Every record in the pipeline carries one; no read or write crosses
/// tenant boundaries implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(Uuid);

impl TenantId {
    /// Create a new random tenant ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a tenant ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse a tenant ID from a string
    pub fn from_string(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| Error::InvalidTenant(format!("Invalid tenant ID format: {}", e)))?;
        Ok(Self(uuid))
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_string(s)
    }
}

/// A tenant as known to the pipeline's tenant directory.
///
/// Registration and role management live outside the pipeline; the
/// directory only answers "does this tenant exist and is it active".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: TenantId,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(tenant_id: TenantId, name: impl Into<String>) -> Self {
        Self {
            tenant_id,
            name: name.into(),
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// Authenticated request context handed over by the API gateway.
///
/// The gateway resolves the tenant; when it could not, `tenant_id` is
/// `None` and every tenant-scoped operation must reject the request.
/// There is no fallback tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Tenant resolved by the gateway
    pub tenant_id: Option<TenantId>,

    /// Principal performing the request (user, API key, or system component)
    pub actor: String,

    /// Correlation ID for logs and audit records
    pub request_id: String,
}

impl RequestContext {
    pub fn new(tenant_id: Option<TenantId>, actor: impl Into<String>) -> Self {
        Self {
            tenant_id,
            actor: actor.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    /// Context for pipeline-internal work on behalf of a tenant
    pub fn system(tenant_id: TenantId, component: &str) -> Self {
        Self::new(Some(tenant_id), format!("system:{}", component))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Get the tenant ID, returning an error if the gateway did not resolve one
    pub fn require_tenant(&self) -> Result<TenantId> {
        self.tenant_id
            .ok_or_else(|| Error::TenantRequired("Operation requires tenant ID".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_creation() {
        let id1 = TenantId::new();
        let id2 = TenantId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_tenant_id_from_string() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let tenant_id = TenantId::from_string(uuid_str).unwrap();
        assert_eq!(tenant_id.to_string(), uuid_str);
    }

    #[test]
    fn test_tenant_id_invalid_string() {
        let result = TenantId::from_string("not-a-uuid");
        assert!(matches!(result, Err(Error::InvalidTenant(_))));
    }

    #[test]
    fn test_require_tenant_without_tenant() {
        let ctx = RequestContext::new(None, "api-key:123");
        assert!(matches!(ctx.require_tenant(), Err(Error::TenantRequired(_))));
    }

    #[test]
    fn test_system_context() {
        let tenant = TenantId::new();
        let ctx = RequestContext::system(tenant, "orchestrator");
        assert_eq!(ctx.require_tenant().unwrap(), tenant);
        assert_eq!(ctx.actor, "system:orchestrator");
        assert!(!ctx.request_id.is_empty());
    }
}
