//! Error types for Strata Core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid identity key: {0}")]
    InvalidKey(String),

    #[error("Rate limit exceeded{}", retry_after_secs.map(|s| format!(": retry after {}s", s)).unwrap_or_default())]
    RateLimitExceeded { retry_after_secs: Option<u64> },

    #[error("Internal error: {0}")]
    Internal(String),

    // Multi-tenancy errors
    #[error("Invalid tenant: {0}")]
    InvalidTenant(String),

    #[error("Tenant required: {0}")]
    TenantRequired(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Tenant inactive: {0}")]
    TenantInactive(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Two different natural keys resolved to the same identity key.
    #[error("Identity collision for {kind} key {key}: stored '{existing}', incoming '{incoming}'")]
    IdentityCollision {
        kind: String,
        key: String,
        existing: String,
        incoming: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors worth retrying on a later orchestrator pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Database(_) | Error::Io(_))
    }

    /// Errors that indicate broken data invariants. Processing of the
    /// affected record stops; siblings in the batch continue.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::IdentityCollision { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Database("locked".to_string()).is_transient());
        assert!(Error::Store("unavailable".to_string()).is_transient());
        assert!(!Error::InvalidKey("empty".to_string()).is_transient());
        assert!(!Error::TenantNotFound("t".to_string()).is_transient());
    }

    #[test]
    fn test_invariant_violation_classification() {
        let err = Error::IdentityCollision {
            kind: "page".to_string(),
            key: "ab".to_string(),
            existing: "a".to_string(),
            incoming: "b".to_string(),
        };
        assert!(err.is_invariant_violation());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_rate_limit_display() {
        let err = Error::RateLimitExceeded {
            retry_after_secs: Some(30),
        };
        assert_eq!(err.to_string(), "Rate limit exceeded: retry after 30s");

        let err = Error::RateLimitExceeded {
            retry_after_secs: None,
        };
        assert_eq!(err.to_string(), "Rate limit exceeded");
    }
}
