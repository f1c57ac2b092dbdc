//! Strata Core Types and Traits
//!
//! This crate provides the fundamental types and traits used throughout Strata:
//! - Tenant identifiers and the authenticated request context
//! - The identity resolver for hub and link keys
//! - Raw, staging and business-layer record types
//! - Store trait abstractions
//! - The audit emission contract
//! - Core error types

pub mod audit;
pub mod error;
pub mod identity;
pub mod store;
pub mod tenant;
pub mod types;

pub use audit::{AuditEmitter, AuditEvent, AuditOutcome, AuditSink, MemoryAuditSink};
pub use error::{Error, Result};
pub use identity::{EntityKind, IdentityKey, LinkKind};
pub use store::{
    GraphStore, PipelineStore, RateLimitStore, RawEventStore, StagingStore, StatusStore,
    TenantStore,
};
pub use tenant::{RequestContext, Tenant, TenantId};
