//! Store traits
//!
//! The persistent store is the only shared resource in the pipeline. Each
//! layer talks to it through a narrow trait so stages can be tested and
//! swapped independently; `PipelineStore` bundles them for wiring.
//!
//! Implementations:
//! - `SqliteStore` (crate `strata-store-sqlite`)
//!
//! Every operation is tenant-scoped either through an explicit `TenantId`
//! argument or through the tenant recorded on the addressed row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::identity::{EntityKind, IdentityKey, LinkKind};
use crate::types::{
    Hub, HubInsert, Link, NewRawEvent, NewStagingRecord, PipelineStatus, RawEvent, RawId,
    SatelliteName, SatelliteVersion, SatelliteWrite, StagingId, StagingRecord,
};
use crate::{Result, Tenant, TenantId};

/// Directory of known tenants
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Insert or update a tenant
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<()>;

    /// Look up a tenant; `Ok(None)` if unknown
    async fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>>;

    /// Activate or deactivate a tenant
    ///
    /// # Errors
    /// - `Error::TenantNotFound` if the tenant is unknown
    async fn set_tenant_active(&self, tenant_id: TenantId, active: bool) -> Result<()>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>>;
}

/// Append-only landing zone for inbound events
#[async_trait]
pub trait RawEventStore: Send + Sync {
    /// Append a PENDING raw event and return its sequential id
    async fn append_raw(&self, event: NewRawEvent) -> Result<RawId>;

    async fn get_raw(&self, raw_id: RawId) -> Result<Option<RawEvent>>;

    /// PENDING events due at `now`, oldest first, optionally for one tenant
    async fn fetch_pending(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>>;

    /// PENDING -> PROCESSED. Returns `false` (no-op) if the event was not PENDING.
    async fn mark_processed(&self, raw_id: RawId, at: DateTime<Utc>) -> Result<bool>;

    /// Record a transient failure: the event stays PENDING, `retry_count`
    /// increments and it becomes due again at `next_attempt_at`.
    ///
    /// Returns the new retry count, or `None` if the event was not PENDING.
    async fn record_retry(
        &self,
        raw_id: RawId,
        message: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<u32>>;

    /// PENDING -> ERROR. Returns `false` (no-op) if the event was not PENDING.
    async fn mark_error(&self, raw_id: RawId, message: &str) -> Result<bool>;
}

/// Validated and enriched projections of raw events
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Insert the staging record for a raw event.
    ///
    /// Idempotent on `raw_id`: if a record already exists it is returned
    /// unchanged.
    async fn insert_staging(&self, record: NewStagingRecord) -> Result<StagingRecord>;

    async fn get_staging(&self, staging_id: StagingId) -> Result<Option<StagingRecord>>;

    async fn get_staging_by_raw(&self, raw_id: RawId) -> Result<Option<StagingRecord>>;

    /// Records eligible for promotion, oldest first: VALID (and SUSPICIOUS
    /// when `include_suspicious`), not yet promoted, fewer than
    /// `max_attempts` failed attempts and no invariant violation recorded.
    async fn fetch_unpromoted(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
        include_suspicious: bool,
        max_attempts: u32,
    ) -> Result<Vec<StagingRecord>>;

    /// Set `promoted_to_business`. Returns `false` if it was already set.
    async fn mark_promoted(&self, staging_id: StagingId, at: DateTime<Utc>) -> Result<bool>;

    /// Count a failed promotion attempt. `park` stops further retries.
    async fn record_promotion_failure(
        &self,
        staging_id: StagingId,
        message: &str,
        park: bool,
    ) -> Result<()>;
}

/// Business layer: hubs, links and satellites
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert-if-absent. Concurrent inserts of the same hub converge.
    ///
    /// # Errors
    /// - `Error::IdentityCollision` if the key exists with a different kind or natural key
    async fn insert_hub(&self, hub: &Hub) -> Result<HubInsert>;

    async fn get_hub(
        &self,
        tenant_id: TenantId,
        kind: EntityKind,
        identity_key: &IdentityKey,
    ) -> Result<Option<Hub>>;

    /// Insert-if-absent on `link_key`. Returns `true` if a row was created.
    async fn insert_link(&self, link: &Link) -> Result<bool>;

    /// Insert a new version unless the current version has the same
    /// fingerprint; the superseded version is closed.
    async fn write_satellite(&self, version: &SatelliteVersion) -> Result<SatelliteWrite>;

    /// Full history of a satellite owner ordered by `valid_from`
    async fn satellite_history(
        &self,
        tenant_id: TenantId,
        satellite: SatelliteName,
        owner_key: &IdentityKey,
    ) -> Result<Vec<SatelliteVersion>>;

    async fn count_hubs(&self, tenant_id: TenantId, kind: EntityKind) -> Result<u64>;

    async fn count_links(&self, tenant_id: TenantId, kind: LinkKind) -> Result<u64>;

    async fn list_links(&self, tenant_id: TenantId, kind: LinkKind) -> Result<Vec<Link>>;
}

/// Sliding-window request log
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn record_request(
        &self,
        source_address: &str,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Requests for `(source_address, endpoint)` strictly after `since`, and
    /// the oldest of them
    async fn window_stats(
        &self,
        source_address: &str,
        endpoint: &str,
        since: DateTime<Utc>,
    ) -> Result<(u64, Option<DateTime<Utc>>)>;

    /// Requests from `source_address` on any endpoint at or after `since`
    async fn count_recent_from(&self, source_address: &str, since: DateTime<Utc>) -> Result<u64>;

    /// Drop log entries older than `before`; returns the number removed
    async fn prune_rate_limits(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Monitoring queries
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn pipeline_status(
        &self,
        tenant_id: Option<TenantId>,
        day_start: DateTime<Utc>,
        include_suspicious: bool,
        max_attempts: u32,
    ) -> Result<PipelineStatus>;

    /// Tenants with due raw events or eligible unpromoted staging records
    async fn tenants_with_backlog(
        &self,
        now: DateTime<Utc>,
        include_suspicious: bool,
        max_attempts: u32,
    ) -> Result<Vec<TenantId>>;

    /// Cheap liveness check of the underlying store
    async fn ping(&self) -> Result<()>;
}

/// Everything the pipeline needs from the persistent store
pub trait PipelineStore:
    TenantStore + RawEventStore + StagingStore + GraphStore + RateLimitStore + StatusStore
{
}

impl<T> PipelineStore for T where
    T: TenantStore + RawEventStore + StagingStore + GraphStore + RateLimitStore + StatusStore
{
}
