//! SqliteStore - store trait implementations backed by a single SQLite database

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::PathBuf;
use std::time::Duration;

use strata_core::{
    Error, GraphStore, RateLimitStore, RawEventStore, Result, StagingStore, StatusStore, Tenant,
    TenantId, TenantStore,
    identity::{EntityKind, IdentityKey, LinkKind},
    types::{
        CampaignParams, DeviceType, EnrichmentStatus, Hub, HubInsert, Link, NewRawEvent,
        NewStagingRecord, PipelineStatus, RawEvent, RawId, RawStatus, SatelliteName,
        SatelliteVersion, SatelliteWrite, StagingFields, StagingId, StagingRecord,
        ValidationStatus,
    },
};

use crate::migrations;

/// Connection settings for the SQLite store
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Maximum pooled connections
    pub max_connections: u32,
    /// How long a writer waits for a lock before failing with SQLITE_BUSY
    pub busy_timeout: Duration,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteStoreConfig {
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

/// SQLite-backed pipeline store
///
/// One database holds the tenant directory, raw events, staging records,
/// the business-layer graph and the rate-limit log.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` with default settings
    ///
    /// # Errors
    /// - `Error::Database` if the connection or a migration fails
    pub async fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(db_path, SqliteStoreConfig::default()).await
    }

    /// Open (or create) the database at `db_path`
    ///
    /// # Errors
    /// - `Error::Database` if the connection or a migration fails
    pub async fn with_config(
        db_path: impl Into<PathBuf>,
        config: SqliteStoreConfig,
    ) -> Result<Self> {
        let db_path = expand_tilde(db_path.into())?;

        // Create directory if needed
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&db_path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(config.busy_timeout)
                    .foreign_keys(true),
            )
            .await
            .map_err(|e| Error::Database(format!("Failed to open SQLite database: {}", e)))?;

        migrations::run_migrations(&pool).await?;

        tracing::debug!(path = %db_path.display(), "SQLite store ready");

        Ok(Self { pool })
    }

    /// Create from an existing pool (migrations are applied)
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        migrations::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| Error::Database(format!("Timestamp out of range: {}", value)))
}

fn opt_from_micros(value: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    value.map(from_micros).transpose()
}

fn parse_key(value: &str) -> Result<IdentityKey> {
    IdentityKey::from_hex(value)
        .map_err(|e| Error::Database(format!("Corrupt identity key '{}': {}", value, e)))
}

fn parse_tenant(value: &str) -> Result<TenantId> {
    TenantId::from_string(value)
        .map_err(|e| Error::Database(format!("Corrupt tenant id '{}': {}", value, e)))
}

fn parse_column<T: std::str::FromStr<Err = Error>>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|e: Error| Error::Database(e.to_string()))
}

fn eligible_second_status(include_suspicious: bool) -> &'static str {
    if include_suspicious {
        ValidationStatus::Suspicious.as_str()
    } else {
        ValidationStatus::Valid.as_str()
    }
}

fn tenant_row(row: &SqliteRow) -> Result<Tenant> {
    Ok(Tenant {
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id").map_err(db_err)?)?,
        name: row.try_get("name").map_err(db_err)?,
        active: row.try_get("active").map_err(db_err)?,
        created_at: from_micros(row.try_get("created_at").map_err(db_err)?)?,
    })
}

fn raw_event_row(row: &SqliteRow) -> Result<RawEvent> {
    let payload: String = row.try_get("payload").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let retry_count: i64 = row.try_get("retry_count").map_err(db_err)?;

    Ok(RawEvent {
        raw_id: row.try_get("raw_id").map_err(db_err)?,
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id").map_err(db_err)?)?,
        received_at: from_micros(row.try_get("received_at").map_err(db_err)?)?,
        source_address: row.try_get("source_address").map_err(db_err)?,
        user_agent: row.try_get("user_agent").map_err(db_err)?,
        payload: serde_json::from_str(&payload)?,
        status: parse_column::<RawStatus>(&status)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        retry_count: retry_count.max(0) as u32,
        next_attempt_at: from_micros(row.try_get("next_attempt_at").map_err(db_err)?)?,
        risk_score: row.try_get("risk_score").map_err(db_err)?,
        suspicious: row.try_get("suspicious").map_err(db_err)?,
        processed_at: opt_from_micros(row.try_get("processed_at").map_err(db_err)?)?,
    })
}

fn staging_row(row: &SqliteRow) -> Result<StagingRecord> {
    let device_type: Option<String> = row.try_get("device_type").map_err(db_err)?;
    let attributes: String = row.try_get("attributes").map_err(db_err)?;
    let validation_errors: String = row.try_get("validation_errors").map_err(db_err)?;
    let validation_status: String = row.try_get("validation_status").map_err(db_err)?;
    let enrichment_status: String = row.try_get("enrichment_status").map_err(db_err)?;
    let attempts: i64 = row.try_get("promotion_attempts").map_err(db_err)?;

    let fields = StagingFields {
        event_type: row.try_get("event_type").map_err(db_err)?,
        event_timestamp: opt_from_micros(row.try_get("event_timestamp").map_err(db_err)?)?,
        page_url: row.try_get("page_url").map_err(db_err)?,
        normalized_url: row.try_get("normalized_url").map_err(db_err)?,
        page_host: row.try_get("page_host").map_err(db_err)?,
        page_path: row.try_get("page_path").map_err(db_err)?,
        referrer: row.try_get("referrer").map_err(db_err)?,
        session_id: row.try_get("session_id").map_err(db_err)?,
        visitor_id: row.try_get("visitor_id").map_err(db_err)?,
        business_item: row.try_get("business_item").map_err(db_err)?,
        device_type: device_type
            .as_deref()
            .map(parse_column::<DeviceType>)
            .transpose()?,
        browser: row.try_get("browser").map_err(db_err)?,
        os: row.try_get("os").map_err(db_err)?,
        campaign: CampaignParams {
            source: row.try_get("utm_source").map_err(db_err)?,
            medium: row.try_get("utm_medium").map_err(db_err)?,
            campaign: row.try_get("utm_campaign").map_err(db_err)?,
            term: row.try_get("utm_term").map_err(db_err)?,
            content: row.try_get("utm_content").map_err(db_err)?,
        },
        attributes: serde_json::from_str(&attributes)?,
    };

    Ok(StagingRecord {
        staging_id: row.try_get("staging_id").map_err(db_err)?,
        raw_id: row.try_get("raw_id").map_err(db_err)?,
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id").map_err(db_err)?)?,
        received_at: from_micros(row.try_get("received_at").map_err(db_err)?)?,
        source_address: row.try_get("source_address").map_err(db_err)?,
        user_agent: row.try_get("user_agent").map_err(db_err)?,
        fields,
        validation_status: parse_column::<ValidationStatus>(&validation_status)?,
        validation_errors: serde_json::from_str(&validation_errors)?,
        quality_score: row.try_get("quality_score").map_err(db_err)?,
        enrichment_status: parse_column::<EnrichmentStatus>(&enrichment_status)?,
        promoted_to_business: row.try_get("promoted_to_business").map_err(db_err)?,
        promoted_at: opt_from_micros(row.try_get("promoted_at").map_err(db_err)?)?,
        promotion_attempts: attempts.max(0) as u32,
        promotion_error: row.try_get("promotion_error").map_err(db_err)?,
        created_at: from_micros(row.try_get("created_at").map_err(db_err)?)?,
    })
}

fn hub_row(row: &SqliteRow) -> Result<Hub> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    Ok(Hub {
        identity_key: parse_key(&row.try_get::<String, _>("identity_key").map_err(db_err)?)?,
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id").map_err(db_err)?)?,
        kind: parse_column::<EntityKind>(&kind)?,
        natural_key: row.try_get("natural_key").map_err(db_err)?,
        first_seen_at: from_micros(row.try_get("first_seen_at").map_err(db_err)?)?,
        last_seen_at: from_micros(row.try_get("last_seen_at").map_err(db_err)?)?,
    })
}

fn link_row(row: &SqliteRow) -> Result<Link> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let occurrence_key: Option<String> = row.try_get("occurrence_key").map_err(db_err)?;
    Ok(Link {
        link_key: parse_key(&row.try_get::<String, _>("link_key").map_err(db_err)?)?,
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id").map_err(db_err)?)?,
        kind: parse_column::<LinkKind>(&kind)?,
        left_key: parse_key(&row.try_get::<String, _>("left_key").map_err(db_err)?)?,
        right_key: parse_key(&row.try_get::<String, _>("right_key").map_err(db_err)?)?,
        occurrence_key: occurrence_key.as_deref().map(parse_key).transpose()?,
        occurred_at: from_micros(row.try_get("occurred_at").map_err(db_err)?)?,
    })
}

fn satellite_row(row: &SqliteRow) -> Result<SatelliteVersion> {
    let satellite: String = row.try_get("satellite").map_err(db_err)?;
    let attributes: String = row.try_get("attributes").map_err(db_err)?;
    Ok(SatelliteVersion {
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id").map_err(db_err)?)?,
        satellite: parse_column::<SatelliteName>(&satellite)?,
        owner_key: parse_key(&row.try_get::<String, _>("owner_key").map_err(db_err)?)?,
        valid_from: from_micros(row.try_get("valid_from").map_err(db_err)?)?,
        valid_until: opt_from_micros(row.try_get("valid_until").map_err(db_err)?)?,
        change_fingerprint: row.try_get("change_fingerprint").map_err(db_err)?,
        attributes: serde_json::from_str(&attributes)?,
    })
}

#[async_trait]
impl TenantStore for SqliteStore {
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (tenant_id, name, active, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET name = excluded.name, active = excluded.active
            "#,
        )
        .bind(tenant.tenant_id.to_string())
        .bind(&tenant.name)
        .bind(tenant.active)
        .bind(micros(tenant.created_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>> {
        sqlx::query("SELECT * FROM tenants WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(tenant_row)
            .transpose()
    }

    async fn set_tenant_active(&self, tenant_id: TenantId, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE tenants SET active = ? WHERE tenant_id = ?")
            .bind(active)
            .bind(tenant_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::TenantNotFound(tenant_id.to_string()));
        }
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        sqlx::query("SELECT * FROM tenants ORDER BY created_at, tenant_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(tenant_row)
            .collect()
    }
}

#[async_trait]
impl RawEventStore for SqliteStore {
    async fn append_raw(&self, event: NewRawEvent) -> Result<RawId> {
        let payload = serde_json::to_string(&event.payload)?;
        let result = sqlx::query(
            r#"
            INSERT INTO raw_events (
                tenant_id, received_at, source_address, user_agent, payload,
                status, retry_count, next_attempt_at, risk_score, suspicious
            ) VALUES (?, ?, ?, ?, ?, 'PENDING', 0, ?, ?, ?)
            "#,
        )
        .bind(event.tenant_id.to_string())
        .bind(micros(event.received_at))
        .bind(&event.source_address)
        .bind(&event.user_agent)
        .bind(payload)
        .bind(micros(event.received_at))
        .bind(event.risk_score)
        .bind(event.suspicious)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.last_insert_rowid())
    }

    async fn get_raw(&self, raw_id: RawId) -> Result<Option<RawEvent>> {
        sqlx::query("SELECT * FROM raw_events WHERE raw_id = ?")
            .bind(raw_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(raw_event_row)
            .transpose()
    }

    async fn fetch_pending(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>> {
        let rows = match tenant_id {
            Some(tenant_id) => {
                sqlx::query(
                    r#"
                    SELECT * FROM raw_events
                    WHERE status = 'PENDING' AND tenant_id = ? AND next_attempt_at <= ?
                    ORDER BY raw_id ASC
                    LIMIT ?
                    "#,
                )
                .bind(tenant_id.to_string())
                .bind(micros(now))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM raw_events
                    WHERE status = 'PENDING' AND next_attempt_at <= ?
                    ORDER BY raw_id ASC
                    LIMIT ?
                    "#,
                )
                .bind(micros(now))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        rows.iter().map(raw_event_row).collect()
    }

    async fn mark_processed(&self, raw_id: RawId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE raw_events
            SET status = 'PROCESSED', processed_at = ?
            WHERE raw_id = ? AND status = 'PENDING'
            "#,
        )
        .bind(micros(at))
        .bind(raw_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_retry(
        &self,
        raw_id: RawId,
        message: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        let retry_count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE raw_events
            SET retry_count = retry_count + 1, error_message = ?, next_attempt_at = ?
            WHERE raw_id = ? AND status = 'PENDING'
            RETURNING retry_count
            "#,
        )
        .bind(message)
        .bind(micros(next_attempt_at))
        .bind(raw_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(retry_count.map(|count| count.max(0) as u32))
    }

    async fn mark_error(&self, raw_id: RawId, message: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE raw_events
            SET status = 'ERROR', error_message = ?
            WHERE raw_id = ? AND status = 'PENDING'
            "#,
        )
        .bind(message)
        .bind(raw_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl StagingStore for SqliteStore {
    async fn insert_staging(&self, record: NewStagingRecord) -> Result<StagingRecord> {
        let fields = &record.fields;
        sqlx::query(
            r#"
            INSERT INTO staging_records (
                raw_id, tenant_id, received_at, source_address, user_agent,
                event_type, event_timestamp, page_url, normalized_url, page_host, page_path,
                referrer, session_id, visitor_id, business_item,
                device_type, browser, os,
                utm_source, utm_medium, utm_campaign, utm_term, utm_content,
                attributes, validation_status, validation_errors, quality_score,
                enrichment_status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(raw_id) DO NOTHING
            "#,
        )
        .bind(record.raw_id)
        .bind(record.tenant_id.to_string())
        .bind(micros(record.received_at))
        .bind(&record.source_address)
        .bind(&record.user_agent)
        .bind(&fields.event_type)
        .bind(fields.event_timestamp.map(micros))
        .bind(&fields.page_url)
        .bind(&fields.normalized_url)
        .bind(&fields.page_host)
        .bind(&fields.page_path)
        .bind(&fields.referrer)
        .bind(&fields.session_id)
        .bind(&fields.visitor_id)
        .bind(&fields.business_item)
        .bind(fields.device_type.map(|d| d.as_str()))
        .bind(&fields.browser)
        .bind(&fields.os)
        .bind(&fields.campaign.source)
        .bind(&fields.campaign.medium)
        .bind(&fields.campaign.campaign)
        .bind(&fields.campaign.term)
        .bind(&fields.campaign.content)
        .bind(serde_json::to_string(&fields.attributes)?)
        .bind(record.validation_status.as_str())
        .bind(serde_json::to_string(&record.validation_errors)?)
        .bind(record.quality_score)
        .bind(record.enrichment_status.as_str())
        .bind(micros(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.get_staging_by_raw(record.raw_id).await?.ok_or_else(|| {
            Error::Store(format!(
                "Staging record for raw event {} vanished after insert",
                record.raw_id
            ))
        })
    }

    async fn get_staging(&self, staging_id: StagingId) -> Result<Option<StagingRecord>> {
        sqlx::query("SELECT * FROM staging_records WHERE staging_id = ?")
            .bind(staging_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(staging_row)
            .transpose()
    }

    async fn get_staging_by_raw(&self, raw_id: RawId) -> Result<Option<StagingRecord>> {
        sqlx::query("SELECT * FROM staging_records WHERE raw_id = ?")
            .bind(raw_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(staging_row)
            .transpose()
    }

    async fn fetch_unpromoted(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
        include_suspicious: bool,
        max_attempts: u32,
    ) -> Result<Vec<StagingRecord>> {
        let second_status = eligible_second_status(include_suspicious);
        let rows = match tenant_id {
            Some(tenant_id) => {
                sqlx::query(
                    r#"
                    SELECT * FROM staging_records
                    WHERE tenant_id = ?
                      AND promoted_to_business = 0
                      AND validation_status IN ('VALID', ?)
                      AND promotion_parked = 0
                      AND promotion_attempts < ?
                    ORDER BY staging_id ASC
                    LIMIT ?
                    "#,
                )
                .bind(tenant_id.to_string())
                .bind(second_status)
                .bind(max_attempts as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM staging_records
                    WHERE promoted_to_business = 0
                      AND validation_status IN ('VALID', ?)
                      AND promotion_parked = 0
                      AND promotion_attempts < ?
                    ORDER BY staging_id ASC
                    LIMIT ?
                    "#,
                )
                .bind(second_status)
                .bind(max_attempts as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        rows.iter().map(staging_row).collect()
    }

    async fn mark_promoted(&self, staging_id: StagingId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE staging_records
            SET promoted_to_business = 1, promoted_at = ?, promotion_error = NULL
            WHERE staging_id = ? AND promoted_to_business = 0
            "#,
        )
        .bind(micros(at))
        .bind(staging_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_promotion_failure(
        &self,
        staging_id: StagingId,
        message: &str,
        park: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE staging_records
            SET promotion_attempts = promotion_attempts + 1,
                promotion_error = ?,
                promotion_parked = MAX(promotion_parked, ?)
            WHERE staging_id = ? AND promoted_to_business = 0
            "#,
        )
        .bind(message)
        .bind(park)
        .bind(staging_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn insert_hub(&self, hub: &Hub) -> Result<HubInsert> {
        let key = hub.identity_key.to_hex();
        let tenant = hub.tenant_id.to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO hubs (identity_key, tenant_id, kind, natural_key, first_seen_at, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&key)
        .bind(&tenant)
        .bind(hub.kind.as_str())
        .bind(&hub.natural_key)
        .bind(micros(hub.first_seen_at))
        .bind(micros(hub.last_seen_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() > 0 {
            return Ok(HubInsert::Created);
        }

        // Conflict: either the same entity already exists or two natural keys collided
        let existing: Option<(String, String, String)> = sqlx::query_as(
            "SELECT tenant_id, kind, natural_key FROM hubs WHERE identity_key = ?",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match existing {
            Some((existing_tenant, kind, natural_key))
                if existing_tenant == tenant
                    && kind == hub.kind.as_str()
                    && natural_key == hub.natural_key => {}
            Some((_, kind, natural_key)) => {
                return Err(Error::IdentityCollision {
                    kind: kind.clone(),
                    key,
                    existing: format!("{}:{}", kind, natural_key),
                    incoming: format!("{}:{}", hub.kind, hub.natural_key),
                });
            }
            None => {
                // Same (tenant, kind, natural key) stored under another identity key
                return Err(Error::IdentityCollision {
                    kind: hub.kind.to_string(),
                    key,
                    existing: "<different identity key>".to_string(),
                    incoming: hub.natural_key.clone(),
                });
            }
        }

        sqlx::query(
            "UPDATE hubs SET last_seen_at = MAX(last_seen_at, ?) WHERE identity_key = ?",
        )
        .bind(micros(hub.last_seen_at))
        .bind(&key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(HubInsert::Existing)
    }

    async fn get_hub(
        &self,
        tenant_id: TenantId,
        kind: EntityKind,
        identity_key: &IdentityKey,
    ) -> Result<Option<Hub>> {
        sqlx::query("SELECT * FROM hubs WHERE identity_key = ? AND tenant_id = ? AND kind = ?")
            .bind(identity_key.to_hex())
            .bind(tenant_id.to_string())
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(hub_row)
            .transpose()
    }

    async fn insert_link(&self, link: &Link) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO links (link_key, tenant_id, kind, left_key, right_key, occurrence_key, occurred_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(link_key) DO NOTHING
            "#,
        )
        .bind(link.link_key.to_hex())
        .bind(link.tenant_id.to_string())
        .bind(link.kind.as_str())
        .bind(link.left_key.to_hex())
        .bind(link.right_key.to_hex())
        .bind(link.occurrence_key.map(|k| k.to_hex()))
        .bind(micros(link.occurred_at))
        .bind(micros(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn write_satellite(&self, version: &SatelliteVersion) -> Result<SatelliteWrite> {
        let tenant = version.tenant_id.to_string();
        let satellite = version.satellite.as_str();
        let owner = version.owner_key.to_hex();
        let valid_from = micros(version.valid_from);

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Close the current version if its fingerprint differs. Closing at
        // MAX(valid_from, new start) keeps intervals non-overlapping even
        // when clocks go backwards.
        sqlx::query(
            r#"
            UPDATE satellites
            SET valid_until = MAX(valid_from, ?)
            WHERE tenant_id = ? AND satellite = ? AND owner_key = ?
              AND valid_until IS NULL AND change_fingerprint <> ?
            "#,
        )
        .bind(valid_from)
        .bind(&tenant)
        .bind(satellite)
        .bind(&owner)
        .bind(&version.change_fingerprint)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO satellites (
                tenant_id, satellite, owner_key, valid_from, valid_until,
                change_fingerprint, attributes, loaded_at
            )
            SELECT ?, ?, ?,
                   MAX(?, COALESCE((
                       SELECT MAX(valid_until) FROM satellites
                       WHERE tenant_id = ? AND satellite = ? AND owner_key = ?
                   ), 0)),
                   NULL, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM satellites
                WHERE tenant_id = ? AND satellite = ? AND owner_key = ? AND valid_until IS NULL
            )
            "#,
        )
        .bind(&tenant)
        .bind(satellite)
        .bind(&owner)
        .bind(valid_from)
        .bind(&tenant)
        .bind(satellite)
        .bind(&owner)
        .bind(&version.change_fingerprint)
        .bind(serde_json::to_string(&version.attributes)?)
        .bind(micros(Utc::now()))
        .bind(&tenant)
        .bind(satellite)
        .bind(&owner)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        if result.rows_affected() > 0 {
            Ok(SatelliteWrite::Inserted)
        } else {
            Ok(SatelliteWrite::Unchanged)
        }
    }

    async fn satellite_history(
        &self,
        tenant_id: TenantId,
        satellite: SatelliteName,
        owner_key: &IdentityKey,
    ) -> Result<Vec<SatelliteVersion>> {
        sqlx::query(
            r#"
            SELECT * FROM satellites
            WHERE tenant_id = ? AND satellite = ? AND owner_key = ?
            ORDER BY valid_from ASC, satellite_id ASC
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(satellite.as_str())
        .bind(owner_key.to_hex())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(satellite_row)
        .collect()
    }

    async fn count_hubs(&self, tenant_id: TenantId, kind: EntityKind) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM hubs WHERE tenant_id = ? AND kind = ?")
                .bind(tenant_id.to_string())
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn count_links(&self, tenant_id: TenantId, kind: LinkKind) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM links WHERE tenant_id = ? AND kind = ?")
                .bind(tenant_id.to_string())
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn list_links(&self, tenant_id: TenantId, kind: LinkKind) -> Result<Vec<Link>> {
        sqlx::query(
            "SELECT * FROM links WHERE tenant_id = ? AND kind = ? ORDER BY occurred_at, link_key",
        )
        .bind(tenant_id.to_string())
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(link_row)
        .collect()
    }
}

#[async_trait]
impl RateLimitStore for SqliteStore {
    async fn record_request(
        &self,
        source_address: &str,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO rate_limit_events (source_address, endpoint, requested_at) VALUES (?, ?, ?)",
        )
        .bind(source_address)
        .bind(endpoint)
        .bind(micros(at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn window_stats(
        &self,
        source_address: &str,
        endpoint: &str,
        since: DateTime<Utc>,
    ) -> Result<(u64, Option<DateTime<Utc>>)> {
        let (count, oldest): (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MIN(requested_at) FROM rate_limit_events
            WHERE source_address = ? AND endpoint = ? AND requested_at > ?
            "#,
        )
        .bind(source_address)
        .bind(endpoint)
        .bind(micros(since))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok((count as u64, opt_from_micros(oldest)?))
    }

    async fn count_recent_from(&self, source_address: &str, since: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rate_limit_events WHERE source_address = ? AND requested_at >= ?",
        )
        .bind(source_address)
        .bind(micros(since))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn prune_rate_limits(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_events WHERE requested_at < ?")
            .bind(micros(before))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StatusStore for SqliteStore {
    async fn pipeline_status(
        &self,
        tenant_id: Option<TenantId>,
        day_start: DateTime<Utc>,
        include_suspicious: bool,
        max_attempts: u32,
    ) -> Result<PipelineStatus> {
        let tenant = tenant_id.map(|t| t.to_string());
        let second_status = eligible_second_status(include_suspicious);

        let (raw_pending, raw_error): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'ERROR' THEN 1 ELSE 0 END), 0)
            FROM raw_events
            WHERE status IN ('PENDING', 'ERROR') AND (? IS NULL OR tenant_id = ?)
            "#,
        )
        .bind(&tenant)
        .bind(&tenant)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let (staging_unpromoted, staging_parked): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN promotion_parked = 0 AND promotion_attempts < ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN promotion_parked = 1 OR promotion_attempts >= ? THEN 1 ELSE 0 END), 0)
            FROM staging_records
            WHERE promoted_to_business = 0
              AND validation_status IN ('VALID', ?)
              AND (? IS NULL OR tenant_id = ?)
            "#,
        )
        .bind(max_attempts as i64)
        .bind(max_attempts as i64)
        .bind(second_status)
        .bind(&tenant)
        .bind(&tenant)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let business_events_today: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM staging_records
            WHERE promoted_to_business = 1 AND promoted_at >= ? AND (? IS NULL OR tenant_id = ?)
            "#,
        )
        .bind(micros(day_start))
        .bind(&tenant)
        .bind(&tenant)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let avg_latency_seconds: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG((promoted_at - received_at) / 1000000.0) FROM staging_records
            WHERE promoted_to_business = 1 AND promoted_at >= ? AND (? IS NULL OR tenant_id = ?)
            "#,
        )
        .bind(micros(day_start))
        .bind(&tenant)
        .bind(&tenant)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(PipelineStatus {
            raw_pending: raw_pending as u64,
            raw_error: raw_error as u64,
            staging_unpromoted: staging_unpromoted as u64,
            staging_parked: staging_parked as u64,
            business_events_today: business_events_today as u64,
            avg_latency_seconds,
        })
    }

    async fn tenants_with_backlog(
        &self,
        now: DateTime<Utc>,
        include_suspicious: bool,
        max_attempts: u32,
    ) -> Result<Vec<TenantId>> {
        let tenants: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT tenant_id FROM raw_events
            WHERE status = 'PENDING' AND next_attempt_at <= ?
            UNION
            SELECT tenant_id FROM staging_records
            WHERE promoted_to_business = 0
              AND validation_status IN ('VALID', ?)
              AND promotion_parked = 0
              AND promotion_attempts < ?
            "#,
        )
        .bind(micros(now))
        .bind(eligible_second_status(include_suspicious))
        .bind(max_attempts as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        tenants.iter().map(|t| parse_tenant(t)).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

/// Expand tilde (~) in path
fn expand_tilde(path: PathBuf) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| Error::Internal("Could not determine home directory".to_string()))?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path),
    }
}
