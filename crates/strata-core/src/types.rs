//! Record types for the raw, staging and business layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::identity::{EntityKind, IdentityKey, LinkKind};
use crate::{Error, Result, TenantId};

/// Sequential identifier of a raw event
pub type RawId = i64;

/// Identifier of a staging record
pub type StagingId = i64;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Internal(format!(
                        concat!("Unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

/// Processing status of a raw event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RawStatus {
    Pending,
    Processed,
    Error,
}

string_enum!(RawStatus {
    Pending => "PENDING",
    Processed => "PROCESSED",
    Error => "ERROR",
});

/// Raw event as accepted by ingestion (append-only landing zone)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub raw_id: RawId,
    pub tenant_id: TenantId,
    pub received_at: DateTime<Utc>,
    pub source_address: String,
    pub user_agent: String,
    /// Schemaless payload, projected into typed fields only by staging
    pub payload: Value,
    pub status: RawStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Earliest time the orchestrator may pick the event up again
    pub next_attempt_at: DateTime<Utc>,
    pub risk_score: f64,
    pub suspicious: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Input for appending a raw event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRawEvent {
    pub tenant_id: TenantId,
    pub received_at: DateTime<Utc>,
    pub source_address: String,
    pub user_agent: String,
    pub payload: Value,
    pub risk_score: f64,
    pub suspicious: bool,
}

/// Outcome of structural validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Valid,
    Invalid,
    Suspicious,
}

string_enum!(ValidationStatus {
    Valid => "VALID",
    Invalid => "INVALID",
    Suspicious => "SUSPICIOUS",
});

/// Outcome of best-effort enrichment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrichmentStatus {
    Pending,
    Enriched,
    Failed,
}

string_enum!(EnrichmentStatus {
    Pending => "PENDING",
    Enriched => "ENRICHED",
    Failed => "FAILED",
});

/// Coarse device class derived from the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    Bot,
    Unknown,
}

string_enum!(DeviceType {
    Desktop => "desktop",
    Mobile => "mobile",
    Tablet => "tablet",
    Bot => "bot",
    Unknown => "unknown",
});

/// Campaign (UTM) parameters extracted from the page URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignParams {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
}

impl CampaignParams {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.medium.is_none()
            && self.campaign.is_none()
            && self.term.is_none()
            && self.content.is_none()
    }
}

/// Fields projected out of a raw payload by validation and enrichment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagingFields {
    pub event_type: Option<String>,
    pub event_timestamp: Option<DateTime<Utc>>,
    pub page_url: Option<String>,
    pub normalized_url: Option<String>,
    pub page_host: Option<String>,
    pub page_path: Option<String>,
    pub referrer: Option<String>,
    pub session_id: Option<String>,
    pub visitor_id: Option<String>,
    pub business_item: Option<String>,
    pub device_type: Option<DeviceType>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub campaign: CampaignParams,
    /// Freeform payload attributes not projected into typed fields
    pub attributes: Value,
}

/// Input for creating a staging record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStagingRecord {
    pub raw_id: RawId,
    pub tenant_id: TenantId,
    pub received_at: DateTime<Utc>,
    pub source_address: String,
    pub user_agent: String,
    pub fields: StagingFields,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<String>,
    pub quality_score: f64,
    pub enrichment_status: EnrichmentStatus,
}

/// Validated and enriched projection of exactly one raw event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub staging_id: StagingId,
    pub raw_id: RawId,
    pub tenant_id: TenantId,
    pub received_at: DateTime<Utc>,
    pub source_address: String,
    pub user_agent: String,
    pub fields: StagingFields,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<String>,
    pub quality_score: f64,
    pub enrichment_status: EnrichmentStatus,
    pub promoted_to_business: bool,
    pub promoted_at: Option<DateTime<Utc>>,
    pub promotion_attempts: u32,
    pub promotion_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Entity occurrence in a hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hub {
    pub identity_key: IdentityKey,
    pub tenant_id: TenantId,
    pub kind: EntityKind,
    pub natural_key: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Result of a get-or-create hub insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubInsert {
    Created,
    Existing,
}

/// Immutable relationship fact between hubs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub link_key: IdentityKey,
    pub tenant_id: TenantId,
    pub kind: LinkKind,
    pub left_key: IdentityKey,
    pub right_key: IdentityKey,
    /// Event key for occurrence-based links
    pub occurrence_key: Option<IdentityKey>,
    pub occurred_at: DateTime<Utc>,
}

/// Names of the satellites maintained by the graph builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SatelliteName {
    EventDetails,
    SessionContext,
    PageDetails,
}

string_enum!(SatelliteName {
    EventDetails => "event_details",
    SessionContext => "session_context",
    PageDetails => "page_details",
});

/// One temporal version of descriptive attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteVersion {
    pub tenant_id: TenantId,
    pub satellite: SatelliteName,
    pub owner_key: IdentityKey,
    pub valid_from: DateTime<Utc>,
    /// `None` marks the current version
    pub valid_until: Option<DateTime<Utc>>,
    pub change_fingerprint: String,
    pub attributes: Value,
}

/// Result of a fingerprint-compared satellite write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatelliteWrite {
    Inserted,
    Unchanged,
}

/// Backlog and throughput snapshot for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub raw_pending: u64,
    pub raw_error: u64,
    pub staging_unpromoted: u64,
    /// Eligible records no longer retried (attempts exhausted or invariant violation)
    pub staging_parked: u64,
    /// Events promoted since `day_start`, whatever their own timestamp
    pub business_events_today: u64,
    pub avg_latency_seconds: Option<f64>,
}
