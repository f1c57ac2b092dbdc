//! Validation and enrichment stage
//!
//! Projects a schemaless raw payload into typed staging fields. Malformed
//! input never fails the stage: every raw event yields exactly one staging
//! record carrying its validation detail, and the raw event is marked
//! PROCESSED whatever the validation outcome. Only store failures surface
//! as errors (and are retried by the orchestrator).

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

use strata_core::{
    PipelineStore, Result,
    types::{
        EnrichmentStatus, NewStagingRecord, RawEvent, StagingFields, StagingRecord,
        ValidationStatus,
    },
};

use crate::config::StagingConfig;
use crate::enrich::{classify_user_agent, extract_campaign, normalize_url};

/// Payload keys projected into typed fields; everything else is kept as attributes
const PROJECTED_KEYS: [&str; 7] = [
    "event_type",
    "timestamp",
    "page_url",
    "session_id",
    "visitor_id",
    "business_item",
    "referrer",
];

/// Prefix of validation notes that flag abuse rather than report an error
const SUSPICIOUS_PREFIX: &str = "suspicious: ";

pub struct Stager {
    store: Arc<dyn PipelineStore>,
    config: StagingConfig,
}

impl Stager {
    pub fn new(store: Arc<dyn PipelineStore>, config: StagingConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    /// Validate and enrich a raw event, persist the staging record and mark
    /// the raw event PROCESSED.
    ///
    /// Idempotent: a raw event that already has a staging record gets the
    /// existing record back.
    pub async fn process_raw(&self, raw: &RawEvent) -> Result<StagingRecord> {
        let record = self.evaluate(raw, Utc::now());
        let staged = self.store.insert_staging(record).await?;
        self.store.mark_processed(raw.raw_id, Utc::now()).await?;

        tracing::debug!(
            tenant_id = %raw.tenant_id,
            raw_id = raw.raw_id,
            staging_id = staged.staging_id,
            validation_status = %staged.validation_status,
            quality_score = staged.quality_score,
            "Raw event staged"
        );
        Ok(staged)
    }

    /// Pure projection of a raw event into a staging record
    pub fn evaluate(&self, raw: &RawEvent, now: DateTime<Utc>) -> NewStagingRecord {
        let config = &self.config;
        let mut errors: Vec<String> = Vec::new();
        let mut flags: Vec<String> = Vec::new();
        let mut penalty = 0.0;
        let mut fields = StagingFields {
            attributes: Value::Object(Map::new()),
            ..Default::default()
        };

        let ua = classify_user_agent(&raw.user_agent);
        fields.device_type = Some(ua.device_type);
        fields.browser = ua.browser;
        fields.os = ua.os;

        let Some(payload) = raw.payload.as_object() else {
            errors.push("payload is not a JSON object".to_string());
            for field in ["event_type", "timestamp", "page_url"] {
                errors.push(format!("missing required field: {}", field));
            }
            penalty += config.missing_event_type_penalty
                + config.missing_timestamp_penalty
                + config.missing_page_url_penalty;
            if raw.suspicious {
                flags.push(ingestion_flag(raw));
            }
            return self.finish(raw, fields, errors, flags, penalty, EnrichmentStatus::Failed);
        };

        // event_type
        match string_field(payload, "event_type") {
            Some(event_type) => {
                if event_type.chars().count() > config.max_event_type_length {
                    flags.push(format!(
                        "event_type longer than {} characters",
                        config.max_event_type_length
                    ));
                    penalty += config.long_event_type_penalty;
                }
                fields.event_type = Some(event_type);
            }
            None => {
                errors.push("missing required field: event_type".to_string());
                penalty += config.missing_event_type_penalty;
            }
        }

        // timestamp
        match payload.get("timestamp") {
            None | Some(Value::Null) => {
                errors.push("missing required field: timestamp".to_string());
                penalty += config.missing_timestamp_penalty;
            }
            Some(value) => match parse_timestamp(value) {
                Some(timestamp) => {
                    if timestamp > now + config.max_future_skew() {
                        flags.push("timestamp too far in the future".to_string());
                        penalty += config.future_timestamp_penalty;
                    }
                    fields.event_timestamp = Some(timestamp);
                }
                None => {
                    errors.push(format!("invalid timestamp: {}", value));
                    penalty += config.invalid_timestamp_penalty;
                }
            },
        }

        // page_url
        match string_field(payload, "page_url") {
            Some(page_url) => {
                if page_url.chars().count() > config.max_url_length {
                    flags.push(format!(
                        "page_url longer than {} characters",
                        config.max_url_length
                    ));
                    penalty += config.long_url_penalty;
                }
                if let Some(url) = normalize_url(&page_url) {
                    fields.normalized_url = Some(url.normalized);
                    fields.page_host = url.host;
                    fields.page_path = Some(url.path);
                }
                fields.campaign = extract_campaign(&page_url);
                fields.page_url = Some(page_url);
            }
            None => {
                errors.push("missing required field: page_url".to_string());
                penalty += config.missing_page_url_penalty;
            }
        }

        fields.session_id = string_field(payload, "session_id");
        fields.visitor_id = string_field(payload, "visitor_id");
        fields.business_item = string_field(payload, "business_item");
        fields.referrer = string_field(payload, "referrer");

        fields.attributes = Value::Object(
            payload
                .iter()
                .filter(|(key, _)| !PROJECTED_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        );

        if raw.suspicious {
            flags.push(ingestion_flag(raw));
        }

        self.finish(raw, fields, errors, flags, penalty, EnrichmentStatus::Enriched)
    }

    fn finish(
        &self,
        raw: &RawEvent,
        fields: StagingFields,
        errors: Vec<String>,
        flags: Vec<String>,
        penalty: f64,
        enrichment_status: EnrichmentStatus,
    ) -> NewStagingRecord {
        let quality_score = round_score(1.0 - penalty);

        let validation_status = if errors.len() > self.config.max_validation_errors
            || quality_score < self.config.min_quality_score
        {
            ValidationStatus::Invalid
        } else if !flags.is_empty() {
            ValidationStatus::Suspicious
        } else {
            ValidationStatus::Valid
        };

        let validation_errors = errors
            .into_iter()
            .chain(flags.into_iter().map(|f| format!("{}{}", SUSPICIOUS_PREFIX, f)))
            .collect();

        NewStagingRecord {
            raw_id: raw.raw_id,
            tenant_id: raw.tenant_id,
            received_at: raw.received_at,
            source_address: raw.source_address.clone(),
            user_agent: raw.user_agent.clone(),
            fields,
            validation_status,
            validation_errors,
            quality_score,
            enrichment_status,
        }
    }
}

fn ingestion_flag(raw: &RawEvent) -> String {
    format!("flagged at ingestion (risk score {:.2})", raw.risk_score)
}

/// Clamp to [0, 1] and round away float noise so 1.0 - 0.2 reads as 0.8
fn round_score(score: f64) -> f64 {
    (score.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

/// Non-empty string field; numbers are accepted and rendered as strings
fn string_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339 string, or integer epoch milliseconds
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::TenantId;
    use strata_core::types::{DeviceType, RawStatus};
    use strata_store_sqlite::SqliteStore;
    use tempfile::TempDir;

    const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn raw(payload: Value) -> RawEvent {
        let now = Utc::now();
        RawEvent {
            raw_id: 1,
            tenant_id: TenantId::new(),
            received_at: now,
            source_address: "203.0.113.9".to_string(),
            user_agent: BROWSER_UA.to_string(),
            payload,
            status: RawStatus::Pending,
            error_message: None,
            retry_count: 0,
            next_attempt_at: now,
            risk_score: 0.0,
            suspicious: false,
            processed_at: None,
        }
    }

    async fn stager() -> (TempDir, Stager) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("strata.db")).await.unwrap();
        (dir, Stager::new(Arc::new(store), StagingConfig::default()))
    }

    #[tokio::test]
    async fn test_complete_event_is_valid_and_enriched() {
        let (_dir, stager) = stager().await;
        let record = stager.evaluate(
            &raw(json!({
                "event_type": "page_view",
                "timestamp": "2024-05-01T10:00:00Z",
                "page_url": "https://Example.com/pricing/?utm_source=newsletter&utm_medium=email",
                "session_id": "s1",
                "visitor_id": 42,
                "plan": "pro"
            })),
            Utc::now(),
        );

        assert_eq!(record.validation_status, ValidationStatus::Valid);
        assert_eq!(record.quality_score, 1.0);
        assert!(record.validation_errors.is_empty());
        assert_eq!(record.enrichment_status, EnrichmentStatus::Enriched);

        let fields = &record.fields;
        assert_eq!(fields.event_type.as_deref(), Some("page_view"));
        assert_eq!(
            fields.normalized_url.as_deref(),
            Some("https://example.com/pricing")
        );
        assert_eq!(fields.page_path.as_deref(), Some("/pricing"));
        assert_eq!(fields.visitor_id.as_deref(), Some("42"));
        assert_eq!(fields.campaign.source.as_deref(), Some("newsletter"));
        assert_eq!(fields.device_type, Some(DeviceType::Desktop));
        assert_eq!(fields.browser.as_deref(), Some("Chrome"));
        assert_eq!(fields.attributes, json!({"plan": "pro"}));
    }

    #[tokio::test]
    async fn test_all_problems_are_collected() {
        let (_dir, stager) = stager().await;
        let record = stager.evaluate(&raw(json!({"timestamp": "yesterday"})), Utc::now());

        assert_eq!(record.validation_status, ValidationStatus::Invalid);
        assert_eq!(record.validation_errors.len(), 3);
        // 1.0 - 0.3 (event_type) - 0.1 (bad timestamp) - 0.2 (page_url)
        assert_eq!(record.quality_score, 0.4);
    }

    #[tokio::test]
    async fn test_missing_page_url_is_invalid() {
        let (_dir, stager) = stager().await;
        let record = stager.evaluate(
            &raw(json!({"event_type": "click", "timestamp": "2024-05-01T10:00:00Z"})),
            Utc::now(),
        );
        assert_eq!(record.validation_status, ValidationStatus::Invalid);
        assert!(record.quality_score <= 0.8);
        assert_eq!(
            record.validation_errors,
            vec!["missing required field: page_url".to_string()]
        );
    }

    #[tokio::test]
    async fn test_abuse_bounds_flag_suspicious() {
        let (_dir, stager) = stager().await;
        let now = Utc::now();
        let long_url = format!("https://example.com/{}", "a".repeat(2100));
        let record = stager.evaluate(
            &raw(json!({
                "event_type": "page_view",
                "timestamp": (now + chrono::Duration::days(3)).to_rfc3339(),
                "page_url": long_url,
            })),
            now,
        );

        assert_eq!(record.validation_status, ValidationStatus::Suspicious);
        assert_eq!(record.quality_score, 0.6);
        assert_eq!(record.validation_errors.len(), 2);
        assert!(
            record
                .validation_errors
                .iter()
                .all(|e| e.starts_with(SUSPICIOUS_PREFIX))
        );
    }

    #[tokio::test]
    async fn test_ingestion_risk_flag_carries_over() {
        let (_dir, stager) = stager().await;
        let mut event = raw(json!({
            "event_type": "page_view",
            "timestamp": 1714557600000i64,
            "page_url": "/home"
        }));
        event.suspicious = true;
        event.risk_score = 0.9;

        let record = stager.evaluate(&event, Utc::now());
        assert_eq!(record.validation_status, ValidationStatus::Suspicious);
        assert_eq!(record.quality_score, 1.0);
        assert!(record.fields.event_timestamp.is_some());
        assert_eq!(record.fields.page_host, None);
    }

    #[tokio::test]
    async fn test_non_object_payload_fails_enrichment() {
        let (_dir, stager) = stager().await;
        let record = stager.evaluate(&raw(json!(["not", "an", "object"])), Utc::now());
        assert_eq!(record.validation_status, ValidationStatus::Invalid);
        assert_eq!(record.enrichment_status, EnrichmentStatus::Failed);
        assert_eq!(record.validation_errors.len(), 4);
    }

    #[tokio::test]
    async fn test_process_raw_persists_and_marks_processed() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn PipelineStore> =
            Arc::new(SqliteStore::new(dir.path().join("strata.db")).await.unwrap());
        let stager = Stager::new(store.clone(), StagingConfig::default());

        let tenant = TenantId::new();
        let raw_id = store
            .append_raw(strata_core::types::NewRawEvent {
                tenant_id: tenant,
                received_at: Utc::now(),
                source_address: "203.0.113.9".to_string(),
                user_agent: BROWSER_UA.to_string(),
                payload: json!({"event_type": "click"}),
                risk_score: 0.0,
                suspicious: false,
            })
            .await
            .unwrap();
        let event = store.get_raw(raw_id).await.unwrap().unwrap();

        let first = stager.process_raw(&event).await.unwrap();
        assert_eq!(first.validation_status, ValidationStatus::Invalid);
        assert_eq!(
            store.get_raw(raw_id).await.unwrap().unwrap().status,
            RawStatus::Processed
        );

        // Replaying the same raw event returns the existing record
        let second = stager.process_raw(&event).await.unwrap();
        assert_eq!(first.staging_id, second.staging_id);
    }
}
