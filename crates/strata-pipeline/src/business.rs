//! Entity graph builder (business layer)
//!
//! Promotion turns one validated staging record into hubs, links and
//! satellites. Every write is insert-if-absent (or fingerprint-compared for
//! satellites), so re-running a half-finished promotion converges on the
//! same rows without duplicates. The staging record is marked promoted only
//! after every write succeeded.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use strata_core::{
    Error, PipelineStore, Result, TenantId,
    identity::{self, EntityKind, IdentityKey, LinkKind},
    types::{Hub, HubInsert, Link, SatelliteName, SatelliteVersion, SatelliteWrite, StagingRecord},
};

/// Row counts produced by one promotion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionOutcome {
    pub hubs_created: usize,
    pub links_created: usize,
    pub satellites_written: usize,
    /// `false` when the record had already been marked promoted
    pub newly_promoted: bool,
    pub event_key: Option<IdentityKey>,
}

/// Identity keys resolved for one event
#[derive(Debug, Clone)]
struct EventKeys {
    session: IdentityKey,
    visitor: IdentityKey,
    page: IdentityKey,
    event: IdentityKey,
    business_item: Option<IdentityKey>,
}

pub struct GraphBuilder {
    store: Arc<dyn PipelineStore>,
}

impl GraphBuilder {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Promote a staging record into the business layer.
    ///
    /// # Errors
    /// - `Error::InvalidRequest` if the record lacks a field promotion needs
    /// - `Error::IdentityCollision` if a resolved key belongs to another entity
    /// - store errors (transient; the record stays unpromoted)
    pub async fn promote(&self, record: &StagingRecord) -> Result<PromotionOutcome> {
        let tenant = record.tenant_id;
        let fields = &record.fields;
        let missing = |field: &str| {
            Error::InvalidRequest(format!(
                "Staging record {} cannot be promoted: missing {}",
                record.staging_id, field
            ))
        };

        let event_type = fields.event_type.as_deref().ok_or_else(|| missing("event_type"))?;
        let occurred_at = fields.event_timestamp.ok_or_else(|| missing("timestamp"))?;
        let page_nk = fields
            .normalized_url
            .as_deref()
            .ok_or_else(|| missing("page_url"))?;

        let visitor_nk = match fields.visitor_id.as_deref() {
            Some(id) => id.to_string(),
            None => visitor_fingerprint(&record.source_address, &record.user_agent),
        };
        let visitor = identity::resolve(tenant, EntityKind::Visitor, &visitor_nk)?;

        let session_nk = match fields.session_id.as_deref() {
            Some(id) => id.to_string(),
            None => format!("{}:{}", visitor.to_hex(), occurred_at.format("%Y-%m-%d")),
        };
        let event_nk = format!(
            "{}|{}|{}",
            occurred_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            session_nk,
            event_type
        );

        let keys = EventKeys {
            session: identity::resolve(tenant, EntityKind::Session, &session_nk)?,
            visitor,
            page: identity::resolve(tenant, EntityKind::Page, page_nk)?,
            event: identity::resolve(tenant, EntityKind::Event, &event_nk)?,
            business_item: fields
                .business_item
                .as_deref()
                .map(|item| identity::resolve(tenant, EntityKind::BusinessItem, item))
                .transpose()?,
        };

        let mut outcome = PromotionOutcome {
            event_key: Some(keys.event),
            ..Default::default()
        };

        // Hubs
        let mut hubs = vec![
            (EntityKind::Session, keys.session, session_nk.clone()),
            (EntityKind::Visitor, keys.visitor, visitor_nk),
            (EntityKind::Page, keys.page, page_nk.to_string()),
            (EntityKind::Event, keys.event, event_nk),
        ];
        if let (Some(key), Some(item)) = (keys.business_item, fields.business_item.as_deref()) {
            hubs.push((EntityKind::BusinessItem, key, item.to_string()));
        }
        for (kind, identity_key, natural_key) in hubs {
            let hub = Hub {
                identity_key,
                tenant_id: tenant,
                kind,
                natural_key,
                first_seen_at: occurred_at,
                last_seen_at: occurred_at,
            };
            if self.store.insert_hub(&hub).await? == HubInsert::Created {
                outcome.hubs_created += 1;
            }
        }

        // Links
        let type_key = event_type_key(tenant, event_type);
        let mut links = vec![
            link(tenant, LinkKind::SessionVisitor, keys.session, keys.visitor, None, occurred_at),
            link(tenant, LinkKind::EventSession, keys.event, keys.session, None, occurred_at),
            // One row per (page, event type); the first event observed is recorded
            Link {
                link_key: identity::link_key(tenant, LinkKind::EventPage, &[&keys.page, &type_key]),
                ..link(tenant, LinkKind::EventPage, keys.event, keys.page, None, occurred_at)
            },
            link(
                tenant,
                LinkKind::SessionPage,
                keys.session,
                keys.page,
                Some(keys.event),
                occurred_at,
            ),
        ];
        if let Some(item) = keys.business_item {
            links.push(link(
                tenant,
                LinkKind::EventBusinessItem,
                keys.event,
                item,
                Some(keys.event),
                occurred_at,
            ));
            links.push(link(
                tenant,
                LinkKind::VisitorBusinessItem,
                keys.visitor,
                item,
                Some(keys.event),
                occurred_at,
            ));
        }
        for link in &links {
            if self.store.insert_link(link).await? {
                outcome.links_created += 1;
            }
        }

        // Satellites
        let now = Utc::now();
        for (satellite, owner_key, attributes) in [
            (
                SatelliteName::EventDetails,
                keys.event,
                event_details(record, &session_nk),
            ),
            (
                SatelliteName::SessionContext,
                keys.session,
                session_context(record),
            ),
            (SatelliteName::PageDetails, keys.page, page_details(record)),
        ] {
            let version = SatelliteVersion {
                tenant_id: tenant,
                satellite,
                owner_key,
                valid_from: now,
                valid_until: None,
                change_fingerprint: identity::fingerprint(&attributes),
                attributes,
            };
            if self.store.write_satellite(&version).await? == SatelliteWrite::Inserted {
                outcome.satellites_written += 1;
            }
        }

        outcome.newly_promoted = self.store.mark_promoted(record.staging_id, now).await?;

        tracing::debug!(
            tenant_id = %tenant,
            staging_id = record.staging_id,
            event_key = %keys.event,
            hubs_created = outcome.hubs_created,
            links_created = outcome.links_created,
            satellites_written = outcome.satellites_written,
            "Staging record promoted"
        );

        Ok(outcome)
    }
}

fn link(
    tenant_id: TenantId,
    kind: LinkKind,
    left_key: IdentityKey,
    right_key: IdentityKey,
    occurrence_key: Option<IdentityKey>,
    occurred_at: DateTime<Utc>,
) -> Link {
    let link_key = match &occurrence_key {
        Some(occurrence) => identity::link_key(tenant_id, kind, &[&left_key, &right_key, occurrence]),
        None => identity::link_key(tenant_id, kind, &[&left_key, &right_key]),
    };
    Link {
        link_key,
        tenant_id,
        kind,
        left_key,
        right_key,
        occurrence_key,
        occurred_at,
    }
}

/// Natural key of an anonymous visitor
pub fn visitor_fingerprint(source_address: &str, user_agent: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", source_address, user_agent).as_bytes());
    format!("fp:{}", hex::encode(digest))
}

/// Dedup participant for Event-Page links; event types are not hubs
fn event_type_key(tenant_id: TenantId, event_type: &str) -> IdentityKey {
    let mut hasher = Sha256::new();
    hasher.update(b"event_type:");
    hasher.update(event_type.as_bytes());
    hasher.update([0x1f]);
    hasher.update(tenant_id.as_uuid().as_bytes());
    IdentityKey::from_bytes(hasher.finalize().into())
}

fn event_details(record: &StagingRecord, session_nk: &str) -> Value {
    let fields = &record.fields;
    json!({
        "event_type": fields.event_type,
        "timestamp": fields.event_timestamp.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
        "page_url": fields.page_url,
        "normalized_url": fields.normalized_url,
        "referrer": fields.referrer,
        "session": session_nk,
        "visitor_id": fields.visitor_id,
        "business_item": fields.business_item,
        "quality_score": record.quality_score,
        "validation_status": record.validation_status.as_str(),
        "raw_id": record.raw_id,
        "attributes": fields.attributes,
    })
}

fn session_context(record: &StagingRecord) -> Value {
    let fields = &record.fields;
    json!({
        "device_type": fields.device_type.map(|d| d.as_str()),
        "browser": fields.browser,
        "os": fields.os,
        "utm_source": fields.campaign.source,
        "utm_medium": fields.campaign.medium,
        "utm_campaign": fields.campaign.campaign,
        "utm_term": fields.campaign.term,
        "utm_content": fields.campaign.content,
    })
}

fn page_details(record: &StagingRecord) -> Value {
    let fields = &record.fields;
    json!({
        "host": fields.page_host,
        "path": fields.page_path,
        "normalized_url": fields.normalized_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::types::{
        CampaignParams, DeviceType, EnrichmentStatus, NewStagingRecord, StagingFields,
        ValidationStatus,
    };
    use strata_store_sqlite::SqliteStore;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<dyn PipelineStore>, GraphBuilder) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn PipelineStore> =
            Arc::new(SqliteStore::new(dir.path().join("strata.db")).await.unwrap());
        let builder = GraphBuilder::new(store.clone());
        (dir, store, builder)
    }

    async fn staged(
        store: &Arc<dyn PipelineStore>,
        tenant: TenantId,
        raw_id: i64,
        fields: StagingFields,
    ) -> StagingRecord {
        store
            .insert_staging(NewStagingRecord {
                raw_id,
                tenant_id: tenant,
                received_at: Utc::now(),
                source_address: "203.0.113.9".to_string(),
                user_agent: "Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0".to_string(),
                fields,
                validation_status: ValidationStatus::Valid,
                validation_errors: vec![],
                quality_score: 1.0,
                enrichment_status: EnrichmentStatus::Enriched,
            })
            .await
            .unwrap()
    }

    fn fields(url: &str, seconds: i64) -> StagingFields {
        StagingFields {
            event_type: Some("page_view".to_string()),
            event_timestamp: DateTime::from_timestamp(1_714_557_600 + seconds, 0),
            page_url: Some(url.to_string()),
            normalized_url: Some(url.to_string()),
            page_host: Some("example.com".to_string()),
            page_path: Some("/".to_string()),
            session_id: Some("s1".to_string()),
            visitor_id: Some("v1".to_string()),
            device_type: Some(DeviceType::Desktop),
            campaign: CampaignParams::default(),
            attributes: json!({}),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_promote_creates_graph() {
        let (_dir, store, builder) = setup().await;
        let tenant = TenantId::new();
        let mut f = fields("https://example.com/cart", 0);
        f.business_item = Some("sku-1".to_string());
        let record = staged(&store, tenant, 1, f).await;

        let outcome = builder.promote(&record).await.unwrap();
        assert_eq!(outcome.hubs_created, 5);
        assert_eq!(outcome.links_created, 6);
        assert_eq!(outcome.satellites_written, 3);
        assert!(outcome.newly_promoted);

        let promoted = store.get_staging(record.staging_id).await.unwrap().unwrap();
        assert!(promoted.promoted_to_business);
        assert_eq!(
            store
                .count_links(tenant, LinkKind::VisitorBusinessItem)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_promote_twice_converges() {
        let (_dir, store, builder) = setup().await;
        let tenant = TenantId::new();
        let record = staged(&store, tenant, 1, fields("https://example.com/", 0)).await;

        builder.promote(&record).await.unwrap();
        let second = builder.promote(&record).await.unwrap();
        assert_eq!(second.hubs_created, 0);
        assert_eq!(second.links_created, 0);
        assert_eq!(second.satellites_written, 0);
        assert!(!second.newly_promoted);

        for kind in EntityKind::ALL {
            let expected = if kind == EntityKind::BusinessItem { 0 } else { 1 };
            assert_eq!(store.count_hubs(tenant, kind).await.unwrap(), expected);
        }
        for kind in [
            LinkKind::SessionVisitor,
            LinkKind::EventSession,
            LinkKind::EventPage,
            LinkKind::SessionPage,
        ] {
            assert_eq!(store.count_links(tenant, kind).await.unwrap(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_promotions_converge() {
        let (dir, store, builder) = setup().await;
        // A second worker with its own connection pool on the same database
        let other: Arc<dyn PipelineStore> =
            Arc::new(SqliteStore::new(dir.path().join("strata.db")).await.unwrap());
        let builders = [Arc::new(builder), Arc::new(GraphBuilder::new(other))];
        let tenant = TenantId::new();

        for raw_id in 1..=5 {
            let record = staged(&store, tenant, raw_id, fields("https://example.com/", raw_id)).await;
            let handles = builders.clone().map(|builder| {
                let record = record.clone();
                tokio::spawn(async move { builder.promote(&record).await })
            });
            let [a, b] = handles;
            let (a, b) = tokio::join!(a, b);
            let a = a.unwrap().unwrap();
            let b = b.unwrap().unwrap();

            assert!(a.newly_promoted ^ b.newly_promoted);
            assert_eq!(a.hubs_created + b.hubs_created, if raw_id == 1 { 4 } else { 1 });
            assert_eq!(a.satellites_written + b.satellites_written, if raw_id == 1 { 3 } else { 1 });
        }

        assert_eq!(store.count_hubs(tenant, EntityKind::Event).await.unwrap(), 5);
        assert_eq!(store.count_hubs(tenant, EntityKind::Session).await.unwrap(), 1);
        assert_eq!(store.count_hubs(tenant, EntityKind::Visitor).await.unwrap(), 1);
        assert_eq!(store.count_hubs(tenant, EntityKind::Page).await.unwrap(), 1);
        assert_eq!(store.count_links(tenant, LinkKind::SessionPage).await.unwrap(), 5);
        assert_eq!(store.count_links(tenant, LinkKind::EventSession).await.unwrap(), 5);
        assert_eq!(store.count_links(tenant, LinkKind::EventPage).await.unwrap(), 1);
        assert_eq!(store.count_links(tenant, LinkKind::SessionVisitor).await.unwrap(), 1);

        let session = identity::resolve(tenant, EntityKind::Session, "s1").unwrap();
        let page = identity::resolve(tenant, EntityKind::Page, "https://example.com/").unwrap();
        for (satellite, owner) in [
            (SatelliteName::SessionContext, session),
            (SatelliteName::PageDetails, page),
        ] {
            let history = store.satellite_history(tenant, satellite, &owner).await.unwrap();
            assert_eq!(history.len(), 1);
            assert!(history[0].valid_until.is_none());
        }
    }

    #[tokio::test]
    async fn test_session_page_links_are_per_visit() {
        let (_dir, store, builder) = setup().await;
        let tenant = TenantId::new();
        for (raw_id, seconds) in [(1, 0), (2, 30)] {
            let record = staged(&store, tenant, raw_id, fields("https://example.com/", seconds)).await;
            builder.promote(&record).await.unwrap();
        }

        assert_eq!(store.count_hubs(tenant, EntityKind::Event).await.unwrap(), 2);
        assert_eq!(store.count_links(tenant, LinkKind::SessionPage).await.unwrap(), 2);
        assert_eq!(store.count_links(tenant, LinkKind::EventPage).await.unwrap(), 1);
        assert_eq!(store.count_links(tenant, LinkKind::SessionVisitor).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_anonymous_visitor_and_derived_session() {
        let (_dir, store, builder) = setup().await;
        let tenant = TenantId::new();
        let mut f = fields("https://example.com/", 0);
        f.session_id = None;
        f.visitor_id = None;
        let record = staged(&store, tenant, 1, f).await;

        builder.promote(&record).await.unwrap();

        let visitor_nk = visitor_fingerprint(&record.source_address, &record.user_agent);
        assert!(visitor_nk.starts_with("fp:"));
        let visitor = identity::resolve(tenant, EntityKind::Visitor, &visitor_nk).unwrap();
        let session_nk = format!("{}:2024-05-01", visitor.to_hex());
        let session = identity::resolve(tenant, EntityKind::Session, &session_nk).unwrap();
        let hub = store
            .get_hub(tenant, EntityKind::Session, &session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hub.natural_key, session_nk);
    }

    #[tokio::test]
    async fn test_session_context_versions_on_change() {
        let (_dir, store, builder) = setup().await;
        let tenant = TenantId::new();

        let first = staged(&store, tenant, 1, fields("https://example.com/", 0)).await;
        builder.promote(&first).await.unwrap();

        let mut f = fields("https://example.com/", 60);
        f.device_type = Some(DeviceType::Mobile);
        let second = staged(&store, tenant, 2, f).await;
        builder.promote(&second).await.unwrap();

        let session = identity::resolve(tenant, EntityKind::Session, "s1").unwrap();
        let history = store
            .satellite_history(tenant, SatelliteName::SessionContext, &session)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].valid_until.is_some());
        assert!(history[1].valid_until.is_none());
        assert_eq!(history[1].attributes["device_type"], "mobile");
    }

    #[tokio::test]
    async fn test_missing_fields_are_rejected() {
        let (_dir, store, builder) = setup().await;
        let mut f = fields("https://example.com/", 0);
        f.normalized_url = None;
        let record = staged(&store, TenantId::new(), 1, f).await;

        let err = builder.promote(&record).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(
            !store
                .get_staging(record.staging_id)
                .await
                .unwrap()
                .unwrap()
                .promoted_to_business
        );
    }
}
