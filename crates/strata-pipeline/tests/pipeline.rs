//! End-to-end pipeline tests against a real SQLite store

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;

use strata_core::{
    AuditEmitter, EntityKind, Error, LinkKind, MemoryAuditSink, PipelineStore, RequestContext,
    Tenant, TenantId,
    identity,
    types::{Hub, RawStatus, ValidationStatus},
};
use strata_observability::Metrics;
use strata_pipeline::{
    IngestRequest, Orchestrator, Pipeline, PipelineConfig, TriggerMode, enrich::normalize_url,
};
use strata_store_sqlite::SqliteStore;

const BROWSER_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36";

struct Harness {
    _dir: TempDir,
    sqlite: SqliteStore,
    store: Arc<dyn PipelineStore>,
    tenant: TenantId,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let sqlite = SqliteStore::new(dir.path().join("strata.db")).await.unwrap();
    let store: Arc<dyn PipelineStore> = Arc::new(sqlite.clone());
    let tenant = TenantId::new();
    store
        .upsert_tenant(&Tenant::new(tenant, "acme"))
        .await
        .unwrap();
    Harness {
        _dir: dir,
        sqlite,
        store,
        tenant,
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn page_view(session: &str, url: &str, at: DateTime<Utc>) -> Value {
    json!({
        "event_type": "page_view",
        "timestamp": ts(at),
        "page_url": url,
        "session_id": session,
        "visitor_id": "visitor-1",
    })
}

fn request(payload: Value) -> IngestRequest {
    IngestRequest {
        source_address: "203.0.113.7".to_string(),
        user_agent: BROWSER_UA.to_string(),
        payload,
    }
}

fn ctx(tenant: TenantId) -> RequestContext {
    RequestContext::new(Some(tenant), "api-key:test")
}

#[tokio::test]
async fn test_three_page_views_build_expected_graph() {
    let h = harness().await;
    let pipeline = Pipeline::builder(h.store.clone(), PipelineConfig::default()).build();
    let start = Utc::now() - Duration::minutes(5);

    for (i, url) in [
        "https://shop.example.com/",
        "https://shop.example.com/products/42",
        "https://shop.example.com/",
    ]
    .into_iter()
    .enumerate()
    {
        let at = start + Duration::seconds(i as i64 * 10);
        let response = pipeline
            .ingestor()
            .ingest(&ctx(h.tenant), request(page_view("sess-1", url, at)))
            .await
            .unwrap();
        assert!(response.accepted, "rejected: {:?}", response.reason);
        assert!(!response.suspicious);
    }

    let report = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    assert_eq!(report.raw_processed(), 3);
    assert_eq!(report.promoted(), 3);
    assert_eq!(report.errors(), 0);

    let hubs = |kind| {
        let store = h.store.clone();
        let tenant = h.tenant;
        async move { store.count_hubs(tenant, kind).await.unwrap() }
    };
    assert_eq!(hubs(EntityKind::Session).await, 1);
    assert_eq!(hubs(EntityKind::Visitor).await, 1);
    assert_eq!(hubs(EntityKind::Page).await, 2);
    assert_eq!(hubs(EntityKind::Event).await, 3);
    assert_eq!(hubs(EntityKind::BusinessItem).await, 0);

    let links = |kind| {
        let store = h.store.clone();
        let tenant = h.tenant;
        async move { store.count_links(tenant, kind).await.unwrap() }
    };
    assert_eq!(links(LinkKind::SessionVisitor).await, 1);
    assert_eq!(links(LinkKind::EventSession).await, 3);
    assert_eq!(links(LinkKind::EventPage).await, 2);
    // One row per visit, including the return to the home page
    assert_eq!(links(LinkKind::SessionPage).await, 3);

    let status = pipeline.orchestrator().status(Some(h.tenant)).await.unwrap();
    assert_eq!(status.raw_pending, 0);
    assert_eq!(status.raw_error, 0);
    assert_eq!(status.staging_unpromoted, 0);
    assert_eq!(status.staging_parked, 0);
    assert_eq!(status.business_events_today, 3);
    assert!(status.avg_latency_seconds.is_some());
}

#[tokio::test]
async fn test_backdated_event_counts_as_loaded_today() {
    let h = harness().await;
    let pipeline = Pipeline::builder(h.store.clone(), PipelineConfig::default()).build();
    let at = Utc::now() - Duration::days(3);

    let response = pipeline
        .ingestor()
        .ingest(
            &ctx(h.tenant),
            request(page_view("sess-old", "https://shop.example.com/", at)),
        )
        .await
        .unwrap();
    assert!(response.accepted);

    let report = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    assert_eq!(report.promoted(), 1);

    let status = pipeline.orchestrator().status(Some(h.tenant)).await.unwrap();
    assert_eq!(status.business_events_today, 1);
    assert!(status.avg_latency_seconds.is_some());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let h = harness().await;
    let pipeline = Pipeline::builder(h.store.clone(), PipelineConfig::default()).build();
    let at = Utc::now() - Duration::minutes(1);

    let mut payload = page_view("sess-1", "https://shop.example.com/cart", at);
    payload["business_item"] = json!("sku-123");
    pipeline
        .ingestor()
        .ingest(&ctx(h.tenant), request(payload))
        .await
        .unwrap();

    let first = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    assert_eq!(first.promoted(), 1);

    let second = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    assert_eq!(second.raw_processed(), 0);
    assert_eq!(second.promoted(), 0);
    assert_eq!(second.batches[0].staging_fetched, 0);

    assert_eq!(
        h.store.count_hubs(h.tenant, EntityKind::BusinessItem).await.unwrap(),
        1
    );
    assert_eq!(
        h.store
            .count_links(h.tenant, LinkKind::EventBusinessItem)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        h.store
            .count_links(h.tenant, LinkKind::VisitorBusinessItem)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_missing_page_url_is_staged_invalid_and_never_promoted() {
    let h = harness().await;
    let pipeline = Pipeline::builder(h.store.clone(), PipelineConfig::default()).build();

    let response = pipeline
        .ingestor()
        .ingest(
            &ctx(h.tenant),
            request(json!({
                "event_type": "click",
                "timestamp": ts(Utc::now()),
                "session_id": "sess-9",
            })),
        )
        .await
        .unwrap();
    assert!(response.accepted);
    let raw_id = response.event_id.unwrap();

    for _ in 0..3 {
        pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    }

    let raw = h.store.get_raw(raw_id).await.unwrap().unwrap();
    assert_eq!(raw.status, RawStatus::Processed);

    let staged = h.store.get_staging_by_raw(raw_id).await.unwrap().unwrap();
    assert_eq!(staged.validation_status, ValidationStatus::Invalid);
    assert!(staged.quality_score <= 0.8);
    assert!(
        staged
            .validation_errors
            .iter()
            .any(|e| e.contains("page_url"))
    );
    assert!(!staged.promoted_to_business);
    assert_eq!(staged.promotion_attempts, 0);
    assert_eq!(
        h.store.count_hubs(h.tenant, EntityKind::Event).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_rate_limit_rejects_request_over_limit() {
    let h = harness().await;
    let mut config = PipelineConfig::default();
    config.rate_limit.limit = 3;
    let metrics = Arc::new(Metrics::new().unwrap());
    let pipeline = Pipeline::builder(h.store.clone(), config)
        .metrics(metrics.clone())
        .build();

    let payload = page_view("sess-1", "https://shop.example.com/", Utc::now());
    for _ in 0..3 {
        let response = pipeline
            .ingestor()
            .ingest(&ctx(h.tenant), request(payload.clone()))
            .await
            .unwrap();
        assert!(response.accepted);
    }

    let limited = pipeline
        .ingestor()
        .ingest(&ctx(h.tenant), request(payload.clone()))
        .await
        .unwrap();
    assert!(!limited.accepted);
    assert_eq!(limited.reason.as_deref(), Some("rate limit exceeded"));
    assert_eq!(limited.event_id, None);

    // Another source has its own window
    let mut other = request(payload);
    other.source_address = "198.51.100.20".to_string();
    assert!(
        pipeline
            .ingestor()
            .ingest(&ctx(h.tenant), other)
            .await
            .unwrap()
            .accepted
    );

    let pending = h
        .store
        .fetch_pending(Some(h.tenant), 100, Utc::now())
        .await
        .unwrap();
    assert_eq!(pending.len(), 4);
    assert_eq!(
        metrics
            .ingest_requests_total
            .with_label_values(&["rate_limited"])
            .get(),
        1.0
    );
}

#[tokio::test]
async fn test_tenant_rejections_store_nothing() {
    let h = harness().await;
    let sink = Arc::new(MemoryAuditSink::new());
    let pipeline = Pipeline::builder(h.store.clone(), PipelineConfig::default())
        .audit(AuditEmitter::new(sink.clone()))
        .build();
    let payload = page_view("sess-1", "https://shop.example.com/", Utc::now());

    let no_tenant = pipeline
        .ingestor()
        .ingest(
            &RequestContext::new(None, "anonymous"),
            request(payload.clone()),
        )
        .await
        .unwrap();
    assert!(!no_tenant.accepted);
    assert_eq!(no_tenant.reason.as_deref(), Some("tenant required"));

    let unknown = pipeline
        .ingestor()
        .ingest(&ctx(TenantId::new()), request(payload.clone()))
        .await
        .unwrap();
    assert_eq!(unknown.reason.as_deref(), Some("unknown tenant"));

    h.store.set_tenant_active(h.tenant, false).await.unwrap();
    let inactive = pipeline
        .ingestor()
        .ingest(&ctx(h.tenant), request(payload))
        .await
        .unwrap();
    assert_eq!(inactive.reason.as_deref(), Some("tenant inactive"));

    let pending = h.store.fetch_pending(None, 100, Utc::now()).await.unwrap();
    assert!(pending.is_empty());
    assert_eq!(sink.events_of_type("raw_event.ingest.failure").len(), 3);
    assert!(sink.events_of_type("raw_event.ingest.success").is_empty());
}

#[tokio::test]
async fn test_transient_failures_retry_then_park_in_error() {
    let h = harness().await;
    let mut config = PipelineConfig::default();
    config.orchestrator.max_retries = 2;
    config.orchestrator.retry_base_delay_ms = 0;
    config.orchestrator.retry_max_delay_ms = 0;
    let pipeline = Pipeline::builder(h.store.clone(), config).build();

    let response = pipeline
        .ingestor()
        .ingest(
            &ctx(h.tenant),
            request(page_view("sess-1", "https://shop.example.com/", Utc::now())),
        )
        .await
        .unwrap();
    let raw_id = response.event_id.unwrap();

    sqlx::query(
        "CREATE TRIGGER fail_staging BEFORE INSERT ON staging_records \
         BEGIN SELECT RAISE(ABORT, 'staging unavailable'); END;",
    )
    .execute(h.sqlite.pool())
    .await
    .unwrap();

    for expected_retries in 1..=2 {
        let report = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
        assert_eq!(report.batches[0].raw_retried, 1);
        let raw = h.store.get_raw(raw_id).await.unwrap().unwrap();
        assert_eq!(raw.status, RawStatus::Pending);
        assert_eq!(raw.retry_count, expected_retries);
        assert!(raw.error_message.is_some());
    }

    let report = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    assert_eq!(report.batches[0].raw_errored, 1);
    let raw = h.store.get_raw(raw_id).await.unwrap().unwrap();
    assert_eq!(raw.status, RawStatus::Error);

    // Parked events are no longer picked up, even once the store recovers
    sqlx::query("DROP TRIGGER fail_staging")
        .execute(h.sqlite.pool())
        .await
        .unwrap();
    let report = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    assert_eq!(report.raw_processed(), 0);
    let status = pipeline.orchestrator().status(Some(h.tenant)).await.unwrap();
    assert_eq!(status.raw_error, 1);
    assert_eq!(status.raw_pending, 0);
}

#[tokio::test]
async fn test_identity_collision_parks_record_and_spares_siblings() {
    let h = harness().await;
    let sink = Arc::new(MemoryAuditSink::new());
    let pipeline = Pipeline::builder(h.store.clone(), PipelineConfig::default())
        .audit(AuditEmitter::new(sink.clone()))
        .build();
    let at = Utc::now() - Duration::minutes(2);

    let broken_url = "https://shop.example.com/broken";
    let page_nk = normalize_url(broken_url).unwrap().normalized;
    let key = identity::resolve(h.tenant, EntityKind::Page, &page_nk).unwrap();
    h.store
        .insert_hub(&Hub {
            identity_key: key,
            tenant_id: h.tenant,
            kind: EntityKind::Page,
            natural_key: "https://shop.example.com/something-else".to_string(),
            first_seen_at: at,
            last_seen_at: at,
        })
        .await
        .unwrap();

    let broken = pipeline
        .ingestor()
        .ingest(&ctx(h.tenant), request(page_view("sess-1", broken_url, at)))
        .await
        .unwrap()
        .event_id
        .unwrap();
    pipeline
        .ingestor()
        .ingest(
            &ctx(h.tenant),
            request(page_view(
                "sess-1",
                "https://shop.example.com/fine",
                at + Duration::seconds(1),
            )),
        )
        .await
        .unwrap();

    let report = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    let batch = &report.batches[0];
    assert_eq!(batch.promoted, 1);
    assert_eq!(batch.promotion_failed, 1);
    assert_eq!(batch.promotion_parked, 1);

    let staged = h.store.get_staging_by_raw(broken).await.unwrap().unwrap();
    assert!(!staged.promoted_to_business);
    assert_eq!(staged.promotion_attempts, 1);
    assert!(staged.promotion_error.is_some());

    let failures = sink.events_of_type("promotion.promote.failure");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].details["invariant_violation"], json!(true));

    // Parked: later runs leave it alone
    let again = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    assert_eq!(again.batches[0].staging_fetched, 0);
    let status = pipeline.orchestrator().status(Some(h.tenant)).await.unwrap();
    assert_eq!(status.staging_parked, 1);
    assert_eq!(status.staging_unpromoted, 0);
}

#[tokio::test]
async fn test_expired_deadline_returns_partial_batch_and_resumes() {
    let h = harness().await;
    let pipeline = Pipeline::builder(h.store.clone(), PipelineConfig::default()).build();
    let start = Utc::now() - Duration::minutes(3);
    for i in 0..4 {
        pipeline
            .ingestor()
            .ingest(
                &ctx(h.tenant),
                request(page_view(
                    "sess-1",
                    "https://shop.example.com/",
                    start + Duration::seconds(i),
                )),
            )
            .await
            .unwrap();
    }

    let mut rushed = PipelineConfig::default();
    rushed.orchestrator.batch_deadline_ms = 0;
    let rushed = Orchestrator::new(h.store.clone(), &rushed, AuditEmitter::disabled());
    let partial = rushed.run_once(Some(h.tenant)).await.unwrap();
    assert!(partial.timed_out());
    assert_eq!(partial.raw_processed(), 0);
    assert_eq!(partial.promoted(), 0);

    let full = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    assert!(!full.timed_out());
    assert_eq!(full.raw_processed(), 4);
    assert_eq!(full.promoted(), 4);
}

#[tokio::test]
async fn test_overlapping_batches_for_one_tenant_are_skipped() {
    let h = harness().await;
    let pipeline = Pipeline::builder(h.store.clone(), PipelineConfig::default()).build();
    pipeline
        .ingestor()
        .ingest(
            &ctx(h.tenant),
            request(page_view("sess-1", "https://shop.example.com/", Utc::now())),
        )
        .await
        .unwrap();

    let orchestrator = pipeline.orchestrator();
    let (a, b) = tokio::join!(
        orchestrator.run_tenant(h.tenant),
        orchestrator.run_tenant(h.tenant)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.skipped != b.skipped, "exactly one batch should be skipped");
    assert_eq!(a.raw_processed + b.raw_processed, 1);
    assert_eq!(
        h.store.count_hubs(h.tenant, EntityKind::Event).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_tenants_are_processed_in_isolation() {
    let h = harness().await;
    let other = TenantId::new();
    h.store
        .upsert_tenant(&Tenant::new(other, "globex"))
        .await
        .unwrap();
    let pipeline = Pipeline::builder(h.store.clone(), PipelineConfig::default()).build();
    let at = Utc::now() - Duration::minutes(1);

    // Same natural keys under two tenants
    for tenant in [h.tenant, other] {
        pipeline
            .ingestor()
            .ingest(
                &ctx(tenant),
                request(page_view("sess-1", "https://shop.example.com/", at)),
            )
            .await
            .unwrap();
    }

    let scoped = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    assert_eq!(scoped.batches.len(), 1);
    assert_eq!(scoped.promoted(), 1);
    assert_eq!(
        h.store.count_hubs(other, EntityKind::Event).await.unwrap(),
        0
    );

    let remaining = pipeline.orchestrator().run_if_needed(None).await.unwrap();
    assert_eq!(remaining.batches.len(), 1);
    assert_eq!(remaining.batches[0].tenant_id, other);
    assert_eq!(
        h.store.count_hubs(other, EntityKind::Event).await.unwrap(),
        1
    );
    assert!(
        pipeline
            .orchestrator()
            .run_if_needed(None)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_immediate_mode_promotes_during_ingestion() {
    let h = harness().await;
    let mut config = PipelineConfig::default();
    config.orchestrator.trigger_mode = TriggerMode::Immediate;
    let pipeline = Pipeline::builder(h.store.clone(), config).build();

    let response = pipeline
        .ingestor()
        .ingest(
            &ctx(h.tenant),
            request(page_view("sess-1", "https://shop.example.com/", Utc::now())),
        )
        .await
        .unwrap();
    assert!(response.accepted);

    let staged = h
        .store
        .get_staging_by_raw(response.event_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(staged.promoted_to_business);
    assert_eq!(
        h.store.count_hubs(h.tenant, EntityKind::Event).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_deferred_mode_worker_pool_processes_queue() {
    let h = harness().await;
    let mut config = PipelineConfig::default();
    config.worker.pool_size = 2;
    config.worker.sweep_interval_secs = 3600;
    let pipeline = Pipeline::builder(h.store.clone(), config).spawn();
    assert!(pipeline.worker().is_some());

    pipeline
        .ingestor()
        .ingest(
            &ctx(h.tenant),
            request(page_view("sess-1", "https://shop.example.com/", Utc::now())),
        )
        .await
        .unwrap();

    let mut promoted = 0;
    for _ in 0..250 {
        promoted = h.store.count_hubs(h.tenant, EntityKind::Event).await.unwrap();
        if promoted == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(promoted, 1);

    pipeline.shutdown().await;
    let worker = pipeline.worker().unwrap();
    assert!(!worker.notify(h.tenant));
}

#[tokio::test]
async fn test_suspicious_events_wait_unless_promotion_allowed() {
    let h = harness().await;
    let mut config = PipelineConfig::default();
    config.risk.threshold = 0.5;
    let pipeline = Pipeline::builder(h.store.clone(), config.clone()).build();

    let mut req = request(page_view("sess-1", "https://shop.example.com/", Utc::now()));
    req.source_address = "10.0.0.5".to_string();
    req.user_agent = "curl/8.4.0".to_string();
    let response = pipeline.ingestor().ingest(&ctx(h.tenant), req).await.unwrap();
    assert!(response.accepted);
    assert!(response.suspicious);
    assert!(response.risk_score > 0.5);

    let report = pipeline.orchestrator().run_once(Some(h.tenant)).await.unwrap();
    assert_eq!(report.batches[0].staged_suspicious, 1);
    assert_eq!(report.promoted(), 0);

    config.staging.promote_suspicious = true;
    let lenient = Orchestrator::new(h.store.clone(), &config, AuditEmitter::disabled());
    let report = lenient.run_once(Some(h.tenant)).await.unwrap();
    assert_eq!(report.promoted(), 1);
}

#[tokio::test]
async fn test_run_once_without_tenant_reports_every_tenant() {
    let h = harness().await;
    let idle = TenantId::new();
    h.store
        .upsert_tenant(&Tenant::new(idle, "idle"))
        .await
        .unwrap();
    let pipeline = Pipeline::builder(h.store.clone(), PipelineConfig::default()).build();

    let report = pipeline.orchestrator().run_once(None).await.unwrap();
    assert_eq!(report.batches.len(), 2);
    assert!(report.failures.is_empty());
    assert_eq!(report.raw_processed(), 0);
}

#[test]
fn test_collision_error_is_an_invariant_violation() {
    let err = Error::IdentityCollision {
        kind: "page".to_string(),
        key: "00".to_string(),
        existing: "page:a".to_string(),
        incoming: "page:b".to_string(),
    };
    assert!(err.is_invariant_violation());
    assert!(!err.is_transient());
}
