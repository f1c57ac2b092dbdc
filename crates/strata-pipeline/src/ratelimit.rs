//! Sliding-window rate limiting and heuristic risk scoring
//!
//! Both run at ingestion, before the raw event is appended. The rate limiter
//! decides whether the request is accepted at all; the risk scorer only
//! annotates accepted requests so staging can down-rank them.
//!
//! The request log lives in the store, so limits hold across processes that
//! share it. Check-then-record is not atomic: two concurrent requests from the
//! same source can both see `limit - 1` and both pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use strata_core::{PipelineStore, Result};

use crate::config::{RateLimitConfig, RiskConfig};

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests in the window, including this one if it was allowed
    pub current_count: u64,
    pub remaining: u64,
    /// When the oldest request in the window expires
    pub reset_time: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Seconds until another request would be accepted (rounded up)
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_time - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

/// Store-backed sliding-window rate limiter keyed by `(source address, endpoint)`
pub struct RateLimiter {
    store: Arc<dyn PipelineStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn PipelineStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and count a request against the configured endpoint
    pub async fn check(&self, source_address: &str) -> Result<RateLimitDecision> {
        self.check_at(source_address, &self.config.endpoint, Utc::now())
            .await
    }

    /// Check a request at `now`. The request is recorded only when allowed.
    pub async fn check_at(
        &self,
        source_address: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let window = self.config.window();
        let (count, oldest) = self
            .store
            .window_stats(source_address, endpoint, now - window)
            .await?;
        let reset_time = oldest.unwrap_or(now) + window;

        if count >= self.config.limit {
            tracing::debug!(
                source_address,
                endpoint,
                count,
                limit = self.config.limit,
                "Rate limit exceeded"
            );
            return Ok(RateLimitDecision {
                allowed: false,
                current_count: count,
                remaining: 0,
                reset_time,
            });
        }

        self.store
            .record_request(source_address, endpoint, now)
            .await?;

        let current_count = count + 1;
        Ok(RateLimitDecision {
            allowed: true,
            current_count,
            remaining: self.config.limit.saturating_sub(current_count),
            reset_time,
        })
    }

    /// Drop request log entries past the retention period
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let retention = self.config.retention();
        self.store.prune_rate_limits(now - retention).await
    }
}

/// Heuristic risk assessment of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Sum of matched weights, capped at 1.0
    pub score: f64,
    pub suspicious: bool,
    /// Names of the matched heuristics
    pub reasons: Vec<String>,
}

pub struct RiskScorer {
    store: Arc<dyn PipelineStore>,
    config: RiskConfig,
}

impl RiskScorer {
    pub fn new(store: Arc<dyn PipelineStore>, config: RiskConfig) -> Self {
        Self { store, config }
    }

    pub async fn score(
        &self,
        source_address: &str,
        user_agent: &str,
        payload: &Value,
    ) -> Result<RiskAssessment> {
        self.score_at(source_address, user_agent, payload, Utc::now())
            .await
    }

    pub async fn score_at(
        &self,
        source_address: &str,
        user_agent: &str,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> Result<RiskAssessment> {
        let config = &self.config;
        let mut score = 0.0;
        let mut reasons = Vec::new();
        let mut add = |weight: f64, reason: &str| {
            score += weight;
            reasons.push(reason.to_string());
        };

        if is_internal_address(source_address) {
            add(config.internal_address_weight, "internal_address");
        }

        let ua = user_agent.trim();
        if ua.is_empty() {
            add(config.missing_user_agent_weight, "missing_user_agent");
        } else {
            if ua.chars().count() < config.min_user_agent_length {
                add(config.short_user_agent_weight, "short_user_agent");
            }
            let lowered = ua.to_lowercase();
            if config
                .bot_substrings
                .iter()
                .any(|s| lowered.contains(&s.to_lowercase()))
            {
                add(config.bot_weight, "bot_user_agent");
            }
        }

        let window = config.high_frequency_window();
        let recent = self
            .store
            .count_recent_from(source_address, now - window)
            .await?;
        if recent >= config.high_frequency_threshold {
            add(config.high_frequency_weight, "high_frequency");
        }

        let payload_bytes = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(0);
        if payload_bytes > config.max_payload_bytes {
            add(config.large_payload_weight, "large_payload");
        }

        // Weights are decimal fractions; round so 0.4 + 0.3 compares equal to 0.7
        let score = ((score.min(1.0)) * 10_000.0).round() / 10_000.0;
        Ok(RiskAssessment {
            score,
            suspicious: score > config.threshold,
            reasons,
        })
    }
}

/// Private, loopback, link-local or unique-local address.
/// Accepts a bare IP or `ip:port`; anything unparsable is not internal.
pub fn is_internal_address(source_address: &str) -> bool {
    let source = source_address.trim();
    let ip = match source.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => match source.parse::<SocketAddr>() {
            Ok(addr) => addr.ip(),
            Err(_) => return false,
        },
    };

    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return mapped.is_private() || mapped.is_loopback() || mapped.is_link_local();
            }
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_store_sqlite::SqliteStore;
    use tempfile::TempDir;

    const BROWSER_UA: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0";

    async fn store() -> (TempDir, Arc<dyn PipelineStore>) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("strata.db")).await.unwrap();
        (dir, Arc::new(store))
    }

    fn limit_config(limit: u64) -> RateLimitConfig {
        RateLimitConfig {
            limit,
            window_secs: 60,
            ..Default::default()
        }
    }

    #[test]
    fn test_internal_addresses() {
        assert!(is_internal_address("10.1.2.3"));
        assert!(is_internal_address("192.168.0.10:5050"));
        assert!(is_internal_address("127.0.0.1"));
        assert!(is_internal_address("169.254.1.1"));
        assert!(is_internal_address("::1"));
        assert!(is_internal_address("fd12:3456::1"));
        assert!(is_internal_address("fe80::1"));
        assert!(is_internal_address("::ffff:10.0.0.1"));
        assert!(!is_internal_address("203.0.113.9"));
        assert!(!is_internal_address("2001:db8::1"));
        assert!(!is_internal_address("not-an-ip"));
    }

    #[tokio::test]
    async fn test_rejects_request_over_limit_until_window_passes() {
        let (_dir, store) = store().await;
        let limiter = RateLimiter::new(store, limit_config(3));
        // Stored timestamps have microsecond precision
        let start = DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap();

        for i in 0..3 {
            let decision = limiter
                .check_at("203.0.113.9", "ingest", start + chrono::Duration::seconds(i))
                .await
                .unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.current_count, (i + 1) as u64);
            assert_eq!(decision.remaining, 2 - i as u64);
        }

        let at = start + chrono::Duration::seconds(10);
        let rejected = limiter.check_at("203.0.113.9", "ingest", at).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.current_count, 3);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.reset_time, start + chrono::Duration::seconds(60));
        assert_eq!(rejected.retry_after_secs(at), 50);

        // Rejected requests are not counted: once the first request leaves
        // the window there is room for exactly one more.
        let later = start + chrono::Duration::seconds(60);
        assert!(limiter.check_at("203.0.113.9", "ingest", later).await.unwrap().allowed);
        assert!(!limiter.check_at("203.0.113.9", "ingest", later).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_limits_are_per_source_and_endpoint() {
        let (_dir, store) = store().await;
        let limiter = RateLimiter::new(store, limit_config(1));
        let now = Utc::now();

        assert!(limiter.check_at("203.0.113.9", "ingest", now).await.unwrap().allowed);
        assert!(!limiter.check_at("203.0.113.9", "ingest", now).await.unwrap().allowed);
        assert!(limiter.check_at("203.0.113.10", "ingest", now).await.unwrap().allowed);
        assert!(limiter.check_at("203.0.113.9", "status", now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_entries() {
        let (_dir, store) = store().await;
        let limiter = RateLimiter::new(store, limit_config(10));
        let now = Utc::now();

        limiter
            .check_at("203.0.113.9", "ingest", now - chrono::Duration::hours(2))
            .await
            .unwrap();
        limiter.check_at("203.0.113.9", "ingest", now).await.unwrap();

        assert_eq!(limiter.prune(now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ordinary_browser_request_scores_zero() {
        let (_dir, store) = store().await;
        let scorer = RiskScorer::new(store, RiskConfig::default());

        let risk = scorer
            .score("203.0.113.9", BROWSER_UA, &json!({"event_type": "page_view"}))
            .await
            .unwrap();
        assert_eq!(risk.score, 0.0);
        assert!(!risk.suspicious);
        assert!(risk.reasons.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_request_is_suspicious() {
        let (_dir, store) = store().await;
        let scorer = RiskScorer::new(store, RiskConfig::default());

        // internal (0.2) + short UA (0.2) + bot substring (0.3) = 0.7, not above threshold
        let risk = scorer
            .score("10.0.0.5", "curl/8.4.0", &json!({}))
            .await
            .unwrap();
        assert!((risk.score - 0.7).abs() < 1e-9);
        assert!(!risk.suspicious);

        // ...plus an oversized payload pushes it over
        let big = json!({"blob": "x".repeat(70_000)});
        let risk = scorer.score("10.0.0.5", "curl/8.4.0", &big).await.unwrap();
        assert!((risk.score - 0.9).abs() < 1e-9);
        assert!(risk.suspicious);
        assert!(risk.reasons.contains(&"large_payload".to_string()));
    }

    #[tokio::test]
    async fn test_high_frequency_source() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        for _ in 0..10 {
            store.record_request("203.0.113.9", "ingest", now).await.unwrap();
        }
        let scorer = RiskScorer::new(store, RiskConfig::default());

        let risk = scorer
            .score_at("203.0.113.9", "", &json!({}), now)
            .await
            .unwrap();
        assert_eq!(
            risk.reasons,
            vec!["missing_user_agent".to_string(), "high_frequency".to_string()]
        );
        assert!((risk.score - 0.6).abs() < 1e-9);
    }
}
