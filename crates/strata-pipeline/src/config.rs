//! Pipeline configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub staging: StagingConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.staging.validate().map_err(|e| format!("staging: {}", e))?;
        self.risk.validate().map_err(|e| format!("risk: {}", e))?;
        self.rate_limit
            .validate()
            .map_err(|e| format!("rate_limit: {}", e))?;
        self.orchestrator
            .validate()
            .map_err(|e| format!("orchestrator: {}", e))?;
        self.worker.validate().map_err(|e| format!("worker: {}", e))?;
        Ok(())
    }
}

/// Upper bound for every configured window, skew, delay and deadline (ten years)
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn check_duration_secs(name: &str, secs: u64) -> Result<(), String> {
    if secs > MAX_DURATION_SECS {
        return Err(format!(
            "{} must not exceed {} seconds, got {}",
            name, MAX_DURATION_SECS, secs
        ));
    }
    Ok(())
}

fn check_duration_ms(name: &str, ms: u64) -> Result<(), String> {
    if ms > MAX_DURATION_SECS * 1000 {
        return Err(format!(
            "{} must not exceed {} milliseconds, got {}",
            name,
            MAX_DURATION_SECS * 1000,
            ms
        ));
    }
    Ok(())
}

/// Seconds as a signed duration, clamped so the conversion cannot overflow
fn bounded_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

fn check_fraction(name: &str, value: f64) -> Result<(), String> {
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("{} must be between 0.0 and 1.0, got {}", name, value));
    }
    Ok(())
}

/// Validation and enrichment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Quality penalty when `event_type` is missing
    #[serde(default = "default_missing_event_type_penalty")]
    pub missing_event_type_penalty: f64,

    /// Quality penalty when `timestamp` is missing
    #[serde(default = "default_missing_timestamp_penalty")]
    pub missing_timestamp_penalty: f64,

    /// Quality penalty when `page_url` is missing
    #[serde(default = "default_missing_page_url_penalty")]
    pub missing_page_url_penalty: f64,

    /// Quality penalty when `timestamp` is present but not RFC 3339
    #[serde(default = "default_invalid_timestamp_penalty")]
    pub invalid_timestamp_penalty: f64,

    #[serde(default = "default_max_url_length")]
    pub max_url_length: usize,

    #[serde(default = "default_long_url_penalty")]
    pub long_url_penalty: f64,

    #[serde(default = "default_max_event_type_length")]
    pub max_event_type_length: usize,

    #[serde(default = "default_long_event_type_penalty")]
    pub long_event_type_penalty: f64,

    /// How far in the future an event timestamp may be before it is suspicious
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: u64,

    #[serde(default = "default_future_timestamp_penalty")]
    pub future_timestamp_penalty: f64,

    /// A record with more validation errors than this is INVALID
    #[serde(default)]
    pub max_validation_errors: usize,

    /// A record scoring below this is INVALID
    #[serde(default = "default_min_quality_score")]
    pub min_quality_score: f64,

    /// Promote SUSPICIOUS records as well as VALID ones
    #[serde(default)]
    pub promote_suspicious: bool,
}

fn default_missing_event_type_penalty() -> f64 {
    0.3
}

fn default_missing_timestamp_penalty() -> f64 {
    0.2
}

fn default_missing_page_url_penalty() -> f64 {
    0.2
}

fn default_invalid_timestamp_penalty() -> f64 {
    0.1
}

fn default_max_url_length() -> usize {
    2048
}

fn default_long_url_penalty() -> f64 {
    0.3
}

fn default_max_event_type_length() -> usize {
    100
}

fn default_long_event_type_penalty() -> f64 {
    0.2
}

fn default_max_future_skew_secs() -> u64 {
    86_400
}

fn default_future_timestamp_penalty() -> f64 {
    0.1
}

fn default_min_quality_score() -> f64 {
    0.5
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            missing_event_type_penalty: default_missing_event_type_penalty(),
            missing_timestamp_penalty: default_missing_timestamp_penalty(),
            missing_page_url_penalty: default_missing_page_url_penalty(),
            invalid_timestamp_penalty: default_invalid_timestamp_penalty(),
            max_url_length: default_max_url_length(),
            long_url_penalty: default_long_url_penalty(),
            max_event_type_length: default_max_event_type_length(),
            long_event_type_penalty: default_long_event_type_penalty(),
            max_future_skew_secs: default_max_future_skew_secs(),
            future_timestamp_penalty: default_future_timestamp_penalty(),
            max_validation_errors: 0,
            min_quality_score: default_min_quality_score(),
            promote_suspicious: false,
        }
    }
}

impl StagingConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("missing_event_type_penalty", self.missing_event_type_penalty),
            ("missing_timestamp_penalty", self.missing_timestamp_penalty),
            ("missing_page_url_penalty", self.missing_page_url_penalty),
            ("invalid_timestamp_penalty", self.invalid_timestamp_penalty),
            ("long_url_penalty", self.long_url_penalty),
            ("long_event_type_penalty", self.long_event_type_penalty),
            ("future_timestamp_penalty", self.future_timestamp_penalty),
            ("min_quality_score", self.min_quality_score),
        ] {
            check_fraction(name, value)?;
        }

        if self.max_url_length == 0 {
            return Err("max_url_length must be at least 1".to_string());
        }
        if self.max_event_type_length == 0 {
            return Err("max_event_type_length must be at least 1".to_string());
        }
        check_duration_secs("max_future_skew_secs", self.max_future_skew_secs)
    }

    pub fn max_future_skew(&self) -> chrono::Duration {
        bounded_seconds(self.max_future_skew_secs)
    }
}

/// Heuristic risk scoring weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Private, loopback, link-local or unique-local source address
    #[serde(default = "default_internal_address_weight")]
    pub internal_address_weight: f64,

    #[serde(default = "default_missing_user_agent_weight")]
    pub missing_user_agent_weight: f64,

    #[serde(default = "default_short_user_agent_weight")]
    pub short_user_agent_weight: f64,

    #[serde(default = "default_min_user_agent_length")]
    pub min_user_agent_length: usize,

    #[serde(default = "default_bot_weight")]
    pub bot_weight: f64,

    /// Case-insensitive user-agent substrings that indicate automation
    #[serde(default = "default_bot_substrings")]
    pub bot_substrings: Vec<String>,

    #[serde(default = "default_high_frequency_weight")]
    pub high_frequency_weight: f64,

    /// Requests from one address within `high_frequency_window_secs` that count as high frequency
    #[serde(default = "default_high_frequency_threshold")]
    pub high_frequency_threshold: u64,

    #[serde(default = "default_high_frequency_window_secs")]
    pub high_frequency_window_secs: u64,

    #[serde(default = "default_large_payload_weight")]
    pub large_payload_weight: f64,

    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Scores above this flag the request as suspicious
    #[serde(default = "default_risk_threshold")]
    pub threshold: f64,
}

fn default_internal_address_weight() -> f64 {
    0.2
}

fn default_missing_user_agent_weight() -> f64 {
    0.3
}

fn default_short_user_agent_weight() -> f64 {
    0.2
}

fn default_min_user_agent_length() -> usize {
    20
}

fn default_bot_weight() -> f64 {
    0.3
}

fn default_bot_substrings() -> Vec<String> {
    [
        "bot",
        "crawler",
        "spider",
        "scraper",
        "curl",
        "wget",
        "python-requests",
        "headless",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_high_frequency_weight() -> f64 {
    0.3
}

fn default_high_frequency_threshold() -> u64 {
    10
}

fn default_high_frequency_window_secs() -> u64 {
    5
}

fn default_large_payload_weight() -> f64 {
    0.2
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_risk_threshold() -> f64 {
    0.7
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            internal_address_weight: default_internal_address_weight(),
            missing_user_agent_weight: default_missing_user_agent_weight(),
            short_user_agent_weight: default_short_user_agent_weight(),
            min_user_agent_length: default_min_user_agent_length(),
            bot_weight: default_bot_weight(),
            bot_substrings: default_bot_substrings(),
            high_frequency_weight: default_high_frequency_weight(),
            high_frequency_threshold: default_high_frequency_threshold(),
            high_frequency_window_secs: default_high_frequency_window_secs(),
            large_payload_weight: default_large_payload_weight(),
            max_payload_bytes: default_max_payload_bytes(),
            threshold: default_risk_threshold(),
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("internal_address_weight", self.internal_address_weight),
            ("missing_user_agent_weight", self.missing_user_agent_weight),
            ("short_user_agent_weight", self.short_user_agent_weight),
            ("bot_weight", self.bot_weight),
            ("high_frequency_weight", self.high_frequency_weight),
            ("large_payload_weight", self.large_payload_weight),
            ("threshold", self.threshold),
        ] {
            check_fraction(name, value)?;
        }

        if self.high_frequency_window_secs == 0 {
            return Err("high_frequency_window_secs must be at least 1".to_string());
        }
        check_duration_secs("high_frequency_window_secs", self.high_frequency_window_secs)?;
        if self.bot_substrings.iter().any(|s| s.trim().is_empty()) {
            return Err("bot_substrings must not contain empty entries".to_string());
        }
        Ok(())
    }

    pub fn high_frequency_window(&self) -> chrono::Duration {
        bounded_seconds(self.high_frequency_window_secs)
    }
}

/// Sliding-window rate limit applied at ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per window per `(source_address, endpoint)`
    #[serde(default = "default_rate_limit")]
    pub limit: u64,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Endpoint name under which ingestion requests are counted
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Request log entries older than this are pruned by the sweep
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_rate_limit() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_endpoint() -> String {
    "ingest".to_string()
}

fn default_retention_secs() -> u64 {
    3600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: default_rate_limit(),
            window_secs: default_window_secs(),
            endpoint: default_endpoint(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.limit == 0 {
            return Err("limit must be at least 1".to_string());
        }
        if self.window_secs == 0 {
            return Err("window_secs must be at least 1".to_string());
        }
        check_duration_secs("window_secs", self.window_secs)?;
        check_duration_secs("retention_secs", self.retention_secs)?;
        if self.endpoint.trim().is_empty() {
            return Err("endpoint must not be empty".to_string());
        }
        if self.retention_secs < self.window_secs {
            return Err("retention_secs must be at least window_secs".to_string());
        }
        Ok(())
    }

    pub fn window(&self) -> chrono::Duration {
        bounded_seconds(self.window_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        bounded_seconds(self.retention_secs)
    }
}

/// When staging and promotion run relative to ingestion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Run the tenant's batch inline right after ingestion
    Immediate,
    /// Queue the tenant for the background worker pool
    #[default]
    Deferred,
}

/// Batch limits and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_raw_per_batch")]
    pub max_raw_per_batch: usize,

    #[serde(default = "default_max_staging_per_batch")]
    pub max_staging_per_batch: usize,

    /// Wall-clock limit for one tenant batch (milliseconds)
    #[serde(default = "default_batch_deadline_ms")]
    pub batch_deadline_ms: u64,

    /// Transient failures tolerated before a raw event is parked in ERROR
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Failed promotions tolerated before a staging record is parked
    #[serde(default = "default_max_promotion_attempts")]
    pub max_promotion_attempts: u32,

    #[serde(default)]
    pub trigger_mode: TriggerMode,
}

fn default_max_raw_per_batch() -> usize {
    500
}

fn default_max_staging_per_batch() -> usize {
    500
}

fn default_batch_deadline_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    300_000
}

fn default_max_promotion_attempts() -> u32 {
    5
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_raw_per_batch: default_max_raw_per_batch(),
            max_staging_per_batch: default_max_staging_per_batch(),
            batch_deadline_ms: default_batch_deadline_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_promotion_attempts: default_max_promotion_attempts(),
            trigger_mode: TriggerMode::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_raw_per_batch == 0 {
            return Err("max_raw_per_batch must be at least 1".to_string());
        }
        if self.max_staging_per_batch == 0 {
            return Err("max_staging_per_batch must be at least 1".to_string());
        }
        if self.batch_deadline_ms == 0 {
            return Err("batch_deadline_ms must be at least 1".to_string());
        }
        if self.max_promotion_attempts == 0 {
            return Err("max_promotion_attempts must be at least 1".to_string());
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err("retry_base_delay_ms must not exceed retry_max_delay_ms".to_string());
        }
        check_duration_ms("batch_deadline_ms", self.batch_deadline_ms)?;
        check_duration_ms("retry_max_delay_ms", self.retry_max_delay_ms)
    }

    pub fn batch_deadline(&self) -> Duration {
        Duration::from_millis(self.batch_deadline_ms.min(MAX_DURATION_SECS * 1000))
    }

    /// Delay before the next attempt after `retry_count` failures:
    /// `base * 2^retry_count`, capped at the configured maximum
    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count.min(63)).unwrap_or(u64::MAX);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms).min(MAX_DURATION_SECS * 1000))
    }
}

/// Background worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Pending tenant notifications; extra notifications are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Interval of the safety-net sweep over all tenants
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_pool_size() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be at least 1".to_string());
        }
        check_duration_secs("sweep_interval_secs", self.sweep_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
