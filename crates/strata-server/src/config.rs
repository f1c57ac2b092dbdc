use serde::{Deserialize, Serialize};
use std::path::Path;
use strata_pipeline::{PipelineConfig, TriggerMode};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrataConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file; `~` is expanded
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Write audit events as log lines on the `audit` target
    #[serde(default = "default_true")]
    pub tracing: bool,

    /// Directory for JSONL audit files (disabled if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonl_directory: Option<String>,

    #[serde(default = "default_audit_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_audit_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    #[serde(default = "default_audit_buffer_size")]
    pub channel_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_false")]
    pub log_sql_queries: bool,

    /// Emit JSON log lines instead of the human-readable format
    #[serde(default = "default_false")]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tracing: true,
            jsonl_directory: None,
            batch_size: default_audit_batch_size(),
            batch_timeout_ms: default_audit_batch_timeout_ms(),
            channel_buffer_size: default_audit_buffer_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_sql_queries: false,
            json: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

impl StrataConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents)?
        } else {
            // Default to YAML
            serde_yaml::from_str(&contents)?
        };

        Ok(config)
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("STRATA_DB_PATH") {
            self.database.path = val;
        }

        if let Ok(val) = std::env::var("STRATA_LOG_LEVEL") {
            self.logging.level = val;
        }

        if let Ok(val) = std::env::var("STRATA_LOG_JSON")
            && let Ok(enabled) = val.parse::<bool>()
        {
            self.logging.json = enabled;
        }

        if let Ok(val) = std::env::var("STRATA_LOG_SQL_QUERIES")
            && let Ok(enabled) = val.parse::<bool>()
        {
            self.logging.log_sql_queries = enabled;
        }

        if let Ok(val) = std::env::var("STRATA_AUDIT_DIR") {
            self.audit.jsonl_directory = Some(val);
        }

        if let Ok(val) = std::env::var("STRATA_TRIGGER_MODE") {
            match val.to_lowercase().as_str() {
                "immediate" => self.pipeline.orchestrator.trigger_mode = TriggerMode::Immediate,
                "deferred" => self.pipeline.orchestrator.trigger_mode = TriggerMode::Deferred,
                _ => eprintln!("Warning: Invalid STRATA_TRIGGER_MODE '{}', ignoring", val),
            }
        }

        if let Ok(val) = std::env::var("STRATA_WORKERS")
            && let Ok(pool_size) = val.parse::<usize>()
        {
            self.pipeline.worker.pool_size = pool_size;
        }

        if let Ok(val) = std::env::var("STRATA_RATE_LIMIT")
            && let Ok(limit) = val.parse::<u64>()
        {
            self.pipeline.rate_limit.limit = limit;
        }

        if let Ok(val) = std::env::var("STRATA_HEALTH_HOST") {
            self.health.host = val;
        }

        if let Ok(val) = std::env::var("STRATA_HEALTH_PORT")
            && let Ok(port) = val.parse::<u16>()
        {
            self.health.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.database.path.trim().is_empty() {
            return Err("database.path must not be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("database.max_connections must be at least 1".to_string());
        }
        if self.audit.batch_size == 0 {
            return Err("audit.batch_size must be at least 1".to_string());
        }
        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(format!("logging.level '{}' is not a valid level", self.logging.level));
        }
        self.pipeline.validate()
    }
}

fn default_db_path() -> String {
    "~/.strata/strata.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_audit_batch_size() -> usize {
    100
}

fn default_audit_batch_timeout_ms() -> u64 {
    200
}

fn default_audit_buffer_size() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}
