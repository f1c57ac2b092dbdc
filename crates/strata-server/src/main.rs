//! Strata pipeline worker and operator CLI
//!
//! `strata serve` runs the background worker pool (queue consumers plus the
//! periodic sweep) and exposes health, readiness and Prometheus metrics.
//! The other subcommands operate on the same store from the command line.
//!
//! Usage:
//! ```bash
//! # Start the worker process
//! strata --config strata.yaml serve
//!
//! # Seed a tenant and ingest a JSONL file of payloads
//! strata tenant add --name acme
//! strata ingest --tenant <TENANT_ID> --file events.jsonl
//!
//! # Drive one batch by hand and inspect the backlog
//! strata run-once --tenant <TENANT_ID>
//! strata status
//! ```

mod config;
mod readiness;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{AuditConfig, LoggingConfig, StrataConfig};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata_audit::{AuditRecorder, JsonlAuditWriter, RecorderBuilder, TracingAuditWriter};
use strata_core::{AuditEmitter, PipelineStore, RequestContext, Tenant, TenantId};
use strata_observability::{HealthState, Metrics, health_router};
use strata_pipeline::{IngestRequest, Pipeline};
use strata_store_sqlite::{SqliteStore, SqliteStoreConfig};
use tokio::net::TcpListener;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Strata - multi-tenant event pipeline
#[derive(Parser)]
#[command(name = "strata", version)]
#[command(about = "Raw -> staging -> business event pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, value_name = "FILE", env = "STRATA_CONFIG", global = true)]
    config: Option<String>,

    /// SQLite database path (overrides configuration)
    #[arg(long, value_name = "PATH", global = true)]
    db_path: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool and health endpoints (default if no command specified)
    Serve,
    /// Ingest a JSONL file of event payloads for one tenant
    Ingest {
        #[arg(long)]
        tenant: String,

        /// One JSON object per line
        #[arg(long)]
        file: PathBuf,

        #[arg(long, default_value = "127.0.0.1")]
        source_address: String,

        #[arg(long, default_value = concat!("strata-cli/", env!("CARGO_PKG_VERSION")))]
        user_agent: String,
    },
    /// Run one bounded batch for a tenant, or for every tenant
    RunOnce {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Print backlog and throughput
    Status {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Manage the tenant directory
    Tenant {
        #[command(subcommand)]
        action: TenantCommand,
    },
}

#[derive(Subcommand)]
enum TenantCommand {
    /// Register (or rename) a tenant
    Add {
        #[arg(long)]
        name: String,

        /// Tenant UUID (generated if omitted)
        #[arg(long)]
        id: Option<String>,
    },
    /// Stop accepting events for a tenant
    Deactivate {
        #[arg(long)]
        id: String,
    },
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => StrataConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => StrataConfig::default(),
    };

    // Environment overrides the file, CLI flags override both
    config.merge_env();
    if let Some(db_path) = cli.db_path {
        config.database.path = db_path;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    init_tracing(&config.logging)?;
    if let Some(path) = &cli.config {
        info!(path = %path, "Loaded configuration");
    }

    let sqlite = SqliteStore::with_config(
        &config.database.path,
        SqliteStoreConfig::default()
            .with_max_connections(config.database.max_connections)
            .with_busy_timeout(Duration::from_millis(config.database.busy_timeout_ms)),
    )
    .await
    .with_context(|| format!("Failed to open database {}", config.database.path))?;
    let store: Arc<dyn PipelineStore> = Arc::new(sqlite);

    let metrics = Arc::new(Metrics::new()?);
    let (audit, recorder) = build_audit(&config.audit);

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config, store, audit, metrics).await,
        Commands::Ingest {
            tenant,
            file,
            source_address,
            user_agent,
        } => {
            let pipeline = Pipeline::builder(store, config.pipeline.clone())
                .audit(audit)
                .metrics(metrics)
                .build();
            ingest_file(
                &pipeline,
                TenantId::from_string(&tenant)?,
                &file,
                &source_address,
                &user_agent,
            )
            .await
        }
        Commands::RunOnce { tenant } => {
            let pipeline = Pipeline::builder(store, config.pipeline.clone())
                .audit(audit)
                .metrics(metrics)
                .build();
            let scope = tenant.as_deref().map(TenantId::from_string).transpose()?;
            let report = pipeline.orchestrator().run_once(scope).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Status { tenant } => {
            let pipeline = Pipeline::builder(store, config.pipeline.clone()).build();
            let scope = tenant.as_deref().map(TenantId::from_string).transpose()?;
            let status = pipeline.orchestrator().status(scope).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Tenant { action } => manage_tenants(store.as_ref(), action).await,
    };

    if let Some(recorder) = recorder
        && let Err(e) = recorder.shutdown().await
    {
        warn!(error = %e, "Audit recorder did not shut down cleanly");
    }

    result
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = match logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::new(format!("{}", log_level));

    // sqlx query logs stay at WARN unless explicitly requested
    if !logging.log_sql_queries {
        match "sqlx=warn".parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Failed to set sqlx log filter: {}", e),
        }
    }

    if logging.json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// Audit emitter plus the recorder that has to be flushed on exit
fn build_audit(config: &AuditConfig) -> (AuditEmitter, Option<Arc<AuditRecorder>>) {
    if !config.enabled {
        info!("Audit disabled");
        return (AuditEmitter::disabled(), None);
    }

    let mut builder = RecorderBuilder::new()
        .batch_size(config.batch_size)
        .batch_timeout_ms(config.batch_timeout_ms)
        .channel_buffer_size(config.channel_buffer_size);
    let mut writers = 0;

    if config.tracing {
        builder = builder.add_writer(Arc::new(TracingAuditWriter::new()));
        writers += 1;
    }
    if let Some(dir) = &config.jsonl_directory {
        info!(directory = %dir, "JSONL audit log enabled");
        builder = builder.add_writer(Arc::new(JsonlAuditWriter::new(dir)));
        writers += 1;
    }

    if writers == 0 {
        warn!("Audit enabled but no audit writer configured");
        return (AuditEmitter::disabled(), None);
    }

    let recorder = Arc::new(builder.build());
    (AuditEmitter::new(recorder.clone()), Some(recorder))
}

async fn serve(
    config: &StrataConfig,
    store: Arc<dyn PipelineStore>,
    audit: AuditEmitter,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    info!(
        trigger_mode = ?config.pipeline.orchestrator.trigger_mode,
        workers = config.pipeline.worker.pool_size,
        "Starting Strata pipeline"
    );

    let pipeline = Pipeline::builder(store.clone(), config.pipeline.clone())
        .audit(audit)
        .metrics(metrics.clone())
        .spawn();

    // Fill the backlog gauges before the first sweep
    match pipeline.orchestrator().status(None).await {
        Ok(status) => info!(
            raw_pending = status.raw_pending,
            raw_error = status.raw_error,
            staging_unpromoted = status.staging_unpromoted,
            staging_parked = status.staging_parked,
            "Current backlog"
        ),
        Err(e) => warn!(error = %e, "Failed to read pipeline status"),
    }

    if config.health.enabled {
        let checker = readiness::StoreReadiness::new(store, pipeline.worker().cloned());
        let health_state = HealthState::with_readiness_checker(metrics, Arc::new(checker));
        let app = health_router(health_state);

        let addr: SocketAddr = format!("{}:{}", config.health.host, config.health.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("Health check:       http://{}/healthz", addr);
        info!("Readiness check:    http://{}/readyz", addr);
        info!("Prometheus metrics: http://{}/metrics", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    pipeline.shutdown().await;
    Ok(())
}

async fn ingest_file(
    pipeline: &Pipeline,
    tenant_id: TenantId,
    file: &PathBuf,
    source_address: &str,
    user_agent: &str,
) -> anyhow::Result<()> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let ctx = RequestContext::new(Some(tenant_id), "cli:ingest");

    let mut accepted = 0u64;
    let mut suspicious = 0u64;
    let mut unparsable = 0u64;
    let mut rejected: BTreeMap<String, u64> = BTreeMap::new();

    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let payload: serde_json::Value = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Skipping unparsable line");
                unparsable += 1;
                continue;
            }
        };

        let response = pipeline
            .ingestor()
            .ingest(
                &ctx,
                IngestRequest {
                    source_address: source_address.to_string(),
                    user_agent: user_agent.to_string(),
                    payload,
                },
            )
            .await?;

        if response.accepted {
            accepted += 1;
            if response.suspicious {
                suspicious += 1;
            }
        } else {
            let reason = response.reason.unwrap_or_else(|| "rejected".to_string());
            *rejected.entry(reason).or_default() += 1;
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "tenant_id": tenant_id,
            "accepted": accepted,
            "suspicious": suspicious,
            "unparsable": unparsable,
            "rejected": rejected,
        }))?
    );
    Ok(())
}

async fn manage_tenants(store: &dyn PipelineStore, action: TenantCommand) -> anyhow::Result<()> {
    match action {
        TenantCommand::Add { name, id } => {
            let tenant_id = match id {
                Some(id) => TenantId::from_string(&id)?,
                None => TenantId::new(),
            };
            let tenant = match store.get_tenant(tenant_id).await? {
                Some(existing) => Tenant {
                    name,
                    active: true,
                    ..existing
                },
                None => Tenant::new(tenant_id, name),
            };
            store.upsert_tenant(&tenant).await?;
            println!("{}", tenant_id);
        }
        TenantCommand::Deactivate { id } => {
            let tenant_id = TenantId::from_string(&id)?;
            store.set_tenant_active(tenant_id, false).await?;
            println!("Tenant {} deactivated", tenant_id);
        }
        TenantCommand::List => {
            for tenant in store.list_tenants().await? {
                println!(
                    "{}  {:<8}  {}  {}",
                    tenant.tenant_id,
                    if tenant.active { "active" } else { "inactive" },
                    tenant.created_at.format("%Y-%m-%d %H:%M:%S"),
                    tenant.name
                );
            }
        }
    }
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
