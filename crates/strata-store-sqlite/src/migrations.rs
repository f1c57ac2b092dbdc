//! Database migration system for the SQLite store
//!
//! Provides versioned schema migrations with tracking to ensure migrations
//! are applied exactly once and in the correct order.
//!
//! All timestamps are stored as INTEGER microseconds since the Unix epoch so
//! range predicates and ordering stay index-friendly.

use sqlx::SqlitePool;
use strata_core::{Error, Result};
use tracing::{debug, info};

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique version number (must be sequential)
    pub version: i32,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to execute for this migration
    pub up_sql: &'static str,
}

/// All migrations in order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Create tenants table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )
        "#,
    },
    Migration {
        version: 2,
        description: "Create raw_events table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS raw_events (
                raw_id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                source_address TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                risk_score REAL NOT NULL DEFAULT 0,
                suspicious INTEGER NOT NULL DEFAULT 0,
                processed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_raw_events_pending
            ON raw_events(status, tenant_id, next_attempt_at, raw_id);

            CREATE INDEX IF NOT EXISTS idx_raw_events_tenant_time
            ON raw_events(tenant_id, received_at)
        "#,
    },
    Migration {
        version: 3,
        description: "Create staging_records table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS staging_records (
                staging_id INTEGER PRIMARY KEY AUTOINCREMENT,
                raw_id INTEGER NOT NULL UNIQUE REFERENCES raw_events(raw_id),
                tenant_id TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                source_address TEXT NOT NULL,
                user_agent TEXT NOT NULL,

                -- Projected fields
                event_type TEXT,
                event_timestamp INTEGER,
                page_url TEXT,
                normalized_url TEXT,
                page_host TEXT,
                page_path TEXT,
                referrer TEXT,
                session_id TEXT,
                visitor_id TEXT,
                business_item TEXT,

                -- Enrichment
                device_type TEXT,
                browser TEXT,
                os TEXT,
                utm_source TEXT,
                utm_medium TEXT,
                utm_campaign TEXT,
                utm_term TEXT,
                utm_content TEXT,
                attributes TEXT NOT NULL DEFAULT '{}',

                -- Validation
                validation_status TEXT NOT NULL,
                validation_errors TEXT NOT NULL DEFAULT '[]',
                quality_score REAL NOT NULL,
                enrichment_status TEXT NOT NULL,

                -- Promotion
                promoted_to_business INTEGER NOT NULL DEFAULT 0,
                promoted_at INTEGER,
                promotion_attempts INTEGER NOT NULL DEFAULT 0,
                promotion_error TEXT,
                promotion_parked INTEGER NOT NULL DEFAULT 0,

                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_staging_unpromoted
            ON staging_records(tenant_id, promoted_to_business, validation_status, staging_id);

            CREATE INDEX IF NOT EXISTS idx_staging_promoted_at
            ON staging_records(tenant_id, promoted_at)
        "#,
    },
    Migration {
        version: 4,
        description: "Create hubs table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS hubs (
                identity_key TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                natural_key TEXT NOT NULL,
                first_seen_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                UNIQUE (tenant_id, kind, natural_key)
            );

            CREATE INDEX IF NOT EXISTS idx_hubs_tenant_kind_time
            ON hubs(tenant_id, kind, first_seen_at)
        "#,
    },
    Migration {
        version: 5,
        description: "Create links table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS links (
                link_key TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                left_key TEXT NOT NULL,
                right_key TEXT NOT NULL,
                occurrence_key TEXT,
                occurred_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_links_tenant_kind
            ON links(tenant_id, kind, occurred_at);

            CREATE INDEX IF NOT EXISTS idx_links_left
            ON links(tenant_id, left_key);

            CREATE INDEX IF NOT EXISTS idx_links_right
            ON links(tenant_id, right_key)
        "#,
    },
    Migration {
        version: 6,
        description: "Create satellites table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS satellites (
                satellite_id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                satellite TEXT NOT NULL,
                owner_key TEXT NOT NULL,
                valid_from INTEGER NOT NULL,
                valid_until INTEGER,
                change_fingerprint TEXT NOT NULL,
                attributes TEXT NOT NULL,
                loaded_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_satellites_current
            ON satellites(tenant_id, satellite, owner_key)
            WHERE valid_until IS NULL;

            CREATE INDEX IF NOT EXISTS idx_satellites_history
            ON satellites(tenant_id, satellite, owner_key, valid_from)
        "#,
    },
    Migration {
        version: 7,
        description: "Create rate_limit_events table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS rate_limit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_address TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                requested_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rate_limit_window
            ON rate_limit_events(source_address, endpoint, requested_at);

            CREATE INDEX IF NOT EXISTS idx_rate_limit_source
            ON rate_limit_events(source_address, requested_at);

            CREATE INDEX IF NOT EXISTS idx_rate_limit_time
            ON rate_limit_events(requested_at)
        "#,
    },
];

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create schema_migrations table if it doesn't exist
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| Error::Database(format!("Failed to create schema_migrations table: {}", e)))?;

    let applied_versions: Vec<i32> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fetch applied migrations: {}", e)))?;

    debug!(
        "Found {} applied migrations: {:?}",
        applied_versions.len(),
        applied_versions
    );

    for migration in MIGRATIONS {
        if applied_versions.contains(&migration.version) {
            debug!(
                "Skipping migration {}: {} (already applied)",
                migration.version, migration.description
            );
            continue;
        }

        info!(
            "Applying migration {}: {}",
            migration.version, migration.description
        );

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::raw_sql(migration.up_sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(format!(
                    "Failed to apply migration {}: {}",
                    migration.version, e
                ))
            })?;

        sqlx::query(
            "INSERT INTO schema_migrations (version, description) VALUES (?, ?)
                ON CONFLICT (version) DO NOTHING",
        )
        .bind(migration.version)
        .bind(migration.description)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(format!(
                "Failed to record migration {}: {}",
                migration.version, e
            ))
        })?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
    }

    Ok(())
}

/// Highest applied migration version, if any
pub async fn get_current_version(pool: &SqlitePool) -> Result<Option<i32>> {
    sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to read schema version: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_sequential() {
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(
                migration.version,
                (i + 1) as i32,
                "Migration versions must be sequential starting from 1"
            );
        }
    }

    #[test]
    fn test_migrations_have_descriptions() {
        for migration in MIGRATIONS {
            assert!(
                !migration.description.is_empty(),
                "Migration {} has no description",
                migration.version
            );
        }
    }

    #[test]
    fn test_migrations_have_sql() {
        for migration in MIGRATIONS {
            assert!(
                !migration.up_sql.trim().is_empty(),
                "Migration {} has no SQL",
                migration.version
            );
        }
    }
}
