//! Database migrations
//!
//! This module manages the PostgreSQL schema used by the rowsync store.
//! Migrations are versioned and applied on connection unless disabled.

use sqlx::PgPool;

use super::StoreResult;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _rowsync_migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
"#;

/// Migration 1: Barrier schema
const MIGRATION_V1: &str = r#"
    -- Shared id sequence for participant and master ids
    CREATE SEQUENCE IF NOT EXISTS rowsync_id_seq;

    -- One row per election generation of a process
    CREATE TABLE IF NOT EXISTS rowsync_master_slot (
        row_id BIGSERIAL PRIMARY KEY,
        process_id TEXT NOT NULL,
        assigned_id BIGINT UNIQUE,
        status TEXT NOT NULL DEFAULT 'IN_PROGRESS' CHECK (status IN ('IN_PROGRESS', 'SYNCED', 'FAILED')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    -- At most one unresolved slot per process
    CREATE UNIQUE INDEX IF NOT EXISTS idx_rowsync_master_slot_open
        ON rowsync_master_slot(process_id) WHERE assigned_id IS NULL;

    CREATE TABLE IF NOT EXISTS rowsync_participant_slot (
        id BIGINT PRIMARY KEY NOT NULL,
        process_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE INDEX IF NOT EXISTS idx_rowsync_participant_slot_process
        ON rowsync_participant_slot(process_id);

    CREATE TABLE IF NOT EXISTS rowsync_association (
        master_id BIGINT NOT NULL,
        participant_id BIGINT NOT NULL,
        PRIMARY KEY (master_id, participant_id)
    );

    CREATE INDEX IF NOT EXISTS idx_rowsync_association_participant
        ON rowsync_association(participant_id);
"#;

/// Migration 2: Row-emulated named locks
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS rowsync_named_lock (
        lock_id TEXT PRIMARY KEY NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
"#;

/// Get the current schema version
async fn get_current_version(pool: &PgPool) -> StoreResult<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let version: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM _rowsync_migrations")
        .fetch_one(pool)
        .await?;

    Ok(version.unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &PgPool, version: i32) -> StoreResult<()> {
    sqlx::query("INSERT INTO _rowsync_migrations (version) VALUES ($1)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Barrier schema");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Row-emulated named locks");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Get migration status information
pub async fn migration_status(pool: &PgPool) -> StoreResult<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}
