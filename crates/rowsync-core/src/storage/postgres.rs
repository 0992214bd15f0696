//! PostgreSQL store
//!
//! Provides connection pool management and the [`StoreTransaction`] port over
//! sqlx. Row locks are `SELECT ... FOR UPDATE` / `FOR SHARE`; bounded waits run
//! inside a savepoint with a transaction-local `lock_timeout`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{PgPool, Transaction};
use std::time::Duration;

use super::migrations::{self, MigrationStatus};
use super::{
    AssociatedMaster, Association, LockMode, LockWait, MasterSlot, ParticipantSlot, Store,
    StoreError, StoreResult, StoreTransaction, SyncStatus,
};

/// Default maximum connections in the pool
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Connections one barrier caller holds at once
///
/// A waiting participant keeps its own row locked in one transaction while a
/// second one waits on the master slot. A master keeps its lease open while
/// probing candidates one at a time.
pub const CONNECTIONS_PER_CALLER: u32 = 2;

/// Default seconds to wait for a pooled connection
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

const LOCK_NOT_AVAILABLE: &str = "55P03";
const QUERY_CANCELED: &str = "57014";
const UNIQUE_VIOLATION: &str = "23505";

const LOCK_WAIT_SAVEPOINT: &str = "rowsync_lock_wait";

/// Database configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    ///
    /// Every concurrent barrier caller sharing this pool needs
    /// [`CONNECTIONS_PER_CALLER`] of them for as long as it waits, plus one
    /// briefly for identity allocation. Size it with
    /// [`DatabaseConfig::for_callers`] when one process runs several callers;
    /// an undersized pool fails callers with an acquire timeout.
    pub max_connections: u32,
    /// Seconds to wait for a free connection
    pub acquire_timeout_secs: u64,
    /// Whether to run migrations automatically
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/rowsync".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            auto_migrate: true,
        }
    }
}

impl DatabaseConfig {
    /// Create a new database config for the given URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the maximum number of connections
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Grow the pool so `callers` concurrent barrier callers cannot starve it
    ///
    /// Never shrinks an already larger pool.
    pub fn for_callers(mut self, callers: u32) -> Self {
        let needed = callers.saturating_mul(CONNECTIONS_PER_CALLER).saturating_add(1);
        self.max_connections = self.max_connections.max(needed);
        self
    }

    /// Disable automatic migrations
    pub fn no_migrate(mut self) -> Self {
        self.auto_migrate = false;
        self
    }
}

/// Connection pool wrapper implementing [`Store`]
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    config: DatabaseConfig,
}

impl PgStore {
    /// Connect with the given configuration
    pub async fn connect(config: DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        let store = Self {
            pool,
            config: config.clone(),
        };

        if config.auto_migrate {
            store.migrate().await?;
        }

        tracing::debug!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(store)
    }

    /// Wrap an existing pool; does not migrate
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            config: DatabaseConfig::default().no_migrate(),
        }
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Run database migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        migrations::run_migrations(&self.pool)
            .await
            .map_err(|err| StoreError::Migration(err.to_string()))
    }

    /// Check migration status
    pub async fn migration_status(&self) -> StoreResult<MigrationStatus> {
        migrations::migration_status(&self.pool).await
    }

    /// Check if database is healthy
    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// Map SQLSTATEs the protocol reacts to onto store errors
fn classify(err: sqlx::Error, resource: impl FnOnce() -> String) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(LOCK_NOT_AVAILABLE) | Some(QUERY_CANCELED) => {
                return StoreError::LockTimeout { resource: resource() };
            }
            Some(UNIQUE_VIOLATION) => return StoreError::Duplicate { resource: resource() },
            _ => {}
        }
    }
    StoreError::Database(err)
}

/// `lock_timeout` of zero disables the timeout, so clamp to a millisecond
fn lock_timeout_statement(limit: Duration) -> String {
    format!("SET LOCAL lock_timeout = '{}ms'", limit.as_millis().max(1))
}

fn row_lock_clause(mode: LockMode) -> &'static str {
    match mode {
        LockMode::Exclusive => "FOR UPDATE",
        LockMode::Shared => "FOR SHARE",
    }
}

/// Transaction over a pooled PostgreSQL connection
///
/// Dropping it returns the connection to the pool after a rollback.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    async fn execute(&mut self, sql: &str) -> StoreResult<()> {
        sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn open_lock_wait(&mut self, wait: LockWait) -> StoreResult<()> {
        if let LockWait::AtMost(limit) = wait {
            self.execute(&format!("SAVEPOINT {}", LOCK_WAIT_SAVEPOINT)).await?;
            self.execute(&lock_timeout_statement(limit)).await?;
        }
        Ok(())
    }

    /// Undo [`Self::open_lock_wait`] and classify the locking query's result
    async fn close_lock_wait<T>(
        &mut self,
        wait: LockWait,
        result: Result<T, sqlx::Error>,
        resource: impl FnOnce() -> String,
    ) -> StoreResult<T> {
        if wait == LockWait::Indefinitely {
            return result.map_err(|err| classify(err, resource));
        }

        match result {
            Ok(value) => {
                self.execute("SET LOCAL lock_timeout TO DEFAULT").await?;
                self.execute(&format!("RELEASE SAVEPOINT {}", LOCK_WAIT_SAVEPOINT))
                    .await?;
                Ok(value)
            }
            Err(err) => {
                // Rolling back to the savepoint also restores lock_timeout.
                self.execute(&format!("ROLLBACK TO SAVEPOINT {}", LOCK_WAIT_SAVEPOINT))
                    .await?;
                self.execute(&format!("RELEASE SAVEPOINT {}", LOCK_WAIT_SAVEPOINT))
                    .await?;
                Err(classify(err, resource))
            }
        }
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn next_id(&mut self) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar("SELECT nextval('rowsync_id_seq')")
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(id)
    }

    async fn insert_master_slot(&mut self, process_id: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO rowsync_master_slot (process_id) VALUES ($1)")
            .bind(process_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| classify(err, || format!("open master slot '{}'", process_id)))?;
        Ok(())
    }

    async fn find_open_master_slot(&mut self, process_id: &str) -> StoreResult<Option<MasterSlot>> {
        let row = sqlx::query_as::<_, MasterSlotRow>(
            "SELECT row_id, process_id, assigned_id, status FROM rowsync_master_slot \
             WHERE process_id = $1 AND assigned_id IS NULL",
        )
        .bind(process_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(master_slot_from_row).transpose()
    }

    async fn lock_master_slot(
        &mut self,
        generation: i64,
        wait: LockWait,
    ) -> StoreResult<Option<MasterSlot>> {
        self.open_lock_wait(wait).await?;
        let result = sqlx::query_as::<_, MasterSlotRow>(
            "SELECT row_id, process_id, assigned_id, status FROM rowsync_master_slot \
             WHERE row_id = $1 FOR UPDATE",
        )
        .bind(generation)
        .fetch_optional(&mut *self.tx)
        .await;
        let row = self
            .close_lock_wait(wait, result, || format!("master slot row {}", generation))
            .await?;

        row.map(master_slot_from_row).transpose()
    }

    async fn resolve_master_slot(
        &mut self,
        process_id: &str,
        assigned_id: i64,
        status: SyncStatus,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE rowsync_master_slot SET assigned_id = $2, status = $3 \
             WHERE process_id = $1 AND assigned_id IS NULL",
        )
        .bind(process_id)
        .bind(assigned_id)
        .bind(status.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|err| classify(err, || format!("master id {}", assigned_id)))?;
        Ok(result.rows_affected())
    }

    async fn insert_participant_slot(&mut self, slot: &ParticipantSlot) -> StoreResult<()> {
        sqlx::query("INSERT INTO rowsync_participant_slot (id, process_id) VALUES ($1, $2)")
            .bind(slot.id)
            .bind(&slot.process_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| classify(err, || format!("participant slot {}", slot.id)))?;
        Ok(())
    }

    async fn lock_participant_slot(
        &mut self,
        id: i64,
        wait: LockWait,
    ) -> StoreResult<Option<ParticipantSlot>> {
        self.open_lock_wait(wait).await?;
        let result = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, process_id FROM rowsync_participant_slot WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await;
        let row = self
            .close_lock_wait(wait, result, || format!("participant slot {}", id))
            .await?;

        Ok(row.map(|(id, process_id)| ParticipantSlot { id, process_id }))
    }

    async fn delete_participant_slot(&mut self, id: i64) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM rowsync_participant_slot WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn unassigned_participants(&mut self, process_id: &str) -> StoreResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT p.id FROM rowsync_participant_slot p \
             WHERE p.process_id = $1 AND NOT EXISTS ( \
                 SELECT 1 FROM rowsync_association a \
                 JOIN rowsync_master_slot m ON m.assigned_id = a.master_id \
                 WHERE a.participant_id = p.id AND m.status = 'SYNCED') \
             ORDER BY p.id",
        )
        .bind(process_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn insert_association(&mut self, association: &Association) -> StoreResult<()> {
        sqlx::query("INSERT INTO rowsync_association (master_id, participant_id) VALUES ($1, $2)")
            .bind(association.master_id)
            .bind(association.participant_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| {
                classify(err, || {
                    format!(
                        "association {} -> {}",
                        association.master_id, association.participant_id
                    )
                })
            })?;
        Ok(())
    }

    async fn find_association(&mut self, participant_id: i64) -> StoreResult<Option<AssociatedMaster>> {
        let row = sqlx::query_as::<_, (i64, String)>(
            "SELECT a.master_id, m.status FROM rowsync_association a \
             JOIN rowsync_master_slot m ON m.assigned_id = a.master_id \
             WHERE a.participant_id = $1 ORDER BY a.master_id LIMIT 1",
        )
        .bind(participant_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|(master_id, status)| -> StoreResult<AssociatedMaster> {
            Ok(AssociatedMaster {
                master_id,
                status: status.parse()?,
            })
        })
        .transpose()
    }

    async fn insert_named_lock(&mut self, name: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO rowsync_named_lock (lock_id) VALUES ($1)")
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| classify(err, || format!("named lock '{}'", name)))?;
        Ok(())
    }

    async fn lock_named_row(&mut self, name: &str, mode: LockMode) -> StoreResult<bool> {
        let sql = format!(
            "SELECT lock_id FROM rowsync_named_lock WHERE lock_id = $1 {}",
            row_lock_clause(mode)
        );
        let row: Option<String> = sqlx::query_scalar(&sql)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.is_some())
    }

    async fn advisory_lock(&mut self, key: i64, mode: LockMode) -> StoreResult<()> {
        let sql = match mode {
            LockMode::Exclusive => "SELECT pg_advisory_xact_lock($1)",
            LockMode::Shared => "SELECT pg_advisory_xact_lock_shared($1)",
        };
        sqlx::query(sql).bind(key).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}

type MasterSlotRow = (i64, String, Option<i64>, String);

fn master_slot_from_row(
    (generation, process_id, assigned_id, status): MasterSlotRow,
) -> StoreResult<MasterSlot> {
    Ok(MasterSlot {
        generation,
        process_id,
        assigned_id,
        status: status.parse()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_builder() {
        let config = DatabaseConfig::with_url("postgres://db/app")
            .max_connections(3)
            .no_migrate();

        assert_eq!(config.url, "postgres://db/app");
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.acquire_timeout_secs, DEFAULT_ACQUIRE_TIMEOUT_SECS);
        assert!(!config.auto_migrate);
    }

    #[test]
    fn test_pool_sized_for_callers() {
        let config = DatabaseConfig::default().for_callers(8);
        assert_eq!(config.max_connections, 8 * CONNECTIONS_PER_CALLER + 1);

        // Already large enough
        let config = DatabaseConfig::default().max_connections(50).for_callers(8);
        assert_eq!(config.max_connections, 50);

        let config = DatabaseConfig::default().for_callers(1);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_lock_timeout_never_zero() {
        assert_eq!(
            lock_timeout_statement(Duration::from_millis(1000)),
            "SET LOCAL lock_timeout = '1000ms'"
        );
        assert_eq!(
            lock_timeout_statement(Duration::ZERO),
            "SET LOCAL lock_timeout = '1ms'"
        );
    }

    #[test]
    fn test_row_lock_clause() {
        assert_eq!(row_lock_clause(LockMode::Exclusive), "FOR UPDATE");
        assert_eq!(row_lock_clause(LockMode::Shared), "FOR SHARE");
    }

    #[test]
    fn test_non_database_errors_pass_through() {
        let err = classify(sqlx::Error::RowNotFound, || "x".to_string());
        assert!(matches!(err, StoreError::Database(sqlx::Error::RowNotFound)));
    }
}
