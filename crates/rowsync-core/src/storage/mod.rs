//! Storage layer - transactional store ports and backends
//!
//! The coordination primitives consume a relational store only through the
//! [`Store`] and [`StoreTransaction`] traits defined here.
//!
//! # Architecture
//!
//! - `scope`: run an action in a brand-new, independent transaction
//! - `postgres`: PostgreSQL backend (sqlx)
//! - `migrations`: schema versioning for the PostgreSQL backend
//! - `memory`: in-process backend with real row-lock semantics
//!
//! # Usage
//!
//! ```ignore
//! use rowsync_core::storage::{DatabaseConfig, PgStore};
//!
//! let store = PgStore::connect(DatabaseConfig::with_url("postgres://localhost/rowsync")).await?;
//! let mut tx = store.begin().await?;
//! let id = tx.next_id().await?;
//! tx.commit().await?;
//! ```

pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod scope;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub use memory::{MemoryStore, StoreSnapshot};
pub use migrations::{migration_status, run_migrations, MigrationStatus, CURRENT_VERSION};
pub use postgres::{DatabaseConfig, PgStore, CONNECTIONS_PER_CALLER};
pub use scope::in_new_transaction;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// A bounded lock wait elapsed before the lock was granted
    #[error("Lock wait timed out on {resource}")]
    LockTimeout { resource: String },

    /// A uniqueness constraint rejected an insert
    #[error("Duplicate key for {resource}")]
    Duplicate { resource: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid store state: {0}")]
    InvalidState(String),
}

impl StoreError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// How long a row or advisory lock request may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Block until the lock is granted
    Indefinitely,
    /// Give up with [`StoreError::LockTimeout`] after the duration
    AtMost(Duration),
}

/// Lock strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Excludes every other holder
    Exclusive,
    /// Compatible with other shared holders
    Shared,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Shared => "shared",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a master slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    InProgress,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Synced => "SYNCED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SYNCED" => Ok(Self::Synced),
            "FAILED" => Ok(Self::Failed),
            other => Err(StoreError::InvalidState(format!("unknown sync status '{}'", other))),
        }
    }
}

/// One election slot for a process identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSlot {
    /// Row identity; each resolved slot is followed by a new generation
    pub generation: i64,
    pub process_id: String,
    /// Set exactly once, by the caller that wins the election
    pub assigned_id: Option<i64>,
    pub status: SyncStatus,
}

impl MasterSlot {
    /// Not yet assigned, so still up for election
    pub fn is_open(&self) -> bool {
        self.assigned_id.is_none()
    }
}

/// One participation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSlot {
    pub id: i64,
    pub process_id: String,
}

/// A participant admitted into a master's quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Association {
    pub master_id: i64,
    pub participant_id: i64,
}

/// The master a participant was admitted by, with that master's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociatedMaster {
    pub master_id: i64,
    pub status: SyncStatus,
}

/// A transactional relational store
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    /// Open a brand-new transaction, independent of any other open one
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// An open transaction
///
/// Dropping a transaction without calling [`StoreTransaction::commit`] rolls
/// it back and releases every lock it holds.
#[async_trait]
pub trait StoreTransaction: Send {
    // ========== Identity ==========

    /// Next value of the id sequence; never rolled back
    async fn next_id(&mut self) -> StoreResult<i64>;

    // ========== Master slots ==========

    /// Insert an open slot; `Duplicate` if one is already open for `process_id`
    async fn insert_master_slot(&mut self, process_id: &str) -> StoreResult<()>;

    /// The open slot for `process_id`, read without locking
    async fn find_open_master_slot(&mut self, process_id: &str) -> StoreResult<Option<MasterSlot>>;

    /// Exclusively lock one generation's slot, resolved or not
    ///
    /// Returns the row as it is once locked; `None` if it does not exist.
    async fn lock_master_slot(
        &mut self,
        generation: i64,
        wait: LockWait,
    ) -> StoreResult<Option<MasterSlot>>;

    /// Assign the open slot and set its final status; returns rows affected
    async fn resolve_master_slot(
        &mut self,
        process_id: &str,
        assigned_id: i64,
        status: SyncStatus,
    ) -> StoreResult<u64>;

    // ========== Participant slots ==========

    async fn insert_participant_slot(&mut self, slot: &ParticipantSlot) -> StoreResult<()>;

    /// Exclusively lock a participant slot; `None` if it does not exist
    async fn lock_participant_slot(
        &mut self,
        id: i64,
        wait: LockWait,
    ) -> StoreResult<Option<ParticipantSlot>>;

    async fn delete_participant_slot(&mut self, id: i64) -> StoreResult<u64>;

    /// Participant ids for `process_id` not yet admitted by a SYNCED master, ascending
    async fn unassigned_participants(&mut self, process_id: &str) -> StoreResult<Vec<i64>>;

    // ========== Associations ==========

    async fn insert_association(&mut self, association: &Association) -> StoreResult<()>;

    async fn find_association(&mut self, participant_id: i64) -> StoreResult<Option<AssociatedMaster>>;

    // ========== Named locks ==========

    /// Insert the row backing a named lock; `Duplicate` if it exists
    async fn insert_named_lock(&mut self, name: &str) -> StoreResult<()>;

    /// Lock the row backing a named lock; `false` if no such row exists
    async fn lock_named_row(&mut self, name: &str, mode: LockMode) -> StoreResult<bool>;

    /// Transaction-scoped advisory lock on an integer key
    async fn advisory_lock(&mut self, key: i64, mode: LockMode) -> StoreResult<()>;

    // ========== Completion ==========

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
