//! Named locks held for the lifetime of a transaction
//!
//! Two interchangeable strategies behind the [`NamedLock`] trait:
//!
//! - **Row-emulated**: `RowEmulatedLock` locks a row keyed by the lock name,
//!   creating the row on first use
//! - **Native advisory**: `NativeAdvisoryLock` hashes the name onto the
//!   store's advisory lock space
//!
//! Both require the caller's open transaction; the lock is released when that
//! transaction commits, rolls back or is dropped.
//!
//! # Example
//!
//! ```ignore
//! use rowsync_core::domain::locking::{LockStrategy, NamedLock};
//!
//! let lock = LockStrategy::Row.build(store.clone());
//! let mut tx = store.begin().await?;
//! lock.acquire_exclusive(tx.as_mut(), "billing-run").await?;
//! // ... exclusive work ...
//! tx.commit().await?;
//! ```

pub mod advisory;
pub mod row;

pub use advisory::{advisory_key, NativeAdvisoryLock};
pub use row::RowEmulatedLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{LockMode, Store, StoreTransaction};

/// Mutual exclusion keyed by a name, scoped to a transaction
#[async_trait]
pub trait NamedLock: Send + Sync + fmt::Debug {
    /// Block until `id` is held in `mode` by `tx`
    async fn acquire(&self, tx: &mut dyn StoreTransaction, id: &str, mode: LockMode) -> Result<()>;

    async fn acquire_exclusive(&self, tx: &mut dyn StoreTransaction, id: &str) -> Result<()> {
        self.acquire(tx, id, LockMode::Exclusive).await
    }

    async fn acquire_shared(&self, tx: &mut dyn StoreTransaction, id: &str) -> Result<()> {
        self.acquire(tx, id, LockMode::Shared).await
    }
}

/// Which [`NamedLock`] implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    #[default]
    Row,
    Advisory,
}

impl LockStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Row => "row",
            Self::Advisory => "advisory",
        }
    }

    pub fn build(self, store: Arc<dyn Store>) -> Arc<dyn NamedLock> {
        match self {
            Self::Row => Arc::new(RowEmulatedLock::new(store)),
            Self::Advisory => Arc::new(NativeAdvisoryLock::new()),
        }
    }
}

impl fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LockStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "row" => Ok(Self::Row),
            "advisory" => Ok(Self::Advisory),
            other => Err(Error::Config(format!(
                "unknown lock strategy '{}' (expected 'row' or 'advisory')",
                other
            ))),
        }
    }
}
