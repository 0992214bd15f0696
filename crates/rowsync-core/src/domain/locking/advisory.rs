//! Named lock on the store's native advisory locks

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::NamedLock;
use crate::error::Result;
use crate::storage::{LockMode, StoreTransaction};

/// Map a lock name onto the 64-bit advisory key space
///
/// The first eight bytes of the name's SHA-256, big-endian. Two names with
/// the same prefix share one lock.
pub fn advisory_key(id: &str) -> i64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

/// Transaction-scoped advisory lock keyed by [`advisory_key`]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeAdvisoryLock;

impl NativeAdvisoryLock {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NamedLock for NativeAdvisoryLock {
    async fn acquire(&self, tx: &mut dyn StoreTransaction, id: &str, mode: LockMode) -> Result<()> {
        let key = advisory_key(id);
        tx.advisory_lock(key, mode).await?;
        debug!(lock_id = %id, key = key, mode = %mode, "Acquired advisory lock");
        Ok(())
    }
}
