//! Named lock emulated with a locked row

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::NamedLock;
use crate::error::{Error, Result};
use crate::storage::{in_new_transaction, LockMode, Store, StoreTransaction};

/// Locks the row named `id`, inserting it on first use
#[derive(Debug, Clone)]
pub struct RowEmulatedLock {
    store: Arc<dyn Store>,
}

impl RowEmulatedLock {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Insert the backing row in its own transaction; a concurrent insert wins
    async fn ensure_row(&self, id: &str) -> Result<()> {
        let owned = id.to_string();
        let result = in_new_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                tx.insert_named_lock(&owned).await?;
                Ok(())
            })
        })
        .await;

        match result {
            Ok(()) => {
                debug!(lock_id = %id, "Created named lock row");
                Ok(())
            }
            Err(err) if err.is_duplicate() => {
                debug!(lock_id = %id, "Named lock row created concurrently");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl NamedLock for RowEmulatedLock {
    async fn acquire(&self, tx: &mut dyn StoreTransaction, id: &str, mode: LockMode) -> Result<()> {
        if tx.lock_named_row(id, mode).await? {
            debug!(lock_id = %id, mode = %mode, "Acquired named lock");
            return Ok(());
        }

        self.ensure_row(id).await?;

        if tx.lock_named_row(id, mode).await? {
            debug!(lock_id = %id, mode = %mode, "Acquired named lock");
            Ok(())
        } else {
            Err(Error::LockNotObtained {
                name: id.to_string(),
                mode,
            })
        }
    }
}
