//! Identity source backed by the store's id sequence

use std::sync::Arc;

use crate::error::Result;
use crate::storage::{in_new_transaction, Store};

/// Issues unique, strictly increasing identifiers
#[derive(Debug, Clone)]
pub struct IdentitySource {
    store: Arc<dyn Store>,
}

impl IdentitySource {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Draw the next identifier in its own transaction
    pub async fn next_id(&self) -> Result<i64> {
        in_new_transaction(self.store.as_ref(), |tx| {
            Box::pin(async move { Ok(tx.next_id().await?) })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let identity = IdentitySource::new(Arc::new(MemoryStore::new()));

        let mut previous = identity.next_id().await.unwrap();
        for _ in 0..10 {
            let next = identity.next_id().await.unwrap();
            assert!(next > previous);
            previous = next;
        }
    }

    #[tokio::test]
    async fn test_concurrent_draws_are_unique() {
        let identity = IdentitySource::new(Arc::new(MemoryStore::new()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let identity = identity.clone();
                tokio::spawn(async move { identity.next_id().await.unwrap() })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }
}
