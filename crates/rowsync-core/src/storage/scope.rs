//! Independent transaction scope
//!
//! Runs an action in a brand-new transaction that commits when the action
//! succeeds and rolls back when it fails, whatever transaction the caller may
//! already hold open.

use futures_util::future::BoxFuture;
use tracing::warn;

use super::{Store, StoreTransaction};
use crate::error::Result;

/// Run `action` in a new transaction of `store`
///
/// The action receives the transaction by mutable reference; it must not
/// commit it. Locks taken inside the action are released when this returns.
pub async fn in_new_transaction<T, F>(store: &dyn Store, action: F) -> Result<T>
where
    T: Send,
    F: for<'t> FnOnce(&'t mut dyn StoreTransaction) -> BoxFuture<'t, Result<T>> + Send,
{
    let mut tx = store.begin().await?;
    match action(tx.as_mut()).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback of independent transaction failed");
            }
            Err(err)
        }
    }
}
