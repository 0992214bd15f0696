//! Named lock contracts, checked for both strategies

use std::sync::Arc;
use std::time::Duration;

use rowsync_core::domain::locking::{LockStrategy, NamedLock};
use rowsync_core::storage::{MemoryStore, Store};
use tokio::time::{Instant, timeout};

const STRATEGIES: [LockStrategy; 2] = [LockStrategy::Row, LockStrategy::Advisory];

const BLOCKED: Duration = Duration::from_millis(100);

fn lock_for(store: &MemoryStore, strategy: LockStrategy) -> Arc<dyn NamedLock> {
    strategy.build(Arc::new(store.clone()))
}

#[tokio::test]
async fn test_exclusive_excludes_exclusive_and_shared() {
    for strategy in STRATEGIES {
        let store = MemoryStore::new();
        let lock = lock_for(&store, strategy);

        let mut holder = store.begin().await.unwrap();
        lock.acquire_exclusive(holder.as_mut(), "ledger").await.unwrap();

        let mut writer = store.begin().await.unwrap();
        assert!(
            timeout(BLOCKED, lock.acquire_exclusive(writer.as_mut(), "ledger"))
                .await
                .is_err(),
            "{strategy}: second exclusive acquired"
        );

        let mut reader = store.begin().await.unwrap();
        assert!(
            timeout(BLOCKED, lock.acquire_shared(reader.as_mut(), "ledger"))
                .await
                .is_err(),
            "{strategy}: shared acquired under exclusive"
        );
    }
}

#[tokio::test]
async fn test_shared_holders_do_not_block_each_other() {
    for strategy in STRATEGIES {
        let store = MemoryStore::new();
        let lock = lock_for(&store, strategy);

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        lock.acquire_shared(first.as_mut(), "catalog").await.unwrap();
        timeout(BLOCKED, lock.acquire_shared(second.as_mut(), "catalog"))
            .await
            .unwrap_or_else(|_| panic!("{strategy}: shared holders blocked each other"))
            .unwrap();

        let mut writer = store.begin().await.unwrap();
        assert!(
            timeout(BLOCKED, lock.acquire_exclusive(writer.as_mut(), "catalog"))
                .await
                .is_err(),
            "{strategy}: exclusive acquired under shared"
        );
    }
}

#[tokio::test]
async fn test_distinct_names_are_independent() {
    for strategy in STRATEGIES {
        let store = MemoryStore::new();
        let lock = lock_for(&store, strategy);

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        lock.acquire_exclusive(first.as_mut(), "alpha").await.unwrap();
        timeout(BLOCKED, lock.acquire_exclusive(second.as_mut(), "beta"))
            .await
            .unwrap_or_else(|_| panic!("{strategy}: unrelated names contended"))
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiter_completes_after_holder_releases() {
    for strategy in STRATEGIES {
        let store = MemoryStore::new();
        let lock = lock_for(&store, strategy);

        let mut holder = store.begin().await.unwrap();
        lock.acquire_exclusive(holder.as_mut(), "nightly").await.unwrap();

        let waiter_store = store.clone();
        let waiter_lock = lock.clone();
        let waiter = tokio::spawn(async move {
            let mut tx = waiter_store.begin().await.unwrap();
            waiter_lock
                .acquire_exclusive(tx.as_mut(), "nightly")
                .await
                .unwrap();
            let acquired_at = Instant::now();
            tx.commit().await.unwrap();
            acquired_at
        });

        tokio::time::sleep(BLOCKED).await;
        let released_at = Instant::now();
        holder.commit().await.unwrap();

        let acquired_at = waiter.await.unwrap();
        assert!(acquired_at > released_at, "{strategy}: waiter finished first");
    }
}

#[tokio::test]
async fn test_rollback_releases_like_commit() {
    for strategy in STRATEGIES {
        let store = MemoryStore::new();
        let lock = lock_for(&store, strategy);

        let mut holder = store.begin().await.unwrap();
        lock.acquire_exclusive(holder.as_mut(), "job").await.unwrap();
        holder.rollback().await.unwrap();

        let mut next = store.begin().await.unwrap();
        timeout(BLOCKED, lock.acquire_exclusive(next.as_mut(), "job"))
            .await
            .unwrap_or_else(|_| panic!("{strategy}: lock survived rollback"))
            .unwrap();
    }
}
