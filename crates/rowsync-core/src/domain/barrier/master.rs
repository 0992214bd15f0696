//! Master election and quorum assembly

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::lease::MasterLease;
use super::probe::{availability_from_probe, probe_participant, Availability};
use super::types::{Claim, SyncResult};
use crate::config::BarrierConfig;
use crate::error::Result;
use crate::storage::{
    in_new_transaction, Association, LockWait, MasterSlot, Store, StoreTransaction, SyncStatus,
};

/// Consecutive "found busy" counts per candidate, for one election
#[derive(Debug, Default)]
struct FailureTracker {
    threshold: u32,
    counts: BTreeMap<i64, u32>,
}

impl FailureTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            counts: BTreeMap::new(),
        }
    }

    fn record(&mut self, participant_id: i64) {
        *self.counts.entry(participant_id).or_insert(0) += 1;
    }

    /// Candidates past the threshold are never probed again
    fn is_exhausted(&self, participant_id: i64) -> bool {
        self.counts.get(&participant_id).copied().unwrap_or(0) > self.threshold
    }
}

/// Registers, claims and runs elections on master slots
#[derive(Debug, Clone)]
pub struct MasterElector {
    store: Arc<dyn Store>,
    config: BarrierConfig,
}

impl MasterElector {
    pub fn new(store: Arc<dyn Store>, config: BarrierConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BarrierConfig {
        &self.config
    }

    /// Ensure an open slot exists for `process_id`
    ///
    /// Runs in its own transaction. Finding one already open is success.
    pub async fn register_slot(&self, process_id: &str) -> Result<()> {
        let owned = process_id.to_string();
        let result = in_new_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                tx.insert_master_slot(&owned).await?;
                Ok(())
            })
        })
        .await;

        match result {
            Ok(()) => {
                info!(process_id = %process_id, "Registered master slot");
                Ok(())
            }
            Err(err) if err.is_duplicate() => {
                debug!(process_id = %process_id, "Master slot already registered");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Try to lock the open slot within `tx`, waiting at most the probe timeout
    ///
    /// The lock stays with `tx` until it ends. [`Claim::Held`] names the
    /// generation another caller is holding; [`Claim::NoOpenSlot`] means it
    /// was resolved in the meantime and a new one must be registered.
    pub async fn try_claim(
        &self,
        tx: &mut dyn StoreTransaction,
        process_id: &str,
    ) -> Result<Claim<MasterSlot>> {
        let Some(open) = tx.find_open_master_slot(process_id).await? else {
            debug!(process_id = %process_id, "No open master slot to claim");
            return Ok(Claim::NoOpenSlot);
        };

        match tx
            .lock_master_slot(open.generation, LockWait::AtMost(self.config.probe_timeout()))
            .await
        {
            Ok(Some(slot)) if slot.is_open() => {
                info!(process_id = %process_id, generation = slot.generation, "Claimed master slot");
                Ok(Claim::Claimed(slot))
            }
            Ok(_) => {
                debug!(
                    process_id = %process_id,
                    generation = open.generation,
                    "Master slot was resolved before it could be claimed"
                );
                Ok(Claim::NoOpenSlot)
            }
            Err(err) if err.is_lock_timeout() => {
                debug!(
                    process_id = %process_id,
                    generation = open.generation,
                    "Master slot is claimed by another caller"
                );
                Ok(Claim::Held {
                    generation: open.generation,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Claim in a new transaction, returning the lease on success
    pub async fn claim(&self, process_id: &str) -> Result<Claim<MasterLease>> {
        let mut tx = self.store.begin().await?;
        match self.try_claim(tx.as_mut(), process_id).await? {
            Claim::Claimed(slot) => Ok(Claim::Claimed(MasterLease::new(tx, slot))),
            Claim::Held { generation } => {
                tx.rollback().await?;
                Ok(Claim::Held { generation })
            }
            Claim::NoOpenSlot => {
                tx.rollback().await?;
                Ok(Claim::NoOpenSlot)
            }
        }
    }

    /// Assemble a quorum of `batch_size` callers, `master_id` included
    ///
    /// All writes go through the lease. `Failure` means the attempt bound was
    /// reached and the slot was marked FAILED inside the lease; committing or
    /// releasing that is the caller's decision.
    pub async fn run_election(
        &self,
        lease: &mut MasterLease,
        master_id: i64,
        batch_size: usize,
    ) -> Result<SyncResult> {
        let process_id = lease.process_id().to_string();
        let mut failures = FailureTracker::new(self.config.failure_threshold);

        info!(
            process_id = %process_id,
            master_id = master_id,
            batch_size = batch_size,
            "Started election"
        );

        for attempt in 1..=self.config.max_attempts {
            let result = self
                .run_round(lease, master_id, batch_size, &mut failures, attempt)
                .await?;
            if result == SyncResult::Success {
                return Ok(result);
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }

        lease
            .transaction()
            .resolve_master_slot(&process_id, master_id, SyncStatus::Failed)
            .await?;
        warn!(
            process_id = %process_id,
            master_id = master_id,
            batch_size = batch_size,
            attempts = self.config.max_attempts,
            "Failed to assemble quorum"
        );
        Ok(SyncResult::Failure)
    }

    /// One election attempt: `Success` or `RepeatRequired`
    async fn run_round(
        &self,
        lease: &mut MasterLease,
        master_id: i64,
        batch_size: usize,
        failures: &mut FailureTracker,
        attempt: u32,
    ) -> Result<SyncResult> {
        let process_id = lease.process_id().to_string();

        let mut pool = vec![master_id];
        pool.extend(
            lease
                .transaction()
                .unassigned_participants(&process_id)
                .await?
                .into_iter()
                .filter(|id| *id != master_id),
        );

        if pool.len() >= batch_size {
            let admitted = self
                .attempt_quorum(&pool, master_id, batch_size, failures)
                .await?;
            if admitted.len() == batch_size {
                self.seal(lease, master_id, &admitted).await?;
                return Ok(SyncResult::Success);
            }
        }

        debug!(
            process_id = %process_id,
            master_id = master_id,
            attempt = attempt,
            candidates = ?pool,
            failures = ?failures.counts,
            "Quorum not assembled"
        );
        Ok(SyncResult::RepeatRequired)
    }

    /// Probe candidates in pool order until `batch_size` are admitted
    async fn attempt_quorum(
        &self,
        pool: &[i64],
        master_id: i64,
        batch_size: usize,
        failures: &mut FailureTracker,
    ) -> Result<Vec<i64>> {
        let mut admitted = Vec::with_capacity(batch_size);

        for &candidate in pool {
            if admitted.len() >= batch_size {
                break;
            }
            if candidate == master_id {
                admitted.push(candidate);
                continue;
            }
            if failures.is_exhausted(candidate) {
                continue;
            }

            let outcome =
                probe_participant(self.store.as_ref(), candidate, self.config.probe_timeout())
                    .await?;
            match availability_from_probe(outcome) {
                Availability::Available => admitted.push(candidate),
                Availability::Busy => failures.record(candidate),
            }
        }

        Ok(admitted)
    }

    /// Mark the slot SYNCED and record every admitted participant
    async fn seal(&self, lease: &mut MasterLease, master_id: i64, admitted: &[i64]) -> Result<()> {
        let process_id = lease.process_id().to_string();
        let tx = lease.transaction();

        tx.resolve_master_slot(&process_id, master_id, SyncStatus::Synced)
            .await?;
        for &participant_id in admitted.iter().filter(|id| **id != master_id) {
            tx.insert_association(&Association {
                master_id,
                participant_id,
            })
            .await?;
        }

        info!(
            process_id = %process_id,
            master_id = master_id,
            admitted = ?admitted,
            "Assembled quorum"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, ParticipantSlot};
    use std::time::Duration;

    fn fast_config() -> BarrierConfig {
        BarrierConfig {
            probe_timeout_ms: 30,
            poll_interval_ms: 20,
            max_attempts: 3,
            failure_threshold: 3,
            max_rounds: None,
        }
    }

    fn elector(store: &MemoryStore) -> MasterElector {
        MasterElector::new(Arc::new(store.clone()), fast_config())
    }

    async fn claimed_lease(elector: &MasterElector, process_id: &str) -> MasterLease {
        match elector.claim(process_id).await.unwrap() {
            Claim::Claimed(lease) => lease,
            other => panic!("expected to claim the slot, found {:?}", other),
        }
    }

    #[test]
    fn test_failure_tracker_threshold_is_exclusive() {
        let mut failures = FailureTracker::new(3);
        for _ in 0..3 {
            failures.record(5);
        }
        assert!(!failures.is_exhausted(5));
        failures.record(5);
        assert!(failures.is_exhausted(5));
        assert!(!failures.is_exhausted(6));
    }

    #[tokio::test]
    async fn test_register_slot_is_idempotent() {
        let store = MemoryStore::new();
        let elector = elector(&store);

        elector.register_slot("p").await.unwrap();
        elector.register_slot("p").await.unwrap();

        assert_eq!(store.snapshot().master_slots_for("p").len(), 1);
    }

    #[tokio::test]
    async fn test_second_claim_finds_slot_held() {
        let store = MemoryStore::new();
        let elector = elector(&store);
        elector.register_slot("p").await.unwrap();

        let held = claimed_lease(&elector, "p").await;
        let generation = held.slot().generation;
        assert!(matches!(
            elector.claim("p").await.unwrap(),
            Claim::Held { generation: g } if g == generation
        ));

        drop(held);
        assert!(elector.claim("p").await.unwrap().is_claimed());
    }

    #[tokio::test]
    async fn test_claim_without_slot() {
        let store = MemoryStore::new();
        assert!(matches!(
            elector(&store).claim("nothing").await.unwrap(),
            Claim::NoOpenSlot
        ));
    }

    #[tokio::test]
    async fn test_claim_after_resolution_finds_nothing_open() {
        let store = MemoryStore::new();
        let elector = elector(&store);
        elector.register_slot("p").await.unwrap();

        let mut sealed = claimed_lease(&elector, "p").await;
        assert_eq!(
            elector.run_election(&mut sealed, 100, 1).await.unwrap(),
            SyncResult::Success
        );
        sealed.commit().await.unwrap();

        assert!(matches!(elector.claim("p").await.unwrap(), Claim::NoOpenSlot));
        assert_eq!(store.snapshot().master_slots_for("p").len(), 1);
    }

    #[tokio::test]
    async fn test_holder_resolving_while_claim_waits() {
        let store = MemoryStore::new();
        let elector = MasterElector::new(
            Arc::new(store.clone()),
            BarrierConfig {
                probe_timeout_ms: 5_000,
                ..fast_config()
            },
        );
        elector.register_slot("p").await.unwrap();

        let mut holder = claimed_lease(&elector, "p").await;
        let contender = elector.clone();
        let waiting = tokio::spawn(async move { contender.claim("p").await.unwrap() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        holder
            .transaction()
            .resolve_master_slot("p", 100, SyncStatus::Synced)
            .await
            .unwrap();
        holder.commit().await.unwrap();

        assert!(matches!(waiting.await.unwrap(), Claim::NoOpenSlot));
    }

    #[tokio::test]
    async fn test_single_member_quorum_succeeds_at_once() {
        let store = MemoryStore::new();
        let elector = elector(&store);
        elector.register_slot("p").await.unwrap();

        let mut lease = claimed_lease(&elector, "p").await;
        let result = elector.run_election(&mut lease, 100, 1).await.unwrap();
        assert_eq!(result, SyncResult::Success);
        lease.commit().await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.master_slots[0].assigned_id, Some(100));
        assert_eq!(snapshot.master_slots[0].status, SyncStatus::Synced);
        assert!(snapshot.associations.is_empty());
    }

    #[tokio::test]
    async fn test_admits_waiting_participants_only() {
        let store = MemoryStore::new();
        let elector = elector(&store);
        elector.register_slot("p").await.unwrap();

        // Participant 1 waits holding its row; participant 2 went idle.
        let mut waiting = store.begin().await.unwrap();
        waiting
            .insert_participant_slot(&ParticipantSlot {
                id: 1,
                process_id: "p".to_string(),
            })
            .await
            .unwrap();
        let mut idle = store.begin().await.unwrap();
        idle.insert_participant_slot(&ParticipantSlot {
            id: 2,
            process_id: "p".to_string(),
        })
        .await
        .unwrap();
        idle.commit().await.unwrap();

        let mut lease = claimed_lease(&elector, "p").await;
        let result = elector.run_election(&mut lease, 100, 2).await.unwrap();
        assert_eq!(result, SyncResult::Success);
        lease.commit().await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.associations,
            vec![Association {
                master_id: 100,
                participant_id: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_marks_failed_inside_the_lease() {
        let store = MemoryStore::new();
        let elector = elector(&store);
        elector.register_slot("p").await.unwrap();

        let mut lease = claimed_lease(&elector, "p").await;
        let started = tokio::time::Instant::now();
        let result = elector.run_election(&mut lease, 100, 2).await.unwrap();
        assert_eq!(result, SyncResult::Failure);
        // Sleeps between attempts only
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(store.snapshot().master_slots[0].status, SyncStatus::Failed);

        lease.release().await.unwrap();
        let slot = &store.snapshot().master_slots[0];
        assert_eq!(slot.assigned_id, None);
        assert_eq!(slot.status, SyncStatus::InProgress);
    }

    /// Participant 1 went idle, then starts waiting after the second attempt
    async fn election_with_late_waiter(failure_threshold: u32) -> (SyncResult, Vec<Association>) {
        let store = MemoryStore::new();
        let elector = MasterElector::new(
            Arc::new(store.clone()),
            BarrierConfig {
                probe_timeout_ms: 20,
                poll_interval_ms: 100,
                max_attempts: 4,
                failure_threshold,
                max_rounds: None,
            },
        );
        elector.register_slot("p").await.unwrap();

        let mut idle = store.begin().await.unwrap();
        idle.insert_participant_slot(&ParticipantSlot {
            id: 1,
            process_id: "p".to_string(),
        })
        .await
        .unwrap();
        idle.commit().await.unwrap();

        let mut lease = claimed_lease(&elector, "p").await;
        let election = tokio::spawn(async move {
            let result = elector.run_election(&mut lease, 100, 2).await.unwrap();
            lease.commit().await.unwrap();
            result
        });

        // Attempts run at 0, 100, 200 and 300ms.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut waiting = store.begin().await.unwrap();
        waiting
            .lock_participant_slot(1, LockWait::Indefinitely)
            .await
            .unwrap()
            .unwrap();

        let result = election.await.unwrap();
        drop(waiting);
        (result, store.snapshot().associations)
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidate_busy_past_threshold_is_skipped_in_later_attempts() {
        let (result, associations) = election_with_late_waiter(1).await;
        assert_eq!(result, SyncResult::Failure);
        assert!(associations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidate_under_threshold_is_admitted_once_waiting() {
        let (result, associations) = election_with_late_waiter(3).await;
        assert_eq!(result, SyncResult::Success);
        assert_eq!(
            associations,
            vec![Association {
                master_id: 100,
                participant_id: 1
            }]
        );
    }
}
