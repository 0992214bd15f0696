//! Participant side of the barrier

use std::sync::Arc;
use tracing::{debug, error, info};

use super::types::{JoinOutcome, SyncResult};
use crate::domain::identity::IdentitySource;
use crate::error::{Error, Result};
use crate::storage::{
    in_new_transaction, LockWait, ParticipantSlot, Store, StoreError, StoreTransaction, SyncStatus,
};

/// Registers a disposable participant identity and waits to be admitted
#[derive(Debug, Clone)]
pub struct ParticipantAgent {
    store: Arc<dyn Store>,
    identity: IdentitySource,
}

impl ParticipantAgent {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let identity = IdentitySource::new(store.clone());
        Self { store, identity }
    }

    /// Wait to be admitted by the master of `process_id`
    ///
    /// Waits on whichever slot is open right now. Runs in its own
    /// transaction. `RepeatRequired` means no master admitted this identity;
    /// its slot has been deleted and the caller should start over with a
    /// fresh one.
    pub async fn join(&self, process_id: &str) -> Result<JoinOutcome> {
        let owned = process_id.to_string();
        let generation = in_new_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                let open = tx.find_open_master_slot(&owned).await?;
                Ok(open.map(|slot| slot.generation))
            })
        })
        .await?;

        self.join_generation(process_id, generation).await
    }

    /// Like [`Self::join`], waiting only on the master holding `generation`
    ///
    /// Slots registered after that generation are left to their own
    /// claimants. With `None` there is no master to wait for.
    pub async fn join_generation(
        &self,
        process_id: &str,
        generation: Option<i64>,
    ) -> Result<JoinOutcome> {
        let participant_id = self.identity.next_id().await?;
        let slot = ParticipantSlot {
            id: participant_id,
            process_id: process_id.to_string(),
        };

        info!(
            process_id = %process_id,
            participant_id = participant_id,
            generation = ?generation,
            "Registering participant"
        );
        in_new_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                tx.insert_participant_slot(&slot).await?;
                Ok(())
            })
        })
        .await?;

        let mut tx = self.store.begin().await?;
        let result = self
            .await_admission(tx.as_mut(), process_id, participant_id, generation)
            .await?;
        tx.commit().await?;

        Ok(JoinOutcome {
            participant_id,
            result,
        })
    }

    async fn await_admission(
        &self,
        tx: &mut dyn StoreTransaction,
        process_id: &str,
        participant_id: i64,
        generation: Option<i64>,
    ) -> Result<SyncResult> {
        // Holding our own row is what the master's probe sees as "available".
        if tx
            .lock_participant_slot(participant_id, LockWait::Indefinitely)
            .await?
            .is_none()
        {
            return Err(StoreError::InvalidState(format!(
                "participant slot {} vanished before it could be held",
                participant_id
            ))
            .into());
        }

        if let Some(generation) = generation {
            if let Some(failed_id) = self.wait_for_master(process_id, generation).await? {
                error!(
                    process_id = %process_id,
                    generation = generation,
                    failed_id = failed_id,
                    "Unexpectedly acquired lock on the master slot, marked it FAILED"
                );
                return Err(Error::UnheldMasterSlot {
                    process_id: process_id.to_string(),
                });
            }
        }

        match tx.find_association(participant_id).await? {
            None => {
                tx.delete_participant_slot(participant_id).await?;
                info!(
                    process_id = %process_id,
                    participant_id = participant_id,
                    "Not admitted by any master, retry required"
                );
                Ok(SyncResult::RepeatRequired)
            }
            Some(master) if master.status == SyncStatus::Synced => {
                info!(
                    process_id = %process_id,
                    participant_id = participant_id,
                    master_id = master.master_id,
                    "Admitted into quorum"
                );
                Ok(SyncResult::Success)
            }
            Some(master) => {
                debug!(
                    process_id = %process_id,
                    participant_id = participant_id,
                    master_id = master.master_id,
                    status = %master.status,
                    "Admitted by a master that did not sync"
                );
                Ok(SyncResult::Failure)
            }
        }
    }

    /// Block until the holder of `generation` lets go of it
    ///
    /// Returns the id the slot was failed with if it was still open, meaning
    /// nobody held it. The mark is written under the slot lock.
    async fn wait_for_master(&self, process_id: &str, generation: i64) -> Result<Option<i64>> {
        let identity = self.identity.clone();
        let owned = process_id.to_string();
        in_new_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                match tx.lock_master_slot(generation, LockWait::Indefinitely).await? {
                    Some(slot) if slot.is_open() => {
                        let failed_id = identity.next_id().await?;
                        tx.resolve_master_slot(&owned, failed_id, SyncStatus::Failed)
                            .await?;
                        Ok(Some(failed_id))
                    }
                    _ => Ok(None),
                }
            })
        })
        .await
    }
}
