//! Barrier entry point

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use super::lease::MasterLease;
use super::master::MasterElector;
use super::participant::ParticipantAgent;
use super::types::{Claim, Role, SyncResult};
use crate::config::BarrierConfig;
use crate::domain::identity::IdentitySource;
use crate::error::{Error, Result};
use crate::storage::Store;

/// Runs an action once `batch_size` callers sharing a process id are present
///
/// Each call either wins the master slot and assembles the quorum, or joins
/// as a participant and waits to be admitted. Callers that are not admitted
/// start over with a fresh identity until they are, or until
/// [`BarrierConfig::max_rounds`] is reached.
#[derive(Debug, Clone)]
pub struct BarrierCoordinator {
    config: BarrierConfig,
    identity: IdentitySource,
    elector: MasterElector,
    participant: ParticipantAgent,
}

impl BarrierCoordinator {
    pub fn new(store: Arc<dyn Store>, config: BarrierConfig) -> Self {
        Self {
            identity: IdentitySource::new(store.clone()),
            elector: MasterElector::new(store.clone(), config.clone()),
            participant: ParticipantAgent::new(store),
            config,
        }
    }

    pub fn config(&self) -> &BarrierConfig {
        &self.config
    }

    /// Wait for the quorum, then run `action`
    pub async fn run_barrier<T, F, Fut>(&self, process_id: &str, batch_size: usize, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_barrier_with_role(process_id, batch_size, |_| action())
            .await
    }

    /// Like [`Self::run_barrier`], telling `action` which role this caller played
    pub async fn run_barrier_with_role<T, F, Fut>(
        &self,
        process_id: &str,
        batch_size: usize,
        action: F,
    ) -> Result<T>
    where
        F: FnOnce(Role) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let role = self.synchronize(process_id, batch_size).await?;
        info!(process_id = %process_id, role = %role, "Barrier passed");
        action(role).await
    }

    /// Block until this caller belongs to a synced quorum
    pub async fn synchronize(&self, process_id: &str, batch_size: usize) -> Result<Role> {
        if batch_size == 0 {
            return Err(Error::InvalidBatchSize(batch_size));
        }

        let mut round: u32 = 0;
        loop {
            round += 1;
            if let Some(role) = self.run_round(process_id, batch_size).await? {
                return Ok(role);
            }

            if let Some(max_rounds) = self.config.max_rounds {
                if round >= max_rounds {
                    return Err(Error::RetryBudgetExhausted {
                        process_id: process_id.to_string(),
                        rounds: round,
                    });
                }
            }
            debug!(process_id = %process_id, round = round, "Starting over with a fresh identity");
        }
    }

    /// `None` when this caller must start over
    async fn run_round(&self, process_id: &str, batch_size: usize) -> Result<Option<Role>> {
        let generation = loop {
            self.elector.register_slot(process_id).await?;

            match self.elector.claim(process_id).await? {
                Claim::Claimed(lease) => {
                    return self.lead(lease, process_id, batch_size).await.map(Some);
                }
                Claim::Held { generation } => break generation,
                Claim::NoOpenSlot => {
                    debug!(
                        process_id = %process_id,
                        "Master slot resolved before claim, registering again"
                    );
                }
            }
        };

        let outcome = self
            .participant
            .join_generation(process_id, Some(generation))
            .await?;
        match outcome.result {
            SyncResult::Success => Ok(Some(Role::Participant)),
            SyncResult::RepeatRequired => Ok(None),
            SyncResult::Failure => Err(Error::ParticipantFailed {
                process_id: process_id.to_string(),
                participant_id: outcome.participant_id,
            }),
        }
    }

    async fn lead(&self, mut lease: MasterLease, process_id: &str, batch_size: usize) -> Result<Role> {
        let master_id = self.identity.next_id().await?;
        let result = self
            .elector
            .run_election(&mut lease, master_id, batch_size)
            .await?;

        if result != SyncResult::Success {
            lease.release().await?;
            return Err(Error::MasterFailed {
                process_id: process_id.to_string(),
                attempts: self.config.max_attempts,
            });
        }
        lease.commit().await?;
        Ok(Role::Master)
    }
}
