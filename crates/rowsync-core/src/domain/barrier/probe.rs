//! Participant liveness probe
//!
//! A waiting participant holds the row lock on its own slot. The master
//! learns who is waiting by trying that lock with a short timeout:
//!
//! | probe result | meaning                                   |
//! |--------------|-------------------------------------------|
//! | timed out    | someone holds the row: **available**      |
//! | acquired     | nobody is waiting on it: **busy**         |
//! | row missing  | the participant left: **busy**            |
//!
//! The mapping lives in [`availability_from_probe`] and nowhere else.

use std::time::Duration;

use crate::error::Result;
use crate::storage::{in_new_transaction, LockWait, Store};

/// What a bounded lock attempt on a participant slot observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The lock was granted, and released again with the probe's transaction
    Acquired,
    /// The wait elapsed while another transaction held the lock
    TimedOut,
    /// The slot does not exist
    Missing,
}

/// A candidate's willingness to be admitted this round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Busy,
}

/// Interpret a probe; a timeout is the only positive signal
pub fn availability_from_probe(outcome: ProbeOutcome) -> Availability {
    match outcome {
        ProbeOutcome::TimedOut => Availability::Available,
        ProbeOutcome::Acquired | ProbeOutcome::Missing => Availability::Busy,
    }
}

/// Probe a participant slot in an independent transaction
///
/// Lock timeouts are an outcome here, never an error.
pub async fn probe_participant(
    store: &dyn Store,
    participant_id: i64,
    timeout: Duration,
) -> Result<ProbeOutcome> {
    in_new_transaction(store, move |tx| {
        Box::pin(async move {
            match tx
                .lock_participant_slot(participant_id, LockWait::AtMost(timeout))
                .await
            {
                Ok(Some(_)) => Ok(ProbeOutcome::Acquired),
                Ok(None) => Ok(ProbeOutcome::Missing),
                Err(err) if err.is_lock_timeout() => Ok(ProbeOutcome::TimedOut),
                Err(err) => Err(err.into()),
            }
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, ParticipantSlot, StoreTransaction};

    const PROBE: Duration = Duration::from_millis(30);

    #[test]
    fn test_timeout_means_available() {
        assert_eq!(
            availability_from_probe(ProbeOutcome::TimedOut),
            Availability::Available
        );
        assert_eq!(availability_from_probe(ProbeOutcome::Acquired), Availability::Busy);
        assert_eq!(availability_from_probe(ProbeOutcome::Missing), Availability::Busy);
    }

    async fn slot(tx: &mut dyn StoreTransaction, id: i64) {
        tx.insert_participant_slot(&ParticipantSlot {
            id,
            process_id: "p".to_string(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_probe_sees_held_slot_as_timed_out() {
        let store = MemoryStore::new();
        let mut holder = store.begin().await.unwrap();
        slot(holder.as_mut(), 1).await;

        let outcome = probe_participant(&store, 1, PROBE).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_probe_acquires_idle_slot_and_lets_go() {
        let store = MemoryStore::new();
        let mut setup = store.begin().await.unwrap();
        slot(setup.as_mut(), 1).await;
        setup.commit().await.unwrap();

        assert_eq!(
            probe_participant(&store, 1, PROBE).await.unwrap(),
            ProbeOutcome::Acquired
        );
        // Released with the probe's transaction
        assert_eq!(
            probe_participant(&store, 1, PROBE).await.unwrap(),
            ProbeOutcome::Acquired
        );
    }

    #[tokio::test]
    async fn test_probe_on_missing_slot() {
        let store = MemoryStore::new();
        assert_eq!(
            probe_participant(&store, 42, PROBE).await.unwrap(),
            ProbeOutcome::Missing
        );
    }
}
