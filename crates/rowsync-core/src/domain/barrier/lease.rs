//! Scoped claim on a master slot

use std::fmt;

use crate::error::Result;
use crate::storage::{MasterSlot, StoreTransaction};

/// The transaction holding the exclusive lock on an open master slot
///
/// The lock lasts exactly as long as the lease. Every write made through
/// [`MasterLease::transaction`] becomes visible only on [`MasterLease::commit`];
/// releasing or dropping the lease rolls them back and leaves the slot open
/// for the next claimant.
pub struct MasterLease {
    tx: Box<dyn StoreTransaction>,
    slot: MasterSlot,
}

impl MasterLease {
    pub fn new(tx: Box<dyn StoreTransaction>, slot: MasterSlot) -> Self {
        Self { tx, slot }
    }

    /// The slot as it was when claimed
    pub fn slot(&self) -> &MasterSlot {
        &self.slot
    }

    pub fn process_id(&self) -> &str {
        &self.slot.process_id
    }

    pub fn transaction(&mut self) -> &mut dyn StoreTransaction {
        self.tx.as_mut()
    }

    /// Persist the election's writes and release the slot lock
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Discard the election's writes and release the slot lock
    pub async fn release(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl fmt::Debug for MasterLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterLease")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}
