//! In-process transactional store
//!
//! Implements the store ports with the locking semantics the coordination
//! protocol depends on, without a database server:
//!
//! - every row has its own reader/writer lock; a transaction keeps the guards
//!   it acquired until it commits, rolls back or is dropped
//! - bounded waits surface as [`StoreError::LockTimeout`]
//! - writes are applied in place and journaled; rollback replays the journal
//!   backwards, so nothing an aborted transaction wrote survives it
//! - a row inserted by a transaction is locked by that transaction
//!
//! Writes are visible to other transactions before commit. The protocol never
//! reads a row another transaction could still roll back without first
//! waiting on that row's lock, so this is not observable through it.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::{
    AssociatedMaster, Association, LockMode, LockWait, MasterSlot, ParticipantSlot, Store,
    StoreError, StoreResult, StoreTransaction, SyncStatus,
};

/// Identity of a lockable resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Master(i64),
    Participant(i64),
    Named(String),
    Advisory(i64),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master(row_id) => write!(f, "master slot row {}", row_id),
            Self::Participant(id) => write!(f, "participant slot {}", id),
            Self::Named(name) => write!(f, "named lock '{}'", name),
            Self::Advisory(key) => write!(f, "advisory lock {}", key),
        }
    }
}

#[derive(Debug, Clone)]
struct MasterRow {
    process_id: String,
    assigned_id: Option<i64>,
    status: SyncStatus,
}

impl MasterRow {
    fn is_open_for(&self, process_id: &str) -> bool {
        self.process_id == process_id && self.assigned_id.is_none()
    }

    fn to_slot(&self, row_id: i64) -> MasterSlot {
        MasterSlot {
            generation: row_id,
            process_id: self.process_id.clone(),
            assigned_id: self.assigned_id,
            status: self.status,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    /// row_id -> row; several resolved generations may share a process id
    master_slots: BTreeMap<i64, MasterRow>,
    last_row_id: i64,
    /// id -> process id
    participant_slots: BTreeMap<i64, String>,
    associations: Vec<Association>,
    named_locks: BTreeSet<String>,
}

impl Tables {
    fn open_master_row(&self, process_id: &str) -> Option<i64> {
        self.master_slots
            .iter()
            .find(|(_, row)| row.is_open_for(process_id))
            .map(|(row_id, _)| *row_id)
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RwLock<()>>>>,
    sequence: AtomicI64,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, key: &RowKey) -> Arc<RwLock<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }

    /// Forget row locks nobody holds or waits on
    ///
    /// Holders and waiters keep their own `Arc`, so a count of one means the
    /// table is the only owner left.
    fn prune<'k>(&self, keys: impl IntoIterator<Item = &'k RowKey>) {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }
}

/// In-process store shared by every clone
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of row locks currently tracked
    pub fn tracked_locks(&self) -> usize {
        self.shared
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Current contents of every table, including uncommitted writes
    pub fn snapshot(&self) -> StoreSnapshot {
        let tables = self.shared.tables();
        StoreSnapshot {
            master_slots: tables
                .master_slots
                .iter()
                .map(|(row_id, row)| row.to_slot(*row_id))
                .collect(),
            participant_slots: tables
                .participant_slots
                .iter()
                .map(|(id, process_id)| ParticipantSlot {
                    id: *id,
                    process_id: process_id.clone(),
                })
                .collect(),
            associations: tables.associations.clone(),
            named_locks: tables.named_locks.iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            shared: self.shared.clone(),
            held: HashMap::new(),
            journal: Vec::new(),
            finished: false,
        }))
    }
}

/// Point-in-time copy of a [`MemoryStore`]
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// In creation order
    pub master_slots: Vec<MasterSlot>,
    /// Ascending by id
    pub participant_slots: Vec<ParticipantSlot>,
    pub associations: Vec<Association>,
    pub named_locks: Vec<String>,
}

impl StoreSnapshot {
    pub fn master_slots_for(&self, process_id: &str) -> Vec<&MasterSlot> {
        self.master_slots
            .iter()
            .filter(|slot| slot.process_id == process_id)
            .collect()
    }

    pub fn participants_for(&self, process_id: &str) -> Vec<&ParticipantSlot> {
        self.participant_slots
            .iter()
            .filter(|slot| slot.process_id == process_id)
            .collect()
    }

    pub fn associations_of(&self, master_id: i64) -> Vec<&Association> {
        self.associations
            .iter()
            .filter(|association| association.master_id == master_id)
            .collect()
    }
}

enum HeldLock {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

impl HeldLock {
    fn covers(&self, mode: LockMode) -> bool {
        matches!(
            (self, mode),
            (Self::Exclusive(_), _) | (Self::Shared(_), LockMode::Shared)
        )
    }
}

/// Inverse of one applied write
enum Undo {
    RemoveMaster(i64),
    RestoreMaster(i64, MasterRow),
    RemoveParticipant(i64),
    RestoreParticipant(i64, String),
    RemoveAssociation(Association),
    RemoveNamed(String),
}

/// Transaction over a [`MemoryStore`]
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    held: HashMap<RowKey, HeldLock>,
    journal: Vec<Undo>,
    finished: bool,
}

async fn wait_for<G>(wait: LockWait, key: &RowKey, acquire: impl Future<Output = G>) -> StoreResult<G> {
    match wait {
        LockWait::Indefinitely => Ok(acquire.await),
        LockWait::AtMost(limit) => tokio::time::timeout(limit, acquire)
            .await
            .map_err(|_| StoreError::LockTimeout {
                resource: key.to_string(),
            }),
    }
}

impl MemoryTransaction {
    /// Acquire `key` in `mode`; returns whether a new guard was taken
    ///
    /// Upgrading a shared hold releases it before waiting for exclusivity.
    async fn lock_row(&mut self, key: RowKey, mode: LockMode, wait: LockWait) -> StoreResult<bool> {
        match self.held.get(&key) {
            Some(held) if held.covers(mode) => return Ok(false),
            Some(_) => {
                self.held.remove(&key);
            }
            None => {}
        }

        let lock = self.shared.row_lock(&key);
        let acquired = match mode {
            LockMode::Exclusive => wait_for(wait, &key, lock.write_owned())
                .await
                .map(HeldLock::Exclusive),
            LockMode::Shared => wait_for(wait, &key, lock.read_owned())
                .await
                .map(HeldLock::Shared),
        };
        match acquired {
            Ok(held) => {
                self.held.insert(key, held);
                Ok(true)
            }
            Err(err) => {
                self.shared.prune([&key]);
                Err(err)
            }
        }
    }

    /// Let go of a lock taken for a row that turned out to be gone
    fn forget(&mut self, key: &RowKey) {
        if self.held.remove(key).is_some() {
            self.shared.prune([key]);
        }
    }

    fn release_locks(&mut self) {
        let keys: Vec<RowKey> = self.held.drain().map(|(key, _guard)| key).collect();
        self.shared.prune(&keys);
    }

    fn unwind(&mut self) {
        self.finished = true;
        let journal = std::mem::take(&mut self.journal);
        let mut tables = self.shared.tables();
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::RemoveMaster(row_id) => {
                    tables.master_slots.remove(&row_id);
                }
                Undo::RestoreMaster(row_id, row) => {
                    tables.master_slots.insert(row_id, row);
                }
                Undo::RemoveParticipant(id) => {
                    tables.participant_slots.remove(&id);
                }
                Undo::RestoreParticipant(id, process_id) => {
                    tables.participant_slots.insert(id, process_id);
                }
                Undo::RemoveAssociation(association) => {
                    if let Some(pos) = tables.associations.iter().position(|a| *a == association) {
                        tables.associations.remove(pos);
                    }
                }
                Undo::RemoveNamed(name) => {
                    tables.named_locks.remove(&name);
                }
            }
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.unwind();
        }
        self.release_locks();
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn next_id(&mut self) -> StoreResult<i64> {
        Ok(self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn insert_master_slot(&mut self, process_id: &str) -> StoreResult<()> {
        let row_id = {
            let mut tables = self.shared.tables();
            if tables.open_master_row(process_id).is_some() {
                return Err(StoreError::Duplicate {
                    resource: format!("open master slot '{}'", process_id),
                });
            }
            tables.last_row_id += 1;
            let row_id = tables.last_row_id;
            tables.master_slots.insert(
                row_id,
                MasterRow {
                    process_id: process_id.to_string(),
                    assigned_id: None,
                    status: SyncStatus::InProgress,
                },
            );
            row_id
        };
        self.journal.push(Undo::RemoveMaster(row_id));
        self.lock_row(RowKey::Master(row_id), LockMode::Exclusive, LockWait::Indefinitely)
            .await?;
        Ok(())
    }

    async fn find_open_master_slot(&mut self, process_id: &str) -> StoreResult<Option<MasterSlot>> {
        let tables = self.shared.tables();
        let slot = tables.open_master_row(process_id).and_then(|row_id| {
            tables
                .master_slots
                .get(&row_id)
                .map(|row| row.to_slot(row_id))
        });
        Ok(slot)
    }

    async fn lock_master_slot(
        &mut self,
        generation: i64,
        wait: LockWait,
    ) -> StoreResult<Option<MasterSlot>> {
        let exists = self.shared.tables().master_slots.contains_key(&generation);
        if !exists {
            return Ok(None);
        }

        let key = RowKey::Master(generation);
        let fresh = self.lock_row(key.clone(), LockMode::Exclusive, wait).await?;

        // An uncommitted insert may have been rolled back while we waited.
        let slot = self
            .shared
            .tables()
            .master_slots
            .get(&generation)
            .map(|row| row.to_slot(generation));
        if slot.is_none() && fresh {
            self.forget(&key);
        }
        Ok(slot)
    }

    async fn resolve_master_slot(
        &mut self,
        process_id: &str,
        assigned_id: i64,
        status: SyncStatus,
    ) -> StoreResult<u64> {
        let Some(row_id) = self.shared.tables().open_master_row(process_id) else {
            return Ok(0);
        };
        self.lock_row(RowKey::Master(row_id), LockMode::Exclusive, LockWait::Indefinitely)
            .await?;

        let previous = {
            let mut tables = self.shared.tables();
            if tables
                .master_slots
                .values()
                .any(|row| row.assigned_id == Some(assigned_id))
            {
                return Err(StoreError::Duplicate {
                    resource: format!("master id {}", assigned_id),
                });
            }
            match tables.master_slots.get_mut(&row_id) {
                Some(row) if row.is_open_for(process_id) => {
                    let previous = row.clone();
                    row.assigned_id = Some(assigned_id);
                    row.status = status;
                    Some(previous)
                }
                _ => None,
            }
        };

        match previous {
            Some(previous) => {
                self.journal.push(Undo::RestoreMaster(row_id, previous));
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn insert_participant_slot(&mut self, slot: &ParticipantSlot) -> StoreResult<()> {
        {
            let mut tables = self.shared.tables();
            if tables.participant_slots.contains_key(&slot.id) {
                return Err(StoreError::Duplicate {
                    resource: format!("participant slot {}", slot.id),
                });
            }
            tables
                .participant_slots
                .insert(slot.id, slot.process_id.clone());
        }
        self.journal.push(Undo::RemoveParticipant(slot.id));
        self.lock_row(RowKey::Participant(slot.id), LockMode::Exclusive, LockWait::Indefinitely)
            .await?;
        Ok(())
    }

    async fn lock_participant_slot(
        &mut self,
        id: i64,
        wait: LockWait,
    ) -> StoreResult<Option<ParticipantSlot>> {
        let exists = self.shared.tables().participant_slots.contains_key(&id);
        if !exists {
            return Ok(None);
        }

        let key = RowKey::Participant(id);
        let fresh = self.lock_row(key.clone(), LockMode::Exclusive, wait).await?;

        let slot = self
            .shared
            .tables()
            .participant_slots
            .get(&id)
            .map(|process_id| ParticipantSlot {
                id,
                process_id: process_id.clone(),
            });
        if slot.is_none() && fresh {
            self.forget(&key);
        }
        Ok(slot)
    }

    async fn delete_participant_slot(&mut self, id: i64) -> StoreResult<u64> {
        let exists = self.shared.tables().participant_slots.contains_key(&id);
        if !exists {
            return Ok(0);
        }
        self.lock_row(RowKey::Participant(id), LockMode::Exclusive, LockWait::Indefinitely)
            .await?;

        let removed = self.shared.tables().participant_slots.remove(&id);
        match removed {
            Some(process_id) => {
                self.journal.push(Undo::RestoreParticipant(id, process_id));
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn unassigned_participants(&mut self, process_id: &str) -> StoreResult<Vec<i64>> {
        let tables = self.shared.tables();
        let synced_masters: HashSet<i64> = tables
            .master_slots
            .values()
            .filter(|row| row.status == SyncStatus::Synced)
            .filter_map(|row| row.assigned_id)
            .collect();
        let admitted: HashSet<i64> = tables
            .associations
            .iter()
            .filter(|association| synced_masters.contains(&association.master_id))
            .map(|association| association.participant_id)
            .collect();

        Ok(tables
            .participant_slots
            .iter()
            .filter(|(id, owner)| owner.as_str() == process_id && !admitted.contains(id))
            .map(|(id, _)| *id)
            .collect())
    }

    async fn insert_association(&mut self, association: &Association) -> StoreResult<()> {
        {
            let mut tables = self.shared.tables();
            if tables.associations.contains(association) {
                return Err(StoreError::Duplicate {
                    resource: format!(
                        "association {} -> {}",
                        association.master_id, association.participant_id
                    ),
                });
            }
            tables.associations.push(*association);
        }
        self.journal.push(Undo::RemoveAssociation(*association));
        Ok(())
    }

    async fn find_association(&mut self, participant_id: i64) -> StoreResult<Option<AssociatedMaster>> {
        let tables = self.shared.tables();
        Ok(tables
            .associations
            .iter()
            .filter(|association| association.participant_id == participant_id)
            .find_map(|association| {
                tables
                    .master_slots
                    .values()
                    .find(|row| row.assigned_id == Some(association.master_id))
                    .map(|row| AssociatedMaster {
                        master_id: association.master_id,
                        status: row.status,
                    })
            }))
    }

    async fn insert_named_lock(&mut self, name: &str) -> StoreResult<()> {
        {
            let mut tables = self.shared.tables();
            if !tables.named_locks.insert(name.to_string()) {
                return Err(StoreError::Duplicate {
                    resource: format!("named lock '{}'", name),
                });
            }
        }
        self.journal.push(Undo::RemoveNamed(name.to_string()));
        self.lock_row(RowKey::Named(name.to_string()), LockMode::Exclusive, LockWait::Indefinitely)
            .await?;
        Ok(())
    }

    async fn lock_named_row(&mut self, name: &str, mode: LockMode) -> StoreResult<bool> {
        let exists = self.shared.tables().named_locks.contains(name);
        if !exists {
            return Ok(false);
        }

        let key = RowKey::Named(name.to_string());
        let fresh = self.lock_row(key.clone(), mode, LockWait::Indefinitely).await?;

        let still_exists = self.shared.tables().named_locks.contains(name);
        if !still_exists && fresh {
            self.forget(&key);
        }
        Ok(still_exists)
    }

    async fn advisory_lock(&mut self, key: i64, mode: LockMode) -> StoreResult<()> {
        self.lock_row(RowKey::Advisory(key), mode, LockWait::Indefinitely)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        this.finished = true;
        this.journal.clear();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        this.unwind();
        Ok(())
    }
}
