//! Barrier / master-election lock
//!
//! Gathers a fixed number of callers that share a process id and runs an
//! action in each of them once all are present. Coordination happens entirely
//! through row locks in the store.
//!
//! # Architecture
//!
//! - **Coordinator**: `BarrierCoordinator`, the entry point
//! - **Master side**: `MasterElector` claims the slot and assembles the quorum
//!   while holding a `MasterLease`
//! - **Participant side**: `ParticipantAgent` holds its own slot lock while it
//!   waits to be admitted
//! - **Probe**: how the master tells waiting participants from idle ones
//!
//! # Example
//!
//! ```ignore
//! use rowsync_core::domain::barrier::BarrierCoordinator;
//!
//! let barrier = BarrierCoordinator::new(store, config.barrier.clone());
//! let rows = barrier
//!     .run_barrier("nightly-import", 3, || async { import_partition().await })
//!     .await?;
//! ```

pub mod coordinator;
pub mod lease;
pub mod master;
pub mod participant;
pub mod probe;
pub mod types;

pub use coordinator::BarrierCoordinator;
pub use lease::MasterLease;
pub use master::MasterElector;
pub use participant::ParticipantAgent;
pub use probe::{availability_from_probe, probe_participant, Availability, ProbeOutcome};
pub use types::{Claim, JoinOutcome, Role, SyncResult};
