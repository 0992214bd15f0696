//! rowsync Core Library
//!
//! Coordination primitives built on the row locks of a transactional
//! relational store:
//! - Barrier / master-election lock (`domain::barrier`)
//! - Named exclusive/shared locks, row-emulated or advisory (`domain::locking`)
//! - Store ports with PostgreSQL and in-process backends (`storage`)
//! - Configuration with file persistence (`config`)

pub mod config;
pub mod domain;
pub mod error;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BarrierConfig, Config};
    pub use crate::domain::barrier::{BarrierCoordinator, Role};
    pub use crate::domain::locking::{LockStrategy, NamedLock};
    pub use crate::error::{Error, Result};
    pub use crate::storage::{LockMode, MemoryStore, PgStore, Store, StoreTransaction};
}
