//! Domain layer
//!
//! The coordination primitives, built only on the store ports.

pub mod barrier;
pub mod identity;
pub mod locking;
