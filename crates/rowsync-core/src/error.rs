//! Error types for rowsync

use thiserror::Error;

use crate::storage::{LockMode, StoreError};

/// Result type alias using rowsync's Error
pub type Result<T> = std::result::Result<T, Error>;

/// rowsync error types
#[derive(Error, Debug)]
pub enum Error {
    // Store errors (E100-E199)
    #[error(transparent)]
    Store(#[from] StoreError),

    // Barrier errors (E200-E299)
    #[error("Failed to process master lock for process '{process_id}' after {attempts} attempts")]
    MasterFailed { process_id: String, attempts: u32 },

    #[error("Failed to process slave lock for process '{process_id}' (participant {participant_id})")]
    ParticipantFailed {
        process_id: String,
        participant_id: i64,
    },

    #[error("Unexpectedly acquired master lock for process '{process_id}': no master is running the election")]
    UnheldMasterSlot { process_id: String },

    #[error("Barrier for process '{process_id}' gave up after {rounds} rounds")]
    RetryBudgetExhausted { process_id: String, rounds: u32 },

    #[error("Invalid batch size {0}: a barrier needs at least one participant")]
    InvalidBatchSize(usize),

    // Lock errors (E300-E399)
    #[error("Could not obtain {mode} lock '{name}'")]
    LockNotObtained { name: String, mode: LockMode },

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(StoreError::LockTimeout { .. }) => "E100",
            Self::Store(StoreError::Duplicate { .. }) => "E101",
            Self::Store(StoreError::Database(_)) => "E102",
            Self::Store(StoreError::Migration(_)) => "E103",
            Self::Store(StoreError::InvalidState(_)) => "E104",
            Self::MasterFailed { .. } => "E200",
            Self::ParticipantFailed { .. } => "E201",
            Self::UnheldMasterSlot { .. } => "E202",
            Self::RetryBudgetExhausted { .. } => "E203",
            Self::InvalidBatchSize(_) => "E204",
            Self::LockNotObtained { .. } => "E300",
            Self::Config(_) => "E600",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::MasterFailed { .. } => Some(
                "Not enough participants joined in time; retry with the same process id or raise barrier.max_attempts"
                    .to_string(),
            ),
            Self::RetryBudgetExhausted { .. } => Some("rowsync config set barrier.max_rounds <n>".to_string()),
            Self::Store(StoreError::Migration(_)) => Some("rowsync migrate".to_string()),
            Self::Config(_) => Some("rowsync config list".to_string()),
            _ => None,
        }
    }

    /// Whether this error is a bounded lock wait that elapsed
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_lock_timeout())
    }

    /// Whether this error is a uniqueness violation on insert
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_duplicate())
    }
}
