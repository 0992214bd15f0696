//! Barrier outcome types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one election or one participation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncResult {
    /// The quorum was assembled
    Success,
    /// The quorum could not be assembled, or the master gave up
    Failure,
    /// Nobody admitted this caller; retry with a fresh identity
    RepeatRequired,
}

impl SyncResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::RepeatRequired => "REPEAT_REQUIRED",
        }
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which side of the barrier a caller ended up on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Participant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Participant => "participant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a claim attempt on the master slot found
#[derive(Debug)]
pub enum Claim<L> {
    /// This caller holds the slot
    Claimed(L),
    /// Another caller holds the open slot of this generation
    Held { generation: i64 },
    /// Nothing open to claim; it was resolved since registration
    NoOpenSlot,
}

impl<L> Claim<L> {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed(_))
    }
}

/// Result of [`ParticipantAgent::join`](super::ParticipantAgent::join)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The disposable identity this attempt used
    pub participant_id: i64,
    pub result: SyncResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_result_names() {
        assert_eq!(SyncResult::RepeatRequired.to_string(), "REPEAT_REQUIRED");
        assert_eq!(
            serde_json::to_string(&SyncResult::Success).unwrap(),
            "\"SUCCESS\""
        );
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Master).unwrap(), "\"master\"");
        assert_eq!(Role::Participant.to_string(), "participant");
    }
}
