use alloy::primitives::{Address, U256};

use crate::state::{ChannelId, ChannelStatus, StateIntent};

/// The reasons a custody call reverts. A reverted call leaves no trace on chain, so callers can always retry with
/// corrected input.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CustodyError {
    #[error("invalid participants: expected {expected}, got {actual}")]
    InvalidParticipants { expected: usize, actual: usize },
    #[error("challenge period {0}s is out of bounds")]
    InvalidChallengePeriod(u64),
    #[error("channel {0} already exists")]
    ChannelExists(ChannelId),
    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),
    #[error("invalid status: expected {expected:?}, got {actual:?}")]
    InvalidStatus {
        expected: &'static [ChannelStatus],
        actual: ChannelStatus,
    },
    #[error("invalid state intent: expected {expected:?}, got {actual:?}")]
    InvalidIntent {
        expected: StateIntent,
        actual: StateIntent,
    },
    #[error("invalid state version {actual}, expected {expected}")]
    InvalidVersion { expected: String, actual: u64 },
    #[error("invalid allocations")]
    InvalidAllocations,
    #[error("invalid signature from participant {0}")]
    InvalidSignature(usize),
    #[error("invalid challenger signature")]
    InvalidChallengerSignature,
    #[error("invalid participant index {0}")]
    InvalidParticipantIndex(usize),
    #[error("unknown adjudicator {0}")]
    UnknownAdjudicator(Address),
    #[error("adjudicator rejected the candidate state")]
    InvalidState,
    #[error("candidate is not newer than the stored state")]
    StaleState,
    #[error("challenge period has not expired")]
    ChallengeNotExpired,
    #[error("invalid resize amounts")]
    InvalidResizeAmounts,
    #[error("insufficient balance for {account} of token {token}: available {available}, required {required}")]
    InsufficientBalance {
        account: Address,
        token: Address,
        available: U256,
        required: U256,
    },
    #[error("invalid amount")]
    InvalidAmount,
}
