use crate::storage::StoreError;
use kazi_types::{Amount, RewardEventId, RewardStatus, UserId};
use std::time::Duration;
use thiserror::Error;

/// Classification shared by errors and settlement outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BrokenReferralLink,
    NotEligible,
    AlreadySettled,
    ReversalWouldUnderflow,
    StorageConflict,
    UserNotFound,
    EventNotFound,
    InvalidLink,
    InvalidState,
    LockTimeout,
    Storage,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewardError {
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Broken referral link: {invitee} points at missing inviter {inviter}")]
    BrokenReferralLink { invitee: UserId, inviter: UserId },

    #[error("Reward event not found: {0}")]
    EventNotFound(RewardEventId),

    #[error("Reward event {event} is {status}; only completed rewards can be reversed")]
    NotReversible {
        event: RewardEventId,
        status: RewardStatus,
    },

    #[error("Reversal of {amount} would drive {inviter} below zero (balance {balance})")]
    ReversalWouldUnderflow {
        event: RewardEventId,
        inviter: UserId,
        balance: Amount,
        amount: Amount,
    },

    #[error("Reversal requires a non-empty {0}")]
    MissingAuditDetail(&'static str),

    #[error("{0} cannot refer themselves")]
    SelfReferral(UserId),

    #[error("{invitee} is already linked to inviter {inviter}")]
    AlreadyLinked { invitee: UserId, inviter: UserId },

    #[error("Linking {invitee} to {inviter} would create a referral cycle")]
    ReferralCycle { invitee: UserId, inviter: UserId },

    #[error("No user holds invitation code {0}")]
    UnknownInvitationCode(String),

    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    #[error("Timed out after {waited:?} waiting for settlement lock on {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("Storage error: {0}")]
    Storage(StoreError),
}

impl RewardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UserNotFound(_) => ErrorKind::UserNotFound,
            Self::BrokenReferralLink { .. } => ErrorKind::BrokenReferralLink,
            Self::EventNotFound(_) => ErrorKind::EventNotFound,
            Self::NotReversible { .. }
            | Self::MissingAuditDetail(_)
            | Self::Storage(StoreError::Rejected(_)) => ErrorKind::InvalidState,
            Self::ReversalWouldUnderflow { .. } => ErrorKind::ReversalWouldUnderflow,
            Self::SelfReferral(_)
            | Self::AlreadyLinked { .. }
            | Self::ReferralCycle { .. }
            | Self::UnknownInvitationCode(_) => ErrorKind::InvalidLink,
            Self::StorageConflict(_) => ErrorKind::StorageConflict,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Storage and lock failures are safe to retry because settlement is
    /// idempotent; business-rule failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StorageConflict | ErrorKind::LockTimeout | ErrorKind::Storage
        )
    }
}

impl From<StoreError> for RewardError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => Self::StorageConflict(msg),
            StoreError::AlreadyLinked { invitee, inviter } => {
                Self::AlreadyLinked { invitee, inviter }
            }
            other => Self::Storage(other),
        }
    }
}

pub type RewardResult<T> = std::result::Result<T, RewardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let timeout = RewardError::LockTimeout {
            key: "pair".into(),
            waited: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());

        let broken = RewardError::BrokenReferralLink {
            invitee: UserId::new(2),
            inviter: UserId::new(1),
        };
        assert_eq!(broken.kind(), ErrorKind::BrokenReferralLink);
        assert!(!broken.is_retryable());
    }

    #[test]
    fn test_store_conflict_maps_to_storage_conflict() {
        let err: RewardError = StoreError::Conflict("dup".into()).into();
        assert_eq!(err.kind(), ErrorKind::StorageConflict);
        assert!(err.is_retryable());
    }
}
