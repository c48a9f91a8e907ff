use crate::amount::Amount;
use crate::error::KaziError;
use crate::ids::{RewardEventId, UserId};
use crate::level::Level;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    /// Recorded, wallet not yet credited (inviter is a temporary worker).
    Pending,
    /// Wallet credited.
    Completed,
    /// Administratively reversed. Kept as a tombstone so the pair stays settled.
    Reversed,
}

impl RewardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Reversed => "reversed",
        }
    }

    /// The only transitions a ledger row may take.
    pub fn can_transition_to(&self, next: RewardStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Completed) | (Self::Completed, Self::Reversed)
        )
    }
}

impl fmt::Display for RewardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RewardStatus {
    type Err = KaziError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "reversed" => Ok(Self::Reversed),
            other => Err(KaziError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEvent {
    pub id: RewardEventId,
    pub inviter_id: UserId,
    pub invitee_id: UserId,
    pub invitee_level_at_trigger: Level,
    pub amount: Amount,
    pub status: RewardStatus,
    pub created_at: DateTime<Utc>,
    /// Set only when the event moves to `Completed`.
    pub processed_at: Option<DateTime<Utc>>,
}

impl RewardEvent {
    pub fn pending(
        inviter_id: UserId,
        invitee_id: UserId,
        invitee_level: Level,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RewardEventId::for_pair(inviter_id, invitee_id),
            inviter_id,
            invitee_id,
            invitee_level_at_trigger: invitee_level,
            amount,
            status: RewardStatus::Pending,
            created_at: now,
            processed_at: None,
        }
    }

    pub fn completed(
        inviter_id: UserId,
        invitee_id: UserId,
        invitee_level: Level,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: RewardStatus::Completed,
            processed_at: Some(now),
            ..Self::pending(inviter_id, invitee_id, invitee_level, amount, now)
        }
    }

    pub fn pair(&self) -> (UserId, UserId) {
        (self.inviter_id, self.invitee_id)
    }

    pub fn is_pending(&self) -> bool {
        self.status == RewardStatus::Pending
    }
}

/// Audit entry written when a completed reward is reversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalRecord {
    pub event_id: RewardEventId,
    pub inviter_id: UserId,
    pub actor: String,
    pub reason: String,
    pub amount: Amount,
    /// What was actually taken from the wallet.
    pub debited: Amount,
    /// `amount - debited`; non-zero only for a floored (forced) reversal.
    pub shortfall: Amount,
    pub reversed_at: DateTime<Utc>,
}

impl ReversalRecord {
    pub fn is_anomalous(&self) -> bool {
        !self.shortfall.is_zero()
    }
}
