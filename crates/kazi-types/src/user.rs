use crate::amount::Amount;
use crate::ids::{InvitationCode, UserId};
use crate::level::Level;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub invitation_code: Option<InvitationCode>,
    pub level: Level,
    pub wallet_balance: Amount,
    /// Set at most once, when the referral link is created.
    pub invited_by: Option<UserId>,
}

impl User {
    pub fn new(id: UserId, level: Level) -> Self {
        Self {
            id,
            invitation_code: None,
            level,
            wallet_balance: Amount::ZERO,
            invited_by: None,
        }
    }

    pub fn with_code(mut self, code: InvitationCode) -> Self {
        self.invitation_code = Some(code);
        self
    }

    pub fn with_balance(mut self, balance: Amount) -> Self {
        self.wallet_balance = balance;
        self
    }

    pub fn invited_by(mut self, inviter: UserId) -> Self {
        self.invited_by = Some(inviter);
        self
    }

    pub fn is_temporary(&self) -> bool {
        self.level.is_temporary()
    }
}
