use crate::error::KaziError;
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical user identifier. Referral links always point at one of these,
/// never at an invitation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user#{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().trim_start_matches("user#");
        raw.parse::<u64>().map(Self)
    }
}

/// Human-shareable invitation code. Only used to look a user up when a
/// referral link is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InvitationCode(String);

impl InvitationCode {
    pub const MIN_LEN: usize = 4;
    pub const MAX_LEN: usize = 32;

    pub fn parse(raw: &str) -> Result<Self, KaziError> {
        let normalized = raw.trim().to_ascii_uppercase();

        if normalized.len() < Self::MIN_LEN || normalized.len() > Self::MAX_LEN {
            return Err(KaziError::InvalidInvitationCode(format!(
                "length must be between {} and {}, got {}",
                Self::MIN_LEN,
                Self::MAX_LEN,
                normalized.len()
            )));
        }

        if !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(KaziError::InvalidInvitationCode(format!(
                "'{}' contains non-alphanumeric characters",
                raw.trim()
            )));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InvitationCode {
    type Error = KaziError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<InvitationCode> for String {
    fn from(code: InvitationCode) -> Self {
        code.0
    }
}

impl fmt::Display for InvitationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger key for a reward event, derived from the (inviter, invitee) pair so
/// that a pair can only ever map to one event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RewardEventId([u8; 32]);

impl RewardEventId {
    pub fn for_pair(inviter: UserId, invitee: UserId) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(b"kazi/referral-reward/v1");
        hasher.update(&inviter.get().to_le_bytes());
        hasher.update(&invitee.get().to_le_bytes());
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, KaziError> {
        let bytes = hex::decode(s.trim()).map_err(|e| KaziError::InvalidEventId(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(KaziError::InvalidEventId(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for RewardEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RewardEventId({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for RewardEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for RewardEventId {
    type Err = KaziError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
