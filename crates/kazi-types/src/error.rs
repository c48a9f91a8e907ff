use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KaziError {
    #[error("Invalid invitation code: {0}")]
    InvalidInvitationCode(String),

    #[error("Invalid reward event id: {0}")]
    InvalidEventId(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid level: {0}")]
    InvalidLevel(String),

    #[error("Unknown reward status: {0}")]
    UnknownStatus(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for KaziError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KaziError>;
