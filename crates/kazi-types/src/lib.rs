pub mod amount;
pub mod error;
pub mod ids;
pub mod level;
pub mod reward;
pub mod user;

pub use amount::{Amount, BASE_UNITS_PER_MAJOR, CURRENCY};
pub use error::{KaziError, Result};
pub use ids::{InvitationCode, RewardEventId, UserId};
pub use level::Level;
pub use reward::{ReversalRecord, RewardEvent, RewardStatus};
pub use user::User;
