pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod notify;
pub mod reconcile;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod storage;

pub use config::{RewardTable, RewardsConfig};
pub use engine::{
    LevelChangeOutcome, ReferralRewardEngine, ReferralSummary, SettlementOutcome,
    UpgradeSettlement,
};
pub use error::{ErrorKind, RewardError, RewardResult};
pub use locks::KeyedLocks;
pub use notify::{
    BroadcastNotifier, NoopNotifier, Notification, NotificationKind, NotificationService,
    TracingNotifier,
};
pub use reconcile::{Drift, ReconciliationReport, Reconciler, RepairSummary};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use storage::{
    AppliedBatch, BatchOp, MemoryStore, RewardLedger, SettlementBatch, SettlementStore,
    StoreError, StoreResult, UserDirectory, WalletChange,
};
