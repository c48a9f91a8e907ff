//! Settlement racing a writer the engine cannot see: another process sharing
//! the database, or another engine instance with its own locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kazi_rewards::{
    AppliedBatch, ErrorKind, MemoryStore, NoopNotifier, ReferralRewardEngine, RewardError,
    RewardLedger, RewardsConfig, SettlementBatch, SettlementOutcome, SettlementStore,
    StoreResult, UserDirectory,
};
use kazi_types::{
    Amount, InvitationCode, Level, ReversalRecord, RewardEvent, RewardEventId, RewardStatus,
    User, UserId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const INVITER: UserId = UserId::new(1);
const INVITEE: UserId = UserId::new(2);

/// Delegates to a shared store, but answers its first pair lookup, or its
/// first event lookup, from before another writer committed.
struct StaleReads {
    inner: Arc<dyn SettlementStore>,
    stale_pair: AtomicBool,
    ghost_event: Mutex<Option<RewardEvent>>,
}

impl StaleReads {
    fn hiding_pair(inner: Arc<dyn SettlementStore>) -> Self {
        Self {
            inner,
            stale_pair: AtomicBool::new(true),
            ghost_event: Mutex::new(None),
        }
    }

    fn with_ghost_event(inner: Arc<dyn SettlementStore>, event: RewardEvent) -> Self {
        Self {
            inner,
            stale_pair: AtomicBool::new(false),
            ghost_event: Mutex::new(Some(event)),
        }
    }
}

#[async_trait]
impl UserDirectory for StaleReads {
    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>> {
        self.inner.get_user(id).await
    }

    async fn increment_wallet(&self, id: UserId, delta: i64) -> StoreResult<Amount> {
        self.inner.increment_wallet(id, delta).await
    }

    async fn get_users_referred_by(&self, inviter: UserId) -> StoreResult<Vec<User>> {
        self.inner.get_users_referred_by(inviter).await
    }

    async fn find_by_invitation_code(&self, code: &InvitationCode) -> StoreResult<Option<User>> {
        self.inner.find_by_invitation_code(code).await
    }

    async fn set_invited_by(&self, invitee: UserId, inviter: UserId) -> StoreResult<()> {
        self.inner.set_invited_by(invitee, inviter).await
    }

    async fn list_user_ids(&self) -> StoreResult<Vec<UserId>> {
        self.inner.list_user_ids().await
    }
}

#[async_trait]
impl RewardLedger for StaleReads {
    async fn find_by_pair(
        &self,
        inviter: UserId,
        invitee: UserId,
    ) -> StoreResult<Option<RewardEvent>> {
        if self.stale_pair.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_by_pair(inviter, invitee).await
    }

    async fn get_event(&self, id: RewardEventId) -> StoreResult<Option<RewardEvent>> {
        let ghost = self.ghost_event.lock().unwrap().take();
        if let Some(event) = ghost {
            return Ok(Some(event));
        }
        self.inner.get_event(id).await
    }

    async fn insert(&self, event: RewardEvent) -> StoreResult<RewardEvent> {
        self.inner.insert(event).await
    }

    async fn find_pending_by_inviter(&self, inviter: UserId) -> StoreResult<Vec<RewardEvent>> {
        self.inner.find_pending_by_inviter(inviter).await
    }

    async fn find_by_inviter(&self, inviter: UserId) -> StoreResult<Vec<RewardEvent>> {
        self.inner.find_by_inviter(inviter).await
    }

    async fn update_status(
        &self,
        id: RewardEventId,
        expected: RewardStatus,
        status: RewardStatus,
        processed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<RewardEvent> {
        self.inner
            .update_status(id, expected, status, processed_at)
            .await
    }

    async fn list_events(&self) -> StoreResult<Vec<RewardEvent>> {
        self.inner.list_events().await
    }

    async fn list_reversals(&self) -> StoreResult<Vec<ReversalRecord>> {
        self.inner.list_reversals().await
    }
}

#[async_trait]
impl SettlementStore for StaleReads {
    async fn apply(&self, batch: SettlementBatch) -> StoreResult<AppliedBatch> {
        self.inner.apply(batch).await
    }
}

fn engine(store: Arc<dyn SettlementStore>) -> ReferralRewardEngine {
    ReferralRewardEngine::new(store, Arc::new(NoopNotifier), RewardsConfig::default())
}

/// The first writer settles; the second misses the row on its pre-check and
/// must lose on the unique pair instead of crediting again.
async fn assert_lost_race_is_already_settled(shared: Arc<dyn SettlementStore>) {
    let first = engine(shared.clone())
        .evaluate_and_settle(INVITEE)
        .await
        .unwrap();
    assert!(matches!(first, SettlementOutcome::Completed(_)));

    let late = engine(Arc::new(StaleReads::hiding_pair(shared.clone())));
    let outcome = late.evaluate_and_settle(INVITEE).await.unwrap();
    match &outcome {
        SettlementOutcome::AlreadySettled(event) => {
            assert_eq!(event.pair(), (INVITER, INVITEE));
            assert_eq!(event.status, RewardStatus::Completed);
        }
        other => panic!("expected AlreadySettled, got {:?}", other),
    }
    assert!(!outcome.is_new());

    assert_eq!(shared.list_events().await.unwrap().len(), 1);
    assert_eq!(
        shared.get_user(INVITER).await.unwrap().unwrap().wallet_balance,
        Amount::from_major(600)
    );
}

#[tokio::test]
async fn test_lost_insert_race_in_memory() {
    println!("\n=== Lost insert race: memory store ===");
    let store = MemoryStore::with_users([
        User::new(INVITER, Level::new(1)),
        User::new(INVITEE, Level::new(2)).invited_by(INVITER),
    ])
    .await;
    assert_lost_race_is_already_settled(Arc::new(store)).await;
    println!("✓ Second writer re-read the pair and credited nothing");
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_lost_insert_race_on_sqlite_unique_pair() {
    use kazi_rewards::SqliteStore;
    use std::time::Duration;

    println!("\n=== Lost insert race: SQLite unique pair ===");
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("kazi.db");
    let seed = SqliteStore::open(&path, Duration::from_secs(2)).unwrap();
    seed.upsert_user(&User::new(INVITER, Level::new(1)))
        .await
        .unwrap();
    seed.upsert_user(&User::new(INVITEE, Level::new(2)).invited_by(INVITER))
        .await
        .unwrap();

    assert_lost_race_is_already_settled(Arc::new(seed)).await;
    println!("✓ Constraint loss surfaced as AlreadySettled");
}

#[tokio::test]
async fn test_reversal_of_vanished_event_reports_the_event() {
    let store: Arc<dyn SettlementStore> = Arc::new(
        MemoryStore::with_users([
            User::new(INVITER, Level::new(1)).with_balance(Amount::from_major(600)),
            User::new(INVITEE, Level::new(2)).invited_by(INVITER),
        ])
        .await,
    );
    // Read by the engine, then gone before the reversal batch runs.
    let ghost = RewardEvent::completed(
        INVITER,
        INVITEE,
        Level::new(2),
        Amount::from_major(600),
        Utc::now(),
    );
    let engine = engine(Arc::new(StaleReads::with_ghost_event(store.clone(), ghost.clone())));

    let err = engine
        .reverse_reward(ghost.id, "ops", "chargeback")
        .await
        .unwrap_err();
    assert_eq!(err, RewardError::EventNotFound(ghost.id));
    assert_eq!(err.kind(), ErrorKind::EventNotFound);
    assert_eq!(
        store.get_user(INVITER).await.unwrap().unwrap().wallet_balance,
        Amount::from_major(600)
    );
}

#[tokio::test]
async fn test_reversal_for_missing_inviter_reports_the_user() {
    let store = Arc::new(MemoryStore::new());
    let event = RewardEvent::completed(
        INVITER,
        INVITEE,
        Level::new(2),
        Amount::from_major(600),
        Utc::now(),
    );
    store.insert(event.clone()).await.unwrap();

    let err = engine(store)
        .reverse_reward(event.id, "ops", "chargeback")
        .await
        .unwrap_err();
    assert_eq!(err, RewardError::UserNotFound(INVITER));
}
