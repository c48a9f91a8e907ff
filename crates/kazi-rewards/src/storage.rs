use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kazi_types::{
    Amount, InvitationCode, Level, ReversalRecord, RewardEvent, RewardEventId, RewardStatus,
    User, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique-constraint violation, e.g. a second ledger row for the same pair.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{invitee} is already linked to inviter {inviter}")]
    AlreadyLinked { invitee: UserId, inviter: UserId },

    #[error("Wallet underflow for {user}: balance {balance}, requested {requested}")]
    Underflow {
        user: UserId,
        balance: Amount,
        requested: Amount,
    },

    #[error("Wallet overflow for {0}")]
    Overflow(UserId),

    #[error("Invalid transition for event {event}: expected {expected}, found {actual}")]
    InvalidTransition {
        event: RewardEventId,
        expected: RewardStatus,
        actual: RewardStatus,
    },

    /// A write the schema refused for a reason other than uniqueness.
    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// User records, levels and wallets. Owned by the wider platform; the engine
/// only reads users and applies relative wallet updates.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>>;

    /// Atomic relative update (`balance = balance + delta`, delta in base
    /// units). Fails with `Underflow` instead of going below zero.
    async fn increment_wallet(&self, id: UserId, delta: i64) -> StoreResult<Amount>;

    async fn get_users_referred_by(&self, inviter: UserId) -> StoreResult<Vec<User>>;

    async fn find_by_invitation_code(&self, code: &InvitationCode) -> StoreResult<Option<User>>;

    /// Sets `invited_by` only if it is still empty.
    async fn set_invited_by(&self, invitee: UserId, inviter: UserId) -> StoreResult<()>;

    async fn list_user_ids(&self) -> StoreResult<Vec<UserId>>;
}

/// Durable record of referral reward events, unique per (inviter, invitee).
#[async_trait]
pub trait RewardLedger: Send + Sync {
    async fn find_by_pair(&self, inviter: UserId, invitee: UserId)
        -> StoreResult<Option<RewardEvent>>;

    async fn get_event(&self, id: RewardEventId) -> StoreResult<Option<RewardEvent>>;

    /// Fails with `Conflict` if the pair already has an event.
    async fn insert(&self, event: RewardEvent) -> StoreResult<RewardEvent>;

    async fn find_pending_by_inviter(&self, inviter: UserId) -> StoreResult<Vec<RewardEvent>>;

    async fn find_by_inviter(&self, inviter: UserId) -> StoreResult<Vec<RewardEvent>>;

    /// Conditional transition: fails with `InvalidTransition` unless the row
    /// is currently `expected`.
    async fn update_status(
        &self,
        id: RewardEventId,
        expected: RewardStatus,
        status: RewardStatus,
        processed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<RewardEvent>;

    async fn list_events(&self) -> StoreResult<Vec<RewardEvent>>;

    async fn list_reversals(&self) -> StoreResult<Vec<ReversalRecord>>;
}

/// A store that owns both users and the ledger and can apply a mixed batch
/// of writes as one transaction.
#[async_trait]
pub trait SettlementStore: UserDirectory + RewardLedger {
    async fn apply(&self, batch: SettlementBatch) -> StoreResult<AppliedBatch>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    InsertEvent(RewardEvent),
    Transition {
        id: RewardEventId,
        from: RewardStatus,
        to: RewardStatus,
        at: DateTime<Utc>,
    },
    Credit {
        user: UserId,
        amount: Amount,
    },
    Debit {
        user: UserId,
        amount: Amount,
        floor_at_zero: bool,
    },
    /// Completed -> Reversed, debit the inviter by the event amount read in
    /// the same transaction, append the audit record.
    Reverse {
        id: RewardEventId,
        actor: String,
        reason: String,
        at: DateTime<Utc>,
        floor_at_zero: bool,
    },
}

/// Ordered, all-or-nothing list of ledger and wallet writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementBatch {
    pub ops: Vec<BatchOp>,
}

impl SettlementBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, event: RewardEvent) -> Self {
        self.ops.push(BatchOp::InsertEvent(event));
        self
    }

    pub fn transition(
        mut self,
        id: RewardEventId,
        from: RewardStatus,
        to: RewardStatus,
        at: DateTime<Utc>,
    ) -> Self {
        self.ops.push(BatchOp::Transition { id, from, to, at });
        self
    }

    pub fn credit(mut self, user: UserId, amount: Amount) -> Self {
        self.ops.push(BatchOp::Credit { user, amount });
        self
    }

    pub fn debit(mut self, user: UserId, amount: Amount, floor_at_zero: bool) -> Self {
        self.ops.push(BatchOp::Debit {
            user,
            amount,
            floor_at_zero,
        });
        self
    }

    pub fn reverse(
        mut self,
        id: RewardEventId,
        actor: impl Into<String>,
        reason: impl Into<String>,
        at: DateTime<Utc>,
        floor_at_zero: bool,
    ) -> Self {
        self.ops.push(BatchOp::Reverse {
            id,
            actor: actor.into(),
            reason: reason.into(),
            at,
            floor_at_zero,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletChange {
    pub user: UserId,
    pub before: Amount,
    pub after: Amount,
    /// Portion of a floored debit that could not be taken.
    pub shortfall: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedBatch {
    pub wallet_changes: Vec<WalletChange>,
    /// Final state of every event the batch touched, in op order.
    pub events: Vec<RewardEvent>,
    pub reversals: Vec<ReversalRecord>,
}

impl AppliedBatch {
    pub fn wallet_change_for(&self, user: UserId) -> Option<&WalletChange> {
        self.wallet_changes.iter().rev().find(|c| c.user == user)
    }

    pub fn event(&self, id: RewardEventId) -> Option<&RewardEvent> {
        self.events.iter().rev().find(|e| e.id == id)
    }
}

#[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
pub(crate) fn amount_to_delta(amount: Amount) -> StoreResult<i64> {
    i64::try_from(amount.to_base_units())
        .map_err(|_| StoreError::Backend(format!("{} does not fit a signed delta", amount)))
}

/// Computes a debit against `balance`. Without the floor, a debit larger than
/// the balance is refused.
pub(crate) fn plan_debit(
    user: UserId,
    balance: Amount,
    amount: Amount,
    floor_at_zero: bool,
) -> StoreResult<WalletChange> {
    match balance.checked_sub(amount) {
        Some(after) => Ok(WalletChange {
            user,
            before: balance,
            after,
            shortfall: Amount::ZERO,
        }),
        None if floor_at_zero => Ok(WalletChange {
            user,
            before: balance,
            after: Amount::ZERO,
            shortfall: amount.saturating_sub(balance),
        }),
        None => Err(StoreError::Underflow {
            user,
            balance,
            requested: amount,
        }),
    }
}

pub(crate) fn check_transition(
    event: &RewardEvent,
    from: RewardStatus,
    to: RewardStatus,
) -> StoreResult<()> {
    if event.status != from || !from.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            event: event.id,
            expected: from,
            actual: event.status,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    codes: HashMap<InvitationCode, UserId>,
    events: HashMap<RewardEventId, RewardEvent>,
    pairs: HashMap<(UserId, UserId), RewardEventId>,
    reversals: Vec<ReversalRecord>,
}

impl MemoryState {
    fn user_mut(&mut self, id: UserId) -> StoreResult<&mut User> {
        self.users
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("{}", id)))
    }

    fn event_mut(&mut self, id: RewardEventId) -> StoreResult<&mut RewardEvent> {
        self.events
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("reward event {}", id)))
    }

    fn apply_op(&mut self, op: BatchOp, applied: &mut AppliedBatch) -> StoreResult<()> {
        match op {
            BatchOp::InsertEvent(event) => {
                let pair = event.pair();
                if self.pairs.contains_key(&pair) || self.events.contains_key(&event.id) {
                    return Err(StoreError::Conflict(format!(
                        "reward event already exists for inviter {} and invitee {}",
                        pair.0, pair.1
                    )));
                }
                self.pairs.insert(pair, event.id);
                self.events.insert(event.id, event.clone());
                applied.events.push(event);
            }
            BatchOp::Transition { id, from, to, at } => {
                let event = self.event_mut(id)?;
                check_transition(event, from, to)?;
                event.status = to;
                if to == RewardStatus::Completed {
                    event.processed_at = Some(at);
                }
                applied.events.push(event.clone());
            }
            BatchOp::Credit { user, amount } => {
                let account = self.user_mut(user)?;
                let before = account.wallet_balance;
                let after = before
                    .checked_add(amount)
                    .ok_or(StoreError::Overflow(user))?;
                account.wallet_balance = after;
                applied.wallet_changes.push(WalletChange {
                    user,
                    before,
                    after,
                    shortfall: Amount::ZERO,
                });
            }
            BatchOp::Debit {
                user,
                amount,
                floor_at_zero,
            } => {
                let account = self.user_mut(user)?;
                let change = plan_debit(user, account.wallet_balance, amount, floor_at_zero)?;
                account.wallet_balance = change.after;
                applied.wallet_changes.push(change);
            }
            BatchOp::Reverse {
                id,
                actor,
                reason,
                at,
                floor_at_zero,
            } => {
                let event = self.event_mut(id)?;
                check_transition(event, RewardStatus::Completed, RewardStatus::Reversed)?;
                let (inviter, amount) = (event.inviter_id, event.amount);

                let account = self.user_mut(inviter)?;
                let change = plan_debit(inviter, account.wallet_balance, amount, floor_at_zero)?;
                account.wallet_balance = change.after;

                let event = self.event_mut(id)?;
                event.status = RewardStatus::Reversed;
                let event = event.clone();

                let record = ReversalRecord {
                    event_id: id,
                    inviter_id: inviter,
                    actor,
                    reason,
                    amount,
                    debited: change.before.saturating_sub(change.after),
                    shortfall: change.shortfall,
                    reversed_at: at,
                };
                self.reversals.push(record.clone());
                applied.wallet_changes.push(change);
                applied.events.push(event);
                applied.reversals.push(record);
            }
        }
        Ok(())
    }
}

/// In-process store. All state sits behind one lock; a batch is applied to a
/// snapshot which replaces the live state only if every op succeeds.
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
        }
    }

    pub async fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let store = Self::new();
        for user in users {
            store.upsert_user(user).await;
        }
        store
    }

    /// Registration and level changes belong to the wider platform; this is
    /// how they reach the in-memory directory.
    pub async fn upsert_user(&self, user: User) {
        let mut state = self.state.write().await;
        if let Some(code) = &user.invitation_code {
            state.codes.insert(code.clone(), user.id);
        }
        debug!(user = %user.id, level = %user.level, storage_type = "memory", "User stored");
        state.users.insert(user.id, user);
    }

    pub async fn set_level(&self, id: UserId, level: Level) -> StoreResult<Level> {
        let mut state = self.state.write().await;
        let user = state.user_mut(id)?;
        let previous = user.level;
        user.level = level;
        Ok(previous)
    }

    /// Test and repair hook: overwrites a wallet outright, bypassing the ledger.
    pub async fn set_wallet_balance(&self, id: UserId, balance: Amount) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.user_mut(id)?.wallet_balance = balance;
        Ok(())
    }

    /// Removes a user record; used to model dangling referral links.
    pub async fn remove_user(&self, id: UserId) -> Option<User> {
        let mut state = self.state.write().await;
        let removed = state.users.remove(&id);
        if let Some(code) = removed.as_ref().and_then(|u| u.invitation_code.as_ref()) {
            state.codes.remove(code);
        }
        removed
    }

    pub async fn wallet_total(&self) -> Amount {
        let state = self.state.read().await;
        state
            .users
            .values()
            .fold(Amount::ZERO, |acc, u| acc.saturating_add(u.wallet_balance))
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>> {
        let state = self.state.read().await;
        Ok(state.users.get(&id).cloned())
    }

    async fn increment_wallet(&self, id: UserId, delta: i64) -> StoreResult<Amount> {
        let amount = Amount::from_base_units(delta.unsigned_abs());
        let batch = if delta >= 0 {
            SettlementBatch::new().credit(id, amount)
        } else {
            SettlementBatch::new().debit(id, amount, false)
        };
        let applied = self.apply(batch).await?;
        applied
            .wallet_change_for(id)
            .map(|c| c.after)
            .ok_or_else(|| StoreError::Backend("wallet change missing from batch".into()))
    }

    async fn get_users_referred_by(&self, inviter: UserId) -> StoreResult<Vec<User>> {
        let state = self.state.read().await;
        let mut users: Vec<User> = state
            .users
            .values()
            .filter(|u| u.invited_by == Some(inviter))
            .cloned()
            .collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn find_by_invitation_code(&self, code: &InvitationCode) -> StoreResult<Option<User>> {
        let state = self.state.read().await;
        Ok(state
            .codes
            .get(code)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn set_invited_by(&self, invitee: UserId, inviter: UserId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let user = state.user_mut(invitee)?;
        if let Some(existing) = user.invited_by {
            return Err(StoreError::AlreadyLinked {
                invitee,
                inviter: existing,
            });
        }
        user.invited_by = Some(inviter);
        Ok(())
    }

    async fn list_user_ids(&self) -> StoreResult<Vec<UserId>> {
        let state = self.state.read().await;
        let mut ids: Vec<UserId> = state.users.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl RewardLedger for MemoryStore {
    async fn find_by_pair(
        &self,
        inviter: UserId,
        invitee: UserId,
    ) -> StoreResult<Option<RewardEvent>> {
        let state = self.state.read().await;
        Ok(state
            .pairs
            .get(&(inviter, invitee))
            .and_then(|id| state.events.get(id))
            .cloned())
    }

    async fn get_event(&self, id: RewardEventId) -> StoreResult<Option<RewardEvent>> {
        let state = self.state.read().await;
        Ok(state.events.get(&id).cloned())
    }

    async fn insert(&self, event: RewardEvent) -> StoreResult<RewardEvent> {
        let id = event.id;
        let applied = self.apply(SettlementBatch::new().insert(event)).await?;
        applied
            .event(id)
            .cloned()
            .ok_or_else(|| StoreError::Backend("inserted event missing from batch".into()))
    }

    async fn find_pending_by_inviter(&self, inviter: UserId) -> StoreResult<Vec<RewardEvent>> {
        let mut events = self.find_by_inviter(inviter).await?;
        events.retain(|e| e.is_pending());
        Ok(events)
    }

    async fn find_by_inviter(&self, inviter: UserId) -> StoreResult<Vec<RewardEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<RewardEvent> = state
            .events
            .values()
            .filter(|e| e.inviter_id == inviter)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn update_status(
        &self,
        id: RewardEventId,
        expected: RewardStatus,
        status: RewardStatus,
        processed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<RewardEvent> {
        let at = processed_at.unwrap_or_else(Utc::now);
        let applied = self
            .apply(SettlementBatch::new().transition(id, expected, status, at))
            .await?;
        applied
            .event(id)
            .cloned()
            .ok_or_else(|| StoreError::Backend("updated event missing from batch".into()))
    }

    async fn list_events(&self) -> StoreResult<Vec<RewardEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<RewardEvent> = state.events.values().cloned().collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn list_reversals(&self) -> StoreResult<Vec<ReversalRecord>> {
        let state = self.state.read().await;
        Ok(state.reversals.clone())
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn apply(&self, batch: SettlementBatch) -> StoreResult<AppliedBatch> {
        let mut state = self.state.write().await;

        // Snapshot; only swapped in once every op has succeeded.
        let mut staged = state.clone();
        let mut applied = AppliedBatch::default();
        let op_count = batch.len();

        for op in batch.ops {
            if let Err(e) = staged.apply_op(op, &mut applied) {
                debug!(
                    ops = op_count,
                    error = %e,
                    storage_type = "memory",
                    "Settlement batch rolled back"
                );
                return Err(e);
            }
        }

        *state = staged;

        info!(
            ops = op_count,
            wallet_changes = applied.wallet_changes.len(),
            events = applied.events.len(),
            storage_type = "memory",
            "💾 Settlement batch committed"
        );
        Ok(applied)
    }
}
