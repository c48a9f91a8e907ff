//! Referral reward settlement.
//!
//! An invitee reaching a rewarded level owes their inviter exactly one bonus.
//! Inviters who are still temporary workers (level 0) get the bonus recorded
//! as `Pending`; it is credited when they upgrade. Every ledger write and its
//! wallet effect go to the store as one batch.

use crate::config::RewardsConfig;
use crate::error::{ErrorKind, RewardError, RewardResult};
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::notify::{Notification, NotificationKind, NotificationService};
use crate::storage::{SettlementBatch, SettlementStore, StoreError};
use chrono::Utc;
use kazi_types::{
    Amount, InvitationCode, Level, ReversalRecord, RewardEvent, RewardEventId, RewardStatus,
    User, UserId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// Inviter credited in the same transaction as the ledger write.
    Completed(RewardEvent),
    /// Recorded as pending; inviter is a temporary worker.
    Deferred(RewardEvent),
    /// The pair already has a ledger row; nothing changed.
    AlreadySettled(RewardEvent),
    /// The invitee's level carries no reward.
    NotEligible { invitee: UserId, level: Level },
    /// The invitee has no inviter.
    NotReferred(UserId),
}

impl SettlementOutcome {
    pub fn event(&self) -> Option<&RewardEvent> {
        match self {
            Self::Completed(e) | Self::Deferred(e) | Self::AlreadySettled(e) => Some(e),
            Self::NotEligible { .. } | Self::NotReferred(_) => None,
        }
    }

    /// `NotEligible` and `AlreadySettled` are normal outcomes that still carry
    /// a kind so callers can branch on them alongside errors.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::AlreadySettled(_) => Some(ErrorKind::AlreadySettled),
            Self::NotEligible { .. } => Some(ErrorKind::NotEligible),
            _ => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Deferred(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSettlement {
    pub user: UserId,
    pub settled: Vec<RewardEvent>,
    /// Pending rows that were no longer pending when we reached them.
    pub skipped: Vec<RewardEventId>,
    pub credited: Amount,
}

impl UpgradeSettlement {
    fn empty(user: UserId) -> Self {
        Self {
            user,
            settled: Vec::new(),
            skipped: Vec::new(),
            credited: Amount::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelChangeOutcome {
    /// Rewards this user had earned as an inviter while at level 0.
    pub pending_settled: Option<UpgradeSettlement>,
    /// This user's own qualification as an invitee.
    pub as_invitee: Option<SettlementOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralSummary {
    pub inviter: UserId,
    pub referrals: usize,
    pub rewarded: usize,
    pub pending_count: usize,
    pub pending_total: Amount,
    pub completed_total: Amount,
    pub reversed_total: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Wallet(UserId),
    Pair(UserId, UserId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wallet(user) => write!(f, "wallet:{}", user),
            Self::Pair(inviter, invitee) => write!(f, "pair:{}->{}", invitee, inviter),
        }
    }
}

pub struct ReferralRewardEngine {
    store: Arc<dyn SettlementStore>,
    notifier: Arc<dyn NotificationService>,
    config: RewardsConfig,
    locks: KeyedLocks<LockKey>,
}

impl ReferralRewardEngine {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        notifier: Arc<dyn NotificationService>,
        config: RewardsConfig,
    ) -> Self {
        let locks = KeyedLocks::new(config.lock_timeout());
        Self {
            store,
            notifier,
            config,
            locks,
        }
    }

    pub fn config(&self) -> &RewardsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SettlementStore> {
        &self.store
    }

    /// Settles the referral reward owed for `invitee_id`, at most once per
    /// (inviter, invitee) pair. Safe to call repeatedly and concurrently.
    pub async fn evaluate_and_settle(&self, invitee_id: UserId) -> RewardResult<SettlementOutcome> {
        let invitee = self.require_user(invitee_id).await?;
        let Some(inviter_id) = invitee.invited_by else {
            debug!(invitee = %invitee_id, "No referral link; nothing to settle");
            return Ok(SettlementOutcome::NotReferred(invitee_id));
        };

        if self.store.get_user(inviter_id).await?.is_none() {
            warn!(
                invitee = %invitee_id,
                inviter = %inviter_id,
                "⚠️ Referral link points at a missing inviter"
            );
            return Err(RewardError::BrokenReferralLink {
                invitee: invitee_id,
                inviter: inviter_id,
            });
        }

        // Wallet before pair, everywhere.
        let _wallet = self.lock(LockKey::Wallet(inviter_id)).await?;
        let _pair = self.lock(LockKey::Pair(inviter_id, invitee_id)).await?;

        if let Some(existing) = self.store.find_by_pair(inviter_id, invitee_id).await? {
            debug!(
                inviter = %inviter_id,
                invitee = %invitee_id,
                status = %existing.status,
                "Referral reward already recorded"
            );
            return Ok(SettlementOutcome::AlreadySettled(existing));
        }

        // Levels may have moved while we waited for the locks.
        let invitee = self.require_user(invitee_id).await?;
        let inviter = self.store.get_user(inviter_id).await?.ok_or(
            RewardError::BrokenReferralLink {
                invitee: invitee_id,
                inviter: inviter_id,
            },
        )?;

        let Some(amount) = self.config.reward_table.reward_for(invitee.level) else {
            debug!(invitee = %invitee_id, level = %invitee.level, "Invitee level not eligible");
            return Ok(SettlementOutcome::NotEligible {
                invitee: invitee_id,
                level: invitee.level,
            });
        };

        let now = Utc::now();
        let deferred = inviter.level.is_temporary();
        let (event, batch) = if deferred {
            let event = RewardEvent::pending(inviter_id, invitee_id, invitee.level, amount, now);
            let batch = SettlementBatch::new().insert(event.clone());
            (event, batch)
        } else {
            let event = RewardEvent::completed(inviter_id, invitee_id, invitee.level, amount, now);
            let batch = SettlementBatch::new()
                .insert(event.clone())
                .credit(inviter_id, amount);
            (event, batch)
        };

        let applied = match self.store.apply(batch).await {
            Ok(applied) => applied,
            Err(StoreError::Conflict(msg)) => {
                // Another writer got there first; its row is the settlement.
                debug!(inviter = %inviter_id, invitee = %invitee_id, "Insert lost race: {}", msg);
                return match self.store.find_by_pair(inviter_id, invitee_id).await? {
                    Some(existing) => Ok(SettlementOutcome::AlreadySettled(existing)),
                    None => Err(RewardError::StorageConflict(msg)),
                };
            }
            Err(e) => return Err(e.into()),
        };

        let event = applied.event(event.id).cloned().unwrap_or(event);

        if deferred {
            info!(
                inviter = %inviter_id,
                invitee = %invitee_id,
                invitee_level = %invitee.level,
                amount = %amount,
                status = %event.status,
                "⏳ Referral reward deferred until inviter upgrades"
            );
            self.send(Notification {
                user: inviter_id,
                kind: NotificationKind::RewardDeferred,
                message: format!(
                    "You earned a referral bonus of {} for inviting {}. It will be released once you upgrade from level 0.",
                    amount, invitee_id
                ),
                amount,
                event_id: event.id,
                at: now,
            })
            .await;
            Ok(SettlementOutcome::Deferred(event))
        } else {
            let change = applied.wallet_change_for(inviter_id);
            info!(
                inviter = %inviter_id,
                invitee = %invitee_id,
                invitee_level = %invitee.level,
                amount = %amount,
                balance_before = %change.map(|c| c.before).unwrap_or_default(),
                balance_after = %change.map(|c| c.after).unwrap_or_default(),
                "💰 Referral reward credited"
            );
            self.send(Notification {
                user: inviter_id,
                kind: NotificationKind::RewardCredited,
                message: format!(
                    "Referral bonus of {} credited for inviting {}.",
                    amount, invitee_id
                ),
                amount,
                event_id: event.id,
                at: now,
            })
            .await;
            Ok(SettlementOutcome::Completed(event))
        }
    }

    /// Credits every pending reward held for `user_id`. Each event is its own
    /// transaction; rows completed by someone else in the meantime are skipped.
    pub async fn settle_pending_rewards_on_upgrade(
        &self,
        user_id: UserId,
    ) -> RewardResult<UpgradeSettlement> {
        let user = self.require_user(user_id).await?;
        if user.level.is_temporary() {
            debug!(user = %user_id, "User still at level 0; pending rewards stay held");
            return Ok(UpgradeSettlement::empty(user_id));
        }

        let _wallet = self.lock(LockKey::Wallet(user_id)).await?;

        let pending = self.store.find_pending_by_inviter(user_id).await?;
        let mut result = UpgradeSettlement::empty(user_id);

        for event in pending {
            let now = Utc::now();
            let batch = SettlementBatch::new()
                .transition(event.id, RewardStatus::Pending, RewardStatus::Completed, now)
                .credit(user_id, event.amount);

            match self.store.apply(batch).await {
                Ok(applied) => {
                    let settled = applied.event(event.id).cloned().unwrap_or_else(|| {
                        let mut e = event.clone();
                        e.status = RewardStatus::Completed;
                        e.processed_at = Some(now);
                        e
                    });
                    info!(
                        inviter = %user_id,
                        invitee = %event.invitee_id,
                        amount = %event.amount,
                        event_id = %event.id,
                        "💰 Pending referral reward released"
                    );
                    self.send(Notification {
                        user: user_id,
                        kind: NotificationKind::RewardCredited,
                        message: format!(
                            "Your held referral bonus of {} for inviting {} has been credited.",
                            event.amount, event.invitee_id
                        ),
                        amount: event.amount,
                        event_id: event.id,
                        at: now,
                    })
                    .await;
                    result.credited = result.credited.saturating_add(event.amount);
                    result.settled.push(settled);
                }
                Err(StoreError::InvalidTransition { actual, .. }) => {
                    debug!(
                        event_id = %event.id,
                        status = %actual,
                        "Pending reward already moved on; skipping"
                    );
                    result.skipped.push(event.id);
                }
                Err(e) => {
                    warn!(
                        user = %user_id,
                        settled = result.settled.len(),
                        error = %e,
                        "❌ Pending reward settlement interrupted"
                    );
                    return Err(e.into());
                }
            }
        }

        if !result.settled.is_empty() {
            info!(
                user = %user_id,
                settled = result.settled.len(),
                skipped = result.skipped.len(),
                credited = %result.credited,
                "✅ Pending referral rewards settled"
            );
        }
        Ok(result)
    }

    /// Administrative reversal of a completed reward. Refuses to push the
    /// inviter's wallet below zero.
    pub async fn reverse_reward(
        &self,
        event_id: RewardEventId,
        actor: &str,
        reason: &str,
    ) -> RewardResult<ReversalRecord> {
        self.reverse(event_id, actor, reason, false).await
    }

    /// Reversal after manual review of a blocked one: the wallet is floored at
    /// zero and the uncollected remainder is recorded as the shortfall.
    pub async fn force_reverse_reward(
        &self,
        event_id: RewardEventId,
        actor: &str,
        reason: &str,
    ) -> RewardResult<ReversalRecord> {
        self.reverse(event_id, actor, reason, true).await
    }

    async fn reverse(
        &self,
        event_id: RewardEventId,
        actor: &str,
        reason: &str,
        floor_at_zero: bool,
    ) -> RewardResult<ReversalRecord> {
        if actor.trim().is_empty() {
            return Err(RewardError::MissingAuditDetail("actor"));
        }
        if reason.trim().is_empty() {
            return Err(RewardError::MissingAuditDetail("reason"));
        }

        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or(RewardError::EventNotFound(event_id))?;
        if event.status != RewardStatus::Completed {
            return Err(RewardError::NotReversible {
                event: event_id,
                status: event.status,
            });
        }

        let _wallet = self.lock(LockKey::Wallet(event.inviter_id)).await?;

        let now = Utc::now();
        let batch = SettlementBatch::new().reverse(
            event_id,
            actor.trim(),
            reason.trim(),
            now,
            floor_at_zero,
        );

        let record = match self.store.apply(batch).await {
            Ok(applied) => applied.reversals.into_iter().next().ok_or_else(|| {
                RewardError::Storage(StoreError::Backend(
                    "reversal record missing from batch".into(),
                ))
            })?,
            Err(StoreError::Underflow {
                user,
                balance,
                requested,
            }) => {
                warn!(
                    event_id = %event_id,
                    inviter = %user,
                    balance = %balance,
                    amount = %requested,
                    actor = %actor,
                    reason = %reason,
                    "⚠️ Reversal blocked: wallet would go negative, manual review required"
                );
                return Err(RewardError::ReversalWouldUnderflow {
                    event: event_id,
                    inviter: user,
                    balance,
                    amount: requested,
                });
            }
            Err(StoreError::InvalidTransition { actual, .. }) => {
                return Err(RewardError::NotReversible {
                    event: event_id,
                    status: actual,
                });
            }
            Err(StoreError::NotFound(_)) => {
                // The event may have vanished between the read and the batch.
                return Err(match self.store.get_event(event_id).await? {
                    None => RewardError::EventNotFound(event_id),
                    Some(_) => RewardError::UserNotFound(event.inviter_id),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if record.is_anomalous() {
            warn!(
                event_id = %event_id,
                inviter = %record.inviter_id,
                amount = %record.amount,
                debited = %record.debited,
                shortfall = %record.shortfall,
                actor = %record.actor,
                "⚠️ Forced reversal floored wallet at zero"
            );
        } else {
            info!(
                event_id = %event_id,
                inviter = %record.inviter_id,
                amount = %record.amount,
                actor = %record.actor,
                reason = %record.reason,
                "💸 Referral reward reversed"
            );
        }

        self.send(Notification {
            user: record.inviter_id,
            kind: NotificationKind::RewardReversed,
            message: format!(
                "Referral bonus of {} was reversed: {}",
                record.amount, record.reason
            ),
            amount: record.debited,
            event_id,
            at: now,
        })
        .await;

        Ok(record)
    }

    /// Records that `invitee_id` was referred by `inviter_id`. A link is set
    /// once and never re-pointed.
    pub async fn link_referral(&self, invitee_id: UserId, inviter_id: UserId) -> RewardResult<()> {
        if invitee_id == inviter_id {
            return Err(RewardError::SelfReferral(invitee_id));
        }

        let invitee = self.require_user(invitee_id).await?;
        let inviter = self.require_user(inviter_id).await?;

        if let Some(existing) = invitee.invited_by {
            return Err(RewardError::AlreadyLinked {
                invitee: invitee_id,
                inviter: existing,
            });
        }
        if inviter.invited_by == Some(invitee_id) {
            return Err(RewardError::ReferralCycle {
                invitee: invitee_id,
                inviter: inviter_id,
            });
        }

        self.store.set_invited_by(invitee_id, inviter_id).await?;
        info!(invitee = %invitee_id, inviter = %inviter_id, "🔗 Referral link created");
        Ok(())
    }

    /// Resolves an invitation code to its owner once, then links by id.
    pub async fn link_referral_by_code(
        &self,
        invitee_id: UserId,
        code: &InvitationCode,
    ) -> RewardResult<UserId> {
        let inviter = self
            .store
            .find_by_invitation_code(code)
            .await?
            .ok_or_else(|| RewardError::UnknownInvitationCode(code.to_string()))?;
        self.link_referral(invitee_id, inviter.id).await?;
        Ok(inviter.id)
    }

    /// Entry point for the level-change event source. Releases held rewards
    /// when the user leaves level 0 and settles the user's own referral when
    /// the new level is rewarded.
    pub async fn on_level_change(
        &self,
        user_id: UserId,
        previous: Level,
        current: Level,
    ) -> RewardResult<LevelChangeOutcome> {
        let mut outcome = LevelChangeOutcome::default();
        if current <= previous {
            debug!(user = %user_id, previous = %previous, current = %current, "Level did not increase");
            return Ok(outcome);
        }

        info!(user = %user_id, previous = %previous, current = %current, "🔄 Level increased");

        if previous.is_temporary() {
            outcome.pending_settled = Some(self.settle_pending_rewards_on_upgrade(user_id).await?);
        }

        if self.config.reward_table.is_rewarded(current) {
            outcome.as_invitee = Some(self.evaluate_and_settle(user_id).await?);
        }

        Ok(outcome)
    }

    pub async fn referral_summary(&self, inviter_id: UserId) -> RewardResult<ReferralSummary> {
        self.require_user(inviter_id).await?;
        let referrals = self.store.get_users_referred_by(inviter_id).await?;
        let events = self.store.find_by_inviter(inviter_id).await?;

        let mut summary = ReferralSummary {
            inviter: inviter_id,
            referrals: referrals.len(),
            rewarded: 0,
            pending_count: 0,
            pending_total: Amount::ZERO,
            completed_total: Amount::ZERO,
            reversed_total: Amount::ZERO,
        };

        for event in &events {
            match event.status {
                RewardStatus::Pending => {
                    summary.pending_count += 1;
                    summary.pending_total = summary.pending_total.saturating_add(event.amount);
                }
                RewardStatus::Completed => {
                    summary.rewarded += 1;
                    summary.completed_total = summary.completed_total.saturating_add(event.amount);
                }
                RewardStatus::Reversed => {
                    summary.reversed_total = summary.reversed_total.saturating_add(event.amount);
                }
            }
        }

        Ok(summary)
    }

    pub async fn ledger_for(&self, inviter_id: UserId) -> RewardResult<Vec<RewardEvent>> {
        Ok(self.store.find_by_inviter(inviter_id).await?)
    }

    async fn require_user(&self, id: UserId) -> RewardResult<User> {
        self.store
            .get_user(id)
            .await?
            .ok_or(RewardError::UserNotFound(id))
    }

    async fn lock(&self, key: LockKey) -> RewardResult<KeyedGuard<LockKey>> {
        self.locks
            .acquire(key.clone())
            .await
            .map_err(|timeout| RewardError::LockTimeout {
                key: key.to_string(),
                waited: timeout.waited,
            })
    }

    async fn send(&self, notification: Notification) {
        if !self.config.notifications_enabled {
            return;
        }
        let (user, kind) = (notification.user, notification.kind);
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(user = %user, kind = ?kind, error = %e, "Notification failed; settlement unaffected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use crate::storage::{MemoryStore, UserDirectory};

    async fn engine_with(users: Vec<User>) -> (Arc<MemoryStore>, ReferralRewardEngine) {
        let store = Arc::new(MemoryStore::with_users(users).await);
        let engine = ReferralRewardEngine::new(
            store.clone(),
            Arc::new(NoopNotifier),
            RewardsConfig::default(),
        );
        (store, engine)
    }

    #[tokio::test]
    async fn test_unreferred_invitee() {
        let (_, engine) = engine_with(vec![User::new(UserId::new(1), Level::new(2))]).await;
        let outcome = engine.evaluate_and_settle(UserId::new(1)).await.unwrap();
        assert_eq!(outcome, SettlementOutcome::NotReferred(UserId::new(1)));
    }

    #[tokio::test]
    async fn test_missing_invitee() {
        let (_, engine) = engine_with(vec![]).await;
        let err = engine.evaluate_and_settle(UserId::new(9)).await.unwrap_err();
        assert_eq!(err, RewardError::UserNotFound(UserId::new(9)));
    }

    #[tokio::test]
    async fn test_level_zero_invitee_not_eligible() {
        let (store, engine) = engine_with(vec![
            User::new(UserId::new(1), Level::new(1)),
            User::new(UserId::new(2), Level::TEMPORARY).invited_by(UserId::new(1)),
        ])
        .await;

        let outcome = engine.evaluate_and_settle(UserId::new(2)).await.unwrap();
        assert_eq!(outcome.kind(), Some(ErrorKind::NotEligible));
        assert_eq!(store.list_user_ids().await.unwrap().len(), 2);
        assert!(engine.ledger_for(UserId::new(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_rules() {
        let (_, engine) = engine_with(vec![
            User::new(UserId::new(1), Level::new(1)),
            User::new(UserId::new(2), Level::TEMPORARY),
            User::new(UserId::new(3), Level::TEMPORARY),
        ])
        .await;

        assert_eq!(
            engine.link_referral(UserId::new(1), UserId::new(1)).await,
            Err(RewardError::SelfReferral(UserId::new(1)))
        );

        engine
            .link_referral(UserId::new(2), UserId::new(1))
            .await
            .unwrap();
        assert_eq!(
            engine.link_referral(UserId::new(2), UserId::new(3)).await,
            Err(RewardError::AlreadyLinked {
                invitee: UserId::new(2),
                inviter: UserId::new(1)
            })
        );
        assert_eq!(
            engine.link_referral(UserId::new(1), UserId::new(2)).await,
            Err(RewardError::ReferralCycle {
                invitee: UserId::new(1),
                inviter: UserId::new(2)
            })
        );
    }

    #[tokio::test]
    async fn test_reversal_requires_audit_details() {
        let (_, engine) = engine_with(vec![]).await;
        let id = RewardEventId::for_pair(UserId::new(1), UserId::new(2));
        assert_eq!(
            engine.reverse_reward(id, " ", "fraud").await,
            Err(RewardError::MissingAuditDetail("actor"))
        );
        assert_eq!(
            engine.reverse_reward(id, "ops", "").await,
            Err(RewardError::MissingAuditDetail("reason"))
        );
        assert_eq!(
            engine.reverse_reward(id, "ops", "fraud").await,
            Err(RewardError::EventNotFound(id))
        );
    }
}
