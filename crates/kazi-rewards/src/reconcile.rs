//! Drift detection between the user directory and the reward ledger.
//!
//! `scan` is read-only. `repair` only replays the engine's own operations,
//! so it inherits their idempotency; anything needing judgement is left in
//! the report.

use crate::engine::{ReferralRewardEngine, SettlementOutcome};
use crate::error::RewardResult;
use kazi_types::{Amount, Level, RewardEvent, RewardEventId, RewardStatus, User, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "drift", rename_all = "snake_case")]
pub enum Drift {
    /// Linked invitee at a rewarded level with no ledger row.
    MissingReward {
        inviter: UserId,
        invitee: UserId,
        level: Level,
    },
    /// Pending reward whose inviter has already left level 0.
    StuckPending {
        event: RewardEventId,
        inviter: UserId,
        inviter_level: Level,
        amount: Amount,
    },
    OrphanedEvent {
        event: RewardEventId,
        reason: String,
    },
    /// Recorded amount differs from the current table. Informational.
    AmountDrift {
        event: RewardEventId,
        level: Level,
        recorded: Amount,
        configured: Option<Amount>,
    },
    /// `invited_by` points at a user that does not exist.
    BrokenLink { invitee: UserId, inviter: UserId },
}

impl Drift {
    pub fn is_repairable(&self) -> bool {
        matches!(self, Self::MissingReward { .. } | Self::StuckPending { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub users_scanned: usize,
    pub events_scanned: usize,
    pub drifts: Vec<Drift>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.drifts.is_empty()
    }

    pub fn repairable(&self) -> impl Iterator<Item = &Drift> {
        self.drifts.iter().filter(|d| d.is_repairable())
    }

    pub fn needs_review(&self) -> impl Iterator<Item = &Drift> {
        self.drifts.iter().filter(|d| !d.is_repairable())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSummary {
    pub rewards_completed: usize,
    pub rewards_deferred: usize,
    pub pending_released: usize,
    pub credited: Amount,
    pub left_for_review: usize,
    pub failures: Vec<String>,
}

pub struct Reconciler {
    engine: Arc<ReferralRewardEngine>,
}

impl Reconciler {
    pub fn new(engine: Arc<ReferralRewardEngine>) -> Self {
        Self { engine }
    }

    pub async fn scan(&self) -> RewardResult<ReconciliationReport> {
        let store = self.engine.store();
        let table = &self.engine.config().reward_table;

        let mut users: HashMap<UserId, User> = HashMap::new();
        for id in store.list_user_ids().await? {
            if let Some(user) = store.get_user(id).await? {
                users.insert(id, user);
            }
        }
        let events = store.list_events().await?;
        let by_pair: HashMap<(UserId, UserId), &RewardEvent> =
            events.iter().map(|e| (e.pair(), e)).collect();

        let mut report = ReconciliationReport {
            users_scanned: users.len(),
            events_scanned: events.len(),
            drifts: Vec::new(),
        };

        let mut invitees: Vec<&User> = users.values().collect();
        invitees.sort_by_key(|u| u.id);
        for invitee in invitees {
            let Some(inviter) = invitee.invited_by else {
                continue;
            };
            if !users.contains_key(&inviter) {
                report.drifts.push(Drift::BrokenLink {
                    invitee: invitee.id,
                    inviter,
                });
                continue;
            }
            if table.is_rewarded(invitee.level) && !by_pair.contains_key(&(inviter, invitee.id)) {
                report.drifts.push(Drift::MissingReward {
                    inviter,
                    invitee: invitee.id,
                    level: invitee.level,
                });
            }
        }

        for event in &events {
            let inviter = users.get(&event.inviter_id);
            let invitee = users.get(&event.invitee_id);

            let orphan_reason = match (inviter, invitee) {
                (None, _) => Some(format!("inviter {} no longer exists", event.inviter_id)),
                (_, None) => Some(format!("invitee {} no longer exists", event.invitee_id)),
                (_, Some(invitee)) if invitee.invited_by != Some(event.inviter_id) => Some(format!(
                    "invitee {} is linked to {:?}, not {}",
                    event.invitee_id, invitee.invited_by, event.inviter_id
                )),
                _ => None,
            };
            if let Some(reason) = orphan_reason {
                report.drifts.push(Drift::OrphanedEvent {
                    event: event.id,
                    reason,
                });
                continue;
            }

            if let Some(inviter) = inviter {
                if event.status == RewardStatus::Pending && !inviter.level.is_temporary() {
                    report.drifts.push(Drift::StuckPending {
                        event: event.id,
                        inviter: inviter.id,
                        inviter_level: inviter.level,
                        amount: event.amount,
                    });
                }
            }

            if event.status != RewardStatus::Reversed {
                let configured = table.reward_for(event.invitee_level_at_trigger);
                if configured != Some(event.amount) {
                    report.drifts.push(Drift::AmountDrift {
                        event: event.id,
                        level: event.invitee_level_at_trigger,
                        recorded: event.amount,
                        configured,
                    });
                }
            }
        }

        info!(
            users = report.users_scanned,
            events = report.events_scanned,
            drifts = report.drifts.len(),
            repairable = report.repairable().count(),
            "🔍 Reconciliation scan complete"
        );
        Ok(report)
    }

    /// Replays settlement for missing and stuck rewards. Failures are
    /// collected rather than aborting the run.
    pub async fn repair(&self, report: &ReconciliationReport) -> RepairSummary {
        let mut summary = RepairSummary {
            left_for_review: report.needs_review().count(),
            ..Default::default()
        };

        let mut stuck_inviters = BTreeSet::new();
        for drift in report.repairable() {
            match drift {
                Drift::MissingReward { invitee, .. } => {
                    match self.engine.evaluate_and_settle(*invitee).await {
                        Ok(SettlementOutcome::Completed(event)) => {
                            summary.rewards_completed += 1;
                            summary.credited = summary.credited.saturating_add(event.amount);
                        }
                        Ok(SettlementOutcome::Deferred(_)) => summary.rewards_deferred += 1,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(invitee = %invitee, error = %e, "❌ Missing reward repair failed");
                            summary.failures.push(format!("settle {}: {}", invitee, e));
                        }
                    }
                }
                Drift::StuckPending { inviter, .. } => {
                    stuck_inviters.insert(*inviter);
                }
                _ => {}
            }
        }

        for inviter in stuck_inviters {
            match self.engine.settle_pending_rewards_on_upgrade(inviter).await {
                Ok(settled) => {
                    summary.pending_released += settled.settled.len();
                    summary.credited = summary.credited.saturating_add(settled.credited);
                }
                Err(e) => {
                    warn!(inviter = %inviter, error = %e, "❌ Stuck pending repair failed");
                    summary.failures.push(format!("release {}: {}", inviter, e));
                }
            }
        }

        info!(
            completed = summary.rewards_completed,
            deferred = summary.rewards_deferred,
            released = summary.pending_released,
            credited = %summary.credited,
            left_for_review = summary.left_for_review,
            failures = summary.failures.len(),
            "🔧 Reconciliation repair finished"
        );
        summary
    }
}
