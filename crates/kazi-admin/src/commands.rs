//! Subcommand handlers. Each one opens the store, runs a single engine
//! operation and returns the result as JSON for stdout.

use crate::config::AdminConfig;
use anyhow::{Context, Result};
use kazi_rewards::{
    NoopNotifier, NotificationService, Reconciler, ReferralRewardEngine, SqliteStore,
    TracingNotifier,
};
use kazi_types::{InvitationCode, RewardEventId, User, UserId};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct Admin {
    store: Arc<SqliteStore>,
    engine: Arc<ReferralRewardEngine>,
}

impl Admin {
    pub fn open(config: &AdminConfig) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::open(&config.database_path, config.rewards.store_busy_timeout())
                .with_context(|| {
                    format!("Failed to open database: {}", config.database_path.display())
                })?,
        );
        let notifier: Arc<dyn NotificationService> = if config.rewards.notifications_enabled {
            Arc::new(TracingNotifier)
        } else {
            Arc::new(NoopNotifier)
        };
        let engine = Arc::new(ReferralRewardEngine::new(
            store.clone(),
            notifier,
            config.rewards.clone(),
        ));
        Ok(Self { store, engine })
    }

    pub async fn settle(&self, invitee: UserId) -> Result<Value> {
        to_json(&self.engine.evaluate_and_settle(invitee).await?)
    }

    pub async fn upgrade(&self, user: UserId) -> Result<Value> {
        to_json(&self.engine.settle_pending_rewards_on_upgrade(user).await?)
    }

    pub async fn link(
        &self,
        invitee: UserId,
        inviter: Option<UserId>,
        code: Option<&str>,
    ) -> Result<Value> {
        let inviter = match (inviter, code) {
            (Some(inviter), _) => {
                self.engine.link_referral(invitee, inviter).await?;
                inviter
            }
            (None, Some(code)) => {
                let code = InvitationCode::parse(code)?;
                self.engine.link_referral_by_code(invitee, &code).await?
            }
            (None, None) => anyhow::bail!("Either --inviter or --code is required"),
        };
        Ok(json!({ "invitee": invitee, "inviter": inviter }))
    }

    pub async fn reverse(&self, event: &str, actor: &str, reason: &str, force: bool) -> Result<Value> {
        let event = RewardEventId::from_hex(event)?;
        let record = if force {
            self.engine.force_reverse_reward(event, actor, reason).await?
        } else {
            self.engine.reverse_reward(event, actor, reason).await?
        };
        to_json(&record)
    }

    pub async fn reconcile(&self, repair: bool) -> Result<Value> {
        let reconciler = Reconciler::new(self.engine.clone());
        let report = reconciler.scan().await?;
        if !repair {
            return to_json(&report);
        }
        let summary = reconciler.repair(&report).await;
        Ok(json!({ "report": report, "repair": summary }))
    }

    pub async fn ledger(&self, inviter: UserId) -> Result<Value> {
        to_json(&self.engine.ledger_for(inviter).await?)
    }

    pub async fn summary(&self, inviter: UserId) -> Result<Value> {
        to_json(&self.engine.referral_summary(inviter).await?)
    }

    /// Loads users from a JSON array of user records.
    pub async fn import_users(&self, path: &Path) -> Result<Value> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read users file: {}", path.display()))?;
        let users: Vec<User> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse users file: {}", path.display()))?;
        for user in &users {
            self.store.upsert_user(user).await?;
        }
        info!(count = users.len(), path = %path.display(), "📥 Users imported");
        Ok(json!({ "imported": users.len() }))
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
