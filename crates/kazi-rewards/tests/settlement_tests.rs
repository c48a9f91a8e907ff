use kazi_rewards::{
    BroadcastNotifier, ErrorKind, MemoryStore, NotificationKind, ReferralRewardEngine,
    RewardError, RewardLedger, RewardsConfig, SettlementOutcome, UserDirectory,
};
use kazi_types::{Amount, InvitationCode, Level, RewardStatus, User, UserId};
use std::sync::Arc;

const INVITER: UserId = UserId::new(100);
const INVITEE: UserId = UserId::new(200);

async fn setup(
    inviter_level: u8,
    invitee_level: u8,
) -> (Arc<MemoryStore>, Arc<ReferralRewardEngine>) {
    let store = Arc::new(
        MemoryStore::with_users([
            User::new(INVITER, Level::new(inviter_level)),
            User::new(INVITEE, Level::new(invitee_level)).invited_by(INVITER),
        ])
        .await,
    );
    let engine = Arc::new(ReferralRewardEngine::new(
        store.clone(),
        Arc::new(kazi_rewards::NoopNotifier),
        RewardsConfig::default(),
    ));
    (store, engine)
}

async fn balance(store: &MemoryStore, user: UserId) -> Amount {
    store.get_user(user).await.unwrap().unwrap().wallet_balance
}

#[tokio::test]
async fn test_temporary_inviter_reward_is_deferred_then_released() {
    println!("\n=== Deferred reward for a level-0 inviter ===");
    let (store, engine) = setup(0, 1).await;

    let outcome = engine.evaluate_and_settle(INVITEE).await.unwrap();
    let event = match outcome {
        SettlementOutcome::Deferred(event) => event,
        other => panic!("expected deferred reward, got {:?}", other),
    };
    assert_eq!(event.status, RewardStatus::Pending);
    assert_eq!(event.amount, Amount::from_major(288));
    assert!(event.processed_at.is_none());
    assert_eq!(balance(&store, INVITER).await, Amount::ZERO);
    println!("✓ Pending KES 288 recorded, wallet untouched");

    let previous = store.set_level(INVITER, Level::new(1)).await.unwrap();
    let changed = engine
        .on_level_change(INVITER, previous, Level::new(1))
        .await
        .unwrap();
    let released = changed.pending_settled.unwrap();
    assert_eq!(released.settled.len(), 1);
    assert_eq!(released.credited, Amount::from_major(288));
    assert_eq!(balance(&store, INVITER).await, Amount::from_major(288));

    let stored = store.find_by_pair(INVITER, INVITEE).await.unwrap().unwrap();
    assert_eq!(stored.status, RewardStatus::Completed);
    assert!(stored.processed_at.is_some());
    println!("✓ Upgrade released the reward");

    // Running the sweep again finds nothing left to pay.
    let again = engine
        .settle_pending_rewards_on_upgrade(INVITER)
        .await
        .unwrap();
    assert!(again.settled.is_empty());
    assert_eq!(balance(&store, INVITER).await, Amount::from_major(288));
}

#[tokio::test]
async fn test_upgraded_inviter_is_credited_immediately() {
    println!("\n=== Immediate credit for an upgraded inviter ===");
    let (store, engine) = setup(2, 3).await;

    let outcome = engine.evaluate_and_settle(INVITEE).await.unwrap();
    let event = match outcome {
        SettlementOutcome::Completed(event) => event,
        other => panic!("expected completed reward, got {:?}", other),
    };
    assert_eq!(event.amount, Amount::from_major(1200));
    assert_eq!(event.invitee_level_at_trigger, Level::new(3));
    assert_eq!(balance(&store, INVITER).await, Amount::from_major(1200));
    println!("✓ KES 1200 credited for a level-3 invitee");
}

#[tokio::test]
async fn test_repeat_evaluation_reports_already_settled() {
    let (store, engine) = setup(1, 1).await;

    assert!(engine.evaluate_and_settle(INVITEE).await.unwrap().is_new());
    let second = engine.evaluate_and_settle(INVITEE).await.unwrap();
    assert_eq!(second.kind(), Some(ErrorKind::AlreadySettled));
    assert_eq!(balance(&store, INVITER).await, Amount::from_major(288));
    assert_eq!(engine.ledger_for(INVITER).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_later_upgrade_of_invitee_does_not_pay_twice() {
    let (store, engine) = setup(1, 1).await;
    engine.evaluate_and_settle(INVITEE).await.unwrap();

    let previous = store.set_level(INVITEE, Level::new(4)).await.unwrap();
    let changed = engine
        .on_level_change(INVITEE, previous, Level::new(4))
        .await
        .unwrap();
    assert!(matches!(
        changed.as_invitee,
        Some(SettlementOutcome::AlreadySettled(_))
    ));
    assert_eq!(balance(&store, INVITER).await, Amount::from_major(288));
}

#[tokio::test]
async fn test_broken_link_is_an_error() {
    let (store, engine) = setup(1, 2).await;
    store.remove_user(INVITER).await;

    let err = engine.evaluate_and_settle(INVITEE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokenReferralLink);
    assert!(store.list_events().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reversal_blocked_when_balance_too_low() {
    println!("\n=== Reversal underflow protection ===");
    let (store, engine) = setup(1, 1).await;
    let event = engine
        .evaluate_and_settle(INVITEE)
        .await
        .unwrap()
        .event()
        .cloned()
        .unwrap();

    // Inviter withdrew most of the bonus.
    store
        .set_wallet_balance(INVITER, Amount::from_major(50))
        .await
        .unwrap();

    let err = engine
        .reverse_reward(event.id, "ops@kazi", "duplicate account")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RewardError::ReversalWouldUnderflow {
            event: event.id,
            inviter: INVITER,
            balance: Amount::from_major(50),
            amount: Amount::from_major(288),
        }
    );
    assert_eq!(balance(&store, INVITER).await, Amount::from_major(50));
    let stored = store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RewardStatus::Completed);
    assert!(store.list_reversals().await.unwrap().is_empty());
    println!("✓ Blocked without mutation");

    let record = engine
        .force_reverse_reward(event.id, "ops@kazi", "duplicate account, reviewed")
        .await
        .unwrap();
    assert!(record.is_anomalous());
    assert_eq!(record.debited, Amount::from_major(50));
    assert_eq!(record.shortfall, Amount::from_major(238));
    assert_eq!(balance(&store, INVITER).await, Amount::ZERO);
    println!("✓ Forced reversal floored at zero with shortfall recorded");
}

#[tokio::test]
async fn test_reversal_tombstone_blocks_resettlement() {
    let (store, engine) = setup(2, 2).await;
    let event = engine
        .evaluate_and_settle(INVITEE)
        .await
        .unwrap()
        .event()
        .cloned()
        .unwrap();

    let record = engine
        .reverse_reward(event.id, "ops@kazi", "fraudulent signup")
        .await
        .unwrap();
    assert_eq!(record.debited, Amount::from_major(600));
    assert!(!record.is_anomalous());
    assert_eq!(balance(&store, INVITER).await, Amount::ZERO);

    let again = engine.evaluate_and_settle(INVITEE).await.unwrap();
    match again {
        SettlementOutcome::AlreadySettled(e) => assert_eq!(e.status, RewardStatus::Reversed),
        other => panic!("expected tombstone, got {:?}", other),
    }
    assert_eq!(balance(&store, INVITER).await, Amount::ZERO);

    // Reversed events cannot be reversed again.
    assert!(matches!(
        engine.reverse_reward(event.id, "ops@kazi", "again").await,
        Err(RewardError::NotReversible { .. })
    ));
}

#[tokio::test]
async fn test_pending_reward_cannot_be_reversed() {
    let (_, engine) = setup(0, 1).await;
    let event = engine
        .evaluate_and_settle(INVITEE)
        .await
        .unwrap()
        .event()
        .cloned()
        .unwrap();

    let err = engine
        .reverse_reward(event.id, "ops@kazi", "fraud")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_link_by_code_then_settle() {
    let code = InvitationCode::parse("wanjiku7").unwrap();
    let store = Arc::new(
        MemoryStore::with_users([
            User::new(INVITER, Level::new(1)).with_code(code),
            User::new(INVITEE, Level::TEMPORARY),
        ])
        .await,
    );
    let engine = ReferralRewardEngine::new(
        store.clone(),
        Arc::new(kazi_rewards::NoopNotifier),
        RewardsConfig::default(),
    );

    let typed = InvitationCode::parse(" WANJIKU7 ").unwrap();
    assert_eq!(
        engine.link_referral_by_code(INVITEE, &typed).await.unwrap(),
        INVITER
    );
    assert!(matches!(
        engine
            .link_referral_by_code(INVITEE, &InvitationCode::parse("nobody1").unwrap())
            .await,
        Err(RewardError::UnknownInvitationCode(_))
    ));

    // Qualifying happens when the invitee leaves level 0.
    store.set_level(INVITEE, Level::new(2)).await.unwrap();
    let changed = engine
        .on_level_change(INVITEE, Level::TEMPORARY, Level::new(2))
        .await
        .unwrap();
    assert!(matches!(
        changed.as_invitee,
        Some(SettlementOutcome::Completed(_))
    ));
    assert_eq!(balance(&store, INVITER).await, Amount::from_major(600));
}

#[tokio::test]
async fn test_notifications_follow_settlement() {
    let store = Arc::new(
        MemoryStore::with_users([
            User::new(INVITER, Level::TEMPORARY),
            User::new(INVITEE, Level::new(1)).invited_by(INVITER),
        ])
        .await,
    );
    let notifier = Arc::new(BroadcastNotifier::new());
    let mut rx = notifier.subscribe();
    let engine =
        ReferralRewardEngine::new(store.clone(), notifier.clone(), RewardsConfig::default());

    engine.evaluate_and_settle(INVITEE).await.unwrap();
    let deferred = rx.recv().await.unwrap();
    assert_eq!(deferred.kind, NotificationKind::RewardDeferred);
    assert_eq!(deferred.user, INVITER);

    store.set_level(INVITER, Level::new(1)).await.unwrap();
    engine
        .settle_pending_rewards_on_upgrade(INVITER)
        .await
        .unwrap();
    let credited = rx.recv().await.unwrap();
    assert_eq!(credited.kind, NotificationKind::RewardCredited);
    assert_eq!(credited.amount, Amount::from_major(288));
}

#[tokio::test]
async fn test_notification_failure_does_not_undo_settlement() {
    let (store, _) = setup(1, 1).await;
    // No subscribers: every send fails.
    let engine = ReferralRewardEngine::new(
        store.clone(),
        Arc::new(BroadcastNotifier::new()),
        RewardsConfig::default(),
    );

    let outcome = engine.evaluate_and_settle(INVITEE).await.unwrap();
    assert!(matches!(outcome, SettlementOutcome::Completed(_)));
    assert_eq!(balance(&store, INVITER).await, Amount::from_major(288));
}

#[tokio::test]
async fn test_referral_summary() {
    let store = Arc::new(
        MemoryStore::with_users([
            User::new(INVITER, Level::TEMPORARY),
            User::new(UserId::new(1), Level::new(1)).invited_by(INVITER),
            User::new(UserId::new(2), Level::new(3)).invited_by(INVITER),
            User::new(UserId::new(3), Level::TEMPORARY).invited_by(INVITER),
        ])
        .await,
    );
    let engine = ReferralRewardEngine::new(
        store.clone(),
        Arc::new(kazi_rewards::NoopNotifier),
        RewardsConfig::default(),
    );
    for id in 1..=3 {
        engine.evaluate_and_settle(UserId::new(id)).await.unwrap();
    }

    let summary = engine.referral_summary(INVITER).await.unwrap();
    assert_eq!(summary.referrals, 3);
    assert_eq!(summary.rewarded, 0);
    assert_eq!(summary.pending_count, 2);
    assert_eq!(summary.pending_total, Amount::from_major(288 + 1200));
    assert_eq!(summary.completed_total, Amount::ZERO);
}
