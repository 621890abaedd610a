//! End-to-end behaviour of the assembled service graph on the in-memory backend.

use chrono::{DateTime, Duration, Utc};
use credit_ledger::{LeaderboardOrdering, LeaderboardQuery, StaticEntitlements};
use credit_service::adapters::{InMemoryDirectory, PredicateEligibility, RecordingNotifier};
use credit_service::{
    AllocationRequest, BulkRatingItem, Collaborators, CreditConfig, CreditServices,
};
use credit_storage::memory::InMemoryLedgerStore;
use credit_storage::{AuditFilter, InMemoryArchiveStore, LedgerStore};
use credit_types::{
    AllocationKind, ChangeReason, CreditBasis, CreditError, GroupId, GroupPredicate, IdentityId,
    ManualClock, Matter, ScopeInfo, ScopeKind, TargetInfo, TargetKind,
};
use std::sync::Arc;

struct Harness {
    services: CreditServices,
    store: Arc<InMemoryLedgerStore>,
    archive: Arc<InMemoryArchiveStore>,
    directory: Arc<InMemoryDirectory>,
    eligibility: Arc<PredicateEligibility>,
    entitlements: Arc<StaticEntitlements>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<ManualClock>,
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-06-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryLedgerStore::new());
    let archive = Arc::new(InMemoryArchiveStore::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let eligibility = Arc::new(PredicateEligibility::new());
    let entitlements = Arc::new(StaticEntitlements::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let collaborators = Collaborators {
        store: store.clone(),
        archive: archive.clone(),
        entitlements: entitlements.clone(),
        eligibility: eligibility.clone(),
        directory: directory.clone(),
        notifier: notifier.clone(),
        clock: clock.clone(),
    };
    let services = CreditServices::assemble(collaborators, &CreditConfig::default());
    Harness {
        services,
        store,
        archive,
        directory,
        eligibility,
        entitlements,
        notifier,
        clock,
    }
}

impl Harness {
    fn grant(&self, identity: &str, value: i64) {
        self.entitlements
            .set(identity, CreditBasis::TdhPlusXtdh, value);
    }

    async fn scope(&self, scope: ScopeInfo) {
        self.directory.upsert_scope(scope).await;
    }

    async fn target(&self, id: &str, scope: &str, owner: &str, kind: TargetKind) {
        self.directory
            .upsert_target(TargetInfo {
                id: id.into(),
                scope_id: scope.into(),
                owner: owner.into(),
                kind,
                created_at: t0(),
            })
            .await;
    }

    /// Rank scope `wave-1` with participatory drops `drop-1..=drop-3` owned by carol.
    async fn voting_wave(&self) {
        self.scope(ScopeInfo::open("wave-1".into(), ScopeKind::Rank))
            .await;
        for id in ["drop-1", "drop-2", "drop-3"] {
            self.target(id, "wave-1", "carol", TargetKind::Participatory)
                .await;
        }
    }

    async fn vote(&self, voter: &str, target: &str, value: i64) -> Result<i64, CreditError> {
        self.services
            .votes
            .vote(&AllocationRequest::new(voter, target, value))
            .await
            .map(|o| o.new_value)
    }

    async fn rate_rep(&self, rater: &str, target: &str, value: i64) -> Result<i64, CreditError> {
        self.services
            .rates
            .rate(&rater.into(), &target.into(), Matter::Rep, "Art", value)
            .await
            .map(|o| o.new_value)
    }

    async fn audit_for(&self, actor: &str) -> Vec<credit_storage::AuditRecord> {
        self.store
            .list_audit(AuditFilter {
                actor: Some(actor.into()),
                ..Default::default()
            })
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn scenario_a_rating_beyond_entitlement_is_rejected() {
    let h = harness();
    h.grant("alice", 10);
    h.rate_rep("alice", "bob", -6).await.unwrap();
    h.rate_rep("alice", "dave", 2).await.unwrap();

    let err = h.rate_rep("alice", "bob", 10).await.unwrap_err();
    assert_eq!(
        err,
        CreditError::InsufficientCredit {
            needed: 4,
            available: 2
        }
    );
    assert_eq!(
        err.to_string(),
        "insufficient credit: would spend 4, only 2 left"
    );
    assert_eq!(h.audit_for("alice").await.len(), 2);
}

#[tokio::test]
async fn scenario_b_rating_within_entitlement_is_applied_and_audited() {
    let h = harness();
    h.grant("alice", 12);
    h.rate_rep("alice", "bob", -6).await.unwrap();
    h.rate_rep("alice", "dave", 2).await.unwrap();

    assert_eq!(h.rate_rep("alice", "bob", 10).await.unwrap(), 10);
    assert_eq!(
        h.services
            .ratings
            .credit_left(&"alice".into(), Matter::Rep)
            .await
            .unwrap(),
        0
    );
    let latest = &h.audit_for("alice").await[0];
    assert_eq!(latest.old_value, -6);
    assert_eq!(latest.new_value, 10);
    assert_eq!(latest.reason, ChangeReason::UserEdit);
    assert_eq!(latest.payload["category"], "Art");
}

#[tokio::test]
async fn scenario_c_reconciler_scales_ratings_to_new_entitlement() {
    let h = harness();
    h.grant("alice", 20);
    h.rate_rep("alice", "bob", -10).await.unwrap();
    h.rate_rep("alice", "dave", 10).await.unwrap();
    h.grant("alice", 8);

    let report = h.services.reconciler.reconcile().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.magnitude_removed, 12);
    assert_eq!(report.archives.len(), 1);
    assert_eq!(h.archive.len().await, 1);

    let bob = h
        .services
        .ratings
        .aggregated_rating(&"bob".into(), Matter::Rep, "Art")
        .await
        .unwrap();
    let dave = h
        .services
        .ratings
        .aggregated_rating(&"dave".into(), Matter::Rep, "Art")
        .await
        .unwrap();
    assert_eq!(bob.rating, -4);
    assert_eq!(dave.rating, 4);
    assert!(h.audit_for("alice").await[..2]
        .iter()
        .all(|e| e.reason == ChangeReason::LostCredit));

    let again = h.services.reconciler.reconcile().await.unwrap();
    assert_eq!(again.pairs_reduced, 0);
    assert_eq!(h.archive.len().await, 1);
}

#[tokio::test]
async fn scenario_d_rolling_window_spend_ages_out() {
    let h = harness();
    h.grant("alice", 5);
    h.scope(ScopeInfo::open("chat-wave".into(), ScopeKind::Chat))
        .await;
    h.target("msg-1", "chat-wave", "carol", TargetKind::Chat).await;
    h.target("msg-2", "chat-wave", "carol", TargetKind::Chat).await;
    let clap = |target: &str, value| AllocationRequest::new("alice", target, value);

    h.services.claps.clap(&clap("msg-1", 5)).await.unwrap();
    let err = h.services.claps.clap(&clap("msg-2", 1)).await.unwrap_err();
    assert!(matches!(err, CreditError::InsufficientCredit { .. }));

    h.clock.advance(Duration::days(31));
    assert_eq!(
        h.services
            .claps
            .credit_left(&"alice".into())
            .await
            .unwrap(),
        5
    );
    let outcome = h.services.claps.clap(&clap("msg-2", 5)).await.unwrap();
    assert!(outcome.applied);
    assert_eq!(outcome.credit_spent, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_e_concurrent_votes_serialize_on_the_voter() {
    for _ in 0..20 {
        let h = Arc::new(harness());
        h.grant("alice", 10);
        h.voting_wave().await;

        let first = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.vote("alice", "drop-1", 6).await })
        };
        let second = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.vote("alice", "drop-2", 6).await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let rejected = results.iter().find_map(|r| r.clone().err()).unwrap();
        assert_eq!(
            rejected,
            CreditError::InsufficientCredit {
                needed: 6,
                available: 4
            }
        );
        assert_eq!(
            h.services
                .votes
                .credit_left(&"alice".into(), &"wave-1".into())
                .await
                .unwrap(),
            4
        );
    }
}

#[tokio::test]
async fn vote_updates_aggregate_snapshots_and_notifies_owner() {
    let h = harness();
    h.grant("alice", 10);
    h.voting_wave().await;

    assert_eq!(h.vote("alice", "drop-1", 7).await.unwrap(), 7);
    assert_eq!(h.vote("alice", "drop-1", -3).await.unwrap(), -3);

    assert_eq!(
        h.store
            .allocation_sum(AllocationKind::Vote, &"drop-1".into())
            .await,
        -3
    );
    let history = h
        .store
        .target_snapshots(AllocationKind::Vote, &"drop-1".into(), None)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(h.store.voter_snapshots().await.len(), 2);

    let notices = h.notifier.notices().await;
    assert_eq!(notices.len(), 2);
    assert_eq!(notices[1].target_owner, IdentityId::from("carol"));
    assert_eq!(notices[1].value, -3);
}

#[tokio::test]
async fn notices_are_scoped_to_the_visibility_group() {
    let h = harness();
    h.grant("alice", 10);
    h.eligibility
        .define_group("curators", GroupPredicate::Everyone)
        .await;
    h.eligibility
        .define_group("chatters", GroupPredicate::Everyone)
        .await;
    let scope = |id: &str, kind| ScopeInfo {
        voting_group: Some("curators".into()),
        chat_group: Some("chatters".into()),
        visibility_group: Some("members".into()),
        ..ScopeInfo::open(id.into(), kind)
    };
    h.scope(scope("wave-1", ScopeKind::Rank)).await;
    h.scope(scope("chat-wave", ScopeKind::Chat)).await;
    h.target("drop-1", "wave-1", "carol", TargetKind::Participatory)
        .await;
    h.target("msg-1", "chat-wave", "carol", TargetKind::Chat).await;

    h.vote("alice", "drop-1", 2).await.unwrap();
    h.services
        .claps
        .clap(&AllocationRequest::new("alice", "msg-1", 1))
        .await
        .unwrap();

    let groups: Vec<Option<GroupId>> = h
        .notifier
        .notices()
        .await
        .into_iter()
        .map(|n| n.visibility_group)
        .collect();
    assert_eq!(groups, vec![Some("members".into()); 2]);
}

#[tokio::test]
async fn repeated_vote_is_a_no_op() {
    let h = harness();
    h.grant("alice", 10);
    h.voting_wave().await;

    h.vote("alice", "drop-1", 4).await.unwrap();
    let again = h
        .services
        .votes
        .vote(&AllocationRequest::new("alice", "drop-1", 4))
        .await
        .unwrap();
    assert!(!again.applied);
    assert_eq!(h.audit_for("alice").await.len(), 1);
    assert_eq!(h.store.spend_rows().await.len(), 1);
    assert_eq!(h.notifier.notices().await.len(), 1);
}

#[tokio::test]
async fn failed_notification_does_not_fail_the_vote() {
    let h = harness();
    h.grant("alice", 10);
    h.voting_wave().await;
    h.notifier.set_failing(true).await;

    assert_eq!(h.vote("alice", "drop-1", 4).await.unwrap(), 4);
    assert_eq!(
        h.store
            .allocation_sum(AllocationKind::Vote, &"drop-1".into())
            .await,
        4
    );
}

#[tokio::test]
async fn vote_preconditions_fail_in_order() {
    let h = harness();
    h.grant("alice", 10);
    h.grant("carol", 10);
    h.voting_wave().await;
    h.target("msg-1", "wave-1", "carol", TargetKind::Chat).await;

    // missing target
    assert!(matches!(
        h.vote("alice", "nope", 1).await,
        Err(CreditError::NotFound(_))
    ));
    // wrong target kind
    assert!(matches!(
        h.vote("alice", "msg-1", 1).await,
        Err(CreditError::Forbidden(_))
    ));

    // decided beats a closed window
    h.scope(ScopeInfo {
        decision_time: Some(t0() - Duration::hours(1)),
        voting_ends_at: Some(t0() - Duration::hours(2)),
        ..ScopeInfo::open("wave-1".into(), ScopeKind::Rank)
    })
    .await;
    assert!(matches!(
        h.vote("alice", "drop-1", 1).await,
        Err(CreditError::Locked(_))
    ));

    // closed window
    h.scope(ScopeInfo {
        voting_starts_at: Some(t0() + Duration::hours(1)),
        ..ScopeInfo::open("wave-1".into(), ScopeKind::Rank)
    })
    .await;
    assert!(matches!(
        h.vote("alice", "drop-1", 1).await,
        Err(CreditError::Forbidden(_))
    ));

    // not in the voting group
    h.eligibility
        .define_group(
            "curators",
            GroupPredicate::Member {
                identity: "dave".into(),
            },
        )
        .await;
    h.scope(ScopeInfo {
        voting_group: Some("curators".into()),
        ..ScopeInfo::open("wave-1".into(), ScopeKind::Rank)
    })
    .await;
    assert!(matches!(
        h.vote("alice", "drop-1", 1).await,
        Err(CreditError::Forbidden(_))
    ));

    // chat scopes take no votes
    h.scope(ScopeInfo::open("wave-1".into(), ScopeKind::Chat))
        .await;
    assert!(matches!(
        h.vote("alice", "drop-1", 1).await,
        Err(CreditError::Forbidden(_))
    ));

    // negative ban
    h.scope(ScopeInfo {
        forbid_negative: true,
        forbid_self_allocation: true,
        ..ScopeInfo::open("wave-1".into(), ScopeKind::Approve)
    })
    .await;
    assert!(matches!(
        h.vote("alice", "drop-1", -1).await,
        Err(CreditError::Forbidden(_))
    ));
    assert_eq!(h.vote("alice", "drop-1", 1).await.unwrap(), 1);

    // self-allocation ban
    assert!(matches!(
        h.vote("carol", "drop-1", 1).await,
        Err(CreditError::Forbidden(_))
    ));
}

#[tokio::test]
async fn owner_may_vote_without_self_ban_and_gets_no_notice() {
    let h = harness();
    h.grant("carol", 10);
    h.voting_wave().await;

    assert_eq!(h.vote("carol", "drop-1", 2).await.unwrap(), 2);
    assert!(h.notifier.notices().await.is_empty());
}

#[tokio::test]
async fn clap_preconditions() {
    let h = harness();
    h.grant("alice", 10);
    h.scope(ScopeInfo {
        chat_enabled: false,
        ..ScopeInfo::open("chat-wave".into(), ScopeKind::Chat)
    })
    .await;
    h.target("msg-1", "chat-wave", "carol", TargetKind::Chat).await;
    h.target("drop-1", "chat-wave", "carol", TargetKind::Participatory)
        .await;

    let clap = |actor: &str, target: &str| AllocationRequest::new(actor, target, 1);
    assert!(matches!(
        h.services.claps.clap(&clap("alice", "drop-1")).await,
        Err(CreditError::Forbidden(_))
    ));
    assert!(matches!(
        h.services.claps.clap(&clap("alice", "msg-1")).await,
        Err(CreditError::Forbidden(_))
    ));

    h.scope(ScopeInfo::open("chat-wave".into(), ScopeKind::Chat))
        .await;
    assert!(matches!(
        h.services.claps.clap(&clap("carol", "msg-1")).await,
        Err(CreditError::Forbidden(_))
    ));
    assert!(h.services.claps.clap(&clap("alice", "msg-1")).await.is_ok());
}

#[tokio::test]
async fn expired_deadline_fails_before_any_write() {
    let h = harness();
    h.grant("alice", 10);
    h.voting_wave().await;

    let request = AllocationRequest::new("alice", "drop-1", 3).with_deadline(t0());
    assert!(matches!(
        h.services.votes.vote(&request).await,
        Err(CreditError::DeadlineExceeded(_))
    ));
    assert!(h.store.spend_rows().await.is_empty());
}

#[tokio::test]
async fn bulk_rating_is_all_or_nothing() {
    let h = harness();
    h.grant("alice", 10);
    let item = |target: &str, value| BulkRatingItem {
        target: target.into(),
        category: "Art".into(),
        value,
    };

    let err = h
        .services
        .rates
        .rate_bulk(
            &"alice".into(),
            Matter::Rep,
            &[item("bob", 6), item("dave", -5)],
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CreditError::InsufficientCredit {
            needed: 5,
            available: 4
        }
    );
    assert_eq!(
        h.services
            .ratings
            .credit_spent(&"alice".into(), Matter::Rep)
            .await
            .unwrap(),
        0
    );

    let outcomes = h
        .services
        .rates
        .rate_bulk(
            &"alice".into(),
            Matter::Rep,
            &[item("bob", 6), item("dave", -4)],
        )
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| o.applied));
    assert_eq!(h.audit_for("alice").await.len(), 2);
}

#[tokio::test]
async fn rating_rules_follow_the_matter() {
    let h = harness();
    h.grant("alice", 10);
    h.voting_wave().await;

    assert!(matches!(
        h.rate_rep("alice", "alice", 1).await,
        Err(CreditError::Forbidden(_))
    ));
    assert!(matches!(
        h.services
            .rates
            .rate(&"alice".into(), &"bob".into(), Matter::Rep, "  ", 1)
            .await,
        Err(CreditError::Validation(_))
    ));
    assert!(matches!(
        h.services
            .rates
            .rate(&"carol".into(), &"drop-1".into(), Matter::DropRating, "general", 1)
            .await,
        Err(CreditError::Forbidden(_))
    ));
    assert!(matches!(
        h.services
            .rates
            .rate(&"alice".into(), &"nope".into(), Matter::DropRating, "general", 1)
            .await,
        Err(CreditError::NotFound(_))
    ));
    assert!(h
        .services
        .rates
        .rate(&"alice".into(), &"drop-1".into(), Matter::DropRating, "general", 3)
        .await
        .is_ok());
}

#[tokio::test]
async fn leaderboard_orderings_across_the_lifecycle() {
    let h = harness();
    for voter in ["alice", "bob"] {
        h.grant(voter, 50);
    }
    h.scope(ScopeInfo {
        decision_time: Some(t0() + Duration::hours(1)),
        ..ScopeInfo::open("wave-1".into(), ScopeKind::Rank)
    })
    .await;
    for id in ["drop-1", "drop-2", "drop-3"] {
        h.target(id, "wave-1", "carol", TargetKind::Participatory)
            .await;
    }

    h.vote("alice", "drop-2", 10).await.unwrap();
    h.clock.advance(Duration::minutes(1));
    h.vote("bob", "drop-1", 10).await.unwrap();
    h.vote("alice", "drop-3", -2).await.unwrap();

    let rank = h
        .services
        .leaderboard
        .read(&LeaderboardQuery::new("wave-1", LeaderboardOrdering::Rank))
        .await
        .unwrap();
    let order: Vec<&str> = rank.iter().map(|e| e.target.as_str()).collect();
    assert_eq!(order, vec!["drop-2", "drop-1", "drop-3"]);
    assert_eq!(rank[1].rank, 1);

    let realtime = h
        .services
        .leaderboard
        .read(
            &LeaderboardQuery::new("wave-1", LeaderboardOrdering::Realtime)
                .with_subset(["drop-3".into(), "drop-1".into()]),
        )
        .await
        .unwrap();
    assert_eq!(realtime.len(), 2);
    assert_eq!(realtime[0].target.as_str(), "drop-1");

    h.clock.advance(Duration::hours(2));
    assert!(matches!(
        h.vote("bob", "drop-3", 1).await,
        Err(CreditError::Locked(_))
    ));
    assert_eq!(
        h.services.snapshotter.capture(&"wave-1".into()).await.unwrap(),
        3
    );
    assert_eq!(
        h.services.snapshotter.capture(&"wave-1".into()).await.unwrap(),
        0
    );

    h.scope(ScopeInfo {
        decision_time: Some(t0() + Duration::hours(1)),
        archived_at: Some(t0() + Duration::hours(2)),
        ..ScopeInfo::open("wave-1".into(), ScopeKind::Rank)
    })
    .await;
    assert!(matches!(
        h.services
            .leaderboard
            .read(&LeaderboardQuery::new("wave-1", LeaderboardOrdering::Rank))
            .await,
        Err(CreditError::Validation(_))
    ));
    let prediction = h
        .services
        .leaderboard
        .read(&LeaderboardQuery::new(
            "wave-1",
            LeaderboardOrdering::Prediction,
        ))
        .await
        .unwrap();
    let values: Vec<Option<i64>> = prediction.iter().map(|e| e.decision_value).collect();
    assert_eq!(values, vec![Some(10), Some(10), Some(-2)]);
}

#[tokio::test]
async fn time_locked_decision_uses_time_weighted_value() {
    let h = harness();
    h.grant("alice", 50);
    h.scope(ScopeInfo {
        decision_time: Some(t0() + Duration::hours(2)),
        time_lock_secs: Some(3600),
        ..ScopeInfo::open("wave-1".into(), ScopeKind::Rank)
    })
    .await;
    h.target("drop-1", "wave-1", "carol", TargetKind::Participatory)
        .await;

    h.vote("alice", "drop-1", 10).await.unwrap();
    h.clock.advance(Duration::minutes(90));
    h.vote("alice", "drop-1", 20).await.unwrap();
    h.clock.advance(Duration::hours(1));

    assert_eq!(h.services.snapshotter.capture_due().await.unwrap(), 1);
    let trend = h
        .services
        .leaderboard
        .read(&LeaderboardQuery::new("wave-1", LeaderboardOrdering::Trend))
        .await
        .unwrap();
    assert_eq!(trend[0].decision_value, Some(15));
    assert_eq!(trend[0].score, -5);
}

#[tokio::test]
async fn deleting_a_target_cascades() {
    let h = harness();
    h.grant("alice", 10);
    h.voting_wave().await;
    h.vote("alice", "drop-1", 6).await.unwrap();

    let deleted = h
        .services
        .allocations
        .delete_target(h.store.as_ref(), AllocationKind::Vote, &"drop-1".into())
        .await
        .unwrap();
    assert_eq!(deleted.allocations, 1);
    assert_eq!(deleted.aggregates, 1);
    assert!(h.store.spend_rows().await.is_empty());
    assert_eq!(
        h.services
            .votes
            .credit_left(&"alice".into(), &"wave-1".into())
            .await
            .unwrap(),
        10
    );
}

#[tokio::test]
async fn vote_allocations_shrink_with_entitlement() {
    let h = harness();
    h.grant("alice", 20);
    h.voting_wave().await;
    h.vote("alice", "drop-1", 15).await.unwrap();
    h.vote("alice", "drop-2", 5).await.unwrap();
    h.grant("alice", 10);

    let report = h.services.reconciler.reconcile().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(
        h.store
            .allocation_sum(AllocationKind::Vote, &"drop-1".into())
            .await,
        7
    );
    assert!(
        h.services
            .votes
            .credit_left(&"alice".into(), &"wave-1".into())
            .await
            .unwrap()
            >= 0
    );
    assert!(h
        .audit_for("alice")
        .await
        .iter()
        .any(|e| e.reason == ChangeReason::LostCredit && e.event_type == "vote_edit"));
}
