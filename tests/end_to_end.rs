//! Full report -> claim -> arbitrate -> award flow against the embedded store.

mod common;

use std::sync::Arc;

use bounty_board::store::BountyStore;
use bounty_board::{
    ActivePeriod, AwardRole, BountyBoard, BountyError, BountyFilter, BountyStatus, ChangeFeed,
    FsBlobStore, ManualClock, NewBounty, ProofUpload, SqliteStore, User,
};
use chrono::{TimeZone, Utc};
use common::HookedStore;
use uuid::Uuid;

const SESSION: &str = "RAID1-2026";

struct World {
    board: Arc<BountyBoard>,
    store: Arc<SqliteStore>,
    reporter: User,
    h1: User,
    h2: User,
    _proofs: tempfile::TempDir,
}

async fn world_with(store: Arc<dyn BountyStore>, sqlite: Arc<SqliteStore>) -> World {
    let proofs = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 20, 0, 0).unwrap());
    let board = Arc::new(BountyBoard::new(
        store,
        Arc::new(FsBlobStore::new(proofs.path(), "https://proofs.test")),
        ChangeFeed::new(),
        Arc::new(clock),
    ));

    let mut users = Vec::new();
    for name in ["reporter", "h1", "h2"] {
        users.push(
            board
                .register_user(&User::new(Uuid::new_v4(), name))
                .await
                .unwrap(),
        );
    }
    let h2 = users.pop().unwrap();
    let h1 = users.pop().unwrap();
    let reporter = users.pop().unwrap();

    World {
        board,
        store: sqlite,
        reporter,
        h1,
        h2,
        _proofs: proofs,
    }
}

async fn world() -> World {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    world_with(store.clone(), store).await
}

fn report() -> NewBounty {
    NewBounty {
        session_id: SESSION.to_string(),
        target_name: "Kraken".to_string(),
        last_location: "Spillway".to_string(),
        reward_offer: Some("ammo crate".to_string()),
        active_period: ActivePeriod::Day,
        ..Default::default()
    }
}

fn screenshot(name: &str) -> ProofUpload {
    ProofUpload {
        file_name: format!("{}.jpg", name),
        content_type: "image/jpeg".to_string(),
        bytes: name.as_bytes().to_vec(),
    }
}

async fn hunters(w: &World, n: usize) -> Vec<User> {
    let mut users = Vec::new();
    for i in 0..n {
        let user = User::new(Uuid::new_v4(), format!("hunter{}", i));
        users.push(w.board.register_user(&user).await.unwrap());
    }
    users
}

async fn reputation(w: &World, user: &User) -> i64 {
    w.board.load_user(user.id).await.unwrap().reputation
}

#[tokio::test]
async fn test_report_claim_approve_flow() {
    let w = world().await;

    let bounty = w.board.create_bounty(w.reporter.id, report(), None).await.unwrap();
    assert_eq!(bounty.status, BountyStatus::Active);

    // Both hunters act on the same snapshot of the open bounty.
    let c1 = w
        .board
        .submit_confirmation(&bounty, &w.h1, SESSION, screenshot("h1"))
        .await
        .unwrap();
    let c2 = w
        .board
        .submit_confirmation(&bounty, &w.h2, SESSION, screenshot("h2"))
        .await
        .unwrap();

    let claimed = w.board.get_bounty(bounty.id).await.unwrap();
    assert_eq!(claimed.status, BountyStatus::Claimed);
    assert_eq!(reputation(&w, &w.h1).await, 0);
    assert_eq!(w.board.list_confirmations(bounty.id).await.unwrap().len(), 2);

    let approval = w.board.approve(&claimed, &c1, &w.reporter).await.unwrap();
    assert_eq!(approval.bounty.status, BountyStatus::Confirmed);
    assert_eq!(approval.settlement.applied, vec![AwardRole::Hunter, AwardRole::Reporter]);
    assert_eq!(reputation(&w, &w.h1).await, 10);
    assert_eq!(reputation(&w, &w.reporter).await, 5);

    // Approving the sibling fails both on a fresh read and on the stale snapshot.
    let err = w
        .board
        .approve_by_id(bounty.id, c2.id, w.reporter.id)
        .await
        .unwrap_err();
    assert!(matches!(err, BountyError::InvalidTransition(_)));
    let err = w.board.approve(&claimed, &c2, &w.reporter).await.unwrap_err();
    assert!(matches!(err, BountyError::InvalidTransition(_)));

    assert_eq!(reputation(&w, &w.h2).await, 0);
    assert_eq!(reputation(&w, &w.reporter).await, 5);
    assert_eq!(
        w.board.get_bounty(bounty.id).await.unwrap().status,
        BountyStatus::Confirmed
    );

    // The moot sibling can still be cleared away without reopening the bounty.
    let status = w
        .board
        .reject_by_id(bounty.id, c2.id, w.reporter.id)
        .await
        .unwrap();
    assert_eq!(status, BountyStatus::Confirmed);
}

#[tokio::test]
async fn test_reapproval_awards_nothing_more() {
    let w = world().await;
    let bounty = w.board.create_bounty(w.reporter.id, report(), None).await.unwrap();
    let claim = w
        .board
        .submit_confirmation(&bounty, &w.h1, SESSION, screenshot("h1"))
        .await
        .unwrap();

    let approval = w
        .board
        .approve_by_id(bounty.id, claim.id, w.reporter.id)
        .await
        .unwrap();

    let err = w
        .board
        .approve(&approval.bounty, &approval.confirmation, &w.reporter)
        .await
        .unwrap_err();
    assert!(matches!(err, BountyError::InvalidTransition(_)));

    let settlement = w.board.settle_awards(claim.id).await.unwrap();
    assert!(settlement.applied.is_empty());
    assert_eq!(settlement.already_settled.len(), 2);
    assert_eq!(reputation(&w, &w.h1).await, 10);
    assert_eq!(reputation(&w, &w.reporter).await, 5);
}

#[tokio::test]
async fn test_reporter_cannot_claim_own_bounty() {
    let w = world().await;
    let bounty = w.board.create_bounty(w.reporter.id, report(), None).await.unwrap();

    let err = w
        .board
        .submit_confirmation(&bounty, &w.reporter, SESSION, screenshot("self"))
        .await
        .unwrap_err();
    assert!(matches!(err, BountyError::InvalidTransition(_)));
    assert!(w.board.list_confirmations(bounty.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_on_closed_bounty_is_refused_by_the_store() {
    let w = world().await;
    let bounty = w.board.create_bounty(w.reporter.id, report(), None).await.unwrap();
    let claim = w
        .board
        .submit_confirmation(&bounty, &w.h1, SESSION, screenshot("h1"))
        .await
        .unwrap();
    w.board
        .approve_by_id(bounty.id, claim.id, w.reporter.id)
        .await
        .unwrap();

    // H2 still holds the `active` snapshot from before the approval.
    let err = w
        .board
        .submit_confirmation(&bounty, &w.h2, SESSION, screenshot("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, BountyError::InvalidTransition(_)));
    assert_eq!(w.board.list_confirmations(bounty.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_listing_filters() {
    let w = world().await;
    let open = w.board.create_bounty(w.reporter.id, report(), None).await.unwrap();
    let taken = w.board.create_bounty(w.reporter.id, report(), None).await.unwrap();
    w.board
        .submit_confirmation(&taken, &w.h1, SESSION, screenshot("h1"))
        .await
        .unwrap();

    let all = w.board.list_bounties(BountyFilter::All).await.unwrap();
    assert_eq!(all.len(), 2);
    let active = w.board.list_bounties(BountyFilter::Active).await.unwrap();
    assert_eq!(active.iter().map(|b| b.id).collect::<Vec<_>>(), vec![open.id]);
    let claimed = w.board.list_bounties(BountyFilter::Claimed).await.unwrap();
    assert_eq!(claimed.iter().map(|b| b.id).collect::<Vec<_>>(), vec![taken.id]);
}

#[tokio::test]
async fn test_partial_award_is_completed_by_settle() {
    let sqlite = Arc::new(SqliteStore::in_memory().unwrap());
    let flaky = Arc::new(HookedStore::new(sqlite.clone()));
    *flaky.fail_reporter_awards.lock() = true;
    let w = world_with(flaky.clone(), sqlite).await;

    let bounty = w.board.create_bounty(w.reporter.id, report(), None).await.unwrap();
    let claim = w
        .board
        .submit_confirmation(&bounty, &w.h1, SESSION, screenshot("h1"))
        .await
        .unwrap();

    let err = w
        .board
        .approve_by_id(bounty.id, claim.id, w.reporter.id)
        .await
        .unwrap_err();
    match err {
        BountyError::PartialAward {
            confirmation_id,
            missing,
        } => {
            assert_eq!(confirmation_id, claim.id);
            assert_eq!(missing, vec![AwardRole::Reporter]);
        }
        other => panic!("expected PartialAward, got {:?}", other),
    }

    // The approval itself stands.
    assert_eq!(
        w.board.get_bounty(bounty.id).await.unwrap().status,
        BountyStatus::Confirmed
    );
    assert_eq!(reputation(&w, &w.h1).await, 10);
    assert_eq!(reputation(&w, &w.reporter).await, 0);
    assert_eq!(w.store.unsettled_confirmations().await.unwrap(), vec![claim.id]);

    *flaky.fail_reporter_awards.lock() = false;
    assert_eq!(w.board.reconcile().await.unwrap(), 1);

    assert_eq!(reputation(&w, &w.h1).await, 10);
    assert_eq!(reputation(&w, &w.reporter).await, 5);
    assert!(w.store.unsettled_confirmations().await.unwrap().is_empty());
    assert_eq!(w.store.list_awards(claim.id).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_claims_on_one_snapshot_all_land() {
    let w = world().await;
    let bounty = w.board.create_bounty(w.reporter.id, report(), None).await.unwrap();
    let crowd = hunters(&w, 8).await;

    let tasks: Vec<_> = crowd
        .into_iter()
        .map(|hunter| {
            let board = w.board.clone();
            let snapshot = bounty.clone();
            tokio::spawn(async move {
                board
                    .submit_confirmation(&snapshot, &hunter, SESSION, screenshot(&hunter.username))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(
        w.board.get_bounty(bounty.id).await.unwrap().status,
        BountyStatus::Claimed
    );
    let claims = w.board.list_confirmations(bounty.id).await.unwrap();
    assert_eq!(claims.len(), 8);
    assert!(claims.iter().all(|c| !c.verified));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_approvals_of_one_claim_award_once() {
    let w = world().await;
    let bounty = w.board.create_bounty(w.reporter.id, report(), None).await.unwrap();
    let claim = w
        .board
        .submit_confirmation(&bounty, &w.h1, SESSION, screenshot("h1"))
        .await
        .unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let board = w.board.clone();
            let reporter = w.reporter.id;
            tokio::spawn(async move { board.approve_by_id(bounty.id, claim.id, reporter).await })
        })
        .collect();

    let mut approved = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => approved += 1,
            Err(e) => assert!(matches!(e, BountyError::InvalidTransition(_)), "{:?}", e),
        }
    }

    assert_eq!(approved, 1);
    assert_eq!(reputation(&w, &w.h1).await, 10);
    assert_eq!(reputation(&w, &w.reporter).await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_approvals_of_siblings_pick_one_winner() {
    let w = world().await;
    let bounty = w.board.create_bounty(w.reporter.id, report(), None).await.unwrap();
    let crowd = hunters(&w, 6).await;
    let mut claims = Vec::new();
    for hunter in &crowd {
        claims.push(
            w.board
                .submit_confirmation(&bounty, hunter, SESSION, screenshot(&hunter.username))
                .await
                .unwrap(),
        );
    }
    let claimed = w.board.get_bounty(bounty.id).await.unwrap();

    let tasks: Vec<_> = claims
        .iter()
        .cloned()
        .map(|claim| {
            let board = w.board.clone();
            let snapshot = claimed.clone();
            let reporter = w.reporter.clone();
            tokio::spawn(async move { board.approve(&snapshot, &claim, &reporter).await })
        })
        .collect();

    let mut winners = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(approval) => winners.push(approval.confirmation.hunter_id),
            Err(e) => assert!(matches!(e, BountyError::InvalidTransition(_)), "{:?}", e),
        }
    }
    assert_eq!(winners.len(), 1);

    let verified: Vec<_> = w
        .board
        .list_confirmations(bounty.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.verified)
        .collect();
    assert_eq!(verified.len(), 1);
    assert_eq!(verified[0].hunter_id, winners[0]);

    let mut total = 0;
    for hunter in &crowd {
        total += reputation(&w, hunter).await;
    }
    assert_eq!(total, 10);
    assert_eq!(reputation(&w, &w.reporter).await, 5);
}
