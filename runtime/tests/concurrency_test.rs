//! Concurrency tests: many tasks racing for the same event or voucher.
//!
//! The in-memory store validates read versions at commit, so these races go
//! through the same conflict-and-retry path as a real database.
//!
//! Run with: `cargo test -p voucher-runtime --test concurrency_test -- --nocapture`

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use voucher_core::environment::Clock;
use voucher_core::{AcquireOutcome, AllocateOutcome, Event, EventId, RedeemOutcome};
use voucher_runtime::error::AllocateError;
use voucher_runtime::{Allocator, LeaseConfig, LeaseManager, Redeemer, RetryPolicy};
use voucher_testing::{InMemoryStore, actor, requester, test_clock};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("voucher_runtime=warn"))
        .with_test_writer()
        .try_init();
}

fn seed(store: &InMemoryStore, capacity: u32) -> EventId {
    let event = Event::new("Concert", capacity, test_clock().now());
    let id = event.id;
    store.seed_event(event);
    id
}

/// 100 concurrent requests for the last voucher: exactly one wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_voucher_goes_to_exactly_one_requester() {
    init_tracing();
    let store = InMemoryStore::new();
    let event_id = seed(&store, 1);
    let allocator = Arc::new(Allocator::builder(Arc::new(store.clone())).build());

    let handles: Vec<_> = (0..100)
        .map(|i| {
            let allocator = Arc::clone(&allocator);
            tokio::spawn(async move {
                allocator
                    .allocate(event_id, &requester(&format!("user-{i}")))
                    .await
            })
        })
        .collect();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .collect();

    let issued = results
        .iter()
        .filter(|r| matches!(r, Ok(AllocateOutcome::Issued(_))))
        .count();
    println!("  issued: {issued}, others: {}", results.len() - issued);

    assert_eq!(issued, 1);
    // Losers either saw the event exhausted or gave up after bounded retries
    assert!(results.iter().all(|r| matches!(
        r,
        Ok(AllocateOutcome::Issued(_) | AllocateOutcome::Exhausted { capacity: 1 })
            | Err(AllocateError::TransientFailure { attempts: 3, .. })
    )));
    assert_eq!(store.event(event_id).unwrap().issued_count, 1);
    assert_eq!(store.vouchers_for(event_id).len(), 1);
}

/// 50 requests for 10 vouchers with a generous retry bound: every request
/// resolves to a real answer and the count matches the vouchers on record.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_is_never_exceeded_under_contention() {
    let store = InMemoryStore::new();
    let event_id = seed(&store, 10);
    let allocator = Arc::new(
        Allocator::builder(Arc::new(store.clone()))
            .retry(RetryPolicy::immediate(20))
            .build(),
    );

    let results = join_all((0..50).map(|i| {
        let allocator = Arc::clone(&allocator);
        async move {
            allocator
                .allocate(event_id, &requester(&format!("user-{i}")))
                .await
                .unwrap()
        }
    }))
    .await;

    let codes: HashSet<_> = results
        .iter()
        .filter_map(AllocateOutcome::code)
        .cloned()
        .collect();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, AllocateOutcome::Exhausted { .. }))
        .count();

    assert_eq!(codes.len(), 10);
    assert_eq!(exhausted, 40);

    let event = store.event(event_id).unwrap();
    let vouchers = store.vouchers_for(event_id);
    assert_eq!(event.issued_count, 10);
    assert_eq!(vouchers.len(), 10);
    assert_eq!(
        vouchers.iter().map(|v| v.code.clone()).collect::<HashSet<_>>(),
        codes
    );
}

/// Separate events never interfere with each other's capacity.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_are_isolated() {
    let store = InMemoryStore::new();
    let a = seed(&store, 3);
    let b = seed(&store, 5);
    let allocator = Arc::new(
        Allocator::builder(Arc::new(store.clone()))
            .retry(RetryPolicy::immediate(20))
            .build(),
    );

    join_all((0..20).map(|i| {
        let allocator = Arc::clone(&allocator);
        let event_id = if i % 2 == 0 { a } else { b };
        async move {
            allocator
                .allocate(event_id, &requester(&format!("user-{i}")))
                .await
                .unwrap()
        }
    }))
    .await;

    assert_eq!(store.event(a).unwrap().issued_count, 3);
    assert_eq!(store.event(b).unwrap().issued_count, 5);
    assert_eq!(store.vouchers_for(a).len(), 3);
    assert_eq!(store.vouchers_for(b).len(), 5);
}

/// 20 actors race for an unheld lease: exactly one acquires it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lease_race_has_single_winner() {
    let store = InMemoryStore::new();
    let event_id = seed(&store, 1);
    let manager = Arc::new(
        LeaseManager::new(
            Arc::new(store.clone()),
            LeaseConfig {
                retry: RetryPolicy::immediate(5),
                ..LeaseConfig::default()
            },
        )
        .with_clock(Arc::new(test_clock())),
    );

    let results = join_all((0..20).map(|i| {
        let manager = Arc::clone(&manager);
        async move {
            let who = actor(&format!("editor-{i}"));
            (who.clone(), manager.acquire(event_id, &who).await.unwrap())
        }
    }))
    .await;

    let winners: Vec<_> = results
        .iter()
        .filter(|(_, outcome)| matches!(outcome, AcquireOutcome::Acquired { .. }))
        .map(|(who, _)| who.clone())
        .collect();
    assert_eq!(winners.len(), 1);
    assert!(results.iter().all(|(_, outcome)| match outcome {
        AcquireOutcome::Acquired { .. } => true,
        AcquireOutcome::Conflict { holder, .. } => *holder == winners[0],
        AcquireOutcome::AlreadyHeld { .. } => false,
    }));
    assert_eq!(store.event(event_id).unwrap().lease.unwrap().holder, winners[0]);
}

/// Allocations and lease acquisitions write the same event document. Neither
/// may overwrite the other's change: every issued voucher is counted and the
/// winning lease stays on the event.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn allocations_and_lease_updates_do_not_clobber_each_other() {
    init_tracing();
    for _ in 0..20 {
        let store = InMemoryStore::new();
        let event_id = seed(&store, 10);
        let allocator = Arc::new(
            Allocator::builder(Arc::new(store.clone()))
                .retry(RetryPolicy::immediate(50))
                .build(),
        );
        let manager = Arc::new(
            LeaseManager::new(
                Arc::new(store.clone()),
                LeaseConfig {
                    retry: RetryPolicy::immediate(50),
                    ..LeaseConfig::default()
                },
            )
            .with_clock(Arc::new(test_clock())),
        );

        let allocations: Vec<_> = (0..10)
            .map(|i| {
                let allocator = Arc::clone(&allocator);
                tokio::spawn(async move {
                    allocator
                        .allocate(event_id, &requester(&format!("user-{i}")))
                        .await
                })
            })
            .collect();
        let acquisitions: Vec<_> = (0..5)
            .map(|i| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    let who = actor(&format!("editor-{i}"));
                    let outcome = manager.acquire(event_id, &who).await;
                    (who, outcome)
                })
            })
            .collect();
        let (allocated, acquired) = tokio::join!(join_all(allocations), join_all(acquisitions));

        let issued = allocated
            .into_iter()
            .map(|joined| joined.expect("task panicked").unwrap())
            .filter(AllocateOutcome::is_issued)
            .count();
        let acquired: Vec<_> = acquired
            .into_iter()
            .map(|joined| {
                let (who, outcome) = joined.expect("task panicked");
                (who, outcome.unwrap())
            })
            .collect();
        let winners: Vec<_> = acquired
            .iter()
            .filter(|(_, outcome)| matches!(outcome, AcquireOutcome::Acquired { .. }))
            .map(|(who, _)| who.clone())
            .collect();

        assert_eq!(issued, 10);
        assert_eq!(winners.len(), 1);
        assert!(acquired.iter().all(|(_, outcome)| match outcome {
            AcquireOutcome::Acquired { .. } => true,
            AcquireOutcome::Conflict { holder, .. } => *holder == winners[0],
            AcquireOutcome::AlreadyHeld { .. } => false,
        }));

        let stored = store.event(event_id).unwrap();
        assert_eq!(stored.issued_count, 10);
        assert_eq!(store.vouchers_for(event_id).len(), 10);
        assert_eq!(stored.lease.unwrap().holder, winners[0]);
    }
}

/// Concurrent redemptions of one voucher: exactly one succeeds.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn voucher_is_redeemed_once() {
    let store = InMemoryStore::new();
    let event_id = seed(&store, 1);
    let outcome = Allocator::builder(Arc::new(store.clone()))
        .build()
        .allocate(event_id, &requester("ada"))
        .await
        .unwrap();
    let AllocateOutcome::Issued(voucher) = outcome else {
        unreachable!("fresh event has capacity");
    };
    let redeemer = Arc::new(Redeemer::new(
        Arc::new(store.clone()),
        RetryPolicy::immediate(5),
    ));

    let results = join_all((0..20).map(|_| {
        let redeemer = Arc::clone(&redeemer);
        async move { redeemer.redeem(voucher.id).await.unwrap() }
    }))
    .await;

    assert_eq!(
        results
            .iter()
            .filter(|r| **r == RedeemOutcome::Redeemed)
            .count(),
        1
    );
    assert!(store.voucher(voucher.id).unwrap().is_used());
}
