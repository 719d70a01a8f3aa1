//! Executes the edit-lease state machine against the store.
//!
//! The decisions themselves live in [`voucher_core::lease`]. Here each operation
//! reads the event inside a transaction, asks the pure decision function what to
//! do at the clock's current time, persists the resulting lease change (if any)
//! and commits. Two actors racing for an unheld lease both read "unheld"; the
//! store rejects the second commit as a conflict, and its retry then observes the
//! winner and answers `Conflict`.

use crate::error::LeaseError;
use crate::metrics::LeaseMetrics;
use crate::retry::RetryPolicy;
use crate::txn::{Failure, Staged, StepError, finish, run_bounded};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use voucher_core::environment::{Clock, SystemClock};
use voucher_core::lease::{
    LeaseChange, Transition, decide_acquire, decide_maintain, decide_release,
};
use voucher_core::store::Transaction;
use voucher_core::{
    AcquireOutcome, ActorId, EventId, Lease, MaintainOutcome, ReleaseOutcome, TransactionalStore,
};

/// Lease tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    /// How long an acquired or renewed lease lasts.
    pub duration: TimeDelta,
    /// Bound on attempts when the store reports conflicts.
    pub retry: RetryPolicy,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: TimeDelta::minutes(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Arbitrates the exclusive edit lease on events.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn TransactionalStore>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
}

impl LeaseManager {
    /// Create a manager using the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn TransactionalStore>, config: LeaseConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Take the lease on `event_id` for `actor`.
    ///
    /// Acquiring a lease the actor already holds is a no-op answered with
    /// [`AcquireOutcome::AlreadyHeld`]; an expired lease held by anyone is taken
    /// over.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] if the event is missing or the store fails.
    #[tracing::instrument(skip_all, name = "lease_acquire", fields(event_id = %event_id, actor = %actor))]
    pub async fn acquire(
        &self,
        event_id: EventId,
        actor: &ActorId,
    ) -> Result<AcquireOutcome, LeaseError> {
        let duration = self.config.duration;
        let outcome = self
            .run(event_id, |lease, now| {
                decide_acquire(lease, actor, now, duration)
            })
            .await;

        let label = match &outcome {
            Ok(AcquireOutcome::Acquired { expires_at }) => {
                tracing::info!(expires_at = %expires_at, "Lease acquired");
                "acquired"
            }
            Ok(AcquireOutcome::AlreadyHeld { .. }) => "already_held",
            Ok(AcquireOutcome::Conflict { holder, .. }) => {
                tracing::debug!(holder = %holder, "Lease held by another actor");
                "conflict"
            }
            Err(_) => "error",
        };
        LeaseMetrics::record("acquire", label);
        outcome
    }

    /// Give up the lease on `event_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] if the event is missing or the store fails.
    #[tracing::instrument(skip_all, name = "lease_release", fields(event_id = %event_id, actor = %actor))]
    pub async fn release(
        &self,
        event_id: EventId,
        actor: &ActorId,
    ) -> Result<ReleaseOutcome, LeaseError> {
        let outcome = self
            .run(event_id, |lease, _now| decide_release(lease, actor))
            .await;

        let label = match &outcome {
            Ok(ReleaseOutcome::Released) => {
                tracing::info!("Lease released");
                "released"
            }
            Ok(ReleaseOutcome::Forbidden) => "forbidden",
            Err(_) => "error",
        };
        LeaseMetrics::record("release", label);
        outcome
    }

    /// Renew the caller's active lease on `event_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError`] if the event is missing or the store fails.
    #[tracing::instrument(skip_all, name = "lease_maintain", fields(event_id = %event_id, actor = %actor))]
    pub async fn maintain(
        &self,
        event_id: EventId,
        actor: &ActorId,
    ) -> Result<MaintainOutcome, LeaseError> {
        let duration = self.config.duration;
        let outcome = self
            .run(event_id, |lease, now| {
                decide_maintain(lease, actor, now, duration)
            })
            .await;

        let label = match &outcome {
            Ok(MaintainOutcome::Extended { expires_at }) => {
                tracing::debug!(expires_at = %expires_at, "Lease extended");
                "extended"
            }
            Ok(MaintainOutcome::Invalid) => "invalid",
            Err(_) => "error",
        };
        LeaseMetrics::record("maintain", label);
        outcome
    }

    async fn run<O, D>(&self, event_id: EventId, decide: D) -> Result<O, LeaseError>
    where
        D: Fn(Option<&Lease>, DateTime<Utc>) -> Transition<O> + Sync,
        O: Send,
    {
        run_bounded(&self.config.retry, || self.attempt(event_id, &decide))
            .await
            .map_err(|failure| match failure {
                Failure::Missing => LeaseError::EventNotFound(event_id),
                Failure::Exhausted {
                    attempts,
                    last_error,
                } => LeaseError::TransientFailure {
                    attempts,
                    last_error,
                },
                Failure::Store(error) => LeaseError::Internal(error),
            })
    }

    async fn attempt<O, D>(&self, event_id: EventId, decide: &D) -> Result<O, StepError>
    where
        D: Fn(Option<&Lease>, DateTime<Utc>) -> Transition<O> + Sync,
        O: Send,
    {
        let mut tx = self.store.begin().await?;
        let staged = self.stage(tx.as_mut(), event_id, decide).await;
        finish(tx, staged).await
    }

    async fn stage<O, D>(
        &self,
        tx: &mut dyn Transaction,
        event_id: EventId,
        decide: &D,
    ) -> Result<Staged<O>, StepError>
    where
        D: Fn(Option<&Lease>, DateTime<Utc>) -> Transition<O> + Sync,
        O: Send,
    {
        let mut event = tx.get_event(event_id).await?.ok_or(StepError::Missing)?;
        let Transition { outcome, change } = decide(event.lease.as_ref(), self.clock.now());

        match change {
            LeaseChange::Keep => return Ok(Staged::Discard(outcome)),
            LeaseChange::Set(lease) => event.lease = Some(lease),
            LeaseChange::Clear => event.lease = None,
        }
        tx.update_event(event).await?;
        Ok(Staged::Commit(outcome))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use voucher_core::Event;
    use voucher_testing::{InMemoryStore, ManualClock, actor};

    fn setup() -> (InMemoryStore, ManualClock, LeaseManager, EventId) {
        let store = InMemoryStore::new();
        let clock = ManualClock::starting_at_test_epoch();
        let event = Event::new("Launch", 10, clock.now());
        let event_id = event.id;
        store.seed_event(event);
        let config = LeaseConfig {
            retry: RetryPolicy::immediate(3),
            ..LeaseConfig::default()
        };
        let manager =
            LeaseManager::new(Arc::new(store.clone()), config).with_clock(Arc::new(clock.clone()));
        (store, clock, manager, event_id)
    }

    #[tokio::test]
    async fn acquire_sets_holder_and_expiry() {
        let (store, clock, manager, event_id) = setup();
        let alice = actor("alice");

        let outcome = manager.acquire(event_id, &alice).await.unwrap();

        let expected = clock.now() + TimeDelta::minutes(5);
        assert_eq!(outcome, AcquireOutcome::Acquired { expires_at: expected });
        let lease = store.event(event_id).unwrap().lease.unwrap();
        assert_eq!(lease.holder, alice);
        assert_eq!(lease.expires_at, expected);
    }

    #[tokio::test]
    async fn reacquire_is_idempotent() {
        let (store, clock, manager, event_id) = setup();
        let alice = actor("alice");
        manager.acquire(event_id, &alice).await.unwrap();
        let commits = store.commits();

        clock.advance(TimeDelta::minutes(1));
        let outcome = manager.acquire(event_id, &alice).await.unwrap();

        assert!(matches!(outcome, AcquireOutcome::AlreadyHeld { .. }));
        assert_eq!(store.commits(), commits);
    }

    #[tokio::test]
    async fn other_actor_conflicts_until_expiry() {
        let (store, clock, manager, event_id) = setup();
        let (alice, bob) = (actor("alice"), actor("bob"));
        manager.acquire(event_id, &alice).await.unwrap();

        let blocked = manager.acquire(event_id, &bob).await.unwrap();
        assert!(matches!(blocked, AcquireOutcome::Conflict { ref holder, .. } if *holder == alice));

        clock.advance(TimeDelta::minutes(5) + TimeDelta::seconds(1));
        let taken = manager.acquire(event_id, &bob).await.unwrap();
        assert!(matches!(taken, AcquireOutcome::Acquired { .. }));
        assert_eq!(store.event(event_id).unwrap().lease.unwrap().holder, bob);
    }

    #[tokio::test]
    async fn release_by_non_holder_is_forbidden() {
        let (store, _clock, manager, event_id) = setup();
        manager.acquire(event_id, &actor("alice")).await.unwrap();
        let before = store.event(event_id).unwrap().lease;

        let outcome = manager.release(event_id, &actor("bob")).await.unwrap();

        assert_eq!(outcome, ReleaseOutcome::Forbidden);
        assert!(before.is_some());
        assert_eq!(store.event(event_id).unwrap().lease, before);
    }

    #[tokio::test]
    async fn release_clears_lease() {
        let (store, _clock, manager, event_id) = setup();
        let alice = actor("alice");
        manager.acquire(event_id, &alice).await.unwrap();

        assert_eq!(
            manager.release(event_id, &alice).await.unwrap(),
            ReleaseOutcome::Released
        );
        assert!(store.event(event_id).unwrap().lease.is_none());
        assert_eq!(
            manager.release(event_id, &alice).await.unwrap(),
            ReleaseOutcome::Forbidden
        );
    }

    #[tokio::test]
    async fn maintain_extends_from_now() {
        let (store, clock, manager, event_id) = setup();
        let alice = actor("alice");
        manager.acquire(event_id, &alice).await.unwrap();

        clock.advance(TimeDelta::minutes(4));
        let outcome = manager.maintain(event_id, &alice).await.unwrap();

        let expected = clock.now() + TimeDelta::minutes(5);
        assert_eq!(outcome, MaintainOutcome::Extended { expires_at: expected });
        assert_eq!(
            store.event(event_id).unwrap().lease.unwrap().expires_at,
            expected
        );
    }

    #[tokio::test]
    async fn maintain_after_expiry_is_invalid() {
        let (store, clock, manager, event_id) = setup();
        let alice = actor("alice");
        manager.acquire(event_id, &alice).await.unwrap();
        let before = store.event(event_id).unwrap().lease;

        clock.advance(TimeDelta::minutes(6));
        let outcome = manager.maintain(event_id, &alice).await.unwrap();

        assert_eq!(outcome, MaintainOutcome::Invalid);
        assert_eq!(store.event(event_id).unwrap().lease, before);
    }

    #[tokio::test]
    async fn custom_duration_is_applied() {
        let (store, clock, _manager, event_id) = setup();
        let manager = LeaseManager::new(
            Arc::new(store.clone()),
            LeaseConfig {
                duration: TimeDelta::seconds(30),
                retry: RetryPolicy::immediate(1),
            },
        )
        .with_clock(Arc::new(clock.clone()));

        let outcome = manager.acquire(event_id, &actor("alice")).await.unwrap();

        assert_eq!(
            outcome,
            AcquireOutcome::Acquired {
                expires_at: clock.now() + TimeDelta::seconds(30)
            }
        );
    }

    #[tokio::test]
    async fn missing_event_is_not_found() {
        let (_store, _clock, manager, _event_id) = setup();
        let missing = EventId::new();

        assert_eq!(
            manager.acquire(missing, &actor("a")).await.unwrap_err(),
            LeaseError::EventNotFound(missing)
        );
        assert_eq!(
            manager.release(missing, &actor("a")).await.unwrap_err(),
            LeaseError::EventNotFound(missing)
        );
        assert_eq!(
            manager.maintain(missing, &actor("a")).await.unwrap_err(),
            LeaseError::EventNotFound(missing)
        );
    }

    #[tokio::test]
    async fn permanent_store_failure_surfaces_once() {
        let (store, _clock, manager, event_id) = setup();
        store.fail_next_begin(voucher_core::StoreError::Unavailable("down".into()));

        let err = manager.acquire(event_id, &actor("a")).await.unwrap_err();

        assert_eq!(
            err,
            LeaseError::Internal(voucher_core::StoreError::Unavailable("down".into()))
        );
    }
}
