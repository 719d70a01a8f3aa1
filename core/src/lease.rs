//! Edit lease state machine.
//!
//! A lease is embedded on the [`Event`](crate::event::Event) document. These
//! functions are pure: given the current lease, the calling actor and the current
//! time they decide the outcome and the change to apply. The runtime executes the
//! decision inside a store transaction.
//!
//! ```text
//! Unheld          --acquire(a)-------------> Held(a, now+D)
//! Held(a, _)      --acquire(a)-------------> Held(a, _)            AlreadyHeld
//! Held(b, t>=now) --acquire(a)-------------> unchanged             Conflict
//! Held(_, t<now)  --acquire(a)-------------> Held(a, now+D)
//! Held(a, _)      --release(a)-------------> Unheld
//! Held(b, _)      --release(a)-------------> unchanged             Forbidden
//! Held(a, t>=now) --maintain(a)------------> Held(a, now+D)        Extended
//! anything else   --maintain(a)------------> unchanged             Invalid
//! ```
//!
//! A lease is expired when `expires_at < now`; at exactly `expires_at` it is
//! still held.

use crate::ids::ActorId;
use crate::status::HttpStatus;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Exclusive, time-bound right to edit an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Actor holding the lease
    pub holder: ActorId,
    /// Moment the lease stops protecting the holder
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Grant a lease to `holder` for `duration` starting at `now`.
    #[must_use]
    pub fn grant(holder: ActorId, now: DateTime<Utc>, duration: TimeDelta) -> Self {
        Self {
            holder,
            expires_at: now + duration,
        }
    }

    /// Whether the lease has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Whether `actor` is the recorded holder (regardless of expiry).
    #[must_use]
    pub fn is_held_by(&self, actor: &ActorId) -> bool {
        &self.holder == actor
    }
}

/// Effective lease state at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState<'a> {
    /// Nobody holds the lease, or the recorded lease has expired.
    Unheld,
    /// The lease is active.
    Held(&'a Lease),
}

impl<'a> LeaseState<'a> {
    /// Resolve the recorded lease against `now`.
    #[must_use]
    pub fn at(lease: Option<&'a Lease>, now: DateTime<Utc>) -> Self {
        match lease {
            Some(lease) if !lease.is_expired_at(now) => Self::Held(lease),
            _ => Self::Unheld,
        }
    }
}

/// How the lease field of the event document must change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseChange {
    /// Leave the document untouched.
    Keep,
    /// Replace the lease.
    Set(Lease),
    /// Remove the lease.
    Clear,
}

/// A decided transition: the caller-facing outcome plus the document change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition<O> {
    /// What the caller is told.
    pub outcome: O,
    /// What must be persisted.
    pub change: LeaseChange,
}

impl<O> Transition<O> {
    const fn keep(outcome: O) -> Self {
        Self {
            outcome,
            change: LeaseChange::Keep,
        }
    }
}

/// Result of `acquire`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquireOutcome {
    /// The caller now holds a fresh lease.
    Acquired {
        /// Expiry of the new lease
        expires_at: DateTime<Utc>,
    },
    /// The caller already held an active lease; expiry is unchanged.
    AlreadyHeld {
        /// Existing expiry
        expires_at: DateTime<Utc>,
    },
    /// Another actor holds an active lease.
    Conflict {
        /// Current holder
        holder: ActorId,
        /// When the current holder's lease lapses
        expires_at: DateTime<Utc>,
    },
}

/// Result of `release`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    /// The caller's lease was cleared.
    Released,
    /// The caller is not the recorded holder.
    Forbidden,
}

/// Result of `maintain`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintainOutcome {
    /// The caller's active lease was pushed forward.
    Extended {
        /// New expiry, measured from the renewal time
        expires_at: DateTime<Utc>,
    },
    /// No active lease held by the caller; it must re-acquire.
    Invalid,
}

/// Decide an `acquire` by `actor` at `now`.
#[must_use]
pub fn decide_acquire(
    current: Option<&Lease>,
    actor: &ActorId,
    now: DateTime<Utc>,
    duration: TimeDelta,
) -> Transition<AcquireOutcome> {
    match LeaseState::at(current, now) {
        LeaseState::Unheld => {
            let lease = Lease::grant(actor.clone(), now, duration);
            Transition {
                outcome: AcquireOutcome::Acquired {
                    expires_at: lease.expires_at,
                },
                change: LeaseChange::Set(lease),
            }
        }
        LeaseState::Held(lease) if lease.is_held_by(actor) => {
            Transition::keep(AcquireOutcome::AlreadyHeld {
                expires_at: lease.expires_at,
            })
        }
        LeaseState::Held(lease) => Transition::keep(AcquireOutcome::Conflict {
            holder: lease.holder.clone(),
            expires_at: lease.expires_at,
        }),
    }
}

/// Decide a `release` by `actor`.
///
/// Only the recorded holder may release; a holder whose lease already lapsed can
/// still clear it.
#[must_use]
pub fn decide_release(current: Option<&Lease>, actor: &ActorId) -> Transition<ReleaseOutcome> {
    match current {
        Some(lease) if lease.is_held_by(actor) => Transition {
            outcome: ReleaseOutcome::Released,
            change: LeaseChange::Clear,
        },
        _ => Transition::keep(ReleaseOutcome::Forbidden),
    }
}

/// Decide a `maintain` (renewal) by `actor` at `now`.
///
/// Renewal never resurrects an expired or foreign lease.
#[must_use]
pub fn decide_maintain(
    current: Option<&Lease>,
    actor: &ActorId,
    now: DateTime<Utc>,
    duration: TimeDelta,
) -> Transition<MaintainOutcome> {
    match LeaseState::at(current, now) {
        LeaseState::Held(lease) if lease.is_held_by(actor) => {
            let renewed = Lease::grant(actor.clone(), now, duration);
            Transition {
                outcome: MaintainOutcome::Extended {
                    expires_at: renewed.expires_at,
                },
                change: LeaseChange::Set(renewed),
            }
        }
        _ => Transition::keep(MaintainOutcome::Invalid),
    }
}

impl HttpStatus for AcquireOutcome {
    fn http_status(&self) -> u16 {
        match self {
            Self::Acquired { .. } | Self::AlreadyHeld { .. } => 200,
            Self::Conflict { .. } => 409,
        }
    }
}

impl HttpStatus for ReleaseOutcome {
    fn http_status(&self) -> u16 {
        match self {
            Self::Released => 200,
            Self::Forbidden => 403,
        }
    }
}

impl HttpStatus for MaintainOutcome {
    fn http_status(&self) -> u16 {
        match self {
            Self::Extended { .. } => 200,
            Self::Invalid => 409,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn d() -> TimeDelta {
        TimeDelta::minutes(5)
    }

    fn actor(id: &str) -> ActorId {
        ActorId::new(id).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn acquire_unheld_grants_fresh_lease() {
        let t = decide_acquire(None, &actor("a"), t0(), d());
        assert_eq!(t.outcome, AcquireOutcome::Acquired { expires_at: t0() + d() });
        assert_eq!(t.change, LeaseChange::Set(Lease::grant(actor("a"), t0(), d())));
    }

    #[test]
    fn reacquire_by_holder_does_not_extend() {
        let lease = Lease::grant(actor("a"), t0(), d());
        let later = t0() + TimeDelta::minutes(2);

        let t = decide_acquire(Some(&lease), &actor("a"), later, d());
        assert_eq!(t.outcome, AcquireOutcome::AlreadyHeld { expires_at: t0() + d() });
        assert_eq!(t.change, LeaseChange::Keep);
    }

    #[test]
    fn acquire_against_active_foreign_lease_conflicts() {
        let lease = Lease::grant(actor("a"), t0(), d());
        let t = decide_acquire(Some(&lease), &actor("b"), t0() + d(), d());
        assert_eq!(
            t.outcome,
            AcquireOutcome::Conflict {
                holder: actor("a"),
                expires_at: t0() + d()
            }
        );
        assert_eq!(t.change, LeaseChange::Keep);
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let lease = Lease::grant(actor("a"), t0(), d());
        let after = t0() + d() + TimeDelta::seconds(1);

        let t = decide_acquire(Some(&lease), &actor("b"), after, d());
        assert_eq!(t.outcome, AcquireOutcome::Acquired { expires_at: after + d() });
        assert_eq!(t.change, LeaseChange::Set(Lease::grant(actor("b"), after, d())));
    }

    #[test]
    fn release_requires_recorded_holder() {
        let lease = Lease::grant(actor("a"), t0(), d());

        let t = decide_release(Some(&lease), &actor("b"));
        assert_eq!(t.outcome, ReleaseOutcome::Forbidden);
        assert_eq!(t.change, LeaseChange::Keep);

        let t = decide_release(Some(&lease), &actor("a"));
        assert_eq!(t.outcome, ReleaseOutcome::Released);
        assert_eq!(t.change, LeaseChange::Clear);

        assert_eq!(decide_release(None, &actor("a")).outcome, ReleaseOutcome::Forbidden);
    }

    #[test]
    fn holder_can_release_after_expiry() {
        let lease = Lease::grant(actor("a"), t0(), d());
        let after = t0() + d() + TimeDelta::seconds(1);
        assert!(lease.is_expired_at(after));

        let t = decide_release(Some(&lease), &actor("a"));
        assert_eq!(t.outcome, ReleaseOutcome::Released);
        assert_eq!(t.change, LeaseChange::Clear);

        let t = decide_release(Some(&lease), &actor("b"));
        assert_eq!(t.outcome, ReleaseOutcome::Forbidden);
        assert_eq!(t.change, LeaseChange::Keep);
    }

    #[test]
    fn maintain_extends_from_call_time() {
        let lease = Lease::grant(actor("a"), t0(), d());
        let renew_at = t0() + TimeDelta::minutes(4);

        let t = decide_maintain(Some(&lease), &actor("a"), renew_at, d());
        assert_eq!(t.outcome, MaintainOutcome::Extended { expires_at: renew_at + d() });
    }

    #[test]
    fn maintain_never_resurrects() {
        let lease = Lease::grant(actor("a"), t0(), d());
        let after = t0() + d() + TimeDelta::milliseconds(1);

        assert_eq!(
            decide_maintain(Some(&lease), &actor("a"), after, d()).outcome,
            MaintainOutcome::Invalid
        );
        assert_eq!(
            decide_maintain(Some(&lease), &actor("b"), t0(), d()).outcome,
            MaintainOutcome::Invalid
        );
        assert_eq!(decide_maintain(None, &actor("a"), t0(), d()).outcome, MaintainOutcome::Invalid);
    }

    #[test]
    fn lease_is_held_at_exact_expiry() {
        let lease = Lease::grant(actor("a"), t0(), d());
        assert_eq!(LeaseState::at(Some(&lease), t0() + d()), LeaseState::Held(&lease));
    }

    #[test]
    fn outcomes_map_to_status_codes() {
        assert_eq!(AcquireOutcome::Acquired { expires_at: t0() }.http_status(), 200);
        assert_eq!(AcquireOutcome::AlreadyHeld { expires_at: t0() }.http_status(), 200);
        assert_eq!(
            AcquireOutcome::Conflict { holder: actor("b"), expires_at: t0() }.http_status(),
            409
        );
        assert_eq!(ReleaseOutcome::Forbidden.http_status(), 403);
        assert_eq!(MaintainOutcome::Invalid.http_status(), 409);
    }
}
