//! # Voucher Desk Core
//!
//! Domain types and abstractions for issuing capacity-bounded vouchers and
//! arbitrating edit leases on the events they are issued against.
//!
//! This crate contains no I/O. It provides:
//!
//! - **Documents**: [`event::Event`] (with its embedded [`lease::Lease`]) and
//!   [`voucher::Voucher`]
//! - **Pure transitions**: capacity consumption ([`event::Event::record_issue`]) and
//!   the lease state machine ([`lease::decide_acquire`] and friends)
//! - **Capabilities**: the [`store::TransactionalStore`] the runtime commits
//!   through, the [`notify::NotificationDispatcher`] and
//!   [`notify::RecipientDirectory`] used after a commit, and the
//!   [`environment`] traits for time and code generation
//! - **Outcomes**: discriminated results and their [`status::HttpStatus`] mapping
//!
//! ## Architecture Principles
//!
//! - Functional Core, Imperative Shell: decisions here, execution in `voucher-runtime`
//! - Correctness at the store: conflicts are detected by the store's transactions,
//!   never by in-process locks
//! - Dependency Injection: every external collaborator is a trait object
//!
//! ## Example
//!
//! ```
//! use voucher_core::event::Event;
//! use voucher_core::ids::ActorId;
//! use voucher_core::lease::{AcquireOutcome, decide_acquire};
//! use chrono::{TimeDelta, Utc};
//!
//! let mut event = Event::new("Spring launch", 2, Utc::now());
//! assert_eq!(event.record_issue(), Ok(1));
//!
//! let alice = ActorId::new("alice").unwrap();
//! let now = Utc::now();
//! let transition = decide_acquire(event.lease.as_ref(), &alice, now, TimeDelta::minutes(5));
//! assert!(matches!(transition.outcome, AcquireOutcome::Acquired { .. }));
//! ```

pub mod event;
pub mod ids;
pub mod lease;
pub mod notify;
pub mod outcome;
pub mod status;
pub mod store;
pub mod voucher;

// Re-export commonly used types
pub use chrono::{DateTime, TimeDelta, Utc};
pub use event::Event;
pub use ids::{ActorId, EventId, IdError, RequesterId, VoucherCode, VoucherId};
pub use lease::{AcquireOutcome, Lease, MaintainOutcome, ReleaseOutcome};
pub use outcome::{AllocateOutcome, RedeemOutcome};
pub use status::HttpStatus;
pub use store::{StoreError, StoreErrorKind, Transaction, TransactionalStore};
pub use voucher::Voucher;

/// Environment module - Injected dependencies for time and code generation
///
/// All non-deterministic inputs the runtime needs are abstracted behind traits
/// so tests can pin them down.
pub mod environment {
    use crate::ids::VoucherCode;
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// let clock = SystemClock;
    ///
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of candidate voucher codes.
    ///
    /// Generated codes only need to make collisions improbable; the store's
    /// uniqueness constraint has the final word and a collision is retried with a
    /// fresh code.
    pub trait CodeGenerator: Send + Sync {
        /// Produce a candidate code.
        fn generate(&self) -> VoucherCode;
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
