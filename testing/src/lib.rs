//! # Voucher Desk Testing
//!
//! Testing utilities and helpers for Voucher Desk.
//!
//! This crate provides:
//! - [`InMemoryStore`]: a transactional store with optimistic concurrency and
//!   fault injection
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - Capability doubles for notifications and recipient lookup
//! - Scripted code generation for collision tests
//!
//! ## Example
//!
//! ```ignore
//! use voucher_testing::{InMemoryStore, ManualClock, RecordingDispatcher, test_clock};
//!
//! #[tokio::test]
//! async fn issues_a_voucher() {
//!     let store = Arc::new(InMemoryStore::new());
//!     let allocator = Allocator::builder(store.clone())
//!         .clock(Arc::new(test_clock()))
//!         .build();
//!     // ...
//! }
//! ```

pub mod store;

pub use store::InMemoryStore;

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use voucher_core::environment::{Clock, CodeGenerator};
use voucher_core::ids::{ActorId, RequesterId, VoucherCode};
use voucher_core::notify::{
    DirectoryError, DispatchError, Notification, NotificationDispatcher, Recipient,
    RecipientDirectory,
};

/// Mock implementations of the runtime's injected capabilities.
pub mod mocks {
    use super::{
        Arc, AtomicU64, Clock, CodeGenerator, DateTime, DirectoryError, DispatchError, Duration,
        Future, HashMap, Mutex, Notification, NotificationDispatcher, Notify, Ordering, Pin,
        PoisonError, Recipient, RecipientDirectory, RequesterId, TimeDelta, Utc, VecDeque,
        VoucherCode,
    };

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use voucher_testing::mocks::FixedClock;
    /// use voucher_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one to a lease manager and
    /// advance it from the outside.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start the clock at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Start the clock at the same instant as [`test_clock`].
        #[must_use]
        pub fn starting_at_test_epoch() -> Self {
            Self::new(test_clock().now())
        }

        /// Move the clock forward.
        pub fn advance(&self, by: TimeDelta) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Dispatcher that records every accepted notification.
    #[derive(Debug, Default)]
    pub struct RecordingDispatcher {
        sent: Mutex<Vec<(Recipient, Notification)>>,
        arrived: Notify,
    }

    impl RecordingDispatcher {
        /// Create an empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Everything dispatched so far.
        #[must_use]
        pub fn sent(&self) -> Vec<(Recipient, Notification)> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Wait until at least `count` notifications were dispatched.
        ///
        /// Returns what was recorded, or `None` if `timeout` elapsed first.
        /// Notifications are dispatched from detached tasks, so tests must wait
        /// rather than inspect immediately.
        pub async fn wait_for(
            &self,
            count: usize,
            timeout: Duration,
        ) -> Option<Vec<(Recipient, Notification)>> {
            tokio::time::timeout(timeout, async {
                loop {
                    let sent = self.sent();
                    if sent.len() >= count {
                        return sent;
                    }
                    self.arrived.notified().await;
                }
            })
            .await
            .ok()
        }
    }

    impl NotificationDispatcher for RecordingDispatcher {
        fn dispatch(
            &self,
            recipient: Recipient,
            notification: Notification,
        ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + '_>> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((recipient, notification));
            self.arrived.notify_one();
            Box::pin(async { Ok(()) })
        }
    }

    /// Dispatcher that rejects every request and counts the attempts.
    #[derive(Debug)]
    pub struct FailingDispatcher {
        error: DispatchError,
        attempts: AtomicU64,
        attempted: Notify,
    }

    impl FailingDispatcher {
        /// Reject every dispatch with `error`.
        #[must_use]
        pub fn new(error: DispatchError) -> Self {
            Self {
                error,
                attempts: AtomicU64::new(0),
                attempted: Notify::new(),
            }
        }

        /// Number of rejected dispatches.
        #[must_use]
        pub fn attempts(&self) -> u64 {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Wait until at least `count` dispatches were attempted.
        ///
        /// Returns `false` if `timeout` elapsed first.
        pub async fn wait_for_attempts(&self, count: u64, timeout: Duration) -> bool {
            tokio::time::timeout(timeout, async {
                while self.attempts() < count {
                    self.attempted.notified().await;
                }
            })
            .await
            .is_ok()
        }
    }

    impl NotificationDispatcher for FailingDispatcher {
        fn dispatch(
            &self,
            _recipient: Recipient,
            _notification: Notification,
        ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + '_>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.attempted.notify_one();
            let error = self.error.clone();
            Box::pin(async move { Err(error) })
        }
    }

    /// Directory backed by a map from requester id to address.
    #[derive(Debug, Default)]
    pub struct InMemoryDirectory {
        addresses: Mutex<HashMap<RequesterId, Recipient>>,
    }

    impl InMemoryDirectory {
        /// Create an empty directory.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Register `requester`'s address.
        #[must_use]
        pub fn with(self, requester: RequesterId, address: impl Into<String>) -> Self {
            self.addresses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(requester, Recipient::new(address));
            self
        }
    }

    impl RecipientDirectory for InMemoryDirectory {
        fn resolve<'a>(
            &'a self,
            requester: &'a RequesterId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Recipient>, DirectoryError>> + Send + 'a>>
        {
            let found = self
                .addresses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(requester)
                .cloned();
            Box::pin(async move { Ok(found) })
        }
    }

    /// Code generator replaying a fixed script, then falling back to a counter.
    ///
    /// Used to force code collisions deterministically.
    #[derive(Debug)]
    pub struct ScriptedCodeGenerator {
        script: Mutex<VecDeque<String>>,
        counter: AtomicU64,
    }

    impl ScriptedCodeGenerator {
        /// Replay `codes` in order before generating `VC-SEQ-<n>` codes.
        #[must_use]
        pub fn new<I, S>(codes: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                script: Mutex::new(codes.into_iter().map(Into::into).collect()),
                counter: AtomicU64::new(0),
            }
        }
    }

    impl CodeGenerator for ScriptedCodeGenerator {
        fn generate(&self) -> VoucherCode {
            let scripted = self
                .script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            scripted.map_or_else(
                || {
                    let n = self.counter.fetch_add(1, Ordering::SeqCst);
                    VoucherCode::new(format!("VC-SEQ-{n:06}"))
                },
                VoucherCode::new,
            )
        }
    }
}

/// Small constructors that keep tests readable.
pub mod fixtures {
    use super::{ActorId, RequesterId};

    /// Build an [`ActorId`], panicking on blank input.
    ///
    /// # Panics
    ///
    /// Panics if `id` is blank.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn actor(id: &str) -> ActorId {
        ActorId::new(id).expect("fixture actor ids are non-empty")
    }

    /// Build a [`RequesterId`], panicking on blank input.
    ///
    /// # Panics
    ///
    /// Panics if `id` is blank.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn requester(id: &str) -> RequesterId {
        RequesterId::new(id).expect("fixture requester ids are non-empty")
    }
}

// Re-export commonly used items
pub use fixtures::{actor, requester};
pub use mocks::{
    FailingDispatcher, FixedClock, InMemoryDirectory, ManualClock, RecordingDispatcher,
    ScriptedCodeGenerator, test_clock,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::starting_at_test_epoch();
        let handle = clock.clone();
        handle.advance(TimeDelta::minutes(6));
        assert_eq!(clock.now(), test_clock().now() + TimeDelta::minutes(6));

        let earlier = test_clock().now() - TimeDelta::hours(1);
        handle.set(earlier);
        assert_eq!(clock.now(), earlier);
    }

    #[test]
    fn scripted_generator_replays_then_counts() {
        let generator = ScriptedCodeGenerator::new(["VC-DUP", "VC-DUP"]);
        assert_eq!(generator.generate().as_str(), "VC-DUP");
        assert_eq!(generator.generate().as_str(), "VC-DUP");
        assert_eq!(generator.generate().as_str(), "VC-SEQ-000000");
        assert_eq!(generator.generate().as_str(), "VC-SEQ-000001");
    }

    #[tokio::test]
    async fn recording_dispatcher_wakes_waiters() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let sender = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let notification = Notification {
                voucher_id: voucher_core::ids::VoucherId::new(),
                event_id: voucher_core::ids::EventId::new(),
                code: VoucherCode::new("VC-1"),
            };
            let _ = sender
                .dispatch(Recipient::new("u1@example.com"), notification)
                .await;
        });

        let sent = dispatcher.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(sent.map(|s| s.len()), Some(1));
    }

    #[tokio::test]
    async fn in_memory_directory_resolves_known_requesters() {
        let directory = InMemoryDirectory::new().with(requester("u1"), "u1@example.com");
        let found = directory.resolve(&requester("u1")).await;
        assert_eq!(found, Ok(Some(Recipient::new("u1@example.com"))));
        assert_eq!(directory.resolve(&requester("u2")).await, Ok(None));
    }
}
