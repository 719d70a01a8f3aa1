//! Capacity-bounded voucher allocation.
//!
//! Each attempt runs in its own store transaction:
//!
//! 1. read the event (absent: [`AllocateError::EventNotFound`])
//! 2. no capacity left: abort and answer [`AllocateOutcome::Exhausted`]
//! 3. generate a code, stage the voucher and the incremented `issued_count`
//! 4. commit
//!
//! A commit rejected as a conflict (a concurrent allocation changed the event, or
//! the code collided) restarts from step 1 with a fresh read and a fresh code,
//! at most [`RetryPolicy::max_attempts`] times in total. The store's isolation is
//! what keeps `issued_count <= capacity`; there is no in-process lock.
//!
//! After a successful commit the allocator spawns a detached task that resolves
//! the requester's address and dispatches the code. That task can only log; the
//! voucher is already issued.

use crate::codegen::RandomCodeGenerator;
use crate::directory::IdentityDirectory;
use crate::error::AllocateError;
use crate::metrics::{AllocationMetrics, NotificationMetrics};
use crate::retry::RetryPolicy;
use crate::txn::{Failure, Staged, StepError, finish, run_bounded};
use std::sync::Arc;
use std::time::Instant;
use voucher_core::environment::{Clock, CodeGenerator, SystemClock};
use voucher_core::notify::{Notification, NotificationDispatcher, RecipientDirectory};
use voucher_core::store::Transaction;
use voucher_core::{AllocateOutcome, EventId, RequesterId, TransactionalStore, Voucher};

/// Allocator tuning.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AllocatorConfig {
    /// Bound on attempts when the store reports conflicts.
    pub retry: RetryPolicy,
}

/// Issues vouchers against capacity-bounded events.
///
/// Cheap to clone; all collaborators are shared.
#[derive(Clone)]
pub struct Allocator {
    store: Arc<dyn TransactionalStore>,
    codes: Arc<dyn CodeGenerator>,
    clock: Arc<dyn Clock>,
    dispatcher: Option<Arc<dyn NotificationDispatcher>>,
    directory: Arc<dyn RecipientDirectory>,
    config: AllocatorConfig,
}

impl Allocator {
    /// Start building an allocator over `store`.
    #[must_use]
    pub fn builder(store: Arc<dyn TransactionalStore>) -> AllocatorBuilder {
        AllocatorBuilder {
            store,
            codes: Arc::new(RandomCodeGenerator),
            clock: Arc::new(SystemClock),
            dispatcher: None,
            directory: Arc::new(IdentityDirectory),
            config: AllocatorConfig::default(),
        }
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Issue one voucher of `event_id` to `requester`.
    ///
    /// # Errors
    ///
    /// - [`AllocateError::EventNotFound`] if the event does not exist
    /// - [`AllocateError::TransientFailure`] if every attempt conflicted
    /// - [`AllocateError::Internal`] on any other store failure (not retried)
    #[tracing::instrument(skip_all, name = "allocate", fields(event_id = %event_id, requester = %requester))]
    pub async fn allocate(
        &self,
        event_id: EventId,
        requester: &RequesterId,
    ) -> Result<AllocateOutcome, AllocateError> {
        let started = Instant::now();

        let result = run_bounded(&self.config.retry, || self.attempt(event_id, requester))
            .await
            .map_err(|failure| match failure {
                Failure::Missing => AllocateError::EventNotFound(event_id),
                Failure::Exhausted {
                    attempts,
                    last_error,
                } => AllocateError::TransientFailure {
                    attempts,
                    last_error,
                },
                Failure::Store(error) => AllocateError::Internal(error),
            });

        let label = match &result {
            Ok(AllocateOutcome::Issued(voucher)) => {
                tracing::info!(
                    voucher_id = %voucher.id,
                    code = %voucher.code,
                    "Voucher issued"
                );
                self.notify(voucher);
                "issued"
            }
            Ok(AllocateOutcome::Exhausted { capacity }) => {
                tracing::info!(capacity, "Event capacity exhausted");
                "exhausted"
            }
            Err(AllocateError::EventNotFound(_)) => "not_found",
            Err(AllocateError::TransientFailure { attempts, last_error }) => {
                tracing::error!(attempts, error = %last_error, "Allocation gave up on conflicts");
                "transient_failure"
            }
            Err(AllocateError::Internal(error)) => {
                tracing::error!(error = %error, "Allocation failed");
                "error"
            }
        };
        AllocationMetrics::record(label, started.elapsed());

        result
    }

    async fn attempt(
        &self,
        event_id: EventId,
        requester: &RequesterId,
    ) -> Result<AllocateOutcome, StepError> {
        let mut tx = self.store.begin().await?;
        let staged = self.stage(tx.as_mut(), event_id, requester).await;
        let result = finish(tx, staged).await;
        if matches!(&result, Err(StepError::Store(error)) if error.is_transient()) {
            AllocationMetrics::record_conflict();
        }
        result
    }

    async fn stage(
        &self,
        tx: &mut dyn Transaction,
        event_id: EventId,
        requester: &RequesterId,
    ) -> Result<Staged<AllocateOutcome>, StepError> {
        let mut event = tx.get_event(event_id).await?.ok_or(StepError::Missing)?;

        if event.record_issue().is_err() {
            return Ok(Staged::Discard(AllocateOutcome::Exhausted {
                capacity: event.capacity,
            }));
        }

        let voucher = Voucher::issue(
            event_id,
            self.codes.generate(),
            requester.clone(),
            self.clock.now(),
        );
        tracing::debug!(
            code = %voucher.code,
            issued = event.issued_count,
            capacity = event.capacity,
            "Staging voucher"
        );

        tx.insert_voucher(voucher.clone()).await?;
        tx.update_event(event).await?;

        Ok(Staged::Commit(AllocateOutcome::Issued(voucher)))
    }

    fn notify(&self, voucher: &Voucher) {
        let Some(dispatcher) = self.dispatcher.clone() else {
            tracing::debug!("No notification dispatcher configured");
            return;
        };
        let directory = Arc::clone(&self.directory);
        let requester = voucher.recipient.clone();
        let notification = Notification::from(voucher);

        tokio::spawn(async move {
            let recipient = match directory.resolve(&requester).await {
                Ok(Some(recipient)) => recipient,
                Ok(None) => {
                    tracing::warn!(
                        requester = %requester,
                        code = %notification.code,
                        "No address for requester, notification skipped"
                    );
                    NotificationMetrics::record_failure("resolve");
                    return;
                }
                Err(e) => {
                    tracing::error!(requester = %requester, error = %e, "Recipient lookup failed");
                    NotificationMetrics::record_failure("resolve");
                    return;
                }
            };

            match dispatcher.dispatch(recipient, notification).await {
                Ok(()) => NotificationMetrics::record_dispatched(),
                Err(e) => {
                    tracing::error!(requester = %requester, error = %e, "Notification dispatch failed");
                    NotificationMetrics::record_failure("dispatch");
                }
            }
        });
    }
}

/// Builder for [`Allocator`].
pub struct AllocatorBuilder {
    store: Arc<dyn TransactionalStore>,
    codes: Arc<dyn CodeGenerator>,
    clock: Arc<dyn Clock>,
    dispatcher: Option<Arc<dyn NotificationDispatcher>>,
    directory: Arc<dyn RecipientDirectory>,
    config: AllocatorConfig,
}

impl AllocatorBuilder {
    /// Replace the code generator (default: [`RandomCodeGenerator`]).
    #[must_use]
    pub fn codes(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.codes = codes;
        self
    }

    /// Replace the clock (default: [`SystemClock`]).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Dispatch a notification after every issued voucher.
    ///
    /// Without a dispatcher, vouchers are issued silently.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Replace the recipient directory (default: [`IdentityDirectory`]).
    #[must_use]
    pub fn directory(mut self, directory: Arc<dyn RecipientDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: AllocatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish the allocator.
    #[must_use]
    pub fn build(self) -> Allocator {
        Allocator {
            store: self.store,
            codes: self.codes,
            clock: self.clock,
            dispatcher: self.dispatcher,
            directory: self.directory,
            config: self.config,
        }
    }
}
