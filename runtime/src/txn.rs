//! Shared plumbing for running one unit of work per attempt under a bounded
//! retry policy.

use crate::retry::{RetryError, RetryPolicy, retry_with_predicate};
use std::fmt;
use std::future::Future;
use voucher_core::store::Transaction;
use voucher_core::StoreError;

/// Failure of a single attempt.
#[derive(Debug)]
pub(crate) enum StepError {
    /// The document the operation targets does not exist.
    Missing,
    /// The store failed.
    Store(StoreError),
}

impl From<StoreError> for StepError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("document not found"),
            Self::Store(error) => error.fmt(f),
        }
    }
}

impl StepError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_transient())
    }
}

/// Final failure after the retry loop.
#[derive(Debug)]
pub(crate) enum Failure {
    Missing,
    Exhausted { attempts: u32, last_error: StoreError },
    Store(StoreError),
}

/// What an attempt decided to do with its transaction.
pub(crate) enum Staged<T> {
    /// Writes were staged; commit them.
    Commit(T),
    /// Nothing to write; abort.
    Discard(T),
}

/// Commit or abort `tx` according to `staged`.
///
/// The transaction is always finished: errors raised while staging abort it.
pub(crate) async fn finish<T>(
    tx: Box<dyn Transaction>,
    staged: Result<Staged<T>, StepError>,
) -> Result<T, StepError> {
    match staged {
        Ok(Staged::Commit(value)) => {
            tx.commit().await?;
            Ok(value)
        }
        Ok(Staged::Discard(value)) => {
            tx.abort().await;
            Ok(value)
        }
        Err(error) => {
            tx.abort().await;
            Err(error)
        }
    }
}

/// Run `attempt` until it succeeds, fails permanently, or the policy's attempt
/// ceiling is reached. Only store conflicts are retried.
pub(crate) async fn run_bounded<T, F, Fut>(policy: &RetryPolicy, attempt: F) -> Result<T, Failure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    retry_with_predicate(policy, attempt, StepError::is_transient)
        .await
        .map_err(|error| match error {
            RetryError::Exhausted {
                attempts,
                last_error: StepError::Store(last_error),
            } => Failure::Exhausted {
                attempts,
                last_error,
            },
            RetryError::Rejected {
                error: StepError::Store(error),
                ..
            } => Failure::Store(error),
            RetryError::Exhausted {
                last_error: StepError::Missing,
                ..
            }
            | RetryError::Rejected {
                error: StepError::Missing,
                ..
            } => Failure::Missing,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use voucher_core::store::Collection;

    fn conflict() -> StoreError {
        StoreError::WriteConflict {
            collection: Collection::Events,
            id: "e".to_string(),
        }
    }

    #[tokio::test]
    async fn conflicts_are_retried_up_to_the_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Failure> = run_bounded(&RetryPolicy::immediate(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::Store(conflict())) }
        })
        .await;

        assert!(matches!(
            result,
            Err(Failure::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_document_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Failure> = run_bounded(&RetryPolicy::immediate(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::Missing) }
        })
        .await;

        assert!(matches!(result, Err(Failure::Missing)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_store_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Failure> = run_bounded(&RetryPolicy::immediate(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::Store(StoreError::Unavailable("down".into()))) }
        })
        .await;

        assert!(matches!(result, Err(Failure::Store(StoreError::Unavailable(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
