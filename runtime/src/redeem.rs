//! Voucher redemption.

use crate::error::RedeemError;
use crate::metrics::RedemptionMetrics;
use crate::retry::RetryPolicy;
use crate::txn::{Failure, Staged, StepError, finish, run_bounded};
use std::sync::Arc;
use voucher_core::store::Transaction;
use voucher_core::{RedeemOutcome, TransactionalStore, VoucherId};

/// Marks vouchers as used.
///
/// The transition is one-way. Two concurrent redemptions of the same voucher
/// both read "unused"; the store lets only one commit, and the loser's retry
/// sees `used` and answers [`RedeemOutcome::AlreadyUsed`].
#[derive(Clone)]
pub struct Redeemer {
    store: Arc<dyn TransactionalStore>,
    retry: RetryPolicy,
}

impl Redeemer {
    /// Create a redeemer.
    #[must_use]
    pub fn new(store: Arc<dyn TransactionalStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Redeem `voucher_id`.
    ///
    /// # Errors
    ///
    /// - [`RedeemError::VoucherNotFound`] if the voucher does not exist
    /// - [`RedeemError::TransientFailure`] if every attempt conflicted
    /// - [`RedeemError::Internal`] on any other store failure
    #[tracing::instrument(skip(self), name = "redeem")]
    pub async fn redeem(&self, voucher_id: VoucherId) -> Result<RedeemOutcome, RedeemError> {
        let result = run_bounded(&self.retry, || self.attempt(voucher_id))
            .await
            .map_err(|failure| match failure {
                Failure::Missing => RedeemError::VoucherNotFound(voucher_id),
                Failure::Exhausted {
                    attempts,
                    last_error,
                } => RedeemError::TransientFailure {
                    attempts,
                    last_error,
                },
                Failure::Store(error) => RedeemError::Internal(error),
            });

        RedemptionMetrics::record(match &result {
            Ok(RedeemOutcome::Redeemed) => {
                tracing::info!("Voucher redeemed");
                "redeemed"
            }
            Ok(RedeemOutcome::AlreadyUsed) => "already_used",
            Err(RedeemError::VoucherNotFound(_)) => "not_found",
            Err(e) => {
                tracing::error!(error = %e, "Redemption failed");
                "error"
            }
        });
        result
    }

    async fn attempt(&self, voucher_id: VoucherId) -> Result<RedeemOutcome, StepError> {
        let mut tx = self.store.begin().await?;
        let staged = Self::stage(tx.as_mut(), voucher_id).await;
        finish(tx, staged).await
    }

    async fn stage(
        tx: &mut dyn Transaction,
        voucher_id: VoucherId,
    ) -> Result<Staged<RedeemOutcome>, StepError> {
        let mut voucher = tx
            .get_voucher(voucher_id)
            .await?
            .ok_or(StepError::Missing)?;

        if voucher.mark_used().is_err() {
            return Ok(Staged::Discard(RedeemOutcome::AlreadyUsed));
        }
        tx.update_voucher(voucher).await?;
        Ok(Staged::Commit(RedeemOutcome::Redeemed))
    }
}
