//! Issued vouchers and their one-way redemption flag.

use crate::ids::{EventId, RequesterId, VoucherCode, VoucherId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned by [`Voucher::mark_used`] when the voucher was already redeemed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Voucher {0} has already been used")]
pub struct AlreadyUsed(pub VoucherId);

/// One unit of an event's capacity, identified by a unique code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// Voucher identifier
    pub id: VoucherId,
    /// Event this voucher was issued against
    pub event_id: EventId,
    /// Globally unique code handed to the recipient
    pub code: VoucherCode,
    /// Who requested the voucher
    pub recipient: RequesterId,
    /// Redemption flag; only ever moves from `false` to `true`
    used: bool,
    /// Issue timestamp
    pub created_at: DateTime<Utc>,
}

impl Voucher {
    /// Mint an unused voucher.
    #[must_use]
    pub fn issue(
        event_id: EventId,
        code: VoucherCode,
        recipient: RequesterId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: VoucherId::new(),
            event_id,
            code,
            recipient,
            used: false,
            created_at,
        }
    }

    /// Rebuild a voucher from persisted fields.
    #[must_use]
    pub const fn restore(
        id: VoucherId,
        event_id: EventId,
        code: VoucherCode,
        recipient: RequesterId,
        used: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_id,
            code,
            recipient,
            used,
            created_at,
        }
    }

    /// Whether the voucher has been redeemed.
    #[must_use]
    pub const fn is_used(&self) -> bool {
        self.used
    }

    /// Flip the voucher to used.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyUsed`] if the voucher was redeemed before; the flag is
    /// never reset.
    pub const fn mark_used(&mut self) -> Result<(), AlreadyUsed> {
        if self.used {
            return Err(AlreadyUsed(self.id));
        }
        self.used = true;
        Ok(())
    }
}
