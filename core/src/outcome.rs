//! Business outcomes of voucher operations.
//!
//! These are results, not errors: an exhausted event or an already-redeemed
//! voucher is an expected answer and is never retried.

use crate::ids::VoucherCode;
use crate::status::{EXHAUSTED, HttpStatus};
use crate::voucher::Voucher;
use serde::{Deserialize, Serialize};

/// Result of a successful allocation attempt sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocateOutcome {
    /// A voucher was committed.
    Issued(Voucher),
    /// The event had no capacity left.
    Exhausted {
        /// Configured maximum of the event
        capacity: u32,
    },
}

impl AllocateOutcome {
    /// The issued code, if any.
    #[must_use]
    pub const fn code(&self) -> Option<&VoucherCode> {
        match self {
            Self::Issued(voucher) => Some(&voucher.code),
            Self::Exhausted { .. } => None,
        }
    }

    /// `true` for [`AllocateOutcome::Issued`].
    #[must_use]
    pub const fn is_issued(&self) -> bool {
        matches!(self, Self::Issued(_))
    }
}

impl HttpStatus for AllocateOutcome {
    fn http_status(&self) -> u16 {
        match self {
            Self::Issued(_) => 200,
            Self::Exhausted { .. } => EXHAUSTED,
        }
    }
}

/// Result of redeeming a voucher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedeemOutcome {
    /// The voucher moved from unused to used.
    Redeemed,
    /// The voucher had been redeemed before.
    AlreadyUsed,
}

impl HttpStatus for RedeemOutcome {
    fn http_status(&self) -> u16 {
        match self {
            Self::Redeemed => 200,
            Self::AlreadyUsed => 409,
        }
    }
}
