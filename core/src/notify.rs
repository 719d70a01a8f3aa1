//! Notification capabilities consumed by the allocator.
//!
//! After a voucher commits, the allocator resolves the requester to a deliverable
//! address through a [`RecipientDirectory`] and hands the code to a
//! [`NotificationDispatcher`]. Both run detached from the request; their failures
//! are logged by the caller and never affect the issued voucher.

use crate::ids::{EventId, RequesterId, VoucherCode, VoucherId};
use crate::voucher::Voucher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A deliverable address (typically an email).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient(String);

impl Recipient {
    /// Wrap an address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Borrow the address.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload of a "your voucher has arrived" notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Voucher that was issued
    pub voucher_id: VoucherId,
    /// Event it was issued for
    pub event_id: EventId,
    /// Code to deliver
    pub code: VoucherCode,
}

impl From<&Voucher> for Notification {
    fn from(voucher: &Voucher) -> Self {
        Self {
            voucher_id: voucher.id,
            event_id: voucher.event_id,
            code: voucher.code.clone(),
        }
    }
}

/// Errors from handing a notification to the delivery subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The delivery queue is at capacity.
    #[error("Notification queue is full")]
    QueueFull,

    /// The delivery subsystem has shut down.
    #[error("Notification queue is closed")]
    Closed,
}

/// Fire-and-forget delivery of voucher codes.
pub trait NotificationDispatcher: Send + Sync {
    /// Request delivery of `notification` to `recipient`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if the request could not be accepted. Delivery
    /// itself happens later and is not reported back.
    fn dispatch(
        &self,
        recipient: Recipient,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + '_>>;
}

/// Errors from resolving a requester's address.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The lookup itself failed.
    #[error("Recipient lookup failed: {0}")]
    Lookup(String),
}

/// Resolves requester ids to deliverable addresses.
pub trait RecipientDirectory: Send + Sync {
    /// Look up the address of `requester`.
    ///
    /// Returns `Ok(None)` when the requester is unknown or has no address.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if the lookup could not be performed.
    fn resolve<'a>(
        &'a self,
        requester: &'a RequesterId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Recipient>, DirectoryError>> + Send + 'a>>;
}
