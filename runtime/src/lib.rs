//! # Voucher Desk Runtime
//!
//! Executes the decisions of `voucher-core` against a
//! [`TransactionalStore`](voucher_core::store::TransactionalStore).
//!
//! ## Components
//!
//! - [`allocator::Allocator`]: issues vouchers without ever exceeding an event's
//!   capacity, retrying store conflicts a bounded number of times
//! - [`lease::LeaseManager`]: acquire, release and maintain the edit lease
//!   embedded on an event
//! - [`redeem::Redeemer`]: one-way `unused -> used` transition of a voucher
//! - [`catalog::Catalog`]: event creation and read access
//! - [`notify`]: bounded notification queue and its delivery worker
//!
//! ## Example
//!
//! ```ignore
//! use voucher_runtime::allocator::Allocator;
//!
//! let allocator = Allocator::builder(store)
//!     .dispatcher(dispatcher)
//!     .directory(directory)
//!     .build();
//!
//! match allocator.allocate(event_id, &requester).await? {
//!     AllocateOutcome::Issued(voucher) => println!("issued {}", voucher.code),
//!     AllocateOutcome::Exhausted { capacity } => println!("all {capacity} gone"),
//! }
//! ```

/// Capacity-bounded voucher issuance.
pub mod allocator;

/// Event creation and read access.
pub mod catalog;

/// Random voucher code generation.
pub mod codegen;

/// Recipient directories that need no storage.
pub mod directory;

/// Edit lease execution.
pub mod lease;

/// Prometheus metrics.
pub mod metrics;

/// Notification queue and delivery worker.
pub mod notify;

/// Voucher redemption.
pub mod redeem;

/// Bounded retry with exponential backoff.
pub mod retry;

mod txn;

pub use allocator::{Allocator, AllocatorBuilder, AllocatorConfig};
pub use catalog::Catalog;
pub use codegen::RandomCodeGenerator;
pub use directory::IdentityDirectory;
pub use error::{AllocateError, CatalogError, LeaseError, RedeemError};
pub use lease::{LeaseConfig, LeaseManager};
pub use notify::{Mailer, NotificationWorker, QueuedDispatcher, notification_queue};
pub use redeem::Redeemer;
pub use retry::RetryPolicy;

/// Error types for runtime operations.
///
/// Business outcomes (exhausted, conflict, forbidden, already used) are not
/// errors; they are returned as `Ok` outcome enums. These types cover missing
/// documents and store failures.
pub mod error {
    use thiserror::Error;
    use voucher_core::status::HttpStatus;
    use voucher_core::{EventId, StoreError, VoucherId};

    /// Errors from [`Allocator::allocate`](crate::allocator::Allocator::allocate).
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum AllocateError {
        /// The event does not exist.
        #[error("Event not found: {0}")]
        EventNotFound(EventId),

        /// Every attempt hit a store conflict.
        #[error("Allocation failed after {attempts} attempts: {last_error}")]
        TransientFailure {
            /// Attempts made
            attempts: u32,
            /// Conflict seen on the final attempt
            last_error: StoreError,
        },

        /// The store failed in a way retrying cannot fix.
        #[error("Allocation failed: {0}")]
        Internal(#[source] StoreError),
    }

    /// Errors from [`LeaseManager`](crate::lease::LeaseManager) operations.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum LeaseError {
        /// The event does not exist.
        #[error("Event not found: {0}")]
        EventNotFound(EventId),

        /// Every attempt hit a store conflict.
        #[error("Lease update failed after {attempts} attempts: {last_error}")]
        TransientFailure {
            /// Attempts made
            attempts: u32,
            /// Conflict seen on the final attempt
            last_error: StoreError,
        },

        /// The store failed in a way retrying cannot fix.
        #[error("Lease update failed: {0}")]
        Internal(#[source] StoreError),
    }

    /// Errors from [`Redeemer::redeem`](crate::redeem::Redeemer::redeem).
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum RedeemError {
        /// The voucher does not exist.
        #[error("Voucher not found: {0}")]
        VoucherNotFound(VoucherId),

        /// Every attempt hit a store conflict.
        #[error("Redemption failed after {attempts} attempts: {last_error}")]
        TransientFailure {
            /// Attempts made
            attempts: u32,
            /// Conflict seen on the final attempt
            last_error: StoreError,
        },

        /// The store failed in a way retrying cannot fix.
        #[error("Redemption failed: {0}")]
        Internal(#[source] StoreError),
    }

    /// Errors from [`Catalog`](crate::catalog::Catalog) operations.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum CatalogError {
        /// Input rejected before touching the store.
        #[error("Validation failed: {0}")]
        Validation(String),

        /// The event does not exist.
        #[error("Event not found: {0}")]
        EventNotFound(EventId),

        /// The voucher does not exist.
        #[error("Voucher not found: {0}")]
        VoucherNotFound(VoucherId),

        /// Store failure.
        #[error("Catalog store failure: {0}")]
        Store(#[from] StoreError),
    }

    impl HttpStatus for AllocateError {
        fn http_status(&self) -> u16 {
            match self {
                Self::EventNotFound(_) => 404,
                Self::TransientFailure { .. } | Self::Internal(_) => 500,
            }
        }
    }

    impl HttpStatus for LeaseError {
        fn http_status(&self) -> u16 {
            match self {
                Self::EventNotFound(_) => 404,
                Self::TransientFailure { .. } | Self::Internal(_) => 500,
            }
        }
    }

    impl HttpStatus for RedeemError {
        fn http_status(&self) -> u16 {
            match self {
                Self::VoucherNotFound(_) => 404,
                Self::TransientFailure { .. } | Self::Internal(_) => 500,
            }
        }
    }

    impl HttpStatus for CatalogError {
        fn http_status(&self) -> u16 {
            match self {
                Self::Validation(_) => 400,
                Self::EventNotFound(_) | Self::VoucherNotFound(_) => 404,
                Self::Store(_) => 500,
            }
        }
    }

}
