//! Transactional document store abstraction.
//!
//! The core never talks to a database directly. It opens a [`Transaction`], reads
//! the documents it needs, stages writes, and commits. The store provides
//! optimistic concurrency: if another writer changed a document this transaction
//! read, `commit` fails with a [`StoreErrorKind::Conflict`] error and nothing is
//! applied. Callers retry conflicts and give up immediately on anything
//! [`StoreErrorKind::Permanent`].
//!
//! # Implementations
//!
//! - `PostgresStore` (in `voucher-postgres`): serializable transactions with
//!   version-checked updates
//! - `InMemoryStore` (in `voucher-testing`): version validation at commit, with
//!   fault injection for tests
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the store
//! can be shared as `Arc<dyn TransactionalStore>` across request handlers.

use crate::event::Event;
use crate::ids::{EventId, VoucherId};
use crate::voucher::Voucher;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Document collections known to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Capacity-bounded events
    Events,
    /// Issued vouchers
    Vouchers,
}

impl Collection {
    /// Collection name as used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Vouchers => "vouchers",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a store failure is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// A concurrent writer interfered; the whole operation may be retried.
    Conflict,
    /// Retrying will not help.
    Permanent,
}

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A document read by this transaction was changed by someone else.
    #[error("Write conflict on {collection} {id}")]
    WriteConflict {
        /// Collection of the contended document.
        collection: Collection,
        /// Document id.
        id: String,
    },

    /// A uniqueness constraint rejected the write.
    ///
    /// Treated as a conflict: voucher codes are random, so a retry with a fresh
    /// code succeeds.
    #[error("Duplicate {field} in {collection}: {value}")]
    DuplicateKey {
        /// Collection the insert targeted.
        collection: Collection,
        /// Constrained field.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// An update targeted a document that does not exist.
    #[error("Document not found: {collection} {id}")]
    MissingDocument {
        /// Collection searched.
        collection: Collection,
        /// Document id.
        id: String,
    },

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored document could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The transaction was used after commit or abort.
    #[error("Transaction already finished")]
    TransactionClosed,
}

impl StoreError {
    /// Classify the failure for retry decisions.
    #[must_use]
    pub const fn kind(&self) -> StoreErrorKind {
        match self {
            Self::WriteConflict { .. } | Self::DuplicateKey { .. } => StoreErrorKind::Conflict,
            Self::MissingDocument { .. }
            | Self::Unavailable(_)
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::TransactionClosed => StoreErrorKind::Permanent,
        }
    }

    /// Shorthand for `kind() == StoreErrorKind::Conflict`.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), StoreErrorKind::Conflict)
    }
}

/// A unit of work against the store.
///
/// Reads observe a consistent snapshot; writes are staged and become visible
/// only on a successful [`commit`](Transaction::commit). Dropping a transaction
/// without committing discards its writes.
pub trait Transaction: Send {
    /// Read an event.
    fn get_event(&mut self, id: EventId) -> StoreFuture<'_, Option<Event>>;

    /// Read a voucher.
    fn get_voucher(&mut self, id: VoucherId) -> StoreFuture<'_, Option<Voucher>>;

    /// Stage a new event.
    fn insert_event(&mut self, event: Event) -> StoreFuture<'_, ()>;

    /// Stage a new voucher. Its `code` must be unique across all vouchers.
    fn insert_voucher(&mut self, voucher: Voucher) -> StoreFuture<'_, ()>;

    /// Stage a replacement of an event previously read in this transaction.
    fn update_event(&mut self, event: Event) -> StoreFuture<'_, ()>;

    /// Stage a replacement of a voucher previously read in this transaction.
    fn update_voucher(&mut self, voucher: Voucher) -> StoreFuture<'_, ()>;

    /// Atomically apply every staged write.
    ///
    /// # Errors
    ///
    /// A [`StoreErrorKind::Conflict`] error means nothing was applied and the
    /// operation may be retried from the start. Any other error is permanent.
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;

    /// Discard staged writes.
    fn abort(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Store that hands out [`Transaction`]s.
pub trait TransactionalStore: Send + Sync {
    /// Open a new transaction.
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>>;

    /// List every event, oldest first.
    fn list_events(&self) -> StoreFuture<'_, Vec<Event>>;

    /// List vouchers, optionally restricted to one event, oldest first.
    fn list_vouchers(&self, event_id: Option<EventId>) -> StoreFuture<'_, Vec<Voucher>>;
}
