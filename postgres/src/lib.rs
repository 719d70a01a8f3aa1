//! `PostgreSQL` backend for Voucher Desk.
//!
//! Provides [`PostgresStore`], a [`TransactionalStore`](voucher_core::TransactionalStore)
//! with serializable transactions and version-checked updates, and
//! [`PostgresDirectory`], which resolves requesters to email addresses.
//!
//! # Example
//!
//! ```ignore
//! use voucher_postgres::{PostgresDirectory, PostgresStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::connect("postgres://localhost/vouchers").await?;
//!     store.migrate().await?;
//!     let directory = PostgresDirectory::new(store.pool().clone());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
pub mod store;

pub use directory::PostgresDirectory;
pub use store::PostgresStore;
