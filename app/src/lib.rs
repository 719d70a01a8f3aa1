//! # Voucher Desk
//!
//! Assembles the voucher desk from its parts:
//!
//! - [`config::Config`]: environment-driven settings
//! - [`bootstrap::AppBuilder`]: picks the store, starts the notification worker
//!   and wires allocator, lease manager, redeemer and catalog
//! - [`mailer::ConsoleMailer`]: development mail transport
//!
//! ```text
//!   allocate ──► Allocator ──► TransactionalStore (Postgres | in-memory)
//!                    │
//!                    └─► QueuedDispatcher ──► NotificationWorker ──► Mailer
//!
//!   acquire / release / maintain ──► LeaseManager ──► TransactionalStore
//! ```

pub mod bootstrap;
pub mod config;
pub mod mailer;

pub use bootstrap::{AppBuilder, BootstrapError, VoucherApp, init_tracing};
pub use config::Config;
pub use mailer::ConsoleMailer;
