//! Application builder.
//!
//! Wires the runtime components to a store, a recipient directory, a mailer and
//! a clock. Anything not supplied explicitly is derived from [`Config`]:
//!
//! - `DATABASE_URL` set: [`PostgresStore`] (migrated unless disabled) and
//!   [`PostgresDirectory`]
//! - otherwise: [`InMemoryStore`] and [`IdentityDirectory`]
//!
//! # Example
//!
//! ```rust,ignore
//! let app = AppBuilder::new(Config::from_env())
//!     .with_mailer(Arc::new(ConsoleMailer))
//!     .build()
//!     .await?;
//!
//! let outcome = app.allocator.allocate(event_id, &requester).await?;
//! let stats = app.shutdown().await?;
//! ```

use crate::config::Config;
use crate::mailer::ConsoleMailer;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use voucher_core::environment::{Clock, SystemClock};
use voucher_core::notify::RecipientDirectory;
use voucher_core::{StoreError, TransactionalStore};
use voucher_postgres::{PostgresDirectory, PostgresStore};
use voucher_runtime::metrics::{MetricsError, MetricsServer};
use voucher_runtime::notify::DeliveryStats;
use voucher_runtime::{
    Allocator, Catalog, IdentityDirectory, LeaseManager, Mailer, Redeemer, notification_queue,
};
use voucher_testing::InMemoryStore;

/// Errors raised while starting or stopping the application.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The database pool could not be created.
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    /// Store setup (migrations) failed.
    #[error("Store setup failed: {0}")]
    Store(#[from] StoreError),

    /// The metrics recorder could not be installed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// The notification worker panicked or was cancelled.
    #[error("Notification worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// The tracing subscriber could not be installed.
    #[error("Tracing setup failed: {0}")]
    Tracing(String),
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured log level.
///
/// # Errors
///
/// Returns [`BootstrapError::Tracing`] if a subscriber is already installed.
pub fn init_tracing(config: &Config) -> Result<(), BootstrapError> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| BootstrapError::Tracing(e.to_string()))
}

/// Builder for [`VoucherApp`].
pub struct AppBuilder {
    config: Config,
    store: Option<Arc<dyn TransactionalStore>>,
    directory: Option<Arc<dyn RecipientDirectory>>,
    mailer: Option<Arc<dyn Mailer>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AppBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            directory: None,
            mailer: None,
            clock: None,
        }
    }

    /// Use `store` instead of the one the configuration selects.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn TransactionalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `directory` to resolve requester addresses.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn RecipientDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Deliver notifications through `mailer` (default: [`ConsoleMailer`]).
    #[must_use]
    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Replace the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Connect resources, start the notification worker and assemble the
    /// components.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if the database, migrations or metrics
    /// recorder fail to initialise.
    pub async fn build(self) -> Result<VoucherApp, BootstrapError> {
        let Self {
            config,
            store,
            directory,
            mailer,
            clock,
        } = self;

        let (store, default_directory) = match store {
            Some(store) => (store, None),
            None => connect_store(&config).await?,
        };
        let directory = directory
            .or(default_directory)
            .unwrap_or_else(|| Arc::new(IdentityDirectory));
        let mailer = mailer.unwrap_or_else(|| Arc::new(ConsoleMailer));
        let clock: Arc<dyn Clock> = clock.unwrap_or_else(|| Arc::new(SystemClock));

        let metrics = if config.server.metrics_enabled {
            let mut server = MetricsServer::new(config.server.metrics_addr);
            server.start()?;
            Some(server)
        } else {
            None
        };

        let (dispatcher, worker) = notification_queue(
            config.notifications.queue_capacity,
            mailer,
            config.notifications.retry.policy(),
        );
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let worker = tokio::spawn(worker.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        let allocator = Allocator::builder(Arc::clone(&store))
            .clock(Arc::clone(&clock))
            .dispatcher(Arc::new(dispatcher))
            .directory(directory)
            .config(config.allocator_config())
            .build();
        let leases = LeaseManager::new(Arc::clone(&store), config.lease_config())
            .with_clock(Arc::clone(&clock));
        let redeemer = Redeemer::new(Arc::clone(&store), config.allocation.policy());
        let catalog = Catalog::new(Arc::clone(&store)).with_clock(clock);

        tracing::info!(
            queue_capacity = config.notifications.queue_capacity,
            max_attempts = config.allocation.max_attempts,
            lease_secs = config.lease.duration_secs,
            "Voucher desk ready"
        );

        Ok(VoucherApp {
            allocator,
            leases,
            redeemer,
            catalog,
            store,
            metrics,
            worker,
            shutdown_tx,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }
}

async fn connect_store(
    config: &Config,
) -> Result<(Arc<dyn TransactionalStore>, Option<Arc<dyn RecipientDirectory>>), BootstrapError> {
    let Some(url) = config.database.url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using the in-memory store");
        return Ok((Arc::new(InMemoryStore::new()), None));
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout))
        .connect(url)
        .await?;
    let store = PostgresStore::from_pool(pool.clone());
    if config.database.run_migrations {
        store.migrate().await?;
    }
    tracing::info!(
        max_connections = config.database.max_connections,
        "Connected to PostgreSQL"
    );

    Ok((
        Arc::new(store),
        Some(Arc::new(PostgresDirectory::new(pool))),
    ))
}

/// A running voucher desk.
pub struct VoucherApp {
    /// Issues vouchers
    pub allocator: Allocator,
    /// Arbitrates the edit lease
    pub leases: LeaseManager,
    /// Redeems vouchers
    pub redeemer: Redeemer,
    /// Creates and reads events and vouchers
    pub catalog: Catalog,
    /// Backing store
    pub store: Arc<dyn TransactionalStore>,
    metrics: Option<MetricsServer>,
    worker: JoinHandle<DeliveryStats>,
    shutdown_tx: oneshot::Sender<()>,
    shutdown_timeout: Duration,
}

impl VoucherApp {
    /// Current metrics in Prometheus text format, if this app installed the
    /// recorder.
    #[must_use]
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().and_then(MetricsServer::render)
    }

    /// Stop accepting notifications and wait for the queue to drain.
    ///
    /// Jobs still queued when the shutdown timeout elapses are dropped. Clones of
    /// the allocator held elsewhere keep the queue open until then.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Worker`] if the notification worker panicked.
    pub async fn shutdown(self) -> Result<DeliveryStats, BootstrapError> {
        let Self {
            allocator,
            mut worker,
            shutdown_tx,
            shutdown_timeout,
            ..
        } = self;
        drop(allocator);

        let stats = if let Ok(joined) = tokio::time::timeout(shutdown_timeout, &mut worker).await {
            joined?
        } else {
            tracing::warn!(
                timeout_secs = shutdown_timeout.as_secs(),
                "Notification queue did not drain in time"
            );
            let _ = shutdown_tx.send(());
            worker.await?
        };

        tracing::info!(
            delivered = stats.delivered,
            failed = stats.failed,
            "Voucher desk stopped"
        );
        Ok(stats)
    }
}
