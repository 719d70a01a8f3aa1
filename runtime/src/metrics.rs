//! Prometheus metrics for allocation, leases, redemption and notification delivery.
//!
//! Components record through the small recorder structs at the bottom of this
//! module. Nothing is exported unless a [`MetricsServer`] installs the
//! Prometheus recorder; without it the `metrics` macros are no-ops.
//!
//! # Example
//!
//! ```rust,no_run
//! use voucher_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder handle.
///
/// Installs the global recorder and renders the scrape text on demand.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the scrape endpoint is advertised on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), the call
    /// succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Advertised scrape address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Allocation
    describe_counter!(
        "voucher_allocations_total",
        "Allocation attempts by outcome (issued, exhausted, not_found, transient_failure, error)"
    );
    describe_counter!(
        "voucher_allocation_conflicts_total",
        "Store conflicts hit while allocating"
    );
    describe_histogram!(
        "voucher_allocation_duration_seconds",
        "Time taken to allocate a voucher, retries included"
    );

    // Leases
    describe_counter!(
        "event_lease_operations_total",
        "Lease operations by operation and outcome"
    );

    // Redemption
    describe_counter!(
        "voucher_redemptions_total",
        "Redemption attempts by outcome"
    );

    // Notifications
    describe_counter!(
        "voucher_notifications_dispatched_total",
        "Notifications handed to the delivery queue"
    );
    describe_counter!(
        "voucher_notifications_failed_total",
        "Notifications that could not be dispatched or delivered, by stage"
    );
    describe_counter!(
        "voucher_notifications_delivered_total",
        "Notifications delivered by the worker"
    );
}

/// Allocation metrics recorder.
pub struct AllocationMetrics;

impl AllocationMetrics {
    /// Record a finished allocation.
    pub fn record(outcome: &'static str, duration: Duration) {
        counter!("voucher_allocations_total", "outcome" => outcome).increment(1);
        histogram!("voucher_allocation_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a store conflict that triggered a retry.
    pub fn record_conflict() {
        counter!("voucher_allocation_conflicts_total").increment(1);
    }
}

/// Lease metrics recorder.
pub struct LeaseMetrics;

impl LeaseMetrics {
    /// Record a finished lease operation.
    pub fn record(operation: &'static str, outcome: &'static str) {
        counter!(
            "event_lease_operations_total",
            "operation" => operation,
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Redemption metrics recorder.
pub struct RedemptionMetrics;

impl RedemptionMetrics {
    /// Record a finished redemption.
    pub fn record(outcome: &'static str) {
        counter!("voucher_redemptions_total", "outcome" => outcome).increment(1);
    }
}

/// Notification metrics recorder.
pub struct NotificationMetrics;

impl NotificationMetrics {
    /// Record a notification accepted by the dispatcher.
    pub fn record_dispatched() {
        counter!("voucher_notifications_dispatched_total").increment(1);
    }

    /// Record a notification lost at `stage` (`resolve`, `dispatch` or `deliver`).
    pub fn record_failure(stage: &'static str) {
        counter!("voucher_notifications_failed_total", "stage" => stage).increment(1);
    }

    /// Record a delivered notification.
    pub fn record_delivered() {
        counter!("voucher_notifications_delivered_total").increment(1);
    }
}
