//! Configuration management for Voucher Desk.
//!
//! Loads configuration from environment variables with sensible defaults. A
//! `.env` file is honoured by the binaries through `dotenvy`.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use voucher_runtime::{AllocatorConfig, LeaseConfig, RetryPolicy};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `PostgreSQL` configuration
    pub database: DatabaseConfig,
    /// Retry bound for allocation, redemption and lease transactions
    pub allocation: RetryConfig,
    /// Edit lease configuration
    pub lease: LeaseSettings,
    /// Notification delivery configuration
    pub notifications: NotificationConfig,
    /// Process-level settings
    pub server: ServerConfig,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL; without one the in-memory store is used
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Run migrations on startup
    pub run_migrations: bool,
}

/// Bounded retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Cap on the delay between retries, in milliseconds
    pub max_delay_ms: u64,
}

/// Edit lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSettings {
    /// Lease lifetime in seconds
    pub duration_secs: i64,
}

/// Notification delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Undelivered notifications held before `dispatch` starts failing
    pub queue_capacity: usize,
    /// Retry bound for a single delivery
    pub retry: RetryConfig,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Log filter used when `RUST_LOG` is not set
    pub log_level: String,
    /// Address the Prometheus scrape endpoint is advertised on
    pub metrics_addr: SocketAddr,
    /// Install the Prometheus recorder on startup
    pub metrics_enabled: bool,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Missing or unparsable values fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
                max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10),
                connect_timeout: parse_or(&lookup, "DATABASE_CONNECT_TIMEOUT", 30),
                run_migrations: parse_or(&lookup, "DATABASE_RUN_MIGRATIONS", true),
            },
            allocation: RetryConfig {
                max_attempts: parse_or(&lookup, "ALLOCATION_MAX_ATTEMPTS", 3),
                initial_delay_ms: parse_or(&lookup, "ALLOCATION_INITIAL_DELAY_MS", 10),
                max_delay_ms: parse_or(&lookup, "ALLOCATION_MAX_DELAY_MS", 250),
            },
            lease: LeaseSettings {
                duration_secs: parse_or(&lookup, "LEASE_DURATION_SECS", 300),
            },
            notifications: NotificationConfig {
                queue_capacity: parse_or(&lookup, "NOTIFY_QUEUE_CAPACITY", 1024),
                retry: RetryConfig {
                    max_attempts: parse_or(&lookup, "NOTIFY_MAX_ATTEMPTS", 5),
                    initial_delay_ms: parse_or(&lookup, "NOTIFY_INITIAL_DELAY_MS", 100),
                    max_delay_ms: parse_or(&lookup, "NOTIFY_MAX_DELAY_MS", 5_000),
                },
            },
            server: ServerConfig {
                log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                metrics_addr: parse_or(
                    &lookup,
                    "METRICS_ADDR",
                    SocketAddr::from(([0, 0, 0, 0], 9090)),
                ),
                metrics_enabled: parse_or(&lookup, "METRICS_ENABLED", true),
                shutdown_timeout: parse_or(&lookup, "SHUTDOWN_TIMEOUT", 30),
            },
        }
    }

    /// Allocator settings derived from this configuration.
    #[must_use]
    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            retry: self.allocation.policy(),
        }
    }

    /// Lease manager settings derived from this configuration.
    #[must_use]
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            duration: TimeDelta::try_seconds(self.lease.duration_secs.max(1))
                .unwrap_or_else(|| TimeDelta::minutes(5)),
            retry: self.allocation.policy(),
        }
    }

    /// Graceful shutdown timeout.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl RetryConfig {
    /// The retry policy these settings describe.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .build()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            default
        }),
        None => default,
    }
}
