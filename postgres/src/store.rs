//! `PostgreSQL` implementation of [`TransactionalStore`].
//!
//! Every transaction runs at `SERIALIZABLE` isolation, and updates are guarded by
//! a per-row `version` column observed when the row was read. Either mechanism
//! can reject a racing writer; both surface as [`StoreError::WriteConflict`] so
//! the runtime retries them.
//!
//! | SQLSTATE | Meaning | Mapped to |
//! |---|---|---|
//! | `40001` | serialization failure | `WriteConflict` |
//! | `40P01` | deadlock detected | `WriteConflict` |
//! | `23505` | unique violation | `DuplicateKey` |
//! | pool / io errors | | `Unavailable` |

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;
use voucher_core::store::{Collection, StoreFuture, Transaction, TransactionalStore};
use voucher_core::{
    ActorId, Event, EventId, Lease, RequesterId, StoreError, Voucher, VoucherCode, VoucherId,
};

const EVENT_COLUMNS: &str =
    "id, name, capacity, issued_count, lease_holder, lease_expires_at, created_at, version";

const VOUCHER_COLUMNS: &str = "id, event_id, code, recipient, used, created_at, version";

/// Store backed by a `PostgreSQL` connection pool.
///
/// # Example
///
/// ```no_run
/// use voucher_postgres::PostgresStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresStore::connect("postgres://localhost/vouchers").await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the pool cannot be created.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `events`, `vouchers` and `users` tables if they are missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Voucher schema migrated");
        Ok(())
    }
}

impl TransactionalStore for PostgresStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn Transaction>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| classify(e, None))?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(|e| classify(e, None))?;
            Ok(Box::new(PostgresTransaction {
                tx: Some(tx),
                event_versions: HashMap::new(),
                voucher_versions: HashMap::new(),
            }) as Box<dyn Transaction>)
        })
    }

    fn list_events(&self) -> StoreFuture<'_, Vec<Event>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM events ORDER BY created_at, id"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(e, None))?;
            rows.iter().map(|row| decode_event(row).map(|(e, _)| e)).collect()
        })
    }

    fn list_vouchers(&self, event_id: Option<EventId>) -> StoreFuture<'_, Vec<Voucher>> {
        Box::pin(async move {
            let rows = match event_id {
                Some(event_id) => {
                    sqlx::query(&format!(
                        "SELECT {VOUCHER_COLUMNS} FROM vouchers WHERE event_id = $1 ORDER BY created_at, id"
                    ))
                    .bind(*event_id.as_uuid())
                    .fetch_all(&self.pool)
                    .await
                }
                None => {
                    sqlx::query(&format!(
                        "SELECT {VOUCHER_COLUMNS} FROM vouchers ORDER BY created_at, id"
                    ))
                    .fetch_all(&self.pool)
                    .await
                }
            }
            .map_err(|e| classify(e, None))?;
            rows.iter().map(|row| decode_voucher(row).map(|(v, _)| v)).collect()
        })
    }
}

struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    event_versions: HashMap<EventId, i64>,
    voucher_versions: HashMap<VoucherId, i64>,
}

impl PostgresTransaction {
    fn conn(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

impl Transaction for PostgresTransaction {
    fn get_event(&mut self, id: EventId) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
                .bind(*id.as_uuid())
                .fetch_optional(&mut **conn)
                .await
                .map_err(|e| classify(e, Some((Collection::Events, id.to_string()))))?;

            let Some(row) = row else {
                return Ok(None);
            };
            let (event, version) = decode_event(&row)?;
            self.event_versions.insert(id, version);
            Ok(Some(event))
        })
    }

    fn get_voucher(&mut self, id: VoucherId) -> StoreFuture<'_, Option<Voucher>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let row = sqlx::query(&format!(
                "SELECT {VOUCHER_COLUMNS} FROM vouchers WHERE id = $1"
            ))
            .bind(*id.as_uuid())
            .fetch_optional(&mut **conn)
            .await
            .map_err(|e| classify(e, Some((Collection::Vouchers, id.to_string()))))?;

            let Some(row) = row else {
                return Ok(None);
            };
            let (voucher, version) = decode_voucher(&row)?;
            self.voucher_versions.insert(id, version);
            Ok(Some(voucher))
        })
    }

    fn insert_event(&mut self, event: Event) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn()?;
            let (holder, expires_at) = lease_columns(event.lease.as_ref());
            sqlx::query(
                r"
                INSERT INTO events
                    (id, name, capacity, issued_count, lease_holder, lease_expires_at, created_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 1)
                ",
            )
            .bind(*event.id.as_uuid())
            .bind(&event.name)
            .bind(to_db_count(event.capacity)?)
            .bind(to_db_count(event.issued_count)?)
            .bind(holder)
            .bind(expires_at)
            .bind(event.created_at)
            .execute(&mut **conn)
            .await
            .map_err(|e| classify(e, Some((Collection::Events, event.id.to_string()))))?;

            self.event_versions.insert(event.id, 1);
            Ok(())
        })
    }

    fn insert_voucher(&mut self, voucher: Voucher) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn()?;
            sqlx::query(
                r"
                INSERT INTO vouchers (id, event_id, code, recipient, used, created_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, 1)
                ",
            )
            .bind(*voucher.id.as_uuid())
            .bind(*voucher.event_id.as_uuid())
            .bind(voucher.code.as_str())
            .bind(voucher.recipient.as_str())
            .bind(voucher.is_used())
            .bind(voucher.created_at)
            .execute(&mut **conn)
            .await
            .map_err(|e| classify(e, Some((Collection::Vouchers, voucher.code.to_string()))))?;

            self.voucher_versions.insert(voucher.id, 1);
            Ok(())
        })
    }

    fn update_event(&mut self, event: Event) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let expected = self.event_versions.get(&event.id).copied();
            let conn = self.conn()?;
            let (holder, expires_at) = lease_columns(event.lease.as_ref());
            let result = sqlx::query(
                r"
                UPDATE events
                SET name = $2,
                    capacity = $3,
                    issued_count = $4,
                    lease_holder = $5,
                    lease_expires_at = $6,
                    version = version + 1
                WHERE id = $1 AND ($7::BIGINT IS NULL OR version = $7)
                ",
            )
            .bind(*event.id.as_uuid())
            .bind(&event.name)
            .bind(to_db_count(event.capacity)?)
            .bind(to_db_count(event.issued_count)?)
            .bind(holder)
            .bind(expires_at)
            .bind(expected)
            .execute(&mut **conn)
            .await
            .map_err(|e| classify(e, Some((Collection::Events, event.id.to_string()))))?;

            if result.rows_affected() == 0 {
                return Err(if expected.is_some() {
                    StoreError::WriteConflict {
                        collection: Collection::Events,
                        id: event.id.to_string(),
                    }
                } else {
                    StoreError::MissingDocument {
                        collection: Collection::Events,
                        id: event.id.to_string(),
                    }
                });
            }
            if let Some(version) = expected {
                self.event_versions.insert(event.id, version + 1);
            }
            Ok(())
        })
    }

    fn update_voucher(&mut self, voucher: Voucher) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let expected = self.voucher_versions.get(&voucher.id).copied();
            let conn = self.conn()?;
            let result = sqlx::query(
                r"
                UPDATE vouchers
                SET used = $2,
                    version = version + 1
                WHERE id = $1 AND ($3::BIGINT IS NULL OR version = $3)
                ",
            )
            .bind(*voucher.id.as_uuid())
            .bind(voucher.is_used())
            .bind(expected)
            .execute(&mut **conn)
            .await
            .map_err(|e| classify(e, Some((Collection::Vouchers, voucher.id.to_string()))))?;

            if result.rows_affected() == 0 {
                return Err(if expected.is_some() {
                    StoreError::WriteConflict {
                        collection: Collection::Vouchers,
                        id: voucher.id.to_string(),
                    }
                } else {
                    StoreError::MissingDocument {
                        collection: Collection::Vouchers,
                        id: voucher.id.to_string(),
                    }
                });
            }
            if let Some(version) = expected {
                self.voucher_versions.insert(voucher.id, version + 1);
            }
            Ok(())
        })
    }

    fn commit(mut self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
            tx.commit().await.map_err(|e| classify(e, None))
        })
    }

    fn abort(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if let Some(tx) = self.tx.take() {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(error = %e, "Rollback failed");
                }
            }
        })
    }
}

/// Map a sqlx error onto the store's error classes.
///
/// `target` names the document involved, when known, for conflict reporting.
fn classify(error: sqlx::Error, target: Option<(Collection, String)>) -> StoreError {
    let (collection, id) = target.unwrap_or((Collection::Events, String::new()));
    match &error {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(sqlstate @ ("40001" | "40P01")) => {
                tracing::debug!(collection = %collection, id = %id, sqlstate, "Serialization conflict");
                metrics::counter!("voucher_store_conflicts_total", "sqlstate" => sqlstate.to_string())
                    .increment(1);
                StoreError::WriteConflict { collection, id }
            }
            Some("23505") => StoreError::DuplicateKey {
                collection,
                field: if db.constraint() == Some("vouchers_code_key") {
                    "code"
                } else {
                    "id"
                },
                value: id,
            },
            _ => StoreError::Database(error.to_string()),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(error.to_string())
        }
        _ => StoreError::Database(error.to_string()),
    }
}

fn decode_error(error: &sqlx::Error) -> StoreError {
    StoreError::Serialization(error.to_string())
}

fn to_db_count(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Serialization(format!("count {value} out of range")))
}

fn from_db_count(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Serialization(format!("negative count {value}")))
}

fn lease_columns(lease: Option<&Lease>) -> (Option<&str>, Option<DateTime<Utc>>) {
    lease.map_or((None, None), |lease| {
        (Some(lease.holder.as_str()), Some(lease.expires_at))
    })
}

fn decode_event(row: &PgRow) -> Result<(Event, i64), StoreError> {
    let id: Uuid = row.try_get("id").map_err(|e| decode_error(&e))?;
    let holder: Option<String> = row.try_get("lease_holder").map_err(|e| decode_error(&e))?;
    let expires_at: Option<DateTime<Utc>> =
        row.try_get("lease_expires_at").map_err(|e| decode_error(&e))?;

    let lease = match (holder, expires_at) {
        (Some(holder), Some(expires_at)) => Some(Lease {
            holder: ActorId::new(holder).map_err(|e| StoreError::Serialization(e.to_string()))?,
            expires_at,
        }),
        _ => None,
    };

    let event = Event {
        id: EventId::from_uuid(id),
        name: row.try_get("name").map_err(|e| decode_error(&e))?,
        capacity: from_db_count(row.try_get("capacity").map_err(|e| decode_error(&e))?)?,
        issued_count: from_db_count(row.try_get("issued_count").map_err(|e| decode_error(&e))?)?,
        lease,
        created_at: row.try_get("created_at").map_err(|e| decode_error(&e))?,
    };
    let version: i64 = row.try_get("version").map_err(|e| decode_error(&e))?;
    Ok((event, version))
}

fn decode_voucher(row: &PgRow) -> Result<(Voucher, i64), StoreError> {
    let id: Uuid = row.try_get("id").map_err(|e| decode_error(&e))?;
    let event_id: Uuid = row.try_get("event_id").map_err(|e| decode_error(&e))?;
    let code: String = row.try_get("code").map_err(|e| decode_error(&e))?;
    let recipient: String = row.try_get("recipient").map_err(|e| decode_error(&e))?;

    let voucher = Voucher::restore(
        VoucherId::from_uuid(id),
        EventId::from_uuid(event_id),
        VoucherCode::new(code),
        RequesterId::new(recipient).map_err(|e| StoreError::Serialization(e.to_string()))?,
        row.try_get("used").map_err(|e| decode_error(&e))?,
        row.try_get("created_at").map_err(|e| decode_error(&e))?,
    );
    let version: i64 = row.try_get("version").map_err(|e| decode_error(&e))?;
    Ok((voucher, version))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_unavailable() {
        assert!(matches!(
            classify(sqlx::Error::PoolTimedOut, None),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            classify(sqlx::Error::PoolClosed, None),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn other_errors_are_permanent() {
        let error = classify(sqlx::Error::RowNotFound, None);
        assert!(matches!(error, StoreError::Database(_)));
        assert!(!error.is_transient());
    }

    #[test]
    fn counts_outside_i32_are_rejected() {
        assert_eq!(to_db_count(7), Ok(7));
        assert!(to_db_count(u32::MAX).is_err());
        assert!(from_db_count(-1).is_err());
    }

    #[test]
    fn lease_columns_split_holder_and_expiry() {
        assert_eq!(lease_columns(None), (None, None));
        let now = Utc::now();
        let lease = Lease {
            holder: ActorId::new("alice").unwrap(),
            expires_at: now,
        };
        assert_eq!(lease_columns(Some(&lease)), (Some("alice"), Some(now)));
    }
}
