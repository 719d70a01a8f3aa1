//! Recipient lookup against the `users` table.

use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use voucher_core::RequesterId;
use voucher_core::notify::{DirectoryError, Recipient, RecipientDirectory};

/// Resolves requester ids to the email stored in `users`.
#[derive(Clone, Debug)]
pub struct PostgresDirectory {
    pool: PgPool,
}

impl PostgresDirectory {
    /// Create a directory over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register or replace `requester`'s address.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Lookup`] if the upsert fails.
    pub async fn upsert(&self, requester: &RequesterId, email: &str) -> Result<(), DirectoryError> {
        sqlx::query(
            r"
            INSERT INTO users (id, email) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET email = EXCLUDED.email
            ",
        )
        .bind(requester.as_str())
        .bind(email)
        .execute(&self.pool)
        .await
        .map_err(|e| DirectoryError::Lookup(format!("Failed to store user: {e}")))?;
        Ok(())
    }
}

impl RecipientDirectory for PostgresDirectory {
    fn resolve<'a>(
        &'a self,
        requester: &'a RequesterId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Recipient>, DirectoryError>> + Send + 'a>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT email FROM users WHERE id = $1")
                .bind(requester.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DirectoryError::Lookup(format!("Failed to get user: {e}")))?;

            row.map(|row| {
                row.try_get::<String, _>("email")
                    .map(Recipient::new)
                    .map_err(|e| DirectoryError::Lookup(e.to_string()))
            })
            .transpose()
        })
    }
}
