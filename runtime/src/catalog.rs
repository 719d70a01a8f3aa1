//! Event creation and read access.

use crate::error::CatalogError;
use std::sync::Arc;
use voucher_core::environment::{Clock, SystemClock};
use voucher_core::{Event, EventId, TransactionalStore, Voucher, VoucherId};

/// Shortest accepted event name, after trimming.
pub const MIN_NAME_LEN: usize = 2;

/// Longest accepted event name, after trimming.
pub const MAX_NAME_LEN: usize = 100;

/// Creates events and reads events and vouchers.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn TransactionalStore>,
    clock: Arc<dyn Clock>,
}

impl Catalog {
    /// Create a catalog using the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create an event with `capacity` vouchers, none issued and no lease.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::Validation`] if the trimmed name is not 2 to 100
    ///   characters long or `capacity` is zero
    /// - [`CatalogError::Store`] if the insert fails
    #[tracing::instrument(skip(self), name = "create_event")]
    pub async fn create_event(&self, name: &str, capacity: u32) -> Result<Event, CatalogError> {
        let name = name.trim();
        let len = name.chars().count();
        if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) {
            return Err(CatalogError::Validation(format!(
                "name must be {MIN_NAME_LEN} to {MAX_NAME_LEN} characters, got {len}"
            )));
        }
        if capacity == 0 {
            return Err(CatalogError::Validation(
                "capacity must be at least 1".to_string(),
            ));
        }

        let event = Event::new(name, capacity, self.clock.now());
        let mut tx = self.store.begin().await?;
        if let Err(e) = tx.insert_event(event.clone()).await {
            tx.abort().await;
            return Err(e.into());
        }
        tx.commit().await?;

        tracing::info!(event_id = %event.id, capacity, "Event created");
        Ok(event)
    }

    /// Fetch one event.
    ///
    /// # Errors
    ///
    /// [`CatalogError::EventNotFound`] if absent, [`CatalogError::Store`] on failure.
    pub async fn get_event(&self, id: EventId) -> Result<Event, CatalogError> {
        let mut tx = self.store.begin().await?;
        let found = tx.get_event(id).await;
        tx.abort().await;
        found?.ok_or(CatalogError::EventNotFound(id))
    }

    /// Every event, oldest first.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Store`] on failure.
    pub async fn list_events(&self) -> Result<Vec<Event>, CatalogError> {
        Ok(self.store.list_events().await?)
    }

    /// Fetch one voucher.
    ///
    /// # Errors
    ///
    /// [`CatalogError::VoucherNotFound`] if absent, [`CatalogError::Store`] on failure.
    pub async fn get_voucher(&self, id: VoucherId) -> Result<Voucher, CatalogError> {
        let mut tx = self.store.begin().await?;
        let found = tx.get_voucher(id).await;
        tx.abort().await;
        found?.ok_or(CatalogError::VoucherNotFound(id))
    }

    /// Every voucher, oldest first.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Store`] on failure.
    pub async fn list_vouchers(&self) -> Result<Vec<Voucher>, CatalogError> {
        Ok(self.store.list_vouchers(None).await?)
    }

    /// Vouchers issued for `event_id`, oldest first.
    ///
    /// # Errors
    ///
    /// [`CatalogError::EventNotFound`] if the event does not exist,
    /// [`CatalogError::Store`] on failure.
    pub async fn vouchers_for_event(&self, event_id: EventId) -> Result<Vec<Voucher>, CatalogError> {
        self.get_event(event_id).await?;
        Ok(self.store.list_vouchers(Some(event_id)).await?)
    }
}
