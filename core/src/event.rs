//! The capacity-bounded event document.
//!
//! An [`Event`] carries two independently mutated concerns on one document:
//!
//! - `issued_count`, advanced by the allocator, never beyond `capacity`
//! - `lease`, the embedded edit lease managed by the lease manager
//!
//! Both are written through the same store transaction, so a lease update and a
//! concurrent issuance on the same event conflict at commit time instead of one
//! silently overwriting the other.

use crate::ids::EventId;
use crate::lease::Lease;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned by [`Event::record_issue`] when no capacity remains.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Capacity exhausted: {issued} of {capacity} vouchers issued")]
pub struct CapacityExhausted {
    /// Configured maximum for the event.
    pub capacity: u32,
    /// Vouchers issued so far.
    pub issued: u32,
}

/// A capacity-bounded event that vouchers are issued against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: EventId,
    /// Display name
    pub name: String,
    /// Maximum number of vouchers that may ever be issued
    pub capacity: u32,
    /// Vouchers issued so far (`issued_count <= capacity`)
    pub issued_count: u32,
    /// Current edit lease, if one was ever recorded and not released
    pub lease: Option<Lease>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create a fresh event with nothing issued and no lease.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: u32, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            capacity,
            issued_count: 0,
            lease: None,
            created_at,
        }
    }

    /// Vouchers still available.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.issued_count)
    }

    /// `true` once every voucher has been issued.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.issued_count >= self.capacity
    }

    /// Consume one unit of capacity.
    ///
    /// Returns the remaining capacity after the increment.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityExhausted`] without touching the count when
    /// `issued_count >= capacity`.
    pub const fn record_issue(&mut self) -> Result<u32, CapacityExhausted> {
        if self.is_exhausted() {
            return Err(CapacityExhausted {
                capacity: self.capacity,
                issued: self.issued_count,
            });
        }
        self.issued_count += 1;
        Ok(self.remaining())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn record_issue_stops_at_capacity() {
        let mut event = Event::new("Launch party", 2, Utc::now());

        assert_eq!(event.record_issue(), Ok(1));
        assert_eq!(event.record_issue(), Ok(0));
        assert!(event.is_exhausted());

        let err = event.record_issue().unwrap_err();
        assert_eq!(err, CapacityExhausted { capacity: 2, issued: 2 });
        assert_eq!(event.issued_count, 2);
    }

    #[test]
    fn remaining_never_underflows() {
        let mut event = Event::new("Oversold import", 1, Utc::now());
        event.issued_count = 5;
        assert_eq!(event.remaining(), 0);
    }

    #[test]
    fn event_serializes_with_embedded_lease() {
        let event = Event::new("Meetup", 10, Utc::now());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["capacity"], 10);
        assert_eq!(json["issued_count"], 0);
        assert!(json["lease"].is_null());
    }
}
