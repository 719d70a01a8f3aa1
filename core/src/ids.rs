//! Identifier newtypes for events, vouchers and the callers acting on them.
//!
//! Event and voucher ids are UUIDs minted by this system. Requester and actor ids
//! are opaque strings handed in by the boundary layer: the core only insists they
//! are non-empty.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced when parsing or constructing an identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The text is not a valid UUID.
    #[error("Malformed {kind} id: {value}")]
    Malformed {
        /// Which identifier was being parsed.
        kind: &'static str,
        /// The offending input.
        value: String,
    },

    /// The identifier was empty or whitespace only.
    #[error("{kind} id must not be empty")]
    Empty {
        /// Which identifier was being constructed.
        kind: &'static str,
    },
}

/// Unique identifier for an event (the capacity-bounded resource).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random `EventId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EventId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| IdError::Malformed {
                kind: "event",
                value: s.to_string(),
            })
    }
}

/// Unique identifier for an issued voucher
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VoucherId(Uuid);

impl VoucherId {
    /// Creates a new random `VoucherId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `VoucherId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for VoucherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VoucherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VoucherId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| IdError::Malformed {
                kind: "voucher",
                value: s.to_string(),
            })
    }
}

/// Identity of whoever asked for a voucher.
///
/// Opaque to the core; it is stored as the voucher's recipient and later
/// resolved to a deliverable address by a `RecipientDirectory`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequesterId(String);

impl RequesterId {
    /// Create a requester id.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::Empty`] if `id` is empty or whitespace only.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdError::Empty { kind: "requester" });
        }
        Ok(Self(id))
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an actor competing for an event's edit lease.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    /// Create an actor id.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::Empty`] if `id` is empty or whitespace only.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdError::Empty { kind: "actor" });
        }
        Ok(Self(id))
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A voucher code, globally unique across every event.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VoucherCode(String);

impl VoucherCode {
    /// Wrap a generated code.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Borrow the code text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoucherCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn event_id_round_trips_through_display() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn malformed_event_id_is_rejected() {
        let err = "not-a-uuid".parse::<EventId>().unwrap_err();
        assert_eq!(
            err,
            IdError::Malformed {
                kind: "event",
                value: "not-a-uuid".to_string()
            }
        );
    }

    #[test]
    fn blank_caller_ids_are_rejected() {
        assert_eq!(
            RequesterId::new("  ").unwrap_err(),
            IdError::Empty { kind: "requester" }
        );
        assert_eq!(ActorId::new("").unwrap_err(), IdError::Empty { kind: "actor" });
        assert_eq!(ActorId::new("alice").unwrap().as_str(), "alice");
    }
}
