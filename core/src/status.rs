//! Mapping of core results onto the status codes the request layer replies with.

/// Status returned when an event has no capacity left.
///
/// Deliberately outside the standard HTTP range of meanings so clients can tell
/// exhaustion apart from every other failure.
pub const EXHAUSTED: u16 = 456;

/// Implemented by every outcome and error the core hands back to the boundary.
pub trait HttpStatus {
    /// Status code the boundary layer should reply with.
    fn http_status(&self) -> u16;
}
