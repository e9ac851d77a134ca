//! Typed in-process event bus.
//!
//! Subscribers select events by Rust type rather than by topic string.
//! Every subscriber owns a bounded delivery queue; a slow subscriber only
//! ever loses its own events. Posting never blocks on a subscriber.

mod bus;
mod metrics;

pub use bus::{EventBus, TypedSubscription};
pub use metrics::EVENT_DROPPED_TOTAL;

use thiserror::Error;

/// Errors surfaced by the event bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus has been closed; no further posts or subscriptions.
    #[error("event bus is closed")]
    Closed,
}
