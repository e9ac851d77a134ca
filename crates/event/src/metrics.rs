//! Bus delivery metrics.

use lazy_static::lazy_static;
use prometheus::IntCounter;

fn register_int_counter_best_effort(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help)
        .unwrap_or_else(|_| IntCounter::new("kestrel_invalid_counter", "Invalid").unwrap());
    let _ = prometheus::register(Box::new(counter.clone()));
    counter
}

lazy_static! {
    /// Events dropped because a subscriber queue was full.
    pub static ref EVENT_DROPPED_TOTAL: IntCounter = register_int_counter_best_effort(
        "kestrel_event_dropped_total",
        "Events dropped due to full subscriber queues",
    );
}
