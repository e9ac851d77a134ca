//! RPC request metrics.

use lazy_static::lazy_static;
use prometheus::IntCounter;

fn register_int_counter_best_effort(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help)
        .unwrap_or_else(|_| IntCounter::new("kestrel_invalid_counter", "Invalid").unwrap());
    let _ = prometheus::register(Box::new(counter.clone()));
    counter
}

lazy_static! {
    /// Total RPC requests read from all transports.
    pub static ref RPC_REQUESTS_TOTAL: IntCounter =
        register_int_counter_best_effort("kestrel_rpc_requests_total", "Total RPC requests");

    /// Successful RPC responses.
    pub static ref RPC_SUCCESS_TOTAL: IntCounter =
        register_int_counter_best_effort("kestrel_rpc_success_total", "Successful RPC responses");

    /// Error RPC responses.
    pub static ref RPC_ERRORS_TOTAL: IntCounter =
        register_int_counter_best_effort("kestrel_rpc_errors_total", "Error RPC responses");
}
