// ==== Producer metrics ====
/// Counter for delivery reports, labelled by `status` (success, error)
pub const PRODUCER_DELIVERIES: &str = "message_bus_producer_deliveries_total";

/// Counter for sends that found the client buffer full and had to wait
pub const PRODUCER_QUEUE_FULL: &str = "message_bus_producer_queue_full_total";

/// Gauge for records waiting in the local producer queue
pub const PRODUCER_QUEUE_DEPTH: &str = "message_bus_producer_queue_depth";

// ==== Consumer metrics ====
/// Counter for records handled successfully, labelled by `handler`
pub const CONSUMER_MESSAGES_HANDLED: &str = "message_bus_consumer_messages_handled_total";

/// Counter for handler failures, labelled by `handler`
pub const CONSUMER_HANDLER_ERRORS: &str = "message_bus_consumer_handler_errors_total";

/// Counter for group sessions that completed setup, labelled by `handler`
pub const CONSUMER_SESSIONS: &str = "message_bus_consumer_sessions_total";

/// Counter for consume loop and client errors, labelled by `level` and `error`
pub const CONSUMER_ERRORS: &str = "message_bus_consumer_errors_total";

/// Gauge for consumers whose current session is ready, labelled by `handler`
pub const CONSUMER_READY: &str = "message_bus_consumer_ready";

/// Counter for rebalance callbacks with no partitions, labelled by `event_type`
pub const REBALANCE_EMPTY: &str = "message_bus_rebalance_empty_total";
