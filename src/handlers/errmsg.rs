//! Response body constants for the pubsub handlers.
//!
//! Publish responses are plain text and deliberately terse; the reason a
//! publication was rejected is logged, not echoed to the caller.

/// Publication accepted.
pub const PUBLISH_OK: &str = "OK";

/// Publication rejected (missing field or broker failure).
pub const PUBLISH_NOT_OK: &str = "Not OK";

/// Subscription request without a category.
pub const SUBSCRIBE_NO_CATEGORY: &str = "subscription category missing";

/// Broker stopped while the subscriber was waiting.
pub const BROKER_SHUTTING_DOWN: &str = "broker shutting down";

/// Marker placed in a subscribe response when the wait timed out.
pub const SUBSCRIBE_TIMEOUT: &str = "no events before timeout";
