//! Client metrics.
//!
//! Counters are registered in the default prometheus registry on first
//! access. The library never starts an exporter; the embedding process decides
//! how to expose them.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec};

lazy_static! {
    /// ops received from the server, by op kind
    pub static ref OPS_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "nats_client_ops_received",
        "count of ops received from the server",
        &["op"]
    ).unwrap();

    pub static ref MESSAGES_PUBLISHED: IntCounter = register_int_counter!(
        "nats_client_messages_published",
        "count of messages published"
    ).unwrap();

    /// payload bytes published, headers excluded
    pub static ref BYTES_PUBLISHED: IntCounter = register_int_counter!(
        "nats_client_bytes_published",
        "payload bytes published"
    ).unwrap();

    /// failed connection attempts against a single host
    pub static ref HOST_CONNECT_FAILURES: IntCounter = register_int_counter!(
        "nats_client_host_connect_failures",
        "count of failed connection attempts against a single host"
    ).unwrap();

    pub static ref RECONNECT_ATTEMPTS: IntCounter = register_int_counter!(
        "nats_client_reconnect_attempts",
        "count of automatic reconnect attempts"
    ).unwrap();

    /// messages dropped because a subscriber's buffer was full
    pub static ref SLOW_CONSUMER_DROPS: IntCounter = register_int_counter!(
        "nats_client_slow_consumer_drops",
        "count of messages dropped for slow consumers"
    ).unwrap();

    /// messages whose sid matched no live subscription
    pub static ref UNROUTED_MESSAGES: IntCounter = register_int_counter!(
        "nats_client_unrouted_messages",
        "count of messages received for unknown subscriptions"
    ).unwrap();

    pub static ref REQUEST_TIMEOUTS: IntCounter = register_int_counter!(
        "nats_client_request_timeouts",
        "count of requests that timed out"
    ).unwrap();
}
