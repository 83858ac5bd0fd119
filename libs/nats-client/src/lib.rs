//! # nats-client
//!
//! Async client for NATS-style publish/subscribe brokers.
//!
//! A [`NatsClient`] is built from a [`ConnectionInfo`] and connects to one of
//! its hosts (tried in random order), upgrading to TLS when the server asks
//! for it. Once connected it supports:
//! - fire-and-forget publishing, with optional reply subject and headers
//! - subscriptions as async streams or handler tasks, with queue groups and
//!   auto-unsubscribe after `max_messages`
//! - request/reply over a shared inbox or a temporary subscription per request
//! - observation of every received op and of lifecycle [`ClientEvent`]s
//! - optional auto-reconnect with exponential backoff, replaying registered
//!   subscriptions on the new connection
//!
//! ```no_run
//! # async fn run() -> nats_client::NatsResult<()> {
//! use nats_client::{ConnectionInfo, NatsClient};
//!
//! let client = NatsClient::new(ConnectionInfo::from_urls("nats://127.0.0.1:4222")?)?;
//! client.connect().await?;
//! let mut sub = client.subscribe("greet.*").await?;
//! client.publish("greet.joe", "hello").await?;
//! if let Some(msg) = sub.next().await {
//!     println!("{}: {:?}", msg.subject, msg.payload);
//! }
//! client.dispose().await?;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod config;
mod connection;
pub mod error;
pub mod events;
mod manager;
pub mod metrics;
mod request;
pub mod subscription;
mod transport;

pub use client::{ClientState, NatsClient};
pub use config::{
    ConnectionInfo, Credentials, Host, PubFlushMode, ReconnectPolicy, ServerCertificateContext,
    ServerCertificateValidator, SocketOptions, TlsOptions,
};
pub use error::{NatsError, NatsResult};
pub use events::{ClientEvent, DisconnectReason, EventStream, MessageStream, OpStream};
pub use subscription::{HandlerSubscription, Subscription, SubscriptionInfo};

pub use nats_wire::{HeaderMap, MsgOp, Op, ServerInfo};
