//! # nats-wire
//!
//! Codec for the NATS client protocol: CRLF-delimited control lines with
//! length-prefixed binary payloads.
//!
//! This library provides:
//! - **Op decoder** ([`OpCodec`]) turning a partial-read byte stream into
//!   [`Op`]s (`INFO`, `MSG`, `HMSG`, `PING`, `PONG`, `+OK`, `-ERR`).
//! - **Command encoders** ([`encode`]) for `CONNECT`, `PUB`, `HPUB`, `SUB`,
//!   `UNSUB`, `PING` and `PONG`.
//! - **Payload models** for the server [`ServerInfo`], the client
//!   [`Connect`] body and message [`HeaderMap`]s.
//! - **Subject helpers** for validation and wildcard matching.
//!
//! Nothing here performs I/O; the client crate drives the codec over its
//! transport.

pub mod decode;
pub mod encode;
pub mod error;
pub mod headers;
pub mod info;
pub mod op;
pub mod subject;

pub use decode::OpCodec;
pub use error::{WireError, WireResult};
pub use headers::HeaderMap;
pub use info::{Connect, ServerInfo};
pub use op::{MsgOp, Op};
