//! Error types for the NATS client.
//!
//! Expected failure modes (not connected, timeouts, no responders) are
//! distinct variants so callers can branch on them without string matching.

use std::io;
use std::time::Duration;

use nats_wire::WireError;
use thiserror::Error;

/// Top-level error type for the nats-client crate.
#[derive(Debug, Error)]
pub enum NatsError {
    /// The client has no live connection.
    #[error("client is not connected")]
    NotConnected,

    /// The client was disposed and can no longer be used.
    #[error("client has been disposed")]
    Disposed,

    /// The server demands authentication and no credentials were configured.
    #[error("server {host} requires credentials but none were supplied")]
    MissingCredentials { host: String },

    /// The server demands mutual TLS and no client certificate was configured.
    #[error("server {host} requires client certificates but none were configured")]
    MissingClientCertificates { host: String },

    /// Transport or handshake failure against one candidate host.
    #[error("failed to connect to {host}: {reason}")]
    FailedToConnectToHost { host: String, reason: String },

    /// Every candidate host failed.
    #[error("could not establish a connection to any of {attempted} host(s)")]
    CouldNotEstablishAnyConnection { attempted: usize },

    /// Outbound message is larger than the server-advertised `max_payload`.
    #[error("payload of {size} bytes exceeds server max_payload of {max} bytes")]
    ExceededMaxPayload { size: u64, max: u64 },

    /// Nothing was received from the server within the max-silence window.
    #[error("connection found idling: no data received for {silence:?}")]
    ConnectionFoundIdling { silence: Duration },

    /// The server sent `-ERR`.
    #[error("server sent -ERR: {0}")]
    ClientReceivedErrOp(String),

    /// Malformed inbound data or invalid outbound fields.
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// A request could not be registered for reply correlation.
    #[error("failed to initialize request: {0}")]
    InitRequest(String),

    #[error("request on '{subject}' timed out after {timeout:?}")]
    RequestTimedOut { subject: String, timeout: Duration },

    #[error("request on '{subject}' was cancelled")]
    RequestCancelled { subject: String },

    /// The server reported that nobody is subscribed to the request subject.
    #[error("no responders available for request on '{subject}'")]
    NoResponders { subject: String },

    /// The background reader stopped on a panic.
    #[error("connection reader panicked: {0}")]
    ReaderPanicked(String),

    /// The server closed the stream.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Usage error while building or registering a subscription.
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Several failures collected while tearing resources down.
    #[error("{} error(s) during teardown: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<NatsError>),
}

fn join_errors(errors: &[NatsError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl NatsError {
    /// Returns true if the operation gave up waiting (request timeout, idle
    /// connection or an I/O timeout).
    pub fn is_timeout(&self) -> bool {
        match self {
            NatsError::RequestTimedOut { .. } | NatsError::ConnectionFoundIdling { .. } => true,
            NatsError::Io(err) => err.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Returns true if the operation was cancelled before completing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NatsError::RequestCancelled { .. })
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, NatsError::NotConnected)
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, NatsError::Disposed)
    }

    /// Returns true for caller mistakes that retrying cannot fix.
    pub fn is_usage_error(&self) -> bool {
        match self {
            NatsError::InvalidSubscription(_) | NatsError::InvalidConfig(_) => true,
            NatsError::ExceededMaxPayload { .. } => true,
            NatsError::Protocol(err) => err.is_usage_error(),
            _ => false,
        }
    }
}

/// Shorthand result alias for client operations.
pub type NatsResult<T> = Result<T, NatsError>;

/// Collapse teardown errors: none is `Ok`, one is returned as is, several
/// become [`NatsError::Aggregate`].
pub(crate) fn aggregate(mut errors: Vec<NatsError>) -> NatsResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(NatsError::Aggregate(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = NatsError::RequestTimedOut {
            subject: "foo".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_cancelled());

        let cancelled = NatsError::RequestCancelled {
            subject: "foo".into(),
        };
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_timeout());

        assert!(NatsError::NotConnected.is_not_connected());
        assert!(!NatsError::NotConnected.is_disposed());
        assert!(NatsError::Disposed.is_disposed());
        assert!(!NatsError::Disposed.is_not_connected());

        let io_timeout = NatsError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(io_timeout.is_timeout());

        assert!(NatsError::InvalidSubscription("x".into()).is_usage_error());
        assert!(NatsError::ExceededMaxPayload { size: 2, max: 1 }.is_usage_error());
        assert!(!NatsError::ConnectionClosed.is_usage_error());
    }

    #[test]
    fn test_error_display() {
        let err = NatsError::ExceededMaxPayload { size: 10, max: 4 };
        let msg = err.to_string();
        assert!(msg.contains("10 bytes"));
        assert!(msg.contains("max_payload of 4"));

        let err = NatsError::Protocol(WireError::UnsupportedOp("FOO".into()));
        assert!(err.to_string().contains("'FOO'"));
    }

    #[test]
    fn test_aggregate() {
        assert!(aggregate(vec![]).is_ok());
        assert!(matches!(
            aggregate(vec![NatsError::ConnectionClosed]),
            Err(NatsError::ConnectionClosed)
        ));
        let err = aggregate(vec![NatsError::ConnectionClosed, NatsError::NotConnected]).unwrap_err();
        let NatsError::Aggregate(inner) = &err else {
            panic!("expected aggregate, got {err:?}");
        };
        assert_eq!(inner.len(), 2);
        assert!(err.to_string().starts_with("2 error(s) during teardown"));
    }
}
