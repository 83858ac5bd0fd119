//! Error types for wire protocol decoding and encoding.

use thiserror::Error;

/// Errors raised while parsing inbound ops or formatting outbound commands.
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying stream failure while reading ops.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The op marker at the head of the stream is not a known server op.
    #[error("unsupported op: '{0}'")]
    UnsupportedOp(String),

    /// Malformed op (wrong argument count, bad header block, ...).
    #[error("op parser error: {0}")]
    OpParser(String),

    /// A specific delimiter byte was required but something else arrived.
    #[error("op parser error: expected {expected} got {got}")]
    UnexpectedByte {
        expected: &'static str,
        got: String,
    },

    /// A length or status field did not contain a number.
    #[error("op parser error: {field} is not a number: '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    /// The stream ended while an op was only partially received.
    #[error("stream ended in the middle of an op")]
    UnexpectedEof,

    /// The protocol is single byte per character; non-ASCII text cannot be sent.
    #[error("{field} contains non-ASCII characters: {value:?}")]
    NonAscii { field: &'static str, value: String },

    /// A subject, sid, queue group or header field is empty or contains
    /// forbidden characters.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The INFO payload is not the expected JSON object.
    #[error("invalid INFO payload: {0}")]
    InvalidInfo(#[source] serde_json::Error),

    /// The CONNECT payload could not be serialized.
    #[error("failed to encode CONNECT: {0}")]
    Connect(#[source] serde_json::Error),
}

impl WireError {
    /// Returns true for errors caused by malformed or unrecognized inbound data.
    pub fn is_parser_error(&self) -> bool {
        matches!(
            self,
            WireError::UnsupportedOp(_)
                | WireError::OpParser(_)
                | WireError::UnexpectedByte { .. }
                | WireError::InvalidNumber { .. }
                | WireError::UnexpectedEof
                | WireError::InvalidInfo(_)
        )
    }

    /// Returns true for errors caused by caller-supplied outbound content.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            WireError::NonAscii { .. } | WireError::InvalidField { .. } | WireError::Connect(_)
        )
    }

    pub(crate) fn unexpected(expected: &'static str, got: u8) -> Self {
        WireError::UnexpectedByte {
            expected,
            got: describe_byte(got),
        }
    }
}

/// Shorthand result alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;

fn describe_byte(b: u8) -> String {
    match b {
        b'\r' => "CR".to_owned(),
        b'\n' => "LF".to_owned(),
        b' ' => "SPACE".to_owned(),
        b'\t' => "TAB".to_owned(),
        b if b.is_ascii_graphic() => format!("'{}'", b as char),
        b => format!("0x{b:02x}"),
    }
}
