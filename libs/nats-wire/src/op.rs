//! Decoded server operations.

use std::fmt;

use bytes::Bytes;

use crate::headers::HeaderMap;

/// One decoded unit of the inbound protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// `INFO <json>`; carries the raw JSON text.
    Info(String),
    /// `+OK`
    Ok,
    /// `-ERR <text>`; carries the text as sent by the server.
    Err(String),
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
    /// `MSG <subject> <sid> [reply-to] <n>`
    Msg(MsgOp),
    /// `HMSG <subject> <sid> [reply-to] <hdr-n> <total-n>`; `headers` is always set.
    HMsg(MsgOp),
}

impl Op {
    /// The protocol marker for this op.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Info(_) => "INFO",
            Op::Ok => "+OK",
            Op::Err(_) => "-ERR",
            Op::Ping => "PING",
            Op::Pong => "PONG",
            Op::Msg(_) => "MSG",
            Op::HMsg(_) => "HMSG",
        }
    }

    /// Returns the message if this is a `MSG` or `HMSG`.
    pub fn as_msg(&self) -> Option<&MsgOp> {
        match self {
            Op::Msg(msg) | Op::HMsg(msg) => Some(msg),
            _ => None,
        }
    }

    /// Consumes the op, returning the message if this is a `MSG` or `HMSG`.
    pub fn into_msg(self) -> Option<MsgOp> {
        match self {
            Op::Msg(msg) | Op::HMsg(msg) => Some(msg),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Info(json) => write!(f, "INFO {json}"),
            Op::Err(text) => write!(f, "-ERR {text}"),
            Op::Msg(msg) | Op::HMsg(msg) => write!(
                f,
                "{} {} {} ({} bytes)",
                self.name(),
                msg.subject,
                msg.sid,
                msg.payload.len()
            ),
            other => f.write_str(other.name()),
        }
    }
}

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgOp {
    pub subject: String,
    /// Id of the subscription the server matched this message against.
    pub sid: String,
    pub reply_to: Option<String>,
    pub headers: Option<HeaderMap>,
    /// Exactly the number of bytes the server declared.
    pub payload: Bytes,
}

impl MsgOp {
    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// True for the status-only reply a server sends when a request has no
    /// subscribers on the other end.
    pub fn is_no_responders(&self) -> bool {
        self.payload.is_empty()
            && self
                .headers
                .as_ref()
                .is_some_and(|h| h.status() == Some(crate::headers::NO_RESPONDERS_STATUS))
    }
}
