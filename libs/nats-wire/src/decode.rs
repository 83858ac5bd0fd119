//! Inbound op decoder.
//!
//! [`OpCodec`] is a `tokio_util` [`Decoder`]: it is fed whatever bytes the
//! transport produced and yields complete [`Op`]s, returning `Ok(None)` when
//! more input is needed. Message payload lengths are taken from the control
//! line and read exactly, so payloads may contain CR/LF freely.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::error::{WireError, WireResult};
use crate::headers::HeaderMap;
use crate::op::{MsgOp, Op};

/// Upper bound on a control line (INFO may carry a long connect_urls list).
pub const MAX_CONTROL_LINE: usize = 1024 * 1024;

/// Largest MSG/HMSG body accepted by [`OpCodec::new`].
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// No server op marker is longer than this.
const MAX_MARKER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Ok,
    Err,
    Ping,
    Pong,
    Info,
    Msg,
    HMsg,
}

impl Marker {
    fn parse(marker: &[u8]) -> Option<Self> {
        const MARKERS: &[(&[u8], Marker)] = &[
            (b"MSG", Marker::Msg),
            (b"HMSG", Marker::HMsg),
            (b"PING", Marker::Ping),
            (b"PONG", Marker::Pong),
            (b"+OK", Marker::Ok),
            (b"-ERR", Marker::Err),
            (b"INFO", Marker::Info),
        ];
        MARKERS
            .iter()
            .find(|(name, _)| marker.eq_ignore_ascii_case(name))
            .map(|(_, m)| *m)
    }
}

/// Control line of a MSG/HMSG whose payload has not fully arrived yet.
#[derive(Debug)]
struct PendingMsg {
    subject: String,
    sid: String,
    reply_to: Option<String>,
    /// `Some` for HMSG.
    header_len: Option<usize>,
    total_len: usize,
}

/// Stateful decoder turning a byte stream into [`Op`]s.
///
/// Must be driven by a single reader. A MSG/HMSG announcing a body larger
/// than the configured limit is rejected before any buffer is reserved.
#[derive(Debug)]
pub struct OpCodec {
    pending: Option<PendingMsg>,
    max_message_len: usize,
}

impl Default for OpCodec {
    fn default() -> Self {
        Self::with_max_payload(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl OpCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder rejecting message bodies (headers included) above `max` bytes.
    pub fn with_max_payload(max: usize) -> Self {
        Self {
            pending: None,
            max_message_len: max,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_message_len
    }

    /// Applies to control lines not yet read.
    pub fn set_max_payload(&mut self, max: usize) {
        self.max_message_len = max;
    }

    fn decode_payload(
        &mut self,
        pending: PendingMsg,
        src: &mut BytesMut,
    ) -> WireResult<Option<Op>> {
        let needed = pending.total_len.checked_add(2).ok_or_else(|| {
            WireError::OpParser(format!("message size {} overflows", pending.total_len))
        })?;
        if src.len() < needed {
            trace!(
                needed,
                buffered = src.len(),
                "waiting for remaining payload bytes"
            );
            src.reserve(needed - src.len());
            self.pending = Some(pending);
            return Ok(None);
        }

        let mut data = src.split_to(pending.total_len);
        if src[0] != b'\r' {
            return Err(WireError::unexpected("CR after payload", src[0]));
        }
        if src[1] != b'\n' {
            return Err(WireError::unexpected("LF after payload", src[1]));
        }
        src.advance(2);

        let headers = match pending.header_len {
            Some(header_len) => {
                let block = data.split_to(header_len);
                Some(HeaderMap::parse(&block)?)
            }
            None => None,
        };
        let is_hmsg = headers.is_some();
        let msg = MsgOp {
            subject: pending.subject,
            sid: pending.sid,
            reply_to: pending.reply_to,
            headers,
            payload: data.freeze(),
        };

        Ok(Some(if is_hmsg { Op::HMsg(msg) } else { Op::Msg(msg) }))
    }
}

impl Decoder for OpCodec {
    type Item = Op;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Op>, WireError> {
        loop {
            if let Some(pending) = self.pending.take() {
                return self.decode_payload(pending, src);
            }

            skip_blank(src);
            if src.is_empty() {
                return Ok(None);
            }

            let Some(end) = src.iter().position(|b| is_delimiter(*b)) else {
                if src.len() > MAX_MARKER_LEN {
                    return Err(WireError::UnsupportedOp(lossy(&src[..MAX_MARKER_LEN])));
                }
                return Ok(None);
            };

            let marker = Marker::parse(&src[..end])
                .ok_or_else(|| WireError::UnsupportedOp(lossy(&src[..end])))?;

            match marker {
                Marker::Ok => return take_bare(src, end, Op::Ok),
                Marker::Ping => return take_bare(src, end, Op::Ping),
                Marker::Pong => return take_bare(src, end, Op::Pong),
                Marker::Info => return Ok(take_text(src, end)?.map(Op::Info)),
                Marker::Err => return Ok(take_text(src, end)?.map(Op::Err)),
                Marker::Msg | Marker::HMsg => {
                    match take_msg_line(src, end, marker == Marker::HMsg, self.max_message_len)? {
                        Some(pending) => self.pending = Some(pending),
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Op>, WireError> {
        if let Some(op) = self.decode(buf)? {
            return Ok(Some(op));
        }
        skip_blank(buf);
        if buf.is_empty() && self.pending.is_none() {
            Ok(None)
        } else {
            Err(WireError::UnexpectedEof)
        }
    }
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

fn skip_blank(src: &mut BytesMut) {
    let blank = src.iter().take_while(|b| is_delimiter(**b)).count();
    if blank > 0 {
        src.advance(blank);
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// `+OK`, `PING`, `PONG`: the marker must be followed by CRLF.
fn take_bare(src: &mut BytesMut, end: usize, op: Op) -> WireResult<Option<Op>> {
    if src[end] != b'\r' {
        return Err(WireError::unexpected("CR", src[end]));
    }
    if src.len() < end + 2 {
        return Ok(None);
    }
    if src[end + 1] != b'\n' {
        return Err(WireError::unexpected("LF", src[end + 1]));
    }
    src.advance(end + 2);
    Ok(Some(op))
}

/// Locate the CR ending the control line that starts at the head of `src`.
fn find_line_end(src: &BytesMut, from: usize) -> WireResult<Option<usize>> {
    match src[from..].iter().position(|b| *b == b'\r') {
        Some(offset) => {
            let cr = from + offset;
            if src.len() < cr + 2 {
                return Ok(None);
            }
            if src[cr + 1] != b'\n' {
                return Err(WireError::unexpected("LF", src[cr + 1]));
            }
            Ok(Some(cr))
        }
        None if src.len() > MAX_CONTROL_LINE => Err(WireError::OpParser(format!(
            "control line exceeds {MAX_CONTROL_LINE} bytes"
        ))),
        None => Ok(None),
    }
}

/// `INFO`, `-ERR`: everything after the marker up to CRLF.
fn take_text(src: &mut BytesMut, end: usize) -> WireResult<Option<String>> {
    let Some(cr) = find_line_end(src, end)? else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&src[end..cr])
        .map_err(|_| WireError::OpParser("control line is not valid UTF-8".into()))?
        .trim_start_matches([' ', '\t'])
        .to_owned();
    src.advance(cr + 2);
    Ok(Some(text))
}

fn parse_len(field: &'static str, value: &str) -> WireResult<usize> {
    value.parse().map_err(|_| WireError::InvalidNumber {
        field,
        value: value.to_owned(),
    })
}

/// `MSG <subject> <sid> [reply-to] <n>` or
/// `HMSG <subject> <sid> [reply-to] <hdr-n> <total-n>`.
fn take_msg_line(
    src: &mut BytesMut,
    end: usize,
    with_headers: bool,
    max_len: usize,
) -> WireResult<Option<PendingMsg>> {
    let Some(cr) = find_line_end(src, end)? else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&src[end..cr])
        .map_err(|_| WireError::OpParser("message control line is not valid UTF-8".into()))?;
    let args: Vec<&str> = line
        .split([' ', '\t'])
        .filter(|s| !s.is_empty())
        .collect();

    let pending = if with_headers {
        let (subject, sid, reply_to, hdr, total) = match args.as_slice() {
            [subject, sid, hdr, total] => (subject, sid, None, hdr, total),
            [subject, sid, reply, hdr, total] => (subject, sid, Some(reply), hdr, total),
            _ => {
                return Err(WireError::OpParser(format!(
                    "HMSG expects 4 or 5 arguments, got {}: '{line}'",
                    args.len()
                )));
            }
        };
        let header_len = parse_len("header size", hdr)?;
        let total_len = parse_len("total size", total)?;
        if header_len > total_len {
            return Err(WireError::OpParser(format!(
                "HMSG header size {header_len} exceeds total size {total_len}"
            )));
        }
        PendingMsg {
            subject: (*subject).to_owned(),
            sid: (*sid).to_owned(),
            reply_to: reply_to.map(|r| (*r).to_owned()),
            header_len: Some(header_len),
            total_len,
        }
    } else {
        let (subject, sid, reply_to, len) = match args.as_slice() {
            [subject, sid, len] => (subject, sid, None, len),
            [subject, sid, reply, len] => (subject, sid, Some(reply), len),
            _ => {
                return Err(WireError::OpParser(format!(
                    "MSG expects 3 or 4 arguments, got {}: '{line}'",
                    args.len()
                )));
            }
        };
        PendingMsg {
            subject: (*subject).to_owned(),
            sid: (*sid).to_owned(),
            reply_to: reply_to.map(|r| (*r).to_owned()),
            header_len: None,
            total_len: parse_len("payload size", len)?,
        }
    };
    if pending.total_len > max_len {
        return Err(WireError::OpParser(format!(
            "message size {} exceeds limit of {max_len} bytes",
            pending.total_len
        )));
    }

    src.advance(cr + 2);
    Ok(Some(pending))
}
