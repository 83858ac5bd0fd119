//! Outbound command formatting.
//!
//! Each function appends one complete command to a caller-owned buffer so
//! several commands can be batched into one write. Byte counts are always
//! computed from the data actually written.

use bytes::{BufMut, BytesMut};

use crate::error::{WireError, WireResult};
use crate::headers::HeaderMap;
use crate::info::Connect;
use crate::subject::{validate_subject, validate_token};

pub const CRLF: &[u8] = b"\r\n";
pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";

/// `CONNECT {json}\r\n`
pub fn write_connect(buf: &mut BytesMut, connect: &Connect) -> WireResult<()> {
    for (field, value) in [
        ("client name", Some(&connect.name)),
        ("user", connect.user.as_ref()),
        ("password", connect.pass.as_ref()),
    ] {
        if let Some(value) = value {
            if !value.is_ascii() {
                return Err(WireError::NonAscii {
                    field,
                    value: if field == "password" {
                        "<redacted>".into()
                    } else {
                        value.clone()
                    },
                });
            }
        }
    }
    buf.extend_from_slice(b"CONNECT ");
    serde_json::to_writer((&mut *buf).writer(), connect).map_err(WireError::Connect)?;
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// `PUB <subject> [reply-to] <n>\r\n<payload>\r\n`
pub fn write_pub(
    buf: &mut BytesMut,
    subject: &str,
    reply_to: Option<&str>,
    payload: &[u8],
) -> WireResult<()> {
    validate_subject("subject", subject)?;
    if let Some(reply_to) = reply_to {
        validate_subject("reply-to", reply_to)?;
    }
    buf.reserve(subject.len() + reply_to.map_or(0, str::len) + payload.len() + 32);
    buf.extend_from_slice(b"PUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(reply_to) = reply_to {
        buf.put_u8(b' ');
        buf.extend_from_slice(reply_to.as_bytes());
    }
    buf.put_u8(b' ');
    put_decimal(buf, payload.len() as u64);
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// `HPUB <subject> [reply-to] <hdr-n> <total-n>\r\n<headers><payload>\r\n`
pub fn write_hpub(
    buf: &mut BytesMut,
    subject: &str,
    reply_to: Option<&str>,
    headers: &HeaderMap,
    payload: &[u8],
) -> WireResult<()> {
    validate_subject("subject", subject)?;
    if let Some(reply_to) = reply_to {
        validate_subject("reply-to", reply_to)?;
    }
    let mut block = BytesMut::new();
    headers.encode(&mut block)?;

    buf.reserve(subject.len() + block.len() + payload.len() + 48);
    buf.extend_from_slice(b"HPUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(reply_to) = reply_to {
        buf.put_u8(b' ');
        buf.extend_from_slice(reply_to.as_bytes());
    }
    buf.put_u8(b' ');
    put_decimal(buf, block.len() as u64);
    buf.put_u8(b' ');
    put_decimal(buf, (block.len() + payload.len()) as u64);
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(&block);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// `SUB <subject> [queue-group] <sid>\r\n`
pub fn write_sub(
    buf: &mut BytesMut,
    subject: &str,
    queue_group: Option<&str>,
    sid: &str,
) -> WireResult<()> {
    validate_subject("subject", subject)?;
    validate_token("subscription id", sid)?;
    if let Some(group) = queue_group {
        validate_token("queue group", group)?;
    }
    buf.extend_from_slice(b"SUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(group) = queue_group {
        buf.put_u8(b' ');
        buf.extend_from_slice(group.as_bytes());
    }
    buf.put_u8(b' ');
    buf.extend_from_slice(sid.as_bytes());
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// `UNSUB <sid> [max-messages]\r\n`
pub fn write_unsub(buf: &mut BytesMut, sid: &str, max_messages: Option<u64>) -> WireResult<()> {
    validate_token("subscription id", sid)?;
    buf.extend_from_slice(b"UNSUB ");
    buf.extend_from_slice(sid.as_bytes());
    if let Some(max) = max_messages {
        buf.put_u8(b' ');
        put_decimal(buf, max);
    }
    buf.extend_from_slice(CRLF);
    Ok(())
}

pub fn write_ping(buf: &mut BytesMut) {
    buf.extend_from_slice(PING);
}

pub fn write_pong(buf: &mut BytesMut) {
    buf.extend_from_slice(PONG);
}

fn put_decimal(buf: &mut BytesMut, mut n: u64) {
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    buf.extend_from_slice(&digits[i..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect() {
        let mut buf = BytesMut::new();
        write_connect(&mut buf, &Connect::new("c", false)).unwrap();
        assert_eq!(
            &buf[..],
            &b"CONNECT {\"name\":\"c\",\"lang\":\"rust\",\"protocol\":1,\"pedantic\":false,\"verbose\":false}\r\n"[..]
        );
    }

    #[test]
    fn test_connect_rejects_non_ascii() {
        let mut buf = BytesMut::new();
        let err = write_connect(
            &mut buf,
            &Connect::new("c", false).with_credentials("us\u{e9}r", "p"),
        )
        .unwrap_err();
        assert!(matches!(err, WireError::NonAscii { field: "user", .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pub() {
        let mut buf = BytesMut::new();
        write_pub(&mut buf, "foo", None, b"hello").unwrap();
        assert_eq!(&buf[..], b"PUB foo 5\r\nhello\r\n");

        buf.clear();
        write_pub(&mut buf, "foo.bar", Some("_INBOX.1"), b"").unwrap();
        assert_eq!(&buf[..], b"PUB foo.bar _INBOX.1 0\r\n\r\n");
    }

    #[test]
    fn test_pub_counts_payload_bytes() {
        let payload = "te\r\nst\u{e9}".as_bytes();
        let mut buf = BytesMut::new();
        write_pub(&mut buf, "foo", None, payload).unwrap();
        assert!(buf.starts_with(b"PUB foo 8\r\n"));
    }

    #[test]
    fn test_pub_rejects_bad_subject() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            write_pub(&mut buf, "f\u{f6}o", None, b"x"),
            Err(WireError::NonAscii { .. })
        ));
        assert!(write_pub(&mut buf, "foo bar", None, b"x").is_err());
        assert!(write_pub(&mut buf, "foo", Some(""), b"x").is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_hpub() {
        let mut headers = HeaderMap::new();
        headers.insert("A", "1");
        let mut buf = BytesMut::new();
        write_hpub(&mut buf, "foo", Some("bar"), &headers, b"xyz").unwrap();
        // "NATS/1.0\r\nA: 1\r\n\r\n" is 18 bytes
        assert_eq!(
            &buf[..],
            b"HPUB foo bar 18 21\r\nNATS/1.0\r\nA: 1\r\n\r\nxyz\r\n"
        );
    }

    #[test]
    fn test_sub_unsub() {
        let mut buf = BytesMut::new();
        write_sub(&mut buf, "foo.*", None, "s1").unwrap();
        write_sub(&mut buf, "foo", Some("workers"), "s2").unwrap();
        write_unsub(&mut buf, "s1", None).unwrap();
        write_unsub(&mut buf, "s2", Some(1)).unwrap();
        assert_eq!(
            &buf[..],
            b"SUB foo.* s1\r\nSUB foo workers s2\r\nUNSUB s1\r\nUNSUB s2 1\r\n"
        );
    }

    #[test]
    fn test_ping_pong() {
        let mut buf = BytesMut::new();
        write_ping(&mut buf);
        write_pong(&mut buf);
        assert_eq!(&buf[..], b"PING\r\nPONG\r\n");
    }

    #[test]
    fn test_put_decimal() {
        for n in [0u64, 7, 10, 1_048_576, u64::MAX] {
            let mut buf = BytesMut::new();
            put_decimal(&mut buf, n);
            assert_eq!(std::str::from_utf8(&buf).unwrap(), n.to_string());
        }
    }
}
