use bytes::BytesMut;
use futures::StreamExt;
use nats_wire::{HeaderMap, Op, OpCodec, WireError, encode};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Decoder, FramedRead};

fn decode_all(input: &[u8]) -> Result<Vec<Op>, WireError> {
    let mut codec = OpCodec::new();
    let mut buf = BytesMut::from(input);
    let mut ops = Vec::new();
    while let Some(op) = codec.decode_eof(&mut buf)? {
        ops.push(op);
    }
    Ok(ops)
}

/// Rewrite an encoded `PUB`/`HPUB` into the `MSG`/`HMSG` a server would
/// deliver for subscription `sid`.
fn as_delivery(encoded: &[u8], sid: &str) -> Vec<u8> {
    let line_end = encoded
        .windows(2)
        .position(|w| w == b"\r\n")
        .expect("control line");
    let line = std::str::from_utf8(&encoded[..line_end]).expect("ascii");
    let mut args = line.split(' ');
    let verb = match args.next().expect("verb") {
        "PUB" => "MSG",
        "HPUB" => "HMSG",
        other => panic!("not a publish: {other}"),
    };
    let subject = args.next().expect("subject");
    let rest: Vec<&str> = args.collect();
    let mut out = format!("{verb} {subject} {sid} {}", rest.join(" ")).into_bytes();
    out.extend_from_slice(&encoded[line_end..]);
    out
}

#[test]
fn vector_msg_with_embedded_crlf() {
    let ops = decode_all(b"MSG foo siddw1 6\r\nte\r\nst\r\n").unwrap();
    assert_eq!(ops.len(), 1);
    let msg = ops[0].as_msg().expect("msg");
    assert_eq!(msg.subject, "foo");
    assert_eq!(msg.sid, "siddw1");
    assert!(msg.reply_to.is_none());
    assert_eq!(msg.payload.len(), 6);
    assert_eq!(&msg.payload[..], b"te\r\nst");
}

#[test]
fn vector_blank_line_between_ops() {
    assert_eq!(
        decode_all(b"+OK\r\n\r\nPING\r\n").unwrap(),
        vec![Op::Ok, Op::Ping]
    );
}

#[test]
fn vector_unsupported_op() {
    match decode_all(b"FOO\r\n") {
        Err(WireError::UnsupportedOp(marker)) => assert_eq!(marker, "FOO"),
        other => panic!("expected UnsupportedOp, got {other:?}"),
    }
}

#[test]
fn publish_then_deliver_preserves_fields() {
    let cases: &[(&str, Option<&str>, &[u8])] = &[
        ("foo", Some("bar"), b"hello"),
        ("a.b.c", None, b""),
        ("orders.new", Some("_INBOX.x.1"), b"line1\r\nline2\r\n"),
        ("bin", None, &[0u8, 13, 10, 255, 13]),
    ];
    for (subject, reply_to, payload) in cases {
        let mut buf = BytesMut::new();
        encode::write_pub(&mut buf, subject, *reply_to, payload).unwrap();
        let ops = decode_all(&as_delivery(&buf, "7")).unwrap();
        assert_eq!(ops.len(), 1, "case {subject}");
        let msg = ops[0].as_msg().unwrap();
        assert_eq!(msg.subject, *subject);
        assert_eq!(msg.sid, "7");
        assert_eq!(msg.reply_to.as_deref(), *reply_to);
        assert_eq!(&msg.payload[..], *payload);
    }
}

#[test]
fn header_publish_then_deliver() {
    let mut headers = HeaderMap::new();
    headers.insert("Trace-Id", "abc").append("Tag", "x").append("Tag", "y");
    let mut buf = BytesMut::new();
    encode::write_hpub(&mut buf, "events", None, &headers, b"body\r\n").unwrap();

    let ops = decode_all(&as_delivery(&buf, "s")).unwrap();
    let Op::HMsg(msg) = &ops[0] else {
        panic!("expected HMSG, got {:?}", ops[0]);
    };
    assert_eq!(msg.headers.as_ref(), Some(&headers));
    assert_eq!(&msg.payload[..], b"body\r\n");
}

#[tokio::test]
async fn framed_reader_over_split_writes() {
    let (client, mut server) = tokio::io::duplex(64);
    let writer = tokio::spawn(async move {
        for chunk in [
            &b"INFO {\"max_payload\":64}\r"[..],
            b"\nMSG foo 1 1",
            b"0\r\n0123456789",
            b"\r\nPI",
            b"NG\r\n",
        ] {
            server.write_all(chunk).await.unwrap();
            tokio::task::yield_now().await;
        }
    });

    let ops: Vec<Op> = FramedRead::new(client, OpCodec::new())
        .map(|r| r.unwrap())
        .collect()
        .await;
    writer.await.unwrap();

    assert_eq!(ops.len(), 3);
    assert_eq!(ops[0], Op::Info("{\"max_payload\":64}".into()));
    assert_eq!(&ops[1].as_msg().unwrap().payload[..], b"0123456789");
    assert_eq!(ops[2], Op::Ping);
}

#[tokio::test]
async fn framed_reader_stops_at_clean_eof() {
    let (client, mut server) = tokio::io::duplex(64);
    server.write_all(b"PONG\r\n").await.unwrap();
    drop(server);

    let mut framed = FramedRead::new(client, OpCodec::new());
    assert_eq!(framed.next().await.unwrap().unwrap(), Op::Pong);
    assert!(framed.next().await.is_none());
}
