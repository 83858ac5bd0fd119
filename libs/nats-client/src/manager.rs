//! Host failover and the connect handshake.
//!
//! Hosts are tried in random order. Any failure against one host (transport,
//! missing credentials, missing client certificates, `-ERR`) is logged and the
//! next host is tried; only exhausting the list is an error.

use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use nats_wire::{Connect, Op, OpCodec, ServerInfo, encode};
use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionInfo, Credentials, Host};
use crate::connection::{Connection, ConnectionWriter, OpReader};
use crate::error::{NatsError, NatsResult};
use crate::metrics;
use crate::transport::{self, BoxedStream};

/// A connection that completed the handshake.
pub(crate) struct Handshake {
    pub(crate) connection: Connection,
    pub(crate) server_info: ServerInfo,
    pub(crate) host: Host,
    /// Ops read during the handshake, in order, for replay.
    pub(crate) ops: Vec<Op>,
}

pub(crate) async fn connect(
    info: &ConnectionInfo,
    token: &CancellationToken,
) -> NatsResult<Handshake> {
    let mut hosts = info.hosts.clone();
    hosts.shuffle(&mut rand::thread_rng());
    let attempted = hosts.len();

    for host in hosts {
        let attempt = tokio::select! {
            _ = token.cancelled() => {
                debug!("connect cancelled");
                break;
            }
            attempt = connect_host(&host, info) => attempt,
        };
        match attempt {
            Ok(handshake) => {
                info!(%host, server_id = %handshake.server_info.server_id, "connected");
                return Ok(handshake);
            }
            Err(err) => {
                metrics::HOST_CONNECT_FAILURES.inc();
                warn!(%host, ?err, "failed to connect to host, trying next");
            }
        }
    }
    error!(attempted, "could not establish a connection to any host");
    Err(NatsError::CouldNotEstablishAnyConnection { attempted })
}

async fn connect_host(host: &Host, info: &ConnectionInfo) -> NatsResult<Handshake> {
    let deadline = info.socket.connect_timeout;
    let tcp = transport::connect_tcp(host, &info.socket).await?;
    let mut framed = FramedRead::new(tcp, OpCodec::new());

    let raw_info = match next_op(&mut framed, host, deadline).await? {
        Op::Info(raw) => raw,
        other => {
            return Err(NatsError::FailedToConnectToHost {
                host: host.to_string(),
                reason: format!("expected INFO, got {}", other.name()),
            });
        }
    };
    let server_info = ServerInfo::parse(&raw_info)?;
    debug!(?server_info, "received server info");

    let credentials = host.credentials.as_ref().or(info.credentials.as_ref());
    if server_info.auth_required && credentials.is_none() {
        return Err(NatsError::MissingCredentials {
            host: host.to_string(),
        });
    }
    if server_info.tls_verify && !info.tls.has_client_certificates() {
        return Err(NatsError::MissingClientCertificates {
            host: host.to_string(),
        });
    }

    let (stream, leftover): (BoxedStream, BytesMut) = if server_info.tls_required {
        if !framed.read_buffer().is_empty() {
            return Err(NatsError::FailedToConnectToHost {
                host: host.to_string(),
                reason: "unexpected data before tls upgrade".into(),
            });
        }
        let tls = transport::upgrade_tls(framed.into_inner(), host, &info.tls).await?;
        (Box::new(tls), BytesMut::new())
    } else {
        let leftover = framed.read_buffer_mut().split();
        (Box::new(framed.into_inner()), leftover)
    };

    let Connection { mut reader, writer } =
        Connection::new(stream, leftover, server_info.max_payload);
    match handshake(&mut reader, &writer, host, credentials, info).await {
        Ok(replies) => Ok(Handshake {
            connection: Connection { reader, writer },
            server_info,
            host: host.clone(),
            ops: std::iter::once(Op::Info(raw_info)).chain(replies).collect(),
        }),
        Err(err) => {
            if let Err(teardown) = writer.shutdown().await {
                debug!(?teardown, "error tearing down failed connection");
            }
            Err(err)
        }
    }
}

/// Send `CONNECT` and `PING` as one flushed write, then read replies until
/// the `PONG`. A verbose server answers `+OK` first. Returns every reply, the
/// `PONG` last.
async fn handshake(
    reader: &mut OpReader,
    writer: &ConnectionWriter,
    host: &Host,
    credentials: Option<&Credentials>,
    info: &ConnectionInfo,
) -> NatsResult<Vec<Op>> {
    let mut connect = Connect::new(info.name.as_str(), info.verbose).with_headers(info.headers);
    if let Some(credentials) = credentials {
        connect = connect.with_credentials(credentials.user.as_str(), credentials.pass.as_str());
    }
    writer
        .write(true, |buf| {
            encode::write_connect(buf, &connect)?;
            encode::write_ping(buf);
            Ok(())
        })
        .await?;

    match timeout(info.socket.connect_timeout, read_replies(reader)).await {
        Ok(result) => result,
        Err(_) => Err(NatsError::FailedToConnectToHost {
            host: host.to_string(),
            reason: "timed out waiting for handshake reply".into(),
        }),
    }
}

async fn read_replies(reader: &mut OpReader) -> NatsResult<Vec<Op>> {
    let mut replies = Vec::new();
    loop {
        match reader.next_op().await? {
            Some(Op::Err(message)) => return Err(NatsError::ClientReceivedErrOp(message)),
            Some(Op::Pong) => {
                replies.push(Op::Pong);
                return Ok(replies);
            }
            Some(op) => {
                debug!(op = op.name(), "handshake reply before PONG");
                replies.push(op);
            }
            None => return Err(NatsError::ConnectionClosed),
        }
    }
}

async fn next_op(
    framed: &mut FramedRead<TcpStream, OpCodec>,
    host: &Host,
    deadline: Duration,
) -> NatsResult<Op> {
    match timeout(deadline, framed.next()).await {
        Ok(Some(Ok(op))) => Ok(op),
        Ok(Some(Err(err))) => Err(err.into()),
        Ok(None) => Err(NatsError::ConnectionClosed),
        Err(_) => Err(NatsError::FailedToConnectToHost {
            host: host.to_string(),
            reason: "timed out waiting for INFO".into(),
        }),
    }
}
