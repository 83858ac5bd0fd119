//! One live transport stream, split into an op reader and a shared writer.

use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use nats_wire::{Op, OpCodec, WireResult};
use tokio::io::{AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tracing::trace;

use crate::error::{self, NatsError, NatsResult};
use crate::transport::BoxedStream;

/// Allowance on top of the server's `max_payload` for inbound message bodies.
const MESSAGE_LEN_HEADROOM: usize = 64 * 1024;

/// Largest inbound message body accepted from a server advertising
/// `max_payload`.
pub(crate) fn inbound_message_limit(max_payload: u64) -> usize {
    usize::try_from(max_payload)
        .unwrap_or(usize::MAX)
        .saturating_add(MESSAGE_LEN_HEADROOM)
}

pub(crate) struct Connection {
    pub(crate) reader: OpReader,
    pub(crate) writer: ConnectionWriter,
}

impl Connection {
    /// `leftover` holds bytes already read from `stream` that belong in front
    /// of whatever arrives next.
    pub(crate) fn new(stream: BoxedStream, leftover: BytesMut, max_payload: u64) -> Self {
        let (read, write) = tokio::io::split(stream);
        let codec = OpCodec::with_max_payload(inbound_message_limit(max_payload));
        let mut framed = FramedRead::new(read, codec);
        if !leftover.is_empty() {
            framed.read_buffer_mut().extend_from_slice(&leftover);
        }
        Self {
            reader: OpReader { framed },
            writer: ConnectionWriter {
                state: Arc::new(Mutex::new(WriteState {
                    io: BufWriter::new(write),
                    scratch: BytesMut::with_capacity(4096),
                    closed: false,
                })),
            },
        }
    }
}

/// Decoded inbound ops. Owned by exactly one task.
pub(crate) struct OpReader {
    framed: FramedRead<ReadHalf<BoxedStream>, OpCodec>,
}

impl OpReader {
    /// Next op, or `None` at clean end of stream. Cancel safe.
    pub(crate) async fn next_op(&mut self) -> NatsResult<Option<Op>> {
        match self.framed.next().await {
            Some(Ok(op)) => Ok(Some(op)),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }

    /// Follow a `max_payload` change announced by an async `INFO`.
    pub(crate) fn set_max_payload(&mut self, max_payload: u64) {
        let limit = inbound_message_limit(max_payload);
        if self.framed.decoder().max_payload() != limit {
            trace!(limit, "inbound message limit changed");
            self.framed.decoder_mut().set_max_payload(limit);
        }
    }
}

struct WriteState {
    io: BufWriter<WriteHalf<BoxedStream>>,
    scratch: BytesMut,
    closed: bool,
}

/// Serialized write access to the stream.
///
/// Every write goes through [`ConnectionWriter::write`], which holds the lock
/// for formatting, writing and the optional flush only, so multi-command
/// sequences are never interleaved with other writers.
#[derive(Clone)]
pub(crate) struct ConnectionWriter {
    state: Arc<Mutex<WriteState>>,
}

impl ConnectionWriter {
    /// Format commands with `format` and write them as one unit. Nothing is
    /// written if `format` fails. Returns the number of bytes written.
    pub(crate) async fn write<F>(&self, flush: bool, format: F) -> NatsResult<usize>
    where
        F: FnOnce(&mut BytesMut) -> WireResult<()>,
    {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Err(NatsError::NotConnected);
        }
        state.scratch.clear();
        format(&mut state.scratch)?;
        state.io.write_all(&state.scratch).await?;
        if flush {
            state.io.flush().await?;
        }
        trace!(bytes = state.scratch.len(), flush, "wrote commands");
        Ok(state.scratch.len())
    }

    pub(crate) async fn flush(&self) -> NatsResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(NatsError::NotConnected);
        }
        state.io.flush().await?;
        Ok(())
    }

    /// Flush what is buffered and shut the write side down. Later writes fail
    /// with `NotConnected`. Every step runs even if an earlier one failed.
    pub(crate) async fn shutdown(&self) -> NatsResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let mut errors: Vec<NatsError> = Vec::new();
        if let Err(err) = state.io.flush().await {
            errors.push(err.into());
        }
        if let Err(err) = state.io.shutdown().await {
            errors.push(err.into());
        }
        state.scratch = BytesMut::new();
        error::aggregate(errors)
    }
}
