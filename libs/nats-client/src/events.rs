//! Client lifecycle events and the broadcast streams exposed to callers.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use nats_wire::subject;
use nats_wire::{MsgOp, Op};
use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::error::NatsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect` or `dispose` was called.
    ByUser,
    /// The reader hit an error or the server went away.
    DueToFailure,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { host: String },
    Disconnected { reason: DisconnectReason },
    /// The background reader stopped on an error.
    WorkerFailed { error: Arc<NatsError> },
    /// Auto-reconnect gave up.
    AutoReconnectFailed { attempts: u32 },
}

/// Multi-consumer fan-out that can be closed, ending every stream.
pub(crate) struct Broadcast<T> {
    sender: RwLock<Option<broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: RwLock::new(Some(sender)),
        }
    }

    /// Returns the number of consumers that will see `value`.
    pub(crate) fn send(&self, value: T) -> usize {
        match &*self.sender.read() {
            Some(sender) => sender.send(value).unwrap_or(0),
            None => 0,
        }
    }

    /// `None` once closed.
    pub(crate) fn subscribe(&self) -> Option<broadcast::Receiver<T>> {
        self.sender.read().as_ref().map(broadcast::Sender::subscribe)
    }

    /// Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        self.sender.write().take().is_some()
    }
}

fn receiver_stream<T: Clone + Send + 'static>(
    receiver: Option<broadcast::Receiver<T>>,
    name: &'static str,
) -> BoxStream<'static, T> {
    let Some(receiver) = receiver else {
        return stream::empty().boxed();
    };
    stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(value) => return Some((value, receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(stream = name, skipped, "consumer lagged, items skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

macro_rules! stream_type {
    ($(#[$doc:meta])* $name:ident, $item:ty) => {
        $(#[$doc])*
        pub struct $name {
            inner: BoxStream<'static, $item>,
        }

        impl $name {
            pub async fn next(&mut self) -> Option<$item> {
                self.inner.next().await
            }
        }

        impl Stream for $name {
            type Item = $item;

            fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<$item>> {
                self.inner.poll_next_unpin(cx)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name)).finish_non_exhaustive()
            }
        }
    };
}

stream_type!(
    /// Every op the reader decodes, handshake ops included.
    OpStream,
    Op
);
stream_type!(
    /// `MSG` and `HMSG` ops, optionally narrowed to a subject pattern.
    MessageStream,
    MsgOp
);
stream_type!(
    /// Lifecycle events.
    EventStream,
    ClientEvent
);

impl OpStream {
    pub(crate) fn new(receiver: Option<broadcast::Receiver<Op>>) -> Self {
        Self {
            inner: receiver_stream(receiver, "ops"),
        }
    }
}

impl MessageStream {
    pub(crate) fn new(receiver: Option<broadcast::Receiver<Op>>, pattern: Option<String>) -> Self {
        let inner = receiver_stream(receiver, "messages")
            .filter_map(move |op| {
                let msg = op.into_msg().filter(|msg| match &pattern {
                    Some(pattern) => subject::matches(pattern, &msg.subject),
                    None => true,
                });
                async move { msg }
            })
            .boxed();
        Self { inner }
    }
}

impl EventStream {
    pub(crate) fn new(receiver: Option<broadcast::Receiver<ClientEvent>>) -> Self {
        Self {
            inner: receiver_stream(receiver, "events"),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn msg(subject: &str) -> Op {
        Op::Msg(MsgOp {
            subject: subject.into(),
            sid: "1".into(),
            reply_to: None,
            headers: None,
            payload: Bytes::new(),
        })
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let ops = Broadcast::new(8);
        let mut a = OpStream::new(ops.subscribe());
        let mut b = OpStream::new(ops.subscribe());
        assert_eq!(ops.send(Op::Ping), 2);
        assert_eq!(a.next().await, Some(Op::Ping));
        assert_eq!(b.next().await, Some(Op::Ping));
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let events = Broadcast::new(8);
        let mut stream = EventStream::new(events.subscribe());
        events.send(ClientEvent::Connected {
            host: "h:1".into(),
        });
        assert!(events.close());
        assert!(!events.close());
        assert!(matches!(
            stream.next().await,
            Some(ClientEvent::Connected { .. })
        ));
        assert!(stream.next().await.is_none());
        assert!(EventStream::new(events.subscribe()).next().await.is_none());
        assert_eq!(events.send(ClientEvent::AutoReconnectFailed { attempts: 1 }), 0);
    }

    #[tokio::test]
    async fn test_message_stream_filters() {
        let ops = Broadcast::new(8);
        let mut all = MessageStream::new(ops.subscribe(), None);
        let mut orders = MessageStream::new(ops.subscribe(), Some("orders.>".into()));
        ops.send(Op::Pong);
        ops.send(msg("users.new"));
        ops.send(msg("orders.eu.new"));
        ops.close();

        assert_eq!(all.next().await.unwrap().subject, "users.new");
        assert_eq!(all.next().await.unwrap().subject, "orders.eu.new");
        assert!(all.next().await.is_none());

        assert_eq!(orders.next().await.unwrap().subject, "orders.eu.new");
        assert!(orders.next().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_consumer_skips() {
        let ops = Broadcast::new(2);
        let mut stream = OpStream::new(ops.subscribe());
        for _ in 0..4 {
            ops.send(Op::Ping);
        }
        ops.send(Op::Pong);
        ops.close();
        let mut seen = Vec::new();
        while let Some(op) = stream.next().await {
            seen.push(op);
        }
        assert_eq!(seen.last(), Some(&Op::Pong));
        assert!(seen.len() <= 2);
    }
}
