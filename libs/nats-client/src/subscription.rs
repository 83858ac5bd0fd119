//! Subscriptions: the caller-facing handles and the registry the reader
//! routes inbound messages through.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use nats_wire::MsgOp;
use nats_wire::subject::{self, FULL_WILDCARD, SINGLE_WILDCARD, validate_subject, validate_token};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, trace, warn};
use uuid::Uuid;

use crate::client::ClientInner;
use crate::error::{NatsError, NatsResult};
use crate::metrics;
use crate::request::InboxRouter;

/// What the client asks the server for with `SUB`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    id: String,
    subject: String,
    queue_group: Option<String>,
    max_messages: Option<u64>,
}

impl SubscriptionInfo {
    /// A subscription with a fresh unique id.
    ///
    /// The subject may use `*` or `>` but not both.
    pub fn new(subject: impl Into<String>) -> NatsResult<Self> {
        let subject = subject.into();
        if subject.contains(SINGLE_WILDCARD) && subject.contains(FULL_WILDCARD) {
            return Err(NatsError::InvalidSubscription(format!(
                "subject '{subject}' mixes '{SINGLE_WILDCARD}' and '{FULL_WILDCARD}' wildcards"
            )));
        }
        validate_subject("subject", &subject)
            .map_err(|err| NatsError::InvalidSubscription(err.to_string()))?;
        Ok(Self {
            id: Uuid::new_v4().simple().to_string(),
            subject,
            queue_group: None,
            max_messages: None,
        })
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> NatsResult<Self> {
        let group = group.into();
        validate_token("queue group", &group)
            .map_err(|err| NatsError::InvalidSubscription(err.to_string()))?;
        self.queue_group = Some(group);
        Ok(self)
    }

    /// Have the server (and the local registry) drop the subscription after
    /// `max` deliveries.
    pub fn with_max_messages(mut self, max: u64) -> NatsResult<Self> {
        if max == 0 {
            return Err(NatsError::InvalidSubscription(
                "max_messages must be at least 1".into(),
            ));
        }
        self.max_messages = Some(max);
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    pub fn max_messages(&self) -> Option<u64> {
        self.max_messages
    }

    /// True if a message published on `candidate` falls under this subject.
    pub fn matches(&self, candidate: &str) -> bool {
        subject::matches(&self.subject, candidate)
    }
}

/// Where the registry delivers a subscription's messages.
#[derive(Clone)]
pub(crate) enum Sink {
    Channel(mpsc::Sender<MsgOp>),
    /// Shared request inbox, demultiplexed by reply subject.
    Inbox(Arc<InboxRouter>),
}

struct Entry {
    info: SubscriptionInfo,
    sink: Sink,
    delivered: u64,
    /// Dropped when the connection is released (per-request reply
    /// subscriptions); everything else is resubscribed on reconnect.
    ephemeral: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Delivered,
    /// Delivered, and the subscription reached `max_messages`.
    Completed,
    /// Subscriber buffer full.
    Dropped,
    /// No live subscription with that id.
    Unknown,
}

/// Active subscriptions keyed by subscription id.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SubscriptionRegistry {
    pub(crate) fn insert(&self, info: SubscriptionInfo, sink: Sink, ephemeral: bool) -> NatsResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(info.id()) {
            return Err(NatsError::InvalidSubscription(format!(
                "subscription id '{}' is already registered",
                info.id()
            )));
        }
        entries.insert(
            info.id().to_string(),
            Entry {
                info,
                sink,
                delivered: 0,
                ephemeral,
            },
        );
        Ok(())
    }

    pub(crate) fn remove(&self, sid: &str) -> Option<SubscriptionInfo> {
        self.entries.lock().remove(sid).map(|entry| entry.info)
    }

    pub(crate) fn contains(&self, sid: &str) -> bool {
        self.entries.lock().contains_key(sid)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Route one inbound message. Never blocks: a full subscriber buffer
    /// drops the message.
    pub(crate) fn dispatch(&self, msg: MsgOp) -> Dispatch {
        let (sink, completed) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&msg.sid) else {
                trace!(sid = %msg.sid, subject = %msg.subject, "message for unknown subscription");
                return Dispatch::Unknown;
            };
            entry.delivered += 1;
            let completed = entry
                .info
                .max_messages
                .is_some_and(|max| entry.delivered >= max);
            let sink = entry.sink.clone();
            if completed {
                debug!(sid = %msg.sid, "subscription reached max messages");
                entries.remove(&msg.sid);
            }
            (sink, completed)
        };

        match sink {
            Sink::Inbox(router) => {
                router.route(msg);
            }
            Sink::Channel(tx) => match tx.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => {
                    metrics::SLOW_CONSUMER_DROPS.inc();
                    warn!(sid = %msg.sid, subject = %msg.subject, "subscriber buffer full, dropping message");
                    return Dispatch::Dropped;
                }
                Err(TrySendError::Closed(msg)) => {
                    debug!(sid = %msg.sid, "subscriber went away, removing subscription");
                    self.entries.lock().remove(&msg.sid);
                    return Dispatch::Unknown;
                }
            },
        }
        if completed {
            Dispatch::Completed
        } else {
            Dispatch::Delivered
        }
    }

    /// Subscriptions to replay after a reconnect, each with the number of
    /// deliveries it still has to go (if bounded).
    pub(crate) fn resubscribe_plan(&self) -> Vec<(SubscriptionInfo, Option<u64>)> {
        self.entries
            .lock()
            .values()
            .filter(|entry| !entry.ephemeral)
            .map(|entry| {
                let remaining = entry
                    .info
                    .max_messages
                    .map(|max| max.saturating_sub(entry.delivered));
                (entry.info.clone(), remaining)
            })
            .collect()
    }

    /// Drop per-request subscriptions; their waiters see the stream end.
    pub(crate) fn clear_ephemeral(&self) {
        self.entries.lock().retain(|_, entry| !entry.ephemeral);
    }

    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }
}

/// A live subscription. Yields messages until unsubscribed, until
/// `max_messages` is reached or until the client is disposed.
///
/// Dropping the handle unsubscribes; the `UNSUB` is then sent in the
/// background and its failure is only logged. Use
/// [`Subscription::unsubscribe`] to observe errors.
pub struct Subscription {
    info: SubscriptionInfo,
    receiver: mpsc::Receiver<MsgOp>,
    client: Weak<ClientInner>,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(
        info: SubscriptionInfo,
        receiver: mpsc::Receiver<MsgOp>,
        client: Weak<ClientInner>,
    ) -> Self {
        Self {
            info,
            receiver,
            client,
            active: true,
        }
    }

    pub fn info(&self) -> &SubscriptionInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        self.info.id()
    }

    pub fn subject(&self) -> &str {
        self.info.subject()
    }

    /// Next message, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<MsgOp> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<MsgOp> {
        self.receiver.try_recv().ok()
    }

    /// Remove the subscription and, if connected, send `UNSUB`.
    pub async fn unsubscribe(mut self) -> NatsResult<()> {
        self.active = false;
        match self.client.upgrade() {
            Some(client) => client.unsubscribe_info(&self.info).await,
            None => Ok(()),
        }
    }
}

impl Stream for Subscription {
    type Item = MsgOp;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<MsgOp>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.release_subscription(&self.info);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("info", &self.info)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// A subscription driven by a background task calling a handler per message.
pub struct HandlerSubscription {
    info: SubscriptionInfo,
    stop: CancellationToken,
    task: Option<JoinHandle<NatsResult<()>>>,
}

impl HandlerSubscription {
    pub(crate) fn spawn<F, Fut>(mut subscription: Subscription, mut handler: F, span: Span) -> Self
    where
        F: FnMut(MsgOp) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let info = subscription.info().clone();
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let task = tokio::spawn(
            async move {
                loop {
                    let next = tokio::select! {
                        _ = stopped.cancelled() => None,
                        msg = subscription.next() => Some(msg),
                    };
                    match next {
                        Some(Some(msg)) => handler(msg).await,
                        Some(None) => {
                            debug!(sid = %subscription.id(), "subscription ended");
                            return Ok(());
                        }
                        None => return subscription.unsubscribe().await,
                    }
                }
            }
            .instrument(span),
        );
        Self {
            info,
            stop,
            task: Some(task),
        }
    }

    pub fn info(&self) -> &SubscriptionInfo {
        &self.info
    }

    /// True once the handler task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the handler task and unsubscribe.
    pub async fn unsubscribe(mut self) -> NatsResult<()> {
        self.stop.cancel();
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(err) => Err(NatsError::Io(io::Error::other(err))),
        }
    }
}

impl Drop for HandlerSubscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl fmt::Debug for HandlerSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSubscription")
            .field("info", &self.info)
            .field("finished", &self.is_finished())
            .finish()
    }
}
