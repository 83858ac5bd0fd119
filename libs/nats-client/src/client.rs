//! The client orchestrator.
//!
//! [`NatsClient`] owns at most one live connection. A background reader task
//! drives the connection's op stream; everything else (publish, subscribe,
//! request) runs on the caller's task and serializes on the connection's
//! write lock. Connect, disconnect, dispose and failure handling serialize on
//! a separate lifecycle lock.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use futures::FutureExt;
use nats_wire::info::DEFAULT_MAX_PAYLOAD;
use nats_wire::{HeaderMap, MsgOp, Op, ServerInfo, encode};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};

use crate::config::{ConnectionInfo, PubFlushMode, SocketOptions};
use crate::connection::{Connection, ConnectionWriter, OpReader};
use crate::error::{self, NatsError, NatsResult};
use crate::events::{
    Broadcast, ClientEvent, DisconnectReason, EventStream, MessageStream, OpStream,
};
use crate::manager::{self, Handshake};
use crate::metrics;
use crate::request::{self, InboxRouter};
use crate::subscription::{
    Dispatch, HandlerSubscription, Sink, Subscription, SubscriptionInfo, SubscriptionRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

struct LiveConnection {
    writer: ConnectionWriter,
    /// Cancels the reader task.
    token: CancellationToken,
    generation: u64,
}

pub(crate) struct ClientInner {
    id: String,
    info: ConnectionInfo,
    span: Span,
    lifecycle: AsyncMutex<()>,
    state: Mutex<ClientState>,
    live: RwLock<Option<LiveConnection>>,
    server_info: RwLock<Option<Arc<ServerInfo>>>,
    subscriptions: SubscriptionRegistry,
    inbox: Arc<InboxRouter>,
    /// Sid of the shared inbox subscription, created on first request.
    inbox_sid: AsyncMutex<Option<String>>,
    ops: Broadcast<Op>,
    events: Broadcast<ClientEvent>,
    disposed: AtomicBool,
    /// Bumped by user disconnect and dispose; a reconnect loop started under
    /// an older epoch gives up.
    epoch: AtomicU64,
    generation: AtomicU64,
    last_op: Mutex<Instant>,
}

/// Handle to a client. Clones share the same connection.
#[derive(Clone)]
pub struct NatsClient {
    inner: Arc<ClientInner>,
}

impl NatsClient {
    /// Create a disconnected client. `info` is validated and kept as a private
    /// copy.
    pub fn new(info: ConnectionInfo) -> NatsResult<Self> {
        info.validate()?;
        let id = request::new_id();
        let span = info_span!("nats_client", client_id = %id);
        let broadcast_capacity = info.broadcast_capacity;
        Ok(Self {
            inner: Arc::new(ClientInner {
                id,
                info,
                span,
                lifecycle: AsyncMutex::new(()),
                state: Mutex::new(ClientState::Disconnected),
                live: RwLock::new(None),
                server_info: RwLock::new(None),
                subscriptions: SubscriptionRegistry::default(),
                inbox: Arc::new(InboxRouter::new()),
                inbox_sid: AsyncMutex::new(None),
                ops: Broadcast::new(broadcast_capacity),
                events: Broadcast::new(broadcast_capacity),
                disposed: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                last_op: Mutex::new(Instant::now()),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ClientState::Connected
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// INFO of the current (or last) connection.
    pub fn server_info(&self) -> Option<Arc<ServerInfo>> {
        self.inner.server_info.read().clone()
    }

    pub fn events(&self) -> EventStream {
        EventStream::new(self.inner.events.subscribe())
    }

    pub fn ops(&self) -> OpStream {
        OpStream::new(self.inner.ops.subscribe())
    }

    pub fn messages(&self) -> MessageStream {
        MessageStream::new(self.inner.ops.subscribe(), None)
    }

    /// Messages whose subject matches `pattern` (`*` and `>` wildcards).
    pub fn messages_matching(&self, pattern: impl Into<String>) -> MessageStream {
        MessageStream::new(self.inner.ops.subscribe(), Some(pattern.into()))
    }

    /// Connect to one of the configured hosts. A no-op when already
    /// connected.
    pub async fn connect(&self) -> NatsResult<()> {
        self.connect_with_token(&CancellationToken::new()).await
    }

    /// Like [`NatsClient::connect`]; cancelling `token` stops trying further
    /// hosts.
    pub async fn connect_with_token(&self, token: &CancellationToken) -> NatsResult<()> {
        let inner = &self.inner;
        inner.ensure_not_disposed()?;
        async {
            let _lifecycle = inner.lifecycle.lock().await;
            inner.connect_locked(token).await
        }
        .instrument(inner.span.clone())
        .await
    }

    /// Drop the connection. Registered subscriptions are kept and replayed
    /// by the next `connect`. Never triggers auto-reconnect.
    pub async fn disconnect(&self) -> NatsResult<()> {
        let inner = &self.inner;
        inner.ensure_not_disposed()?;
        async {
            let _lifecycle = inner.lifecycle.lock().await;
            inner.epoch.fetch_add(1, Ordering::SeqCst);
            let was_connected = inner.state() == ClientState::Connected;
            let result = inner.release_locked().await;
            inner.set_state(ClientState::Disconnected);
            if was_connected {
                info!("disconnected by user");
                inner.events.send(ClientEvent::Disconnected {
                    reason: DisconnectReason::ByUser,
                });
            }
            result
        }
        .instrument(inner.span.clone())
        .await
    }

    /// Tear everything down: connection, subscriptions and streams. Further
    /// calls fail with [`NatsError::Disposed`]. Idempotent.
    pub async fn dispose(&self) -> NatsResult<()> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        async {
            let _lifecycle = inner.lifecycle.lock().await;
            inner.epoch.fetch_add(1, Ordering::SeqCst);
            let was_connected = inner.state() == ClientState::Connected;
            let mut errors = Vec::new();
            if let Err(err) = inner.release_locked().await {
                errors.push(err);
            }
            inner.set_state(ClientState::Disconnected);
            if was_connected {
                inner.events.send(ClientEvent::Disconnected {
                    reason: DisconnectReason::ByUser,
                });
            }
            let dropped = inner.subscriptions.clear();
            inner.ops.close();
            inner.events.close();
            info!(dropped_subscriptions = dropped, "client disposed");
            error::aggregate(errors)
        }
        .instrument(inner.span.clone())
        .await
    }

    pub async fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> NatsResult<()> {
        self.inner
            .publish_inner(subject, None, None, payload.as_ref(), false)
            .await
    }

    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: impl AsRef<[u8]>,
    ) -> NatsResult<()> {
        self.inner
            .publish_inner(subject, Some(reply_to), None, payload.as_ref(), false)
            .await
    }

    /// Publish with `HPUB`. The header block counts towards `max_payload`.
    pub async fn publish_with_headers(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
    ) -> NatsResult<()> {
        self.inner
            .publish_inner(subject, reply_to, Some(headers), payload.as_ref(), false)
            .await
    }

    pub async fn subscribe(&self, subject: &str) -> NatsResult<Subscription> {
        self.subscribe_with_info(SubscriptionInfo::new(subject)?)
            .await
    }

    pub async fn subscribe_queue(&self, subject: &str, queue_group: &str) -> NatsResult<Subscription> {
        self.subscribe_with_info(SubscriptionInfo::new(subject)?.with_queue_group(queue_group)?)
            .await
    }

    pub async fn subscribe_with_info(&self, info: SubscriptionInfo) -> NatsResult<Subscription> {
        self.inner.subscribe_internal(info, false).await
    }

    /// Subscribe and run `handler` for every message on a background task.
    pub async fn subscribe_with_handler<F, Fut>(
        &self,
        info: SubscriptionInfo,
        handler: F,
    ) -> NatsResult<HandlerSubscription>
    where
        F: FnMut(MsgOp) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subscription = self.inner.subscribe_internal(info, false).await?;
        Ok(HandlerSubscription::spawn(
            subscription,
            handler,
            self.inner.span.clone(),
        ))
    }

    pub async fn unsubscribe(&self, subscription: Subscription) -> NatsResult<()> {
        subscription.unsubscribe().await
    }

    /// Publish `payload` and wait for one reply, bounded by the configured
    /// request timeout.
    pub async fn request(&self, subject: &str, payload: impl AsRef<[u8]>) -> NatsResult<MsgOp> {
        self.request_with_timeout(subject, payload, self.inner.info.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> NatsResult<MsgOp> {
        self.inner
            .request_inner(subject, payload.as_ref(), timeout, &CancellationToken::new())
            .await
    }

    /// Like [`NatsClient::request`], also giving up when `token` is cancelled.
    pub async fn request_with_token(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        token: &CancellationToken,
    ) -> NatsResult<MsgOp> {
        self.inner
            .request_inner(subject, payload.as_ref(), self.inner.info.request_timeout, token)
            .await
    }

    pub async fn ping(&self) -> NatsResult<()> {
        self.inner
            .writer()?
            .write(true, |buf| {
                encode::write_ping(buf);
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn pong(&self) -> NatsResult<()> {
        self.inner
            .writer()?
            .write(true, |buf| {
                encode::write_pong(buf);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Flush buffered writes; needed with [`PubFlushMode::Manual`].
    pub async fn flush(&self) -> NatsResult<()> {
        self.inner.writer()?.flush().await
    }
}

impl fmt::Debug for NatsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsClient")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

impl ClientInner {
    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_not_disposed(&self) -> NatsResult<()> {
        if self.is_disposed() {
            return Err(NatsError::Disposed);
        }
        Ok(())
    }

    /// Writer of the live connection.
    fn writer(&self) -> NatsResult<ConnectionWriter> {
        self.ensure_not_disposed()?;
        self.live
            .read()
            .as_ref()
            .map(|live| live.writer.clone())
            .ok_or(NatsError::NotConnected)
    }

    fn max_payload(&self) -> u64 {
        self.server_info
            .read()
            .as_ref()
            .map_or(DEFAULT_MAX_PAYLOAD, |info| info.max_payload)
    }

    /// Caller holds `lifecycle`.
    async fn connect_locked(self: &Arc<Self>, cancel: &CancellationToken) -> NatsResult<()> {
        self.ensure_not_disposed()?;
        if self.state() == ClientState::Connected {
            debug!("already connected");
            return Ok(());
        }
        self.set_state(ClientState::Connecting);
        if let Err(err) = self.release_locked().await {
            debug!(?err, "errors while releasing stale connection");
        }

        let handshake = match manager::connect(&self.info, cancel).await {
            Ok(handshake) => handshake,
            Err(err) => {
                self.set_state(ClientState::Disconnected);
                return Err(err);
            }
        };
        let Handshake {
            connection,
            server_info,
            host,
            ops,
        } = handshake;
        let Connection { reader, writer } = connection;

        *self.server_info.write() = Some(Arc::new(server_info));
        *self.last_op.lock() = Instant::now();
        for op in ops {
            self.ops.send(op);
        }

        if let Err(err) = self.resubscribe(&writer).await {
            if let Err(teardown) = writer.shutdown().await {
                debug!(?teardown, "error tearing down connection after failed resubscribe");
            }
            self.set_state(ClientState::Disconnected);
            return Err(err);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        spawn_reader(self, reader, writer.clone(), token.clone(), generation);
        *self.live.write() = Some(LiveConnection {
            writer,
            token,
            generation,
        });
        self.set_state(ClientState::Connected);
        info!(
            %host,
            generation,
            subscriptions = self.subscriptions.len(),
            "client connected"
        );
        self.events.send(ClientEvent::Connected {
            host: host.to_string(),
        });
        Ok(())
    }

    /// Replay every registered subscription on a fresh connection.
    async fn resubscribe(&self, writer: &ConnectionWriter) -> NatsResult<()> {
        let plan = self.subscriptions.resubscribe_plan();
        if plan.is_empty() {
            return Ok(());
        }
        writer
            .write(true, |buf| {
                for (info, remaining) in &plan {
                    encode::write_sub(buf, info.subject(), info.queue_group(), info.id())?;
                    if let Some(remaining) = remaining {
                        encode::write_unsub(buf, info.id(), Some(*remaining))?;
                    }
                }
                Ok(())
            })
            .await?;
        debug!(count = plan.len(), "resubscribed");
        Ok(())
    }

    /// Cancel the reader, fail outstanding requests and close the
    /// connection. Caller holds `lifecycle`.
    async fn release_locked(&self) -> NatsResult<()> {
        let cancelled = self.inbox.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding requests");
        }
        self.subscriptions.clear_ephemeral();
        let live = self.live.write().take();
        let Some(live) = live else {
            return Ok(());
        };
        live.token.cancel();
        live.writer.shutdown().await
    }

    async fn handle_op(&self, op: Op, writer: &ConnectionWriter) -> NatsResult<()> {
        *self.last_op.lock() = Instant::now();
        metrics::OPS_RECEIVED.with_label_values(&[op.name()]).inc();
        trace!(op = op.name(), "received op");

        match &op {
            Op::Msg(msg) | Op::HMsg(msg) => match self.subscriptions.dispatch(msg.clone()) {
                Dispatch::Delivered | Dispatch::Dropped => {}
                Dispatch::Completed => trace!(sid = %msg.sid, "last message for subscription"),
                Dispatch::Unknown => {
                    metrics::UNROUTED_MESSAGES.inc();
                    debug!(sid = %msg.sid, subject = %msg.subject, "no subscription for message");
                }
            },
            Op::Info(raw) => self.update_server_info(raw),
            _ => {}
        }
        let server_error = match &op {
            Op::Err(message) => Some(message.clone()),
            _ => None,
        };
        let respond_to_ping = op == Op::Ping && self.info.auto_respond_to_ping;
        self.ops.send(op);

        if let Some(message) = server_error {
            return Err(NatsError::ClientReceivedErrOp(message));
        }
        if respond_to_ping {
            writer
                .write(true, |buf| {
                    encode::write_pong(buf);
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    fn update_server_info(&self, raw: &str) {
        match ServerInfo::parse(raw) {
            Ok(info) => {
                debug!(
                    server_id = %info.server_id,
                    max_payload = info.max_payload,
                    connect_urls = ?info.connect_urls,
                    "server info updated"
                );
                *self.server_info.write() = Some(Arc::new(info));
            }
            Err(err) => warn!(?err, "ignoring malformed INFO"),
        }
    }

    /// Runs when the reader saw nothing for `receive_timeout`.
    async fn check_liveness(
        &self,
        socket: &SocketOptions,
        writer: &ConnectionWriter,
    ) -> NatsResult<()> {
        let silence = self.last_op.lock().elapsed();
        if silence >= socket.max_silence {
            return Err(NatsError::ConnectionFoundIdling { silence });
        }
        if silence >= socket.ping_after_silence {
            debug!(?silence, "no data from server, sending PING");
            writer
                .write(true, |buf| {
                    encode::write_ping(buf);
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    async fn handle_worker_failure(self: &Arc<Self>, err: NatsError, generation: u64) {
        let epoch = {
            let _lifecycle = self.lifecycle.lock().await;
            let current = self.live.read().as_ref().map(|live| live.generation);
            if current != Some(generation) {
                debug!(?err, generation, "ignoring failure of a stale reader");
                return;
            }
            error!(?err, "connection worker failed");
            self.events.send(ClientEvent::WorkerFailed {
                error: Arc::new(err),
            });
            if let Err(err) = self.release_locked().await {
                debug!(?err, "errors while releasing failed connection");
            }
            self.set_state(ClientState::Disconnected);
            self.events.send(ClientEvent::Disconnected {
                reason: DisconnectReason::DueToFailure,
            });
            self.epoch.load(Ordering::SeqCst)
        };
        if self.info.auto_reconnect_on_failure && !self.is_disposed() {
            self.auto_reconnect(epoch).await;
        }
    }

    async fn auto_reconnect(self: &Arc<Self>, epoch: u64) {
        let policy = &self.info.reconnect;
        for attempt in 0..policy.max_attempts {
            let delay = policy.delay_for(attempt);
            debug!(
                attempt = attempt + 1,
                retry_in_ms = delay.as_millis(),
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;

            let _lifecycle = self.lifecycle.lock().await;
            if self.is_disposed() || self.epoch.load(Ordering::SeqCst) != epoch {
                debug!("reconnect abandoned");
                return;
            }
            if self.state() == ClientState::Connected {
                return;
            }
            metrics::RECONNECT_ATTEMPTS.inc();
            match self.connect_locked(&CancellationToken::new()).await {
                Ok(()) => {
                    info!(attempt = attempt + 1, "reconnected");
                    return;
                }
                Err(err) => warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    ?err,
                    "reconnect attempt failed"
                ),
            }
        }
        error!(attempts = policy.max_attempts, "giving up on reconnect");
        self.events.send(ClientEvent::AutoReconnectFailed {
            attempts: policy.max_attempts,
        });
    }

    async fn publish_inner(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: &[u8],
        force_flush: bool,
    ) -> NatsResult<()> {
        let writer = self.writer()?;
        let header_len = match headers {
            Some(headers) => {
                let mut block = BytesMut::new();
                headers.encode(&mut block)?;
                block.len()
            }
            None => 0,
        };
        let size = (header_len + payload.len()) as u64;
        let max = self.max_payload();
        if size > max {
            return Err(NatsError::ExceededMaxPayload { size, max });
        }

        let flush = force_flush || self.info.pub_flush_mode == PubFlushMode::Auto;
        writer
            .write(flush, |buf| match headers {
                Some(headers) => encode::write_hpub(buf, subject, reply_to, headers, payload),
                None => encode::write_pub(buf, subject, reply_to, payload),
            })
            .await?;
        metrics::MESSAGES_PUBLISHED.inc();
        metrics::BYTES_PUBLISHED.inc_by(payload.len() as u64);
        Ok(())
    }

    async fn subscribe_internal(
        self: &Arc<Self>,
        info: SubscriptionInfo,
        ephemeral: bool,
    ) -> NatsResult<Subscription> {
        let writer = self.writer()?;
        let capacity = if ephemeral {
            1
        } else {
            self.info.subscription_capacity
        };
        let (tx, rx) = mpsc::channel(capacity);
        self.subscriptions
            .insert(info.clone(), Sink::Channel(tx), ephemeral)?;
        if let Err(err) = send_sub(&writer, &info).await {
            self.subscriptions.remove(info.id());
            return Err(err);
        }
        debug!(sid = info.id(), subject = info.subject(), "subscribed");
        Ok(Subscription::new(info, rx, Arc::downgrade(self)))
    }

    /// Explicit unsubscribe. Without a live connection the entry is still
    /// removed, so it is not replayed on reconnect, and `NotConnected` is
    /// returned.
    pub(crate) async fn unsubscribe_info(&self, info: &SubscriptionInfo) -> NatsResult<()> {
        self.ensure_not_disposed()?;
        let removed = self.subscriptions.remove(info.id()).is_some();
        let writer = self.writer()?;
        if !removed {
            return Ok(());
        }
        writer
            .write(true, |buf| encode::write_unsub(buf, info.id(), None))
            .await?;
        debug!(sid = info.id(), "unsubscribed");
        Ok(())
    }

    /// Subscription handle dropped: remove it now, send `UNSUB` in the
    /// background.
    pub(crate) fn release_subscription(&self, info: &SubscriptionInfo) {
        if self.subscriptions.remove(info.id()).is_none() {
            return;
        }
        let Ok(writer) = self.writer() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(sid = info.id(), "no runtime to send UNSUB from");
            return;
        };
        let sid = info.id().to_string();
        runtime.spawn(
            async move {
                if let Err(err) = writer
                    .write(true, |buf| encode::write_unsub(buf, &sid, None))
                    .await
                {
                    debug!(?err, %sid, "failed to send UNSUB for dropped subscription");
                }
            }
            .instrument(self.span.clone()),
        );
    }

    async fn ensure_inbox(&self) -> NatsResult<()> {
        let mut sid = self.inbox_sid.lock().await;
        if let Some(existing) = sid.as_deref() {
            if self.subscriptions.contains(existing) {
                return Ok(());
            }
        }
        let writer = self.writer()?;
        let info = SubscriptionInfo::new(self.inbox.subject())?;
        self.subscriptions
            .insert(info.clone(), Sink::Inbox(self.inbox.clone()), false)?;
        if let Err(err) = send_sub(&writer, &info).await {
            self.subscriptions.remove(info.id());
            return Err(err);
        }
        debug!(subject = info.subject(), "inbox subscription created");
        *sid = Some(info.id().to_string());
        Ok(())
    }

    async fn request_inner(
        self: &Arc<Self>,
        subject: &str,
        payload: &[u8],
        timeout: Duration,
        token: &CancellationToken,
    ) -> NatsResult<MsgOp> {
        self.writer()?;
        if self.info.use_inbox_requests {
            self.ensure_inbox().await?;
            let id = request::new_id();
            let (reply, _pending) = self.inbox.register(&id)?;
            let reply_to = self.inbox.reply_subject(&id);
            trace!(%subject, %reply_to, pending = self.inbox.pending(), "sending request");
            self.publish_inner(subject, Some(&reply_to), None, payload, true)
                .await?;
            request::await_reply(async move { reply.await.ok() }, subject, timeout, token).await
        } else {
            let reply_to = request::new_inbox();
            let info = SubscriptionInfo::new(reply_to.as_str())?.with_max_messages(1)?;
            let mut subscription = self.subscribe_internal(info, true).await?;
            self.publish_inner(subject, Some(&reply_to), None, payload, true)
                .await?;
            request::await_reply(subscription.next(), subject, timeout, token).await
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(live) = self.live.get_mut().take() {
            live.token.cancel();
        }
    }
}

/// `SUB`, plus `UNSUB <sid> <max>` when the subscription is bounded.
async fn send_sub(writer: &ConnectionWriter, info: &SubscriptionInfo) -> NatsResult<()> {
    writer
        .write(true, |buf| {
            encode::write_sub(buf, info.subject(), info.queue_group(), info.id())?;
            if let Some(max) = info.max_messages() {
                encode::write_unsub(buf, info.id(), Some(max))?;
            }
            Ok(())
        })
        .await?;
    Ok(())
}

fn spawn_reader(
    client: &Arc<ClientInner>,
    reader: OpReader,
    writer: ConnectionWriter,
    token: CancellationToken,
    generation: u64,
) {
    let task = reader_loop(
        Arc::downgrade(client),
        reader,
        writer,
        token,
        generation,
        client.info.socket.clone(),
    );
    tokio::spawn(task.instrument(client.span.clone()));
}

async fn reader_loop(
    client: Weak<ClientInner>,
    mut reader: OpReader,
    writer: ConnectionWriter,
    token: CancellationToken,
    generation: u64,
    socket: SocketOptions,
) {
    debug!(generation, "reader started");
    let result = AssertUnwindSafe(read_ops(&client, &mut reader, &writer, &token, &socket))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            error!(generation, "reader panicked");
            Err(NatsError::ReaderPanicked(panic_message(&*panic)))
        });
    drop(reader);
    if token.is_cancelled() {
        debug!(generation, "reader stopped");
        return;
    }
    let Err(err) = result else {
        return;
    };
    if let Some(client) = client.upgrade() {
        client.handle_worker_failure(err, generation).await;
    }
}

async fn read_ops(
    client: &Weak<ClientInner>,
    reader: &mut OpReader,
    writer: &ConnectionWriter,
    token: &CancellationToken,
    socket: &SocketOptions,
) -> NatsResult<()> {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            next = tokio::time::timeout(socket.receive_timeout, reader.next_op()) => next,
        };
        let Some(client) = client.upgrade() else {
            return Ok(());
        };
        match next {
            Ok(Ok(Some(op @ Op::Info(_)))) => {
                client.handle_op(op, writer).await?;
                reader.set_max_payload(client.max_payload());
            }
            Ok(Ok(Some(op))) => client.handle_op(op, writer).await?,
            Ok(Ok(None)) => return Err(NatsError::ConnectionClosed),
            Ok(Err(err)) => return Err(err),
            Err(_) => client.check_liveness(socket, writer).await?,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
