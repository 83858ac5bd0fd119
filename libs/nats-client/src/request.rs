//! Request/reply correlation.
//!
//! With the shared inbox every request on a client replies to
//! `_INBOX.<client-nuid>.<request-id>` and one wildcard subscription receives
//! them all; [`InboxRouter`] hands each reply to the request waiting on its id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nats_wire::MsgOp;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::INBOX_PREFIX;
use crate::error::{NatsError, NatsResult};
use crate::metrics;

/// Fresh unique token for inbox subjects and request ids.
pub(crate) fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A unique reply subject outside any shared inbox.
pub(crate) fn new_inbox() -> String {
    format!("{INBOX_PREFIX}.{}", new_id())
}

pub(crate) struct InboxRouter {
    prefix: String,
    pending: Mutex<HashMap<String, oneshot::Sender<MsgOp>>>,
}

impl InboxRouter {
    pub(crate) fn new() -> Self {
        Self {
            prefix: new_inbox(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Subject the shared inbox subscription listens on.
    pub(crate) fn subject(&self) -> String {
        format!("{}.*", self.prefix)
    }

    pub(crate) fn reply_subject(&self, id: &str) -> String {
        format!("{}.{id}", self.prefix)
    }

    /// Register a waiter for `id`. The returned guard unregisters it when
    /// dropped, whichever way the request ends.
    pub(crate) fn register(
        self: &Arc<Self>,
        id: &str,
    ) -> NatsResult<(oneshot::Receiver<MsgOp>, PendingGuard)> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        if pending.contains_key(id) {
            return Err(NatsError::InitRequest(format!(
                "request id '{id}' is already pending"
            )));
        }
        pending.insert(id.to_string(), tx);
        Ok((
            rx,
            PendingGuard {
                router: self.clone(),
                id: id.to_string(),
            },
        ))
    }

    /// Complete the request the reply subject points at. Returns false if
    /// nobody is waiting for it any more.
    pub(crate) fn route(&self, msg: MsgOp) -> bool {
        let id = match msg
            .subject
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
        {
            Some(id) => id.to_string(),
            None => {
                debug!(subject = %msg.subject, "reply outside of inbox");
                return false;
            }
        };
        let Some(tx) = self.pending.lock().remove(&id) else {
            trace!(%id, "late or unknown reply");
            return false;
        };
        tx.send(msg).is_ok()
    }

    /// Fail every pending request with a cancellation.
    pub(crate) fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

pub(crate) struct PendingGuard {
    router: Arc<InboxRouter>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.router.pending.lock().remove(&self.id);
    }
}

/// Wait for `reply`, bounded by `timeout` and `token`, whichever fires first.
///
/// `reply` resolving to `None` means the waiter was torn down (client
/// released) and counts as a cancellation.
pub(crate) async fn await_reply<F>(
    reply: F,
    subject: &str,
    timeout: Duration,
    token: &CancellationToken,
) -> NatsResult<MsgOp>
where
    F: Future<Output = Option<MsgOp>>,
{
    let outcome = tokio::select! {
        _ = token.cancelled() => None,
        outcome = tokio::time::timeout(timeout, reply) => Some(outcome),
    };
    match outcome {
        None | Some(Ok(None)) => Err(NatsError::RequestCancelled {
            subject: subject.to_string(),
        }),
        Some(Err(_)) => {
            metrics::REQUEST_TIMEOUTS.inc();
            debug!(%subject, ?timeout, "request timed out");
            Err(NatsError::RequestTimedOut {
                subject: subject.to_string(),
                timeout,
            })
        }
        Some(Ok(Some(msg))) if msg.is_no_responders() => Err(NatsError::NoResponders {
            subject: subject.to_string(),
        }),
        Some(Ok(Some(msg))) => Ok(msg),
    }
}
