//! IQ reaper: guarantees every IQ request gets a response.
//!
//! Each `get`/`set` IQ passing through the router is remembered with a deadline.
//! A `result`/`error` IQ with the same id cancels it. When a deadline passes
//! first, a generic error reply is synthesized and handed back to the router.
//!
//! The deadline queue and the id lookup map share one lock, so cancelling and
//! expiring the same id can never both happen.

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, trace, warn};

use crate::metrics;
use crate::stanza::{IqType, Stanza, StanzaKind};
use crate::XopError;

/// Receives the error replies synthesized for expired IQs.
pub type ExpirySink = Arc<dyn Fn(Stanza) + Send + Sync>;

/// What the reaper did with a stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperAction {
    /// A request is now waiting for its response
    Tracked,
    /// A request replaced a pending one with the same id
    Replaced,
    /// A response cancelled the pending request
    Cancelled,
    /// A response arrived with no pending request
    NotFound,
    /// The stanza is not tracked (not an IQ, no id, unknown type, or reaper stopped)
    Ignored,
}

/// An IQ request waiting for a response.
#[derive(Debug, Clone)]
pub struct DelayedIq {
    /// The original request
    pub stanza: Stanza,
    /// When the request expires
    pub deadline: Instant,
}

#[derive(Debug)]
struct PendingIq {
    key: delay_queue::Key,
    delayed: DelayedIq,
}

#[derive(Debug)]
struct ReaperState {
    deadlines: DelayQueue<String>,
    pending: HashMap<String, PendingIq>,
}

impl ReaperState {
    fn new() -> Self {
        Self {
            deadlines: DelayQueue::new(),
            pending: HashMap::new(),
        }
    }
}

struct Inner {
    state: Mutex<ReaperState>,
    timeout: Duration,
    handle: Handle,
    inserted: Notify,
    cancel: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ReaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_expired(&self, cx: &mut Context<'_>) -> Poll<Option<DelayedIq>> {
        let mut state = self.lock();
        match state.deadlines.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let id = expired.into_inner();
                Poll::Ready(state.pending.remove(&id).map(|p| p.delayed))
            }
            // an empty queue is woken through `inserted`
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

/// Background expiry engine for IQ requests.
pub struct IqReaper {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IqReaper {
    /// Start the reaper loop on the current Tokio runtime.
    pub fn start(timeout: Duration, sink: ExpirySink) -> Result<Self, XopError> {
        let handle = Handle::try_current().map_err(|e| XopError::NoRuntime(e.to_string()))?;
        Ok(Self::start_on(timeout, sink, &handle))
    }

    /// Start the reaper loop on the given runtime.
    pub fn start_on(timeout: Duration, sink: ExpirySink, handle: &Handle) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(ReaperState::new()),
            timeout,
            handle: handle.clone(),
            inserted: Notify::new(),
            cancel: CancellationToken::new(),
        });
        let task = handle.spawn(run(Arc::clone(&inner), sink));

        debug!(timeout_ms = timeout.as_millis() as u64, "IQ reaper started");

        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// Track or settle an IQ.
    ///
    /// Requests (`get`/`set`) start a timeout, replacing any pending request with
    /// the same id. Responses (`result`/`error`) cancel the pending request.
    pub fn handle_delayed_iq(&self, stanza: &Stanza) -> ReaperAction {
        if stanza.kind() != StanzaKind::Iq || self.inner.cancel.is_cancelled() {
            return ReaperAction::Ignored;
        }
        let Some(id) = stanza.id() else {
            trace!("IQ without id is not tracked");
            return ReaperAction::Ignored;
        };
        let Some(iq_type) = stanza.iq_type() else {
            return ReaperAction::Ignored;
        };

        if iq_type.is_request() {
            self.track(id, stanza)
        } else {
            self.settle(id, iq_type)
        }
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Check if a request with this id is waiting for a response.
    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.lock().pending.contains_key(id)
    }

    /// Configured IQ timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Stop the reaper loop and forget every pending request.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "IQ reaper task ended abnormally");
            }
        }

        let mut state = self.inner.lock();
        let abandoned = state.pending.len();
        state.pending.clear();
        state.deadlines.clear();
        debug!(abandoned, "IQ reaper stopped");
    }

    fn track(&self, id: &str, stanza: &Stanza) -> ReaperAction {
        // DelayQueue arms its timer on the reaper's runtime
        let _guard = self.inner.handle.enter();
        let deadline = Instant::now() + self.inner.timeout;

        let replaced = {
            let mut state = self.inner.lock();
            let previous = state.pending.remove(id);
            if let Some(previous) = &previous {
                state.deadlines.remove(&previous.key);
            }

            let key = state.deadlines.insert_at(id.to_string(), deadline);
            state.pending.insert(
                id.to_string(),
                PendingIq {
                    key,
                    delayed: DelayedIq {
                        stanza: stanza.clone(),
                        deadline,
                    },
                },
            );
            previous.is_some()
        };
        self.inner.inserted.notify_one();

        if replaced {
            debug!(id, "IQ request replaced a pending request with the same id");
            ReaperAction::Replaced
        } else {
            trace!(id, "IQ request tracked");
            ReaperAction::Tracked
        }
    }

    fn settle(&self, id: &str, iq_type: IqType) -> ReaperAction {
        let _guard = self.inner.handle.enter();
        let mut state = self.inner.lock();
        match state.pending.remove(id) {
            Some(pending) => {
                state.deadlines.remove(&pending.key);
                trace!(id, iq_type = iq_type.as_str(), "IQ response cancelled timeout");
                ReaperAction::Cancelled
            }
            None => ReaperAction::NotFound,
        }
    }
}

impl Drop for IqReaper {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

async fn run(inner: Arc<Inner>, sink: ExpirySink) {
    loop {
        let expired = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = inner.inserted.notified() => continue,
            expired = poll_fn(|cx| inner.poll_expired(cx)) => expired,
        };

        let Some(delayed) = expired else {
            continue;
        };

        info!(
            id = ?delayed.stanza.id(),
            to = ?delayed.stanza.to().map(|j| j.to_string()),
            from = ?delayed.stanza.from().map(|j| j.to_string()),
            "IQ request timed out, answering with error"
        );
        metrics::record_iq_timeout();

        if let Some(reply) = delayed.stanza.generic_iq_error() {
            sink(reply);
        }
    }
}
