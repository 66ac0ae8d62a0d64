//! Request/reply correlation.
//!
//! In multiplexed mode one wildcard subscription `<prefix>.<token>.*` is
//! created on first use and every request gets its own suffix under it.
//! Replies are matched by suffix against the pending table. A pending entry
//! is removed by whichever comes first: its last expected reply, or the
//! caller giving up (timeout, cancellation), via [`PendingGuard`].

use std::sync::atomic::{AtomicU64, Ordering};

use carapace_core::error::Result;
use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Notify;
use tracing::trace;

use crate::message::Message;

const TOKEN_LEN: usize = 22;

/// Random token for inbox subjects.
pub fn token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Fresh unique inbox subject under `prefix`.
pub fn new_inbox(prefix: &str) -> String {
    format!("{prefix}.{}", token())
}

#[derive(Debug)]
pub(crate) struct Inbox {
    /// `<prefix>.<token>.`, replies carry one more token
    pub(crate) prefix: String,
    pub(crate) sid: u64,
}

#[derive(Debug)]
struct PendingRequest {
    tx: flume::Sender<Message>,
    remaining: usize,
}

#[derive(Debug)]
pub(crate) struct Correlator {
    inbox: OnceCell<Inbox>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingRequest>>,
    idle: Notify,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            inbox: OnceCell::new(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    /// The shared inbox, created by `create` on first use.
    pub(crate) fn inbox<F>(&self, create: F) -> Result<&Inbox>
    where
        F: FnOnce() -> Result<Inbox>,
    {
        self.inbox.get_or_try_init(create)
    }

    pub(crate) fn inbox_sid(&self) -> Option<u64> {
        self.inbox.get().map(|i| i.sid)
    }

    /// Register a request expecting up to `max` replies.
    ///
    /// Returns the reply subject, the reply receiver and the guard that
    /// removes the entry when dropped.
    pub(crate) fn register<'a>(
        &'a self,
        inbox: &Inbox,
        max: usize,
    ) -> (String, flume::Receiver<Message>, PendingGuard<'a>) {
        let suffix = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = flume::unbounded();
        self.pending.lock().insert(
            suffix.clone(),
            PendingRequest {
                tx,
                remaining: max.max(1),
            },
        );
        let reply = format!("{}{}", inbox.prefix, suffix);
        (reply, rx, PendingGuard { correlator: self, suffix })
    }

    /// Hand a reply on the inbox to its waiting request.
    pub(crate) fn resolve(&self, msg: Message) {
        let Some(inbox) = self.inbox.get() else {
            return;
        };
        let Some(suffix) = msg.subject.strip_prefix(inbox.prefix.as_str()).map(str::to_string) else {
            return;
        };
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&suffix) else {
            trace!("[Correlator] Late reply for {}", suffix);
            return;
        };
        let terminal = msg.is_no_responders();
        let _ = entry.tx.send(msg);
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining == 0 || terminal {
            pending.remove(&suffix);
            if pending.is_empty() {
                self.idle.notify_waiters();
            }
        }
    }

    fn remove(&self, suffix: &str) {
        let mut pending = self.pending.lock();
        if pending.remove(suffix).is_some() && pending.is_empty() {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait until no request is outstanding.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending_len() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drop every outstanding request; their callers see the client closed.
    pub(crate) fn fail_all(&self) {
        self.pending.lock().clear();
        self.idle.notify_waiters();
    }
}

/// Removes a pending request when the caller stops waiting.
pub(crate) struct PendingGuard<'a> {
    correlator: &'a Correlator,
    suffix: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.remove(&self.suffix);
    }
}
