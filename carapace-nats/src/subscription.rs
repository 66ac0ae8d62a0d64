//! Subscription registry and dispatcher.
//!
//! The registry maps sids to delivery queues. The read loop routes every
//! MSG/HMSG by sid under the registry lock, which only ever performs
//! non-blocking sends, so a slow consumer costs the read loop nothing beyond
//! a dropped message.
//!
//! Sids are allocated from a monotonic counter and never reused. Entries are
//! kept in a `BTreeMap` so replay after a reconnect follows registration
//! order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use carapace_core::backpressure::{Admission, PendingCounter, PendingLimits};
use carapace_core::error::{Error, Result};
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::codec::ClientOp;
use crate::connection::Shared;
use crate::message::Message;

/// Async message handler for callback-mode subscriptions.
pub(crate) type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-subscription knobs.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Queue group; the broker delivers each message to one member.
    pub queue: Option<String>,
    /// Overrides the client-wide pending limits.
    pub limits: Option<PendingLimits>,
}

impl SubscribeOptions {
    pub fn queue(group: impl Into<String>) -> Self {
        Self {
            queue: Some(group.into()),
            limits: None,
        }
    }

    pub fn with_limits(mut self, msgs: usize, bytes: usize) -> Self {
        self.limits = Some(PendingLimits::new(msgs, bytes));
        self
    }
}

/// Snapshot of one subscription's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub pending_msgs: usize,
    pub pending_bytes: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub limits: PendingLimits,
}

/// Counters shared between the dispatcher and the consuming side.
#[derive(Debug)]
pub(crate) struct SubState {
    pub(crate) counter: PendingCounter,
    drained: Notify,
}

impl SubState {
    fn new(limits: PendingLimits) -> Self {
        Self {
            counter: PendingCounter::new(limits),
            drained: Notify::new(),
        }
    }

    /// A message left the queue (handle mode) or its handler returned.
    pub(crate) fn release(&self, len: usize) {
        if self.counter.release(len) {
            self.drained.notify_waiters();
        }
    }

    /// Wait until nothing is queued or being handled.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.counter.pending_msgs() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            pending_msgs: self.counter.pending_msgs(),
            pending_bytes: self.counter.pending_bytes(),
            delivered: self.counter.delivered(),
            dropped: self.counter.dropped(),
            limits: self.counter.limits(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Delivery {
    /// Application subscription (handle or handler mode)
    Queue(flume::Sender<Message>),
    /// Multiplexed request inbox, resolved by the correlator
    Inbox,
}

#[derive(Debug)]
pub(crate) struct SubEntry {
    subject: String,
    queue: Option<String>,
    delivery: Delivery,
    state: Arc<SubState>,
    max: Option<u64>,
    received: u64,
}

/// Where the read loop should send a message next.
#[derive(Debug)]
pub(crate) enum Routed {
    Delivered,
    Inbox(Message),
    SlowConsumer { sid: u64, subject: String },
    NoSubscription,
}

#[derive(Debug)]
pub(crate) struct Registry {
    next_sid: u64,
    entries: BTreeMap<u64, SubEntry>,
    /// SUB/UNSUB go straight to the wire only while this is set; otherwise
    /// the next reconnect replays the registry.
    pub(crate) live: bool,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            next_sid: 1,
            entries: BTreeMap::new(),
            live: false,
        }
    }

    pub(crate) fn insert(
        &mut self,
        subject: &str,
        queue: Option<&str>,
        delivery: Delivery,
        limits: PendingLimits,
    ) -> (u64, Arc<SubState>) {
        let sid = self.next_sid;
        self.next_sid += 1;
        let state = Arc::new(SubState::new(limits));
        self.entries.insert(
            sid,
            SubEntry {
                subject: subject.to_string(),
                queue: queue.map(str::to_string),
                delivery,
                state: Arc::clone(&state),
                max: None,
                received: 0,
            },
        );
        (sid, state)
    }

    pub(crate) fn contains(&self, sid: u64) -> bool {
        self.entries.contains_key(&sid)
    }

    pub(crate) fn remove(&mut self, sid: u64) -> bool {
        self.entries.remove(&sid).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Arm auto-unsubscribe. Returns true if the limit is already reached and
    /// the entry was removed.
    pub(crate) fn set_max(&mut self, sid: u64, max: u64) -> Result<bool> {
        let entry = self
            .entries
            .get_mut(&sid)
            .ok_or(Error::InvalidSubscription(sid))?;
        if entry.received >= max {
            self.entries.remove(&sid);
            return Ok(true);
        }
        entry.max = Some(max);
        Ok(false)
    }

    /// Route one inbound message by sid.
    pub(crate) fn route(&mut self, msg: Message) -> Routed {
        let sid = msg.sid;
        let Some(entry) = self.entries.get_mut(&sid) else {
            return Routed::NoSubscription;
        };
        let tx = match &entry.delivery {
            Delivery::Inbox => return Routed::Inbox(msg),
            Delivery::Queue(tx) => tx,
        };

        match entry.state.counter.admit(msg.length) {
            Admission::Accepted => {}
            Admission::Dropped { first_in_episode } => {
                trace!("[Dispatcher] Dropping message for sid {}", sid);
                if first_in_episode {
                    return Routed::SlowConsumer {
                        sid,
                        subject: entry.subject.clone(),
                    };
                }
                return Routed::Delivered;
            }
        }

        let len = msg.length;
        if tx.send(msg).is_err() {
            // Receiver gone: the handle was dropped without unsubscribing.
            entry.state.counter.release(len);
        }
        entry.received += 1;
        if entry.max.is_some_and(|max| entry.received >= max) {
            debug!("[Dispatcher] sid {} reached its delivery limit", sid);
            self.entries.remove(&sid);
        }
        Routed::Delivered
    }

    /// SUB (and pending auto-unsubscribe) frames for every live entry.
    pub(crate) fn replay(&self, dst: &mut BytesMut) {
        for (&sid, entry) in &self.entries {
            ClientOp::Sub {
                subject: &entry.subject,
                queue: entry.queue.as_deref(),
                sid,
            }
            .encode(dst);
            if let Some(max) = entry.max {
                ClientOp::Unsub {
                    sid,
                    max: Some(max.saturating_sub(entry.received)),
                }
                .encode(dst);
            }
        }
    }

    /// Application subscriptions (everything except the request inbox).
    pub(crate) fn user_subscriptions(&self) -> Vec<(u64, Arc<SubState>)> {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e.delivery, Delivery::Queue(_)))
            .map(|(&sid, e)| (sid, Arc::clone(&e.state)))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        for entry in self.entries.values() {
            entry.state.counter.clear();
            entry.state.drained.notify_waiters();
        }
        self.entries.clear();
        self.live = false;
    }
}

/// Run `handler` for every message of one subscription, in order.
///
/// The pending count is released only after the handler returns, so a
/// drain waits for in-progress handlers.
pub(crate) fn spawn_handler(
    rx: flume::Receiver<Message>,
    state: Arc<SubState>,
    handler: Handler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(msg) = rx.recv_async().await {
            let len = msg.length;
            handler(msg).await;
            state.release(len);
        }
    })
}

/// Handle to one subscription.
///
/// In handle mode messages are pulled with [`Subscription::next`]; dropping
/// the handle unsubscribes. In handler mode the handler task owns delivery
/// and the handle is only used for control and statistics.
pub struct Subscription {
    sid: u64,
    subject: String,
    queue: Option<String>,
    receiver: Option<flume::Receiver<Message>>,
    state: Arc<SubState>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        queue: Option<String>,
        receiver: Option<flume::Receiver<Message>>,
        state: Arc<SubState>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            sid,
            subject,
            queue,
            receiver,
            state,
            shared,
        }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Next message, in arrival order.
    ///
    /// Returns `None` once the subscription is gone (unsubscribed, drained,
    /// auto-unsubscribe limit reached, client closed) and its queue is empty.
    /// Always `None` in handler mode.
    pub async fn next(&self) -> Option<Message> {
        let rx = self.receiver.as_ref()?;
        let msg = rx.recv_async().await.ok()?;
        self.state.release(msg.length);
        Some(msg)
    }

    /// Like [`Subscription::next`] with a deadline.
    pub async fn next_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        tokio::time::timeout(timeout, self.next())
            .await
            .map_err(|_| Error::Timeout)
    }

    /// A queued message, without waiting.
    pub fn try_next(&self) -> Option<Message> {
        let msg = self.receiver.as_ref()?.try_recv().ok()?;
        self.state.release(msg.length);
        Some(msg)
    }

    /// Stop delivery now. Messages already queued can still be read.
    pub fn unsubscribe(&self) -> Result<()> {
        self.shared.unsubscribe(self.sid, None)
    }

    /// Stop after `max` messages in total have been delivered.
    pub fn unsubscribe_after(&self, max: u64) -> Result<()> {
        self.shared.unsubscribe(self.sid, Some(max))
    }

    /// Unsubscribe, then wait until everything already in flight was
    /// consumed, bounded by the client's drain timeout.
    pub async fn drain(&self) -> Result<()> {
        self.shared.drain_subscription(self.sid, &self.state).await
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.state.stats()
    }

    /// Whether the registry still routes messages to this subscription.
    pub fn is_active(&self) -> bool {
        self.shared.subs.lock().contains(self.sid)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.receiver.is_some() && self.is_active() {
            let _ = self.shared.unsubscribe(self.sid, None);
        }
    }
}
