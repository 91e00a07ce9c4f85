//! Broadcast hub
//!
//! Fans session-scoped observer messages out to every subscriber of that
//! session. Each subscriber owns a bounded queue; a subscriber whose queue
//! stays full for longer than the publish timeout, or whose receiver is gone,
//! is dropped so one slow observer never stalls ingestion for the others.
//!
//! Delivery is best-effort and at-most-once. Nothing is replayed: observers
//! that reconnect re-fetch history from the session store.

use callhub_common::events::ObserverMessage;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifies one subscription for [`BroadcastHub::unsubscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    session_id: Uuid,
    id: u64,
}

impl SubscriptionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

/// Receiving side of a subscription
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::Receiver<ObserverMessage>,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Next message; `None` once the hub dropped this subscriber
    pub async fn recv(&mut self) -> Option<ObserverMessage> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining in tests and diagnostics
    pub fn try_recv(&mut self) -> Option<ObserverMessage> {
        self.rx.try_recv().ok()
    }

    /// Split into the raw queue and a guard that unsubscribes when dropped
    pub fn detach(self, hub: Arc<BroadcastHub>) -> (mpsc::Receiver<ObserverMessage>, UnsubscribeOnDrop) {
        let guard = UnsubscribeOnDrop {
            hub,
            handle: self.handle,
        };
        (self.rx, guard)
    }
}

/// Unsubscribes its handle when dropped (e.g. when an SSE client disconnects)
pub struct UnsubscribeOnDrop {
    hub: Arc<BroadcastHub>,
    handle: SubscriptionHandle,
}

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.handle);
    }
}

/// Outcome of one publish
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ObserverMessage>,
}

/// Session-scoped fan-out of observer messages
#[derive(Debug)]
pub struct BroadcastHub {
    subscribers: DashMap<Uuid, Vec<Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
    publish_timeout: Duration,
}

impl BroadcastHub {
    /// Create a hub
    ///
    /// # Arguments
    /// * `buffer` - Messages queued per subscriber before it counts as slow
    /// * `publish_timeout` - Longest a publish waits on one full subscriber
    pub fn new(buffer: usize, publish_timeout: Duration) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            publish_timeout,
        }
    }

    /// Subscribe to all future messages for `session_id`
    pub fn subscribe(&self, session_id: Uuid) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        self.subscribers
            .entry(session_id)
            .or_default()
            .push(Subscriber { id, tx });

        info!("Hub: observer {} subscribed to session {}", id, session_id);
        Subscription {
            handle: SubscriptionHandle { session_id, id },
            rx,
        }
    }

    /// Remove a subscription; false if it was already gone
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.remove_subscribers(handle.session_id, &[handle.id]);
        if removed > 0 {
            info!("Hub: observer {} left session {}", handle.id, handle.session_id);
        }
        removed > 0
    }

    /// Deliver `message` to every subscriber of `session_id`
    ///
    /// Subscribers are served concurrently; each gets at most
    /// `publish_timeout` to accept the message before it is dropped.
    pub async fn publish(&self, session_id: Uuid, message: ObserverMessage) -> PublishReport {
        let targets: Vec<Subscriber> = match self.subscribers.get(&session_id) {
            Some(list) => list.clone(),
            None => {
                debug!("Hub: no observers for {} on session {}", message.event_type(), session_id);
                return PublishReport::default();
            }
        };

        let timeout = self.publish_timeout;
        let deliveries = targets.into_iter().map(|subscriber| {
            let message = message.clone();
            async move {
                let accepted = match subscriber.tx.try_send(message) {
                    Ok(()) => true,
                    Err(TrySendError::Full(message)) => {
                        subscriber.tx.send_timeout(message, timeout).await.is_ok()
                    }
                    Err(TrySendError::Closed(_)) => false,
                };
                (subscriber.id, accepted)
            }
        });
        let results = join_all(deliveries).await;

        let dead: Vec<u64> = results
            .iter()
            .filter(|(_, accepted)| !accepted)
            .map(|(id, _)| *id)
            .collect();
        let report = PublishReport {
            delivered: results.len() - dead.len(),
            dropped: dead.len(),
        };

        if !dead.is_empty() {
            self.remove_subscribers(session_id, &dead);
            info!(
                "Hub: dropped {} slow or disconnected observer(s) from session {}",
                dead.len(),
                session_id
            );
        }

        debug!(
            "Hub: {} delivered to {} observer(s) of session {}",
            message.event_type(),
            report.delivered,
            session_id
        );
        report
    }

    /// Number of live subscribers for a session
    pub fn subscriber_count(&self, session_id: Uuid) -> usize {
        self.subscribers.get(&session_id).map(|l| l.len()).unwrap_or(0)
    }

    /// Total subscribers across all sessions
    pub fn total_subscribers(&self) -> usize {
        self.subscribers.iter().map(|e| e.value().len()).sum()
    }

    fn remove_subscribers(&self, session_id: Uuid, ids: &[u64]) -> usize {
        let removed = match self.subscribers.get_mut(&session_id) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|s| !ids.contains(&s.id));
                before - list.len()
            }
            None => 0,
        };
        self.subscribers.remove_if(&session_id, |_, list| list.is_empty());
        removed
    }
}
