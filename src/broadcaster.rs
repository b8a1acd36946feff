//! Process-wide activity fan-out and the per-connection SSE task.
//!
//! One [`ActivityHub`] exists per process. It is built in `main` and shared
//! through the router state, so tests can use a fresh hub each.
//! Delivery is best-effort and at-most-once: a connection only sees
//! activity published while it is subscribed, and nothing is replayed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::types::ActivityEvent;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Messages written to an SSE connection, one per `data:` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StreamMessage {
    Connected,
    Activity(Arc<ActivityEvent>),
    Heartbeat,
}

#[derive(Debug, Default)]
pub struct ActivityHub {
    next_id: AtomicU64,
    subscribers: DashMap<u64, mpsc::UnboundedSender<Arc<ActivityEvent>>>,
    last_webhook: RwLock<Option<DateTime<Utc>>>,
}

impl ActivityHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. It is removed again when the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        debug!(id, "activity subscriber registered");
        Subscription {
            id,
            hub: Arc::clone(self),
            rx,
        }
    }

    /// Hands `event` to every current subscriber. Returns how many accepted it.
    pub fn publish(&self, event: ActivityEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        for subscriber in self.subscribers.iter() {
            if subscriber.value().send(Arc::clone(&event)).is_ok() {
                delivered += 1;
            }
        }
        trace!(event_id = %event.event_id, delivered, "activity published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn record_webhook(&self, at: DateTime<Utc>) {
        if let Ok(mut last) = self.last_webhook.write() {
            *last = Some(at);
        }
    }

    pub fn last_webhook(&self) -> Option<DateTime<Utc>> {
        self.last_webhook.read().ok().and_then(|last| *last)
    }
}

/// A live registration on the hub.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    hub: Arc<ActivityHub>,
    rx: mpsc::UnboundedReceiver<Arc<ActivityEvent>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<ActivityEvent>> {
        self.rx.recv().await
    }

    /// True when nothing is queued for this subscriber.
    pub fn rx_is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.subscribers.remove(&self.id);
        debug!(id = self.id, "activity subscriber removed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    Shutdown,
}

/// One SSE client. Runs as its own task and multiplexes new activity, the
/// heartbeat timer and cancellation.
#[derive(Debug)]
pub struct SseConnection {
    hub: Arc<ActivityHub>,
    heartbeat: Duration,
    shutdown: CancellationToken,
    state: ConnectionState,
}

impl SseConnection {
    pub fn new(hub: Arc<ActivityHub>, heartbeat: Duration, shutdown: CancellationToken) -> Self {
        Self {
            hub,
            heartbeat,
            shutdown,
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(from = ?self.state, to = ?next, "sse connection state");
        self.state = next;
    }

    /// Spawns the connection task. The receiver is the outbound buffer for the
    /// client; dropping it is how a disconnect reaches the task.
    pub fn spawn(self) -> (JoinHandle<CloseReason>, mpsc::UnboundedReceiver<StreamMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tokio::spawn(self.run(tx)), rx)
    }

    pub async fn run(mut self, outbound: mpsc::UnboundedSender<StreamMessage>) -> CloseReason {
        self.transition(ConnectionState::Open);
        if outbound.send(StreamMessage::Connected).is_err() {
            self.transition(ConnectionState::Closed);
            return CloseReason::ClientDisconnected;
        }

        // Both are released when they go out of scope, on every exit path.
        let mut subscription = self.hub.subscribe();
        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            // NB: biased select checks cancellation before queueing more output.
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    trace!("sse connection cancelled by shutdown");
                    break CloseReason::Shutdown;
                }
                _ = outbound.closed() => {
                    trace!("sse client disconnected");
                    break CloseReason::ClientDisconnected;
                }
                event = subscription.recv() => {
                    let Some(event) = event else {
                        break CloseReason::Shutdown;
                    };
                    if outbound.send(StreamMessage::Activity(event)).is_err() {
                        break CloseReason::ClientDisconnected;
                    }
                }
                _ = heartbeat.tick() => {
                    if outbound.send(StreamMessage::Heartbeat).is_err() {
                        break CloseReason::ClientDisconnected;
                    }
                }
            }
        };

        drop(subscription);
        drop(heartbeat);
        self.transition(ConnectionState::Closed);
        reason
    }
}
