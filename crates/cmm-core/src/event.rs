//! Membership change events.
//!
//! The Stack publishes an event for every observable change (join, leave,
//! election outcome, release, qualification). Events reach library clients
//! through a broadcast subscription with an optional change-kind filter;
//! delivery is best-effort and eventually consistent around the ring.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use cmm_api::{ChangeKind, NodeId};

/// One membership change, as surfaced to the push-notification API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub kind: ChangeKind,
    pub node: NodeId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl MembershipEvent {
    pub fn new(kind: ChangeKind, node: NodeId) -> Self {
        Self {
            kind,
            node,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Mask of [`ChangeKind`] bits a subscriber wants delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventFilter(u32);

impl EventFilter {
    /// Deliver everything.
    pub const ALL: EventFilter = EventFilter(u32::MAX);

    pub fn none() -> Self {
        EventFilter(0)
    }

    pub fn with(mut self, kind: ChangeKind) -> Self {
        self.0 |= kind.bit();
        self
    }

    pub fn matches(&self, kind: ChangeKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        EventFilter::ALL
    }
}

/// Callback-style consumer of membership events.
#[async_trait::async_trait]
pub trait MembershipListener: Send + Sync {
    async fn on_membership_change(&self, event: &MembershipEvent);
}

/// Listener that mirrors every event into the cluster log.
pub struct LoggingMembershipListener;

#[async_trait::async_trait]
impl MembershipListener for LoggingMembershipListener {
    async fn on_membership_change(&self, event: &MembershipEvent) {
        info!(node = event.node, kind = %event.kind, "membership change");
    }
}

/// Fans membership events out to broadcast subscribers and registered
/// listeners.
pub struct EventPublisher {
    broadcast_tx: broadcast::Sender<MembershipEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn MembershipListener>>>>,
}

impl EventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size);
        Self {
            broadcast_tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn register_listener(&self, listener: Arc<dyn MembershipListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!(total = listeners.len(), "registered membership listener");
    }

    pub async fn publish(&self, event: MembershipEvent) {
        // A send error only means nobody is subscribed right now.
        let _ = self.broadcast_tx.send(event.clone());
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_membership_change(&event).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.broadcast_tx.subscribe()
    }
}

impl Clone for EventPublisher {
    fn clone(&self) -> Self {
        Self {
            broadcast_tx: self.broadcast_tx.clone(),
            listeners: self.listeners.clone(),
        }
    }
}
