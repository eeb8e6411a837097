//! Owner-keyed notification fan-out.
//!
//! The worker's voice to connected clients: job progress, completion, and
//! permanent failure land here so a client can react without polling an
//! HTTP endpoint. Delivery is fire-and-forget — a dropped notification is
//! logged, never an error that re-fails a job.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::telemetry::metrics;

/// A typed event pushed to an owner's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Event kind, e.g. "conjuration.update". Chosen by the producer;
    /// the engine doesn't interpret it.
    pub kind: String,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// A notification addressed to its owner.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub owner_id: String,
    pub notification: Notification,
}

/// The pub/sub boundary the engine depends on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, owner_id: &str, notification: Notification);
}

/// Broadcast fan-out. Subscribers receive every envelope and filter by
/// owner; the gateway layer maps owners to connections.
pub struct ChannelSink {
    tx: broadcast::Sender<Envelope>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, owner_id: &str, notification: Notification) {
        debug!(owner_id, kind = %notification.kind, "notification");
        metrics::notifications_emitted().add(
            1,
            &[KeyValue::new("kind", notification.kind.clone())],
        );
        let envelope = Envelope {
            owner_id: owner_id.to_string(),
            notification,
        };
        // No subscribers is normal (nobody connected); drop on the floor.
        if let Err(e) = self.tx.send(envelope) {
            debug!("notification dropped: {e}");
        }
    }
}

/// Sink that discards everything. For contexts with no connected clients.
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn notify(&self, _owner_id: &str, _notification: Notification) {}
}
