//! Fan-out of sync events to registered connections.

use std::sync::Arc;

use esg_sync_core::{ServerMessage, SyncEvent};

use super::registry::{ConnectionHandle, ConnectionRegistry};

/// Outcome of routing one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Connections the update was queued for
    pub delivered: usize,
    /// Connections that could not take it and were evicted
    pub failed: usize,
}

/// Delivers events to every registered connection except their origin.
///
/// Delivery only queues onto each connection's bounded outbound channel, so a
/// slow peer never holds up the others. A connection that cannot accept a
/// message is closed and removed from the registry.
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Sends `event` as an `update` to everyone but `event.origin_identity`.
    pub async fn route_event(&self, event: &SyncEvent, sequence: Option<i64>) -> RouteReport {
        let message = ServerMessage::Update(event.to_update(sequence));
        let mut report = RouteReport::default();
        let mut failed = Vec::new();

        for (identity, handle) in self.registry.snapshot().await {
            if identity == event.origin_identity {
                continue;
            }

            match handle.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!("Failed to deliver update to {}: {}", identity, e);
                    failed.push((identity, handle));
                }
            }
        }

        report.failed = failed.len();
        for (identity, handle) in failed {
            self.evict(&identity, &handle).await;
        }

        tracing::debug!(
            "Routed {} {}/{} from {}: {} delivered, {} failed",
            event.action,
            event.entity_type,
            event.entity_id,
            event.origin_identity,
            report.delivered,
            report.failed
        );

        report
    }

    /// Sends `message` to exactly `identity`, if connected.
    ///
    /// Returns true if the message was queued.
    pub async fn route_direct(&self, identity: &str, message: ServerMessage) -> bool {
        let Some(handle) = self.registry.lookup(identity).await else {
            tracing::debug!("No connection for {}, dropping direct message", identity);
            return false;
        };

        match handle.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to deliver direct message to {}: {}", identity, e);
                self.evict(identity, &handle).await;
                false
            }
        }
    }

    async fn evict(&self, identity: &str, handle: &ConnectionHandle) {
        handle.close();
        self.registry.unregister(identity, handle).await;
    }
}
