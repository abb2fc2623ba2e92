//! The sync broker: ties the registry, router and event log together.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use esg_sync_core::{Change, ClientMessage, ServerMessage, SyncEvent};
use tokio::sync::{mpsc, Mutex};

use super::event_log::EventLog;
use super::registry::{ConnectionHandle, ConnectionRegistry, ConnectionState, TransportError};
use super::router::{BroadcastRouter, RouteReport};

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct BrokerOptions {
    /// Longest a single socket write may take before the connection is dropped
    pub write_timeout: Duration,
    /// Outbound queue size per connection
    pub outbound_capacity: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
        }
    }
}

/// An inbound frame that could not be understood.
///
/// Protocol errors are logged and the connection stays open.
#[derive(Debug)]
pub enum ProtocolError {
    /// Text frame that is not a known client message.
    Malformed(String),
    /// Binary frames are not part of the protocol.
    BinaryFrame,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "Malformed message: {}", e),
            ProtocolError::BinaryFrame => write!(f, "Unexpected binary frame"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Result of ingesting one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Log sequence, `None` if the append failed
    pub sequence: Option<i64>,
    pub route: RouteReport,
}

/// Accepts changes from connections and fans them out to the others.
pub struct Broker {
    registry: Arc<ConnectionRegistry>,
    router: BroadcastRouter,
    log: Arc<EventLog>,
    /// Last assigned timestamp. Held across stamp, append and route so that
    /// log order and delivery order agree.
    ingest: Mutex<DateTime<Utc>>,
    options: BrokerOptions,
}

impl Broker {
    pub fn new(log: Arc<EventLog>, options: BrokerOptions) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            router: BroadcastRouter::new(Arc::clone(&registry)),
            registry,
            log,
            ingest: Mutex::new(DateTime::<Utc>::MIN_UTC),
            options,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Opens a connection for an already validated identity.
    ///
    /// The `connected` acknowledgement is the first message on the returned
    /// queue and carries the latest logged sequence. Registration happens
    /// under the ingest lock, so every event after that sequence reaches the
    /// new connection live. Any connection previously registered for the
    /// identity is closed.
    pub async fn open_connection(
        &self,
        identity: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.options.outbound_capacity.max(1));
        let handle = ConnectionHandle::new(identity, tx);

        let previous = {
            let _ingest = self.ingest.lock().await;

            let sequence = match self.log.latest_sequence().await {
                Ok(latest) => Some(latest.unwrap_or(0)),
                Err(e) => {
                    tracing::warn!("Could not read log position for {}: {}", identity, e);
                    None
                }
            };

            // Queue is empty, so the ack always fits and precedes any broadcast
            if let Err(e) = handle.try_send(ServerMessage::Connected {
                user_id: identity.to_string(),
                sequence,
            }) {
                tracing::warn!("Failed to queue connected ack for {}: {}", identity, e);
            }

            handle.set_state(ConnectionState::Open);
            self.registry.register(handle.clone()).await
        };
        if let Some(previous) = previous {
            previous.close();
        }

        tracing::info!("Client {} connected ({})", identity, handle.id());
        (handle, rx)
    }

    /// Tears down a connection, leaving any newer one for the identity alone.
    pub async fn close_connection(&self, handle: &ConnectionHandle) {
        if handle.state() == ConnectionState::Closed {
            return;
        }
        handle.set_state(ConnectionState::Closing);
        self.registry.unregister(handle.identity(), handle).await;
        handle.set_state(ConnectionState::Closed);
        tracing::info!("Client {} disconnected ({})", handle.identity(), handle.id());
    }

    /// Handles one inbound text frame from `handle`.
    pub async fn handle_text(
        &self,
        handle: &ConnectionHandle,
        text: &str,
    ) -> Result<(), ProtocolError> {
        let message =
            ClientMessage::from_json(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match message {
            ClientMessage::Sync(change) => {
                self.ingest(handle.identity(), change).await;
            }
            ClientMessage::Ping => {
                // Answer the connection that asked, even if it was superseded
                if let Err(e) = handle.try_send(ServerMessage::Pong) {
                    tracing::warn!("Failed to queue pong for {}: {}", handle.identity(), e);
                    handle.close();
                }
            }
            ClientMessage::Replay { since } => {
                self.replay(handle, since).await;
            }
        }
        Ok(())
    }

    /// Stamps, logs and routes a change published by `origin`.
    ///
    /// A failed append is logged and the change is still delivered, without a
    /// sequence number.
    pub async fn ingest(&self, origin: &str, change: Change) -> IngestOutcome {
        let mut last = self.ingest.lock().await;

        // Stored with microsecond precision; live and replayed copies must match
        let now = Utc::now().trunc_subsecs(6);
        let timestamp = if now > *last { now } else { *last };
        *last = timestamp;

        let event = SyncEvent::from_change(change, origin, timestamp);

        let sequence = match self.log.append(&event).await {
            Ok(seq) => Some(seq),
            Err(e) => {
                tracing::error!(
                    "Failed to log {} {}/{} from {}: {}",
                    event.action,
                    event.entity_type,
                    event.entity_id,
                    origin,
                    e
                );
                None
            }
        };

        let route = self.router.route_event(&event, sequence).await;
        IngestOutcome { sequence, route }
    }

    /// Queues logged events after `since` that `handle` did not publish.
    ///
    /// Runs under the ingest lock so no live update can slip in between the
    /// replayed ones. The batch may be larger than the outbound queue, so it
    /// waits for the writer to drain, for at most the write timeout in total;
    /// past that the connection is closed. Returns the number of events queued.
    pub async fn replay(&self, handle: &ConnectionHandle, since: i64) -> usize {
        let _ingest = self.ingest.lock().await;

        let records = match self.log.since(since, Some(handle.identity())).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Replay for {} failed: {}", handle.identity(), e);
                return 0;
            }
        };

        let mut queued = 0;
        let write_timeout = self.options.write_timeout;
        let delivered = tokio::time::timeout(write_timeout, async {
            for record in records {
                let update = record.event.to_update(Some(record.sequence));
                handle.send(ServerMessage::Update(update)).await?;
                queued += 1;
            }
            Ok::<(), TransportError>(())
        })
        .await
        .unwrap_or(Err(TransportError::WriteTimeout(write_timeout)));

        if let Err(e) = delivered {
            tracing::warn!("Replay to {} stopped: {}", handle.identity(), e);
            handle.close();
        }

        tracing::debug!(
            "Replayed {} event(s) after {} to {}",
            queued,
            since,
            handle.identity()
        );
        queued
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::event_log::EventFilter;
    use esg_sync_core::Action;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    async fn broker() -> (Broker, TempDir) {
        broker_with(BrokerOptions::default()).await
    }

    async fn broker_with(options: BrokerOptions) -> (Broker, TempDir) {
        let temp_dir = tempdir().unwrap();
        let log = EventLog::open(&temp_dir.path().join("events.db"))
            .await
            .unwrap();
        (Broker::new(Arc::new(log), options), temp_dir)
    }

    fn sync_text(entity_id: &str) -> String {
        ClientMessage::Sync(Change::new(
            "device",
            entity_id,
            Action::Update,
            json!({"status": "active"}),
        ))
        .to_json()
        .unwrap()
    }

    fn expect_connected(rx: &mut mpsc::Receiver<ServerMessage>, identity: &str) -> Option<i64> {
        match rx.try_recv().unwrap() {
            ServerMessage::Connected { user_id, sequence } => {
                assert_eq!(user_id, identity);
                sequence
            }
            other => panic!("Expected Connected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_two_client_scenario() {
        let (broker, _dir) = broker().await;
        let (u1, mut rx1) = broker.open_connection("u1").await;
        let (_u2, mut rx2) = broker.open_connection("u2").await;
        expect_connected(&mut rx1, "u1");
        expect_connected(&mut rx2, "u2");

        broker.handle_text(&u1, &sync_text("D1")).await.unwrap();

        match rx2.try_recv().unwrap() {
            ServerMessage::Update(update) => {
                assert_eq!(update.entity_type, "device");
                assert_eq!(update.entity_id, "D1");
                assert_eq!(update.action, Action::Update);
                assert_eq!(update.payload, json!({"status": "active"}));
                assert_eq!(update.sequence, Some(1));
            }
            other => panic!("Expected Update, got {:?}", other),
        }
        assert!(rx1.try_recv().is_err());

        let records = broker.log().query(&EventFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[0].event.origin_identity, "u1");
    }

    #[tokio::test]
    async fn test_timestamps_never_decrease() {
        let (broker, _dir) = broker().await;
        let (_u2, mut rx2) = broker.open_connection("u2").await;
        expect_connected(&mut rx2, "u2");

        for i in 0..20 {
            let change = Change::new("device", format!("D{}", i), Action::Create, json!({}));
            broker.ingest("u1", change).await;
        }

        let mut previous = None;
        while let Ok(ServerMessage::Update(update)) = rx2.try_recv() {
            if let Some(prev) = previous {
                assert!(update.timestamp >= prev);
            }
            previous = Some(update.timestamp);
        }
        assert!(previous.is_some());
    }

    #[tokio::test]
    async fn test_log_failure_still_broadcasts() {
        let (broker, _dir) = broker().await;
        let (_u2, mut rx2) = broker.open_connection("u2").await;
        expect_connected(&mut rx2, "u2");
        broker.log().close().await;

        let outcome = broker
            .ingest("u1", Change::new("device", "D1", Action::Delete, json!(null)))
            .await;

        assert_eq!(outcome.sequence, None);
        assert_eq!(outcome.route.delivered, 1);
        match rx2.try_recv().unwrap() {
            ServerMessage::Update(update) => assert_eq!(update.sequence, None),
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let (broker, _dir) = broker().await;
        let (u1, _rx1) = broker.open_connection("u1").await;

        for text in [
            "not json",
            r#"{"type":"subscribe"}"#,
            r#"{"type":"sync","entityType":"device"}"#,
        ] {
            let result = broker.handle_text(&u1, text).await;
            assert!(matches!(result, Err(ProtocolError::Malformed(_))));
        }

        assert_eq!(u1.state(), ConnectionState::Open);
        assert!(broker.registry().lookup("u1").await.is_some());
    }

    #[tokio::test]
    async fn test_ping_answers_only_sender() {
        let (broker, _dir) = broker().await;
        let (u1, mut rx1) = broker.open_connection("u1").await;
        let (_u2, mut rx2) = broker.open_connection("u2").await;
        expect_connected(&mut rx1, "u1");
        expect_connected(&mut rx2, "u2");

        broker.handle_text(&u1, r#"{"type":"ping"}"#).await.unwrap();

        assert_eq!(rx1.try_recv().unwrap(), ServerMessage::Pong);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_connection_supersedes_old() {
        let (broker, _dir) = broker().await;
        let (old, mut old_rx) = broker.open_connection("u2").await;
        let (new, mut new_rx) = broker.open_connection("u2").await;
        expect_connected(&mut old_rx, "u2");
        expect_connected(&mut new_rx, "u2");

        assert_eq!(old.state(), ConnectionState::Closing);
        old.close_requested().await;

        // The old connection's teardown must not evict the new one
        broker.close_connection(&old).await;
        assert_eq!(old.state(), ConnectionState::Closed);
        assert!(broker.registry().lookup("u2").await.unwrap().same_connection(&new));

        broker
            .ingest("u1", Change::new("device", "D1", Action::Update, json!({})))
            .await;
        assert!(old_rx.try_recv().is_err());
        assert!(matches!(new_rx.try_recv(), Ok(ServerMessage::Update(_))));
    }

    #[tokio::test]
    async fn test_close_connection_unregisters() {
        let (broker, _dir) = broker().await;
        let (u1, _rx1) = broker.open_connection("u1").await;
        assert_eq!(broker.connection_count().await, 1);

        broker.close_connection(&u1).await;

        assert_eq!(u1.state(), ConnectionState::Closed);
        assert_eq!(broker.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_replay_skips_own_and_seen_events() {
        let (broker, _dir) = broker().await;

        broker
            .ingest("u1", Change::new("device", "D1", Action::Create, json!({})))
            .await;
        broker
            .ingest("u2", Change::new("device", "D2", Action::Create, json!({})))
            .await;
        broker
            .ingest("u1", Change::new("device", "D3", Action::Create, json!({})))
            .await;

        let (u2, mut rx2) = broker.open_connection("u2").await;
        expect_connected(&mut rx2, "u2");
        broker
            .handle_text(&u2, r#"{"type":"replay","since":0}"#)
            .await
            .unwrap();

        let mut replayed = Vec::new();
        while let Ok(ServerMessage::Update(update)) = rx2.try_recv() {
            replayed.push((update.sequence, update.entity_id));
        }
        assert_eq!(
            replayed,
            vec![(Some(1), "D1".to_string()), (Some(3), "D3".to_string())]
        );

        assert_eq!(broker.replay(&u2, 3).await, 0);
    }

    #[tokio::test]
    async fn test_connected_ack_carries_log_position() {
        let (broker, _dir) = broker().await;
        let (_u1, mut rx1) = broker.open_connection("u1").await;
        assert_eq!(expect_connected(&mut rx1, "u1"), Some(0));

        for id in ["D1", "D2"] {
            broker
                .ingest("u2", Change::new("device", id, Action::Create, json!({})))
                .await;
        }

        let (_u3, mut rx3) = broker.open_connection("u3").await;
        assert_eq!(expect_connected(&mut rx3, "u3"), Some(2));

        // Everything after the ack's position arrives live
        broker
            .ingest("u2", Change::new("device", "D3", Action::Create, json!({})))
            .await;
        match rx3.try_recv().unwrap() {
            ServerMessage::Update(update) => assert_eq!(update.sequence, Some(3)),
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connected_ack_without_log_has_no_position() {
        let (broker, _dir) = broker().await;
        broker.log().close().await;

        let (_u1, mut rx1) = broker.open_connection("u1").await;
        assert_eq!(expect_connected(&mut rx1, "u1"), None);
    }

    #[tokio::test]
    async fn test_superseded_connection_gets_its_own_pong() {
        let (broker, _dir) = broker().await;
        let (old, mut old_rx) = broker.open_connection("u1").await;
        let (_new, mut new_rx) = broker.open_connection("u1").await;
        expect_connected(&mut old_rx, "u1");
        expect_connected(&mut new_rx, "u1");

        broker.handle_text(&old, r#"{"type":"ping"}"#).await.unwrap();

        assert_eq!(old_rx.try_recv().unwrap(), ServerMessage::Pong);
        assert!(new_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timestamps_match_logged_precision() {
        let (broker, _dir) = broker().await;
        let (u2, mut rx2) = broker.open_connection("u2").await;
        expect_connected(&mut rx2, "u2");

        broker
            .ingest("u1", Change::new("device", "D1", Action::Update, json!({})))
            .await;

        let live = match rx2.try_recv().unwrap() {
            ServerMessage::Update(update) => update.timestamp,
            other => panic!("Expected Update, got {:?}", other),
        };
        let records = broker.log().query(&EventFilter::default()).await.unwrap();
        assert_eq!(records[0].event.timestamp, live);
        assert_eq!(live.timestamp_subsec_nanos() % 1_000, 0);

        broker.replay(&u2, 0).await;
        match rx2.try_recv().unwrap() {
            ServerMessage::Update(update) => assert_eq!(update.timestamp, live),
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replay_larger_than_outbound_queue() {
        let (broker, _dir) = broker_with(BrokerOptions {
            outbound_capacity: 2,
            ..BrokerOptions::default()
        })
        .await;
        for i in 0..5 {
            let change = Change::new("device", format!("D{}", i), Action::Create, json!({}));
            broker.ingest("u1", change).await;
        }

        let (u2, mut rx2) = broker.open_connection("u2").await;
        let drain = tokio::spawn(async move {
            let mut sequences = Vec::new();
            while let Some(message) = rx2.recv().await {
                if let ServerMessage::Update(update) = message {
                    sequences.push(update.sequence);
                    if sequences.len() == 5 {
                        break;
                    }
                }
            }
            sequences
        });

        assert_eq!(broker.replay(&u2, 0).await, 5);
        assert_eq!(u2.state(), ConnectionState::Open);
        assert_eq!(
            drain.await.unwrap(),
            vec![Some(1), Some(2), Some(3), Some(4), Some(5)]
        );
    }

    #[tokio::test]
    async fn test_replay_to_stalled_reader_closes_connection() {
        let (broker, _dir) = broker_with(BrokerOptions {
            outbound_capacity: 2,
            write_timeout: Duration::from_millis(100),
        })
        .await;
        for i in 0..5 {
            let change = Change::new("device", format!("D{}", i), Action::Create, json!({}));
            broker.ingest("u1", change).await;
        }

        let (u2, _rx2) = broker.open_connection("u2").await;

        // The ack holds one slot, so only one update fits
        assert_eq!(broker.replay(&u2, 0).await, 1);
        assert_eq!(u2.state(), ConnectionState::Closing);
    }
}
