//! Reconnecting sync client.
//!
//! Keeps one logical connection to the broker alive for a single identity:
//! 1. `connect` starts a supervisor task that opens the transport
//! 2. While connected, published changes and a 30s heartbeat are written out
//!    and incoming updates are dispatched to local subscribers
//! 3. When the transport drops, the supervisor waits out an exponential
//!    backoff and tries again, giving up after a fixed number of attempts
//!
//! All transport attempts, the heartbeat and the backoff timer live inside the
//! one supervisor task, so attempts never overlap. Each `connect`/`disconnect`
//! starts a new generation; a supervisor from an older generation can no longer
//! change client state and is aborted.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::backoff::{Backoff, BASE_DELAY, DEFAULT_MAX_ATTEMPTS, MAX_DELAY};
use super::error::ClientError;
use super::identity::validate_identity;
use super::protocol::{Action, Change, ClientMessage, ServerMessage, Update};
use super::subscriptions::{SubscriptionId, Subscriptions};
use super::transport::{Connector, OutgoingSink, Transport, WsConnector};

/// Interval between heartbeat pings while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long `close` waits for queued messages to be written.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Sequences remembered for duplicate suppression.
const SEEN_SEQUENCE_WINDOW: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Idle => write!(f, "idle"),
            ClientState::Connecting => write!(f, "connecting"),
            ClientState::Connected => write!(f, "connected"),
            ClientState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Lifecycle notifications for the owner of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ClientState),
    /// The server acknowledged the handshake
    Acknowledged { user_id: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Terminal: no further reconnect attempts will be made
    ReconnectExhausted { attempts: u32 },
}

/// Tunables for heartbeat and reconnection.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub heartbeat_interval: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl ClientOptions {
    fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay, self.max_reconnect_attempts)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Sequences already dispatched, bounded to the most recent ones.
///
/// The set (rather than a high-water mark) lets a live update overtake
/// replayed ones without the replayed ones being dropped.
#[derive(Debug, Default)]
struct SeenSequences {
    seen: BTreeSet<i64>,
    /// Log position reported by the first acknowledgement
    baseline: Option<i64>,
}

impl SeenSequences {
    /// Returns false if `sequence` was already dispatched.
    fn insert(&mut self, sequence: i64) -> bool {
        if !self.seen.insert(sequence) {
            return false;
        }
        if self.seen.len() > SEEN_SEQUENCE_WINDOW {
            self.seen.pop_first();
        }
        true
    }

    fn highest(&self) -> Option<i64> {
        self.seen.last().copied()
    }

    /// Records where the first session started; later acks do not move it.
    fn set_baseline(&mut self, sequence: i64) {
        if self.baseline.is_none() {
            self.baseline = Some(sequence);
        }
    }

    /// Sequence to replay from after a reconnect.
    fn resume_point(&self) -> Option<i64> {
        self.highest().max(self.baseline)
    }

    fn clear(&mut self) {
        self.seen.clear();
        self.baseline = None;
    }
}

struct Shared {
    generation: u64,
    state: ClientState,
    identity: Option<String>,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    supervisor: Option<JoinHandle<()>>,
    attempt: u32,
    sequences: SeenSequences,
}

struct Inner {
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    shared: Mutex<Shared>,
    subscriptions: Mutex<Subscriptions>,
    events: broadcast::Sender<ClientEvent>,
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, shared: &mut Shared, state: ClientState) {
        if shared.state != state {
            tracing::debug!("Sync client {} -> {}", shared.state, state);
            shared.state = state;
            self.emit(ClientEvent::StateChanged(state));
        }
    }

    fn handle_incoming(&self, generation: u64, text: &str) {
        match ServerMessage::from_json(text) {
            Ok(ServerMessage::Connected { user_id, sequence }) => {
                tracing::debug!("Server acknowledged identity {}", user_id);
                if let Some(sequence) = sequence {
                    let mut shared = self.shared();
                    if shared.generation != generation {
                        return;
                    }
                    shared.sequences.set_baseline(sequence);
                }
                self.emit(ClientEvent::Acknowledged { user_id });
            }
            Ok(ServerMessage::Update(update)) => self.dispatch(generation, update),
            Ok(ServerMessage::Pong) => tracing::trace!("Received pong"),
            Err(e) => tracing::warn!("Ignoring undecodable message from server: {}", e),
        }
    }

    fn dispatch(&self, generation: u64, update: Update) {
        {
            let mut shared = self.shared();
            if shared.generation != generation {
                return;
            }
            if let Some(sequence) = update.sequence {
                if !shared.sequences.insert(sequence) {
                    tracing::debug!("Skipping already delivered update {}", sequence);
                    return;
                }
            }
        }

        let handlers = self.subscriptions().handlers_for(&update.entity_type);
        tracing::debug!(
            "Dispatching {} {}/{} to {} handler(s)",
            update.action,
            update.entity_type,
            update.entity_id,
            handlers.len()
        );
        for handler in handlers {
            handler(&update);
        }
    }
}

/// Client that keeps a single connection to the sync broker alive.
///
/// Cheap to clone; clones share the same connection and subscriptions.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Inner>,
}

impl SyncClient {
    /// Creates a client for the broker at `server_url` with default options.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_connector(WsConnector::new(server_url), ClientOptions::default())
    }

    /// Creates a client with an explicit transport connector.
    pub fn with_connector(connector: impl Connector, options: ClientOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                options,
                shared: Mutex::new(Shared {
                    generation: 0,
                    state: ClientState::Idle,
                    identity: None,
                    outbound: None,
                    supervisor: None,
                    attempt: 0,
                    sequences: SeenSequences::default(),
                }),
                subscriptions: Mutex::new(Subscriptions::new()),
                events,
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        self.inner.shared().state
    }

    pub fn identity(&self) -> Option<String> {
        self.inner.shared().identity.clone()
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.shared().attempt
    }

    /// Highest event log sequence dispatched so far.
    pub fn last_sequence(&self) -> Option<i64> {
        self.inner.shared().sequences.highest()
    }

    /// Subscribes to lifecycle notifications.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Connects as `identity`.
    ///
    /// Resolves once the first transport attempt opens or fails. On failure
    /// the client keeps retrying in the background with backoff; watch
    /// `events()` for `ReconnectExhausted`. Any previous connection is torn
    /// down first.
    pub async fn connect(&self, identity: &str) -> Result<(), ClientError> {
        let identity = validate_identity(identity)?;
        let (first_tx, first_rx) = oneshot::channel();

        {
            let mut shared = self.inner.shared();
            shared.generation += 1;
            if let Some(task) = shared.supervisor.take() {
                task.abort();
            }
            shared.outbound = None;
            shared.attempt = 0;
            if shared.identity.as_deref() != Some(identity.as_str()) {
                shared.sequences.clear();
            }
            shared.identity = Some(identity.clone());
            self.inner.set_state(&mut shared, ClientState::Connecting);

            let generation = shared.generation;
            shared.supervisor = Some(tokio::spawn(supervise(
                Arc::clone(&self.inner),
                generation,
                identity,
                first_tx,
            )));
        }

        first_rx.await.unwrap_or_else(|_| {
            Err(ClientError::ConnectionError(
                "connection attempt was cancelled".to_string(),
            ))
        })
    }

    /// Announces a local change to every other connected participant.
    ///
    /// Never waits. While not connected the change is dropped and
    /// `ClientError::NotConnected` is returned; nothing is queued for later.
    pub fn publish(
        &self,
        entity_type: &str,
        entity_id: &str,
        action: Action,
        payload: Value,
    ) -> Result<(), ClientError> {
        let shared = self.inner.shared();

        let outbound = match (shared.state, shared.outbound.as_ref()) {
            (ClientState::Connected, Some(outbound)) => outbound,
            (state, _) => {
                tracing::warn!(
                    "Dropping {} of {}/{} while {}",
                    action,
                    entity_type,
                    entity_id,
                    state
                );
                return Err(ClientError::NotConnected);
            }
        };

        outbound
            .send(ClientMessage::Sync(Change::new(
                entity_type,
                entity_id,
                action,
                payload,
            )))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Registers `callback` for remote updates of `entity_type`.
    pub fn subscribe<F>(&self, entity_type: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        self.inner
            .subscriptions()
            .insert(entity_type, Arc::new(callback))
    }

    /// Removes one subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, entity_type: &str, id: SubscriptionId) -> bool {
        self.inner.subscriptions().remove(entity_type, id)
    }

    /// Drops the connection immediately and stops all timers.
    ///
    /// Takes effect before returning: the client is `Idle` and no reconnect,
    /// heartbeat or dispatch from the old connection will happen afterwards.
    pub fn disconnect(&self) {
        let mut shared = self.inner.shared();
        shared.generation += 1;
        shared.outbound = None;
        shared.attempt = 0;
        if let Some(task) = shared.supervisor.take() {
            task.abort();
        }
        self.inner.set_state(&mut shared, ClientState::Idle);
    }

    /// Like `disconnect`, but first writes out changes already published.
    pub async fn close(&self) {
        let (task, was_connected) = {
            let mut shared = self.inner.shared();
            let was_connected = shared.state == ClientState::Connected;
            shared.generation += 1;
            shared.outbound = None;
            shared.attempt = 0;
            self.inner.set_state(&mut shared, ClientState::Idle);
            (shared.supervisor.take(), was_connected)
        };

        let Some(mut task) = task else {
            return;
        };
        if was_connected && tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_ok() {
            return;
        }
        task.abort();
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.shared();
        f.debug_struct("SyncClient")
            .field("state", &shared.state)
            .field("identity", &shared.identity)
            .field("attempt", &shared.attempt)
            .finish()
    }
}

/// Owns every transport attempt for one generation.
async fn supervise(
    inner: Arc<Inner>,
    generation: u64,
    identity: String,
    first: oneshot::Sender<Result<(), ClientError>>,
) {
    let mut first = Some(first);
    let mut backoff = inner.options.backoff();

    loop {
        match inner.connector.connect(&identity).await {
            Ok(transport) => {
                backoff.reset();
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

                let replay_from = {
                    let mut shared = inner.shared();
                    if shared.generation != generation {
                        return;
                    }
                    shared.outbound = Some(outbound_tx);
                    shared.attempt = 0;
                    inner.set_state(&mut shared, ClientState::Connected);
                    shared.sequences.resume_point()
                };

                tracing::info!("Connected to sync server as {}", identity);
                if let Some(first) = first.take() {
                    let _ = first.send(Ok(()));
                }

                let outcome =
                    run_session(&inner, generation, transport, outbound_rx, replay_from).await;

                {
                    let mut shared = inner.shared();
                    if shared.generation != generation {
                        return;
                    }
                    shared.outbound = None;
                }

                match outcome {
                    Ok(()) => tracing::warn!("Sync server closed the connection"),
                    Err(e) => tracing::warn!("Sync connection lost: {}", e),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to connect to sync server: {}", e);
                if let Some(first) = first.take() {
                    let _ = first.send(Err(e));
                }
            }
        }

        let Some(delay) = backoff.next_delay() else {
            let attempts = backoff.attempt();
            let mut shared = inner.shared();
            if shared.generation == generation {
                tracing::error!(
                    "Giving up on sync server after {} reconnect attempt(s)",
                    attempts
                );
                shared.outbound = None;
                shared.supervisor = None;
                inner.set_state(&mut shared, ClientState::Idle);
                inner.emit(ClientEvent::ReconnectExhausted { attempts });
            }
            return;
        };

        {
            let mut shared = inner.shared();
            if shared.generation != generation {
                return;
            }
            shared.attempt = backoff.attempt();
            inner.set_state(&mut shared, ClientState::Reconnecting);
        }

        tracing::info!(
            "Reconnecting in {}ms (attempt {}/{})",
            delay.as_millis(),
            backoff.attempt(),
            backoff.max_attempts()
        );
        inner.emit(ClientEvent::ReconnectScheduled {
            attempt: backoff.attempt(),
            delay,
        });
        tokio::time::sleep(delay).await;
    }
}

/// Drives one open transport until it closes or fails.
///
/// Returns `Ok` when the server closed the connection or the client was
/// closed, `Err` on a transport failure.
async fn run_session(
    inner: &Inner,
    generation: u64,
    transport: Transport,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    replay_from: Option<i64>,
) -> Result<(), ClientError> {
    let Transport {
        mut outgoing,
        mut incoming,
    } = transport;

    if let Some(since) = replay_from {
        tracing::debug!("Requesting replay of updates after sequence {}", since);
        send_message(&mut outgoing, &ClientMessage::Replay { since }).await?;
    }

    let period = inner.options.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = incoming.next() => match frame {
                Some(Ok(text)) => inner.handle_incoming(generation, &text),
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
            message = outbound.recv() => match message {
                Some(message) => send_message(&mut outgoing, &message).await?,
                None => {
                    // Client closed; everything queued has been written
                    let _ = outgoing.close().await;
                    return Ok(());
                }
            },
            _ = heartbeat.tick() => {
                tracing::trace!("Sending heartbeat ping");
                send_message(&mut outgoing, &ClientMessage::Ping).await?;
            }
        }
    }
}

async fn send_message(outgoing: &mut OutgoingSink, message: &ClientMessage) -> Result<(), ClientError> {
    outgoing.send(message.to_json()?).await
}
