//! Real-time sync over a persistent WebSocket connection.
//!
//! ## Protocol
//!
//! One JSON object per text frame, tagged by `type`:
//! 1. Client connects to `/sync?userId=<identity>`
//! 2. Server acknowledges with `connected`
//! 3. Client publishes changes with `sync`; the server fans them out to every
//!    other connected identity as `update`
//! 4. Client sends `ping` every 30 seconds; the server answers `pong`
//! 5. After a reconnect the client asks for missed updates with `replay`

mod backoff;
mod client;
mod error;
mod health;
mod identity;
mod protocol;
mod subscriptions;
mod transport;

pub use backoff::Backoff;
pub use client::{ClientEvent, ClientOptions, ClientState, SyncClient};
pub use error::ClientError;
pub use health::{check_server, HealthStatus};
pub use identity::{validate_identity, InvalidIdentity, MAX_IDENTITY_LEN};
pub use protocol::{Action, Change, ClientMessage, ServerMessage, SyncEvent, Update};
pub use subscriptions::{Callback, SubscriptionId, Subscriptions};
pub use transport::{http_base_url, ws_base_url, Connector, Transport, WsConnector};
