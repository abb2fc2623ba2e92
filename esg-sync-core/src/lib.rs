//! ESG Sync Core Library
//!
//! Wire protocol and the reconnecting sync client shared by the ESG Sync
//! server and its collaborators.

pub mod sync;

pub use sync::{
    check_server, validate_identity, Action, Backoff, Change, ClientError, ClientEvent,
    ClientMessage, ClientOptions, ClientState, Connector, HealthStatus, InvalidIdentity,
    ServerMessage, SubscriptionId, SyncClient, SyncEvent, Transport, Update, WsConnector,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
