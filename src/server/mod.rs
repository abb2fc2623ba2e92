//! Server-side modules for the ESG sync broker.

pub mod broker;
pub mod config;
pub mod connection;
pub mod event_log;
pub mod http;
pub mod registry;
pub mod router;

pub use broker::{Broker, BrokerOptions, IngestOutcome, ProtocolError};
pub use config::ServerConfig;
pub use event_log::{EventFilter, EventLog, EventLogRecord, PersistenceError, QUERY_LIMIT};
pub use http::{router, AppState, HandshakeError, HealthResponse};
pub use registry::{
    ConnectionHandle, ConnectionRegistry, ConnectionState, PresenceEvent, TransportError,
};
pub use router::{BroadcastRouter, RouteReport};
