//! Wire types for the sync protocol.
//!
//! Every message is a JSON object tagged by its `type` field. Field names use
//! camelCase to match the browser clients of the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Parse from string name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "create" => Some(Action::Create),
            "update" => Some(Action::Update),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change announced by a client (the body of a `sync` message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub entity_type: String,
    pub entity_id: String,
    pub action: Action,
    #[serde(default)]
    pub payload: Value,
}

impl Change {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: Action,
        payload: Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action,
            payload,
        }
    }
}

/// A change fanned out by the broker (the body of an `update` message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub entity_type: String,
    pub entity_id: String,
    pub action: Action,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Event log sequence, absent when the broker could not persist the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
}

/// Canonical change record as received and stamped by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub entity_type: String,
    pub entity_id: String,
    pub action: Action,
    pub payload: Value,
    pub origin_identity: String,
    pub timestamp: DateTime<Utc>,
}

impl SyncEvent {
    /// Stamps a client change with its origin and receipt time.
    pub fn from_change(change: Change, origin: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity_type: change.entity_type,
            entity_id: change.entity_id,
            action: change.action,
            payload: change.payload,
            origin_identity: origin.into(),
            timestamp,
        }
    }

    pub fn to_update(&self, sequence: Option<i64>) -> Update {
        Update {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            action: self.action,
            payload: self.payload.clone(),
            timestamp: self.timestamp,
            sequence,
        }
    }
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Publish a change
    Sync(Change),
    /// Liveness probe
    Ping,
    /// Ask for logged updates with a sequence greater than `since`
    Replay { since: i64 },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Handshake acknowledgement carrying the resolved identity
    Connected {
        #[serde(rename = "userId")]
        user_id: String,
        /// Latest logged sequence when the connection was registered; every
        /// later event is either delivered live or replayable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<i64>,
    },
    /// Fan-out delivery of another client's change
    Update(Update),
    /// Liveness reply
    Pong,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
