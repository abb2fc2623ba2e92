mod config_cmd;
mod events;
mod publish;
mod status;
mod watch;

pub use config_cmd::ConfigCommand;
pub use events::EventsCommand;
pub use publish::PublishCommand;
pub use status::StatusCommand;
pub use watch::WatchCommand;

use std::time::Duration;

use esg_sync::config::ClientConfig;
use esg_sync_core::{ClientError, ClientEvent, SyncClient, WsConnector};

/// How long to wait for the broker to acknowledge a connection.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from CLI commands
#[derive(Debug)]
pub enum CommandError {
    MissingIdentity,
    InvalidPayload(serde_json::Error),
    Client(ClientError),
    Http(reqwest::Error),
    NotAcknowledged,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::MissingIdentity => write!(
                f,
                "No identity configured. Pass --identity or set ESG_SYNC_IDENTITY"
            ),
            CommandError::InvalidPayload(e) => write!(f, "Payload is not valid JSON: {}", e),
            CommandError::Client(e) => write!(f, "{}", e),
            CommandError::Http(e) => write!(f, "Request failed: {}", e),
            CommandError::NotAcknowledged => {
                write!(f, "Server did not acknowledge the connection")
            }
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::InvalidPayload(e) => Some(e),
            CommandError::Client(e) => Some(e),
            CommandError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ClientError> for CommandError {
    fn from(e: ClientError) -> Self {
        CommandError::Client(e)
    }
}

impl From<reqwest::Error> for CommandError {
    fn from(e: reqwest::Error) -> Self {
        CommandError::Http(e)
    }
}

/// Picks the identity from the command line, falling back to configuration.
fn resolve_identity(arg: Option<&str>, config: &ClientConfig) -> Result<String, CommandError> {
    arg.map(str::to_string)
        .or_else(|| config.identity.value.clone())
        .ok_or(CommandError::MissingIdentity)
}

/// Connects and waits until the broker has acknowledged the handshake.
async fn connect_client(config: &ClientConfig, identity: &str) -> Result<SyncClient, CommandError> {
    let client = SyncClient::with_connector(
        WsConnector::new(config.server_url.value.clone()),
        config.client_options(),
    );
    let mut events = client.events();

    client.connect(identity).await?;

    let acknowledged = tokio::time::timeout(ACK_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Acknowledged { .. }) => return true,
                Ok(ClientEvent::ReconnectExhausted { .. }) => return false,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;

    match acknowledged {
        Ok(true) => Ok(client),
        _ => {
            client.disconnect();
            Err(CommandError::NotAcknowledged)
        }
    }
}
