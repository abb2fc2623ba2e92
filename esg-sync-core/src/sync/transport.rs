//! Transport abstraction for the sync client.
//!
//! The client only needs a text sink and a text stream. `WsConnector` opens
//! them over a WebSocket; tests substitute in-memory channels.

use std::pin::Pin;

use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::error::ClientError;

/// Outgoing half of a transport: one JSON document per item.
pub type OutgoingSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;
/// Incoming half of a transport: one JSON document per item.
pub type IncomingStream = Pin<Box<dyn Stream<Item = Result<String, ClientError>> + Send>>;

/// An open, bidirectional text transport.
pub struct Transport {
    pub outgoing: OutgoingSink,
    pub incoming: IncomingStream,
}

impl Transport {
    pub fn new(outgoing: OutgoingSink, incoming: IncomingStream) -> Self {
        Self { outgoing, incoming }
    }
}

/// Opens transports to the broker on behalf of one identity.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, identity: &str) -> BoxFuture<'static, Result<Transport, ClientError>>;
}

/// Connector for the broker's `/sync` WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Builds the WebSocket URL for the sync endpoint.
    pub fn sync_url(&self, identity: &str) -> String {
        format!(
            "{}/sync?userId={}",
            ws_base_url(&self.server_url),
            urlencoding::encode(identity)
        )
    }
}

impl Connector for WsConnector {
    fn connect(&self, identity: &str) -> BoxFuture<'static, Result<Transport, ClientError>> {
        let url = self.sync_url(identity);

        Box::pin(async move {
            let (ws_stream, _) = connect_async(&url)
                .await
                .map_err(|e| ClientError::ConnectionError(e.to_string()))?;

            let (sink, stream) = ws_stream.split();

            let outgoing = sink
                .sink_map_err(|e| ClientError::TransportError(e.to_string()))
                .with(|text: String| future::ready(Ok::<_, ClientError>(Message::Text(text.into()))));

            // Control frames are answered by tungstenite itself
            let incoming = stream.filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(_) => None,
                    Err(e) => Some(Err(ClientError::TransportError(e.to_string()))),
                })
            });

            Ok(Transport::new(Box::pin(outgoing), Box::pin(incoming)))
        })
    }
}

/// Normalizes a server URL to a `ws://` or `wss://` base without trailing slash.
pub fn ws_base_url(server_url: &str) -> String {
    let base_url = if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
        format!("ws://{}", server_url)
    } else {
        server_url.to_string()
    };

    base_url.trim_end_matches('/').to_string()
}

/// Normalizes a server URL to an `http://` or `https://` base without trailing slash.
pub fn http_base_url(server_url: &str) -> String {
    let base_url = if let Some(rest) = server_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if let Some(rest) = server_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
        format!("http://{}", server_url)
    } else {
        server_url.to_string()
    };

    base_url.trim_end_matches('/').to_string()
}
