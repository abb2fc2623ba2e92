//! Per-connection WebSocket task.
//!
//! Each connection gets a reader (this task) and a writer task draining the
//! connection's outbound queue. Either side ending, or the broker asking the
//! connection to close, tears the whole connection down.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use esg_sync_core::ServerMessage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::broker::{Broker, ProtocolError};
use super::registry::{ConnectionHandle, TransportError};

enum Ended {
    Reader(Result<(), TransportError>),
    CloseRequested,
    Writer(Result<(), TransportError>),
}

/// Runs a connection for `identity` until it closes.
pub async fn serve_socket(broker: Arc<Broker>, socket: WebSocket, identity: String) {
    let (handle, outbound) = broker.open_connection(&identity).await;
    let write_timeout = broker.options().write_timeout;

    let (sink, stream) = socket.split();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut writer: JoinHandle<Result<(), TransportError>> =
        tokio::spawn(write_loop(sink, outbound, shutdown_rx, write_timeout));

    let ended = tokio::select! {
        result = read_loop(&broker, &handle, stream) => Ended::Reader(result),
        _ = handle.close_requested() => Ended::CloseRequested,
        result = &mut writer => Ended::Writer(
            result.unwrap_or_else(|e| Err(TransportError::Write(e.to_string())))
        ),
    };

    match &ended {
        Ended::Reader(Ok(())) => tracing::debug!("{} closed the connection", identity),
        Ended::Reader(Err(e)) | Ended::Writer(Err(e)) => {
            tracing::warn!("Connection for {} failed: {}", identity, e)
        }
        Ended::Writer(Ok(())) => tracing::debug!("Writer for {} finished", identity),
        Ended::CloseRequested => tracing::info!("Closing connection for {}", identity),
    }

    broker.close_connection(&handle).await;

    if !matches!(ended, Ended::Writer(_)) {
        // Let the writer flush what is queued and send a close frame
        let _ = shutdown_tx.send(());
        if tokio::time::timeout(write_timeout, &mut writer).await.is_err() {
            writer.abort();
        }
    }
}

/// Reads frames until the peer closes or the socket fails.
async fn read_loop<R>(
    broker: &Broker,
    handle: &ConnectionHandle,
    mut stream: R,
) -> Result<(), TransportError>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| TransportError::Read(e.to_string()))?;

        let result = match frame {
            Message::Text(text) => broker.handle_text(handle, text.as_str()).await,
            Message::Binary(_) => Err(ProtocolError::BinaryFrame),
            Message::Close(_) => return Ok(()),
            Message::Ping(_) | Message::Pong(_) => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!("Protocol error from {}: {}", handle.identity(), e);
        }
    }
    Ok(())
}

/// Drains `outbound` onto `sink`, one text frame per message.
///
/// A write that does not complete within `write_timeout` fails the
/// connection. On shutdown, queued messages are flushed before the close frame.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut shutdown: oneshot::Receiver<()>,
    write_timeout: Duration,
) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = &mut shutdown => break,
        };

        write_frame(&mut sink, &message, write_timeout).await?;
    }

    while let Ok(message) = outbound.try_recv() {
        write_frame(&mut sink, &message, write_timeout).await?;
    }

    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
    Ok(())
}

async fn write_frame<S>(
    sink: &mut S,
    message: &ServerMessage,
    write_timeout: Duration,
) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = message
        .to_json()
        .map_err(|e| TransportError::Encode(e.to_string()))?;

    match tokio::time::timeout(write_timeout, sink.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TransportError::Write(e.to_string())),
        Err(_) => Err(TransportError::WriteTimeout(write_timeout)),
    }
}
