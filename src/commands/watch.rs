use clap::Args;
use esg_sync::config::ClientConfig;
use esg_sync_core::{ClientEvent, Update};
use tokio::sync::broadcast::error::RecvError;

use super::config_cmd::OutputFormat;
use super::{connect_client, resolve_identity, CommandError};

/// Print updates for the given entity types until interrupted
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Entity types to watch
    #[arg(required = true)]
    entity_types: Vec<String>,

    /// Identity to connect as
    #[arg(long, short)]
    identity: Option<String>,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl WatchCommand {
    pub async fn run(&self, config: &ClientConfig) -> Result<(), CommandError> {
        let identity = resolve_identity(self.identity.as_deref(), config)?;
        let client = connect_client(config, &identity).await?;

        for entity_type in &self.entity_types {
            let format = self.format.clone();
            client.subscribe(entity_type, move |update| print_update(&format, update));
        }

        eprintln!(
            "Watching {} as {} (Ctrl-C to stop)",
            self.entity_types.join(", "),
            identity
        );

        let mut events = client.events();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(ClientEvent::StateChanged(state)) => eprintln!("[{}]", state),
                    Ok(ClientEvent::ReconnectScheduled { attempt, delay }) => {
                        eprintln!("Reconnecting in {}s (attempt {})", delay.as_secs(), attempt)
                    }
                    Ok(ClientEvent::ReconnectExhausted { attempts }) => {
                        client.disconnect();
                        return Err(CommandError::Client(
                            esg_sync_core::ClientError::ReconnectExhausted { attempts },
                        ));
                    }
                    Ok(ClientEvent::Acknowledged { .. }) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }

        client.disconnect();
        Ok(())
    }
}

fn print_update(format: &OutputFormat, update: &Update) {
    match format {
        OutputFormat::Json => match serde_json::to_string(update) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to encode update: {}", e),
        },
        OutputFormat::Text => {
            let sequence = update
                .sequence
                .map(|s| format!("#{} ", s))
                .unwrap_or_default();
            println!(
                "{}{} {} {}/{} {}",
                sequence,
                update.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                update.action,
                update.entity_type,
                update.entity_id,
                update.payload
            );
        }
    }
}
