use clap::{Args, ValueEnum};
use esg_sync::config::ClientConfig;
use esg_sync_core::Action;
use serde_json::Value;

use super::{connect_client, resolve_identity, CommandError};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ActionArg {
    Create,
    Update,
    Delete,
}

impl From<ActionArg> for Action {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Create => Action::Create,
            ActionArg::Update => Action::Update,
            ActionArg::Delete => Action::Delete,
        }
    }
}

/// Announce a change to every other connected client
#[derive(Debug, Args)]
pub struct PublishCommand {
    /// Entity type (e.g. device, reading)
    entity_type: String,

    /// Entity id
    entity_id: String,

    /// What happened to the entity
    #[arg(long, short, value_enum, default_value = "update")]
    action: ActionArg,

    /// JSON payload
    #[arg(long, short, default_value = "null")]
    payload: String,

    /// Identity to publish as
    #[arg(long, short)]
    identity: Option<String>,
}

impl PublishCommand {
    pub async fn run(&self, config: &ClientConfig) -> Result<(), CommandError> {
        let payload = parse_payload(&self.payload)?;
        let identity = resolve_identity(self.identity.as_deref(), config)?;
        let action = Action::from(self.action);

        let client = connect_client(config, &identity).await?;
        let result = client.publish(&self.entity_type, &self.entity_id, action, payload);
        // Flush before exiting
        client.close().await;
        result?;

        println!(
            "Published {} {}/{} as {}",
            action, self.entity_type, self.entity_id, identity
        );
        Ok(())
    }
}

fn parse_payload(raw: &str) -> Result<Value, CommandError> {
    serde_json::from_str(raw).map_err(CommandError::InvalidPayload)
}
