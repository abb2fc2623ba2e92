use clap::Args;
use esg_sync::config::ClientConfig;
use esg_sync_core::sync::http_base_url;
use serde_json::Value;

use super::config_cmd::OutputFormat;
use super::CommandError;

/// List the most recent logged events (newest first, at most 100)
#[derive(Debug, Args)]
pub struct EventsCommand {
    /// Only events for this entity type
    #[arg(long, short = 't')]
    entity_type: Option<String>,

    /// Only events for this entity id
    #[arg(long, short = 'e')]
    entity_id: Option<String>,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl EventsCommand {
    pub async fn run(&self, config: &ClientConfig) -> Result<(), CommandError> {
        let url = format!("{}/events", http_base_url(&config.server_url.value));

        let mut query = Vec::new();
        if let Some(entity_type) = &self.entity_type {
            query.push(("entityType", entity_type.as_str()));
        }
        if let Some(entity_id) = &self.entity_id {
            query.push(("entityId", entity_id.as_str()));
        }

        let records: Vec<Value> = reqwest::Client::new()
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match self.format {
            OutputFormat::Json => {
                let text = serde_json::to_string_pretty(&records)
                    .map_err(CommandError::InvalidPayload)?;
                println!("{}", text);
            }
            OutputFormat::Text => {
                if records.is_empty() {
                    println!("No events found.");
                }
                for record in &records {
                    println!("{}", describe(record));
                }
            }
        }
        Ok(())
    }
}

fn describe(record: &Value) -> String {
    let field = |name: &str| record[name].as_str().unwrap_or("?").to_string();
    format!(
        "#{} {} {} {}/{} by {} {}",
        record["sequence"],
        field("timestamp"),
        field("action"),
        field("entityType"),
        field("entityId"),
        field("originIdentity"),
        record["payload"]
    )
}
