use clap::Args;
use esg_sync::config::ClientConfig;
use esg_sync_core::check_server;

use super::CommandError;

/// Show the configured broker and whether it is reachable
#[derive(Debug, Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn run(&self, config: &ClientConfig) -> Result<(), CommandError> {
        println!("Sync Status");
        println!("===========");
        println!();
        println!("Server:   {}", config.server_url.value);
        println!(
            "Identity: {}",
            config.identity.value.as_deref().unwrap_or("(not set)")
        );
        println!();

        print!("Server status: ");
        match check_server(&config.server_url.value).await {
            Ok(health) => {
                println!("✓ {}", health.status);
                println!("Version:     {}", health.version);
                println!("Connections: {}", health.connections);
            }
            Err(e) => println!("✗ unreachable ({})", e),
        }

        Ok(())
    }
}
