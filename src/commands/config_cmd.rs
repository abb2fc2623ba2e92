use clap::{Args, Subcommand, ValueEnum};
use std::fs;
use std::io::Write;

use esg_sync::config::ClientConfig;

#[derive(Debug, Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

impl ConfigCommand {
    pub fn run(&self, config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                ClientConfig::default_config_path().display()
                            );
                        }
                        println!();

                        println!("server_url: {}", config.server_url.value);
                        println!("  source: {}", config.server_url.source);
                        println!();

                        println!(
                            "identity: {}",
                            config.identity.value.as_deref().unwrap_or("(not set)")
                        );
                        println!("  source: {}", config.identity.source);
                        println!();

                        println!(
                            "max_reconnect_attempts: {}",
                            config.max_reconnect_attempts.value
                        );
                        println!("  source: {}", config.max_reconnect_attempts.source);
                        println!();

                        println!("heartbeat_secs: {}", config.heartbeat_secs.value);
                        println!("  source: {}", config.heartbeat_secs.source);
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = ClientConfig::default_config_path();

                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'esg-sync config show' to view current configuration.");
                    return Ok(());
                }

                if let Some(parent) = config_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let default_config = r#"# esg-sync client configuration

# Broker URL
server_url: ws://localhost:8080

# Identity to connect as
# identity: my-device

# Reconnect attempts before giving up (default: 5)
# max_reconnect_attempts: 5

# Seconds between heartbeats (default: 30)
# heartbeat_secs: 30
"#;

                let mut file = fs::File::create(&config_path)?;
                file.write_all(default_config.as_bytes())?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}
