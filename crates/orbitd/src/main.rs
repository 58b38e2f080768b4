//! orbitd - orbit gateway daemon
//!
//! Connects to the hub and routes its commands to systems reachable over
//! UDP and WebSocket channels.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use orbitd::{OrbitdConfig, app};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "orbitd=info,orbit_gateway=info,orbit_hub=info,orbit_channel=info";

#[derive(Parser)]
#[command(name = "orbitd")]
#[command(about = "Orbit gateway daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run {
        /// Path to config file
        #[arg(short, long, env = "ORBITD_CONFIG", default_value = "/etc/orbitd/config.toml")]
        config: PathBuf,

        /// Log as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/orbitd/config.toml")]
        output: PathBuf,

        /// Hub host
        #[arg(long, default_value = "you.example.cloud")]
        host: String,

        /// Gateway token issued by the hub
        #[arg(long, default_value = "replace-me")]
        token: String,
    },

    /// Validate a config file
    CheckConfig {
        /// Path to config file
        #[arg(short, long, env = "ORBITD_CONFIG", default_value = "/etc/orbitd/config.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, json } => {
            init_tracing(json);
            info!(config = %config.display(), "Starting orbitd");
            let config = OrbitdConfig::from_file(&config)?;
            app::run(config).await?;
        }

        Commands::InitConfig { output, host, token } => {
            let config = OrbitdConfig::sample(&host, &token);
            std::fs::write(&output, config.to_toml()?)?;
            println!("Config written to {}", output.display());
            println!();
            println!("Edit the hub token and systems, then run:");
            println!("  orbitd run --config {}", output.display());
        }

        Commands::CheckConfig { config } => {
            let parsed = OrbitdConfig::from_file(&config)?;
            println!(
                "{}: ok ({} channel(s), {} system(s))",
                config.display(),
                parsed.channels.len(),
                parsed.systems.len()
            );
        }
    }

    Ok(())
}
