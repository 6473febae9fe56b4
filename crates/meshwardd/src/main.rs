//! meshwardd: the meshward server daemon.
//!
//! Single binary that assembles the server side:
//! - Address store (redb)
//! - Client registry, reloaded before the first probe
//! - Staggered ping scheduler
//! - Deferred registry flush loop
//! - Config file watcher
//! - REST API
//!
//! # Usage
//!
//! ```text
//! meshwardd serve --config /etc/meshward/server.toml
//! ```

mod server;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use meshward_core::{ConfigHandle, ServerConfig, ensure_valid};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshwardd", about = "Meshward server daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the registry, the probe scheduler and the API server.
    Serve {
        /// Server configuration file (TOML). Watched for changes.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `data_dir` from the configuration.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Override `port` from the configuration.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Serve {
            config,
            data_dir,
            port,
        } => {
            // Command-line values stay in effect across config reloads.
            let settings = ConfigHandle::with_overrides(
                load_config(config.as_deref())?,
                move |settings: &mut ServerConfig| {
                    if let Some(data_dir) = &data_dir {
                        settings.data_dir = data_dir.clone();
                    }
                    if let Some(port) = port {
                        settings.port = port;
                    }
                },
            );
            ensure_valid(settings.current().validate())?;
            server::run(settings, config).await
        }
        Command::CheckConfig { config } => {
            let settings = ServerConfig::from_file(&config)?;
            ensure_valid(settings.validate())?;
            println!("{settings:#?}");
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meshward=debug,meshwardd=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<ServerConfig> {
    match path {
        Some(path) => Ok(ServerConfig::from_file(path)?),
        None => Ok(ServerConfig::default()),
    }
}
