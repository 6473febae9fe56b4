use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "meshward",
    about = "Meshward: overlay network watchdog client",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Client configuration file (TOML). Defaults apply when it is missing.
    #[arg(short, long, global = true, default_value = "meshward.toml")]
    config: PathBuf,

    /// Override `server_base` from the configuration.
    #[arg(long, global = true)]
    server: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the target and restart the overlay when it stops answering.
    ///
    /// Also re-registers this node with the server every heartbeat
    /// interval and serves the local control endpoint used by `restart`,
    /// `enable`, `disable` and `status`. Runs until Ctrl-C.
    Heal {
        /// Seconds between registrations with the server.
        #[arg(long, default_value = "60")]
        heartbeat_secs: u64,
        /// Start with auto-heal disabled (heartbeats only).
        #[arg(long)]
        no_auto_heal: bool,
    },
    /// Register this node's overlay address once.
    Remember,
    /// Run the remediation sequence now, through the running heal loop
    /// when there is one.
    Restart,
    /// Turn auto-heal on in the running heal loop.
    Enable,
    /// Turn auto-heal off in the running heal loop.
    Disable,
    /// State of the running heal loop.
    Status,
    /// List clients known to the server.
    Clients {
        /// Only clients seen recently.
        #[arg(long)]
        active: bool,
    },
    /// Client counts by state.
    Stats,
    /// Server health report.
    Health,
    /// Raw Prometheus metrics from the server.
    Metrics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = commands::load_config(&cli.config, cli.server.as_deref())?;

    match cli.command {
        Commands::Heal {
            heartbeat_secs,
            no_auto_heal,
        } => commands::heal::run(config, cli.config, heartbeat_secs, !no_auto_heal).await,
        Commands::Remember => commands::heal::remember(config).await,
        Commands::Restart => commands::heal::restart(config).await,
        Commands::Enable => commands::heal::set_auto_heal(&config.current(), true).await,
        Commands::Disable => commands::heal::set_auto_heal(&config.current(), false).await,
        Commands::Status => commands::heal::status(&config.current()).await,
        Commands::Clients { active } => {
            let path = if active { "/clients/active" } else { "/clients" };
            commands::query::print_json(&config.current(), path).await
        }
        Commands::Stats => commands::query::print_json(&config.current(), "/clients/stats").await,
        Commands::Health => commands::query::print_json(&config.current(), "/health").await,
        Commands::Metrics => commands::query::print_metrics(&config.current()).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meshward=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
