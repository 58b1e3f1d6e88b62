mod sandbox_commands;

use std::{path::PathBuf, process::ExitCode};

use {
    clap::{Parser, Subcommand},
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(
    name = "mountbox",
    version,
    about = "Run shell scripts in throwaway containers, with optional NFS/SMB mounts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./mountbox.toml, then ~/.config/mountbox/).
    #[arg(long, global = true, env = "MOUNTBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script in a sandbox (or on the host with --direct).
    Run(sandbox_commands::RunArgs),
    /// Print the script that would run inside the sandbox.
    Compose(sandbox_commands::ComposeArgs),
    /// Check that the container daemon is reachable.
    Ping,
    /// Pull an image into the daemon's local cache.
    Pull {
        /// Image reference, e.g. ubuntu:latest.
        image: String,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config = mountbox_config::loader::load_or_discover(cli.config.as_deref())?;
    debug!(version = env!("CARGO_PKG_VERSION"), "mountbox starting");

    match cli.command {
        Commands::Run(args) => sandbox_commands::run(args, &config).await,
        Commands::Compose(args) => sandbox_commands::compose(args, &config),
        Commands::Ping => sandbox_commands::ping(&config).await,
        Commands::Pull { image } => sandbox_commands::pull(&image, &config).await,
    }
}
