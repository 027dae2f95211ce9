//! termbroker CLI entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use termbroker::config::Config;
use termbroker::server::{run_server, FixedSpawnResolver};

#[derive(Parser)]
#[command(name = "termbroker")]
#[command(about = "Brokers PTY-backed terminal sessions over WebSocket")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the terminal broker server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "7890")]
        port: u16,

        /// Path to a TOML config file overriding the built-in defaults
        #[arg(long)]
        config: Option<PathBuf>,

        /// Shell (or command) to spawn for every workspace
        #[arg(long, default_value = "/bin/bash")]
        shell: String,

        /// Working directory for spawned shells
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            config,
            shell,
            working_dir,
        } => {
            let config = Config::from_env_and_file(config.as_deref())?;
            let working_dir = working_dir
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| PathBuf::from("."));

            let resolver = Arc::new(FixedSpawnResolver {
                command: shell,
                args: Vec::new(),
                working_dir,
            });

            run_server(&host, port, config, resolver).await
        }
    }
}
