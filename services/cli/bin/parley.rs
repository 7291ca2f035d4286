//! Entrypoint for the `parley` assistant CLI.
//!
//! This binary is responsible for:
//! 1. Parsing the command line.
//! 2. Loading configuration from the environment and initialising logging.
//! 3. Building the calendar tool registry shared by both conversation modes.
//! 4. Running the selected command until it finishes or Ctrl+C arrives.

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley::{
    calendar::{CalendarStore, calendar_registry},
    commands,
    config::Config,
};
use std::{path::PathBuf, sync::Arc};
use tracing::info;

/// Calendar assistant over the Assistants API (chat) or a realtime voice session.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Text chat, one poll-mode turn per line of stdin
    Chat {
        /// Continue an existing thread instead of creating one
        #[arg(long, value_name = "THREAD_ID")]
        thread: Option<String>,
    },

    /// Spoken turns from WAV files over a realtime session
    Voice {
        /// WAV file holding one spoken turn; repeat for more turns
        #[arg(short, long = "input", value_name = "WAV", required = true)]
        inputs: Vec<PathBuf>,

        /// Directory the reply audio is written to
        #[arg(short, long, value_name = "DIR", default_value = "replies")]
        output_dir: PathBuf,
    },

    /// Print the declared tool schemas as JSON
    Tools,
}

/// Resolves once the user presses `Ctrl+C`.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let store = Arc::new(CalendarStore::new());
    let registry = Arc::new(calendar_registry(store).context("Invalid tool declarations")?);

    if let Command::Tools = cli.command {
        return commands::tools(&registry);
    }

    // --- Configuration and logging ---
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(tools = ?registry.names(), "Configuration loaded");

    let run = async {
        match cli.command {
            Command::Chat { thread } => commands::chat(&config, registry, thread).await,
            Command::Voice { inputs, output_dir } => {
                commands::voice(&config, registry, &inputs, &output_dir).await
            }
            Command::Tools => Ok(()),
        }
    };

    tokio::select! {
        result = run => result?,
        _ = shutdown_signal() => {}
    }

    info!("Shut down.");
    Ok(())
}
