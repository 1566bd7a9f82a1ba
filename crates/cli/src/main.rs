//! Cortex CLI — the main entry point.
//!
//! Commands:
//! - `init`     — Write a starter config
//! - `status`   — Show configuration and server liveness
//! - `tools`    — List every discovered tool
//! - `ask`      — Run one turn and print the answer
//! - `run`      — Start the worker on the stimulus stream (or stdin)
//! - `session`  — Inspect stored sessions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "cortex",
    about = "Cortex — multi-transport tool dispatcher and strategy loop",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $CORTEX_CONFIG, then ~/.cortex/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and server status
    Status,

    /// List the tools every server exposes
    Tools,

    /// Run a single turn and print the answer
    Ask {
        /// The request text
        message: String,

        /// Session to run the turn in
        #[arg(short, long, default_value = "local")]
        session: String,

        /// Print the turn trace after the answer
        #[arg(long)]
        trace: bool,
    },

    /// Start the session worker
    Run {
        /// Read stimuli from stdin instead of the configured stream
        #[arg(long)]
        stdin: bool,

        /// Session used for stdin input
        #[arg(short, long, default_value = "local")]
        session: String,
    },

    /// Inspect stored sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List stored session ids
    List,

    /// Print every committed turn of a session
    Show {
        session_id: String,

        /// Dump the raw session state as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = cli.config;
    match cli.command {
        Commands::Init { force } => commands::init::run(config, force).await?,
        Commands::Status => commands::status::run(config).await?,
        Commands::Tools => commands::tools::run(config).await?,
        Commands::Ask {
            message,
            session,
            trace,
        } => commands::ask::run(config, message, session, trace).await?,
        Commands::Run { stdin, session } => commands::run::run(config, stdin, session).await?,
        Commands::Session { action } => match action {
            SessionAction::List => commands::session::list(config).await?,
            SessionAction::Show { session_id, json } => {
                commands::session::show(config, session_id, json).await?
            }
        },
    }

    Ok(())
}
