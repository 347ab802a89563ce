//! Superego CLI: the main entry point.
//!
//! Commands:
//! - `onboard`  - Write a default config and an example flow
//! - `run`      - Submit input to a flow and stream the result
//! - `flows`    - List, validate, and add flow definitions
//! - `gateway`  - Start the HTTP/SSE/WebSocket server
//! - `status`   - Show configuration and stored state

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use superego_config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "superego",
    about = "Superego — constitution-gated agent flows",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and an example flow definition
    Onboard,

    /// Submit input to a flow and stream the output
    Run {
        /// Flow definition id
        flow: String,

        /// Input to submit; omit for interactive mode
        #[arg(short, long)]
        input: Option<String>,

        /// Continue an existing instance
        #[arg(long)]
        instance: Option<String>,

        /// Also print the hidden thinking and guidance of every step
        #[arg(long)]
        show_internal: bool,
    },

    /// Manage flow definitions
    Flows {
        #[command(subcommand)]
        action: FlowsAction,
    },

    /// Start the HTTP gateway server
    Gateway {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show configuration and stored state
    Status,
}

#[derive(Subcommand)]
enum FlowsAction {
    /// List stored flow definitions
    List,

    /// Validate a definition file, or every stored definition
    Validate {
        /// TOML file to check instead of the store
        file: Option<PathBuf>,
    },

    /// Validate a definition file and save it to the store
    Add {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load();
    init_tracing(cli.verbose, config.as_ref().is_ok_and(|c| c.logging.json));

    if let Commands::Onboard = cli.command {
        return commands::onboard::run().await;
    }
    let config = config.map_err(|e| format!("Failed to load config: {e}"))?;

    match cli.command {
        Commands::Onboard => {}
        Commands::Run {
            flow,
            input,
            instance,
            show_internal,
        } => commands::run::run(config, &flow, input, instance, show_internal).await?,
        Commands::Flows { action } => match action {
            FlowsAction::List => commands::flows::list(&config).await?,
            FlowsAction::Validate { file } => commands::flows::validate(&config, file).await?,
            FlowsAction::Add { file } => commands::flows::add(&config, &file).await?,
        },
        Commands::Gateway { port } => commands::gateway::run(config, port).await?,
        Commands::Status => commands::status::run(&config).await?,
    }

    Ok(())
}

/// Logs go to stderr so streamed flow output on stdout stays clean.
fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
