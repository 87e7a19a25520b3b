//! Agentry CLI — the main entry point.
//!
//! Commands:
//! - `init`   — Write the default configuration
//! - `chat`   — Run one query and stream the answer
//! - `serve`  — Start the HTTP gateway

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "agentry",
    about = "Agentry — agent execution engine with tool calling and streaming",
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
    /// Write the default configuration file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Send one query to an agent and stream its answer
    Chat {
        /// The query
        #[arg(short, long)]
        message: String,

        /// Agent persona to run
        #[arg(short, long, default_value = "chat")]
        agent: String,

        /// User the conversation belongs to
        #[arg(short, long, env = "AGENTRY_USER", default_value = "local")]
        user: String,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,
    },

    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init { force } => commands::init::run(force).await?,
        Commands::Chat {
            message,
            agent,
            user,
            conversation,
        } => commands::chat::run(message, agent, user, conversation).await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
    }

    Ok(())
}
