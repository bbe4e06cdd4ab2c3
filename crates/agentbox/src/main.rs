//! agentbox - sandboxed execution and provider management for AI coding agents.
//!
//! This is the main entry point for the agentbox CLI.

mod commands;

use agentbox_util::log::{self, LogConfig, LogLevel, LogTarget};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agentbox")]
#[command(author, version, about = "Sandboxed execution for AI coding agents", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project directory searched for agentbox.json(c)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to (defaults to the configured server address)
        #[arg(short, long)]
        address: Option<SocketAddr>,
    },
    /// Run the MCP tool server on stdio
    Mcp {
        /// Base URL of a running agentbox server
        #[arg(long, default_value = agentbox_mcp::DEFAULT_API_URL)]
        api_url: String,
        /// Directory relative tool paths resolve against
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// List providers with their availability
    Providers,
    /// Show the effective configuration
    Config,
}

/// Logging goes to stdout for the server and to a file for the MCP server,
/// whose stdout is the protocol channel.
fn init_logging(verbose: bool, command: &Commands) {
    let level = if verbose { LogLevel::Debug } else { LogLevel::Info };
    let target = match command {
        Commands::Mcp { .. } => match log::default_log_path() {
            Some(path) => LogTarget::File(path),
            None => LogTarget::Stderr,
        },
        Commands::Serve { .. } => LogTarget::Stdout,
        Commands::Providers | Commands::Config => LogTarget::Stderr,
    };
    log::init(LogConfig {
        level,
        target,
        include_location: verbose,
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, &cli.command);

    let project = match cli.project {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Serve { address } => commands::serve(&project, address).await,
        Commands::Mcp { api_url, cwd } => {
            let cwd = cwd.unwrap_or_else(|| project.clone());
            commands::mcp(&api_url, cwd).await
        }
        Commands::Providers => commands::providers(&project).await,
        Commands::Config => commands::config(&project).await,
    }
}
