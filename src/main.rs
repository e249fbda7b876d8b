use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "dealflow")]
#[command(version, about = "Sales pipeline board and funnel builder back-end")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Answer yes to confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    /// Directory holding `.dealflow/` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .dealflow/dealflow.toml and the database
    Init {
        /// Overwrite an existing config file without asking
        #[arg(long)]
        force: bool,
    },
    /// Start the HTTP API and change feed
    Serve {
        /// Port to serve on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides [server].db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Manage a team's pipeline stages
    Stages {
        #[command(subcommand)]
        command: StagesCommands,
    },
    /// Print pipeline figures for a team, or one closer
    Stats {
        #[arg(long)]
        team: i64,

        #[arg(long)]
        closer: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration (secrets masked)
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default dealflow.toml
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum StagesCommands {
    /// Create the default stage set for a team (idempotent)
    Seed {
        #[arg(long)]
        team: i64,
    },
    /// List a team's stages in board order
    List {
        #[arg(long)]
        team: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force || cli.yes)?,
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(&project_dir, &cli, *port, db_path.clone(), *dev).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, &cli, command.clone())?,
        Commands::Stages { command } => cmd::cmd_stages(&project_dir, command.clone())?,
        Commands::Stats { team, closer } => {
            cmd::cmd_stats(&project_dir, *team, closer.as_deref())?;
        }
    }

    Ok(())
}
