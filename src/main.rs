use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fleet::config::{DEFAULT_CONFIG_DIR, FleetToml};

mod cmd;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(version, about = "Task orchestration server for remote AI coding agents")]
pub struct Cli {
    /// Log at debug level regardless of fleet.toml
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding fleet.toml
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP hub (REST API, webhooks, live feed)
    Serve {
        /// Port to listen on (overrides fleet.toml and FLEET_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,
        /// SQLite database file
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Permissive CORS for a separately served dashboard
        #[arg(long)]
        dev: bool,
    },
    /// Create the database schema and exit
    InitDb {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Manage hub users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Talk to the execution provider directly
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// View configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum UserCommands {
    /// Create a user and print their API token
    Add {
        email: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    /// Poll a provider task until it finishes
    Wait {
        /// Provider-side task id
        external_id: String,
        /// Poll interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration (secrets omitted)
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = FleetToml::load_or_default(&cli.config_dir)
        .with_context(|| format!("Failed to load config from {}", cli.config_dir.display()))?;
    if cli.verbose {
        settings.logging.level = "debug".to_string();
    }
    let _log_guard = fleet::telemetry::init_tracing(&settings.logging)?;

    match &cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            cmd::cmd_serve(&settings, *port, host.clone(), db_path.clone(), *dev).await?;
        }
        Commands::InitDb { db_path } => cmd::cmd_init_db(&settings, db_path.clone())?,
        Commands::User { command } => match command {
            UserCommands::Add {
                email,
                name,
                db_path,
            } => cmd::cmd_user_add(&settings, email, name.as_deref(), db_path.clone())?,
        },
        Commands::Task { command } => match command {
            TaskCommands::Wait {
                external_id,
                interval_ms,
                timeout_ms,
            } => cmd::cmd_task_wait(&settings, external_id, *interval_ms, *timeout_ms).await?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => cmd::cmd_config_show(&settings)?,
        },
    }

    Ok(())
}
