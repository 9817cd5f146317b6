use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use schoolhub::config::{AppConfig, default_config_path};
use schoolhub::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "schoolhub")]
#[command(version, about = "School administration hub: tasks, chat, discussion board and calendar")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to schoolhub.toml. Defaults to ./schoolhub.toml, then the user config dir.
    #[arg(long, global = true, env = "SCHOOLHUB_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the web server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS)
        #[arg(long)]
        dev: bool,

        /// Open a browser once the server is listening
        #[arg(long)]
        open: bool,
    },
    /// Create the database, schema and upload directory
    Init,
    /// Manage accounts
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// View or write configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum UserCommands {
    /// Create an account
    Add {
        username: String,

        /// admin, manager or staff
        #[arg(long, default_value = "staff")]
        role: String,

        /// Defaults to the username
        #[arg(long)]
        display_name: Option<String>,

        #[arg(long)]
        email: Option<String>,

        #[arg(long, env = "SCHOOLHUB_PASSWORD")]
        password: String,
    },
    /// Set a new password
    Passwd {
        username: String,

        #[arg(long, env = "SCHOOLHUB_PASSWORD")]
        password: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration and any warnings
    Show,
    /// Write a default schoolhub.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = AppConfig::load_or_default(&config_path)?;
    let _log_guard = logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
            open,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(path) = db_path {
                config.database.path = path.clone();
            }
            config.server.dev_mode |= *dev;
            cmd::cmd_serve(config, *open).await?;
        }
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::User { command } => cmd::cmd_user(&config, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&config_path, &config, command.clone())?,
    }

    Ok(())
}
