//! Shelf CLI
//!
//! Command-line interface for Shelf - a live-synchronized bookmark list.

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use shelf_core::Config;

mod app;
mod commands;
mod logging;
mod output;
mod prompt;

use app::App;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "shelf")]
#[command(about = "Shelf - bookmarks that stay in sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a user id (local backend) or an access token
    Login {
        /// User id to act as
        #[arg(long, conflicts_with = "token")]
        user: Option<String>,
        /// Access token issued by the identity provider
        #[arg(long)]
        token: Option<String>,
        /// Email to show for the user
        #[arg(long)]
        email: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Add a bookmark
    Add {
        /// URL to save (https:// is added when missing)
        url: String,
        /// Bookmark title
        #[arg(short, long)]
        title: String,
    },
    /// List bookmarks, newest first
    #[command(alias = "ls")]
    List,
    /// Change a bookmark's url or title
    Edit {
        /// Bookmark ID (full id or prefix)
        id: String,
        /// New URL
        #[arg(short, long)]
        url: Option<String>,
        /// New title
        #[arg(short, long)]
        title: Option<String>,
    },
    /// Delete a bookmark
    #[command(alias = "delete")]
    Rm {
        /// Bookmark ID (full id or prefix)
        id: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Open a bookmark in the browser
    Open {
        /// Bookmark ID (full id or prefix)
        id: String,
    },
    /// Print the list and follow changes as they happen
    Watch,
    /// Show backend, session and bookmark status
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, backend, api_url, api_key, ...)
        key: String,
        /// Configuration value ("none" clears optional keys)
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // A broken config file should still let `config set` repair it
    let loaded = Config::load_with_cli_override(config_path);
    logging::init(cli.verbose, loaded.as_ref().ok());

    if let Commands::Config { command } = cli.command {
        return handle_config_command(command, config_path, &output);
    }

    let app = App::new(loaded?)?;

    match cli.command {
        Commands::Login { user, token, email } => {
            commands::auth::login(&app, user, token, email, &output).await
        }
        Commands::Logout => commands::auth::logout(&app, &output).await,
        Commands::Whoami => commands::auth::whoami(&app, &output).await,
        Commands::Add { url, title } => commands::bookmark::add(&app, url, title, &output).await,
        Commands::List => commands::bookmark::list(&app, &output).await,
        Commands::Edit { id, url, title } => {
            commands::bookmark::edit(&app, id, url, title, &output).await
        }
        Commands::Rm { id, yes } => commands::bookmark::delete(&app, id, yes, &output).await,
        Commands::Open { id } => commands::bookmark::open(&app, id, &output).await,
        Commands::Watch => commands::watch::watch(&app, &output).await,
        Commands::Status => commands::status::show(&app, config_path, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}
