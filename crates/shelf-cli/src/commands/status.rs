//! Status command handler

use std::path::PathBuf;

use anyhow::Result;

use shelf_core::{BackendKind, Config, IdentityProvider};

use crate::app::App;
use crate::output::{Output, OutputFormat};

/// Show backend, session and collection state
pub async fn show(app: &App, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config = &app.config;
    let user = app.identity.current_user().await?;
    let config_file = config_path.cloned().unwrap_or_else(Config::config_file_path);

    // Only load the collection when there is someone to load it for
    let view = match user {
        Some(_) => {
            let (sync, _events) = app.open_view().await?;
            let snapshot = sync.snapshot();
            sync.teardown().await;
            Some(snapshot)
        }
        None => None,
    };

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "backend": config.backend,
                    "data_dir": config.data_dir,
                    "api_url": config.api_url,
                    "config_file": config_file,
                    "user": user,
                    "phase": view.as_ref().map(|v| v.phase),
                    "bookmarks": view.as_ref().map(|v| v.bookmarks.len())
                })
            );
        }
        OutputFormat::Quiet => match user {
            Some(ref user) => println!("{}", user.id),
            None => println!("signed-out"),
        },
        OutputFormat::Human => {
            println!("Shelf Status");
            println!("============");
            println!();
            println!("Backend:");
            println!("  Kind:     {}", config.backend);
            match config.backend {
                BackendKind::Local => {
                    println!("  Database: {}", config.database_path().display());
                }
                BackendKind::Hosted => {
                    println!(
                        "  API URL:  {}",
                        config.api_url.as_deref().unwrap_or("(not set)")
                    );
                }
            }
            println!();
            println!("Session:");
            match user {
                Some(ref user) => {
                    println!("  User:  {}", user.id);
                    if let Some(ref email) = user.email {
                        println!("  Email: {}", email);
                    }
                }
                None => println!("  Not signed in. Run `shelf login` to start."),
            }
            if let Some(ref view) = view {
                println!();
                println!("Bookmarks:");
                println!("  Count: {}", view.bookmarks.len());
                println!("  Phase: {}", view.phase);
            }
            println!();
            println!("Config file: {}", config_file.display());
        }
    }

    Ok(())
}
