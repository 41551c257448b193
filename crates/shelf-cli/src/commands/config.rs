//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use shelf_core::Config;

use crate::output::{Output, OutputFormat};

const KEYS: &str = "data_dir, backend, api_url, api_key, fetch_timeout_secs, \
                    rollback_failed_deletes, reconnect_initial_secs, reconnect_max_secs, log_file";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    let api_key = config.api_key.as_deref().map(mask);

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "backend": config.backend,
                    "api_url": config.api_url,
                    "api_key": api_key,
                    "fetch_timeout_secs": config.fetch_timeout_secs,
                    "rollback_failed_deletes": config.rollback_failed_deletes,
                    "reconnect_initial_secs": config.reconnect_initial_secs,
                    "reconnect_max_secs": config.reconnect_max_secs,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:                {}", config.data_dir.display());
            println!("  backend:                 {}", config.backend);
            println!(
                "  api_url:                 {}",
                config.api_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  api_key:                 {}",
                api_key.as_deref().unwrap_or("(not set)")
            );
            println!("  fetch_timeout_secs:      {}", config.fetch_timeout_secs);
            println!("  rollback_failed_deletes: {}", config.rollback_failed_deletes);
            println!("  reconnect_initial_secs:  {}", config.reconnect_initial_secs);
            println!("  reconnect_max_secs:      {}", config.reconnect_max_secs);
            println!(
                "  log_file:                {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "api_key" { mask(&value) } else { value };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = value.into(),
        "backend" => config.backend = value.parse()?,
        "api_url" => config.api_url = optional(value),
        "api_key" => config.api_key = optional(value),
        "fetch_timeout_secs" => {
            config.fetch_timeout_secs = value
                .parse()
                .context("Invalid value for fetch_timeout_secs. Use a whole number of seconds.")?;
        }
        "rollback_failed_deletes" => {
            config.rollback_failed_deletes = value
                .parse()
                .context("Invalid value for rollback_failed_deletes. Use 'true' or 'false'.")?;
        }
        "reconnect_initial_secs" => {
            config.reconnect_initial_secs = value
                .parse()
                .context("Invalid value for reconnect_initial_secs. Use a whole number of seconds.")?;
        }
        "reconnect_max_secs" => {
            config.reconnect_max_secs = value
                .parse()
                .context("Invalid value for reconnect_max_secs. Use a whole number of seconds.")?;
        }
        "log_file" => config.log_file = optional(value).map(PathBuf::from),
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                KEYS
            );
        }
    }
    Ok(())
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Keep the first four characters of a secret
fn mask(secret: &str) -> String {
    let head: String = secret.chars().take(4).collect();
    format!("{}****", head)
}
