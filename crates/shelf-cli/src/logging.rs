//! Logging setup
//!
//! Logs go to stderr, or to `log_file` when one is configured. `RUST_LOG`
//! overrides the level chosen with `-v`.

use std::fs::OpenOptions;

use shelf_core::Config;
use tracing_subscriber::EnvFilter;

/// Level for a `-v` count: none = warn, -v = info, -vv = debug, more = trace
fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn env_filter(verbosity: u8) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = level_for(verbosity);
    EnvFilter::new(format!("shelf_core={},shelf_cli={}", level, level))
}

/// Initialize the global subscriber (ignored if one is already set)
pub fn init(verbosity: u8, config: Option<&Config>) {
    let filter = env_filter(verbosity);

    if let Some(path) = config.and_then(|c| c.log_file.as_ref()) {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(file)
                    .try_init();
                return;
            }
            Err(e) => {
                eprintln!("Warning: Could not open log file {:?}: {}", path, e);
            }
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
