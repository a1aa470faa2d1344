//! Diagnostic logging setup.
//!
//! Log lines go to stderr, or to `--log-file` so they never interleave with
//! streamed assistant text. The filter comes from `CONFAB_LOG`, then
//! `RUST_LOG`, then the verbosity flag.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "CONFAB_LOG";

/// Filter directive for the given `-v` count when no environment override
/// is present.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "confab=info,warn",
        2 => "confab=debug,info",
        _ => "trace",
    }
}

fn build_filter(verbosity: u8) -> EnvFilter {
    let from_env = std::env::var(LOG_ENV_VAR)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .filter(|value| !value.trim().is_empty());

    match from_env {
        Some(directives) => EnvFilter::try_new(&directives).unwrap_or_else(|err| {
            eprintln!("⚠️  Ignoring invalid log filter '{directives}': {err}");
            EnvFilter::new(default_directive(verbosity))
        }),
        None => EnvFilter::new(default_directive(verbosity)),
    }
}

/// Installs the global subscriber. Calling it twice keeps the first one.
pub fn init_tracing(log_file: Option<&Path>, verbosity: u8) -> std::io::Result<()> {
    let filter = build_filter(verbosity);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
