//! Log setup for the `shardgate` binary.
//!
//! Stdout carries what CI scripts consume: the JSON printed by `select` and
//! `matrix` and the per-backend gate verdict lines.
//! Log events, JSON-formatted ones included, always go to stderr so that
//! `shardgate select > selection.json` never captures a log line.
//!
//! Filtering reads `SHARDGATE_LOG`, then `RUST_LOG`, then falls back to the
//! level chosen on the command line (`--verbose` for debug).

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding shardgate's own filter directives.
pub const LOG_ENV: &str = "SHARDGATE_LOG";

/// Default level for the `--verbose` flag.
pub fn log_level(verbose: bool) -> Level {
    if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    }
}

/// Filter directives to use: the first non-blank value from the
/// environment, else `level`.
fn filter_directives(from_env: Option<String>, level: Level) -> String {
    match from_env {
        Some(directives) if !directives.trim().is_empty() => directives,
        _ => level.as_str().to_ascii_lowercase(),
    }
}

fn log_filter(level: Level) -> EnvFilter {
    let from_env = std::env::var(LOG_ENV)
        .ok()
        .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok());
    let directives = filter_directives(from_env, level);
    // unparsable directives would otherwise silence everything
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the stderr subscriber. `json` switches to newline-delimited JSON
/// events for CI log collectors.
///
/// Returns `false` when a global subscriber was already installed; the
/// existing one stays in place.
pub fn init_tracing(json: bool, level: Level) -> bool {
    let filter = log_filter(level);
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry().with(filter).with(layer).try_init()
    };
    installed.is_ok()
}
