//! Tracing subscriber setup
//!
//! `RUST_LOG` overrides the default `info` level. Logs always go to stderr so
//! command output on stdout stays clean.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber; a second call is a no-op
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.compact().try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
