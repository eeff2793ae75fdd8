//! Typed failures that callers match on.
//!
//! Orchestration code propagates everything else as `anyhow::Error`.

use std::path::PathBuf;
use thiserror::Error;

/// Invalid invocation, raised before any side effect
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing vault directory: {0}. Set VAULT_DIR or pass --vault-dir.")]
    MissingVault(PathBuf),

    #[error("Invalid --since value '{0}'. Use 7d, 12h, 30m, YYYY-MM-DD or an RFC 3339 timestamp.")]
    InvalidSince(String),

    #[error("{command} requires {what}. Example: signalforge {command} \"letta code\"")]
    MissingArgument {
        command: &'static str,
        what: &'static str,
    },
}

/// Run lock failures
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Loop lock is already held by pid {pid}.")]
    AlreadyHeld { pid: u32 },

    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
