//! CLI argument parsing

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Turn research intents in your notes into findings
#[derive(Parser, Debug, Clone)]
#[command(name = "signalforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Vault directory to scan for notes (default: $VAULT_DIR or ./vault)
    #[arg(long, global = true)]
    pub vault_dir: Option<PathBuf>,

    /// Only consider notes modified since this point (7d, 12h, 30m, YYYY-MM-DD, RFC 3339)
    #[arg(long, global = true)]
    pub since: Option<String>,

    /// Extract and filter tasks without researching them
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Ignore task state and run every extracted task
    #[arg(long, global = true)]
    pub force: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Create the findings directory and an empty state file
    Init,
    /// Run one research cycle
    Run,
    /// Run cycles repeatedly under the workspace run lock
    Loop(LoopArgs),
    /// Summarize persisted task state
    Status,
    /// Show the last session and artifacts for a task
    Replay(ReplayArgs),
    /// Drop state records whose note no longer exists
    Purge,
    /// Force re-execution of a task by exact query text
    Rerun(RerunArgs),
}

impl Command {
    /// Whether the command scans notes; `loop --stop` only touches the lock file
    pub fn reads_vault(&self) -> bool {
        match self {
            Command::Run | Command::Rerun(_) | Command::Purge => true,
            Command::Loop(args) => !args.stop,
            Command::Init | Command::Status | Command::Replay(_) => false,
        }
    }
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct LoopArgs {
    /// Minutes to sleep between cycles (default: $LOOP_INTERVAL_MINUTES or 60)
    #[arg(long)]
    pub interval_minutes: Option<u64>,

    /// Stop after this many cycles (default: $LOOP_MAX_CYCLES or unbounded)
    #[arg(long)]
    pub max_cycles: Option<u64>,

    /// Start the loop as a detached background process
    #[arg(long, conflicts_with = "stop")]
    pub daemon: bool,

    /// Stop the running loop instance
    #[arg(long)]
    pub stop: bool,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct ReplayArgs {
    /// Query text or session id
    pub token: Vec<String>,

    /// Open the live view in the default browser
    #[arg(long)]
    pub open: bool,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RerunArgs {
    /// Exact query text to re-run
    pub query: Vec<String>,
}

impl Cli {
    /// The subcommand to run; bare `signalforge` means `run`
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

/// Joins positional words into a single trimmed argument
pub fn joined(words: &[String]) -> String {
    words.join(" ").trim().to_string()
}
