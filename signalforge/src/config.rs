//! Runtime configuration
//!
//! Values are resolved from CLI flags, then environment variables, then
//! defaults. Numeric environment values that are not positive integers fall
//! back to the default instead of failing.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::cli::{Cli, Command};
use crate::error::ConfigError;
use crate::state::RetryPolicy;

const DEFAULT_MAX_TASKS: u64 = 5;
const DEFAULT_MAX_SOURCES_PER_TASK: u64 = 3;
const DEFAULT_MAX_RETRIES: u64 = 4;
const DEFAULT_RETRY_BASE_MINUTES: u64 = 5;
const DEFAULT_LOOP_INTERVAL_MINUTES: u64 = 60;
const DEFAULT_LOCK_STALE_MINUTES: u64 = 180;
const DEFAULT_GENERATIVE_MODEL: &str = "gpt-oss-120b";

/// Credentials for the structured search APIs
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub serpapi_api_key: Option<String>,
    pub tavily_api_key: Option<String>,
}

/// Interactive browser session settings
#[derive(Debug, Clone, Default)]
pub struct BrowserbaseConfig {
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub context_id: Option<String>,
}

/// Generation service settings
#[derive(Debug, Clone)]
pub struct GenerativeConfig {
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_GENERATIVE_MODEL.to_string(),
        }
    }
}

/// Base URLs of every external service, overridable for tests
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub serpapi: String,
    pub tavily: String,
    pub bing: String,
    pub browserbase: String,
    pub generative: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            serpapi: "https://serpapi.com".to_string(),
            tavily: "https://api.tavily.com".to_string(),
            bing: "https://www.bing.com".to_string(),
            browserbase: "https://api.browserbase.com".to_string(),
            generative: "https://api.cerebras.ai/v1".to_string(),
        }
    }
}

/// Resolved configuration for one invocation
#[derive(Debug, Clone)]
pub struct Config {
    pub vault_dir: PathBuf,
    pub findings_dir: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub lock_stale_minutes: u64,
    pub max_tasks: usize,
    pub max_sources_per_task: usize,
    pub max_retries: u32,
    pub retry_base_minutes: u64,
    /// Pause between tasks within a cycle
    pub rate_limit_ms: u64,
    pub loop_interval_minutes: u64,
    pub loop_max_cycles: Option<u64>,
    pub since: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub json: bool,
    pub force: bool,
    pub providers: ProviderKeys,
    pub browserbase: BrowserbaseConfig,
    pub generative: GenerativeConfig,
    pub endpoints: Endpoints,
}

impl Config {
    /// Defaults for a vault, with every derived path under it
    pub fn for_vault(vault_dir: impl Into<PathBuf>) -> Self {
        let vault_dir = vault_dir.into();
        Self {
            findings_dir: vault_dir.join("Inbox").join("Findings"),
            state_file: vault_dir.join(".signalforge").join("state.json"),
            lock_file: vault_dir.join(".signalforge").join("loop.lock"),
            vault_dir,
            lock_stale_minutes: DEFAULT_LOCK_STALE_MINUTES,
            max_tasks: DEFAULT_MAX_TASKS as usize,
            max_sources_per_task: DEFAULT_MAX_SOURCES_PER_TASK as usize,
            max_retries: DEFAULT_MAX_RETRIES as u32,
            retry_base_minutes: DEFAULT_RETRY_BASE_MINUTES,
            rate_limit_ms: 0,
            loop_interval_minutes: DEFAULT_LOOP_INTERVAL_MINUTES,
            loop_max_cycles: None,
            since: None,
            dry_run: false,
            json: false,
            force: false,
            providers: ProviderKeys::default(),
            browserbase: BrowserbaseConfig::default(),
            generative: GenerativeConfig::default(),
            endpoints: Endpoints::default(),
        }
    }

    /// Resolve configuration from parsed flags and an environment snapshot
    pub fn resolve(
        cli: &Cli,
        env: &HashMap<String, String>,
        cwd: &Path,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            env.get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let absolute = |p: PathBuf| if p.is_absolute() { p } else { cwd.join(p) };

        let vault_dir = absolute(
            cli.vault_dir
                .clone()
                .or_else(|| var("VAULT_DIR").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("vault")),
        );
        let mut config = Config::for_vault(vault_dir);

        if let Some(dir) = var("FINDINGS_DIR") {
            config.findings_dir = absolute(PathBuf::from(dir));
        }
        if let Some(file) = var("STATE_FILE") {
            config.state_file = absolute(PathBuf::from(file));
        }
        if let Some(file) = var("LOOP_LOCK_FILE") {
            config.lock_file = absolute(PathBuf::from(file));
        }

        let positive = |name: &str, fallback: u64| var(name).and_then(|v| parse_positive(&v)).unwrap_or(fallback);
        config.max_tasks = positive("MAX_TASKS", DEFAULT_MAX_TASKS) as usize;
        config.max_sources_per_task =
            positive("MAX_SOURCES_PER_TASK", DEFAULT_MAX_SOURCES_PER_TASK) as usize;
        config.max_retries = positive("MAX_RETRIES", DEFAULT_MAX_RETRIES).min(u32::MAX as u64) as u32;
        config.retry_base_minutes = positive("RETRY_BASE_MINUTES", DEFAULT_RETRY_BASE_MINUTES);
        config.lock_stale_minutes = positive("LOCK_STALE_MINUTES", DEFAULT_LOCK_STALE_MINUTES);
        config.rate_limit_ms = var("RATE_LIMIT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let loop_args = match &cli.command {
            Some(Command::Loop(args)) => Some(args),
            _ => None,
        };
        config.loop_interval_minutes = loop_args
            .and_then(|a| a.interval_minutes)
            .filter(|v| *v > 0)
            .unwrap_or_else(|| positive("LOOP_INTERVAL_MINUTES", DEFAULT_LOOP_INTERVAL_MINUTES));
        config.loop_max_cycles = loop_args
            .and_then(|a| a.max_cycles)
            .filter(|v| *v > 0)
            .or_else(|| var("LOOP_MAX_CYCLES").and_then(|v| parse_positive(&v)));

        config.since = cli
            .since
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|raw| parse_since(raw, now))
            .transpose()?;
        config.dry_run = cli.dry_run;
        config.json = cli.json;
        config.force = cli.force;

        config.providers = ProviderKeys {
            serpapi_api_key: var("SERPAPI_API_KEY"),
            tavily_api_key: var("TAVILY_API_KEY"),
        };
        config.browserbase = BrowserbaseConfig {
            api_key: var("BROWSERBASE_API_KEY"),
            project_id: var("BROWSERBASE_PROJECT_ID"),
            context_id: var("BROWSERBASE_CONTEXT_ID"),
        };
        config.generative = GenerativeConfig {
            api_key: var("CEREBRAS_API_KEY"),
            model: var("CEREBRAS_MODEL").unwrap_or_else(|| DEFAULT_GENERATIVE_MODEL.to_string()),
        };

        Ok(config)
    }

    /// Fails when the vault directory does not exist
    pub fn require_vault(&self) -> Result<(), ConfigError> {
        if self.vault_dir.is_dir() {
            Ok(())
        } else {
            Err(ConfigError::MissingVault(self.vault_dir.clone()))
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_base_minutes: self.retry_base_minutes,
            force: self.force,
        }
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::minutes(self.lock_stale_minutes.min(i64::MAX as u64 / 60_000) as i64)
    }

    /// Directory holding the state file, the lock and the daemon log
    pub fn state_dir(&self) -> PathBuf {
        self.state_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.vault_dir.join(".signalforge"))
    }
}

fn parse_positive(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|v| *v > 0)
}

/// Parses `7d`, `12h`, `30m`, `YYYY-MM-DD` or an RFC 3339 timestamp
pub fn parse_since(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
    let invalid = || ConfigError::InvalidSince(raw.to_string());
    let value = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
        return Ok(midnight.and_utc());
    }

    let split = value.len().checked_sub(1).ok_or_else(invalid)?;
    if !value.is_char_boundary(split) {
        return Err(invalid());
    }
    let (amount, unit) = value.split_at(split);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }
    let delta = match unit {
        "d" => Duration::try_days(amount),
        "h" => Duration::try_hours(amount),
        "m" => Duration::try_minutes(amount),
        _ => None,
    }
    .ok_or_else(invalid)?;
    now.checked_sub_signed(delta).ok_or_else(invalid)
}
