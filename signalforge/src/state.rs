//! Persistent per-task state and the retry policy
//!
//! The whole state file is loaded into memory and rewritten on every save.
//! Writes are last-writer-wins; the run lock is what keeps loop instances
//! from racing on the same file.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signalforge_sdk::{ResearchArtifacts, ResearchTask};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::warn;

/// The only recognized schema version
pub const STATE_VERSION: u32 = 1;

/// Backoff never exceeds one day
const MAX_BACKOFF_MINUTES: u64 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStateRecord {
    pub key: String,
    pub query: String,
    pub source_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Source item version seen by the last run, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_note_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finding_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_live_view_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_replay_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_replay_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFile {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub tasks: BTreeMap<String, TaskStateRecord>,
}

impl StateFile {
    /// A state that has never been saved; `updated_at` sits at the epoch
    pub fn empty() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            tasks: BTreeMap::new(),
        }
    }
}

/// Stable identity of a task: sha256 over the source id and lowercased query
pub fn task_key(task: &ResearchTask) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}::{}", task.source_id, task.query.to_lowercase()));
    hex::encode(hasher.finalize())
}

/// Loads and saves the state file at a fixed path
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing, unreadable or unrecognized file is an empty state
    pub async fn load(&self) -> StateFile {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return StateFile::empty(),
        };

        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring malformed state file");
                return StateFile::empty();
            }
        };
        if value.get("version").and_then(|v| v.as_u64()) != Some(STATE_VERSION as u64)
            || !value.get("tasks").is_some_and(|t| t.is_object())
        {
            warn!(path = %self.path.display(), "Ignoring state file with unknown schema");
            return StateFile::empty();
        }

        match serde_json::from_value::<StateFile>(value) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring malformed state file");
                StateFile::empty()
            }
        }
    }

    /// Stamps `updated_at` and overwrites the whole file
    pub async fn save(&self, state: &mut StateFile) -> Result<()> {
        state.version = STATE_VERSION;
        state.updated_at = Utc::now();

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, format!("{json}\n"))
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Returns the record for a task, creating a pending one on first sight
pub fn get_or_create<'a>(state: &'a mut StateFile, task: &ResearchTask) -> &'a mut TaskStateRecord {
    let key = task_key(task);
    state
        .tasks
        .entry(key.clone())
        .or_insert_with(|| TaskStateRecord {
            key,
            query: task.query.clone(),
            source_id: task.source_id.clone(),
            status: TaskStatus::Pending,
            attempts: 0,
            last_run_at: None,
            last_success_at: None,
            last_failure_at: None,
            next_retry_at: None,
            last_note_version: None,
            finding_path: None,
            last_error: None,
            last_session_id: None,
            last_live_view_url: None,
            last_replay_url: None,
            last_replay_hint: None,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_base_minutes: u64,
    pub force: bool,
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts` consecutive failures
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let minutes = self
            .retry_base_minutes
            .saturating_mul(1u64 << exponent)
            .min(MAX_BACKOFF_MINUTES);
        Duration::minutes(minutes as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UpToDate,
    BackoffActive,
    MaxRetriesReached,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::UpToDate => "up_to_date",
            SkipReason::BackoffActive => "backoff_active",
            SkipReason::MaxRetriesReached => "max_retries_reached",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip(SkipReason),
}

/// Whether a task should run now. Rules apply in order; the first match wins.
pub fn decide(
    record: &TaskStateRecord,
    source_version: i64,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Decision {
    if policy.force {
        return Decision::Run;
    }

    if record.status == TaskStatus::Done
        && record
            .last_note_version
            .is_some_and(|seen| seen >= source_version)
    {
        return Decision::Skip(SkipReason::UpToDate);
    }

    if record.status == TaskStatus::Failed {
        if record.next_retry_at.is_some_and(|at| now < at) {
            return Decision::Skip(SkipReason::BackoffActive);
        }
        if record.attempts >= policy.max_retries {
            return Decision::Skip(SkipReason::MaxRetriesReached);
        }
    }

    Decision::Run
}

pub fn mark_started(record: &mut TaskStateRecord, source_version: i64, now: DateTime<Utc>) {
    record.status = TaskStatus::InProgress;
    record.last_run_at = Some(now);
    record.last_note_version = Some(source_version);
}

pub fn mark_success(
    record: &mut TaskStateRecord,
    finding_path: &str,
    source_version: i64,
    artifacts: Option<&ResearchArtifacts>,
    now: DateTime<Utc>,
) {
    record.status = TaskStatus::Done;
    record.attempts = 0;
    record.last_success_at = Some(now);
    record.last_error = None;
    record.next_retry_at = None;
    record.last_note_version = Some(source_version);
    record.finding_path = Some(finding_path.to_string());

    if let Some(artifacts) = artifacts {
        record.last_session_id = artifacts.session_id.clone();
        record.last_live_view_url = artifacts.live_view_url.clone();
        record.last_replay_url = artifacts.replay_url.clone();
        record.last_replay_hint = artifacts.replay_hint.clone();
    }
}

/// Carries a note's new version to the other finished tasks of that note.
///
/// Each backlink write changes the note, so a task finished earlier in the
/// cycle would otherwise look stale on the next one. Records whose stored
/// version predates `seen_version` really are behind and stay untouched.
pub fn advance_siblings(
    state: &mut StateFile,
    task: &ResearchTask,
    seen_version: i64,
    new_version: i64,
) -> usize {
    let own_key = task_key(task);
    let mut advanced = 0;
    for (key, record) in state.tasks.iter_mut() {
        if *key == own_key || record.source_id != task.source_id || record.status != TaskStatus::Done {
            continue;
        }
        if let Some(stored) = record.last_note_version {
            if stored >= seen_version && stored < new_version {
                record.last_note_version = Some(new_version);
                advanced += 1;
            }
        }
    }
    advanced
}

pub fn mark_failure(
    record: &mut TaskStateRecord,
    message: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) {
    record.status = TaskStatus::Failed;
    record.attempts = record.attempts.saturating_add(1);
    record.last_failure_at = Some(now);
    record.last_error = Some(message.to_string());
    record.next_retry_at = Some(now + policy.backoff(record.attempts));
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub removed: usize,
    pub kept: usize,
    pub removed_keys: Vec<String>,
}

/// Drops records whose source no longer exists. Does not persist.
pub fn purge_orphans(state: &mut StateFile, existing_source_ids: &HashSet<String>) -> PurgeOutcome {
    let mut outcome = PurgeOutcome::default();
    state.tasks.retain(|key, record| {
        if existing_source_ids.contains(&record.source_id) {
            outcome.kept += 1;
            true
        } else {
            outcome.removed += 1;
            outcome.removed_keys.push(key.clone());
            false
        }
    });
    outcome
}

/// Counts by status plus the most recent failures
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    /// Records that kept a browser session reference
    pub with_session: usize,
    pub updated_at: Option<DateTime<Utc>>,
    /// `(query, last_error)`, newest failure first
    pub recent_failures: Vec<(String, String)>,
}

impl StatusSummary {
    pub fn from_state(state: &StateFile, failure_limit: usize) -> Self {
        let mut summary = StatusSummary {
            total: state.tasks.len(),
            updated_at: (state.updated_at != DateTime::<Utc>::UNIX_EPOCH).then_some(state.updated_at),
            ..Default::default()
        };

        let mut failures: Vec<&TaskStateRecord> = Vec::new();
        for record in state.tasks.values() {
            if record.last_session_id.is_some() {
                summary.with_session += 1;
            }
            match record.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Done => summary.done += 1,
                TaskStatus::Failed => {
                    summary.failed += 1;
                    failures.push(record);
                }
            }
        }

        failures.sort_by(|a, b| b.last_failure_at.cmp(&a.last_failure_at));
        summary.recent_failures = failures
            .into_iter()
            .take(failure_limit)
            .map(|r| (r.query.clone(), r.last_error.clone().unwrap_or_default()))
            .collect();
        summary
    }
}
