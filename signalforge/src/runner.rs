//! Orchestration of research cycles and the command surface
//!
//! One task runs end to end (research, write, state update) before the next
//! starts. State is saved after a task is marked started and again after it
//! succeeds or fails, so at most one task is ever persisted as in flight.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use signalforge_sdk::{
    FindingWriter, ResearchResult, ResearchTask, Researcher, SourceRegistry, TaskExtractor,
    TaskReason,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ConfigError, LockError};
use crate::intents::IntentExtractor;
use crate::lock::{self, ProcessProbe, RunLock, StopOutcome, StopPolicy, SystemProcesses};
use crate::registry::VaultRegistry;
use crate::research::PipelineResearcher;
use crate::state::{
    self, Decision, PurgeOutcome, RetryPolicy, StateFile, StateStore, StatusSummary,
    TaskStateRecord,
};
use crate::writer::MarkdownFindingWriter;

/// Note used for a synthesized rerun task when the vault has no notes
const MANUAL_SOURCE_ID: &str = "Manual.md";
const RECENT_FAILURES_SHOWN: usize = 5;

/// Collaborators the runner drives
#[derive(Clone)]
pub struct RunnerDeps {
    pub registry: Arc<dyn SourceRegistry>,
    pub extractor: Arc<dyn TaskExtractor>,
    pub researcher: Arc<dyn Researcher>,
    pub writer: Arc<dyn FindingWriter>,
    pub probe: Arc<dyn ProcessProbe>,
}

impl RunnerDeps {
    /// Vault-backed registry and writer, the HTTP research pipeline and real process signals
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            registry: Arc::new(
                VaultRegistry::new(&config.vault_dir).excluding(&config.findings_dir),
            ),
            extractor: Arc::new(IntentExtractor::new()),
            researcher: Arc::new(PipelineResearcher::from_config(config)?),
            writer: Arc::new(MarkdownFindingWriter::new(
                &config.vault_dir,
                &config.findings_dir,
            )),
            probe: Arc::new(SystemProcesses),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Standard,
    /// Re-run tasks matching this exact query, ignoring task state
    Rerun(String),
}

/// Per-cycle counters, never persisted beyond the cycle summary
#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunStats {
    fn start() -> Self {
        Self {
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: 0,
            total: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
        }
    }

    fn finish(&mut self) {
        let ended = Utc::now();
        self.duration_ms = (ended - self.started_at).num_milliseconds();
        self.ended_at = Some(ended);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedTask {
    pub query: String,
    pub source_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WrittenFinding {
    pub query: String,
    pub path: PathBuf,
    pub confidence: f64,
}

/// Outcome of one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub stats: RunStats,
    pub skipped: Vec<SkippedTask>,
    pub findings: Vec<WrittenFinding>,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            stats: RunStats::start(),
            skipped: Vec::new(),
            findings: Vec::new(),
        }
    }

    fn skip(&mut self, task: &ResearchTask, reason: &str) {
        self.stats.skipped += 1;
        self.skipped.push(SkippedTask {
            query: task.query.clone(),
            source_id: task.source_id.clone(),
            reason: reason.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub cycles: u64,
    pub summaries: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonStart {
    pub pid: u32,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub summary: StatusSummary,
    pub state_file: PathBuf,
    /// Pid of the live loop holding the lock, if any
    pub loop_pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayDetails {
    pub query: String,
    pub session_id: Option<String>,
    pub live_view_url: Option<String>,
    pub replay_url: Option<String>,
    pub replay_hint: Option<String>,
    pub finding_path: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl From<&TaskStateRecord> for ReplayDetails {
    fn from(record: &TaskStateRecord) -> Self {
        Self {
            query: record.query.clone(),
            session_id: record.last_session_id.clone(),
            live_view_url: record.last_live_view_url.clone(),
            replay_url: record.last_replay_url.clone(),
            replay_hint: record.last_replay_hint.clone(),
            finding_path: record.finding_path.clone(),
            last_success_at: record.last_success_at,
        }
    }
}

pub struct Runner {
    config: Config,
    deps: RunnerDeps,
    store: StateStore,
    stop_policy: StopPolicy,
}

impl Runner {
    pub fn new(config: Config, deps: RunnerDeps) -> Self {
        let store = StateStore::new(&config.state_file);
        Self {
            config,
            deps,
            store,
            stop_policy: StopPolicy::default(),
        }
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn run_lock(&self) -> RunLock {
        RunLock::new(
            &self.config.lock_file,
            self.config.lock_stale_after(),
            self.deps.probe.clone(),
        )
    }

    /// Creates the findings directory and an empty state file
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.findings_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.config.findings_dir.display()))?;
        let mut state = self.store.load().await;
        self.store.save(&mut state).await?;
        info!(
            findings_dir = %self.config.findings_dir.display(),
            state_file = %self.config.state_file.display(),
            "Initialized SignalForge workspace"
        );
        Ok(())
    }

    /// One pass over the extracted tasks
    pub async fn run_once(&self, mode: RunMode) -> Result<CycleReport> {
        self.config.require_vault()?;
        let mut report = CycleReport::new();
        let mut state = self.store.load().await;

        let items = self.deps.registry.list(self.config.since).await?;
        let versions: HashMap<&str, i64> = items
            .iter()
            .map(|item| (item.id.as_str(), item.modified_ms))
            .collect();

        let tasks = match &mode {
            RunMode::Standard => self.deps.extractor.extract(&items, self.config.max_tasks),
            RunMode::Rerun(query) => self.resolve_rerun(&items, query)?,
        };
        report.stats.total = tasks.len();

        if tasks.is_empty() {
            info!("No research intents found. Add #investigate in your notes.");
            report.stats.finish();
            return Ok(report);
        }

        let policy = RetryPolicy {
            force: self.config.force || matches!(mode, RunMode::Rerun(_)),
            ..self.config.retry_policy()
        };
        let now = Utc::now();

        let mut runnable: Vec<(ResearchTask, i64)> = Vec::new();
        for task in tasks {
            let version = match versions.get(task.source_id.as_str()) {
                Some(version) => *version,
                None if matches!(mode, RunMode::Rerun(_)) => now.timestamp_millis(),
                None => {
                    warn!(query = %task.query, source = %task.source_id, "Skipping task with missing note");
                    report.skip(&task, "missing_note");
                    continue;
                }
            };

            let decision = if self.config.dry_run {
                // dry runs never create records
                match state.tasks.get(&state::task_key(&task)) {
                    Some(record) => state::decide(record, version, &policy, now),
                    None => Decision::Run,
                }
            } else {
                state::decide(state::get_or_create(&mut state, &task), version, &policy, now)
            };

            match decision {
                Decision::Run => runnable.push((task, version)),
                Decision::Skip(reason) => {
                    info!(query = %task.query, source = %task.source_id, reason = reason.as_str(), "Skipping task");
                    report.skip(&task, reason.as_str());
                }
            }
        }

        if runnable.is_empty() {
            info!("No runnable tasks after state checks.");
            if !self.config.dry_run {
                self.store.save(&mut state).await?;
            }
            report.stats.finish();
            return Ok(report);
        }

        info!(count = runnable.len(), "Found research task(s)");
        let last = runnable.len() - 1;
        for (index, (task, version)) in runnable.into_iter().enumerate() {
            info!(query = %task.query, source = %task.source_id, "Investigating task");

            if self.config.dry_run {
                report.stats.processed += 1;
                report.skip(&task, "dry_run");
                info!(query = %task.query, "Dry run enabled, skipping research execution");
                continue;
            }

            self.run_task(&mut state, &task, version, &policy, &mut report)
                .await?;

            if index < last {
                self.rate_limit().await;
            }
        }

        report.stats.finish();
        let stats = &report.stats;
        info!(
            total = stats.total,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            duration_ms = stats.duration_ms,
            "Run summary"
        );
        Ok(report)
    }

    /// Researches and writes one task, recording the outcome in state.
    /// Only persistence failures escape; task failures are recorded.
    async fn run_task(
        &self,
        state: &mut StateFile,
        task: &ResearchTask,
        version: i64,
        policy: &RetryPolicy,
        report: &mut CycleReport,
    ) -> Result<()> {
        state::mark_started(state::get_or_create(state, task), version, Utc::now());
        self.store.save(state).await?;

        let outcome = self.research_and_write(task).await;
        let record = state::get_or_create(state, task);
        report.stats.processed += 1;

        match outcome {
            Ok((result, path)) => {
                // the backlink write bumps the note's version; count it as seen
                let after_write = self
                    .deps
                    .registry
                    .version(&task.source_id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(version);
                let new_version = version.max(after_write);
                let path_text = path.display().to_string();
                state::mark_success(
                    record,
                    &path_text,
                    new_version,
                    Some(&result.artifacts),
                    Utc::now(),
                );
                let advanced = state::advance_siblings(state, task, version, new_version);
                if advanced > 0 {
                    debug!(source = %task.source_id, advanced, "Advanced sibling task versions");
                }
                report.stats.succeeded += 1;

                if let Some(warning) = &result.warning {
                    warn!(query = %task.query, warning = %warning, "Research warning");
                }
                info!(
                    query = %task.query,
                    output_path = %path_text,
                    mode = result.mode.as_str(),
                    confidence = result.synthesis.confidence(),
                    live_view = result.artifacts.live_view_url.as_deref(),
                    session_id = result.artifacts.session_id.as_deref(),
                    "Wrote finding"
                );
                report.findings.push(WrittenFinding {
                    query: task.query.clone(),
                    path,
                    confidence: result.synthesis.confidence(),
                });
            }
            Err(e) => {
                let message = format!("{e:#}");
                state::mark_failure(record, &message, policy, Utc::now());
                report.stats.failed += 1;
                error!(query = %task.query, source = %task.source_id, error = %message, "Task failed");
            }
        }

        self.store.save(state).await
    }

    async fn research_and_write(&self, task: &ResearchTask) -> Result<(ResearchResult, PathBuf)> {
        let result = self.deps.researcher.research(task).await?;
        let path = self.deps.writer.write(task, &result).await?;
        Ok((result, path))
    }

    async fn rate_limit(&self) {
        if self.config.rate_limit_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.rate_limit_ms)).await;
        }
    }

    /// Extracted tasks matching `query` exactly, or one synthesized task
    fn resolve_rerun(
        &self,
        items: &[signalforge_sdk::SourceItem],
        query: &str,
    ) -> Result<Vec<ResearchTask>, ConfigError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ConfigError::MissingArgument {
                command: "rerun",
                what: "a query",
            });
        }

        let matches: Vec<ResearchTask> = self
            .deps
            .extractor
            .extract(items, usize::MAX)
            .into_iter()
            .filter(|t| t.query.to_lowercase() == query.to_lowercase())
            .take(self.config.max_tasks)
            .collect();
        if !matches.is_empty() {
            return Ok(matches);
        }

        let source_id = items
            .first()
            .map(|item| item.id.clone())
            .unwrap_or_else(|| MANUAL_SOURCE_ID.to_string());
        Ok(vec![ResearchTask {
            query: query.to_string(),
            source_id,
            reason: TaskReason::Explicit,
            snippet: format!("rerun:{query}"),
        }])
    }

    pub async fn rerun(&self, query: &str) -> Result<CycleReport> {
        self.run_once(RunMode::Rerun(query.to_string())).await
    }

    /// Repeats cycles under the run lock until the cycle cap, if any
    pub async fn run_loop(&self) -> Result<LoopOutcome> {
        self.config.require_vault()?;
        let guard = self.run_lock().acquire().await?;
        info!(
            pid = std::process::id(),
            lock_file = %self.config.lock_file.display(),
            "Acquired loop lock"
        );

        let result = self.cycles().await;
        guard.release().await?;
        result
    }

    async fn cycles(&self) -> Result<LoopOutcome> {
        let max_cycles = self.config.loop_max_cycles.unwrap_or(u64::MAX);
        let interval = Duration::from_secs(self.config.loop_interval_minutes.saturating_mul(60));
        let mut outcome = LoopOutcome {
            cycles: 0,
            summaries: Vec::new(),
        };

        for cycle in 1..=max_cycles {
            let run_id = Uuid::new_v4();
            let span = info_span!("cycle", cycle, run_id = %run_id);
            let summary = async {
                info!(interval_minutes = self.config.loop_interval_minutes, "Starting loop cycle");
                let report = self.run_once(RunMode::Standard).await?;
                self.write_cycle_summary(cycle, &report).await
            }
            .instrument(span)
            .await?;

            outcome.cycles = cycle;
            outcome.summaries.push(summary);
            if cycle < max_cycles {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(outcome)
    }

    /// Markdown summary of one loop cycle under the findings directory
    pub async fn write_cycle_summary(&self, cycle: u64, report: &CycleReport) -> Result<PathBuf> {
        let dir = self.config.findings_dir.join("Run Summaries");
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let now = Utc::now();
        let stamp = now
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            .replace([':', '.'], "-");
        let path = dir.join(format!("{stamp}-cycle-{cycle}.md"));
        let stats = &report.stats;
        let skipped = if report.skipped.is_empty() {
            "- None".to_string()
        } else {
            report
                .skipped
                .iter()
                .map(|s| format!("- {} ({}): {}", s.query, s.source_id, s.reason))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let markdown = format!(
            "---\ntype: signalforge_cycle_summary\ncycle: {cycle}\ndate: {date}\n---\n\n\
             # SignalForge Loop Cycle {cycle}\n\n\
             - Total tasks: {total}\n\
             - Processed: {processed}\n\
             - Succeeded: {succeeded}\n\
             - Failed: {failed}\n\
             - Skipped: {skipped_count}\n\
             - Duration ms: {duration}\n\
             - Started at: {started}\n\
             - Ended at: {ended}\n\n\
             ## Skipped tasks\n{skipped}\n",
            date = now.format("%Y-%m-%d"),
            total = stats.total,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped_count = stats.skipped,
            duration = stats.duration_ms,
            started = stats.started_at.to_rfc3339(),
            ended = stats.ended_at.map(|e| e.to_rfc3339()).unwrap_or_default(),
        );
        tokio::fs::write(&path, markdown)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Re-launches this binary as a detached loop with `args`
    pub async fn start_daemon(&self, args: &[String]) -> Result<DaemonStart> {
        self.config.require_vault()?;
        if let Some(pid) = self.live_holder().await {
            return Err(LockError::AlreadyHeld { pid }.into());
        }

        let exe = std::env::current_exe().context("Cannot locate the signalforge executable")?;
        let log_path = self.config.state_dir().join("daemon.log");
        let pid = lock::spawn_detached(&exe, args, &log_path)?;
        info!(pid, log = %log_path.display(), "Started loop daemon");
        Ok(DaemonStart { pid, log_path })
    }

    /// Stops the running loop named by the lock file
    pub async fn stop(&self) -> Result<StopOutcome> {
        let outcome = lock::stop_loop(
            &self.config.lock_file,
            self.config.force,
            self.deps.probe.as_ref(),
            self.stop_policy,
        )
        .await?;
        info!(outcome = outcome.as_str(), "Loop stop");
        Ok(outcome)
    }

    async fn live_holder(&self) -> Option<u32> {
        let payload = lock::read_payload(&self.config.lock_file).await?;
        let fresh = Utc::now() - payload.started_at <= self.config.lock_stale_after();
        (fresh && self.deps.probe.is_alive(payload.pid)).then_some(payload.pid)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let state = self.store.load().await;
        let summary = StatusSummary::from_state(&state, RECENT_FAILURES_SHOWN);
        if summary.in_progress > 0 {
            warn!(
                count = summary.in_progress,
                "Tasks left in_progress by an interrupted run"
            );
        }
        let report = StatusReport {
            summary,
            state_file: self.config.state_file.clone(),
            loop_pid: self.live_holder().await,
        };
        info!(
            total = report.summary.total,
            done = report.summary.done,
            failed = report.summary.failed,
            in_progress = report.summary.in_progress,
            pending = report.summary.pending,
            with_session = report.summary.with_session,
            loop_pid = report.loop_pid,
            state_file = %report.state_file.display(),
            "SignalForge status"
        );
        Ok(report)
    }

    /// Last session details for a task, by session id or query
    pub async fn replay(&self, token: &str) -> Result<Option<ReplayDetails>> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ConfigError::MissingArgument {
                command: "replay",
                what: "a query or session id",
            }
            .into());
        }

        let state = self.store.load().await;
        let lowered = token.to_lowercase();
        let found = state.tasks.values().find(|record| {
            record.last_session_id.as_deref() == Some(token) || record.query.to_lowercase() == lowered
        });

        match found {
            Some(record) => {
                let details = ReplayDetails::from(record);
                info!(
                    query = %details.query,
                    session_id = details.session_id.as_deref(),
                    live_view_url = details.live_view_url.as_deref(),
                    replay_hint = details.replay_hint.as_deref(),
                    finding_path = details.finding_path.as_deref(),
                    "Replay details"
                );
                Ok(Some(details))
            }
            None => {
                warn!(token, "No replay match found");
                Ok(None)
            }
        }
    }

    /// Drops records whose note is gone from the vault
    pub async fn purge(&self) -> Result<PurgeOutcome> {
        self.config.require_vault()?;
        let mut state = self.store.load().await;
        let live: HashSet<String> = self
            .deps
            .registry
            .list(None)
            .await?
            .into_iter()
            .map(|item| item.id)
            .collect();

        let outcome = state::purge_orphans(&mut state, &live);
        if !self.config.dry_run && outcome.removed > 0 {
            self.store.save(&mut state).await?;
        }
        info!(
            removed = outcome.removed,
            kept = outcome.kept,
            dry_run = self.config.dry_run,
            "Purged orphaned task records"
        );
        Ok(outcome)
    }
}

