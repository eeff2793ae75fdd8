//! One-shot cycles: state transitions, skip reasons, rerun and dry run

use super::common::*;
use signalforge::error::ConfigError;
use signalforge::runner::RunMode;
use signalforge::state::{task_key, TaskStatus};
use signalforge_sdk::{ResearchTask, TaskReason};
use std::sync::Arc;
use std::time::Duration;

const NOTE: &str = "Weekly review\n#investigate vector database comparison\n";

fn task_for(query: &str, source_id: &str) -> ResearchTask {
    ResearchTask {
        query: query.to_string(),
        source_id: source_id.to_string(),
        reason: TaskReason::Explicit,
        snippet: String::new(),
    }
}

#[tokio::test]
async fn test_first_run_writes_finding_then_skips_up_to_date() {
    let dir = vault(&[("Projects/Review.md", NOTE)]);
    let (runner, researcher) = default_runner(config(dir.path()));

    let report = runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(report.stats.total, 1);
    assert_eq!(report.stats.processed, 1);
    assert_eq!(report.stats.succeeded, 1);
    assert_eq!(report.findings.len(), 1);
    assert!(report.findings[0].path.exists());

    let note = std::fs::read_to_string(dir.path().join("Projects/Review.md")).unwrap();
    assert!(note.contains("## SignalForge Findings"));
    assert!(note.contains("vector-database-comparison]]"));

    let state = runner.store().load().await;
    let record = &state.tasks[&task_key(&task_for("vector database comparison", "Projects/Review.md"))];
    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.attempts, 0);
    assert_eq!(
        record.last_session_id.as_deref(),
        Some(session_id_for("vector database comparison").as_str())
    );
    assert!(record.finding_path.is_some());

    // the backlink edit must not retrigger the task
    let second = runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(second.stats.processed, 0);
    assert_eq!(second.stats.skipped, 1);
    assert_eq!(second.skipped[0].reason, "up_to_date");
    assert_eq!(researcher.calls().len(), 1);
}

#[tokio::test]
async fn test_intents_sharing_a_note_stay_up_to_date() {
    let dir = vault(&[(
        "Review.md",
        "#investigate vector database comparison\n#investigate letta code\n",
    )]);
    let researcher = Arc::new(ScriptedResearcher::slow(Duration::from_millis(30)));
    let runner = runner(
        config(dir.path()),
        researcher.clone(),
        Arc::new(FakeProcesses::default()),
    );

    let first = runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(first.stats.succeeded, 2);

    // both backlinks changed the note, but nothing the tasks came from
    let second = runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(second.stats.processed, 0);
    assert_eq!(second.stats.skipped, 2);
    assert!(second.skipped.iter().all(|s| s.reason == "up_to_date"));
    assert_eq!(researcher.calls().len(), 2);

    let state = runner.store().load().await;
    let versions: Vec<Option<i64>> = state.tasks.values().map(|r| r.last_note_version).collect();
    assert_eq!(versions[0], versions[1]);
}

#[tokio::test]
async fn test_failure_records_backoff_and_is_skipped() {
    let dir = vault(&[("Review.md", NOTE)]);
    let researcher = Arc::new(ScriptedResearcher::failing(&["vector database comparison"]));
    let runner = runner(
        config(dir.path()),
        researcher.clone(),
        Arc::new(FakeProcesses::default()),
    );

    let report = runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.succeeded, 0);
    assert!(report.findings.is_empty());

    let state = runner.store().load().await;
    let record = &state.tasks[&task_key(&task_for("vector database comparison", "Review.md"))];
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.attempts, 1);
    assert!(record
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("provider exploded")));
    assert!(record.next_retry_at.is_some());

    let second = runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(second.stats.processed, 0);
    assert_eq!(second.skipped[0].reason, "backoff_active");
    assert_eq!(researcher.calls().len(), 1);
}

#[tokio::test]
async fn test_force_ignores_state() {
    let dir = vault(&[("Review.md", NOTE)]);
    let (runner, researcher) = default_runner(config(dir.path()));
    runner.run_once(RunMode::Standard).await.unwrap();

    let mut forced = config(dir.path());
    forced.force = true;
    let forced_runner = super::common::runner(
        forced,
        researcher.clone(),
        Arc::new(FakeProcesses::default()),
    );
    let report = forced_runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(report.stats.succeeded, 1);
    assert_eq!(researcher.calls().len(), 2);
}

#[tokio::test]
async fn test_dry_run_leaves_no_state() {
    let dir = vault(&[("Review.md", NOTE)]);
    let mut cfg = config(dir.path());
    cfg.dry_run = true;
    let state_file = cfg.state_file.clone();
    let (runner, researcher) = default_runner(cfg);

    let report = runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(report.stats.total, 1);
    assert_eq!(report.stats.succeeded, 0);
    assert_eq!(report.skipped[0].reason, "dry_run");
    assert!(researcher.calls().is_empty());
    assert!(!state_file.exists());
}

#[tokio::test]
async fn test_rerun_matches_existing_task() {
    let dir = vault(&[("Review.md", NOTE)]);
    let (runner, researcher) = default_runner(config(dir.path()));
    runner.run_once(RunMode::Standard).await.unwrap();

    let report = runner.rerun("Vector Database Comparison").await.unwrap();
    assert_eq!(report.stats.total, 1);
    assert_eq!(report.stats.succeeded, 1);
    assert_eq!(
        researcher.calls(),
        vec!["vector database comparison", "vector database comparison"]
    );
}

#[tokio::test]
async fn test_rerun_synthesizes_unknown_query() {
    let dir = vault(&[("B.md", "nothing here\n"), ("A.md", "plain text\n")]);
    let (runner, researcher) = default_runner(config(dir.path()));

    let report = runner.rerun("  letta code  ").await.unwrap();
    assert_eq!(report.stats.succeeded, 1);
    assert_eq!(researcher.calls(), vec!["letta code"]);

    let state = runner.store().load().await;
    assert!(state.tasks.contains_key(&task_key(&task_for("letta code", "A.md"))));
    let note = std::fs::read_to_string(dir.path().join("A.md")).unwrap();
    assert!(note.contains("letta-code]]"));
}

#[tokio::test]
async fn test_rerun_requires_query() {
    let dir = vault(&[("A.md", NOTE)]);
    let (runner, _) = default_runner(config(dir.path()));

    let err = runner.rerun("   ").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::MissingArgument { command: "rerun", .. })
    ));
}

#[tokio::test]
async fn test_missing_vault_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = default_runner(config(&dir.path().join("nope")));

    let err = runner.run_once(RunMode::Standard).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::MissingVault(_))
    ));
}

#[tokio::test]
async fn test_findings_are_not_rescanned() {
    let dir = vault(&[("Review.md", NOTE)]);
    let (runner, _) = default_runner(config(dir.path()));
    runner.run_once(RunMode::Standard).await.unwrap();

    // a finding quoting the tag must not become a task of its own
    write_note(
        &dir.path().join("Inbox/Findings"),
        "extra.md",
        "#investigate something from a finding\n",
    );
    let report = runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(report.stats.total, 1);
}

#[tokio::test]
async fn test_no_intents_is_a_quiet_cycle() {
    let dir = vault(&[("Review.md", "groceries\n")]);
    let (runner, researcher) = default_runner(config(dir.path()));

    let report = runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(report.stats.total, 0);
    assert!(researcher.calls().is_empty());
}
