//! Shared fixtures for runner tests

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use signalforge::config::Config;
use signalforge::intents::IntentExtractor;
use signalforge::lock::ProcessProbe;
use signalforge::registry::VaultRegistry;
use signalforge::runner::{Runner, RunnerDeps};
use signalforge::writer::MarkdownFindingWriter;
use signalforge_sdk::{
    HeuristicSynthesis, ResearchArtifacts, ResearchMode, ResearchResult, ResearchTask, Researcher,
    Synthesis,
};

/// Succeeds for every query except those listed in `failing`
#[derive(Default)]
pub struct ScriptedResearcher {
    pub failing: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<String>>,
    /// Time each lookup takes, so note writes land on distinct mtimes
    pub delay: Option<Duration>,
}

impl ScriptedResearcher {
    pub fn failing(queries: &[&str]) -> Self {
        Self {
            failing: Mutex::new(queries.iter().map(|q| q.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn session_id_for(query: &str) -> String {
    format!("session-{}", query.replace(' ', "-"))
}

#[async_trait]
impl Researcher for ScriptedResearcher {
    async fn research(&self, task: &ResearchTask) -> Result<ResearchResult> {
        self.calls.lock().unwrap().push(task.query.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&task.query) {
            bail!("provider exploded for {}", task.query);
        }

        let session = session_id_for(&task.query);
        Ok(ResearchResult {
            mode: ResearchMode::Browser,
            synthesis: Synthesis::Heuristic(HeuristicSynthesis {
                summary: format!("Captured 0 source(s) for \"{}\" but synthesis is limited.", task.query),
                insights: vec!["Nothing yet".to_string()],
                confidence: 0.2,
                confidence_reasons: vec!["0 source(s) captured".to_string()],
            }),
            citations: Vec::new(),
            sources: Vec::new(),
            artifacts: ResearchArtifacts {
                live_view_url: Some(format!("https://live.example/{session}")),
                replay_url: Some(format!("https://www.browserbase.com/sessions/{session}")),
                replay_hint: Some(format!("Recording available via Browserbase session {session}")),
                session_id: Some(session),
                screenshots: Vec::new(),
            },
            warning: None,
        })
    }
}

/// Pids in the set are alive; signals remove them
#[derive(Default)]
pub struct FakeProcesses {
    pub alive: Mutex<HashSet<u32>>,
}

impl FakeProcesses {
    pub fn with_alive(pids: &[u32]) -> Self {
        Self {
            alive: Mutex::new(pids.iter().copied().collect()),
        }
    }
}

impl ProcessProbe for FakeProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn terminate(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().remove(&pid);
        true
    }

    fn kill(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().remove(&pid);
        true
    }
}

/// Temporary vault with the given notes, relative path to content
pub fn vault(notes: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (id, content) in notes {
        write_note(dir.path(), id, content);
    }
    dir
}

pub fn write_note(vault: &Path, id: &str, content: &str) {
    let path = vault.join(id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn config(vault: &Path) -> Config {
    Config::for_vault(vault)
}

pub fn runner(
    config: Config,
    researcher: Arc<ScriptedResearcher>,
    probe: Arc<FakeProcesses>,
) -> Runner {
    let deps = RunnerDeps {
        registry: Arc::new(
            VaultRegistry::new(&config.vault_dir).excluding(&config.findings_dir),
        ),
        extractor: Arc::new(IntentExtractor::new()),
        researcher,
        writer: Arc::new(MarkdownFindingWriter::new(
            &config.vault_dir,
            &config.findings_dir,
        )),
        probe,
    };
    Runner::new(config, deps)
}

pub fn default_runner(config: Config) -> (Runner, Arc<ScriptedResearcher>) {
    let researcher = Arc::new(ScriptedResearcher::default());
    let runner = runner(config, researcher.clone(), Arc::new(FakeProcesses::default()));
    (runner, researcher)
}
