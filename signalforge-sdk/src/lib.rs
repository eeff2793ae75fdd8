//! Shared data model and collaborator contracts for signalforge.
//!
//! The engine crate owns the task lifecycle and the research pipeline; the
//! types here are what flows between it and the pieces it treats as external:
//! the note registry, the task extractor, the researcher and the finding writer.

// Re-export async trait for convenience
pub use async_trait::async_trait;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a research task was discovered in a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskReason {
    /// `#investigate <query>` tag
    Explicit,
    /// Free-text phrase such as "look into X"
    Heuristic,
}

/// One query derived from a note, tracked independently across runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchTask {
    pub query: String,
    /// Relative identifier of the originating note
    pub source_id: String,
    pub reason: TaskReason,
    pub snippet: String,
}

/// A content item supplied by the source registry
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Stable `/`-separated relative identifier
    pub id: String,
    pub path: PathBuf,
    pub content: String,
    /// Last modification, epoch milliseconds. Used as the item's version.
    pub modified_ms: i64,
}

/// A normalized, quality-scored search hit.
///
/// `domain` is always the lowercase hostname of `url`; values that fail URL
/// parsing are never turned into a `SourceLink`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLink {
    pub title: String,
    pub url: String,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    pub quality_score: f64,
}

impl SourceLink {
    pub fn content_len(&self) -> usize {
        self.content.as_deref().map_or(0, |c| c.chars().count())
    }
}

/// References produced by an interactive browser session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchArtifacts {
    pub session_id: Option<String>,
    pub live_view_url: Option<String>,
    pub replay_url: Option<String>,
    pub replay_hint: Option<String>,
    #[serde(default)]
    pub screenshots: Vec<String>,
}

/// Which lookup path produced the sources of a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchMode {
    Browser,
    Fallback,
}

impl ResearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResearchMode::Browser => "browser",
            ResearchMode::Fallback => "fallback",
        }
    }
}

/// Output of the generation service, accepted only when every field validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerativeSynthesis {
    pub summary: String,
    pub insights: Vec<String>,
    pub open_questions: Vec<String>,
    pub confidence: f64,
    pub confidence_reasons: Vec<String>,
}

/// Deterministic synthesis computed from the sources alone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeuristicSynthesis {
    pub summary: String,
    pub insights: Vec<String>,
    pub confidence: f64,
    pub confidence_reasons: Vec<String>,
}

/// Synthesis stage output. One strategy per task, never mixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Synthesis {
    Generative(GenerativeSynthesis),
    Heuristic(HeuristicSynthesis),
}

impl Synthesis {
    pub fn strategy(&self) -> &'static str {
        match self {
            Synthesis::Generative(_) => "generative",
            Synthesis::Heuristic(_) => "heuristic",
        }
    }

    pub fn summary(&self) -> &str {
        match self {
            Synthesis::Generative(s) => &s.summary,
            Synthesis::Heuristic(s) => &s.summary,
        }
    }

    pub fn insights(&self) -> &[String] {
        match self {
            Synthesis::Generative(s) => &s.insights,
            Synthesis::Heuristic(s) => &s.insights,
        }
    }

    /// Follow-up questions; the heuristic strategy never produces any
    pub fn open_questions(&self) -> &[String] {
        match self {
            Synthesis::Generative(s) => &s.open_questions,
            Synthesis::Heuristic(_) => &[],
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Synthesis::Generative(s) => s.confidence,
            Synthesis::Heuristic(s) => s.confidence,
        }
    }

    pub fn confidence_reasons(&self) -> &[String] {
        match self {
            Synthesis::Generative(s) => &s.confidence_reasons,
            Synthesis::Heuristic(s) => &s.confidence_reasons,
        }
    }
}

/// Everything the research pipeline produced for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchResult {
    pub mode: ResearchMode,
    pub synthesis: Synthesis,
    pub citations: Vec<String>,
    pub sources: Vec<SourceLink>,
    pub artifacts: ResearchArtifacts,
    /// Non-fatal problem worth surfacing, e.g. a failed browser session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Supplies the note collection
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// Every eligible item, optionally only those modified after `since`
    async fn list(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<SourceItem>>;

    /// Current version of one item, `None` when it no longer exists
    async fn version(&self, id: &str) -> anyhow::Result<Option<i64>>;
}

/// Turns notes into research tasks. Deterministic and order-preserving.
pub trait TaskExtractor: Send + Sync {
    fn extract(&self, items: &[SourceItem], limit: usize) -> Vec<ResearchTask>;
}

/// Runs the lookup → enrichment → synthesis pipeline for one task
#[async_trait]
pub trait Researcher: Send + Sync {
    async fn research(&self, task: &ResearchTask) -> anyhow::Result<ResearchResult>;
}

/// Persists a finding and links it back into the originating note
#[async_trait]
pub trait FindingWriter: Send + Sync {
    /// Returns the path of the written finding
    async fn write(&self, task: &ResearchTask, result: &ResearchResult) -> anyhow::Result<PathBuf>;
}
