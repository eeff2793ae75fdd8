//! Finding markdown files and backlinks into the originating note

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use signalforge_sdk::{FindingWriter, ResearchResult, ResearchTask};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::utils::slugify;

pub const BACKLINK_HEADING: &str = "## SignalForge Findings";

#[derive(Debug, Serialize)]
struct FindingFrontMatter<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    date: &'a str,
    query: &'a str,
    source_note: &'a str,
    project: String,
    tags: Vec<String>,
    confidence: f64,
    mode: &'static str,
    synthesis: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

pub struct MarkdownFindingWriter {
    vault_dir: PathBuf,
    findings_dir: PathBuf,
}

impl MarkdownFindingWriter {
    pub fn new(vault_dir: impl Into<PathBuf>, findings_dir: impl Into<PathBuf>) -> Self {
        Self {
            vault_dir: vault_dir.into(),
            findings_dir: findings_dir.into(),
        }
    }

    /// Path of the finding for `query` written on `date`
    pub fn finding_path(&self, date: &str, query: &str) -> PathBuf {
        let slug = slugify(query, 50);
        let slug = if slug.is_empty() { "finding".to_string() } else { slug };
        self.findings_dir.join(format!("{date} - {slug}.md"))
    }

    /// Wiki-link target of a finding: vault-relative, `/`-separated, no extension
    fn link_target(&self, finding: &Path) -> String {
        let relative = finding.strip_prefix(&self.vault_dir).unwrap_or(finding);
        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        joined
            .strip_suffix(".md")
            .map(str::to_string)
            .unwrap_or(joined)
    }

    /// Appends a dated link under the findings heading; a repeated link is not added twice
    async fn insert_backlink(&self, source_id: &str, finding: &Path, date: &str) -> Result<()> {
        let note = self.vault_dir.join(source_id);
        let content = match tokio::fs::read_to_string(&note).await {
            Ok(content) => content,
            Err(_) => {
                debug!(note = %note.display(), "Originating note missing, skipping backlink");
                return Ok(());
            }
        };

        let link = format!("- {date}: [[{}]]", self.link_target(finding));
        if content.contains(&link) {
            return Ok(());
        }

        let updated = if content.contains(BACKLINK_HEADING) {
            format!("{}\n{link}\n", content.trim_end())
        } else {
            format!("{}\n\n{BACKLINK_HEADING}\n{link}\n", content.trim_end())
        };
        tokio::fs::write(&note, updated)
            .await
            .with_context(|| format!("Failed to update {}", note.display()))
    }
}

pub fn suggested_move(task: &ResearchTask, result: &ResearchResult) -> String {
    if result.sources.is_empty() {
        format!(
            "Re-run investigation for \"{}\" with a refined prompt in your note using #investigate.",
            task.query
        )
    } else {
        format!(
            "Review the top source, add one concrete next action under #execute for \"{}\", then run SignalForge again.",
            task.query
        )
    }
}

pub fn default_open_questions(task: &ResearchTask) -> Vec<String> {
    vec![
        format!(
            "What is the strongest practical use-case of \"{}\" for your current work?",
            task.query
        ),
        "Which cited source should you validate directly first?".to_string(),
        "What should be tested in the next 7 days?".to_string(),
    ]
}

/// `signalforge`, `research` and up to three query words longer than two characters
pub fn derive_tags(query: &str) -> Vec<String> {
    let mut tags = vec!["signalforge".to_string(), "research".to_string()];
    tags.extend(
        query
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| w.len() > 2)
            .take(3)
            .map(str::to_string),
    );
    tags
}

/// Top-level folder of the note, or `general` for notes at the vault root
pub fn derive_project(source_id: &str) -> String {
    match source_id.split_once('/') {
        Some((folder, _)) if !folder.trim().is_empty() => folder
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect(),
        _ => "general".to_string(),
    }
}

fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return format!("- {empty}");
    }
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Full finding document, front matter included
pub fn render_finding(date: &str, task: &ResearchTask, result: &ResearchResult) -> Result<String> {
    let synthesis = &result.synthesis;
    let front = FindingFrontMatter {
        kind: "signalforge_finding",
        date,
        query: &task.query,
        source_note: &task.source_id,
        project: derive_project(&task.source_id),
        tags: derive_tags(&task.query),
        confidence: synthesis.confidence(),
        mode: result.mode.as_str(),
        synthesis: synthesis.strategy(),
        session_id: result.artifacts.session_id.as_deref(),
    };
    let yaml = serde_yaml::to_string(&front).context("Failed to render front matter")?;

    let evidence: Vec<String> = result
        .sources
        .iter()
        .map(|s| format!("[{}]({})", s.title, s.url))
        .collect();
    let open_questions = if synthesis.open_questions().is_empty() {
        default_open_questions(task)
    } else {
        synthesis.open_questions().to_vec()
    };
    let artifacts = &result.artifacts;
    let na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());

    Ok(format!(
        r#"---
{yaml}---

# SignalForge Finding: {query}

## What changed
{summary}

## Why it matters
This topic appeared in your notes and has been converted into a research task tied to your workflow.

## Suggested move
{suggested}

## Evidence links
{evidence}

## Key insights
{insights}

## Citations
{citations}

## Artifacts
- Source note: {source}
- Browser session: {session}
- Live view: {live}
- Replay: {replay}
- Replay hint: {hint}
- Screenshots:
{screenshots}

## Confidence
- Score: {confidence:.2}
{reasons}

## Open questions
{questions}
"#,
        query = task.query,
        summary = synthesis.summary(),
        suggested = suggested_move(task, result),
        evidence = bullet_list(&evidence, "No sources captured"),
        insights = bullet_list(synthesis.insights(), "None"),
        citations = bullet_list(&result.citations, "None"),
        source = task.source_id,
        session = na(&artifacts.session_id),
        live = na(&artifacts.live_view_url),
        replay = na(&artifacts.replay_url),
        hint = na(&artifacts.replay_hint),
        screenshots = bullet_list(&artifacts.screenshots, "None"),
        confidence = synthesis.confidence(),
        reasons = bullet_list(synthesis.confidence_reasons(), "None"),
        questions = bullet_list(&open_questions, "None"),
    ))
}

#[async_trait]
impl FindingWriter for MarkdownFindingWriter {
    async fn write(&self, task: &ResearchTask, result: &ResearchResult) -> Result<PathBuf> {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let path = self.finding_path(&date, &task.query);

        tokio::fs::create_dir_all(&self.findings_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.findings_dir.display()))?;
        let markdown = render_finding(&date, task, result)?;
        tokio::fs::write(&path, markdown)
            .await
            .with_context(|| format!("Failed to write finding {}", path.display()))?;

        self.insert_backlink(&task.source_id, &path, &date).await?;
        Ok(path)
    }
}
