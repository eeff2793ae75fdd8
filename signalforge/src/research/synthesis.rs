//! Synthesis of selected sources into a summary, insights and confidence
//!
//! The generation service is used when configured; its response is accepted
//! only if every field validates. Otherwise the deterministic heuristic runs.
//! A task's synthesis always comes from exactly one of the two.

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use signalforge_sdk::{
    GenerativeSynthesis, HeuristicSynthesis, ResearchMode, ResearchTask, SourceLink, Synthesis,
};
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use super::providers::http_client;
use super::sources::round_to;
use crate::config::GenerativeConfig;

const GENERATIVE_TIMEOUT: Duration = Duration::from_secs(60);
const CONTEXT_CHARS_PER_SOURCE: usize = 1500;
const MAX_HEURISTIC_INSIGHTS: usize = 5;
const MIN_SENTENCE_CHARS: usize = 40;
const MAX_SENTENCE_CHARS: usize = 220;
/// Content longer than this counts toward the depth share of confidence
const DEEP_CONTENT_CHARS: usize = 900;
/// Content longer than this is reported as deep in the confidence reasons
const DEEP_REASON_CHARS: usize = 1200;

const SYSTEM_PROMPT: &str = "You are a research synthesis assistant. Given a research query and source content, produce a structured JSON synthesis. Be concise, evidence-driven, and cite sources by number.";

/// Chat-completions client for the generation service
pub struct GenerativeClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GenerativeClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// `None` when no API key is configured
    pub fn from_config(config: &GenerativeConfig, base_url: &str) -> Result<Option<Self>> {
        let Some(api_key) = &config.api_key else {
            return Ok(None);
        };
        let client = http_client(GENERATIVE_TIMEOUT)?;
        Ok(Some(Self::new(client, base_url, api_key, &config.model)))
    }

    /// Validated synthesis, or `None` if the call fails or the output is malformed
    pub async fn synthesize(
        &self,
        task: &ResearchTask,
        mode: ResearchMode,
        sources: &[SourceLink],
        warning: Option<&str>,
    ) -> Option<GenerativeSynthesis> {
        if sources.is_empty() {
            return None;
        }
        match self.request(task, mode, sources, warning).await {
            Ok(synthesis) => Some(synthesis),
            Err(e) => {
                warn!(query = %task.query, error = %format!("{e:#}"), "Generative synthesis unavailable, using heuristic");
                None
            }
        }
    }

    async fn request(
        &self,
        task: &ResearchTask,
        mode: ResearchMode,
        sources: &[SourceLink],
        warning: Option<&str>,
    ) -> Result<GenerativeSynthesis> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt(task, mode, sources, warning) },
            ],
            "temperature": 0.2,
            "max_completion_tokens": 1024,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("generation request failed")?;
        if !response.status().is_success() {
            bail!("generation service returned {}", response.status());
        }

        let payload: Value = response.json().await.context("generation response is not JSON")?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("generation response has no message content"))?;
        let parsed: Value = serde_json::from_str(content).context("message content is not JSON")?;
        debug!(query = %task.query, "Received generative synthesis");
        validate_generative(&parsed)
    }
}

fn user_prompt(
    task: &ResearchTask,
    mode: ResearchMode,
    sources: &[SourceLink],
    warning: Option<&str>,
) -> String {
    let warning_line = warning.map(|w| format!("Warning: {w}\n")).unwrap_or_default();
    format!(
        r#"Research query: "{query}"
Source note: {source}
Research mode: {mode}
{warning_line}
Sources ({count}):
{context}

Respond with a JSON object matching this exact schema:
{{
  "summary": "2-3 sentence synthesis of the most important findings",
  "insights": ["insight with [N] citation", "..."] (3-5 bullet insights, each citing at least one source),
  "openQuestions": ["question 1", "question 2", "question 3"] (3 follow-up questions worth investigating),
  "confidence": 0.0-1.0 (float, how well-supported the synthesis is by the sources),
  "confidenceReasons": ["reason 1", "reason 2"] (2-3 reasons explaining the confidence score)
}}"#,
        query = task.query,
        source = task.source_id,
        mode = mode.as_str(),
        count = sources.len(),
        context = source_context(sources),
    )
}

/// Numbered source blocks with title, domain, URL and truncated text
pub fn source_context(sources: &[SourceLink]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, source)| {
            let mut block = format!("[{}] {} ({})\nURL: {}", i + 1, source.title, source.domain, source.url);
            let text: String = source
                .content
                .as_deref()
                .filter(|c| !c.is_empty())
                .or(source.snippet.as_deref())
                .unwrap_or_default()
                .chars()
                .take(CONTEXT_CHARS_PER_SOURCE)
                .collect();
            let text = text.trim();
            if !text.is_empty() {
                block.push_str("\nContent: ");
                block.push_str(text);
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn string_list(value: &Value, field: &str, allow_empty: bool) -> Result<Vec<String>> {
    let items = value
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("`{field}` is missing or not an array"))?;
    let list = items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| anyhow!("`{field}` contains a non-string or empty entry"))
        })
        .collect::<Result<Vec<_>>>()?;
    if list.is_empty() && !allow_empty {
        bail!("`{field}` is empty");
    }
    Ok(list)
}

/// Accepts the generation output only if every required field is well-formed
pub fn validate_generative(value: &Value) -> Result<GenerativeSynthesis> {
    let summary = value
        .get("summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("`summary` is missing or empty"))?
        .to_string();
    let insights = string_list(value, "insights", false)?;
    let open_questions = string_list(value, "openQuestions", true)?;
    let confidence_reasons = string_list(value, "confidenceReasons", false)?;
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| (0.0..=1.0).contains(c))
        .ok_or_else(|| anyhow!("`confidence` is missing or outside [0, 1]"))?;

    Ok(GenerativeSynthesis {
        summary,
        insights,
        open_questions,
        confidence: round_to(confidence, 2),
        confidence_reasons,
    })
}

fn sentence_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]\s+").expect("sentence regex must compile"))
}

/// First sentence of useful length, if any
fn first_useful_sentence(text: &str) -> Option<&str> {
    sentence_split_re()
        .split(text)
        .map(str::trim)
        .find(|s| (MIN_SENTENCE_CHARS..=MAX_SENTENCE_CHARS).contains(&s.chars().count()))
}

fn unique_domains(sources: &[SourceLink]) -> usize {
    sources.iter().map(|s| s.domain.as_str()).collect::<HashSet<_>>().len()
}

/// Weighted blend of quality, domain diversity and content depth, rounded to 2 decimals
pub fn heuristic_confidence(sources: &[SourceLink]) -> f64 {
    if sources.is_empty() {
        return 0.2;
    }
    let count = sources.len() as f64;
    let avg_quality = sources.iter().map(|s| s.quality_score).sum::<f64>() / count;
    let diversity = (unique_domains(sources) as f64 / 3.0).min(1.0);
    let deep = sources
        .iter()
        .filter(|s| s.content_len() > DEEP_CONTENT_CHARS)
        .count() as f64
        / count;
    round_to((avg_quality * 0.6 + diversity * 0.2 + deep * 0.2).clamp(0.0, 1.0), 2)
}

/// Deterministic synthesis from the sources alone
pub fn heuristic_synthesis(query: &str, sources: &[SourceLink]) -> HeuristicSynthesis {
    let mut insights: Vec<String> = sources
        .iter()
        .enumerate()
        .filter_map(|(i, source)| {
            let text = source
                .content
                .as_deref()
                .filter(|c| !c.is_empty())
                .or(source.snippet.as_deref())?;
            first_useful_sentence(text).map(|sentence| format!("{sentence} [{}]", i + 1))
        })
        .take(MAX_HEURISTIC_INSIGHTS)
        .collect();

    let summary = if insights.is_empty() {
        format!(
            "Captured {} source(s) for \"{query}\" but synthesis is limited.",
            sources.len()
        )
    } else {
        format!(
            "Synthesized {} evidence-backed insight(s) for \"{query}\" from {} source(s).",
            insights.len(),
            sources.len()
        )
    };

    if insights.is_empty() {
        insights.push(if sources.is_empty() {
            format!("No usable sources were found for \"{query}\", so no evidence-backed insights are available.")
        } else {
            format!("Initial results for \"{query}\" are available, but source text extraction was limited.")
        });
    }

    let deep = sources.iter().any(|s| s.content_len() > DEEP_REASON_CHARS);
    let confidence_reasons = vec![
        format!("{} source(s) captured", sources.len()),
        format!("{} unique domain(s)", unique_domains(sources)),
        if deep {
            "At least one source has deep content".to_string()
        } else {
            "Sources are shallow or snippet-only".to_string()
        },
    ];

    HeuristicSynthesis {
        summary,
        insights,
        confidence: heuristic_confidence(sources),
        confidence_reasons,
    }
}

/// `[n] title - url`, one per source in order
pub fn citations(sources: &[SourceLink]) -> Vec<String> {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] {} - {}", i + 1, s.title, s.url))
        .collect()
}

fn with_warning(summary: String, warning: Option<&str>) -> String {
    match warning {
        Some(w) => format!("{summary} Warning: {w}"),
        None => summary,
    }
}

/// Generative synthesis when available and valid, heuristic otherwise
pub async fn synthesize(
    generative: Option<&GenerativeClient>,
    task: &ResearchTask,
    mode: ResearchMode,
    sources: &[SourceLink],
    warning: Option<&str>,
) -> Synthesis {
    if let Some(client) = generative {
        if let Some(mut result) = client.synthesize(task, mode, sources, warning).await {
            result.summary = with_warning(result.summary, warning);
            return Synthesis::Generative(result);
        }
    }

    let mut result = heuristic_synthesis(&task.query, sources);
    result.summary = with_warning(result.summary, warning);
    Synthesis::Heuristic(result)
}
