//! Source normalization, scoring and domain-diverse selection

use signalforge_sdk::SourceLink;
use std::cmp::Ordering;
use std::collections::HashSet;
use url::Url;

const TRUSTED_DOMAINS: &[&str] = &[
    "github.com",
    "docs.github.com",
    "developer.mozilla.org",
    "wikipedia.org",
    "arxiv.org",
    "openai.com",
    "npmjs.com",
    "docs.rs",
    "crates.io",
    "rust-lang.org",
];

/// Content length at which the length bonus saturates
const FULL_CONTENT_CHARS: f64 = 3000.0;

/// An unvalidated search hit as returned by a provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawHit {
    pub title: Option<String>,
    pub url: String,
    pub snippet: Option<String>,
}

impl RawHit {
    pub fn new(title: impl Into<String>, url: impl Into<String>, snippet: Option<String>) -> Self {
        Self {
            title: Some(title.into()),
            url: url.into(),
            snippet,
        }
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Lowercase hostname of an absolute URL
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

pub fn is_trusted_domain(domain: &str) -> bool {
    TRUSTED_DOMAINS.iter().any(|trusted| {
        domain == *trusted
            || domain
                .strip_suffix(trusted)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

fn base_quality_score(domain: &str, title: &str) -> f64 {
    let trusted = if is_trusted_domain(domain) { 0.25 } else { 0.0 };
    let baseline = 0.15;
    let title_score = (title.trim().chars().count() as f64 / 80.0).min(1.0) * 0.15;
    round_to((trusted + baseline + title_score).clamp(0.0, 1.0), 3)
}

/// Builds a scored [`SourceLink`], or `None` when the URL has no hostname
pub fn normalize(raw: RawHit) -> Option<SourceLink> {
    let url = raw.url.trim().to_string();
    if url.is_empty() {
        return None;
    }
    let domain = domain_of(&url)?;

    let title = raw
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| url.clone());
    let snippet = raw
        .snippet
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let quality_score = base_quality_score(&domain, raw_title_for_score(&title, &url));

    Some(SourceLink {
        title,
        url,
        domain,
        snippet,
        content: None,
        fetched_at: None,
        quality_score,
    })
}

// a title that fell back to the URL earns no title bonus
fn raw_title_for_score<'a>(title: &'a str, url: &str) -> &'a str {
    if title == url {
        ""
    } else {
        title
    }
}

fn by_score_desc(a: &SourceLink, b: &SourceLink) -> Ordering {
    b.quality_score
        .partial_cmp(&a.quality_score)
        .unwrap_or(Ordering::Equal)
}

/// Highest-scored source per domain, best first, at most `limit` entries
pub fn dedupe_by_domain(sources: Vec<SourceLink>, limit: usize) -> Vec<SourceLink> {
    let mut sorted = sources;
    sorted.sort_by(by_score_desc);

    let mut seen = HashSet::new();
    let mut picked = Vec::new();
    for source in sorted {
        if picked.len() >= limit {
            break;
        }
        if seen.insert(source.domain.clone()) {
            picked.push(source);
        }
    }
    picked
}

/// Adds bonuses earned after enrichment, capped at 1.0
pub fn rescore_with_content(mut source: SourceLink) -> SourceLink {
    let length = (source.content_len() as f64 / FULL_CONTENT_CHARS).min(1.0) * 0.4;
    let snippet = if source.snippet.is_some() { 0.1 } else { 0.0 };
    let trusted = if is_trusted_domain(&source.domain) { 0.2 } else { 0.0 };
    let https = if source.url.starts_with("https://") { 0.1 } else { 0.0 };

    let total = (source.quality_score + length + snippet + trusted + https).min(1.0);
    source.quality_score = round_to(total, 3);
    source
}

/// Rescores enriched sources, orders them best first and keeps `limit`
pub fn rank_enriched(sources: Vec<SourceLink>, limit: usize) -> Vec<SourceLink> {
    let mut ranked: Vec<SourceLink> = sources.into_iter().map(rescore_with_content).collect();
    ranked.sort_by(by_score_desc);
    ranked.truncate(limit);
    ranked
}
