//! Page text enrichment for selected sources

use anyhow::{bail, Result};
use chrono::Utc;
use futures::future::join_all;
use regex::Regex;
use reqwest::Client;
use signalforge_sdk::SourceLink;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use super::providers::http_client;

pub const ENRICH_TIMEOUT: Duration = Duration::from_secs(12);

/// Maximum characters of page text kept per source
pub const MAX_CONTENT_CHARS: usize = 6000;

pub struct ContentFetcher {
    client: Client,
}

impl ContentFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn with_default_client() -> Result<Self> {
        Ok(Self::new(http_client(ENRICH_TIMEOUT)?))
    }

    /// Fetches every source concurrently. A failed fetch leaves that source without content.
    pub async fn enrich(&self, sources: Vec<SourceLink>) -> Vec<SourceLink> {
        let fetches = sources.into_iter().map(|mut source| async move {
            let text = match self.fetch_text(&source.url).await {
                Ok(text) => text,
                Err(e) => {
                    debug!(url = %source.url, error = %e, "Enrichment fetch failed");
                    String::new()
                }
            };
            source.content = (!text.is_empty()).then_some(text);
            source.fetched_at = Some(Utc::now());
            source
        });
        join_all(fetches).await
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            bail!("status {}", response.status());
        }
        let html = response.text().await?;
        Ok(clean_html(&html))
    }
}

fn block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<noscript\b.*?</noscript>")
            .expect("block regex must compile")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("tag regex must compile"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex must compile"))
}

/// Visible text of an HTML page, whitespace-collapsed and truncated
pub fn clean_html(html: &str) -> String {
    let text = block_re().replace_all(html, " ");
    let text = tag_re().replace_all(&text, " ");
    let text = text.replace("&nbsp;", " ").replace("&amp;", "&");
    let text = whitespace_re().replace_all(&text, " ");
    text.trim().chars().take(MAX_CONTENT_CHARS).collect()
}
