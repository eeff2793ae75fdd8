//! Search providers and the ordered fallback chain
//!
//! Every provider fails soft: transport errors, timeouts, non-success
//! statuses and unparseable bodies all come back as an empty list.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use signalforge_sdk::SourceLink;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

use super::sources::{normalize, RawHit};
use crate::config::Config;

pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client shared by the providers
pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(BROWSER_USER_AGENT)
        .build()
        .context("Failed to build HTTP client")
}

/// One lookup strategy in the fallback chain
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Normalized hits for `query`; empty on any failure
    async fn lookup(&self, query: &str) -> Vec<SourceLink>;
}

fn normalize_all(hits: Vec<RawHit>) -> Vec<SourceLink> {
    hits.into_iter().filter_map(normalize).collect()
}

/// Google results through SerpAPI
pub struct SerpApiProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SerpApiResponse {
    #[serde(default)]
    organic_results: Vec<SerpApiHit>,
}

#[derive(Debug, Deserialize)]
struct SerpApiHit {
    title: Option<String>,
    link: Option<String>,
    snippet: Option<String>,
}

impl SerpApiProvider {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    async fn try_lookup(&self, query: &str) -> Result<Vec<RawHit>> {
        let url = format!("{}/search.json", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[
                ("engine", "google"),
                ("q", query),
                ("num", "10"),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("status {}", response.status());
        }

        let data: SerpApiResponse = response.json().await?;
        Ok(data
            .organic_results
            .into_iter()
            .map(|hit| RawHit {
                title: hit.title,
                url: hit.link.unwrap_or_default(),
                snippet: hit.snippet,
            })
            .collect())
    }
}

#[async_trait]
impl SearchProvider for SerpApiProvider {
    fn name(&self) -> &'static str {
        "serpapi"
    }

    async fn lookup(&self, query: &str) -> Vec<SourceLink> {
        match self.try_lookup(query).await {
            Ok(hits) => normalize_all(hits),
            Err(e) => {
                debug!(provider = self.name(), error = %e, "Provider lookup failed");
                Vec::new()
            }
        }
    }
}

/// Tavily search API
pub struct TavilyProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyHit>,
}

#[derive(Debug, Deserialize)]
struct TavilyHit {
    title: Option<String>,
    url: Option<String>,
    content: Option<String>,
}

impl TavilyProvider {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    async fn try_lookup(&self, query: &str) -> Result<Vec<RawHit>> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "api_key": self.api_key,
                "query": query,
                "max_results": 8,
                "include_raw_content": false,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("status {}", response.status());
        }

        let data: TavilyResponse = response.json().await?;
        Ok(data
            .results
            .into_iter()
            .map(|hit| RawHit {
                title: hit.title,
                url: hit.url.unwrap_or_default(),
                snippet: hit.content,
            })
            .collect())
    }
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    fn name(&self) -> &'static str {
        "tavily"
    }

    async fn lookup(&self, query: &str) -> Vec<SourceLink> {
        match self.try_lookup(query).await {
            Ok(hits) => normalize_all(hits),
            Err(e) => {
                debug!(provider = self.name(), error = %e, "Provider lookup failed");
                Vec::new()
            }
        }
    }
}

/// Unauthenticated Bing RSS feed, always available
pub struct BingRssProvider {
    client: Client,
    base_url: String,
}

impl BingRssProvider {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn try_lookup(&self, query: &str) -> Result<Vec<RawHit>> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("q", query), ("format", "rss")])
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("status {}", response.status());
        }

        let xml = response.text().await?;
        Ok(parse_rss_items(&xml))
    }
}

#[async_trait]
impl SearchProvider for BingRssProvider {
    fn name(&self) -> &'static str {
        "bing_rss"
    }

    async fn lookup(&self, query: &str) -> Vec<SourceLink> {
        match self.try_lookup(query).await {
            Ok(hits) => normalize_all(hits),
            Err(e) => {
                debug!(provider = self.name(), error = %e, "Provider lookup failed");
                Vec::new()
            }
        }
    }
}

fn item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<item>(.*?)</item>").expect("item regex must compile"))
}

fn field_re(tag: &'static str) -> Regex {
    Regex::new(&format!(r"(?is)<{tag}>(.*?)</{tag}>")).expect("field regex must compile")
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| field_re("title"))
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| field_re("link"))
}

fn description_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| field_re("description"))
}

fn strip_cdata(value: &str) -> String {
    value
        .replacen("<![CDATA[", "", 1)
        .replacen("]]>", "", 1)
        .trim()
        .to_string()
}

/// Extracts `<item>` title/link/description triples; items without a title or link are dropped
pub fn parse_rss_items(xml: &str) -> Vec<RawHit> {
    item_re()
        .captures_iter(xml)
        .filter_map(|item| {
            let chunk = item.get(1)?.as_str();
            let title = title_re().captures(chunk)?.get(1)?.as_str();
            let link = link_re().captures(chunk)?.get(1)?.as_str();
            let description = description_re()
                .captures(chunk)
                .and_then(|c| c.get(1))
                .map(|m| strip_cdata(m.as_str()));
            Some(RawHit {
                title: Some(strip_cdata(title)),
                url: strip_cdata(link),
                snippet: description,
            })
        })
        .collect()
}

/// Ordered providers; the first non-empty result wins and results are never merged
pub struct ProviderChain {
    providers: Vec<Box<dyn SearchProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Box<dyn SearchProvider>>) -> Self {
        Self { providers }
    }

    /// SerpAPI and Tavily when keyed, then the Bing feed
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = http_client(PROVIDER_TIMEOUT)?;
        let mut providers: Vec<Box<dyn SearchProvider>> = Vec::new();

        if let Some(key) = &config.providers.serpapi_api_key {
            providers.push(Box::new(SerpApiProvider::new(
                client.clone(),
                &config.endpoints.serpapi,
                key,
            )));
        }
        if let Some(key) = &config.providers.tavily_api_key {
            providers.push(Box::new(TavilyProvider::new(
                client.clone(),
                &config.endpoints.tavily,
                key,
            )));
        }
        providers.push(Box::new(BingRssProvider::new(client, &config.endpoints.bing)));

        Ok(Self::new(providers))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub async fn lookup(&self, query: &str) -> Vec<SourceLink> {
        for provider in &self.providers {
            let sources = provider.lookup(query).await;
            if !sources.is_empty() {
                info!(provider = provider.name(), count = sources.len(), query, "Provider returned sources");
                return sources;
            }
            debug!(provider = provider.name(), query, "Provider returned nothing, trying next");
        }
        Vec::new()
    }
}
