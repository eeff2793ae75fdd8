//! Research pipeline: lookup, enrichment, ranking and synthesis for one task
//!
//! The provider chain and the optional browser session run concurrently.
//! Sources are deduplicated by domain, enriched with page text, rescored,
//! cut to the per-task cap and then synthesized.

pub mod browser;
pub mod enrich;
pub mod providers;
pub mod sources;
pub mod synthesis;

use anyhow::Result;
use async_trait::async_trait;
use signalforge_sdk::{ResearchArtifacts, ResearchMode, ResearchResult, ResearchTask, Researcher};
use tracing::{info, warn};

use crate::config::Config;
use browser::{BrowserSession, BrowserbaseSession};
use enrich::ContentFetcher;
use providers::ProviderChain;
use synthesis::GenerativeClient;

pub struct PipelineResearcher {
    chain: ProviderChain,
    browser: Option<Box<dyn BrowserSession>>,
    fetcher: ContentFetcher,
    generative: Option<GenerativeClient>,
    max_sources: usize,
}

impl PipelineResearcher {
    pub fn new(
        chain: ProviderChain,
        browser: Option<Box<dyn BrowserSession>>,
        fetcher: ContentFetcher,
        generative: Option<GenerativeClient>,
        max_sources: usize,
    ) -> Self {
        Self {
            chain,
            browser,
            fetcher,
            generative,
            max_sources: max_sources.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let browser = BrowserbaseSession::from_config(
            &config.browserbase,
            &config.endpoints.browserbase,
            &config.findings_dir,
        )?
        .map(|b| Box::new(b) as Box<dyn BrowserSession>);
        let generative =
            GenerativeClient::from_config(&config.generative, &config.endpoints.generative)?;

        Ok(Self::new(
            ProviderChain::from_config(config)?,
            browser,
            ContentFetcher::with_default_client()?,
            generative,
            config.max_sources_per_task,
        ))
    }

    fn candidate_pool(&self) -> usize {
        self.max_sources.saturating_mul(2)
    }
}

#[async_trait]
impl Researcher for PipelineResearcher {
    async fn research(&self, task: &ResearchTask) -> Result<ResearchResult> {
        let lookup = async {
            let mut found = self.chain.lookup(&task.query).await;
            found.truncate(self.candidate_pool());
            found
        };
        let session = async {
            match &self.browser {
                Some(browser) => Some(browser.capture(task, self.max_sources).await),
                None => None,
            }
        };
        let (fallback_sources, session) = tokio::join!(lookup, session);

        let mut mode = ResearchMode::Fallback;
        let mut artifacts = ResearchArtifacts::default();
        let mut warning = None;
        let mut candidates = fallback_sources;

        match session {
            Some(Ok(capture)) => {
                if !capture.sources.is_empty() {
                    candidates = capture.sources;
                    mode = ResearchMode::Browser;
                }
                artifacts = capture.artifacts;
            }
            Some(Err(e)) => {
                let message = format!(
                    "Browser session research failed, fell back to HTTP providers: {e:#}"
                );
                warn!(query = %task.query, error = %format!("{e:#}"), "Browser session failed");
                warning = Some(message);
            }
            None => {}
        }

        let unique = sources::dedupe_by_domain(candidates, self.max_sources);
        let enriched = self.fetcher.enrich(unique).await;
        let selected = sources::rank_enriched(enriched, self.max_sources);

        let synthesis = synthesis::synthesize(
            self.generative.as_ref(),
            task,
            mode,
            &selected,
            warning.as_deref(),
        )
        .await;

        info!(
            query = %task.query,
            mode = mode.as_str(),
            sources = selected.len(),
            strategy = synthesis.strategy(),
            confidence = synthesis.confidence(),
            "Research complete"
        );

        Ok(ResearchResult {
            mode,
            citations: synthesis::citations(&selected),
            synthesis,
            sources: selected,
            artifacts,
            warning,
        })
    }
}
