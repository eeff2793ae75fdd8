//! The research pipeline end to end against mocked services

use super::common::*;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use signalforge::config::Config;
use signalforge::research::browser::{BrowserCapture, BrowserSession};
use signalforge::research::enrich::ContentFetcher;
use signalforge::research::providers::{http_client, BingRssProvider, ProviderChain};
use signalforge::research::sources::{normalize, RawHit};
use signalforge::research::synthesis::GenerativeClient;
use signalforge::research::PipelineResearcher;
use signalforge::runner::{RunMode, Runner, RunnerDeps};
use signalforge_sdk::{ResearchArtifacts, ResearchMode, ResearchTask, Researcher, SourceLink};
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BROWSER_SESSION: &str = "sess-fake-1";

/// Stands in for a remote browser with a fixed outcome
enum FakeBrowser {
    Found(Vec<SourceLink>),
    Empty,
    Broken(&'static str),
}

fn session_artifacts() -> ResearchArtifacts {
    ResearchArtifacts {
        session_id: Some(BROWSER_SESSION.to_string()),
        live_view_url: Some(format!("https://live.example/{BROWSER_SESSION}")),
        replay_url: Some(format!("https://www.browserbase.com/sessions/{BROWSER_SESSION}")),
        replay_hint: None,
        screenshots: vec!["assets/vector-database-comparison-search.png".to_string()],
    }
}

#[async_trait]
impl BrowserSession for FakeBrowser {
    async fn capture(&self, _task: &ResearchTask, _limit: usize) -> Result<BrowserCapture> {
        match self {
            FakeBrowser::Found(sources) => Ok(BrowserCapture {
                sources: sources.clone(),
                artifacts: session_artifacts(),
            }),
            FakeBrowser::Empty => Ok(BrowserCapture {
                sources: Vec::new(),
                artifacts: session_artifacts(),
            }),
            FakeBrowser::Broken(reason) => bail!("{reason}"),
        }
    }
}

fn build_researcher(
    server: &MockServer,
    browser: Option<FakeBrowser>,
    generative: Option<GenerativeClient>,
    max_sources: usize,
) -> PipelineResearcher {
    let client = http_client(Duration::from_secs(5)).unwrap();
    PipelineResearcher::new(
        ProviderChain::new(vec![Box::new(BingRssProvider::new(client.clone(), server.uri()))]),
        browser.map(|b| Box::new(b) as Box<dyn BrowserSession>),
        ContentFetcher::new(client),
        generative,
        max_sources,
    )
}

fn researcher(server: &MockServer, generative: Option<GenerativeClient>) -> PipelineResearcher {
    build_researcher(server, None, generative, 5)
}

/// Same mock server reached through `localhost`, so it counts as another domain
fn localhost_url(server: &MockServer, page: &str) -> String {
    format!("http://localhost:{}{page}", server.address().port())
}

async fn mount_page(server: &MockServer, page: &str, body: &str, expected_hits: Option<u64>) {
    let mock = Mock::given(method("GET")).and(path(page)).respond_with(
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/html")
            .set_body_string(format!("<html><body><p>{body}.</p></body></html>")),
    );
    match expected_hits {
        Some(hits) => mock.expect(hits).mount(server).await,
        None => mock.mount(server).await,
    }
}

fn generative(server: &MockServer) -> GenerativeClient {
    GenerativeClient::new(
        http_client(Duration::from_secs(5)).unwrap(),
        server.uri(),
        "gen-key",
        "gpt-oss-120b",
    )
}

async fn mount_completion(server: &MockServer, content: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer gen-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": content.to_string() } }]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_heuristic_pipeline_enriches_and_cites() {
    let server = MockServer::start().await;
    mount_bing_with_article(&server).await;

    let result = researcher(&server, None)
        .research(&task("vector database comparison"))
        .await
        .unwrap();

    assert_eq!(result.mode, ResearchMode::Fallback);
    assert_eq!(result.synthesis.strategy(), "heuristic");
    assert_eq!(result.sources.len(), 1);
    let source = &result.sources[0];
    assert!(source.content.as_deref().is_some_and(|c| c.contains(ARTICLE_SENTENCE)));
    assert!(source.fetched_at.is_some());
    assert_eq!(result.synthesis.insights(), [format!("{ARTICLE_SENTENCE} [1]")]);
    assert_eq!(result.citations.len(), 1);
    assert!(result.citations[0].starts_with("[1] Vector database comparison guide - "));
    assert!(result.warning.is_none());
}

#[tokio::test]
async fn test_no_sources_gives_low_confidence_notice() {
    let server = MockServer::start().await;
    mount_bing_failure(&server).await;
    // never consulted without sources
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let result = researcher(&server, Some(generative(&server)))
        .research(&task("obscure topic"))
        .await
        .unwrap();

    assert!(result.sources.is_empty());
    assert_eq!(result.synthesis.strategy(), "heuristic");
    assert!(result.synthesis.confidence() <= 0.2);
    assert_eq!(result.synthesis.insights().len(), 1);
    assert!(result.synthesis.insights()[0].contains("No usable sources were found"));
}

#[tokio::test]
async fn test_valid_generative_output_is_used() {
    let server = MockServer::start().await;
    mount_bing_with_article(&server).await;
    mount_completion(
        &server,
        json!({
            "summary": "Vector stores trade recall for latency.",
            "insights": ["HNSW dominates for in-memory search [1]"],
            "openQuestions": ["Which index fits our corpus size?"],
            "confidence": 0.876,
            "confidenceReasons": ["Single detailed source"]
        }),
    )
    .await;

    let result = researcher(&server, Some(generative(&server)))
        .research(&task("vector database comparison"))
        .await
        .unwrap();

    assert_eq!(result.synthesis.strategy(), "generative");
    assert_eq!(result.synthesis.summary(), "Vector stores trade recall for latency.");
    assert_eq!(result.synthesis.confidence(), 0.88);
    assert_eq!(
        result.synthesis.open_questions(),
        ["Which index fits our corpus size?".to_string()]
    );
}

#[tokio::test]
async fn test_malformed_generative_output_falls_back() {
    let server = MockServer::start().await;
    mount_bing_with_article(&server).await;
    mount_completion(
        &server,
        json!({
            "summary": "Looks fine",
            "insights": ["one [1]"],
            "openQuestions": [],
            "confidence": 3,
            "confidenceReasons": ["made up"]
        }),
    )
    .await;

    let result = researcher(&server, Some(generative(&server)))
        .research(&task("vector database comparison"))
        .await
        .unwrap();

    assert_eq!(result.synthesis.strategy(), "heuristic");
    assert_eq!(result.synthesis.insights(), [format!("{ARTICLE_SENTENCE} [1]")]);
}

#[tokio::test]
async fn test_cycle_from_note_to_finding() {
    let server = MockServer::start().await;
    mount_bing_with_article(&server).await;

    let vault = tempfile::tempdir().unwrap();
    std::fs::write(
        vault.path().join("Review.md"),
        "Weekly review\n#investigate vector database comparison\n",
    )
    .unwrap();
    let mut config = Config::for_vault(vault.path());
    config.endpoints.bing = server.uri();

    let runner = Runner::new(config.clone(), RunnerDeps::from_config(&config).unwrap());
    let report = runner.run_once(RunMode::Standard).await.unwrap();
    assert_eq!(report.stats.succeeded, 1);

    let finding = std::fs::read_to_string(&report.findings[0].path).unwrap();
    assert!(finding.contains("# SignalForge Finding: vector database comparison"));
    assert!(finding.contains("mode: fallback"));
    assert!(finding.contains("- [Vector database comparison guide]("));
    assert!(finding.contains(ARTICLE_SENTENCE));
    assert!(finding.contains("- Browser session: N/A"));

    let note = std::fs::read_to_string(vault.path().join("Review.md")).unwrap();
    assert!(note.contains("## SignalForge Findings\n- "));
}

#[tokio::test]
async fn test_browser_sources_replace_provider_results() {
    let server = MockServer::start().await;
    mount_bing_with_article(&server).await;
    mount_page(&server, "/articles/browser", "Captured in a remote browser session", None).await;
    let found = normalize(RawHit {
        title: Some("Browser picked comparison".to_string()),
        url: localhost_url(&server, "/articles/browser"),
        snippet: None,
    })
    .unwrap();

    let result = build_researcher(&server, Some(FakeBrowser::Found(vec![found])), None, 5)
        .research(&task("vector database comparison"))
        .await
        .unwrap();

    assert_eq!(result.mode, ResearchMode::Browser);
    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].domain, "localhost");
    assert!(result.sources[0]
        .content
        .as_deref()
        .is_some_and(|c| c.contains("Captured in a remote browser session")));
    assert_eq!(result.artifacts.session_id.as_deref(), Some(BROWSER_SESSION));
    assert_eq!(result.artifacts.screenshots.len(), 1);
    assert!(result.warning.is_none());
}

#[tokio::test]
async fn test_empty_browser_capture_keeps_provider_results() {
    let server = MockServer::start().await;
    mount_bing_with_article(&server).await;

    let result = build_researcher(&server, Some(FakeBrowser::Empty), None, 5)
        .research(&task("vector database comparison"))
        .await
        .unwrap();

    assert_eq!(result.mode, ResearchMode::Fallback);
    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].title, "Vector database comparison guide");
    // the session still ran, so its artifacts are reported
    assert_eq!(result.artifacts.session_id.as_deref(), Some(BROWSER_SESSION));
    assert!(result.warning.is_none());
}

#[tokio::test]
async fn test_failed_browser_session_falls_back_with_warning() {
    let server = MockServer::start().await;
    mount_bing_with_article(&server).await;

    let result = build_researcher(
        &server,
        Some(FakeBrowser::Broken("session quota exhausted")),
        None,
        5,
    )
    .research(&task("vector database comparison"))
    .await
    .unwrap();

    assert_eq!(result.mode, ResearchMode::Fallback);
    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].title, "Vector database comparison guide");
    assert!(result.artifacts.session_id.is_none());
    let warning = result.warning.as_deref().unwrap();
    assert!(warning.starts_with("Browser session research failed"));
    assert!(result.synthesis.summary().ends_with(
        "Warning: Browser session research failed, fell back to HTTP providers: session quota exhausted"
    ));
}

#[tokio::test]
async fn test_only_capped_sources_are_fetched() {
    let server = MockServer::start().await;
    let primary = format!("{}/articles/vector", server.uri());
    let secondary = localhost_url(&server, "/articles/other");
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("format", "rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[
            ("Vector database comparison guide", primary.as_str(), "Choosing a vector store"),
            ("Other", secondary.as_str(), "Short"),
        ])))
        .mount(&server)
        .await;
    mount_page(&server, "/articles/vector", ARTICLE_SENTENCE, None).await;
    // ranked below the cap, so never enriched
    mount_page(&server, "/articles/other", "Not needed", Some(0)).await;

    let result = build_researcher(&server, None, None, 1)
        .research(&task("vector database comparison"))
        .await
        .unwrap();

    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].url, primary);
    server.verify().await;
}
