//! Search providers and the fallback chain over HTTP

use super::common::*;
use serde_json::json;
use signalforge::research::providers::{
    http_client, BingRssProvider, ProviderChain, SearchProvider, SerpApiProvider, TavilyProvider,
};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> reqwest::Client {
    http_client(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_serpapi_maps_organic_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search.json"))
        .and(query_param("q", "letta code"))
        .and(query_param("api_key", "serp-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "organic_results": [
                { "title": "Letta on GitHub", "link": "https://github.com/letta-ai/letta", "snippet": "Stateful agents" },
                { "title": "No link" },
                { "title": "Blog", "link": "https://letta.com/blog", "snippet": null }
            ]
        })))
        .mount(&server)
        .await;

    let provider = SerpApiProvider::new(client(), server.uri(), "serp-key");
    let sources = provider.lookup("letta code").await;

    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].domain, "github.com");
    assert_eq!(sources[0].snippet.as_deref(), Some("Stateful agents"));
    assert_eq!(sources[1].domain, "letta.com");
    // trusted domain bonus
    assert!(sources[0].quality_score > sources[1].quality_score);
}

#[tokio::test]
async fn test_tavily_posts_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(body_partial_json(json!({ "api_key": "tv-key", "query": "crdt sync" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "title": "CRDTs explained", "url": "https://crdt.tech/", "content": "Conflict-free replicated data types" }
            ]
        })))
        .mount(&server)
        .await;

    let provider = TavilyProvider::new(client(), server.uri(), "tv-key");
    let sources = provider.lookup("crdt sync").await;

    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].title, "CRDTs explained");
    assert_eq!(
        sources[0].snippet.as_deref(),
        Some("Conflict-free replicated data types")
    );
}

#[tokio::test]
async fn test_failures_are_empty_results() {
    let server = MockServer::start().await;
    mount_bing_failure(&server).await;
    Mock::given(method("GET"))
        .and(path("/search.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let bing = BingRssProvider::new(client(), server.uri());
    assert!(bing.lookup("anything").await.is_empty());

    let serp = SerpApiProvider::new(client(), server.uri(), "key");
    assert!(serp.lookup("anything").await.is_empty());
}

#[tokio::test]
async fn test_chain_falls_through_to_bing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "organic_results": [] })))
        .mount(&server)
        .await;
    mount_bing_with_article(&server).await;

    let chain = ProviderChain::new(vec![
        Box::new(SerpApiProvider::new(client(), server.uri(), "key")),
        Box::new(BingRssProvider::new(client(), server.uri())),
    ]);
    assert_eq!(chain.names(), vec!["serpapi", "bing_rss"]);

    let sources = chain.lookup("vector database comparison").await;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].title, "Vector database comparison guide");
    assert_eq!(sources[0].snippet.as_deref(), Some("Choosing a vector store"));
}
