//! Mock HTTP services for research tests

use signalforge_sdk::{ResearchTask, TaskReason};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ARTICLE_SENTENCE: &str =
    "Vector databases index embeddings so that similarity search stays fast on large corpora";

pub fn task(query: &str) -> ResearchTask {
    ResearchTask {
        query: query.to_string(),
        source_id: "Review.md".to_string(),
        reason: TaskReason::Explicit,
        snippet: format!("#investigate {query}"),
    }
}

/// Bing-style RSS listing `(title, url, description)` items
pub fn rss(items: &[(&str, &str, &str)]) -> String {
    let body: String = items
        .iter()
        .map(|(title, link, description)| {
            format!(
                "<item><title>{title}</title><link>{link}</link><description><![CDATA[{description}]]></description></item>"
            )
        })
        .collect();
    format!("<?xml version=\"1.0\"?><rss><channel>{body}</channel></rss>")
}

pub fn article_html() -> String {
    format!(
        "<html><head><script>var ignored = 1;</script></head><body><p>{ARTICLE_SENTENCE}. Pick one by workload.</p></body></html>"
    )
}

/// Bing feed pointing at one article hosted on the same server
pub async fn mount_bing_with_article(server: &MockServer) {
    let article = format!("{}/articles/vector", server.uri());
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("format", "rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[(
            "Vector database comparison guide",
            article.as_str(),
            "Choosing a vector store",
        )])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/articles/vector"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(article_html()),
        )
        .mount(server)
        .await;
}

pub async fn mount_bing_failure(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(500))
        .mount(server)
        .await;
}
