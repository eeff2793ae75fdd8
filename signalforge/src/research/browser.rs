//! Remote browser session research
//!
//! A Browserbase session is created over REST, then driven with raw Chrome
//! DevTools Protocol messages over its WebSocket: open a page, load the
//! search results, read the result anchors and save a screenshot.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use signalforge_sdk::{ResearchArtifacts, ResearchTask, SourceLink};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::providers::http_client;
use super::sources::{normalize, RawHit};
use crate::config::BrowserbaseConfig;
use crate::utils::slugify;

const REST_TIMEOUT: Duration = Duration::from_secs(30);
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(45);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Let client-side rendering of the result list settle
const SETTLE_DELAY: Duration = Duration::from_secs(2);
const SEARCH_PAGE: &str = "https://duckduckgo.com/";

/// What a browser session found for one task
#[derive(Debug, Clone, Default)]
pub struct BrowserCapture {
    pub sources: Vec<SourceLink>,
    pub artifacts: ResearchArtifacts,
}

/// Preferred lookup strategy that runs alongside the provider chain
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn capture(&self, task: &ResearchTask, limit: usize) -> Result<BrowserCapture>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionCreated {
    id: String,
    connect_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDebug {
    debugger_fullscreen_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultAnchor {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
}

pub struct BrowserbaseSession {
    client: Client,
    base_url: String,
    api_key: String,
    project_id: String,
    context_id: Option<String>,
    assets_dir: PathBuf,
}

impl BrowserbaseSession {
    /// `None` unless both the API key and project id are set
    pub fn from_config(
        config: &BrowserbaseConfig,
        base_url: &str,
        findings_dir: &std::path::Path,
    ) -> Result<Option<Self>> {
        let (Some(api_key), Some(project_id)) = (&config.api_key, &config.project_id) else {
            return Ok(None);
        };
        Ok(Some(Self {
            client: http_client(REST_TIMEOUT)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.clone(),
            project_id: project_id.clone(),
            context_id: config.context_id.clone(),
            assets_dir: findings_dir.join("assets"),
        }))
    }

    async fn create_session(&self) -> Result<SessionCreated> {
        let mut body = json!({ "projectId": self.project_id });
        if let Some(context_id) = &self.context_id {
            body["browserSettings"] = json!({ "context": { "id": context_id, "persist": true } });
        }

        let response = self
            .client
            .post(format!("{}/v1/sessions", self.base_url))
            .header("X-BB-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to create browser session")?;
        if !response.status().is_success() {
            bail!("browser session create returned {}", response.status());
        }
        response.json().await.context("Unexpected session create response")
    }

    async fn debug_urls(&self, session_id: &str) -> SessionDebug {
        let response = self
            .client
            .get(format!("{}/v1/sessions/{}/debug", self.base_url, session_id))
            .header("X-BB-API-Key", &self.api_key)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => r.json().await.unwrap_or_default(),
            _ => SessionDebug::default(),
        }
    }
}

#[async_trait]
impl BrowserSession for BrowserbaseSession {
    async fn capture(&self, task: &ResearchTask, limit: usize) -> Result<BrowserCapture> {
        let session = self.create_session().await?;
        info!(session_id = %session.id, query = %task.query, "Started browser session");
        let live = self.debug_urls(&session.id).await;

        let mut cdp = CdpConnection::connect(&session.connect_url).await?;
        let target = cdp
            .call("Target.createTarget", json!({ "url": "about:blank" }), None)
            .await?;
        let target_id = target["targetId"]
            .as_str()
            .ok_or_else(|| anyhow!("createTarget returned no targetId"))?
            .to_string();
        let attached = cdp
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let page = attached["sessionId"]
            .as_str()
            .ok_or_else(|| anyhow!("attachToTarget returned no sessionId"))?
            .to_string();

        let search_url = url::Url::parse_with_params(SEARCH_PAGE, &[("q", task.query.as_str())])?;
        cdp.call("Page.enable", json!({}), Some(&page)).await?;
        cdp.call("Page.navigate", json!({ "url": search_url.as_str() }), Some(&page))
            .await?;
        cdp.wait_for_event("Page.domContentEventFired", &page, NAVIGATION_TIMEOUT)
            .await?;
        tokio::time::sleep(SETTLE_DELAY).await;

        let expression = format!(
            r#"Array.from(document.querySelectorAll('a[data-testid="result-title-a"]')).slice(0, {limit}).map((el) => ({{ title: (el.textContent || '').trim(), url: el.href }}))"#
        );
        let evaluated = cdp
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
                Some(&page),
            )
            .await?;
        let anchors: Vec<ResultAnchor> =
            serde_json::from_value(evaluated["result"]["value"].clone()).unwrap_or_default();
        let sources: Vec<SourceLink> = anchors
            .into_iter()
            .filter_map(|a| {
                normalize(RawHit {
                    title: Some(a.title),
                    url: a.url,
                    snippet: None,
                })
            })
            .collect();

        let shot = cdp
            .call(
                "Page.captureScreenshot",
                json!({ "format": "png", "captureBeyondViewport": true }),
                Some(&page),
            )
            .await?;
        let png = base64::engine::general_purpose::STANDARD
            .decode(shot["data"].as_str().unwrap_or_default())
            .context("Screenshot is not valid base64")?;
        tokio::fs::create_dir_all(&self.assets_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.assets_dir.display()))?;
        let screenshot = self
            .assets_dir
            .join(format!("{}-search.png", slugify(&task.query, 60)));
        tokio::fs::write(&screenshot, png)
            .await
            .with_context(|| format!("Failed to write {}", screenshot.display()))?;

        // best effort; the session ends with the socket either way
        let _ = cdp
            .call("Target.closeTarget", json!({ "targetId": target_id }), None)
            .await;
        cdp.close().await;

        debug!(session_id = %session.id, count = sources.len(), "Browser session finished");
        Ok(BrowserCapture {
            sources,
            artifacts: ResearchArtifacts {
                replay_url: Some(format!("https://www.browserbase.com/sessions/{}", session.id)),
                replay_hint: Some(format!(
                    "Recording available via Browserbase session {}",
                    session.id
                )),
                live_view_url: live.debugger_fullscreen_url,
                screenshots: vec![screenshot.display().to_string()],
                session_id: Some(session.id),
            },
        })
    }
}

/// Minimal DevTools Protocol client over one WebSocket
struct CdpConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    /// Events received while waiting for command responses
    pending_events: VecDeque<Value>,
}

impl CdpConnection {
    async fn connect(url: &str) -> Result<Self> {
        let (socket, _) = connect_async(url)
            .await
            .context("Failed to connect to browser DevTools endpoint")?;
        Ok(Self {
            socket,
            next_id: 0,
            pending_events: VecDeque::new(),
        })
    }

    async fn next_message(&mut self) -> Result<Value> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).context("Malformed DevTools message");
                }
                Some(Ok(Message::Close(_))) | None => bail!("DevTools connection closed"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("DevTools connection error"),
            }
        }
    }

    async fn call(&mut self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            message["sessionId"] = json!(session_id);
        }
        self.socket
            .send(Message::Text(message.to_string().into()))
            .await
            .with_context(|| format!("Failed to send {method}"))?;

        let wait = async {
            loop {
                let incoming = self.next_message().await?;
                if incoming.get("id").and_then(Value::as_u64) == Some(id) {
                    if let Some(error) = incoming.get("error") {
                        bail!("{method} failed: {error}");
                    }
                    return Ok::<Value, anyhow::Error>(
                        incoming.get("result").cloned().unwrap_or(Value::Null),
                    );
                }
                if incoming.get("method").is_some() {
                    self.pending_events.push_back(incoming);
                }
            }
        };
        tokio::time::timeout(COMMAND_TIMEOUT, wait)
            .await
            .map_err(|_| anyhow!("{method} timed out"))?
    }

    async fn wait_for_event(&mut self, method: &str, session_id: &str, limit: Duration) -> Result<Value> {
        let matches = |event: &Value| {
            event.get("method").and_then(Value::as_str) == Some(method)
                && event.get("sessionId").and_then(Value::as_str) == Some(session_id)
        };
        if let Some(pos) = self.pending_events.iter().position(matches) {
            if let Some(event) = self.pending_events.remove(pos) {
                return Ok(event);
            }
        }

        let wait = async {
            loop {
                let incoming = self.next_message().await?;
                if matches(&incoming) {
                    return Ok::<Value, anyhow::Error>(incoming);
                }
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| anyhow!("timed out waiting for {method}"))?
    }

    async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}
