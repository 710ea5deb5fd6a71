//! JSON-over-HTTP collaborator.
//!
//! One endpoint serves retrieval, ranking, generation, guardrails and tools.
//! HTTP statuses and transport failures are mapped onto [`FaultKind`] so the
//! retry executor can decide what to repeat.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{CallResult, Generator, Guardrail, Ranker, Retriever, ToolAdapter};
use crate::config::HttpConfig;
use crate::error::{CollaboratorError, FaultKind};
use crate::types::{Document, ToolCall, ToolOutcome, ToolSpec, Verdict};

/// Request paths, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpPaths {
    pub retrieve: String,
    pub rerank: String,
    pub enhance: String,
    pub select_tools: String,
    pub answer: String,
    pub pre_check: String,
    pub post_check: String,
    pub tools: String,
    pub invoke: String,
}

impl Default for HttpPaths {
    fn default() -> Self {
        Self {
            retrieve: "/retrieve".into(),
            rerank: "/rerank".into(),
            enhance: "/enhance".into(),
            select_tools: "/tools/select".into(),
            answer: "/answer".into(),
            pre_check: "/guardrail/input".into(),
            post_check: "/guardrail/output".into(),
            tools: "/tools".into(),
            invoke: "/tools/invoke".into(),
        }
    }
}

#[derive(Deserialize)]
struct DocumentsResponse {
    documents: Vec<Document>,
}

#[derive(Deserialize)]
struct TextResponse {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct CallsResponse {
    #[serde(default)]
    calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct CatalogResponse {
    tools: Vec<ToolSpec>,
}

#[derive(Deserialize)]
struct InvokeResponse {
    result: serde_json::Value,
}

/// Collaborator backed by a remote JSON API.
#[derive(Debug)]
pub struct HttpCollaborator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    paths: HttpPaths,
    catalog: RwLock<Vec<ToolSpec>>,
}

impl HttpCollaborator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> CallResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ragline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                CollaboratorError::new(
                    FaultKind::Configuration,
                    "http",
                    format!("failed to build HTTP client: {e}"),
                )
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            paths: HttpPaths::default(),
            catalog: RwLock::new(Vec::new()),
        })
    }

    /// Build from configuration, reading the API key from the named env var.
    pub fn from_config(config: &HttpConfig) -> CallResult<Self> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());
        Ok(Self::new(
            &config.base_url,
            api_key,
            Duration::from_secs(config.timeout_secs),
        )?
        .with_paths(config.paths.clone()))
    }

    pub fn with_paths(mut self, paths: HttpPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_catalog(self, tools: Vec<ToolSpec>) -> Self {
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = tools;
        self
    }

    /// Fetch the remote tool catalog. Returns the number of tools.
    pub async fn refresh_catalog(&self) -> CallResult<usize> {
        let response = self
            .authorize(self.client.get(self.url(&self.paths.tools)))
            .send()
            .await
            .map_err(|e| map_transport_error("tools", e))?;
        let catalog: CatalogResponse = decode("tools", response).await?;
        let count = catalog.tools.len();
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = catalog.tools;
        debug!(count, "Loaded remote tool catalog");
        Ok(count)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        collaborator: &str,
        path: &str,
        body: &B,
    ) -> CallResult<R> {
        let url = self.url(path);
        debug!(collaborator, url = %url, "HTTP collaborator request");
        let response = self
            .authorize(self.client.post(&url).json(body))
            .send()
            .await
            .map_err(|e| map_transport_error(collaborator, e))?;
        decode(collaborator, response).await
    }
}

async fn decode<R: DeserializeOwned>(collaborator: &str, response: reqwest::Response) -> CallResult<R> {
    let status = response.status();
    if !status.is_success() {
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        return Err(map_http_error(collaborator, status, &headers, &body));
    }
    response.json::<R>().await.map_err(|e| {
        CollaboratorError::new(
            FaultKind::MalformedInput,
            collaborator,
            format!("undecodable response body: {e}"),
        )
    })
}

/// Map a non-success HTTP status onto a fault.
pub fn map_http_error(
    collaborator: &str,
    status: reqwest::StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> CollaboratorError {
    let code = status.as_u16();
    let kind = match code {
        401 | 403 => FaultKind::PermissionDenied,
        408 => FaultKind::Timeout,
        425 | 429 => FaultKind::Throttled,
        409 => FaultKind::DataIntegrity,
        500..=599 => FaultKind::Unavailable,
        _ => FaultKind::MalformedInput,
    };
    let mut err = CollaboratorError::new(
        kind,
        collaborator,
        format!("HTTP {code}: {}", truncate(body, 200)),
    )
    .with_context("status", code.to_string());
    if matches!(code, 429 | 503) {
        if let Some(wait) = parse_retry_after(headers) {
            err = err.with_context("retry_after_ms", wait.as_millis().to_string());
        }
    }
    err
}

fn map_transport_error(collaborator: &str, err: reqwest::Error) -> CollaboratorError {
    let kind = if err.is_timeout() {
        FaultKind::Timeout
    } else if err.is_decode() || err.is_builder() {
        FaultKind::MalformedInput
    } else {
        FaultKind::Connection
    };
    // Strip the URL: it may carry credentials in its userinfo.
    CollaboratorError::new(kind, collaborator, err.without_url().to_string())
}

/// Parse a `Retry-After` header given in seconds (`"3"`, `"0.5s"`).
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    value
        .strip_suffix('s')
        .unwrap_or(value)
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl Retriever for HttpCollaborator {
    async fn retrieve(&self, query: &str, limit: usize) -> CallResult<Vec<Document>> {
        let body = json!({ "query": query, "limit": limit });
        let response: DocumentsResponse = self.post("retriever", &self.paths.retrieve, &body).await?;
        Ok(response.documents.into_iter().take(limit).collect())
    }
}

#[async_trait]
impl Ranker for HttpCollaborator {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[Document],
        top_n: usize,
    ) -> CallResult<Vec<Document>> {
        let body = json!({ "query": query, "documents": candidates, "top_n": top_n });
        let response: DocumentsResponse = self.post("ranker", &self.paths.rerank, &body).await?;
        Ok(response.documents.into_iter().take(top_n).collect())
    }
}

#[async_trait]
impl Generator for HttpCollaborator {
    async fn enhance(&self, question: &str, context: &[Document]) -> CallResult<String> {
        let body = json!({ "question": question, "context": context });
        let response: TextResponse = self.post("generator", &self.paths.enhance, &body).await?;
        Ok(response.text)
    }

    async fn select_tools(
        &self,
        question: &str,
        tools: &[ToolSpec],
        max_calls: usize,
    ) -> CallResult<Vec<ToolCall>> {
        let body = json!({ "question": question, "tools": tools, "max_calls": max_calls });
        let response: CallsResponse = self
            .post("generator", &self.paths.select_tools, &body)
            .await?;
        Ok(response.calls)
    }

    async fn answer(
        &self,
        question: &str,
        enhanced: &str,
        tools: &ToolOutcome,
    ) -> CallResult<String> {
        let body = json!({
            "question": question,
            "enhanced": enhanced,
            "memory": tools.memory,
            "data": tools.data,
        });
        let response: TextResponse = self.post("generator", &self.paths.answer, &body).await?;
        Ok(response.text)
    }
}

#[async_trait]
impl Guardrail for HttpCollaborator {
    async fn pre_check(&self, question: &str) -> CallResult<Verdict> {
        self.post("guardrail", &self.paths.pre_check, &json!({ "question": question }))
            .await
    }

    async fn post_check(
        &self,
        question: &str,
        answer: &str,
        tools: &ToolOutcome,
    ) -> CallResult<Verdict> {
        let body = json!({ "question": question, "answer": answer, "memory": tools.memory });
        self.post("guardrail", &self.paths.post_check, &body).await
    }
}

#[async_trait]
impl ToolAdapter for HttpCollaborator {
    fn catalog(&self) -> Vec<ToolSpec> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn invoke(&self, tool: &str, args: &serde_json::Value) -> CallResult<serde_json::Value> {
        let body = json!({ "tool": tool, "args": args });
        let response: InvokeResponse = self.post("tools", &self.paths.invoke, &body).await?;
        Ok(response.result)
    }
}
