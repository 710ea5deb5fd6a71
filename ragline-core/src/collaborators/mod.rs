//! Interfaces to the services the pipeline depends on.
//!
//! Every call returns a [`CollaboratorError`] tagged with a
//! [`FaultKind`](crate::error::FaultKind); the stage handlers wrap each call in
//! the retry executor with the policy for that collaborator class.

pub mod http;
pub mod mock;
pub mod notify;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::event::Event;
use crate::types::{Document, ResultSet, Row, Schema, ToolCall, ToolOutcome, ToolSpec, Verdict};

pub use http::{HttpCollaborator, HttpPaths};
pub use notify::{
    BroadcastSink, FanoutSink, LogSink, QueuedSink, RecordingSink, WebhookSink,
};
pub use sqlite::SqliteStorage;

/// Collaborator result alias.
pub type CallResult<T> = Result<T, CollaboratorError>;

/// Fetches candidate documents for a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, limit: usize) -> CallResult<Vec<Document>>;
}

/// Orders candidates by relevance and keeps the best `top_n`.
#[async_trait]
pub trait Ranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[Document],
        top_n: usize,
    ) -> CallResult<Vec<Document>>;
}

/// The language model.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Rewrite `question` with the ranked context. An empty string means
    /// "keep the original question".
    async fn enhance(&self, question: &str, context: &[Document]) -> CallResult<String>;

    /// Choose up to `max_calls` tool invocations from `tools`.
    async fn select_tools(
        &self,
        question: &str,
        tools: &[ToolSpec],
        max_calls: usize,
    ) -> CallResult<Vec<ToolCall>>;

    /// Produce the final answer.
    async fn answer(&self, question: &str, enhanced: &str, tools: &ToolOutcome)
    -> CallResult<String>;
}

/// Input and output validation.
#[async_trait]
pub trait Guardrail: Send + Sync {
    async fn pre_check(&self, question: &str) -> CallResult<Verdict>;

    async fn post_check(
        &self,
        question: &str,
        answer: &str,
        tools: &ToolOutcome,
    ) -> CallResult<Verdict>;
}

/// External tools callable by name.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn catalog(&self) -> Vec<ToolSpec>;

    async fn invoke(&self, tool: &str, args: &serde_json::Value) -> CallResult<serde_json::Value>;
}

/// The relational store.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn execute_query(&self, statement: &str) -> CallResult<ResultSet>;

    async fn get_schema(&self) -> CallResult<Schema>;

    /// Insert `rows` into `table` atomically. Returns the number inserted.
    async fn insert_batch(&self, table: &str, rows: &[Row]) -> CallResult<usize>;
}

/// Receives every event the bus emits. Delivery failures are handled inside
/// the sink and never reach the bus.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: &Event);
}

/// The set of collaborators a bus runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub retriever: Arc<dyn Retriever>,
    pub ranker: Arc<dyn Ranker>,
    pub generator: Arc<dyn Generator>,
    pub guardrail: Arc<dyn Guardrail>,
    pub tools: Option<Arc<dyn ToolAdapter>>,
    pub storage: Option<Arc<dyn Storage>>,
}

impl Collaborators {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        ranker: Arc<dyn Ranker>,
        generator: Arc<dyn Generator>,
        guardrail: Arc<dyn Guardrail>,
    ) -> Self {
        Self {
            retriever,
            ranker,
            generator,
            guardrail,
            tools: None,
            storage: None,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolAdapter>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Every collaborator served by one HTTP endpoint.
    pub fn from_http(http: Arc<HttpCollaborator>) -> Self {
        Self::new(
            http.clone(),
            http.clone(),
            http.clone(),
            http.clone(),
        )
        .with_tools(http)
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("tools", &self.tools.is_some())
            .field("storage", &self.storage.is_some())
            .finish_non_exhaustive()
    }
}
