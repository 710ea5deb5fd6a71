//! In-memory collaborators for tests and offline (`--dry-run`) runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{CallResult, Collaborators, Generator, Guardrail, Ranker, Retriever, Storage, ToolAdapter};
use crate::error::{CollaboratorError, FaultKind};
use crate::types::{Document, ResultSet, Row, Schema, ToolCall, ToolOutcome, ToolSpec, Verdict};

/// Returns a fixed document set.
#[derive(Debug, Clone, Default)]
pub struct StaticRetriever {
    documents: Vec<Document>,
}

impl StaticRetriever {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn retrieve(&self, _query: &str, limit: usize) -> CallResult<Vec<Document>> {
        Ok(self.documents.iter().take(limit).cloned().collect())
    }
}

/// Scores documents by how many query words they contain.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordRanker;

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl Ranker for KeywordRanker {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[Document],
        top_n: usize,
    ) -> CallResult<Vec<Document>> {
        let terms = words(query);
        let mut scored: Vec<Document> = candidates
            .iter()
            .map(|doc| {
                let text = doc.text.to_lowercase();
                let hits = terms.iter().filter(|t| text.contains(t.as_str())).count();
                doc.clone().with_score(hits as f64)
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_n);
        Ok(scored)
    }
}

/// A generator with scripted outputs.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    enhanced: Option<String>,
    calls: Vec<ToolCall>,
    answer: Option<String>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enhanced(mut self, text: impl Into<String>) -> Self {
        self.enhanced = Some(text.into());
        self
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.calls.push(call);
        self
    }

    pub fn with_answer(mut self, text: impl Into<String>) -> Self {
        self.answer = Some(text.into());
        self
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn enhance(&self, _question: &str, _context: &[Document]) -> CallResult<String> {
        Ok(self.enhanced.clone().unwrap_or_default())
    }

    async fn select_tools(
        &self,
        _question: &str,
        tools: &[ToolSpec],
        max_calls: usize,
    ) -> CallResult<Vec<ToolCall>> {
        Ok(self
            .calls
            .iter()
            .filter(|c| tools.iter().any(|t| t.name == c.tool))
            .take(max_calls)
            .cloned()
            .collect())
    }

    async fn answer(&self, question: &str, _enhanced: &str, tools: &ToolOutcome) -> CallResult<String> {
        if let Some(answer) = &self.answer {
            return Ok(answer.clone());
        }
        if tools.memory.is_empty() {
            Ok(format!("No data was needed to answer: {question}"))
        } else {
            Ok(format!("Based on {}", tools.memory.join("; ")))
        }
    }
}

/// Rejects questions containing blocked terms, and optionally every answer.
#[derive(Debug, Clone, Default)]
pub struct StaticGuardrail {
    blocked_terms: Vec<String>,
    answer_rejection: Option<String>,
}

impl StaticGuardrail {
    pub fn approve_all() -> Self {
        Self::default()
    }

    pub fn blocking(mut self, term: impl Into<String>) -> Self {
        self.blocked_terms.push(term.into().to_lowercase());
        self
    }

    pub fn rejecting_answers(mut self, reason: impl Into<String>) -> Self {
        self.answer_rejection = Some(reason.into());
        self
    }
}

#[async_trait]
impl Guardrail for StaticGuardrail {
    async fn pre_check(&self, question: &str) -> CallResult<Verdict> {
        let lowered = question.to_lowercase();
        match self.blocked_terms.iter().find(|t| lowered.contains(t.as_str())) {
            Some(term) => Ok(Verdict::reject(
                "I can only help with questions about the connected data.",
            )
            .with_issue(format!("blocked term: {term}"))),
            None => Ok(Verdict::approve()),
        }
    }

    async fn post_check(
        &self,
        _question: &str,
        answer: &str,
        _tools: &ToolOutcome,
    ) -> CallResult<Verdict> {
        if let Some(reason) = &self.answer_rejection {
            return Ok(Verdict::reject(reason.clone()));
        }
        if answer.trim().is_empty() {
            return Ok(Verdict::reject("The answer was empty."));
        }
        Ok(Verdict::approve())
    }
}

/// Tools with canned results.
#[derive(Debug, Clone, Default)]
pub struct StaticTools {
    specs: Vec<ToolSpec>,
    results: HashMap<String, serde_json::Value>,
}

impl StaticTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, spec: ToolSpec, result: serde_json::Value) -> Self {
        self.results.insert(spec.name.clone(), result);
        self.specs.push(spec);
        self
    }
}

#[async_trait]
impl ToolAdapter for StaticTools {
    fn catalog(&self) -> Vec<ToolSpec> {
        self.specs.clone()
    }

    async fn invoke(&self, tool: &str, _args: &serde_json::Value) -> CallResult<serde_json::Value> {
        self.results.get(tool).cloned().ok_or_else(|| {
            CollaboratorError::new(FaultKind::MalformedInput, "tools", format!("unknown tool: {tool}"))
        })
    }
}

/// Storage answering from a statement → result map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    schema: Schema,
    results: HashMap<String, ResultSet>,
    inserted: Mutex<Vec<(String, Row)>>,
}

impl MemoryStorage {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            ..Self::default()
        }
    }

    pub fn with_result(mut self, statement: impl Into<String>, result: ResultSet) -> Self {
        self.results.insert(statement.into(), result);
        self
    }

    pub fn inserted(&self) -> Vec<(String, Row)> {
        self.inserted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn execute_query(&self, statement: &str) -> CallResult<ResultSet> {
        self.results.get(statement.trim()).cloned().ok_or_else(|| {
            CollaboratorError::new(
                FaultKind::MalformedInput,
                "storage",
                format!("no such table referenced by: {statement}"),
            )
        })
    }

    async fn get_schema(&self) -> CallResult<Schema> {
        Ok(self.schema.clone())
    }

    async fn insert_batch(&self, table: &str, rows: &[Row]) -> CallResult<usize> {
        let mut inserted = self.inserted.lock().unwrap_or_else(PoisonError::into_inner);
        inserted.extend(rows.iter().map(|r| (table.to_string(), r.clone())));
        Ok(rows.len())
    }
}

/// Fails a scripted number of calls before letting them through.
#[derive(Debug)]
pub struct FailurePlan {
    remaining: AtomicU32,
    kind: FaultKind,
    calls: AtomicU32,
}

impl FailurePlan {
    pub fn fail_times(times: u32, kind: FaultKind) -> Self {
        Self {
            remaining: AtomicU32::new(times),
            kind,
            calls: AtomicU32::new(0),
        }
    }

    pub fn always(kind: FaultKind) -> Self {
        Self::fail_times(u32::MAX, kind)
    }

    /// Calls observed so far, failed or not.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, collaborator: &str) -> CallResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(CollaboratorError::new(
                self.kind,
                collaborator,
                format!("scripted {} failure", self.kind),
            ))
        } else {
            Ok(())
        }
    }
}

/// Wraps a collaborator with a [`FailurePlan`].
#[derive(Debug)]
pub struct Flaky<T> {
    inner: T,
    plan: Arc<FailurePlan>,
}

impl<T> Flaky<T> {
    pub fn new(inner: T, plan: FailurePlan) -> Self {
        Self {
            inner,
            plan: Arc::new(plan),
        }
    }

    pub fn plan(&self) -> Arc<FailurePlan> {
        Arc::clone(&self.plan)
    }
}

#[async_trait]
impl<T: Retriever> Retriever for Flaky<T> {
    async fn retrieve(&self, query: &str, limit: usize) -> CallResult<Vec<Document>> {
        self.plan.check("retriever")?;
        self.inner.retrieve(query, limit).await
    }
}

#[async_trait]
impl<T: Generator> Generator for Flaky<T> {
    async fn enhance(&self, question: &str, context: &[Document]) -> CallResult<String> {
        self.plan.check("generator")?;
        self.inner.enhance(question, context).await
    }

    async fn select_tools(
        &self,
        question: &str,
        tools: &[ToolSpec],
        max_calls: usize,
    ) -> CallResult<Vec<ToolCall>> {
        self.plan.check("generator")?;
        self.inner.select_tools(question, tools, max_calls).await
    }

    async fn answer(&self, question: &str, enhanced: &str, tools: &ToolOutcome) -> CallResult<String> {
        self.plan.check("generator")?;
        self.inner.answer(question, enhanced, tools).await
    }
}

#[async_trait]
impl<T: Storage> Storage for Flaky<T> {
    async fn execute_query(&self, statement: &str) -> CallResult<ResultSet> {
        self.plan.check("storage")?;
        self.inner.execute_query(statement).await
    }

    async fn get_schema(&self) -> CallResult<Schema> {
        self.plan.check("storage")?;
        self.inner.get_schema().await
    }

    async fn insert_batch(&self, table: &str, rows: &[Row]) -> CallResult<usize> {
        self.plan.check("storage")?;
        self.inner.insert_batch(table, rows).await
    }
}

#[async_trait]
impl<T: ToolAdapter> ToolAdapter for Flaky<T> {
    fn catalog(&self) -> Vec<ToolSpec> {
        self.inner.catalog()
    }

    async fn invoke(&self, tool: &str, args: &serde_json::Value) -> CallResult<serde_json::Value> {
        self.plan.check("tools")?;
        self.inner.invoke(tool, args).await
    }
}

/// Documents used by offline runs.
pub fn sample_documents() -> Vec<Document> {
    vec![
        Document::new("doc-orders", "The orders table records every purchase with its customer and total.")
            .with_name("orders"),
        Document::new("doc-customers", "The customers table stores customer names, emails and signup dates.")
            .with_name("customers"),
        Document::new("doc-refunds", "Refunds reference an order and are issued within thirty days.")
            .with_name("refunds"),
    ]
}

/// A complete collaborator set that never leaves the process.
pub fn offline_collaborators() -> Collaborators {
    Collaborators::new(
        Arc::new(StaticRetriever::new(sample_documents())),
        Arc::new(KeywordRanker),
        Arc::new(ScriptedGenerator::new()),
        Arc::new(StaticGuardrail::approve_all()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_keyword_ranker_orders_by_overlap() {
        let ranked = KeywordRanker
            .rerank("customer emails", &sample_documents(), 2)
            .await
            .unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, "doc-customers");
        assert!(ranked[0].score >= ranked[1].score);
    }

    #[tokio::test]
    async fn test_failure_plan_counts_down() {
        let flaky = Flaky::new(
            StaticRetriever::new(sample_documents()),
            FailurePlan::fail_times(2, FaultKind::Connection),
        );
        assert!(flaky.retrieve("q", 1).await.is_err());
        assert!(flaky.retrieve("q", 1).await.is_err());
        assert_eq!(flaky.retrieve("q", 1).await.unwrap().len(), 1);
        assert_eq!(flaky.plan().calls(), 3);
    }

    #[tokio::test]
    async fn test_generator_only_selects_offered_tools() {
        let generator = ScriptedGenerator::new()
            .with_tool_call(ToolCall::new("weather", json!({})))
            .with_tool_call(ToolCall::new("missing", json!({})));
        let offered = vec![ToolSpec::new("weather", "Weather lookup")];
        let calls = generator.select_tools("q", &offered, 5).await.unwrap();
        assert_eq!(calls, vec![ToolCall::new("weather", json!({}))]);
    }

    #[tokio::test]
    async fn test_guardrail_blocks_terms() {
        let guardrail = StaticGuardrail::approve_all().blocking("weather");
        assert!(!guardrail.pre_check("What's the Weather?").await.unwrap().approved);
        assert!(guardrail.pre_check("How many orders?").await.unwrap().approved);
        assert!(!guardrail.post_check("q", " ", &ToolOutcome::default()).await.unwrap().approved);
    }
}
