//! One handler per pipeline stage.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{StageContext, StageHandler, StageOutput};
use crate::command::{Command, CommandKind, Payload};
use crate::error::{CollaboratorError, FaultKind, PipelineError, Result};
use crate::event::{Event, EventError, EventPayload};
use crate::types::{ToolOutcome, ToolSpec};

/// Built-in tool that runs a read statement against the storage adapter.
pub const QUERY_DATABASE: &str = "query_database";
/// Built-in tool that returns the storage schema.
pub const DESCRIBE_DATABASE: &str = "describe_database";

/// Tool specs offered to the generator when a storage adapter is configured.
pub fn storage_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(QUERY_DATABASE, "Run a read-only SQL statement and return the rows.")
            .with_parameters(json!({
                "type": "object",
                "properties": { "statement": { "type": "string" } },
                "required": ["statement"]
            })),
        ToolSpec::new(
            DESCRIBE_DATABASE,
            "List the tables, columns and foreign keys of the database.",
        ),
    ]
}

fn wrong_payload(command: &Command, handler: CommandKind) -> PipelineError {
    PipelineError::StageContract {
        command_kind: handler,
        reason: format!("received a {} payload", command.kind()),
    }
}

/// Structured tool data for the answer's `data` map.
fn tool_data<T: serde::Serialize>(value: &T, tool: &str) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| PipelineError::StageContract {
        command_kind: CommandKind::UseTools,
        reason: format!("{tool} result is not representable as JSON: {e}"),
    })
}

fn generator_fault(kind: CommandKind, message: String) -> PipelineError {
    PipelineError::Collaborator {
        command_kind: kind,
        source: CollaboratorError::new(FaultKind::MalformedInput, "generator", message),
    }
}

/// Validates the question and opens the pipeline.
#[derive(Debug, Default)]
pub struct QuestionStage;

#[async_trait]
impl StageHandler for QuestionStage {
    fn kind(&self) -> CommandKind {
        CommandKind::Question
    }

    async fn handle(&self, _ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
        if command.question_text().trim().is_empty() {
            return Err(PipelineError::MalformedCommand {
                command_kind: CommandKind::Question,
                reason: "question is empty".into(),
            });
        }
        Ok(StageOutput::advance(command.follow(Payload::Check)))
    }
}

/// Input guardrail.
#[derive(Debug, Default)]
pub struct CheckStage;

#[async_trait]
impl StageHandler for CheckStage {
    fn kind(&self) -> CommandKind {
        CommandKind::Check
    }

    async fn handle(&self, ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
        let guardrail = &ctx.collaborators.guardrail;
        let question = command.question_text();
        let verdict = ctx
            .call(command, "guardrail", &ctx.policies.model, || {
                guardrail.pre_check(question)
            })
            .await?;

        if verdict.approved {
            return Ok(StageOutput::advance(command.follow(Payload::Retrieve)));
        }
        debug!(session_id = command.session_id(), issues = ?verdict.issues, "Question rejected");
        Ok(StageOutput::halt(Event::error(
            command.session_id(),
            CommandKind::Check,
            EventError::RejectedRequest {
                response: verdict.response,
            },
        )))
    }
}

#[derive(Debug, Default)]
pub struct RetrieveStage;

#[async_trait]
impl StageHandler for RetrieveStage {
    fn kind(&self) -> CommandKind {
        CommandKind::Retrieve
    }

    async fn handle(&self, ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
        let retriever = &ctx.collaborators.retriever;
        let question = command.question_text();
        let limit = ctx.settings.retrieval_limit;
        let mut candidates = ctx
            .call(command, "retriever", &ctx.policies.retrieval, || {
                retriever.retrieve(question, limit)
            })
            .await?;
        candidates.truncate(limit);
        debug!(session_id = command.session_id(), count = candidates.len(), "Retrieved candidates");
        Ok(StageOutput::advance(
            command.follow(Payload::Rerank { candidates }),
        ))
    }
}

#[derive(Debug, Default)]
pub struct RerankStage;

#[async_trait]
impl StageHandler for RerankStage {
    fn kind(&self) -> CommandKind {
        CommandKind::Rerank
    }

    async fn handle(&self, ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
        let Payload::Rerank { candidates } = command.payload() else {
            return Err(wrong_payload(command, CommandKind::Rerank));
        };
        let top_n = ctx.settings.rerank_top_n;
        let context = if candidates.is_empty() {
            Vec::new()
        } else {
            let ranker = &ctx.collaborators.ranker;
            let question = command.question_text();
            let mut ranked = ctx
                .call(command, "ranker", &ctx.policies.retrieval, || {
                    ranker.rerank(question, candidates, top_n)
                })
                .await?;
            ranked.truncate(top_n);
            ranked
        };
        Ok(StageOutput::advance(
            command.follow(Payload::Enhance { context }),
        ))
    }
}

/// Rewrites the question with the ranked context.
#[derive(Debug, Default)]
pub struct EnhanceStage;

#[async_trait]
impl StageHandler for EnhanceStage {
    fn kind(&self) -> CommandKind {
        CommandKind::Enhance
    }

    async fn handle(&self, ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
        let Payload::Enhance { context } = command.payload() else {
            return Err(wrong_payload(command, CommandKind::Enhance));
        };
        let generator = &ctx.collaborators.generator;
        let question = command.question_text();
        let text = ctx
            .call(command, "generator", &ctx.policies.model, || {
                generator.enhance(question, context)
            })
            .await?;
        let enhanced = if text.trim().is_empty() {
            question.to_string()
        } else {
            text
        };
        Ok(StageOutput::advance(
            command.follow(Payload::UseTools { enhanced }),
        ))
    }
}

/// Lets the generator pick tools, then runs them in order.
#[derive(Debug, Default)]
pub struct UseToolsStage;

#[async_trait]
impl StageHandler for UseToolsStage {
    fn kind(&self) -> CommandKind {
        CommandKind::UseTools
    }

    async fn handle(&self, ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
        let Payload::UseTools { enhanced } = command.payload() else {
            return Err(wrong_payload(command, CommandKind::UseTools));
        };
        let storage = ctx.collaborators.storage.as_ref();
        let tools = ctx.collaborators.tools.as_ref();

        let mut catalog = Vec::new();
        if storage.is_some() {
            catalog.extend(storage_tools());
        }
        if let Some(tools) = tools {
            catalog.extend(tools.catalog());
        }

        let mut outcome = ToolOutcome::default();
        if !catalog.is_empty() && ctx.settings.max_tool_calls > 0 {
            let generator = &ctx.collaborators.generator;
            let max_calls = ctx.settings.max_tool_calls;
            let catalog_ref = &catalog;
            let mut calls = ctx
                .call(command, "generator", &ctx.policies.model, || {
                    generator.select_tools(enhanced, catalog_ref, max_calls)
                })
                .await?;
            calls.truncate(max_calls);
            debug!(session_id = command.session_id(), count = calls.len(), "Running tool calls");

            for (index, call) in calls.iter().enumerate() {
                let name = call.tool.as_str();
                match (name, storage) {
                    (QUERY_DATABASE, Some(storage)) => {
                        let statement = call
                            .args
                            .get("statement")
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                generator_fault(
                                    CommandKind::UseTools,
                                    format!("{QUERY_DATABASE} call without a statement"),
                                )
                            })?;
                        let rows = ctx
                            .call(command, "storage", &ctx.policies.database, || {
                                storage.execute_query(statement)
                            })
                            .await?;
                        let data = tool_data(&rows, QUERY_DATABASE)?;
                        outcome.record(index, call, rows.to_text(), data);
                    }
                    (DESCRIBE_DATABASE, Some(storage)) => {
                        let schema = ctx
                            .call(command, "storage", &ctx.policies.database, || {
                                storage.get_schema()
                            })
                            .await?;
                        let data = tool_data(&schema, DESCRIBE_DATABASE)?;
                        outcome.record(index, call, schema.summary(), data);
                    }
                    _ => {
                        let adapter = tools
                            .filter(|_| catalog.iter().any(|spec| spec.name == name))
                            .ok_or_else(|| {
                                generator_fault(
                                    CommandKind::UseTools,
                                    format!("selected unknown tool '{name}'"),
                                )
                            })?;
                        let args = &call.args;
                        let result = ctx
                            .call(command, "tools", &ctx.policies.tool, || {
                                adapter.invoke(name, args)
                            })
                            .await?;
                        outcome.record_value(index, call, result);
                    }
                }
            }
        }

        Ok(StageOutput::advance(command.follow(Payload::LlmResponse {
            enhanced: enhanced.clone(),
            tools: outcome,
        })))
    }
}

/// Generates the answer and publishes it immediately.
#[derive(Debug, Default)]
pub struct LlmResponseStage;

#[async_trait]
impl StageHandler for LlmResponseStage {
    fn kind(&self) -> CommandKind {
        CommandKind::LlmResponse
    }

    async fn handle(&self, ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
        let Payload::LlmResponse { enhanced, tools } = command.payload() else {
            return Err(wrong_payload(command, CommandKind::LlmResponse));
        };
        let generator = &ctx.collaborators.generator;
        let question = command.question_text();
        let answer = ctx
            .call(command, "generator", &ctx.policies.model, || {
                generator.answer(question, enhanced, tools)
            })
            .await?;

        let response = Event::payload(
            command.session_id(),
            CommandKind::LlmResponse,
            EventPayload::Response {
                answer: answer.clone(),
                data: tools.clone(),
            },
        );
        Ok(StageOutput::advance(command.follow(Payload::FinalCheck {
            answer,
            tools: tools.clone(),
        }))
        .with_event(response))
    }
}

/// Output guardrail.
#[derive(Debug, Default)]
pub struct FinalCheckStage;

#[async_trait]
impl StageHandler for FinalCheckStage {
    fn kind(&self) -> CommandKind {
        CommandKind::FinalCheck
    }

    async fn handle(&self, ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
        let Payload::FinalCheck { answer, tools } = command.payload() else {
            return Err(wrong_payload(command, CommandKind::FinalCheck));
        };
        let guardrail = &ctx.collaborators.guardrail;
        let question = command.question_text();
        let verdict = ctx
            .call(command, "guardrail", &ctx.policies.model, || {
                guardrail.post_check(question, answer, tools)
            })
            .await?;

        if !verdict.approved {
            return Ok(StageOutput::halt(Event::error(
                command.session_id(),
                CommandKind::FinalCheck,
                EventError::RejectedAnswer {
                    answer: answer.clone(),
                    rejection: verdict.response,
                },
            )));
        }

        let evaluation = Event::payload(
            command.session_id(),
            CommandKind::FinalCheck,
            EventPayload::Evaluation {
                answer: answer.clone(),
                verdict: verdict.clone(),
            },
        );
        Ok(StageOutput::advance(command.follow(Payload::Done {
            answer: answer.clone(),
            verdict,
        }))
        .with_event(evaluation))
    }
}

/// Emits the end-of-stream marker.
#[derive(Debug, Default)]
pub struct DoneStage;

#[async_trait]
impl StageHandler for DoneStage {
    fn kind(&self) -> CommandKind {
        CommandKind::Done
    }

    async fn handle(&self, _ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
        Ok(StageOutput::halt(Event::payload(
            command.session_id(),
            CommandKind::Done,
            EventPayload::Completed,
        )))
    }
}
