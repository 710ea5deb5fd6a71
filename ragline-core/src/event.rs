//! Events: terminal artifacts describing what a stage produced.
//!
//! An event carries either a payload or an error, never both. Events are
//! forwarded to notification sinks and never re-enter the state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::command::CommandKind;
use crate::error::FaultKind;
use crate::rate_limit::AdmissionDenied;
use crate::types::{ToolOutcome, Verdict};

/// Coarse classification of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Success,
    Failure,
    Notification,
}

/// Successful or informational content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A stage has started.
    StatusUpdate { step: String },
    /// The generated answer, emitted as soon as it exists.
    Response { answer: String, data: ToolOutcome },
    /// The final guardrail approved the answer.
    Evaluation { answer: String, verdict: Verdict },
    /// End of stream for the session.
    Completed,
}

/// Expected, user-facing failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventError {
    RateLimited(AdmissionDenied),
    /// The question was rejected by the input guardrail.
    RejectedRequest { response: String },
    /// The answer was rejected by the output guardrail.
    RejectedAnswer { answer: String, rejection: String },
    /// A pipeline fault, reduced to a generic message.
    Failed { message: String, fault: FaultKind },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Payload(EventPayload),
    Error(EventError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub session_id: String,
    pub source_command_kind: CommandKind,
    pub outcome: Outcome,
    pub created_at: DateTime<Utc>,
}

impl Event {
    fn build(session_id: &str, source: CommandKind, kind: EventKind, outcome: Outcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            session_id: session_id.to_string(),
            source_command_kind: source,
            outcome,
            created_at: Utc::now(),
        }
    }

    pub fn payload(session_id: &str, source: CommandKind, payload: EventPayload) -> Self {
        let kind = match payload {
            EventPayload::StatusUpdate { .. } | EventPayload::Completed => EventKind::Notification,
            EventPayload::Response { .. } | EventPayload::Evaluation { .. } => EventKind::Success,
        };
        Self::build(session_id, source, kind, Outcome::Payload(payload))
    }

    pub fn error(session_id: &str, source: CommandKind, error: EventError) -> Self {
        Self::build(session_id, source, EventKind::Failure, Outcome::Error(error))
    }

    pub fn status(session_id: &str, source: CommandKind, step: &str) -> Self {
        Self::payload(
            session_id,
            source,
            EventPayload::StatusUpdate {
                step: step.to_string(),
            },
        )
    }

    pub fn rate_limited(session_id: &str, denied: AdmissionDenied) -> Self {
        let source = denied.command_kind;
        Self::error(session_id, source, EventError::RateLimited(denied))
    }

    pub fn payload_ref(&self) -> Option<&EventPayload> {
        match &self.outcome {
            Outcome::Payload(p) => Some(p),
            Outcome::Error(_) => None,
        }
    }

    pub fn error_ref(&self) -> Option<&EventError> {
        match &self.outcome {
            Outcome::Error(e) => Some(e),
            Outcome::Payload(_) => None,
        }
    }

    /// Whether this event ends the session's event stream.
    pub fn is_terminal(&self) -> bool {
        match &self.outcome {
            Outcome::Payload(EventPayload::Completed) => true,
            Outcome::Payload(_) => false,
            Outcome::Error(EventError::RateLimited(_)) => false,
            Outcome::Error(_) => true,
        }
    }

    /// Plain-text rendering for terminals and chat sinks.
    pub fn to_message(&self) -> String {
        match &self.outcome {
            Outcome::Payload(EventPayload::StatusUpdate { step }) => step.clone(),
            Outcome::Payload(EventPayload::Response { answer, .. }) => answer.clone(),
            Outcome::Payload(EventPayload::Evaluation { verdict, .. }) => {
                if verdict.issues.is_empty() {
                    "Answer verified.".to_string()
                } else {
                    format!("Answer verified with notes: {}", verdict.issues.join("; "))
                }
            }
            Outcome::Payload(EventPayload::Completed) => "Done.".to_string(),
            Outcome::Error(EventError::RateLimited(denied)) => format!(
                "Rate limit exceeded. Retry after {:.1}s.",
                denied.retry_after.as_secs_f64()
            ),
            Outcome::Error(EventError::RejectedRequest { response }) => response.clone(),
            Outcome::Error(EventError::RejectedAnswer { rejection, .. }) => rejection.clone(),
            Outcome::Error(EventError::Failed { message, .. }) => message.clone(),
        }
    }

    /// Markdown rendering for rich clients.
    pub fn to_markdown(&self) -> String {
        match &self.outcome {
            Outcome::Payload(EventPayload::StatusUpdate { step }) => format!("_{step}_"),
            Outcome::Payload(EventPayload::Response { answer, data }) => {
                if data.memory.is_empty() {
                    answer.clone()
                } else {
                    let sources: Vec<String> =
                        data.memory.iter().map(|m| format!("- {m}")).collect();
                    format!("{answer}\n\n**Sources**\n{}", sources.join("\n"))
                }
            }
            Outcome::Payload(EventPayload::Evaluation { verdict, .. }) => {
                let mut out = "**Evaluation:** approved".to_string();
                for issue in &verdict.issues {
                    out.push_str(&format!("\n- {issue}"));
                }
                out
            }
            Outcome::Payload(EventPayload::Completed) => "---".to_string(),
            Outcome::Error(EventError::RateLimited(denied)) => format!(
                "**Rate limit exceeded.** Retry after {:.1}s (limit {}).",
                denied.retry_after.as_secs_f64(),
                denied.limit
            ),
            Outcome::Error(EventError::RejectedRequest { response }) => {
                format!("**Request rejected.** {response}")
            }
            Outcome::Error(EventError::RejectedAnswer { answer, rejection }) => {
                format!("**Answer rejected.** {rejection}\n\n> {answer}")
            }
            Outcome::Error(EventError::Failed { message, .. }) => format!("**Error.** {message}"),
        }
    }

    /// Server-sent-event frame: progress as named events, everything else as data.
    pub fn to_sse(&self) -> String {
        match &self.outcome {
            Outcome::Payload(EventPayload::StatusUpdate { step }) => format!("event: {step}\n\n"),
            Outcome::Payload(EventPayload::Completed) => "event: end\n\n".to_string(),
            _ => {
                let body = serde_json::json!({
                    "session_id": self.session_id,
                    "source": self.source_command_kind,
                    "kind": self.kind,
                    "message": self.to_message(),
                });
                format!("data: {body}\n\n")
            }
        }
    }
}
