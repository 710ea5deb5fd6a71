//! Commands: immutable requests for the next pipeline stage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::types::{Document, ToolOutcome, Verdict};

/// Pipeline stages, in the order the state machine enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Question,
    Check,
    Retrieve,
    Rerank,
    Enhance,
    UseTools,
    LlmResponse,
    FinalCheck,
    Done,
}

impl CommandKind {
    pub const ALL: [CommandKind; 9] = [
        CommandKind::Question,
        CommandKind::Check,
        CommandKind::Retrieve,
        CommandKind::Rerank,
        CommandKind::Enhance,
        CommandKind::UseTools,
        CommandKind::LlmResponse,
        CommandKind::FinalCheck,
        CommandKind::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Question => "question",
            CommandKind::Check => "check",
            CommandKind::Retrieve => "retrieve",
            CommandKind::Rerank => "rerank",
            CommandKind::Enhance => "enhance",
            CommandKind::UseTools => "use_tools",
            CommandKind::LlmResponse => "llm_response",
            CommandKind::FinalCheck => "final_check",
            CommandKind::Done => "done",
        }
    }

    /// The stage that follows this one, or `None` for `Done`.
    pub fn next(self) -> Option<CommandKind> {
        let idx = self as usize;
        Self::ALL.get(idx + 1).copied()
    }

    /// The stage that must precede this one, or `None` for `Question`.
    pub fn previous(self) -> Option<CommandKind> {
        (self as usize).checked_sub(1).map(|i| Self::ALL[i])
    }

    /// Guardrail stages may end a session with a rejection.
    pub fn is_guardrail(self) -> bool {
        matches!(self, CommandKind::Check | CommandKind::FinalCheck)
    }

    pub fn is_terminal(self) -> bool {
        self == CommandKind::Done
    }

    /// Progress label shown while the stage runs. `Done` has none.
    pub fn step_name(self) -> Option<&'static str> {
        match self {
            CommandKind::Question => Some("Processing..."),
            CommandKind::Check => Some("Checking..."),
            CommandKind::Retrieve => Some("Retrieving..."),
            CommandKind::Rerank => Some("Enhancing..."),
            CommandKind::Enhance => Some("Finetuning..."),
            CommandKind::UseTools => Some("Answering..."),
            CommandKind::LlmResponse => Some("Finalizing..."),
            CommandKind::FinalCheck => Some("Evaluating..."),
            CommandKind::Done => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = ConfigError;

    /// Accepts `snake_case` names as well as `CamelCase` (`LLMResponse`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        CommandKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().replace('_', "") == normalized)
            .ok_or_else(|| ConfigError::UnknownCommandKind {
                name: s.to_string(),
            })
    }
}

/// Stage-specific data carried by a [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Question,
    Check,
    Retrieve,
    Rerank {
        candidates: Vec<Document>,
    },
    Enhance {
        context: Vec<Document>,
    },
    UseTools {
        enhanced: String,
    },
    LlmResponse {
        enhanced: String,
        tools: ToolOutcome,
    },
    FinalCheck {
        answer: String,
        tools: ToolOutcome,
    },
    Done {
        answer: String,
        verdict: Verdict,
    },
}

impl Payload {
    pub fn kind(&self) -> CommandKind {
        match self {
            Payload::Question => CommandKind::Question,
            Payload::Check => CommandKind::Check,
            Payload::Retrieve => CommandKind::Retrieve,
            Payload::Rerank { .. } => CommandKind::Rerank,
            Payload::Enhance { .. } => CommandKind::Enhance,
            Payload::UseTools { .. } => CommandKind::UseTools,
            Payload::LlmResponse { .. } => CommandKind::LlmResponse,
            Payload::FinalCheck { .. } => CommandKind::FinalCheck,
            Payload::Done { .. } => CommandKind::Done,
        }
    }
}

/// An immutable instruction for one pipeline stage.
///
/// Stages never modify the command they receive; they derive a new one with
/// [`Command::follow`], which keeps the session and original question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    id: Uuid,
    session_id: String,
    question: String,
    payload: Payload,
    created_at: DateTime<Utc>,
    parent: Option<Uuid>,
}

impl Command {
    /// The entry command for a new question.
    pub fn question(session_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self::new(session_id, question, Payload::Question)
    }

    pub fn new(
        session_id: impl Into<String>,
        question: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            question: question.into(),
            payload,
            created_at: Utc::now(),
            parent: None,
        }
    }

    /// Derive the next command in the chain.
    pub fn follow(&self, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: self.session_id.clone(),
            question: self.question.clone(),
            payload,
            created_at: Utc::now(),
            parent: Some(self.id),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The user's original question.
    pub fn question_text(&self) -> &str {
        &self.question
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Id of the command this one was derived from.
    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }
}
