//! Error types for the Ragline core library.
//!
//! Collaborator failures are tagged with a [`FaultKind`] rather than being
//! distinguished by type. The retry executor consults [`is_retryable`] on that
//! tag, so the retry decision never depends on the order of match arms.
//! Pipeline-level faults ([`PipelineError`]) abort a session and carry enough
//! context for operators; [`PipelineError::user_message`] is what users see.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::CommandKind;
use crate::redact;

/// Structured, string-valued context attached to failures.
pub type ErrorContext = BTreeMap<String, String>;

/// Classification of a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Could not reach the collaborator.
    Connection,
    /// The call did not finish within its deadline.
    Timeout,
    /// The collaborator is temporarily unable to serve requests.
    Unavailable,
    /// The collaborator asked us to slow down.
    Throttled,
    /// The request itself is invalid; repeating it cannot succeed.
    MalformedInput,
    /// Authentication or authorization was refused.
    PermissionDenied,
    /// A constraint or consistency rule was violated.
    DataIntegrity,
    /// A command arrived that the session state does not permit.
    InvalidStateTransition,
    /// The process is misconfigured.
    Configuration,
    /// An unexpected failure inside the engine or a collaborator.
    Internal,
}

impl FaultKind {
    /// Whether a failure of this kind may succeed on a later attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FaultKind::Connection | FaultKind::Timeout | FaultKind::Unavailable | FaultKind::Throttled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::Connection => "connection",
            FaultKind::Timeout => "timeout",
            FaultKind::Unavailable => "unavailable",
            FaultKind::Throttled => "throttled",
            FaultKind::MalformedInput => "malformed_input",
            FaultKind::PermissionDenied => "permission_denied",
            FaultKind::DataIntegrity => "data_integrity",
            FaultKind::InvalidStateTransition => "invalid_state_transition",
            FaultKind::Configuration => "configuration",
            FaultKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry predicate consumed by the retry executor.
pub fn is_retryable(kind: FaultKind) -> bool {
    kind.is_retryable()
}

/// Messages that mark a failure as permanent.
const FATAL_MARKERS: &[(&str, FaultKind)] = &[
    ("syntax error", FaultKind::MalformedInput),
    ("invalid sql", FaultKind::MalformedInput),
    ("malformed", FaultKind::MalformedInput),
    ("invalid column", FaultKind::MalformedInput),
    ("no such table", FaultKind::MalformedInput),
    ("no such column", FaultKind::MalformedInput),
    ("table does not exist", FaultKind::MalformedInput),
    ("column does not exist", FaultKind::MalformedInput),
    ("permission denied", FaultKind::PermissionDenied),
    ("access denied", FaultKind::PermissionDenied),
    ("authorization failed", FaultKind::PermissionDenied),
    ("authentication failed", FaultKind::PermissionDenied),
    ("readonly", FaultKind::PermissionDenied),
    ("read-only", FaultKind::PermissionDenied),
    ("unique constraint", FaultKind::DataIntegrity),
    ("foreign key constraint", FaultKind::DataIntegrity),
    ("check constraint", FaultKind::DataIntegrity),
    ("not null constraint", FaultKind::DataIntegrity),
    ("integrity constraint", FaultKind::DataIntegrity),
    ("constraint failed", FaultKind::DataIntegrity),
    ("duplicate key", FaultKind::DataIntegrity),
];

/// Messages that mark a failure as transient.
const TRANSIENT_MARKERS: &[(&str, FaultKind)] = &[
    ("timed out", FaultKind::Timeout),
    ("timeout", FaultKind::Timeout),
    ("too many connections", FaultKind::Throttled),
    ("rate limit", FaultKind::Throttled),
    ("temporarily unavailable", FaultKind::Unavailable),
    ("service unavailable", FaultKind::Unavailable),
    ("database is locked", FaultKind::Unavailable),
    ("busy", FaultKind::Unavailable),
    ("connection", FaultKind::Connection),
    ("network", FaultKind::Connection),
    ("host unreachable", FaultKind::Connection),
];

/// Classify a textual failure from a collaborator that exposes no error codes.
///
/// Permanent markers win over transient ones; anything unrecognised is treated
/// as [`FaultKind::Unavailable`] so that unknown storage hiccups get retried.
pub fn classify_message(message: &str) -> FaultKind {
    let lowered = message.to_lowercase();
    if let Some((_, kind)) = FATAL_MARKERS.iter().find(|(m, _)| lowered.contains(m)) {
        return *kind;
    }
    if let Some((_, kind)) = TRANSIENT_MARKERS.iter().find(|(m, _)| lowered.contains(m)) {
        return *kind;
    }
    FaultKind::Unavailable
}

/// A failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{collaborator} failed ({kind}): {message}")]
pub struct CollaboratorError {
    pub kind: FaultKind,
    pub collaborator: String,
    pub message: String,
    pub context: ErrorContext,
}

impl CollaboratorError {
    pub fn new(
        kind: FaultKind,
        collaborator: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            collaborator: collaborator.into(),
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// A deadline expiry for `collaborator` after `after`.
    pub fn timeout(collaborator: impl Into<String>, after: Duration) -> Self {
        Self::new(
            FaultKind::Timeout,
            collaborator,
            format!("call timed out after {}ms", after.as_millis()),
        )
        .with_context("timeout_ms", after.as_millis().to_string())
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        is_retryable(self.kind)
    }

    /// Message with embedded secrets removed.
    pub fn sanitized_message(&self) -> String {
        redact::scrub(&self.message)
    }

    /// Context with secret-bearing entries filtered.
    pub fn sanitized_context(&self) -> ErrorContext {
        redact::sanitize_context(&self.context)
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Unknown command kind in rate limit overrides: {name}")]
    UnknownCommandKind { name: String },

    #[error("Configuration load error: {message}")]
    Load { message: String },
}

/// Faults that abort a session's pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{command_kind} stage failed: {source}")]
    Collaborator {
        command_kind: CommandKind,
        #[source]
        source: CollaboratorError,
    },

    #[error("{collaborator} gave up after {attempts_made} attempts during {command_kind}: {last}")]
    ExhaustedRetries {
        collaborator: String,
        command_kind: CommandKind,
        attempts_made: u32,
        last: CollaboratorError,
        /// Failures observed before `last`, oldest first.
        history: Vec<CollaboratorError>,
    },

    #[error("Invalid state transition for session {session_id}: {from} -> {to}")]
    InvalidStateTransition {
        session_id: String,
        from: String,
        to: CommandKind,
    },

    #[error("Malformed {command_kind} command: {reason}")]
    MalformedCommand {
        command_kind: CommandKind,
        reason: String,
    },

    #[error("Stage {command_kind} broke its contract: {reason}")]
    StageContract {
        command_kind: CommandKind,
        reason: String,
    },

    #[error("Session {session_id} was cancelled before {stage} completed")]
    Cancelled {
        session_id: String,
        stage: CommandKind,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// The fault classification of this error.
    pub fn kind(&self) -> FaultKind {
        match self {
            PipelineError::Collaborator { source, .. } => source.kind,
            PipelineError::ExhaustedRetries { last, .. } => last.kind,
            PipelineError::InvalidStateTransition { .. } => FaultKind::InvalidStateTransition,
            PipelineError::MalformedCommand { .. } => FaultKind::MalformedInput,
            PipelineError::StageContract { .. } | PipelineError::Cancelled { .. } => {
                FaultKind::Internal
            }
            PipelineError::Config(_) => FaultKind::Configuration,
        }
    }

    /// The stage during which the fault occurred, when known.
    pub fn command_kind(&self) -> Option<CommandKind> {
        match self {
            PipelineError::Collaborator { command_kind, .. }
            | PipelineError::ExhaustedRetries { command_kind, .. }
            | PipelineError::MalformedCommand { command_kind, .. }
            | PipelineError::StageContract { command_kind, .. } => Some(*command_kind),
            PipelineError::InvalidStateTransition { to, .. } => Some(*to),
            PipelineError::Cancelled { stage, .. } => Some(*stage),
            PipelineError::Config(_) => None,
        }
    }

    /// Number of attempts made against the failing collaborator, when known.
    pub fn attempts_made(&self) -> Option<u32> {
        match self {
            PipelineError::ExhaustedRetries { attempts_made, .. } => Some(*attempts_made),
            PipelineError::Collaborator { source, .. } => source
                .context
                .get("attempts_made")
                .and_then(|v| v.parse().ok()),
            _ => None,
        }
    }

    /// Operator-facing context with secrets filtered.
    pub fn sanitized_context(&self) -> ErrorContext {
        let mut context = ErrorContext::new();
        context.insert("fault_kind".into(), self.kind().to_string());
        if let Some(kind) = self.command_kind() {
            context.insert("command_kind".into(), kind.to_string());
        }
        if let Some(attempts) = self.attempts_made() {
            context.insert("attempts_made".into(), attempts.to_string());
        }
        let source = match self {
            PipelineError::Collaborator { source, .. } => Some(source),
            PipelineError::ExhaustedRetries { last, .. } => Some(last),
            _ => None,
        };
        if let Some(source) = source {
            context.insert("collaborator".into(), source.collaborator.clone());
            context.insert("message".into(), source.sanitized_message());
            for (key, value) in source.sanitized_context() {
                context.entry(key).or_insert(value);
            }
        }
        match self {
            PipelineError::InvalidStateTransition {
                session_id, from, ..
            } => {
                context.insert("session_id".into(), session_id.clone());
                context.insert("from".into(), from.clone());
            }
            PipelineError::Cancelled { session_id, .. } => {
                context.insert("session_id".into(), session_id.clone());
            }
            PipelineError::MalformedCommand { reason, .. }
            | PipelineError::StageContract { reason, .. } => {
                context.insert("reason".into(), redact::scrub(reason));
            }
            _ => {}
        }
        context
    }

    /// Generic text safe to show to the user who submitted the question.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::Cancelled { .. } => "The request was cancelled.",
            PipelineError::MalformedCommand { .. } => {
                "The request could not be processed. Please rephrase your question."
            }
            _ => "The request could not be completed. Please try again later.",
        }
    }
}

/// A type alias for results using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(is_retryable(FaultKind::Connection));
        assert!(is_retryable(FaultKind::Timeout));
        assert!(is_retryable(FaultKind::Unavailable));
        assert!(is_retryable(FaultKind::Throttled));
        assert!(!is_retryable(FaultKind::MalformedInput));
        assert!(!is_retryable(FaultKind::PermissionDenied));
        assert!(!is_retryable(FaultKind::DataIntegrity));
        assert!(!is_retryable(FaultKind::InvalidStateTransition));
        assert!(!is_retryable(FaultKind::Configuration));
        assert!(!is_retryable(FaultKind::Internal));
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(
            classify_message("near \"SELEC\": syntax error"),
            FaultKind::MalformedInput
        );
        assert_eq!(
            classify_message("UNIQUE constraint failed: users.email"),
            FaultKind::DataIntegrity
        );
        assert_eq!(
            classify_message("permission denied for relation orders"),
            FaultKind::PermissionDenied
        );
        assert_eq!(classify_message("database is locked"), FaultKind::Unavailable);
        assert_eq!(classify_message("Connection reset by peer"), FaultKind::Connection);
        assert_eq!(classify_message("statement timed out"), FaultKind::Timeout);
        assert_eq!(classify_message("something odd happened"), FaultKind::Unavailable);
    }

    #[test]
    fn test_fatal_markers_win_over_transient() {
        // "connection" appears, but the authentication marker is permanent.
        assert_eq!(
            classify_message("connection refused: authentication failed for user"),
            FaultKind::PermissionDenied
        );
    }

    #[test]
    fn test_collaborator_error_display() {
        let err = CollaboratorError::new(FaultKind::Unavailable, "retriever", "503 from upstream");
        assert_eq!(
            err.to_string(),
            "retriever failed (unavailable): 503 from upstream"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_timeout_constructor() {
        let err = CollaboratorError::timeout("generator", Duration::from_millis(1500));
        assert_eq!(err.kind, FaultKind::Timeout);
        assert_eq!(err.context["timeout_ms"], "1500");
    }

    #[test]
    fn test_exhausted_retries_context_is_sanitized() {
        let last = CollaboratorError::new(
            FaultKind::Connection,
            "storage",
            "could not connect to postgres://app:topsecret@db:5432",
        )
        .with_context("database_url", "postgres://app:topsecret@db:5432")
        .with_context("table", "orders");

        let err = PipelineError::ExhaustedRetries {
            collaborator: "storage".into(),
            command_kind: CommandKind::UseTools,
            attempts_made: 3,
            last,
            history: Vec::new(),
        };

        let context = err.sanitized_context();
        assert_eq!(context["attempts_made"], "3");
        assert_eq!(context["collaborator"], "storage");
        assert_eq!(context["command_kind"], "use_tools");
        assert_eq!(context["database_url"], redact::FILTERED);
        assert_eq!(context["table"], "orders");
        assert!(!context["message"].contains("topsecret"));
        assert_eq!(err.kind(), FaultKind::Connection);
    }

    #[test]
    fn test_user_message_is_generic() {
        let err = PipelineError::Collaborator {
            command_kind: CommandKind::Retrieve,
            source: CollaboratorError::new(
                FaultKind::PermissionDenied,
                "retriever",
                "api_key=abc rejected",
            ),
        };
        assert!(!err.user_message().contains("api_key"));
        assert_eq!(err.kind(), FaultKind::PermissionDenied);
        assert_eq!(err.command_kind(), Some(CommandKind::Retrieve));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = PipelineError::InvalidStateTransition {
            session_id: "s1".into(),
            from: "done".into(),
            to: CommandKind::Retrieve,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition for session s1: done -> retrieve"
        );
        assert_eq!(err.kind(), FaultKind::InvalidStateTransition);
    }
}
