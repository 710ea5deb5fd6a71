//! The staged question pipeline: per-stage handlers and the state machine
//! that sequences them.

mod stages;
mod state_machine;

use std::future::Future;

use async_trait::async_trait;

use crate::collaborators::Collaborators;
use crate::command::{Command, CommandKind};
use crate::config::PipelineSettings;
use crate::error::{CollaboratorError, PipelineError, Result};
use crate::event::Event;
use crate::retry::{RetryExecutor, RetryPolicies, RetryPolicy};

pub use stages::{
    CheckStage, DESCRIBE_DATABASE, DoneStage, EnhanceStage, FinalCheckStage, LlmResponseStage,
    QUERY_DATABASE, QuestionStage, RerankStage, RetrieveStage, UseToolsStage, storage_tools,
};
pub use state_machine::StateMachine;

/// Everything a stage handler may use while running one command.
pub struct StageContext<'a> {
    pub collaborators: &'a Collaborators,
    pub policies: &'a RetryPolicies,
    pub settings: &'a PipelineSettings,
    pub executor: &'a RetryExecutor,
}

impl StageContext<'_> {
    /// Run a collaborator call for `command` under `policy`, converting the
    /// final failure into a pipeline fault tagged with the command's stage.
    pub async fn call<T, F, Fut>(
        &self,
        command: &Command,
        collaborator: &str,
        policy: &RetryPolicy,
        work: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CollaboratorError>>,
    {
        self.executor
            .execute(collaborator, policy, work)
            .await
            .map_err(|e| e.into_pipeline(command.kind(), command.session_id()))
    }
}

/// What a stage produced: events to publish and at most one follow-on command.
#[derive(Debug, Default)]
pub struct StageOutput {
    pub events: Vec<Event>,
    pub next: Option<Command>,
}

impl StageOutput {
    pub fn advance(next: Command) -> Self {
        Self {
            events: Vec::new(),
            next: Some(next),
        }
    }

    /// End the session with `event` and no follow-on command.
    pub fn halt(event: Event) -> Self {
        Self {
            events: vec![event],
            next: None,
        }
    }

    pub fn with_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }
}

/// Handler for exactly one [`CommandKind`].
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn kind(&self) -> CommandKind;

    async fn handle(&self, ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput>;
}

/// Position of one request in the stage sequence.
///
/// The last accepted command kind is the whole of a request's state; there is
/// no other session object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCursor {
    session_id: String,
    last: Option<CommandKind>,
    terminated: bool,
}

impl SessionCursor {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last: None,
            terminated: false,
        }
    }

    /// A cursor that accepts `kind` next, for continuing a request whose
    /// earlier stages already ran.
    pub fn resuming(session_id: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            session_id: session_id.into(),
            last: kind.previous(),
            terminated: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn last(&self) -> Option<CommandKind> {
        self.last
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// The only kind this cursor will accept next.
    pub fn expected(&self) -> Option<CommandKind> {
        if self.terminated {
            return None;
        }
        match self.last {
            None => Some(CommandKind::Question),
            Some(kind) => kind.next(),
        }
    }

    /// Reject `command` unless it is the next stage of this request.
    pub fn check(&self, command: &Command) -> Result<()> {
        let from = || match (self.last, self.terminated) {
            (None, _) => "start".to_string(),
            (Some(kind), true) => format!("{kind} (terminated)"),
            (Some(kind), false) => kind.to_string(),
        };
        if command.session_id() != self.session_id {
            return Err(PipelineError::InvalidStateTransition {
                session_id: command.session_id().to_string(),
                from: format!("session {}", self.session_id),
                to: command.kind(),
            });
        }
        if self.expected() != Some(command.kind()) {
            return Err(PipelineError::InvalidStateTransition {
                session_id: self.session_id.clone(),
                from: from(),
                to: command.kind(),
            });
        }
        Ok(())
    }

    /// Record that `kind` ran and whether it handed off to another stage.
    pub fn record(&mut self, kind: CommandKind, has_next: bool) {
        self.last = Some(kind);
        self.terminated = !has_next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Payload;

    #[test]
    fn test_resuming_cursor_expects_the_given_stage() {
        let cursor = SessionCursor::resuming("s1", CommandKind::Rerank);
        assert_eq!(cursor.last(), Some(CommandKind::Retrieve));
        assert_eq!(cursor.expected(), Some(CommandKind::Rerank));

        let fresh = SessionCursor::resuming("s1", CommandKind::Question);
        assert_eq!(fresh.last(), None);
        assert_eq!(fresh.expected(), Some(CommandKind::Question));
    }

    #[test]
    fn test_cursor_accepts_only_next_stage() {
        let question = Command::question("s1", "q");
        let check = question.follow(Payload::Check);
        let retrieve = check.follow(Payload::Retrieve);

        let mut cursor = SessionCursor::new("s1");
        assert!(cursor.check(&check).is_err());
        assert!(cursor.check(&question).is_ok());
        cursor.record(CommandKind::Question, true);

        assert!(matches!(
            cursor.check(&retrieve),
            Err(PipelineError::InvalidStateTransition { to: CommandKind::Retrieve, .. })
        ));
        assert!(cursor.check(&check).is_ok());
    }

    #[test]
    fn test_cursor_rejects_after_termination() {
        let question = Command::question("s1", "q");
        let check = question.follow(Payload::Check);
        let retrieve = check.follow(Payload::Retrieve);

        let mut cursor = SessionCursor::new("s1");
        cursor.record(CommandKind::Question, true);
        cursor.record(CommandKind::Check, false);
        assert!(cursor.is_terminated());
        assert_eq!(cursor.expected(), None);

        match cursor.check(&retrieve) {
            Err(PipelineError::InvalidStateTransition { from, .. }) => {
                assert_eq!(from, "check (terminated)");
            }
            other => panic!("expected InvalidStateTransition, got {other:?}"),
        }
    }

    #[test]
    fn test_cursor_rejects_foreign_session() {
        let cursor = SessionCursor::new("s1");
        assert!(cursor.check(&Command::question("s2", "q")).is_err());
    }
}
