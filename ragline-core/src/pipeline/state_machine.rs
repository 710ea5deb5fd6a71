//! Maps each command kind to its handler and enforces the stage contract.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::stages::{
    CheckStage, DoneStage, EnhanceStage, FinalCheckStage, LlmResponseStage, QuestionStage,
    RerankStage, RetrieveStage, UseToolsStage,
};
use super::{StageContext, StageHandler, StageOutput};
use crate::command::{Command, CommandKind};
use crate::error::{PipelineError, Result};
use crate::event::{Event, EventKind};

/// Dispatches a command to the single handler registered for its kind.
pub struct StateMachine {
    handlers: HashMap<CommandKind, Arc<dyn StageHandler>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::standard()
    }
}

impl StateMachine {
    /// The nine standard stages.
    pub fn standard() -> Self {
        let handlers: [Arc<dyn StageHandler>; 9] = [
            Arc::new(QuestionStage),
            Arc::new(CheckStage),
            Arc::new(RetrieveStage),
            Arc::new(RerankStage),
            Arc::new(EnhanceStage),
            Arc::new(UseToolsStage),
            Arc::new(LlmResponseStage),
            Arc::new(FinalCheckStage),
            Arc::new(DoneStage),
        ];
        Self {
            handlers: handlers.into_iter().map(|h| (h.kind(), h)).collect(),
        }
    }

    /// Replace the handler for `handler.kind()`.
    pub fn with_handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    /// Run `command`'s stage.
    ///
    /// The returned events start with the stage's status update. Every stage
    /// except the guardrails and `Done` must hand off to exactly the next
    /// stage; a guardrail that stops the pipeline must say why with a failure
    /// event.
    pub async fn advance(&self, ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
        let kind = command.kind();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| PipelineError::StageContract {
                command_kind: kind,
                reason: "no handler registered".into(),
            })?;

        debug!(session_id = command.session_id(), command_kind = %kind, "Dispatching stage");
        let mut output = handler.handle(ctx, command).await?;

        if let Some(step) = kind.step_name() {
            output
                .events
                .insert(0, Event::status(command.session_id(), kind, step));
        }

        match &output.next {
            Some(next) => {
                if Some(next.kind()) != kind.next() || next.session_id() != command.session_id() {
                    return Err(PipelineError::StageContract {
                        command_kind: kind,
                        reason: format!("handed off to {} out of order", next.kind()),
                    });
                }
            }
            None if kind.is_terminal() => {}
            None if kind.is_guardrail() => {
                if !output.events.iter().any(|e| e.kind == EventKind::Failure) {
                    return Err(PipelineError::StageContract {
                        command_kind: kind,
                        reason: "stopped without a rejection event".into(),
                    });
                }
            }
            None => {
                return Err(PipelineError::StageContract {
                    command_kind: kind,
                    reason: "produced no follow-on command".into(),
                });
            }
        }
        Ok(output)
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        f.debug_struct("StateMachine")
            .field("handlers", &kinds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::collaborators::mock::offline_collaborators;
    use crate::command::Payload;
    use crate::config::PipelineSettings;
    use crate::event::{EventPayload, Outcome};
    use crate::retry::{RetryExecutor, RetryPolicies};

    struct SkippingRetrieve;

    #[async_trait]
    impl StageHandler for SkippingRetrieve {
        fn kind(&self) -> CommandKind {
            CommandKind::Retrieve
        }

        async fn handle(&self, _ctx: &StageContext<'_>, command: &Command) -> Result<StageOutput> {
            Ok(StageOutput::advance(command.follow(Payload::UseTools {
                enhanced: String::new(),
            })))
        }
    }

    struct SilentCheck;

    #[async_trait]
    impl StageHandler for SilentCheck {
        fn kind(&self) -> CommandKind {
            CommandKind::Check
        }

        async fn handle(&self, _ctx: &StageContext<'_>, _command: &Command) -> Result<StageOutput> {
            Ok(StageOutput::default())
        }
    }

    async fn advance(machine: &StateMachine, command: &Command) -> Result<StageOutput> {
        let collaborators = offline_collaborators();
        let policies = RetryPolicies::default();
        let settings = PipelineSettings::default();
        let executor = RetryExecutor::new();
        let ctx = StageContext {
            collaborators: &collaborators,
            policies: &policies,
            settings: &settings,
            executor: &executor,
        };
        machine.advance(&ctx, command).await
    }

    #[tokio::test]
    async fn test_status_update_comes_first() {
        let machine = StateMachine::standard();
        let question = Command::question("s1", "How many orders?");
        let output = advance(&machine, &question).await.unwrap();

        assert_eq!(output.events.len(), 1);
        assert_eq!(
            output.events[0].outcome,
            Outcome::Payload(EventPayload::StatusUpdate {
                step: "Processing...".into()
            })
        );
        assert_eq!(output.next.unwrap().kind(), CommandKind::Check);
    }

    #[tokio::test]
    async fn test_done_has_no_status_update() {
        let machine = StateMachine::standard();
        let done = Command::new(
            "s1",
            "q",
            Payload::Done {
                answer: "a".into(),
                verdict: crate::types::Verdict::approve(),
            },
        );
        let output = advance(&machine, &done).await.unwrap();
        assert_eq!(output.events.len(), 1);
        assert!(output.events[0].is_terminal());
        assert!(output.next.is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_handoff_is_rejected() {
        let machine = StateMachine::standard().with_handler(Arc::new(SkippingRetrieve));
        let retrieve = Command::new("s1", "q", Payload::Retrieve);
        let err = advance(&machine, &retrieve).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageContract { command_kind: CommandKind::Retrieve, .. }
        ));
    }

    #[tokio::test]
    async fn test_guardrail_must_explain_halt() {
        let machine = StateMachine::standard().with_handler(Arc::new(SilentCheck));
        let check = Command::new("s1", "q", Payload::Check);
        assert!(matches!(
            advance(&machine, &check).await,
            Err(PipelineError::StageContract { .. })
        ));
    }
}
