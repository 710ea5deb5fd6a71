//! The message bus: admission control, stage dispatch and event delivery.
//!
//! [`MessageBus::handle`] drives a question through every stage using an
//! explicit work queue. [`MessageBus::dispatch`] runs a single stage against
//! a [`SessionCursor`] for callers that want to step the pipeline themselves.
//!
//! For each command the bus, in order:
//! 1. stops if the session was cancelled,
//! 2. rejects commands that are not the cursor's next stage,
//! 3. asks the rate limiter for admission when the command is charged (a
//!    denial becomes an event and hands the command back),
//! 4. runs the stage through the state machine,
//! 5. publishes the stage's events before any later stage starts.
//!
//! A question is charged once, when it enters. Follow-on stages are charged
//! only when the limiter policy says so.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collaborators::{Collaborators, LogSink, NotificationSink};
use crate::command::{Command, CommandKind, Payload};
use crate::config::{PipelineSettings, RaglineConfig};
use crate::error::{ConfigError, PipelineError, Result};
use crate::event::{Event, EventError};
use crate::metrics::BusMetrics;
use crate::pipeline::{SessionCursor, StageContext, StateMachine};
use crate::rate_limit::{AdmissionDenied, BucketStore, Decision, RateLimiter};
use crate::retry::{RetryExecutor, RetryPolicies};

/// Longest the bus waits on a single sink publish before moving on.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of one [`MessageBus::dispatch`].
#[derive(Debug)]
pub enum Dispatch {
    /// The stage ran; `next` is the follow-on command, if any.
    Advanced {
        events: Vec<Event>,
        next: Option<Command>,
    },
    /// Admission was refused. The cursor did not move and `pending` can be
    /// dispatched again once the bucket has room.
    Denied {
        denied: AdmissionDenied,
        pending: Command,
    },
}

/// How a question's pipeline ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Completed { answer: String },
    Rejected { stage: CommandKind, message: String },
    /// Admission was refused before `pending` ran. Pass it to
    /// [`MessageBus::resume`] to continue from that stage.
    RateLimited {
        denied: AdmissionDenied,
        pending: Box<Command>,
    },
}

/// Everything observed while handling one question.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub session_id: String,
    /// Stages that ran, in order.
    pub stages: Vec<CommandKind>,
    pub events: Vec<Event>,
    pub outcome: PipelineOutcome,
}

impl PipelineReport {
    pub fn answer(&self) -> Option<&str> {
        match &self.outcome {
            PipelineOutcome::Completed { answer } => Some(answer),
            _ => None,
        }
    }

    /// The command refused admission, if the pipeline was rate limited.
    pub fn pending(&self) -> Option<&Command> {
        match &self.outcome {
            PipelineOutcome::RateLimited { pending, .. } => Some(pending),
            _ => None,
        }
    }
}

/// Central dispatcher. Cheap to clone; clones share the limiter, metrics and
/// collaborators, so one bus can serve many sessions concurrently.
#[derive(Clone)]
pub struct MessageBus {
    limiter: RateLimiter,
    machine: Arc<StateMachine>,
    collaborators: Collaborators,
    policies: Arc<RetryPolicies>,
    settings: Arc<PipelineSettings>,
    sink: Arc<dyn NotificationSink>,
    publish_timeout: Duration,
    metrics: Arc<BusMetrics>,
}

impl MessageBus {
    pub fn new(limiter: RateLimiter, collaborators: Collaborators) -> Self {
        Self {
            limiter,
            machine: Arc::new(StateMachine::standard()),
            collaborators,
            policies: Arc::new(RetryPolicies::default()),
            settings: Arc::new(PipelineSettings::default()),
            sink: Arc::new(LogSink),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            metrics: Arc::new(BusMetrics::new()),
        }
    }

    /// Build a bus from validated configuration and an existing bucket store.
    pub fn from_config(
        config: &RaglineConfig,
        store: Arc<BucketStore>,
        collaborators: Collaborators,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let limiter = RateLimiter::from_config(&config.rate_limit, store)?;
        Ok(Self::new(limiter, collaborators)
            .with_policies(config.retry.clone())
            .with_settings(config.pipeline.clone()))
    }

    pub fn with_machine(mut self, machine: StateMachine) -> Self {
        self.machine = Arc::new(machine);
        self
    }

    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = Arc::new(policies);
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<BusMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<BusMetrics> {
        &self.metrics
    }

    /// Run `command` and every follow-on command until the pipeline ends.
    ///
    /// Guardrail rejections and rate-limit denials are normal outcomes in the
    /// returned report. Faults are published as a generic failure event and
    /// returned as errors.
    pub async fn handle(&self, command: Command, cancel: &CancellationToken) -> Result<PipelineReport> {
        let cursor = SessionCursor::new(command.session_id());
        self.run(cursor, command, cancel).await
    }

    /// Continue a rate-limited pipeline from the command that was refused.
    ///
    /// Stages before `pending` are not re-run; its payload already carries
    /// their results.
    pub async fn resume(&self, pending: Command, cancel: &CancellationToken) -> Result<PipelineReport> {
        let cursor = SessionCursor::resuming(pending.session_id(), pending.kind());
        self.run(cursor, pending, cancel).await
    }

    async fn run(
        &self,
        mut cursor: SessionCursor,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport> {
        let session_id = command.session_id().to_string();
        let mut queue = VecDeque::from([command]);
        let mut stages = Vec::new();
        let mut events = Vec::new();
        let mut outcome = None;

        while let Some(command) = queue.pop_front() {
            let kind = command.kind();
            let done_answer = match command.payload() {
                Payload::Done { answer, .. } => Some(answer.clone()),
                _ => None,
            };

            match self.dispatch(&mut cursor, command, cancel).await? {
                Dispatch::Denied { denied, pending } => {
                    outcome = Some(PipelineOutcome::RateLimited {
                        denied,
                        pending: Box::new(pending),
                    });
                    break;
                }
                Dispatch::Advanced {
                    events: stage_events,
                    next,
                } => {
                    stages.push(kind);
                    if next.is_none() {
                        outcome = Some(match done_answer {
                            Some(answer) => PipelineOutcome::Completed { answer },
                            None => PipelineOutcome::Rejected {
                                stage: kind,
                                message: stage_events
                                    .iter()
                                    .filter(|e| e.error_ref().is_some())
                                    .map(Event::to_message)
                                    .next_back()
                                    .unwrap_or_default(),
                            },
                        });
                    }
                    events.extend(stage_events);
                    queue.extend(next);
                }
            }
        }

        let outcome = outcome.ok_or_else(|| PipelineError::StageContract {
            command_kind: cursor.last().unwrap_or(CommandKind::Question),
            reason: "pipeline ended without an outcome".into(),
        })?;
        if matches!(outcome, PipelineOutcome::Completed { .. }) {
            self.metrics.record_session_completed();
        }
        info!(
            session_id = %session_id,
            stages = stages.len(),
            outcome = outcome_label(&outcome),
            "Pipeline finished"
        );
        Ok(PipelineReport {
            session_id,
            stages,
            events,
            outcome,
        })
    }

    /// Run one stage of the request tracked by `cursor`.
    pub async fn dispatch(
        &self,
        cursor: &mut SessionCursor,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<Dispatch> {
        match self.try_dispatch(cursor, &command, cancel).await {
            Ok(Step::Advanced { events, next }) => Ok(Dispatch::Advanced { events, next }),
            Ok(Step::Denied(denied)) => Ok(Dispatch::Denied {
                denied,
                pending: command,
            }),
            Err(err) => {
                self.report_fault(&command, &err).await;
                Err(err)
            }
        }
    }

    async fn try_dispatch(
        &self,
        cursor: &mut SessionCursor,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let kind = command.kind();
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                session_id: command.session_id().to_string(),
                stage: kind,
            });
        }
        cursor.check(command)?;

        if self.limiter.policy().charges(kind) {
            if let Decision::Denied(denied) = self.limiter.check(command) {
                self.metrics.record_denied();
                let event = Event::rate_limited(command.session_id(), denied.clone());
                self.publish(&event).await;
                return Ok(Step::Denied(denied));
            }
            self.metrics.record_admitted();
        }

        let executor = RetryExecutor::new()
            .with_cancellation(cancel.clone())
            .with_metrics(Arc::clone(&self.metrics));
        let ctx = StageContext {
            collaborators: &self.collaborators,
            policies: &self.policies,
            settings: &self.settings,
            executor: &executor,
        };
        let output = self.machine.advance(&ctx, command).await?;

        cursor.record(kind, output.next.is_some());
        self.metrics.record_stage_completed();
        if output.next.is_none() && kind.is_guardrail() {
            self.metrics.record_guardrail_rejection();
        }

        for event in &output.events {
            self.publish(event).await;
        }
        Ok(Step::Advanced {
            events: output.events,
            next: output.next,
        })
    }

    /// Hand `event` to the sink, giving up after the publish timeout.
    async fn publish(&self, event: &Event) {
        if tokio::time::timeout(self.publish_timeout, self.sink.publish(event))
            .await
            .is_err()
        {
            warn!(
                session_id = %event.session_id,
                source = %event.source_command_kind,
                timeout_ms = self.publish_timeout.as_millis() as u64,
                "Notification sink timed out, event dropped"
            );
        }
    }

    async fn report_fault(&self, command: &Command, err: &PipelineError) {
        match err {
            PipelineError::Cancelled { .. } => {
                self.metrics.record_cancelled();
                info!(
                    session_id = command.session_id(),
                    command_kind = %command.kind(),
                    "Pipeline cancelled"
                );
            }
            _ => {
                self.metrics.record_fault();
                error!(
                    session_id = command.session_id(),
                    command_kind = %command.kind(),
                    fault_kind = %err.kind(),
                    context = ?err.sanitized_context(),
                    "Pipeline fault"
                );
            }
        }
        let event = Event::error(
            command.session_id(),
            command.kind(),
            EventError::Failed {
                message: err.user_message().to_string(),
                fault: err.kind(),
            },
        );
        self.publish(&event).await;
    }
}

/// What [`MessageBus::try_dispatch`] produced; a denial gets its command back
/// in [`MessageBus::dispatch`].
enum Step {
    Advanced {
        events: Vec<Event>,
        next: Option<Command>,
    },
    Denied(AdmissionDenied),
}

fn outcome_label(outcome: &PipelineOutcome) -> &'static str {
    match outcome {
        PipelineOutcome::Completed { .. } => "completed",
        PipelineOutcome::Rejected { .. } => "rejected",
        PipelineOutcome::RateLimited { .. } => "rate_limited",
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("limiter", &self.limiter)
            .field("machine", &self.machine)
            .field("collaborators", &self.collaborators)
            .finish_non_exhaustive()
    }
}
