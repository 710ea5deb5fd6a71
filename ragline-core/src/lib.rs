//! # Ragline Core
//!
//! Dispatch engine for multi-stage question answering pipelines.
//! Provides per-session admission control, classification-aware retries,
//! the command/event model, the stage state machine, and the message bus
//! that ties them to external collaborators.

pub mod bus;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod redact;
pub mod retry;
pub mod types;

// Re-export commonly used types at the crate root.
pub use bus::{Dispatch, MessageBus, PipelineOutcome, PipelineReport};
pub use collaborators::{Collaborators, NotificationSink};
pub use command::{Command, CommandKind, Payload};
pub use config::{RaglineConfig, load_config};
pub use error::{CollaboratorError, ConfigError, FaultKind, PipelineError, Result};
pub use event::{Event, EventError, EventKind, EventPayload};
pub use metrics::{BusMetrics, MetricsSnapshot};
pub use pipeline::{SessionCursor, StateMachine};
pub use rate_limit::{
    AdmissionDenied, BucketStore, Decision, LimiterPolicy, Limits, RateLimitHeaders, RateLimiter,
    TokenBucket,
};
pub use retry::{RetryExecutor, RetryPolicies, RetryPolicy};
