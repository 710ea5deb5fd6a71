//! Integration tests for the Ragline message bus.
//!
//! These tests drive whole questions through the bus using the in-memory
//! collaborators, verifying stage ordering, guardrail short-circuits,
//! retry behavior, admission control, and cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ragline_core::collaborators::mock::{
    FailurePlan, Flaky, MemoryStorage, ScriptedGenerator, StaticGuardrail,
    StaticRetriever, StaticTools, offline_collaborators, sample_documents,
};
use ragline_core::collaborators::{Collaborators, QueuedSink, RecordingSink, SqliteStorage};
use ragline_core::pipeline::{DESCRIBE_DATABASE, QUERY_DATABASE};
use ragline_core::types::{Column, ResultSet, Row, Schema, Table, ToolCall, ToolSpec};
use ragline_core::{
    BucketStore, Command, CommandKind, Dispatch, Event, EventError, EventPayload, FaultKind,
    LimiterPolicy, Limits, MessageBus, NotificationSink, Payload, PipelineError, PipelineOutcome,
    RateLimiter, RetryPolicies, RetryPolicy, SessionCursor,
};

const GENEROUS: Limits = Limits {
    capacity: 1_000,
    refill_rate: 100.0,
};

/// Helper to create a bus with a recording sink.
fn create_bus(collaborators: Collaborators, limits: Limits) -> (MessageBus, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let limiter = RateLimiter::new(LimiterPolicy::new(limits), Arc::new(BucketStore::new()));
    let bus = MessageBus::new(limiter, collaborators).with_sink(sink.clone());
    (bus, sink)
}

fn status_steps(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e.payload_ref() {
            Some(EventPayload::StatusUpdate { step }) => Some(step.clone()),
            _ => None,
        })
        .collect()
}

// --- Ordering ---

#[tokio::test]
async fn test_stages_run_in_order() {
    let (bus, sink) = create_bus(offline_collaborators(), GENEROUS);
    let report = bus
        .handle(
            Command::question("s1", "Which table stores orders?"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.stages, CommandKind::ALL.to_vec());
    assert_eq!(
        status_steps(&sink.events()),
        vec![
            "Processing...",
            "Checking...",
            "Retrieving...",
            "Enhancing...",
            "Finetuning...",
            "Answering...",
            "Finalizing...",
            "Evaluating...",
        ]
    );

    // The answer is announced before it is evaluated, and completion is last.
    let events = sink.events();
    let response = events
        .iter()
        .position(|e| matches!(e.payload_ref(), Some(EventPayload::Response { .. })))
        .unwrap();
    let evaluation = events
        .iter()
        .position(|e| matches!(e.payload_ref(), Some(EventPayload::Evaluation { .. })))
        .unwrap();
    assert!(response < evaluation);
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(
        report.outcome,
        PipelineOutcome::Completed {
            answer: "No data was needed to answer: Which table stores orders?".into()
        }
    );
}

// --- Guardrails ---

#[tokio::test]
async fn test_input_guardrail_short_circuits() {
    let mut collaborators = offline_collaborators();
    collaborators.guardrail = Arc::new(StaticGuardrail::approve_all().blocking("weather"));
    let (bus, sink) = create_bus(collaborators, GENEROUS);

    let report = bus
        .handle(
            Command::question("s1", "What's the weather tomorrow?"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.stages, vec![CommandKind::Question, CommandKind::Check]);
    assert!(matches!(
        report.outcome,
        PipelineOutcome::Rejected {
            stage: CommandKind::Check,
            ..
        }
    ));
    assert!(!status_steps(&sink.events()).contains(&"Retrieving...".to_string()));
    assert!(matches!(
        sink.events().last().unwrap().error_ref(),
        Some(EventError::RejectedRequest { .. })
    ));
    assert_eq!(bus.metrics().snapshot().guardrail_rejections, 1);
}

#[tokio::test]
async fn test_final_check_rejection_ends_session() {
    let mut collaborators = offline_collaborators();
    collaborators.guardrail =
        Arc::new(StaticGuardrail::approve_all().rejecting_answers("Unsupported by the data."));
    let (bus, sink) = create_bus(collaborators, GENEROUS);

    let report = bus
        .handle(Command::question("s1", "How many refunds?"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.stages.last(), Some(&CommandKind::FinalCheck));
    assert_eq!(
        report.outcome,
        PipelineOutcome::Rejected {
            stage: CommandKind::FinalCheck,
            message: "Unsupported by the data.".into(),
        }
    );
    // The answer was still streamed before it was rejected.
    assert!(
        sink.events()
            .iter()
            .any(|e| matches!(e.payload_ref(), Some(EventPayload::Response { .. })))
    );
}

// --- Retry ---

#[tokio::test(start_paused = true)]
async fn test_flaky_retriever_recovers() {
    let retriever = Flaky::new(
        StaticRetriever::new(sample_documents()),
        FailurePlan::fail_times(2, FaultKind::Connection),
    );
    let plan = retriever.plan();
    let mut collaborators = offline_collaborators();
    collaborators.retriever = Arc::new(retriever);
    let (bus, _sink) = create_bus(collaborators, GENEROUS);

    let report = bus
        .handle(Command::question("s1", "orders"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.answer().is_some());
    assert_eq!(plan.calls(), 3);
    assert_eq!(bus.metrics().snapshot().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_publish_generic_failure() {
    let retriever = Flaky::new(
        StaticRetriever::new(sample_documents()),
        FailurePlan::always(FaultKind::Unavailable),
    );
    let plan = retriever.plan();
    let mut collaborators = offline_collaborators();
    collaborators.retriever = Arc::new(retriever);
    let (bus, sink) = create_bus(collaborators, GENEROUS);

    let err = bus
        .handle(Command::question("s1", "orders"), &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        PipelineError::ExhaustedRetries {
            collaborator,
            command_kind,
            attempts_made,
            history,
            ..
        } => {
            assert_eq!(collaborator, "retriever");
            assert_eq!(*command_kind, CommandKind::Retrieve);
            assert_eq!(*attempts_made, 3);
            assert_eq!(history.len(), 2);
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(plan.calls(), 3);

    let last = sink.events().pop().unwrap();
    match last.error_ref() {
        Some(EventError::Failed { message, fault }) => {
            assert_eq!(*fault, FaultKind::Unavailable);
            assert!(!message.contains("scripted"));
        }
        other => panic!("expected failure event, got {other:?}"),
    }
    assert_eq!(bus.metrics().snapshot().faults, 1);
}

#[tokio::test]
async fn test_fatal_fault_is_not_retried() {
    let generator = Flaky::new(
        ScriptedGenerator::new(),
        FailurePlan::always(FaultKind::PermissionDenied),
    );
    let plan = generator.plan();
    let mut collaborators = offline_collaborators();
    collaborators.generator = Arc::new(generator);
    let (bus, _sink) = create_bus(collaborators, GENEROUS);

    let err = bus
        .handle(Command::question("s1", "orders"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FaultKind::PermissionDenied);
    assert_eq!(err.command_kind(), Some(CommandKind::Enhance));
    assert_eq!(plan.calls(), 1);
}

// --- Admission control ---

#[tokio::test]
async fn test_third_question_is_denied() {
    let (bus, sink) = create_bus(
        offline_collaborators(),
        Limits {
            capacity: 2,
            refill_rate: 0.0,
        },
    );
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let report = bus.handle(Command::question("s1", "orders"), &cancel).await.unwrap();
        assert!(report.answer().is_some());
    }
    let report = bus.handle(Command::question("s1", "orders"), &cancel).await.unwrap();

    match &report.outcome {
        PipelineOutcome::RateLimited { denied, pending } => {
            assert_eq!(pending.kind(), CommandKind::Question);
            assert_eq!(denied.limit, 2);
            assert_eq!(denied.remaining, 0);
            assert_eq!(denied.command_kind, CommandKind::Question);
            assert!(denied.retry_after.as_secs() >= 60 * 60);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert!(report.stages.is_empty());
    let snap = bus.metrics().snapshot();
    assert_eq!(snap.denied, 1);
    assert_eq!(snap.admitted, 2);
    assert_eq!(snap.sessions_completed, 2);
    assert!(
        sink.messages()
            .last()
            .unwrap()
            .starts_with("Rate limit exceeded.")
    );

    // Another session is unaffected.
    let other = bus.handle(Command::question("s2", "orders"), &cancel).await.unwrap();
    assert!(other.answer().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_bucket_refills_over_time() {
    let (bus, _sink) = create_bus(
        offline_collaborators(),
        Limits {
            capacity: 1,
            refill_rate: 1.0,
        },
    );
    let cancel = CancellationToken::new();

    let first = bus.handle(Command::question("s1", "orders"), &cancel).await.unwrap();
    assert!(first.answer().is_some());
    let second = bus.handle(Command::question("s1", "orders"), &cancel).await.unwrap();
    assert!(matches!(second.outcome, PipelineOutcome::RateLimited { .. }));

    tokio::time::advance(std::time::Duration::from_secs(1)).await;
    let third = bus.handle(Command::question("s1", "orders"), &cancel).await.unwrap();
    assert!(third.answer().is_some());
}

#[tokio::test]
async fn test_concurrent_sessions_are_independent() {
    let (bus, _sink) = create_bus(
        offline_collaborators(),
        Limits {
            capacity: 1,
            refill_rate: 0.0,
        },
    );
    let cancel = CancellationToken::new();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                bus.handle(Command::question(format!("session-{i}"), "orders"), &cancel)
                    .await
            })
        })
        .collect();

    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.stages.len(), 9);
        assert!(report.answer().is_some());
    }
    assert_eq!(bus.limiter().store().len(), 8);
    assert_eq!(bus.metrics().snapshot().sessions_completed, 8);
}

#[tokio::test]
async fn test_denied_stage_resumes_with_its_payload() {
    // Reranking has its own one-token bucket; everything else is generous.
    let policy = LimiterPolicy::new(GENEROUS).with_override(
        CommandKind::Rerank,
        Limits {
            capacity: 1,
            refill_rate: 0.0,
        },
    );
    let sink = Arc::new(RecordingSink::new());
    let limiter = RateLimiter::new(policy, Arc::new(BucketStore::new()));
    let bus = MessageBus::new(limiter, offline_collaborators()).with_sink(sink.clone());
    let cancel = CancellationToken::new();

    let first = bus.handle(Command::question("s1", "orders"), &cancel).await.unwrap();
    assert!(first.answer().is_some());

    let second = bus.handle(Command::question("s1", "orders"), &cancel).await.unwrap();
    assert_eq!(
        second.stages,
        vec![CommandKind::Question, CommandKind::Check, CommandKind::Retrieve]
    );
    let pending = second.pending().cloned().unwrap();
    assert_eq!(pending.kind(), CommandKind::Rerank);
    match pending.payload() {
        Payload::Rerank { candidates } => assert!(!candidates.is_empty()),
        other => panic!("expected rerank payload, got {other:?}"),
    }

    bus.limiter().reset("s1");
    let resumed = bus.resume(pending, &cancel).await.unwrap();
    assert_eq!(resumed.stages, CommandKind::ALL[3..].to_vec());
    assert!(resumed.answer().is_some());
    // Retrieval did not run again.
    assert_eq!(
        status_steps(&resumed.events).first().map(String::as_str),
        Some("Enhancing...")
    );
}

/// Takes a long time to accept every event, like a webhook behind a slow link.
struct SlowSink {
    delay: std::time::Duration,
    inner: RecordingSink,
}

#[async_trait]
impl NotificationSink for SlowSink {
    async fn publish(&self, event: &Event) {
        tokio::time::sleep(self.delay).await;
        self.inner.publish(event).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_sink_does_not_delay_stages() {
    let slow = Arc::new(SlowSink {
        delay: std::time::Duration::from_secs(10),
        inner: RecordingSink::new(),
    });
    let queued = Arc::new(QueuedSink::spawn(slow.clone(), 64));
    let limiter = RateLimiter::new(LimiterPolicy::new(GENEROUS), Arc::new(BucketStore::new()));
    let bus = MessageBus::new(limiter, offline_collaborators()).with_sink(queued.clone());

    let start = tokio::time::Instant::now();
    let report = bus
        .handle(Command::question("s1", "orders"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.answer().is_some());
    assert!(start.elapsed() < std::time::Duration::from_secs(1));

    queued.close().await;
    assert_eq!(slow.inner.events(), report.events);
}

// --- State transitions ---

#[tokio::test]
async fn test_dispatch_after_done_is_rejected() {
    let (bus, _sink) = create_bus(offline_collaborators(), GENEROUS);
    let cancel = CancellationToken::new();
    let mut cursor = SessionCursor::new("s1");

    let mut command = Command::question("s1", "orders");
    loop {
        match bus.dispatch(&mut cursor, command.clone(), &cancel).await.unwrap() {
            Dispatch::Advanced { next: Some(next), .. } => command = next,
            Dispatch::Advanced { next: None, .. } => break,
            Dispatch::Denied { denied, .. } => panic!("unexpected denial {denied:?}"),
        }
    }
    assert!(cursor.is_terminated());

    let err = bus
        .dispatch(&mut cursor, Command::question("s1", "again"), &cancel)
        .await
        .unwrap_err();
    match err {
        PipelineError::InvalidStateTransition { from, to, .. } => {
            assert_eq!(from, "done (terminated)");
            assert_eq!(to, CommandKind::Question);
        }
        other => panic!("expected invalid transition, got {other:?}"),
    }
}

#[tokio::test]
async fn test_skipping_a_stage_is_rejected() {
    let (bus, _sink) = create_bus(offline_collaborators(), GENEROUS);
    let cancel = CancellationToken::new();
    let mut cursor = SessionCursor::new("s1");
    let question = Command::question("s1", "orders");
    bus.dispatch(&mut cursor, question.clone(), &cancel).await.unwrap();

    let skip = question.follow(ragline_core::Payload::Retrieve);
    let err = bus.dispatch(&mut cursor, skip, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::InvalidStateTransition);
    assert_eq!(cursor.last(), Some(CommandKind::Question));
}

// --- Cancellation ---

/// Cancels the session once a given step is announced.
struct CancelOnStep {
    step: &'static str,
    token: CancellationToken,
}

#[async_trait]
impl NotificationSink for CancelOnStep {
    async fn publish(&self, event: &Event) {
        if let Some(EventPayload::StatusUpdate { step }) = event.payload_ref()
            && step.as_str() == self.step
        {
            self.token.cancel();
        }
    }
}

#[tokio::test]
async fn test_cancellation_stops_before_next_stage() {
    let cancel = CancellationToken::new();
    let sink = Arc::new(CancelOnStep {
        step: "Retrieving...",
        token: cancel.clone(),
    });
    let limiter = RateLimiter::new(LimiterPolicy::new(GENEROUS), Arc::new(BucketStore::new()));
    let bus = MessageBus::new(limiter, offline_collaborators()).with_sink(sink);

    let err = bus
        .handle(Command::question("s1", "orders"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: CommandKind::Rerank,
            ..
        }
    ));
    assert_eq!(err.user_message(), "The request was cancelled.");
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_backoff() {
    let retriever = Flaky::new(
        StaticRetriever::new(sample_documents()),
        FailurePlan::always(FaultKind::Timeout),
    );
    let plan = retriever.plan();
    let mut collaborators = offline_collaborators();
    collaborators.retriever = Arc::new(retriever);
    let (bus, _sink) = create_bus(collaborators, GENEROUS);
    let bus =
        bus.with_policies(RetryPolicies::uniform(RetryPolicy::retrieval().with_jitter(false)));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = bus
        .handle(Command::question("s1", "orders"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(plan.calls(), 1);
    assert_eq!(err.command_kind(), Some(CommandKind::Retrieve));
}

// --- Tools and storage ---

fn orders_schema() -> Schema {
    Schema {
        tables: vec![Table {
            name: "orders".into(),
            columns: vec![
                Column {
                    name: "id".into(),
                    data_type: "INTEGER".into(),
                    nullable: false,
                    primary_key: true,
                },
                Column {
                    name: "total".into(),
                    data_type: "REAL".into(),
                    nullable: true,
                    primary_key: false,
                },
            ],
        }],
        relationships: Vec::new(),
    }
}

#[tokio::test]
async fn test_storage_tools_feed_the_answer() {
    let mut row = Row::new();
    row.insert("total".into(), json!(3));
    let storage = MemoryStorage::new(orders_schema()).with_result(
        "SELECT COUNT(*) AS total FROM orders",
        ResultSet {
            columns: vec!["total".into()],
            rows: vec![row],
        },
    );
    let mut collaborators = offline_collaborators().with_storage(Arc::new(storage));
    collaborators.generator = Arc::new(
        ScriptedGenerator::new()
            .with_tool_call(ToolCall::new(DESCRIBE_DATABASE, json!({})))
            .with_tool_call(ToolCall::new(
                QUERY_DATABASE,
                json!({"statement": "SELECT COUNT(*) AS total FROM orders"}),
            )),
    );
    let (bus, _sink) = create_bus(collaborators, GENEROUS);

    let report = bus
        .handle(Command::question("s1", "How many orders?"), &CancellationToken::new())
        .await
        .unwrap();

    let answer = report.answer().unwrap();
    assert!(answer.contains("describe_database: orders(id, total)"));
    assert!(answer.contains("query_database: total\n3"));
}

#[tokio::test]
async fn test_adapter_tools_are_offered_and_invoked() {
    let tools = StaticTools::new().with_tool(
        ToolSpec::new("exchange_rate", "Current EUR/USD rate"),
        json!("1.08"),
    );
    let mut collaborators = offline_collaborators().with_tools(Arc::new(tools));
    collaborators.generator = Arc::new(
        ScriptedGenerator::new().with_tool_call(ToolCall::new("exchange_rate", json!({}))),
    );
    let (bus, _sink) = create_bus(collaborators, GENEROUS);

    let report = bus
        .handle(Command::question("s1", "EUR to USD?"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.answer(), Some("Based on exchange_rate: 1.08"));
}

#[tokio::test]
async fn test_sqlite_storage_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shop.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL);
             INSERT INTO orders (total) VALUES (10.0), (12.5), (7.25);",
        )
        .unwrap();
    }

    let mut collaborators =
        offline_collaborators().with_storage(Arc::new(SqliteStorage::new(&path, true)));
    collaborators.generator = Arc::new(ScriptedGenerator::new().with_tool_call(ToolCall::new(
        QUERY_DATABASE,
        json!({"statement": "SELECT COUNT(*) AS total FROM orders"}),
    )));
    let (bus, _sink) = create_bus(collaborators, GENEROUS);

    let report = bus
        .handle(Command::question("s1", "How many orders?"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.answer(), Some("Based on query_database: total\n3"));
}

#[tokio::test]
async fn test_bad_sql_is_a_fatal_fault() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.db");
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch("CREATE TABLE customers (id INTEGER PRIMARY KEY);")
        .unwrap();

    let mut collaborators =
        offline_collaborators().with_storage(Arc::new(SqliteStorage::new(&path, true)));
    collaborators.generator = Arc::new(ScriptedGenerator::new().with_tool_call(ToolCall::new(
        QUERY_DATABASE,
        json!({"statement": "SELECT * FROM missing"}),
    )));
    let (bus, _sink) = create_bus(collaborators, GENEROUS);

    let err = bus
        .handle(Command::question("s1", "orders"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::MalformedInput);
    assert_eq!(err.command_kind(), Some(CommandKind::UseTools));
    assert_eq!(err.attempts_made(), Some(1));
}
