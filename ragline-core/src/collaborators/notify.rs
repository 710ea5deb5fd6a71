//! Notification sinks. None of them report delivery failures to the bus.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::NotificationSink;
use crate::event::{Event, EventKind};
use crate::redact::{ContextRedactor, SharedRedactor};

/// Writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn publish(&self, event: &Event) {
        match event.kind {
            EventKind::Failure => warn!(
                session_id = %event.session_id,
                source = %event.source_command_kind,
                message = %event.to_message(),
                "Pipeline event"
            ),
            EventKind::Success => info!(
                session_id = %event.session_id,
                source = %event.source_command_kind,
                "Pipeline produced a result"
            ),
            EventKind::Notification => debug!(
                session_id = %event.session_id,
                source = %event.source_command_kind,
                message = %event.to_message(),
                "Pipeline event"
            ),
        }
    }
}

/// Fans events out to in-process subscribers (websocket or SSE handlers).
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn publish(&self, event: &Event) {
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
    }
}

/// Posts `{"text": ...}` to a Slack-compatible incoming webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    redactor: SharedRedactor,
    /// Also deliver progress notifications.
    include_progress: bool,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            redactor: Arc::new(ContextRedactor),
            include_progress: false,
        }
    }

    pub fn with_redactor(mut self, redactor: SharedRedactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn with_progress(mut self, include: bool) -> Self {
        self.include_progress = include;
        self
    }
}

impl std::fmt::Debug for WebhookSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSink")
            .field("include_progress", &self.include_progress)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn publish(&self, event: &Event) {
        if event.kind == EventKind::Notification && !self.include_progress {
            return;
        }
        let text = self.redactor.redact(&event.to_message());
        let body = serde_json::json!({ "text": text });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(
                session_id = %event.session_id,
                status = resp.status().as_u16(),
                "Webhook rejected notification"
            ),
            Err(e) => warn!(
                session_id = %event.session_id,
                error = %e.without_url(),
                "Webhook delivery failed"
            ),
        }
    }
}

/// Publishes to several sinks concurrently.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn publish(&self, event: &Event) {
        futures::future::join_all(self.sinks.iter().map(|s| s.publish(event))).await;
    }
}

/// Delivers to an inner sink from a background task, in publish order.
///
/// `publish` only enqueues, so a slow inner sink (a webhook behind a flaky
/// network) never holds up the pipeline. When the queue is full the event is
/// dropped with a warning.
pub struct QueuedSink {
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedSink {
    /// Start the delivery task. Must be called from within a tokio runtime.
    pub fn spawn(inner: Arc<dyn NotificationSink>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Event>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                inner.publish(&event).await;
            }
        });
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Stop accepting events and wait until the queued ones are delivered.
    pub async fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl std::fmt::Debug for QueuedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("QueuedSink").field("open", &open).finish_non_exhaustive()
    }
}

#[async_trait]
impl NotificationSink for QueuedSink {
    async fn publish(&self, event: &Event) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            debug!(session_id = %event.session_id, "Notification queue closed, dropping event");
            return;
        };
        match sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!(
                session_id = %event.session_id,
                source = %event.source_command_kind,
                "Notification queue full, dropping event"
            ),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events().iter().map(Event::to_message).collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
