//! Terminal rendering of pipeline events.

use async_trait::async_trait;
use ragline_core::{Event, EventKind, NotificationSink};

/// How events are written to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Markdown,
    Sse,
}

/// Where a rendered event goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Prints events as they are published. Progress goes to stderr so that
/// stdout carries only the answer.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleSink {
    format: OutputFormat,
    quiet: bool,
}

impl ConsoleSink {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            quiet: false,
        }
    }

    /// Drop progress notifications.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn render(&self, event: &Event) -> Option<(Stream, String)> {
        match self.format {
            OutputFormat::Sse => Some((Stream::Stdout, event.to_sse())),
            OutputFormat::Text | OutputFormat::Markdown => {
                let text = match self.format {
                    OutputFormat::Markdown => event.to_markdown(),
                    _ => event.to_message(),
                };
                match event.kind {
                    EventKind::Notification if event.is_terminal() => None,
                    EventKind::Notification if self.quiet => None,
                    EventKind::Notification | EventKind::Failure => Some((Stream::Stderr, text)),
                    EventKind::Success => Some((Stream::Stdout, text)),
                }
            }
        }
    }
}

#[async_trait]
impl NotificationSink for ConsoleSink {
    async fn publish(&self, event: &Event) {
        match self.render(event) {
            Some((Stream::Stdout, text)) if self.format == OutputFormat::Sse => print!("{text}"),
            Some((Stream::Stdout, text)) => println!("{text}"),
            Some((Stream::Stderr, text)) => eprintln!("{text}"),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragline_core::types::ToolOutcome;
    use ragline_core::{CommandKind, EventError, EventPayload, FaultKind};

    fn response() -> Event {
        Event::payload(
            "s1",
            CommandKind::LlmResponse,
            EventPayload::Response {
                answer: "Three orders.".into(),
                data: ToolOutcome::default(),
            },
        )
    }

    #[test]
    fn test_text_routes_by_kind() {
        let sink = ConsoleSink::new(OutputFormat::Text);
        assert_eq!(
            sink.render(&response()),
            Some((Stream::Stdout, "Three orders.".to_string()))
        );
        assert_eq!(
            sink.render(&Event::status("s1", CommandKind::Check, "Checking...")),
            Some((Stream::Stderr, "Checking...".to_string()))
        );
        let failed = Event::error(
            "s1",
            CommandKind::Retrieve,
            EventError::Failed {
                message: "The request could not be completed. Please try again later.".into(),
                fault: FaultKind::Unavailable,
            },
        );
        assert_eq!(sink.render(&failed).unwrap().0, Stream::Stderr);
        assert_eq!(
            sink.render(&Event::payload("s1", CommandKind::Done, EventPayload::Completed)),
            None
        );
    }

    #[test]
    fn test_quiet_drops_progress() {
        let sink = ConsoleSink::new(OutputFormat::Text).quiet(true);
        assert!(sink.render(&Event::status("s1", CommandKind::Check, "Checking...")).is_none());
        assert!(sink.render(&response()).is_some());
    }

    #[test]
    fn test_sse_frames_everything() {
        let sink = ConsoleSink::new(OutputFormat::Sse);
        let (stream, frame) = sink
            .render(&Event::payload("s1", CommandKind::Done, EventPayload::Completed))
            .unwrap();
        assert_eq!(stream, Stream::Stdout);
        assert_eq!(frame, "event: end\n\n");
    }
}
