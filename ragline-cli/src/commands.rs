//! Subcommand handlers and collaborator wiring.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use ragline_core::collaborators::mock::offline_collaborators;
use ragline_core::collaborators::{
    FanoutSink, HttpCollaborator, LogSink, QueuedSink, SqliteStorage, WebhookSink,
};
use ragline_core::config::{load_config, workspace_config_path};
use ragline_core::{
    BucketStore, Collaborators, Command, MessageBus, NotificationSink, PipelineOutcome,
    RaglineConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ConfigAction;
use crate::console::{ConsoleSink, OutputFormat};

/// Exit code for a guardrail rejection.
const EXIT_REJECTED: u8 = 2;
/// Exit code for a rate-limit denial.
const EXIT_RATE_LIMITED: u8 = 3;

/// Webhook events waiting for delivery before new ones are dropped.
const WEBHOOK_QUEUE: usize = 256;

pub async fn ask(
    workspace: &Path,
    session: &str,
    question: &str,
    dry_run: bool,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    let config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let collaborators = build_collaborators(&config, dry_run).await?;
    let (sink, webhook) = build_sink(&config, ConsoleSink::new(format).quiet(quiet));

    let store = Arc::new(BucketStore::new());
    let sweeper = store.spawn_sweeper(
        config.rate_limit.cleanup_interval(),
        config.rate_limit.idle_ttl(),
    );
    let bus = MessageBus::from_config(&config, store, collaborators)?.with_sink(sink);

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = bus.handle(Command::question(session, question), &cancel).await;
    watcher.abort();
    sweeper.shutdown().await;
    if let Some(webhook) = webhook {
        webhook.close().await;
    }
    debug!(metrics = %bus.metrics().snapshot(), "Bus metrics");

    match result {
        Ok(report) => match report.outcome {
            PipelineOutcome::Completed { .. } => Ok(ExitCode::SUCCESS),
            PipelineOutcome::Rejected { .. } => Ok(ExitCode::from(EXIT_REJECTED)),
            PipelineOutcome::RateLimited { denied, .. } => {
                for (name, value) in denied.headers().to_pairs() {
                    eprintln!("{name}: {value}");
                }
                Ok(ExitCode::from(EXIT_RATE_LIMITED))
            }
        },
        // The bus has already published the user-facing failure message.
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

/// Collaborators from configuration, or the offline set for dry runs.
/// A configured SQLite database is attached in both cases.
pub async fn build_collaborators(
    config: &RaglineConfig,
    dry_run: bool,
) -> anyhow::Result<Collaborators> {
    let mut collaborators = if dry_run {
        offline_collaborators()
    } else {
        let http = config.collaborators.http.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "No collaborator API configured. Add [collaborators.http] to .ragline/config.toml or pass --dry-run."
            )
        })?;
        let client = HttpCollaborator::from_config(http)?;
        match client.refresh_catalog().await {
            Ok(count) => info!(tools = count, "Loaded tool catalog"),
            Err(e) => warn!(error = %e, "Tool catalog unavailable, continuing without adapter tools"),
        }
        Collaborators::from_http(Arc::new(client))
    };

    if let Some(storage) = &config.collaborators.storage {
        collaborators = collaborators.with_storage(Arc::new(SqliteStorage::from_config(storage)));
    }
    Ok(collaborators)
}

/// Console output plus logging, and the webhook when one is configured.
///
/// The webhook is delivered from a background queue; the returned handle must
/// be closed before exit so queued events are not lost.
pub fn build_sink(
    config: &RaglineConfig,
    console: ConsoleSink,
) -> (Arc<dyn NotificationSink>, Option<Arc<QueuedSink>>) {
    let mut fanout = FanoutSink::new()
        .with(Arc::new(console))
        .with(Arc::new(LogSink));
    let webhook = config.collaborators.webhook.as_ref().map(|webhook| {
        let sink = WebhookSink::new(&webhook.url).with_progress(webhook.include_progress);
        Arc::new(QueuedSink::spawn(Arc::new(sink), WEBHOOK_QUEUE))
    });
    if let Some(queued) = &webhook {
        fanout = fanout.with(queued.clone());
    }
    (Arc::new(fanout), webhook)
}

pub fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&config_path, RaglineConfig::default().to_toml()?)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigAction::Check => {
            let config = load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            config.validate()?;
            println!(
                "Configuration OK (rate limiting {}, {} per-command override(s))",
                if config.rate_limit.enabled { "enabled" } else { "disabled" },
                config.rate_limit.per_command.len()
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragline_core::config::{StorageConfig, WebhookConfig};

    #[tokio::test]
    async fn test_live_run_requires_http_config() {
        let err = build_collaborators(&RaglineConfig::default(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--dry-run"));
    }

    #[tokio::test]
    async fn test_dry_run_attaches_configured_storage() {
        let mut config = RaglineConfig::default();
        let offline = build_collaborators(&config, true).await.unwrap();
        assert!(offline.storage.is_none());

        config.collaborators.storage = Some(StorageConfig {
            path: "shop.db".into(),
            read_only: true,
        });
        let with_storage = build_collaborators(&config, true).await.unwrap();
        assert!(with_storage.storage.is_some());
    }

    #[tokio::test]
    async fn test_webhook_is_queued_only_when_configured() {
        let mut config = RaglineConfig::default();
        let (_, webhook) = build_sink(&config, ConsoleSink::new(OutputFormat::Text).quiet(true));
        assert!(webhook.is_none());

        config.collaborators.webhook = Some(WebhookConfig {
            url: "http://127.0.0.1:1/hook".into(),
            include_progress: false,
        });
        let (_, webhook) = build_sink(&config, ConsoleSink::new(OutputFormat::Text).quiet(true));
        let webhook = webhook.unwrap();
        webhook.close().await;
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        handle_config(ConfigAction::Init, dir.path()).unwrap();
        let path = workspace_config_path(dir.path());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[rate_limit"));

        std::fs::write(&path, "# edited\n").unwrap();
        handle_config(ConfigAction::Init, dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# edited\n");
    }

    #[test]
    fn test_config_check_rejects_unknown_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = workspace_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "[rate_limit.per_command.summarize]\ncapacity = 5\nrefill_rate = 1.0\n",
        )
        .unwrap();
        assert!(handle_config(ConfigAction::Check, dir.path()).is_err());
    }
}
