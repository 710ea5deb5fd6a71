//! Configuration system for Ragline.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment variables -> explicit overrides.
//! The loaded value is a read-only snapshot; nothing reloads it at runtime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::collaborators::HttpPaths;
use crate::error::ConfigError;
use crate::rate_limit::{LimiterPolicy, Limits};
use crate::retry::RetryPolicies;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaglineConfig {
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicies,
    pub pipeline: PipelineSettings,
    pub collaborators: CollaboratorsConfig,
}

/// Admission control settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default: Limits,
    /// Overrides keyed by command kind name (`use_tools`, `LLMResponse`, ...).
    /// Each override gets its own bucket per session.
    pub per_command: BTreeMap<String, Limits>,
    /// Charge every pipeline stage instead of once per question.
    pub charge_every_stage: bool,
    pub cleanup_interval_secs: u64,
    pub idle_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: Limits::default(),
            per_command: BTreeMap::new(),
            charge_every_stage: false,
            cleanup_interval_secs: 300,
            idle_ttl_secs: 300,
        }
    }
}

impl RateLimitConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// Per-stage sizing knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Candidates requested from the retriever.
    pub retrieval_limit: usize,
    /// Documents kept after reranking.
    pub rerank_top_n: usize,
    /// Upper bound on tool calls per question.
    pub max_tool_calls: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retrieval_limit: 20,
            rerank_top_n: 5,
            max_tool_calls: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorsConfig {
    pub http: Option<HttpConfig>,
    pub storage: Option<StorageConfig>,
    pub webhook: Option<WebhookConfig>,
}

/// Remote JSON API serving retrieval, ranking, generation, guardrails and tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub base_url: String,
    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub paths: HttpPaths,
}

fn default_http_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub read_only: bool,
}

fn default_true() -> bool {
    true
}

/// Slack-compatible incoming webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub include_progress: bool,
}

impl RaglineConfig {
    /// Check every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        LimiterPolicy::from_config(&self.rate_limit)?;
        if self.rate_limit.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "rate_limit.cleanup_interval_secs must be positive".into(),
            });
        }
        if self.rate_limit.idle_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "rate_limit.idle_ttl_secs must be positive".into(),
            });
        }
        self.retry.validate()?;

        let pipeline = &self.pipeline;
        if pipeline.retrieval_limit == 0 || pipeline.rerank_top_n == 0 {
            return Err(ConfigError::Invalid {
                message: "pipeline.retrieval_limit and pipeline.rerank_top_n must be positive"
                    .into(),
            });
        }
        if let Some(http) = &self.collaborators.http {
            if !(http.base_url.starts_with("http://") || http.base_url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "collaborators.http.base_url must be an http(s) URL, got '{}'",
                        http.base_url
                    ),
                });
            }
            if http.timeout_secs == 0 {
                return Err(ConfigError::Invalid {
                    message: "collaborators.http.timeout_secs must be positive".into(),
                });
            }
        }
        Ok(())
    }

    /// Render as TOML, e.g. for `ragline config show`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Load {
            message: e.to_string(),
        })
    }
}

/// Path of the user-level config file, if a home directory exists.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "ragline", "ragline")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".ragline").join("config.toml")
}

/// Load configuration by merging, in order of increasing precedence:
///
/// 1. Built-in defaults
/// 2. User config (`~/.config/ragline/config.toml`)
/// 3. Workspace config (`.ragline/config.toml`)
/// 4. Environment variables (`RAGLINE_RATE_LIMIT__ENABLED`, ...)
/// 5. Explicit overrides
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&RaglineConfig>,
) -> Result<RaglineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RaglineConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("RAGLINE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
