//! Admission policy: which bucket a command draws from and with what limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize, Serializer};
use tokio::time::Instant;
use tracing::{info, warn};

use super::bucket::Admission;
use super::store::{BucketKey, BucketStore};
use crate::command::{Command, CommandKind};
use crate::config::RateLimitConfig;
use crate::error::ConfigError;

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub capacity: u32,
    /// Tokens per second. Zero means the bucket never refills.
    pub refill_rate: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_rate: 1.0,
        }
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "rate limit capacity must be at least 1".into(),
            });
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(ConfigError::Invalid {
                message: format!(
                    "rate limit refill_rate must be a non-negative number, got {}",
                    self.refill_rate
                ),
            });
        }
        Ok(())
    }
}

/// Effective limits for `kind`: its override if one exists, else the defaults.
pub fn resolve(kind: CommandKind, defaults: Limits, overrides: &HashMap<CommandKind, Limits>) -> Limits {
    overrides.get(&kind).copied().unwrap_or(defaults)
}

/// Validated, read-only limiter settings.
#[derive(Debug, Clone, Default)]
pub struct LimiterPolicy {
    pub enabled: bool,
    pub defaults: Limits,
    pub overrides: HashMap<CommandKind, Limits>,
    /// Charge every stage dispatch, not only the entry command.
    pub charge_every_stage: bool,
}

impl LimiterPolicy {
    pub fn new(defaults: Limits) -> Self {
        Self {
            enabled: true,
            defaults,
            overrides: HashMap::new(),
            charge_every_stage: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_override(mut self, kind: CommandKind, limits: Limits) -> Self {
        self.overrides.insert(kind, limits);
        self
    }

    pub fn with_charge_every_stage(mut self, charge: bool) -> Self {
        self.charge_every_stage = charge;
        self
    }

    /// Whether dispatching `kind` consumes a token.
    ///
    /// A request is charged once, when its `Question` is admitted. Follow-on
    /// stages are free unless they have their own override or every stage is
    /// charged.
    pub fn charges(&self, kind: CommandKind) -> bool {
        self.enabled
            && (kind == CommandKind::Question
                || self.charge_every_stage
                || self.overrides.contains_key(&kind))
    }

    /// Parse and validate a configuration section.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, ConfigError> {
        config.default.validate()?;
        let mut overrides = HashMap::new();
        for (name, limits) in &config.per_command {
            let kind: CommandKind = name.parse()?;
            limits.validate()?;
            overrides.insert(kind, *limits);
        }
        Ok(Self {
            enabled: config.enabled,
            defaults: config.default,
            overrides,
            charge_every_stage: config.charge_every_stage,
        })
    }

    /// Kinds with an override get their own bucket; the rest share the session's.
    pub fn key_for(&self, session_id: &str, kind: CommandKind) -> BucketKey {
        if self.overrides.contains_key(&kind) {
            BucketKey::scoped(session_id, kind)
        } else {
            BucketKey::session(session_id)
        }
    }

    pub fn limits_for(&self, kind: CommandKind) -> Limits {
        resolve(kind, self.defaults, &self.overrides)
    }
}

/// Remaining budget after an admitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub limit: u32,
    pub remaining: u32,
}

/// A rejected admission, surfaced to callers as a rate-limit event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionDenied {
    pub key: String,
    pub limit: u32,
    pub remaining: u32,
    #[serde(rename = "retry_after_secs", serialize_with = "serialize_secs")]
    pub retry_after: Duration,
    pub reset_time: DateTime<Utc>,
    pub command_kind: CommandKind,
}

impl AdmissionDenied {
    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset_time: self.reset_time,
            retry_after: Some(self.retry_after),
        }
    }
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Admitted. `None` when the limiter is disabled.
    Allowed(Option<Quota>),
    Denied(AdmissionDenied),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }
}

/// Values a transport layer exposes as rate-limit response headers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    /// Present only on denial.
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Header name/value pairs in the conventional `X-RateLimit-*` form.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_time.timestamp().to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push(("Retry-After", retry_after.as_secs_f64().ceil().to_string()));
        }
        pairs
    }
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

/// Per-session token-bucket admission control.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    policy: Arc<LimiterPolicy>,
    store: Arc<BucketStore>,
}

impl RateLimiter {
    pub fn new(policy: LimiterPolicy, store: Arc<BucketStore>) -> Self {
        Self {
            policy: Arc::new(policy),
            store,
        }
    }

    pub fn from_config(config: &RateLimitConfig, store: Arc<BucketStore>) -> Result<Self, ConfigError> {
        Ok(Self::new(LimiterPolicy::from_config(config)?, store))
    }

    pub fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<BucketStore> {
        &self.store
    }

    /// Consume one token for `command`.
    pub fn check(&self, command: &Command) -> Decision {
        self.check_at(command, Instant::now())
    }

    pub fn check_at(&self, command: &Command, now: Instant) -> Decision {
        if !self.policy.enabled {
            return Decision::Allowed(None);
        }
        let kind = command.kind();
        let key = self.policy.key_for(command.session_id(), kind);
        let limits = self.policy.limits_for(kind);
        let bucket = self.store.get_or_create(&key, limits, now);

        match bucket.try_consume(1, now) {
            Admission::Allowed { remaining } => Decision::Allowed(Some(Quota {
                limit: bucket.capacity(),
                remaining: remaining.floor() as u32,
            })),
            Admission::Denied { retry_after } => {
                warn!(
                    key = %key,
                    command_kind = %kind,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                Decision::Denied(AdmissionDenied {
                    key: key.to_string(),
                    limit: bucket.capacity(),
                    remaining: 0,
                    retry_after,
                    reset_time: wall_clock_after(retry_after),
                    command_kind: kind,
                })
            }
        }
    }

    /// Read-only header values for `command`'s bucket. `None` when disabled.
    pub fn headers(&self, command: &Command) -> Option<RateLimitHeaders> {
        self.headers_at(command, Instant::now())
    }

    pub fn headers_at(&self, command: &Command, now: Instant) -> Option<RateLimitHeaders> {
        if !self.policy.enabled {
            return None;
        }
        let kind = command.kind();
        let key = self.policy.key_for(command.session_id(), kind);
        let headers = match self.store.get(&key) {
            Some(bucket) => {
                let snapshot = bucket.peek(now);
                RateLimitHeaders {
                    limit: snapshot.capacity,
                    remaining: snapshot.tokens.floor() as u32,
                    reset_time: wall_clock_after(snapshot.time_until_full),
                    retry_after: None,
                }
            }
            None => {
                let limits = self.policy.limits_for(kind);
                RateLimitHeaders {
                    limit: limits.capacity,
                    remaining: limits.capacity,
                    reset_time: Utc::now(),
                    retry_after: None,
                }
            }
        };
        Some(headers)
    }

    /// Drop every bucket for `session_id`; its next check starts full.
    pub fn reset(&self, session_id: &str) -> usize {
        let removed = self.store.remove_session(session_id);
        info!(session_id, removed, "Rate limit reset");
        removed
    }
}
