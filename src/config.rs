//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::process::timeout::{FixedTimeout, TimeoutPolicy, TokenScaledTimeout};
use crate::retry::RetryPolicy;
use crate::{AppError, Result};

/// Agent binary invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent CLI binary (e.g., `claude`). Resolved through `PATH` when not absolute.
    pub binary: PathBuf,
    /// Arguments passed before every invocation; the prompt itself goes to stdin.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Directory the child process starts in.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Wall-clock budget for a single execution.
    #[serde(default = "default_execution_timeout")]
    pub default_timeout_seconds: u64,
    /// Extra environment variables injected into the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_agent_args() -> Vec<String> {
    ["-p", "--output-format", "stream-json", "--verbose"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_execution_timeout() -> u64 {
    300
}

/// Optional token-budget scaling for execution timeouts.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutPolicyConfig {
    /// Floor applied to every request.
    pub base_seconds: u64,
    /// Additional seconds granted per thousand requested tokens.
    pub seconds_per_1k_tokens: u64,
    /// Hard ceiling.
    pub max_seconds: u64,
}

/// Admission limits, keyed by logical caller.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConcurrencyConfig {
    /// Capacity for keys without a named limit.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Named per-key capacities.
    #[serde(default)]
    pub limits: HashMap<String, usize>,
}

fn default_limit() -> usize {
    4
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            limits: HashMap::new(),
        }
    }
}

/// Retry-with-backoff parameters for non-streaming executions.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Growth factor applied per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Convert to the runtime [`RetryPolicy`].
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Correlation engine timing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CorrelationConfig {
    /// Reply deadline when a registration does not supply one.
    #[serde(default = "default_correlation_timeout")]
    pub default_timeout_seconds: u64,
    /// Period of the expiry sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_correlation_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_correlation_timeout(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl CorrelationConfig {
    /// Default reply deadline.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    /// Expiry sweep period.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Session registry limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Hard cap on concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Inactivity window after which a session is evicted.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Period of the idle sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_max_sessions() -> usize {
    64
}

fn default_idle_timeout() -> u64 {
    1800
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_seconds: default_idle_timeout(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl SessionConfig {
    /// Inactivity window as a [`Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Idle sweep period as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

fn default_ipc_name() -> String {
    "agent-conduit".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Agent binary settings.
    pub agent: AgentConfig,
    /// Optional token-scaled timeout policy.
    #[serde(default)]
    pub timeout_policy: Option<TimeoutPolicyConfig>,
    /// Admission limits.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Correlation engine timing.
    #[serde(default)]
    pub correlation: CorrelationConfig,
    /// Session registry limits.
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Default execution timeout.
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.default_timeout_seconds)
    }

    /// Build the timeout policy: token-scaled when configured, fixed otherwise.
    #[must_use]
    pub fn timeout_policy(&self) -> Box<dyn TimeoutPolicy> {
        match &self.timeout_policy {
            Some(scaled) => Box::new(TokenScaledTimeout {
                base: Duration::from_secs(scaled.base_seconds),
                per_thousand_tokens: Duration::from_secs(scaled.seconds_per_1k_tokens),
                max: Duration::from_secs(scaled.max_seconds),
            }),
            None => Box::new(FixedTimeout(self.execution_timeout())),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.agent.binary.as_os_str().is_empty() {
            return Err(AppError::Config("agent.binary must not be empty".into()));
        }

        if self.agent.default_timeout_seconds == 0 {
            return Err(AppError::Config(
                "agent.default_timeout_seconds must be greater than zero".into(),
            ));
        }

        if let Some(scaled) = &self.timeout_policy {
            if scaled.base_seconds == 0 || scaled.max_seconds < scaled.base_seconds {
                return Err(AppError::Config(
                    "timeout_policy requires base_seconds > 0 and max_seconds >= base_seconds"
                        .into(),
                ));
            }
        }

        if self.concurrency.default_limit == 0 {
            return Err(AppError::Config(
                "concurrency.default_limit must be greater than zero".into(),
            ));
        }

        if let Some((key, _)) = self.concurrency.limits.iter().find(|(_, &cap)| cap == 0) {
            return Err(AppError::Config(format!(
                "concurrency.limits.{key} must be greater than zero"
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }

        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(AppError::Config(
                "retry.multiplier must be a finite value >= 1.0".into(),
            ));
        }

        if self.correlation.default_timeout_seconds == 0
            || self.correlation.sweep_interval_seconds == 0
        {
            return Err(AppError::Config(
                "correlation timeouts and sweep interval must be greater than zero".into(),
            ));
        }

        if self.sessions.max_sessions == 0 {
            return Err(AppError::Config(
                "sessions.max_sessions must be greater than zero".into(),
            ));
        }

        if self.sessions.idle_timeout_seconds == 0 || self.sessions.sweep_interval_seconds == 0 {
            return Err(AppError::Config(
                "sessions idle timeout and sweep interval must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
