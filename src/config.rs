use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::application::{EngineOptions, RetryPolicy, StepTimeouts};

/// Top-level YAML configuration. Every section is optional.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ExpenseflowConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub workflow: WorkflowConfig,
}

impl ExpenseflowConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read config file at {}", path_ref.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("Invalid configuration in {}", path_ref.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Unable to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate().context("server section failed validation")?;
        self.gateway
            .validate()
            .context("gateway section failed validation")?;
        self.workflow
            .validate()
            .context("workflow section failed validation")?;
        Ok(())
    }
}

impl FromStr for ExpenseflowConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_yaml_str(s)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 4000,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        ensure!(!self.bind.trim().is_empty(), "bind address must not be empty");
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    /// Steps call the in-process expense book.
    #[default]
    Local,
    /// Steps call an expense service over HTTP.
    Http,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub kind: GatewayKind,
    pub url: Option<String>,
}

impl GatewayConfig {
    fn validate(&self) -> Result<()> {
        if self.kind == GatewayKind::Http
            && let Some(url) = &self.url
        {
            ensure!(
                url.starts_with("http://") || url.starts_with("https://"),
                "gateway url '{url}' must be an http(s) URL"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    pub task_queue: String,
    pub create_timeout_secs: u64,
    pub decision_timeout_secs: u64,
    pub sweep_interval_ms: u64,
    pub retry: RetryConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            task_queue: "expense".into(),
            create_timeout_secs: 10,
            decision_timeout_secs: 600,
            sweep_interval_ms: 1_000,
            retry: RetryConfig::default(),
        }
    }
}

impl WorkflowConfig {
    fn validate(&self) -> Result<()> {
        ensure!(!self.task_queue.trim().is_empty(), "task_queue must not be empty");
        ensure!(self.create_timeout_secs > 0, "create_timeout_secs must be > 0");
        ensure!(
            self.decision_timeout_secs >= self.create_timeout_secs,
            "decision_timeout_secs ({}) must be >= create_timeout_secs ({})",
            self.decision_timeout_secs,
            self.create_timeout_secs
        );
        ensure!(self.sweep_interval_ms > 0, "sweep_interval_ms must be > 0");
        self.retry.validate()
    }

    pub fn step_timeouts(&self) -> StepTimeouts {
        StepTimeouts {
            create: Duration::from_secs(self.create_timeout_secs),
            decision: Duration::from_secs(self.decision_timeout_secs),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            task_queue: self.task_queue.clone(),
            retry: self.retry.policy(),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 200,
            backoff_coefficient: 2.0,
            max_interval_ms: 5_000,
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.max_attempts >= 1, "retry.max_attempts must be >= 1");
        ensure!(
            self.backoff_coefficient.is_finite() && self.backoff_coefficient >= 1.0,
            "retry.backoff_coefficient must be >= 1.0"
        );
        ensure!(
            self.max_interval_ms >= self.initial_interval_ms,
            "retry.max_interval_ms must be >= retry.initial_interval_ms"
        );
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            backoff_coefficient: self.backoff_coefficient,
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_attempts: self.max_attempts,
        }
    }
}
