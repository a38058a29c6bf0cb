//! Deployment, retry and metrics settings.

use std::time::Duration;

use serde::Deserialize;

use crate::utils::retry::RetryPolicy;

/// Default width of the deployment worker pool.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default time a single service may take to converge.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Default delay between service polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default CloudWatch namespace for the failure metric.
pub const DEFAULT_METRICS_NAMESPACE: &str = "ECS/DeploymentMetrics";

/// Rollout behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Number of services deployed at once.
    pub concurrency: usize,

    /// Per-service deadline for the poll loop, in seconds.
    pub timeout_secs: u64,

    /// Delay between polls, in seconds.
    pub poll_interval_secs: u64,

    /// Treat "unable to place task" events as an immediate failure instead of
    /// waiting for the timeout.
    pub fail_on_placement_errors: bool,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            fail_on_placement_errors: false,
        }
    }
}

impl DeploymentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Backoff applied to every AWS call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            min_delay_ms: policy.min_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: DEFAULT_METRICS_NAMESPACE.to_string(),
        }
    }
}
