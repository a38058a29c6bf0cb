//! Application configuration.
//!
//! Loaded from YAML files and `CLOUDLIFT`-prefixed environment variables into
//! a single [`Config`].

mod deployment;

pub use deployment::{
    DeploymentConfig, MetricsConfig, RetryConfig, DEFAULT_CONCURRENCY, DEFAULT_METRICS_NAMESPACE,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS,
};

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::warn;

use crate::error::{DeployError, Result};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "cloudlift.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CLOUDLIFT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CLOUDLIFT";
/// Legacy override for the deployment worker pool width.
pub const CONCURRENCY_ENV_VAR: &str = "CLOUDLIFT_DEPLOYMENT_CONCURRENCY";

/// One logical service of the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceEntry {
    /// Physical ECS service name; discovered from the stack outputs when unset.
    pub ecs_service_name: Option<String>,
    /// Secrets Manager secret whose keys become container secrets.
    pub secrets_name: Option<String>,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment name (`staging`, `production`, ...).
    pub environment: String,
    /// Application name; the parameter store path and stack name derive from it.
    pub application: String,
    pub region: Option<String>,
    /// Custom AWS endpoint (LocalStack and similar).
    pub endpoint_url: Option<String>,
    /// ECS cluster; defaults to `cluster-{environment}`.
    pub cluster: Option<String>,
    /// CloudFormation stack; defaults to `{application}-{environment}`.
    pub stack_name: Option<String>,
    /// File listing the environment keys each container must receive.
    pub env_sample_file: String,
    pub deployment: DeploymentConfig,
    pub retry: RetryConfig,
    pub metrics: MetricsConfig,
    /// Logical services, keyed by logical name.
    pub services: BTreeMap<String, ServiceEntry>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `cloudlift.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. `CLOUDLIFT_DEPLOYMENT_CONCURRENCY` for the pool width
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| DeployError::Config(e.to_string()))?;

        let mut config: Config = config
            .try_deserialize()
            .map_err(|e| DeployError::Config(e.to_string()))?;

        if let Ok(raw) = std::env::var(CONCURRENCY_ENV_VAR) {
            match raw.trim().parse::<usize>() {
                Ok(concurrency) => config.deployment.concurrency = concurrency,
                Err(_) => warn!(
                    value = %raw,
                    "Ignoring non-numeric {}", CONCURRENCY_ENV_VAR
                ),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test(environment: &str, application: &str) -> Self {
        Self {
            environment: environment.to_string(),
            application: application.to_string(),
            env_sample_file: "env.sample".to_string(),
            ..Self::default()
        }
    }

    /// Reject settings that would stall or disable the deployment loop.
    pub fn validate(&self) -> Result<()> {
        if self.deployment.concurrency == 0 {
            return Err(DeployError::Config(
                "deployment.concurrency must be at least 1".to_string(),
            ));
        }
        if self.deployment.poll_interval_secs == 0 {
            return Err(DeployError::Config(
                "deployment.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(DeployError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cluster_name(&self) -> String {
        self.cluster
            .clone()
            .unwrap_or_else(|| format!("cluster-{}", self.environment))
    }

    pub fn stack_name(&self) -> String {
        self.stack_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.application, self.environment))
    }

    pub fn env_sample_file(&self) -> &str {
        if self.env_sample_file.is_empty() {
            "env.sample"
        } else {
            &self.env_sample_file
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;
    use tempfile::NamedTempFile;

    use super::*;

    fn yaml(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.deployment.concurrency, 4);
        assert_eq!(config.deployment.timeout_secs, 600);
        assert_eq!(config.deployment.poll_interval_secs, 5);
        assert!(!config.deployment.fail_on_placement_errors);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.metrics.namespace, "ECS/DeploymentMetrics");
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_derived_names() {
        let config = Config::for_test("staging", "dummy");
        assert_eq!(config.cluster_name(), "cluster-staging");
        assert_eq!(config.stack_name(), "dummy-staging");
        assert_eq!(config.env_sample_file(), "env.sample");
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = yaml(
            r#"
environment: production
application: billing
cluster: shared-prod
deployment:
  concurrency: 2
  timeout_secs: 120
services:
  Web:
    secrets_name: billing/web
  Worker:
    ecs_service_name: billing-worker
"#,
        );

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.environment, "production");
        assert_eq!(config.cluster_name(), "shared-prod");
        assert_eq!(config.deployment.concurrency, 2);
        assert_eq!(config.deployment.timeout_secs, 120);
        assert_eq!(config.deployment.poll_interval_secs, 5);
        let names: Vec<_> = config.services.keys().cloned().collect();
        assert_eq!(names, vec!["Web".to_string(), "Worker".to_string()]);
        assert_eq!(
            config.services["Worker"].ecs_service_name.as_deref(),
            Some("billing-worker")
        );
    }

    #[test]
    #[serial]
    fn test_legacy_concurrency_env_var() {
        let file = yaml("environment: staging\napplication: dummy\n");
        std::env::set_var(CONCURRENCY_ENV_VAR, "7");
        let config = Config::load(file.path().to_str());
        std::env::remove_var(CONCURRENCY_ENV_VAR);

        assert_eq!(config.unwrap().deployment.concurrency, 7);
    }

    #[test]
    #[serial]
    fn test_zero_concurrency_rejected() {
        let file = yaml("deployment:\n  concurrency: 0\n");
        let err = Config::load(file.path().to_str()).unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let retry = RetryConfig {
            max_attempts: 3,
            min_delay_ms: 50,
            max_delay_ms: 1000,
            jitter: false,
        };
        let policy = crate::utils::retry::RetryPolicy::from(&retry);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.min_delay, std::time::Duration::from_millis(50));
        assert!(!policy.jitter);
    }
}
