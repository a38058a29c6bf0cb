//! Container environment and secrets assembled from Parameter Store and
//! Secrets Manager.
//!
//! Parameter Store holds every key for an application under
//! `/{environment}/{application}/`. Keys that also exist in the service's
//! Secrets Manager secret are handed to ECS as secret references instead of
//! plain values. Only keys named in the env sample file reach the container.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::SdkConfig;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::ecs::GatewayError;
use crate::error::{DeployError, Result};
use crate::task_definition::ContainerConfig;
use crate::utils::aws::classify;
use crate::utils::retry::RetryPolicy;

/// `GetParametersByPath` page size.
const PARAMETER_PAGE_SIZE: i32 = 10;

/// Identifies whose configuration to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRequest {
    pub environment: String,
    pub application: String,
    pub ecs_service_name: String,
    pub secrets_name: Option<String>,
    /// Container that receives the assembled configuration.
    pub essential_container: String,
}

/// Resolves per-container environment and secrets for a deployment.
#[async_trait]
pub trait ContainerConfigSource: Send + Sync {
    async fn build_container_config(
        &self,
        request: &ConfigRequest,
    ) -> Result<BTreeMap<String, ContainerConfig>>;
}

// ============================================================================
// Backing stores
// ============================================================================

/// Flat key/value configuration under an environment/application path.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get_existing_config(
        &self,
        environment: &str,
        application: &str,
    ) -> std::result::Result<BTreeMap<String, String>, GatewayError>;
}

/// A Secrets Manager secret: its ARN, current version and JSON keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretValue {
    pub arn: String,
    pub version_id: String,
    pub keys: Vec<String>,
}

impl SecretValue {
    /// `valueFrom` reference for each key, pinned to this version.
    pub fn references(&self) -> BTreeMap<String, String> {
        self.keys
            .iter()
            .map(|k| (k.clone(), format!("{}:{}::{}", self.arn, k, self.version_id)))
            .collect()
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> std::result::Result<SecretValue, GatewayError>;
}

/// Secret references already fetched in this process, by secret name.
#[derive(Debug, Default)]
pub struct SecretsCache {
    entries: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl SecretsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.entries.read().await.get(name).cloned()
    }

    pub async fn insert(&self, name: &str, references: BTreeMap<String, String>) {
        self.entries.write().await.insert(name.to_string(), references);
    }

    pub async fn invalidate(&self, name: &str) {
        self.entries.write().await.remove(name);
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Keys listed in an env sample file (`KEY=example` per line).
pub fn read_sample_keys(contents: &str) -> BTreeSet<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.split_once('=').map_or(line, |(key, _)| key).trim().to_string())
        .collect()
}

/// Parameter Store + Secrets Manager configuration source.
pub struct ParameterStoreConfigSource {
    parameters: Arc<dyn ParameterStore>,
    secrets: Arc<dyn SecretStore>,
    cache: Arc<SecretsCache>,
    env_sample_file: PathBuf,
}

impl ParameterStoreConfigSource {
    pub fn new(
        parameters: Arc<dyn ParameterStore>,
        secrets: Arc<dyn SecretStore>,
        cache: Arc<SecretsCache>,
        env_sample_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            parameters,
            secrets,
            cache,
            env_sample_file: env_sample_file.into(),
        }
    }

    async fn secret_references(&self, name: &str) -> Result<BTreeMap<String, String>> {
        if let Some(cached) = self.cache.get(name).await {
            return Ok(cached);
        }

        let secret = self.secrets.get_secret(name).await?;
        info!(
            secret = %name,
            version = %secret.version_id,
            "Fetched config from AWS secrets manager"
        );
        let references = secret.references();
        self.cache.insert(name, references.clone()).await;
        Ok(references)
    }
}

#[async_trait]
impl ContainerConfigSource for ParameterStoreConfigSource {
    async fn build_container_config(
        &self,
        request: &ConfigRequest,
    ) -> Result<BTreeMap<String, ContainerConfig>> {
        let secret_refs = match &request.secrets_name {
            Some(name) => self.secret_references(name).await?,
            None => BTreeMap::new(),
        };

        let parameters = self
            .parameters
            .get_existing_config(&request.environment, &request.application)
            .await
            .map_err(|e| {
                warn!(error = %e, "Parameter store read failed");
                DeployError::unrecoverable_from(
                    format!(
                        "Cannot find the configuration in parameter store [env: {} | service: {}].",
                        request.environment, request.application
                    ),
                    e.into(),
                )
            })?;

        let sample = tokio::fs::read_to_string(&self.env_sample_file)
            .await
            .map_err(|e| {
                DeployError::unrecoverable_from(
                    format!("{} not found. Exiting.", self.env_sample_file.display()),
                    e.into(),
                )
            })?;
        let sample_keys = read_sample_keys(&sample);

        let missing: Vec<&str> = sample_keys
            .iter()
            .filter(|k| !parameters.contains_key(*k) && !secret_refs.contains_key(*k))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(DeployError::unrecoverable(format!(
                "There is no config value for the keys {}",
                missing.join(", ")
            )));
        }

        let secrets: BTreeMap<String, String> = secret_refs
            .into_iter()
            .filter(|(k, _)| sample_keys.contains(k))
            .collect();
        let environment: BTreeMap<String, String> = parameters
            .into_iter()
            .filter(|(k, _)| sample_keys.contains(k) && !secrets.contains_key(k))
            .collect();

        Ok(BTreeMap::from([(
            request.essential_container.clone(),
            ContainerConfig {
                environment,
                secrets,
            },
        )]))
    }
}

/// Fixed per-container configuration, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    configs: BTreeMap<String, ContainerConfig>,
}

impl StaticConfigSource {
    pub fn new(configs: BTreeMap<String, ContainerConfig>) -> Self {
        Self { configs }
    }
}

#[async_trait]
impl ContainerConfigSource for StaticConfigSource {
    async fn build_container_config(
        &self,
        _request: &ConfigRequest,
    ) -> Result<BTreeMap<String, ContainerConfig>> {
        Ok(self.configs.clone())
    }
}

// ============================================================================
// AWS stores
// ============================================================================

pub struct SsmParameterStore {
    client: aws_sdk_ssm::Client,
    retry: RetryPolicy,
}

impl SsmParameterStore {
    pub fn new(sdk_config: &SdkConfig, retry: RetryPolicy) -> Self {
        Self {
            client: aws_sdk_ssm::Client::new(sdk_config),
            retry,
        }
    }
}

#[async_trait]
impl ParameterStore for SsmParameterStore {
    async fn get_existing_config(
        &self,
        environment: &str,
        application: &str,
    ) -> std::result::Result<BTreeMap<String, String>, GatewayError> {
        let prefix = format!("/{}/{}/", environment, application);
        let mut config = BTreeMap::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .retry
                .run("GetParametersByPath", || {
                    let call = self
                        .client
                        .get_parameters_by_path()
                        .path(&prefix)
                        .recursive(false)
                        .with_decryption(true)
                        .max_results(PARAMETER_PAGE_SIZE)
                        .set_next_token(next_token.clone());
                    async move {
                        call.send()
                            .await
                            .map_err(|e| classify("GetParametersByPath", e))
                    }
                })
                .await?;

            for parameter in output.parameters() {
                if let (Some(name), Some(value)) = (parameter.name(), parameter.value()) {
                    let key = name.strip_prefix(prefix.as_str()).unwrap_or(name);
                    config.insert(key.to_string(), value.to_string());
                }
            }

            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                return Ok(config);
            }
        }
    }
}

pub struct SecretsManagerStore {
    client: aws_sdk_secretsmanager::Client,
    retry: RetryPolicy,
}

impl SecretsManagerStore {
    pub fn new(sdk_config: &SdkConfig, retry: RetryPolicy) -> Self {
        Self {
            client: aws_sdk_secretsmanager::Client::new(sdk_config),
            retry,
        }
    }
}

#[async_trait]
impl SecretStore for SecretsManagerStore {
    async fn get_secret(&self, name: &str) -> std::result::Result<SecretValue, GatewayError> {
        let output = self
            .retry
            .run("GetSecretValue", || async move {
                self.client
                    .get_secret_value()
                    .secret_id(name)
                    .send()
                    .await
                    .map_err(|e| classify("GetSecretValue", e))
            })
            .await?;

        let body = output.secret_string().ok_or_else(|| {
            GatewayError::InvalidResponse(format!("secret {} has no string value", name))
        })?;
        let values: serde_json::Map<String, serde_json::Value> = serde_json::from_str(body)
            .map_err(|e| GatewayError::InvalidResponse(format!("secret {} is not a JSON object: {}", name, e)))?;

        Ok(SecretValue {
            arn: output.arn().unwrap_or_default().to_string(),
            version_id: output.version_id().unwrap_or_default().to_string(),
            keys: values.keys().cloned().collect(),
        })
    }
}
