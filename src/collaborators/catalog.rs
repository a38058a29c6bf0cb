//! Maps logical service names to the ECS services that run them.
//!
//! Names come from configuration first; anything missing is filled from the
//! application stack's `{Logical}EcsServiceName` outputs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::SdkConfig;
use tracing::warn;

use crate::config::ServiceEntry;
use crate::ecs::GatewayError;
use crate::error::{DeployError, Result};
use crate::utils::aws::classify;
use crate::utils::retry::RetryPolicy;

/// Suffix of stack outputs naming an ECS service.
pub const ECS_SERVICE_OUTPUT_SUFFIX: &str = "EcsServiceName";

/// A deployable service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub logical_name: String,
    pub ecs_service_name: String,
    pub secrets_name: Option<String>,
}

/// Source of stack outputs.
#[async_trait]
pub trait StackOutputs: Send + Sync {
    async fn outputs(&self, stack_name: &str) -> std::result::Result<BTreeMap<String, String>, GatewayError>;
}

/// Resolve every configured service to a physical name.
///
/// With no services configured, every `...EcsServiceName` output becomes a
/// target.
pub fn resolve_services(
    configured: &BTreeMap<String, ServiceEntry>,
    outputs: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, ServiceTarget>> {
    if configured.is_empty() {
        return Ok(outputs
            .iter()
            .filter_map(|(key, value)| {
                let logical = key.strip_suffix(ECS_SERVICE_OUTPUT_SUFFIX)?;
                Some((
                    logical.to_string(),
                    ServiceTarget {
                        logical_name: logical.to_string(),
                        ecs_service_name: value.clone(),
                        secrets_name: None,
                    },
                ))
            })
            .collect());
    }

    configured
        .iter()
        .map(|(logical, entry)| {
            let ecs_service_name = entry
                .ecs_service_name
                .clone()
                .or_else(|| {
                    outputs
                        .get(&format!("{}{}", logical, ECS_SERVICE_OUTPUT_SUFFIX))
                        .cloned()
                })
                .ok_or_else(|| {
                    DeployError::unrecoverable(format!(
                        "Could not determine the ECS service name for {}",
                        logical
                    ))
                })?;
            Ok((
                logical.clone(),
                ServiceTarget {
                    logical_name: logical.clone(),
                    ecs_service_name,
                    secrets_name: entry.secrets_name.clone(),
                },
            ))
        })
        .collect()
}

/// Stack outputs from CloudFormation `DescribeStacks`.
pub struct CloudFormationOutputs {
    client: aws_sdk_cloudformation::Client,
    retry: RetryPolicy,
}

impl CloudFormationOutputs {
    pub fn new(sdk_config: &SdkConfig, retry: RetryPolicy) -> Self {
        Self {
            client: aws_sdk_cloudformation::Client::new(sdk_config),
            retry,
        }
    }
}

#[async_trait]
impl StackOutputs for CloudFormationOutputs {
    async fn outputs(&self, stack_name: &str) -> std::result::Result<BTreeMap<String, String>, GatewayError> {
        let output = self
            .retry
            .run("DescribeStacks", || async move {
                self.client
                    .describe_stacks()
                    .stack_name(stack_name)
                    .send()
                    .await
                    .map_err(|e| classify("DescribeStacks", e))
            })
            .await?;

        let Some(stack) = output.stacks().first() else {
            warn!(stack = %stack_name, "Could not determine services.");
            return Ok(BTreeMap::new());
        };

        Ok(stack
            .outputs()
            .iter()
            .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())))
            .collect())
    }
}
