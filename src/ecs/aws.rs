//! ECS gateway backed by `aws-sdk-ecs`.
//!
//! Every request goes through the configured [`RetryPolicy`]. Raw container
//! definitions are cached per task definition ARN so that re-registration keeps
//! every field this crate does not model (ports, log configuration, limits)
//! and only overlays the ones it edits.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ecs::primitives::DateTime as SdkDateTime;
use aws_sdk_ecs::types::{
    Compatibility, ContainerDefinition as SdkContainer, ContainerOverride as SdkContainerOverride,
    HostVolumeProperties, KeyValuePair as SdkKeyValuePair, NetworkMode, Secret, SortOrder, Tag,
    TaskDefinition, TaskDefinitionField, TaskDefinitionPlacementConstraint,
    TaskDefinitionPlacementConstraintType, TaskOverride, Volume as SdkVolume,
};
use aws_sdk_ecs::Client;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::gateway::{
    EcsGateway, GatewayError, RegisterTaskDefinition, Result, RunTaskRequest, TaskDefinitionPage,
    TaskSummary, UpdateServiceRequest,
};
use super::service::{Deployment, EcsService, ServiceEvent};
use crate::task_definition::{
    ContainerDefinition, ContainerOverride, KeyValuePair, PlacementConstraint, SecretRef,
    TaskDefinitionSnapshot, Volume,
};
use crate::error::DeployError;
use crate::utils::aws::{classify, ensure_credentials};
use crate::utils::retry::RetryPolicy;

/// `DescribeTasks` accepts at most this many ARNs per call.
const DESCRIBE_TASKS_BATCH: usize = 100;

/// ECS reports unknown task definitions as a generic ClientException.
const UNKNOWN_TASK_DEFINITION_MESSAGE: &str = "Unable to describe task definition";

#[derive(Clone)]
struct RawDefinition {
    containers: Vec<SdkContainer>,
    volumes: Vec<SdkVolume>,
}

/// ECS gateway over the AWS SDK.
pub struct AwsEcsGateway {
    client: Client,
    retry: RetryPolicy,
    raw: RwLock<HashMap<String, RawDefinition>>,
}

impl AwsEcsGateway {
    /// Build a gateway, failing with `EcsConnection` when no credentials
    /// resolve for the shared configuration.
    pub async fn new(sdk_config: &SdkConfig, retry: RetryPolicy) -> crate::error::Result<Self> {
        ensure_credentials(sdk_config)
            .await
            .map_err(DeployError::connection)?;
        info!(
            region = ?sdk_config.region().map(|r| r.as_ref().to_string()),
            max_attempts = retry.max_attempts,
            "ECS gateway initialized"
        );
        Ok(Self::with_client(Client::new(sdk_config), retry))
    }

    /// Build from an existing client (for testing with a custom endpoint).
    pub fn with_client(client: Client, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            raw: RwLock::new(HashMap::new()),
        }
    }

    async fn remember(&self, definition: &TaskDefinition) {
        if let Some(arn) = definition.task_definition_arn() {
            self.raw.write().await.insert(
                arn.to_string(),
                RawDefinition {
                    containers: definition.container_definitions().to_vec(),
                    volumes: definition.volumes().to_vec(),
                },
            );
        }
    }
}

#[async_trait]
impl EcsGateway for AwsEcsGateway {
    async fn describe_service(&self, cluster: &str, service: &str) -> Result<EcsService> {
        let output = self
            .retry
            .run("DescribeServices", || async move {
                self.client
                    .describe_services()
                    .cluster(cluster)
                    .services(service)
                    .send()
                    .await
                    .map_err(|e| classify("DescribeServices", e))
            })
            .await?;

        let found = output
            .services()
            .iter()
            .find(|s| s.status() != Some("INACTIVE"))
            .ok_or_else(|| GatewayError::ServiceNotFound {
                cluster: cluster.to_string(),
                service: service.to_string(),
            })?;

        service_from_sdk(cluster, found)
    }

    async fn describe_task_definition(&self, arn: &str) -> Result<TaskDefinitionSnapshot> {
        let output = self
            .retry
            .run("DescribeTaskDefinition", || async move {
                self.client
                    .describe_task_definition()
                    .task_definition(arn)
                    .include(TaskDefinitionField::Tags)
                    .send()
                    .await
                    .map_err(|e| match classify("DescribeTaskDefinition", e) {
                        GatewayError::Api { message, .. }
                            if message.contains(UNKNOWN_TASK_DEFINITION_MESSAGE) =>
                        {
                            GatewayError::UnknownTaskDefinition(arn.to_string())
                        }
                        other => other,
                    })
            })
            .await?;

        let definition = output
            .task_definition()
            .ok_or_else(|| GatewayError::UnknownTaskDefinition(arn.to_string()))?;
        self.remember(definition).await;
        snapshot_from_sdk(definition, output.tags())
    }

    async fn list_task_definitions(
        &self,
        family: &str,
        next_token: Option<String>,
    ) -> Result<TaskDefinitionPage> {
        let output = self
            .retry
            .run("ListTaskDefinitions", || {
                let request = self
                    .client
                    .list_task_definitions()
                    .family_prefix(family)
                    .sort(SortOrder::Desc)
                    .set_next_token(next_token.clone());
                async move {
                    request
                        .send()
                        .await
                        .map_err(|e| classify("ListTaskDefinitions", e))
                }
            })
            .await?;

        Ok(TaskDefinitionPage {
            arns: output.task_definition_arns().to_vec(),
            next_token: output.next_token().map(str::to_string),
        })
    }

    async fn list_tasks(&self, cluster: &str, service: &str) -> Result<Vec<String>> {
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .retry
                .run("ListTasks", || {
                    let request = self
                        .client
                        .list_tasks()
                        .cluster(cluster)
                        .service_name(service)
                        .set_next_token(next_token.clone());
                    async move { request.send().await.map_err(|e| classify("ListTasks", e)) }
                })
                .await?;

            arns.extend(output.task_arns().iter().cloned());
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                return Ok(arns);
            }
        }
    }

    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> Result<Vec<TaskSummary>> {
        let mut summaries = Vec::with_capacity(task_arns.len());

        for batch in task_arns.chunks(DESCRIBE_TASKS_BATCH) {
            let output = self
                .retry
                .run("DescribeTasks", || {
                    let request = self
                        .client
                        .describe_tasks()
                        .cluster(cluster)
                        .set_tasks(Some(batch.to_vec()));
                    async move { request.send().await.map_err(|e| classify("DescribeTasks", e)) }
                })
                .await?;

            summaries.extend(output.tasks().iter().map(|task| TaskSummary {
                task_arn: task.task_arn().unwrap_or_default().to_string(),
                task_definition_arn: task.task_definition_arn().unwrap_or_default().to_string(),
                last_status: task.last_status().unwrap_or_default().to_string(),
            }));
        }

        Ok(summaries)
    }

    async fn register_task_definition(
        &self,
        request: &RegisterTaskDefinition,
    ) -> Result<TaskDefinitionSnapshot> {
        let raw = match &request.source_arn {
            Some(arn) => self.raw.read().await.get(arn).cloned(),
            None => None,
        };

        let containers = request
            .containers
            .iter()
            .map(|container| {
                let base = raw.as_ref().and_then(|r| {
                    r.containers
                        .iter()
                        .find(|c| c.name() == Some(container.name.as_str()))
                        .cloned()
                });
                overlay_container(base, container)
            })
            .collect::<Result<Vec<_>>>()?;

        let volumes = match &raw {
            Some(raw) => raw.volumes.clone(),
            None => request.volumes.iter().map(volume_to_sdk).collect(),
        };

        let placement_constraints: Vec<_> = request
            .placement_constraints
            .iter()
            .map(|p| {
                TaskDefinitionPlacementConstraint::builder()
                    .r#type(TaskDefinitionPlacementConstraintType::from(
                        p.constraint_type.as_str(),
                    ))
                    .set_expression(p.expression.clone())
                    .build()
            })
            .collect();

        let tags: Vec<_> = request
            .tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect();

        let compatibilities: Vec<_> = request
            .requires_compatibilities
            .iter()
            .map(|c| Compatibility::from(c.as_str()))
            .collect();

        let output = self
            .retry
            .run("RegisterTaskDefinition", || {
                let call = self
                    .client
                    .register_task_definition()
                    .family(&request.family)
                    .set_container_definitions(Some(containers.clone()))
                    .set_volumes(Some(volumes.clone()))
                    .set_task_role_arn(request.task_role_arn.clone())
                    .set_execution_role_arn(request.execution_role_arn.clone())
                    .set_network_mode(request.network_mode.as_deref().map(NetworkMode::from))
                    .set_requires_compatibilities(
                        (!compatibilities.is_empty()).then(|| compatibilities.clone()),
                    )
                    .set_cpu(request.cpu.clone())
                    .set_memory(request.memory.clone())
                    .set_placement_constraints(
                        (!placement_constraints.is_empty()).then(|| placement_constraints.clone()),
                    )
                    .set_tags((!tags.is_empty()).then(|| tags.clone()));
                async move {
                    call.send()
                        .await
                        .map_err(|e| classify("RegisterTaskDefinition", e))
                }
            })
            .await?;

        let definition = output.task_definition().ok_or_else(|| {
            GatewayError::InvalidResponse("RegisterTaskDefinition returned no task definition".to_string())
        })?;
        self.remember(definition).await;

        let snapshot = snapshot_from_sdk(definition, output.tags())?;
        debug!(
            arn = ?snapshot.arn(),
            family = %snapshot.family(),
            revision = snapshot.revision(),
            "Registered task definition"
        );
        Ok(snapshot)
    }

    async fn deregister_task_definition(&self, arn: &str) -> Result<()> {
        self.retry
            .run("DeregisterTaskDefinition", || async move {
                self.client
                    .deregister_task_definition()
                    .task_definition(arn)
                    .send()
                    .await
                    .map_err(|e| classify("DeregisterTaskDefinition", e))
            })
            .await?;
        self.raw.write().await.remove(arn);
        Ok(())
    }

    async fn update_service(&self, request: &UpdateServiceRequest) -> Result<()> {
        self.retry
            .run("UpdateService", || {
                let call = self
                    .client
                    .update_service()
                    .cluster(&request.cluster)
                    .service(&request.service)
                    .set_task_definition(request.task_definition.clone())
                    .set_desired_count(request.desired_count);
                async move { call.send().await.map_err(|e| classify("UpdateService", e)) }
            })
            .await?;
        Ok(())
    }

    async fn run_task(&self, request: &RunTaskRequest) -> Result<Vec<String>> {
        let overrides = TaskOverride::builder()
            .set_container_overrides(Some(
                request.overrides.iter().map(override_to_sdk).collect(),
            ))
            .build();

        let output = self
            .retry
            .run("RunTask", || {
                let call = self
                    .client
                    .run_task()
                    .cluster(&request.cluster)
                    .task_definition(&request.task_definition)
                    .count(request.count)
                    .set_started_by(request.started_by.clone())
                    .overrides(overrides.clone());
                async move { call.send().await.map_err(|e| classify("RunTask", e)) }
            })
            .await?;

        if let Some(failure) = output.failures().first() {
            return Err(GatewayError::api(
                "RunTask",
                format!(
                    "{} ({})",
                    failure.reason().unwrap_or("unknown reason"),
                    failure.arn().unwrap_or_default()
                ),
            ));
        }

        Ok(output
            .tasks()
            .iter()
            .filter_map(|t| t.task_arn().map(str::to_string))
            .collect())
    }
}

// ============================================================================
// SDK <-> domain conversion
// ============================================================================

fn to_chrono(value: &SdkDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

fn service_from_sdk(cluster: &str, service: &aws_sdk_ecs::types::Service) -> Result<EcsService> {
    let task_definition = service
        .task_definition()
        .ok_or_else(|| GatewayError::InvalidResponse("service has no task definition".to_string()))?;

    Ok(EcsService {
        cluster: cluster.to_string(),
        name: service.service_name().unwrap_or_default().to_string(),
        task_definition: task_definition.to_string(),
        desired_count: service.desired_count(),
        running_count: service.running_count(),
        pending_count: service.pending_count(),
        deployments: service
            .deployments()
            .iter()
            .map(|d| Deployment {
                status: d.status().unwrap_or_default().to_string(),
                task_definition: d.task_definition().map(str::to_string),
                desired_count: d.desired_count(),
                running_count: d.running_count(),
                pending_count: d.pending_count(),
                created_at: d.created_at().and_then(to_chrono),
                updated_at: d.updated_at().and_then(to_chrono),
            })
            .collect(),
        events: service
            .events()
            .iter()
            .filter_map(|e| {
                Some(ServiceEvent {
                    id: e.id()?.to_string(),
                    created_at: e.created_at().and_then(to_chrono)?,
                    message: e.message()?.to_string(),
                })
            })
            .collect(),
    })
}

fn container_from_sdk(container: &SdkContainer) -> ContainerDefinition {
    ContainerDefinition {
        name: container.name().unwrap_or_default().to_string(),
        image: container.image().unwrap_or_default().to_string(),
        essential: container.essential().unwrap_or(true),
        command: container.command().to_vec(),
        environment: container
            .environment()
            .iter()
            .map(|kv| KeyValuePair {
                name: kv.name().unwrap_or_default().to_string(),
                value: kv.value().unwrap_or_default().to_string(),
            })
            .collect(),
        secrets: container
            .secrets()
            .iter()
            .map(|s| SecretRef {
                name: s.name().to_string(),
                value_from: s.value_from().to_string(),
            })
            .collect(),
    }
}

fn snapshot_from_sdk(definition: &TaskDefinition, tags: &[Tag]) -> Result<TaskDefinitionSnapshot> {
    let containers = definition
        .container_definitions()
        .iter()
        .map(container_from_sdk)
        .collect();

    let snapshot = TaskDefinitionSnapshot::new(definition.family().unwrap_or_default(), containers)
        .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?
        .with_volumes(
            definition
                .volumes()
                .iter()
                .map(|v| Volume {
                    name: v.name().unwrap_or_default().to_string(),
                    host_path: v.host().and_then(|h| h.source_path()).map(str::to_string),
                })
                .collect(),
        )
        .with_roles(
            definition.task_role_arn().map(str::to_string),
            definition.execution_role_arn().map(str::to_string),
        )
        .with_network_mode(definition.network_mode().map(|m| m.as_str().to_string()))
        .with_compatibilities(
            definition
                .requires_compatibilities()
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
        )
        .with_task_size(
            definition.cpu().map(str::to_string),
            definition.memory().map(str::to_string),
        )
        .with_placement_constraints(
            definition
                .placement_constraints()
                .iter()
                .map(|p| PlacementConstraint {
                    constraint_type: p.r#type().map(|t| t.as_str().to_string()).unwrap_or_default(),
                    expression: p.expression().map(str::to_string),
                })
                .collect(),
        )
        .with_tags(
            tags.iter()
                .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
                .collect(),
        );

    Ok(match definition.task_definition_arn() {
        Some(arn) => snapshot.with_arn(arn, definition.revision()),
        None => snapshot,
    })
}

fn overlay_container(base: Option<SdkContainer>, container: &ContainerDefinition) -> Result<SdkContainer> {
    let mut sdk = base.unwrap_or_else(|| {
        SdkContainer::builder()
            .name(&container.name)
            .essential(container.essential)
            .build()
    });

    sdk.image = Some(container.image.clone());
    sdk.command = (!container.command.is_empty()).then(|| container.command.clone());
    sdk.environment = Some(
        container
            .environment
            .iter()
            .map(|kv| SdkKeyValuePair::builder().name(&kv.name).value(&kv.value).build())
            .collect(),
    );
    sdk.secrets = Some(
        container
            .secrets
            .iter()
            .map(|s| {
                Secret::builder()
                    .name(&s.name)
                    .value_from(&s.value_from)
                    .build()
                    .map_err(|e| GatewayError::InvalidResponse(format!("Failed to build secret: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?,
    );

    Ok(sdk)
}

fn volume_to_sdk(volume: &Volume) -> SdkVolume {
    SdkVolume::builder()
        .name(&volume.name)
        .set_host(
            volume
                .host_path
                .as_ref()
                .map(|path| HostVolumeProperties::builder().source_path(path).build()),
        )
        .build()
}

fn override_to_sdk(item: &ContainerOverride) -> SdkContainerOverride {
    SdkContainerOverride::builder()
        .name(&item.name)
        .set_command(item.command.clone())
        .set_environment(item.environment.as_ref().map(|env| {
            env.iter()
                .map(|kv| SdkKeyValuePair::builder().name(&kv.name).value(&kv.value).build())
                .collect()
        }))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_without_credentials_is_connection_error() {
        let err = AwsEcsGateway::new(&SdkConfig::builder().build(), RetryPolicy::default())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, DeployError::EcsConnection(_)));
        assert_eq!(
            err.to_string(),
            "Unable to locate credentials. Configure credentials by running \"aws configure\"."
        );
    }
}
