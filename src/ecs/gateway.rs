//! ECS control-plane interface.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::service::EcsService;
use crate::task_definition::{
    ContainerDefinition, ContainerOverride, PlacementConstraint, TaskDefinitionSnapshot, Volume,
};
use crate::utils::retry::Retryable;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur talking to the ECS control plane.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Unable to locate credentials")]
    NoCredentials,

    #[error("Service not found: cluster={cluster}, service={service}")]
    ServiceNotFound { cluster: String, service: String },

    #[error("Unknown task definition arn: {0}")]
    UnknownTaskDefinition(String),

    #[error("{operation} throttled: {message}")]
    Throttled { operation: String, message: String },

    #[error("{operation} failed transiently: {message}")]
    Transient { operation: String, message: String },

    #[error("An error occurred when calling the {operation} operation: {message}")]
    Api { operation: String, message: String },

    #[error("Invalid response from ECS: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl Retryable for GatewayError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Transient { .. })
    }
}

/// One page of `ListTaskDefinitions`, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDefinitionPage {
    pub arns: Vec<String>,
    pub next_token: Option<String>,
}

/// The fields of `DescribeTasks` this tool reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub task_arn: String,
    pub task_definition_arn: String,
    pub last_status: String,
}

/// `UpdateService` parameters. Unset fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateServiceRequest {
    pub cluster: String,
    pub service: String,
    pub task_definition: Option<String>,
    pub desired_count: Option<i32>,
}

/// `RunTask` parameters for a one-off task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTaskRequest {
    pub cluster: String,
    /// `family:revision` or full ARN.
    pub task_definition: String,
    pub count: i32,
    pub started_by: Option<String>,
    pub overrides: Vec<ContainerOverride>,
}

/// `RegisterTaskDefinition` parameters.
///
/// Task-level `cpu`/`memory` and `requires_compatibilities` are only sent for
/// Fargate definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterTaskDefinition {
    pub family: String,
    pub containers: Vec<ContainerDefinition>,
    pub volumes: Vec<Volume>,
    pub task_role_arn: Option<String>,
    pub execution_role_arn: Option<String>,
    pub network_mode: Option<String>,
    pub requires_compatibilities: Vec<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub placement_constraints: Vec<PlacementConstraint>,
    pub tags: BTreeMap<String, String>,
    /// ARN of the definition these containers were read from, if any.
    pub source_arn: Option<String>,
}

impl RegisterTaskDefinition {
    pub fn from_snapshot(snapshot: &TaskDefinitionSnapshot, tags: BTreeMap<String, String>) -> Self {
        let fargate = snapshot.is_fargate();
        Self {
            family: snapshot.family().to_string(),
            containers: snapshot.containers().to_vec(),
            volumes: snapshot.volumes().to_vec(),
            task_role_arn: snapshot.task_role_arn().map(str::to_string),
            execution_role_arn: snapshot.execution_role_arn().map(str::to_string),
            network_mode: snapshot.network_mode().map(str::to_string),
            requires_compatibilities: if fargate {
                snapshot.requires_compatibilities().to_vec()
            } else {
                Vec::new()
            },
            cpu: snapshot.cpu().filter(|_| fargate).map(str::to_string),
            memory: snapshot.memory().filter(|_| fargate).map(str::to_string),
            placement_constraints: snapshot.placement_constraints().to_vec(),
            tags,
            source_arn: snapshot.arn().map(str::to_string),
        }
    }
}

/// Narrow view of the ECS API; each method is one control-plane call.
///
/// Implementations:
/// - `AwsEcsGateway`: `aws-sdk-ecs`, every call wrapped in a retry policy
/// - `MockEcsGateway`: in-memory, scripted service states for tests
#[async_trait]
pub trait EcsGateway: Send + Sync {
    /// `DescribeServices` for a single service.
    async fn describe_service(&self, cluster: &str, service: &str) -> Result<EcsService>;

    /// `DescribeTaskDefinition`, including tags.
    async fn describe_task_definition(&self, arn: &str) -> Result<TaskDefinitionSnapshot>;

    /// `ListTaskDefinitions` for one family, newest first.
    async fn list_task_definitions(
        &self,
        family: &str,
        next_token: Option<String>,
    ) -> Result<TaskDefinitionPage>;

    /// `ListTasks` for tasks started by a service.
    async fn list_tasks(&self, cluster: &str, service: &str) -> Result<Vec<String>>;

    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> Result<Vec<TaskSummary>>;

    /// Register a new revision and return it as a snapshot.
    async fn register_task_definition(
        &self,
        request: &RegisterTaskDefinition,
    ) -> Result<TaskDefinitionSnapshot>;

    async fn deregister_task_definition(&self, arn: &str) -> Result<()>;

    async fn update_service(&self, request: &UpdateServiceRequest) -> Result<()>;

    /// Start one-off tasks; returns the started task ARNs.
    async fn run_task(&self, request: &RunTaskRequest) -> Result<Vec<String>>;
}
