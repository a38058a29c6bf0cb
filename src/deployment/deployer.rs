//! Deploy and revert flows for a single service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::collaborators::{ConfigRequest, ContainerConfigSource};
use crate::console::{self, DeployColor};
use crate::deployment::action::{DeploymentAction, PollSettings};
use crate::ecs::EcsGateway;
use crate::error::{DeployError, Result};
use crate::task_definition::{
    ContainerConfig, DiffField, ImageUpdate, TaskDefinitionDiff, TaskDefinitionSnapshot,
};
use crate::utils::metrics::MetricsSink;

/// Which ECS service a job targets, and how its output is painted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub cluster: String,
    pub ecs_service_name: String,
    pub secrets_name: Option<String>,
    pub color: DeployColor,
}

/// Image and tagging for a new release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVersion {
    /// Tag applied to the essential container's image.
    pub version: String,
    /// Full image URI; when set it replaces the image outright.
    pub image_uri: Option<String>,
    pub deployment_identifier: Option<String>,
}

impl NewVersion {
    pub fn tag(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            image_uri: None,
            deployment_identifier: None,
        }
    }

    pub fn with_image_uri(mut self, image_uri: impl Into<String>) -> Self {
        self.image_uri = Some(image_uri.into());
        self
    }

    pub fn with_deployment_identifier(mut self, deployment_identifier: impl Into<String>) -> Self {
        self.deployment_identifier = Some(deployment_identifier.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Deploy,
    Revert,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "Deploy",
            Self::Revert => "Revert",
        }
    }
}

/// Runs deploy and revert jobs against one environment.
pub struct Deployer {
    gateway: Arc<dyn EcsGateway>,
    config_source: Arc<dyn ContainerConfigSource>,
    metrics: Arc<dyn MetricsSink>,
    environment: String,
    application: String,
    poll: PollSettings,
}

impl Deployer {
    pub fn new(
        gateway: Arc<dyn EcsGateway>,
        config_source: Arc<dyn ContainerConfigSource>,
        metrics: Arc<dyn MetricsSink>,
        environment: impl Into<String>,
        application: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            config_source,
            metrics,
            environment: environment.into(),
            application: application.into(),
            poll: PollSettings::default(),
        }
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    async fn action_for(&self, target: &ServiceIdentity) -> Result<DeploymentAction> {
        Ok(
            DeploymentAction::new(self.gateway.clone(), &target.cluster, &target.ecs_service_name)
                .await?
                .with_poll_settings(self.poll.clone())
                .with_color(target.color),
        )
    }

    /// Build, register and roll out a new revision of the service's task definition.
    pub async fn deploy_new_version(
        &self,
        target: &ServiceIdentity,
        version: &NewVersion,
        timeout: Duration,
    ) -> Result<()> {
        let mut action = self.action_for(target).await?;
        let current = action.get_current_task_definition().await?;
        let candidate = self.build_new_task_definition(target, current, version).await?;
        let registered = action
            .register_task_definition(&candidate, version.deployment_identifier.as_deref())
            .await?;
        self.deploy_task_definition(action, registered, timeout, Phase::Deploy)
            .await
    }

    /// Roll the service back to the revision tagged with `deployment_identifier`.
    pub async fn revert_deployment(
        &self,
        target: &ServiceIdentity,
        deployment_identifier: &str,
        timeout: Duration,
    ) -> Result<()> {
        let mut action = self.action_for(target).await?;
        let previous = action
            .get_task_definition_by_deployment_identifier(deployment_identifier)
            .await?;
        action.set_task_definition(&previous)?;
        self.deploy_task_definition(action, previous, timeout, Phase::Revert)
            .await
    }

    /// Roll the service back one hop, following the previous-definition tag.
    pub async fn revert_to_previous(&self, target: &ServiceIdentity, timeout: Duration) -> Result<()> {
        let mut action = self.action_for(target).await?;
        let previous = action.get_previous_task_definition().await?;
        action.set_task_definition(&previous)?;
        self.deploy_task_definition(action, previous, timeout, Phase::Revert)
            .await
    }

    /// Retag the essential container and replace every container's environment
    /// and secrets with freshly assembled configuration.
    async fn build_new_task_definition(
        &self,
        target: &ServiceIdentity,
        mut snapshot: TaskDefinitionSnapshot,
        version: &NewVersion,
    ) -> Result<TaskDefinitionSnapshot> {
        let essential = snapshot.essential_container()?.to_string();

        let configs = self
            .config_source
            .build_container_config(&ConfigRequest {
                environment: self.environment.clone(),
                application: self.application.clone(),
                ecs_service_name: target.ecs_service_name.clone(),
                secrets_name: target.secrets_name.clone(),
                essential_container: essential.clone(),
            })
            .await?;

        let update = match &version.image_uri {
            Some(uri) => ImageUpdate::explicit(&essential, uri),
            None => ImageUpdate::tag(&essential, &version.version),
        };
        snapshot.set_images(&update)?;

        let empty = ContainerConfig::default();
        for name in snapshot.container_names() {
            let config = configs.get(&name).unwrap_or(&empty);
            snapshot.apply_container_environment_and_secrets(&name, config)?;
        }

        print_task_diff(&target.ecs_service_name, snapshot.diff(), target.color);
        Ok(snapshot)
    }

    async fn deploy_task_definition(
        &self,
        mut action: DeploymentAction,
        task_definition: TaskDefinitionSnapshot,
        timeout: Duration,
        phase: Phase,
    ) -> Result<()> {
        let service_name = action.service_name().to_string();
        let cluster = action.cluster().to_string();
        let color = action.color();

        if action.service().desired_count == 0 {
            action.set_desired_count(1);
        }

        console::log_with_color(
            &format!("{} {} to {}", phase.as_str(), service_name, task_definition.family_revision()),
            color,
        );

        let outcome = self
            .deploy_and_wait(&mut action, &task_definition, timeout)
            .await;

        match outcome {
            Ok(true) => {
                action.retire_superseded().await;
                console::log_with_color(
                    &format!("{} {}: Completed successfully.", service_name, phase.as_str()),
                    color,
                );
                info!(service = %service_name, phase = phase.as_str(), "Rollout completed");
                Ok(())
            }
            Ok(false) => {
                self.record_failure(&cluster, &service_name).await;
                Err(DeployError::unrecoverable(format!(
                    "{} {} failed.",
                    service_name,
                    phase.as_str()
                )))
            }
            Err(e) => {
                error!(service = %service_name, error = %e, "Rollout failed");
                self.record_failure(&cluster, &service_name).await;
                Err(DeployError::unrecoverable_from(
                    format!("{} {} failed.", service_name, phase.as_str()),
                    e,
                ))
            }
        }
    }

    /// The timeout runs from submission, so time spent in `UpdateService`
    /// counts against it.
    async fn deploy_and_wait(
        &self,
        action: &mut DeploymentAction,
        task_definition: &TaskDefinitionSnapshot,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let existing_events = action.fetch_events().await?;
        action.deploy(task_definition).await?;
        action
            .wait_for_finish(existing_events, deadline.saturating_duration_since(Instant::now()))
            .await
    }

    async fn record_failure(&self, cluster: &str, service: &str) {
        if let Err(e) = self.metrics.record_deployment_failure(cluster, service).await {
            warn!(cluster = %cluster, service = %service, error = %e, "Failed to record deployment failure metric");
        }
    }
}

/// Print what the new task definition changes, container by container.
pub fn print_task_diff(service_name: &str, diffs: &[TaskDefinitionDiff], color: DeployColor) {
    console::log_with_color(&format!("Deploying {}", service_name), color);

    let images: Vec<_> = diffs.iter().filter(|d| d.field() == DiffField::Image).collect();
    if images.is_empty() {
        console::log_with_color("No change in image version", color);
    } else {
        console::log_with_color("New image getting deployed", color);
        for diff in images {
            console::log_with_color(&diff.to_string(), color);
        }
    }

    for (field, label) in [
        (DiffField::Environment, "environment variables"),
        (DiffField::Secrets, "secrets"),
    ] {
        let mut changed = false;
        for diff in diffs.iter().filter(|d| d.field() == field) {
            let empty = BTreeMap::new();
            let old = diff.old_value().as_map().unwrap_or(&empty);
            let current = diff.value().as_map().unwrap_or(&empty);
            let rows = console::diff_rows(old, current);
            if rows.is_empty() {
                continue;
            }
            changed = true;
            let container = diff.container().unwrap_or_default();
            console::log_with_color(&format!("Updating {} of {}", label, container), color);
            console::log(&console::render_diff_table(rows));
        }
        if !changed {
            console::log_with_color(&format!("No change in {}", label), color);
        }
    }
}
