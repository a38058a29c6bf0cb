//! Lifecycle of one service rollout.
//!
//! `Init` (service loaded) -> `TaskDefinitionSet` -> `Updating` -> `Polling`
//! -> `Succeeded` | `Failed` | `TimedOut`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DeploymentConfig;
use crate::console::{self, DeployColor};
use crate::ecs::{
    EcsGateway, EcsService, RegisterTaskDefinition, RunTaskRequest, ServiceEvent,
    UpdateServiceRequest,
};
use crate::error::{DeployError, Result};
use crate::task_definition::TaskDefinitionSnapshot;

/// ECS task status counted by `running_tasks_count`.
const RUNNING: &str = "RUNNING";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Init,
    TaskDefinitionSet,
    Updating,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
}

/// How the poll loop paces itself and what it treats as failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub fail_on_placement_errors: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::config::DEFAULT_POLL_INTERVAL_SECS),
            fail_on_placement_errors: false,
        }
    }
}

impl From<&DeploymentConfig> for PollSettings {
    fn from(config: &DeploymentConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            fail_on_placement_errors: config.fail_on_placement_errors,
        }
    }
}

/// Drives one ECS service from its current task definition to a new one.
pub struct DeploymentAction {
    gateway: Arc<dyn EcsGateway>,
    service: EcsService,
    state: DeploymentState,
    poll: PollSettings,
    color: DeployColor,
    /// Definition to deregister once the new one is serving.
    pending_retirement: Option<String>,
}

impl DeploymentAction {
    /// Load the service; connection problems surface as `EcsConnection`.
    pub async fn new(gateway: Arc<dyn EcsGateway>, cluster: &str, service: &str) -> Result<Self> {
        let service = gateway
            .describe_service(cluster, service)
            .await
            .map_err(DeployError::connection)?;

        Ok(Self {
            gateway,
            service,
            state: DeploymentState::Init,
            poll: PollSettings::default(),
            color: DeployColor::Blue,
            pending_retirement: None,
        })
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_color(mut self, color: DeployColor) -> Self {
        self.color = color;
        self
    }

    pub fn service(&self) -> &EcsService {
        &self.service
    }

    pub fn cluster(&self) -> &str {
        &self.service.cluster
    }

    pub fn service_name(&self) -> &str {
        &self.service.name
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    pub fn color(&self) -> DeployColor {
        self.color
    }

    /// ARN scheduled for deregistration after a successful cutover.
    pub fn pending_retirement(&self) -> Option<&str> {
        self.pending_retirement.as_deref()
    }

    /// Events ECS currently reports for the service, oldest first.
    pub async fn fetch_events(&self) -> Result<Vec<ServiceEvent>> {
        Ok(self
            .gateway
            .describe_service(&self.service.cluster, &self.service.name)
            .await?
            .sorted_events())
    }

    // ------------------------------------------------------------------
    // Task definition lookup
    // ------------------------------------------------------------------

    pub async fn get_current_task_definition(&self) -> Result<TaskDefinitionSnapshot> {
        Ok(self
            .gateway
            .describe_task_definition(&self.service.task_definition)
            .await?)
    }

    /// The definition the current one was derived from.
    pub async fn get_previous_task_definition(&self) -> Result<TaskDefinitionSnapshot> {
        let current = self.get_current_task_definition().await?;
        let previous = current.previous_task_definition_arn().ok_or_else(|| {
            DeployError::unrecoverable(
                "previous_task_definition_arn tag does not exist for current task definition",
            )
        })?;
        Ok(self.gateway.describe_task_definition(previous).await?)
    }

    /// Newest revision of the service's family tagged with `deployment_identifier`.
    pub async fn get_task_definition_by_deployment_identifier(
        &self,
        deployment_identifier: &str,
    ) -> Result<TaskDefinitionSnapshot> {
        let family = self.get_current_task_definition().await?.family().to_string();
        let mut next_token = None;

        loop {
            let page = self
                .gateway
                .list_task_definitions(&family, next_token)
                .await?;

            for arn in &page.arns {
                let candidate = self.gateway.describe_task_definition(arn).await?;
                if candidate.deployment_identifier() == Some(deployment_identifier) {
                    debug!(
                        arn = %arn,
                        deployment_identifier = %deployment_identifier,
                        "Found task definition for deployment identifier"
                    );
                    return Ok(candidate);
                }
            }

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        Err(DeployError::unrecoverable(format!(
            "No task definition found in family {} with deployment_identifier {}",
            family, deployment_identifier
        )))
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Register a new revision built from `snapshot`.
    ///
    /// The new revision points back at `snapshot`; the definition `snapshot`
    /// itself pointed back at is retired once the rollout succeeds.
    pub async fn register_task_definition(
        &mut self,
        snapshot: &TaskDefinitionSnapshot,
        deployment_identifier: Option<&str>,
    ) -> Result<TaskDefinitionSnapshot> {
        let request = RegisterTaskDefinition::from_snapshot(
            snapshot,
            snapshot.registration_tags(deployment_identifier),
        );
        let registered = self.gateway.register_task_definition(&request).await?;

        info!(
            service = %self.service.name,
            arn = ?registered.arn(),
            previous = ?snapshot.arn(),
            "Registered new task definition"
        );

        self.pending_retirement = snapshot.previous_task_definition_arn().map(str::to_string);
        self.attach(&registered)?;
        Ok(registered)
    }

    /// Point the service at an existing revision (revert).
    ///
    /// The revision's own predecessor is retired after success unless it is
    /// the definition the service is running now. Re-applying the running
    /// revision retires nothing.
    pub fn set_task_definition(&mut self, snapshot: &TaskDefinitionSnapshot) -> Result<()> {
        let current = self.service.task_definition.clone();
        self.pending_retirement = if snapshot.arn() == Some(current.as_str()) {
            None
        } else {
            snapshot
                .previous_task_definition_arn()
                .filter(|previous| *previous != current)
                .map(str::to_string)
        };
        self.attach(snapshot)
    }

    fn attach(&mut self, snapshot: &TaskDefinitionSnapshot) -> Result<()> {
        let arn = snapshot.arn().ok_or_else(|| {
            DeployError::unrecoverable(format!(
                "task definition {} has no ARN",
                snapshot.family()
            ))
        })?;
        self.service.task_definition = arn.to_string();
        self.state = DeploymentState::TaskDefinitionSet;
        Ok(())
    }

    pub fn set_desired_count(&mut self, desired_count: i32) {
        self.service.desired_count = desired_count;
    }

    /// Issue `UpdateService` for the attached task definition. Does not wait.
    pub async fn deploy(&mut self, task_definition: &TaskDefinitionSnapshot) -> Result<()> {
        if self.state != DeploymentState::TaskDefinitionSet {
            self.set_task_definition(task_definition)?;
        }

        self.gateway
            .update_service(&UpdateServiceRequest {
                cluster: self.service.cluster.clone(),
                service: self.service.name.clone(),
                task_definition: Some(self.service.task_definition.clone()),
                desired_count: Some(self.service.desired_count),
            })
            .await?;

        self.state = DeploymentState::Updating;
        Ok(())
    }

    /// Poll until the service settles on one deployment with every desired
    /// task running, or the timeout elapses.
    ///
    /// New events are printed in this action's color. Timeout is not an
    /// error: ECS keeps rolling out, and the caller decides what to do.
    pub async fn wait_for_finish(
        &mut self,
        mut existing_events: Vec<ServiceEvent>,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        self.state = DeploymentState::Polling;

        while Instant::now() <= deadline {
            let service = self
                .gateway
                .describe_service(&self.service.cluster, &self.service.name)
                .await?;

            let new_events = service.new_events(&existing_events);
            for event in &new_events {
                console::log_with_color(&event.display_message(), self.color);
            }

            let placement_failures: Vec<&ServiceEvent> = service
                .placement_warnings()
                .into_iter()
                .filter(|e| new_events.iter().any(|seen| seen.id == e.id))
                .collect();
            for event in &placement_failures {
                warn!(service = %service.name, message = %event.message, "Task placement problem");
            }
            let unable_to_place = !placement_failures.is_empty();

            existing_events = service.sorted_events();
            let deployed = service.is_deployed();
            self.service = service;

            if deployed {
                self.state = DeploymentState::Succeeded;
                return Ok(true);
            }

            if self.poll.fail_on_placement_errors && unable_to_place {
                console::log_err(&format!("{}: unable to place tasks", self.service.name));
                self.state = DeploymentState::Failed;
                return Ok(false);
            }

            tokio::time::sleep(self.poll.interval).await;
        }

        console::log_err("Deployment timed out!");
        warn!(service = %self.service.name, timeout_secs = timeout.as_secs(), "Deployment timed out!");
        self.state = DeploymentState::TimedOut;
        Ok(false)
    }

    /// Deregister the superseded definition, if any. Failures only warn.
    pub async fn retire_superseded(&mut self) {
        let Some(arn) = self.pending_retirement.take() else {
            return;
        };

        match self.gateway.deregister_task_definition(&arn).await {
            Ok(()) => info!(service = %self.service.name, arn = %arn, "Deregistered task definition"),
            Err(e) => warn!(
                service = %self.service.name,
                arn = %arn,
                error = %e,
                "Failed to deregister task definition"
            ),
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub async fn scale(&mut self, desired_count: i32) -> Result<()> {
        self.gateway
            .update_service(&UpdateServiceRequest {
                cluster: self.service.cluster.clone(),
                service: self.service.name.clone(),
                task_definition: None,
                desired_count: Some(desired_count),
            })
            .await?;
        self.service.desired_count = desired_count;
        info!(service = %self.service.name, desired_count, "Scaled service");
        Ok(())
    }

    /// Tasks RUNNING on the service's current task definition.
    pub async fn running_tasks_count(&self) -> Result<usize> {
        let arns = self
            .gateway
            .list_tasks(&self.service.cluster, &self.service.name)
            .await?;
        if arns.is_empty() {
            return Ok(0);
        }

        let tasks = self.gateway.describe_tasks(&self.service.cluster, &arns).await?;
        Ok(tasks
            .iter()
            .filter(|t| t.last_status == RUNNING && t.task_definition_arn == self.service.task_definition)
            .count())
    }
}

/// One-off task runs from a task definition plus its diff-derived overrides.
pub struct RunTaskAction {
    gateway: Arc<dyn EcsGateway>,
    cluster: String,
}

impl RunTaskAction {
    pub fn new(gateway: Arc<dyn EcsGateway>, cluster: impl Into<String>) -> Self {
        Self {
            gateway,
            cluster: cluster.into(),
        }
    }

    pub async fn run(
        &self,
        snapshot: &TaskDefinitionSnapshot,
        count: i32,
        started_by: Option<&str>,
    ) -> Result<Vec<String>> {
        let request = RunTaskRequest {
            cluster: self.cluster.clone(),
            task_definition: snapshot.family_revision(),
            count,
            started_by: started_by.map(str::to_string),
            overrides: snapshot.get_overrides(),
        };
        let started = self.gateway.run_task(&request).await?;
        info!(
            cluster = %self.cluster,
            task_definition = %request.task_definition,
            started = started.len(),
            "Started one-off tasks"
        );
        Ok(started)
    }
}
