//! Runs one deploy or revert job per service with bounded concurrency.
//!
//! Every job is submitted up front; a semaphore caps how many touch ECS at
//! once. The coordinator then joins every handle, including after a failure,
//! and only then fails the batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tabled::{Table, Tabled};
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::collaborators::ServiceTarget;
use crate::config::DEFAULT_CONCURRENCY;
use crate::console::{self, DeployColor};
use crate::deployment::deployer::{Deployer, NewVersion, ServiceIdentity};
use crate::error::{DeployError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Deploy(NewVersion),
    Revert { deployment_identifier: String },
    RevertToPrevious,
}

impl Job {
    fn phase(&self) -> &'static str {
        match self {
            Self::Deploy(_) => "Deploy",
            Self::Revert { .. } | Self::RevertToPrevious => "Revert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentOutcome {
    Succeeded,
    Failed(String),
}

impl DeploymentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Result of one service's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub logical_name: String,
    pub ecs_service_name: String,
    pub secrets_name: Option<String>,
    pub color: DeployColor,
    pub outcome: DeploymentOutcome,
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "ECS service")]
    ecs_service: String,
    #[tabled(rename = "Result")]
    result: String,
}

pub struct DeploymentCoordinator {
    deployer: Arc<Deployer>,
    cluster: String,
    concurrency: usize,
    timeout: Duration,
}

impl DeploymentCoordinator {
    pub fn new(deployer: Arc<Deployer>, cluster: impl Into<String>, timeout: Duration) -> Self {
        Self {
            deployer,
            cluster: cluster.into(),
            concurrency: DEFAULT_CONCURRENCY,
            timeout,
        }
    }

    /// Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn deploy_all(
        &self,
        services: &BTreeMap<String, ServiceTarget>,
        version: NewVersion,
    ) -> Result<Vec<DeploymentRecord>> {
        self.run_for_all(services, Job::Deploy(version)).await
    }

    pub async fn revert_all(
        &self,
        services: &BTreeMap<String, ServiceTarget>,
        deployment_identifier: &str,
    ) -> Result<Vec<DeploymentRecord>> {
        self.run_for_all(
            services,
            Job::Revert {
                deployment_identifier: deployment_identifier.to_string(),
            },
        )
        .await
    }

    pub async fn revert_all_to_previous(
        &self,
        services: &BTreeMap<String, ServiceTarget>,
    ) -> Result<Vec<DeploymentRecord>> {
        self.run_for_all(services, Job::RevertToPrevious).await
    }

    /// Submit one job per service in name order, then await all of them.
    pub async fn run_for_all(
        &self,
        services: &BTreeMap<String, ServiceTarget>,
        job: Job,
    ) -> Result<Vec<DeploymentRecord>> {
        let phase = job.phase();
        console::log_bold(&format!("{} concurrency: {}", phase, self.concurrency));

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut identities = Vec::with_capacity(services.len());
        let mut handles = Vec::with_capacity(services.len());

        for (index, (logical_name, target)) in services.iter().enumerate() {
            let identity = ServiceIdentity {
                cluster: self.cluster.clone(),
                ecs_service_name: target.ecs_service_name.clone(),
                secrets_name: target.secrets_name.clone(),
                color: DeployColor::for_index(index),
            };
            console::log_with_color(
                &format!("Queueing {} of {}", phase, identity.ecs_service_name),
                identity.color,
            );

            let semaphore = semaphore.clone();
            let deployer = self.deployer.clone();
            let job = job.clone();
            let timeout = self.timeout;
            let task_identity = identity.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| DeployError::unrecoverable(e.to_string()))?;
                match job {
                    Job::Deploy(version) => {
                        deployer
                            .deploy_new_version(&task_identity, &version, timeout)
                            .await
                    }
                    Job::Revert {
                        deployment_identifier,
                    } => {
                        deployer
                            .revert_deployment(&task_identity, &deployment_identifier, timeout)
                            .await
                    }
                    Job::RevertToPrevious => deployer.revert_to_previous(&task_identity, timeout).await,
                }
            });

            identities.push((logical_name.clone(), identity));
            handles.push(handle);
        }

        let results = join_all(handles).await;
        let mut records = Vec::with_capacity(results.len());
        let mut first_failure: Option<DeployError> = None;

        for ((logical_name, identity), result) in identities.into_iter().zip(results) {
            let outcome = match result {
                Ok(Ok(())) => DeploymentOutcome::Succeeded,
                Ok(Err(e)) => {
                    error!(service = %identity.ecs_service_name, error = %e, "{} job failed", phase);
                    let message = e.to_string();
                    first_failure.get_or_insert(e);
                    DeploymentOutcome::Failed(message)
                }
                Err(join_error) => {
                    let message = format!("{} job aborted: {}", phase, join_error);
                    error!(service = %identity.ecs_service_name, error = %join_error, "{} job aborted", phase);
                    first_failure.get_or_insert_with(|| DeployError::unrecoverable(message.clone()));
                    DeploymentOutcome::Failed(message)
                }
            };

            records.push(DeploymentRecord {
                logical_name,
                ecs_service_name: identity.ecs_service_name,
                secrets_name: identity.secrets_name,
                color: identity.color,
                outcome,
            });
        }

        print_summary(&records);

        if let Some(cause) = first_failure {
            return Err(DeployError::unrecoverable_from(format!("{} failed", phase), cause));
        }

        info!(phase, services = records.len(), "All jobs completed");
        Ok(records)
    }
}

fn print_summary(records: &[DeploymentRecord]) {
    if records.is_empty() {
        return;
    }
    let rows: Vec<SummaryRow> = records
        .iter()
        .map(|r| SummaryRow {
            service: r.logical_name.clone(),
            ecs_service: r.ecs_service_name.clone(),
            result: match &r.outcome {
                DeploymentOutcome::Succeeded => "succeeded".to_string(),
                DeploymentOutcome::Failed(message) => format!("failed: {}", message),
            },
        })
        .collect();
    console::log(&Table::new(rows).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticConfigSource;
    use crate::deployment::action::PollSettings;
    use crate::ecs::{Deployment, EcsService, MockEcsGateway};
    use crate::task_definition::{ContainerDefinition, TaskDefinitionSnapshot};
    use crate::utils::metrics::RecordingMetrics;

    const CLUSTER: &str = "cluster-staging";

    fn target(name: &str) -> ServiceTarget {
        ServiceTarget {
            logical_name: name.to_string(),
            ecs_service_name: format!("dummy-staging-{}", name),
            secrets_name: None,
        }
    }

    async fn seed(mock: &MockEcsGateway, name: &str) {
        let family = format!("dummy-{}", name.to_lowercase());
        let arn = mock
            .add_task_definition(
                TaskDefinitionSnapshot::new(
                    family,
                    vec![ContainerDefinition::new("App", "dummy-repo:v1").essential(true)],
                )
                .unwrap(),
            )
            .await;
        mock.push_service_state(EcsService {
            cluster: CLUSTER.to_string(),
            name: format!("dummy-staging-{}", name),
            task_definition: arn.clone(),
            desired_count: 1,
            running_count: 1,
            pending_count: 0,
            deployments: vec![Deployment::primary(arn, 1, 1)],
            events: Vec::new(),
        })
        .await;
    }

    fn coordinator(mock: &Arc<MockEcsGateway>, metrics: &Arc<RecordingMetrics>) -> DeploymentCoordinator {
        let deployer = Deployer::new(
            mock.clone(),
            Arc::new(StaticConfigSource::new(BTreeMap::new())),
            metrics.clone(),
            "staging",
            "dummy",
        )
        .with_poll_settings(PollSettings {
            interval: Duration::from_secs(1),
            fail_on_placement_errors: false,
        });
        DeploymentCoordinator::new(Arc::new(deployer), CLUSTER, Duration::from_secs(30))
            .with_concurrency(2)
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_all_succeeds_in_name_order() {
        let mock = Arc::new(MockEcsGateway::new());
        let mut services = BTreeMap::new();
        for name in ["Worker", "Api", "Web"] {
            seed(&mock, name).await;
            services.insert(name.to_string(), target(name));
        }
        mock.set_converge_on_update(true).await;
        let metrics = Arc::new(RecordingMetrics::new());

        let records = coordinator(&mock, &metrics)
            .deploy_all(&services, NewVersion::tag("v2"))
            .await
            .unwrap();

        let names: Vec<_> = records.iter().map(|r| r.logical_name.as_str()).collect();
        assert_eq!(names, vec!["Api", "Web", "Worker"]);
        assert!(records.iter().all(|r| r.outcome.is_success()));
        assert_eq!(records[0].color, DeployColor::Blue);
        assert_eq!(records[1].color, DeployColor::Magenta);
        assert_eq!(mock.updates().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_waits_for_every_job() {
        let mock = Arc::new(MockEcsGateway::new());
        let mut services = BTreeMap::new();
        for name in ["Api", "Web", "Worker"] {
            seed(&mock, name).await;
            services.insert(name.to_string(), target(name));
        }
        mock.set_converge_on_update(true).await;
        mock.fail_update_for("dummy-staging-Api").await;
        let metrics = Arc::new(RecordingMetrics::new());

        let err = coordinator(&mock, &metrics)
            .deploy_all(&services, NewVersion::tag("v2"))
            .await
            .unwrap_err();

        assert!(err.is_unrecoverable());
        assert_eq!(err.to_string(), "Deploy failed");
        assert_eq!(mock.updates().await.len(), 2);
        assert_eq!(mock.registered().await.len(), 3);
        assert_eq!(
            metrics.failures().await,
            vec![(CLUSTER.to_string(), "dummy-staging-Api".to_string())]
        );
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let mock = Arc::new(MockEcsGateway::new());
        let metrics = Arc::new(RecordingMetrics::new());
        assert_eq!(coordinator(&mock, &metrics).with_concurrency(0).concurrency(), 1);
    }
}
