//! End-to-end rollout scenarios against the in-memory ECS gateway.
//!
//! Run with: cargo test --test deployment

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;

use cloudlift::collaborators::{
    ParameterStore, ParameterStoreConfigSource, SecretStore, SecretValue, SecretsCache,
    ServiceTarget,
};
use cloudlift::deployment::{
    Deployer, DeploymentCoordinator, DeploymentOutcome, NewVersion, PollSettings,
};
use cloudlift::ecs::{Deployment, EcsGateway, EcsService, GatewayError, MockEcsGateway};
use cloudlift::task_definition::{
    ContainerDefinition, TaskDefinitionSnapshot, DEPLOYMENT_IDENTIFIER_TAG,
    PREVIOUS_TASK_DEFINITION_TAG,
};
use cloudlift::utils::metrics::RecordingMetrics;

const CLUSTER: &str = "cluster-staging";

// ============================================================================
// Fixtures
// ============================================================================

struct FixedParameters(BTreeMap<String, String>);

#[async_trait]
impl ParameterStore for FixedParameters {
    async fn get_existing_config(
        &self,
        _environment: &str,
        _application: &str,
    ) -> Result<BTreeMap<String, String>, GatewayError> {
        Ok(self.0.clone())
    }
}

struct FixedSecret;

#[async_trait]
impl SecretStore for FixedSecret {
    async fn get_secret(&self, name: &str) -> Result<SecretValue, GatewayError> {
        Ok(SecretValue {
            arn: format!("arn:aws:secretsmanager:us-east-1:000000000000:secret:{}", name),
            version_id: "v1".to_string(),
            keys: vec!["DATABASE_URL".to_string()],
        })
    }
}

fn env_sample() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# required settings").unwrap();
    writeln!(file, "PORT=80").unwrap();
    writeln!(file, "DATABASE_URL=postgres://").unwrap();
    file
}

fn service_name(logical: &str) -> String {
    format!("dummy-staging-{}", logical)
}

fn family(logical: &str) -> String {
    format!("dummy-staging-{}-family", logical.to_lowercase())
}

fn settled(logical: &str, task_definition: &str, count: i32) -> EcsService {
    EcsService {
        cluster: CLUSTER.to_string(),
        name: service_name(logical),
        task_definition: task_definition.to_string(),
        desired_count: count,
        running_count: count,
        pending_count: 0,
        deployments: vec![Deployment::primary(task_definition, count, count)],
        events: Vec::new(),
    }
}

/// Register revisions 1..=n for a service, each tagged `id-{rev - 1}` and
/// chained through the previous-definition tag, and point the service at n.
async fn seed(mock: &MockEcsGateway, logical: &str, revisions: i32) -> Vec<String> {
    let mut arns = Vec::new();
    for revision in 1..=revisions {
        let mut snapshot = TaskDefinitionSnapshot::new(
            family(logical),
            vec![ContainerDefinition::new(
                "WebContainer",
                "000000000000.dkr.ecr.us-east-1.amazonaws.com/dummy-repo:v1",
            )
            .essential(true)],
        )
        .unwrap()
        .with_arn(MockEcsGateway::arn_for(&family(logical), revision), revision)
        .with_tag(DEPLOYMENT_IDENTIFIER_TAG, format!("id-{}", revision - 1));
        if let Some(previous) = arns.last() {
            snapshot = snapshot.with_tag(PREVIOUS_TASK_DEFINITION_TAG, String::clone(previous));
        }
        arns.push(mock.add_task_definition(snapshot).await);
    }
    let current = arns.last().cloned().unwrap_or_default();
    mock.push_service_state(settled(logical, &current, 1)).await;
    arns
}

fn targets(names: &[&str]) -> BTreeMap<String, ServiceTarget> {
    names
        .iter()
        .map(|name| {
            (
                name.to_string(),
                ServiceTarget {
                    logical_name: name.to_string(),
                    ecs_service_name: service_name(name),
                    secrets_name: Some(format!("dummy/{}", name.to_lowercase())),
                },
            )
        })
        .collect()
}

fn coordinator(
    mock: &Arc<MockEcsGateway>,
    metrics: &Arc<RecordingMetrics>,
    sample: &NamedTempFile,
    timeout: Duration,
) -> DeploymentCoordinator {
    let config_source = ParameterStoreConfigSource::new(
        Arc::new(FixedParameters(BTreeMap::from([
            ("PORT".to_string(), "80".to_string()),
            ("UNLISTED".to_string(), "dropped".to_string()),
        ]))),
        Arc::new(FixedSecret),
        Arc::new(SecretsCache::new()),
        sample.path(),
    );
    let gateway: Arc<dyn EcsGateway> = mock.clone();
    let deployer = Deployer::new(
        gateway,
        Arc::new(config_source),
        metrics.clone(),
        "staging",
        "dummy",
    )
    .with_poll_settings(PollSettings {
        interval: Duration::from_secs(5),
        fail_on_placement_errors: false,
    });

    DeploymentCoordinator::new(Arc::new(deployer), CLUSTER, timeout).with_concurrency(2)
}

// ============================================================================
// Deploy
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_deploy_all_registers_configures_and_retires() {
    let mock = Arc::new(MockEcsGateway::new());
    let web = seed(&mock, "Web", 2).await;
    let worker = seed(&mock, "Worker", 2).await;
    mock.set_converge_on_update(true).await;
    let metrics = Arc::new(RecordingMetrics::new());
    let sample = env_sample();

    let records = coordinator(&mock, &metrics, &sample, Duration::from_secs(60))
        .deploy_all(
            &targets(&["Web", "Worker"]),
            NewVersion::tag("v2").with_deployment_identifier("id-2"),
        )
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.outcome == DeploymentOutcome::Succeeded));

    let registered = mock.registered().await;
    assert_eq!(registered.len(), 2);
    for request in &registered {
        let container = &request.containers[0];
        assert!(container.image.ends_with("dummy-repo:v2"));
        assert_eq!(container.environment_map().get("PORT").map(String::as_str), Some("80"));
        assert!(!container.environment_map().contains_key("UNLISTED"));
        assert!(container.secrets_map()["DATABASE_URL"].ends_with(":DATABASE_URL::v1"));
        assert_eq!(
            request.tags.get(DEPLOYMENT_IDENTIFIER_TAG).map(String::as_str),
            Some("id-2")
        );
    }

    // the definition two hops back goes; the one the new revision points at stays
    let mut deregistered = mock.deregistered().await;
    deregistered.sort();
    let mut expected = vec![web[0].clone(), worker[0].clone()];
    expected.sort();
    assert_eq!(deregistered, expected);
    assert!(metrics.failures().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rollout_progress_is_polled_to_completion() {
    let mock = Arc::new(MockEcsGateway::new());
    let arns = seed(&mock, "Web", 1).await;
    let next = MockEcsGateway::arn_for(&family("Web"), 2);

    let mut rolling = settled("Web", &next, 1);
    rolling.running_count = 0;
    rolling.pending_count = 1;
    rolling.deployments[0].running_count = 0;
    let mut old = Deployment::primary(arns[0].clone(), 1, 1);
    old.status = "ACTIVE".to_string();
    rolling.deployments.push(old);

    // events read before UpdateService, one poll mid-rollout, then settled
    mock.push_service_state(settled("Web", &arns[0], 1)).await;
    mock.push_service_state(rolling).await;
    mock.push_service_state(settled("Web", &next, 1)).await;

    let metrics = Arc::new(RecordingMetrics::new());
    let sample = env_sample();
    coordinator(&mock, &metrics, &sample, Duration::from_secs(60))
        .deploy_all(&targets(&["Web"]), NewVersion::tag("v2"))
        .await
        .unwrap();

    let updates = mock.updates().await;
    assert_eq!(updates[0].task_definition.as_deref(), Some(next.as_str()));
    assert_eq!(mock.describe_service_calls().await, 4);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_batch_and_records_metric() {
    let mock = Arc::new(MockEcsGateway::new());
    let arns = seed(&mock, "Web", 1).await;
    let mut stuck = settled("Web", &arns[0], 1);
    stuck.running_count = 0;
    stuck.deployments.push(Deployment::primary(arns[0].clone(), 1, 0));
    mock.push_service_state(stuck).await;

    let metrics = Arc::new(RecordingMetrics::new());
    let sample = env_sample();
    let err = coordinator(&mock, &metrics, &sample, Duration::from_secs(2))
        .deploy_all(&targets(&["Web"]), NewVersion::tag("v2"))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Deploy failed");
    assert_eq!(
        metrics.failures().await,
        vec![(CLUSTER.to_string(), service_name("Web"))]
    );
    assert!(mock.deregistered().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_one_failure_does_not_abandon_other_rollouts() {
    let mock = Arc::new(MockEcsGateway::new());
    for name in ["Api", "Web", "Worker", "Cron"] {
        seed(&mock, name, 2).await;
    }
    mock.set_converge_on_update(true).await;
    mock.fail_update_for(&service_name("Web")).await;

    let metrics = Arc::new(RecordingMetrics::new());
    let sample = env_sample();
    let err = coordinator(&mock, &metrics, &sample, Duration::from_secs(60))
        .deploy_all(
            &targets(&["Api", "Web", "Worker", "Cron"]),
            NewVersion::tag("v2"),
        )
        .await
        .unwrap_err();

    assert!(err.is_unrecoverable());
    let updated: Vec<String> = mock.updates().await.into_iter().map(|u| u.service).collect();
    assert_eq!(updated.len(), 3);
    assert!(!updated.contains(&service_name("Web")));
    assert_eq!(mock.deregistered().await.len(), 3);
}

#[tokio::test]
async fn test_missing_sample_key_stops_before_registration() {
    let mock = Arc::new(MockEcsGateway::new());
    seed(&mock, "Web", 1).await;
    let metrics = Arc::new(RecordingMetrics::new());

    let mut sample = env_sample();
    writeln!(sample, "SMTP_HOST=localhost").unwrap();

    let err = coordinator(&mock, &metrics, &sample, Duration::from_secs(60))
        .deploy_all(&targets(&["Web"]), NewVersion::tag("v2"))
        .await
        .unwrap_err();

    let cause = std::error::Error::source(&err).map(ToString::to_string);
    assert_eq!(
        cause.as_deref(),
        Some("There is no config value for the keys SMTP_HOST")
    );
    assert!(mock.registered().await.is_empty());
}

// ============================================================================
// Revert
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_revert_by_deployment_identifier() {
    let mock = Arc::new(MockEcsGateway::new());
    mock.set_page_size(1).await;
    let arns = seed(&mock, "Web", 4).await;
    mock.set_converge_on_update(true).await;

    let metrics = Arc::new(RecordingMetrics::new());
    let sample = env_sample();
    coordinator(&mock, &metrics, &sample, Duration::from_secs(60))
        .revert_all(&targets(&["Web"]), "id-1")
        .await
        .unwrap();

    let updates = mock.updates().await;
    assert_eq!(updates[0].task_definition.as_deref(), Some(arns[1].as_str()));
    assert!(mock.registered().await.is_empty());
    // revision 2 points back at revision 1, which is not the running definition
    assert_eq!(mock.deregistered().await, vec![arns[0].clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_revert_to_previous_keeps_running_definition() {
    let mock = Arc::new(MockEcsGateway::new());
    let arns = seed(&mock, "Web", 3).await;
    mock.set_converge_on_update(true).await;

    let metrics = Arc::new(RecordingMetrics::new());
    let sample = env_sample();
    coordinator(&mock, &metrics, &sample, Duration::from_secs(60))
        .revert_all_to_previous(&targets(&["Web"]))
        .await
        .unwrap();

    assert_eq!(
        mock.updates().await[0].task_definition.as_deref(),
        Some(arns[1].as_str())
    );
    assert_eq!(mock.deregistered().await, vec![arns[0].clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_revert_to_running_identifier_deregisters_nothing() {
    let mock = Arc::new(MockEcsGateway::new());
    let arns = seed(&mock, "Web", 2).await;
    mock.set_converge_on_update(true).await;

    let metrics = Arc::new(RecordingMetrics::new());
    let sample = env_sample();
    coordinator(&mock, &metrics, &sample, Duration::from_secs(60))
        .revert_all(&targets(&["Web"]), "id-1")
        .await
        .unwrap();

    assert_eq!(
        mock.updates().await[0].task_definition.as_deref(),
        Some(arns[1].as_str())
    );
    assert!(mock.deregistered().await.is_empty());
}

#[tokio::test]
async fn test_revert_unknown_identifier_fails() {
    let mock = Arc::new(MockEcsGateway::new());
    seed(&mock, "Web", 2).await;

    let metrics = Arc::new(RecordingMetrics::new());
    let sample = env_sample();
    let err = coordinator(&mock, &metrics, &sample, Duration::from_secs(60))
        .revert_all(&targets(&["Web"]), "id-9")
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Revert failed");
    assert!(mock.updates().await.is_empty());
}
