//! In-memory ECS gateway for testing.
//!
//! Service descriptions are scripted: each `describe_service` call consumes the
//! next queued state, and the last state repeats once the queue is down to one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::ecs::{
    Deployment, EcsGateway, EcsService, GatewayError, RegisterTaskDefinition, Result, RunTaskRequest,
    TaskDefinitionPage, TaskSummary, UpdateServiceRequest,
};
use crate::task_definition::TaskDefinitionSnapshot;

type ServiceKey = (String, String);

fn key(cluster: &str, service: &str) -> ServiceKey {
    (cluster.to_string(), service.to_string())
}

/// Mock gateway recording every mutating call.
#[derive(Default)]
pub struct MockEcsGateway {
    services: RwLock<HashMap<ServiceKey, VecDeque<EcsService>>>,
    task_definitions: RwLock<HashMap<String, TaskDefinitionSnapshot>>,
    families: RwLock<HashMap<String, Vec<String>>>,
    inactive: RwLock<HashSet<String>>,
    tasks: RwLock<HashMap<ServiceKey, Vec<TaskSummary>>>,
    registered: RwLock<Vec<RegisterTaskDefinition>>,
    deregistered: RwLock<Vec<String>>,
    updates: RwLock<Vec<UpdateServiceRequest>>,
    run_requests: RwLock<Vec<RunTaskRequest>>,
    describe_calls: RwLock<usize>,
    page_size: RwLock<Option<usize>>,
    converge_on_update: RwLock<bool>,
    fail_update_for: RwLock<HashSet<String>>,
    update_latency: RwLock<Option<Duration>>,
    fail_on_deregister: RwLock<bool>,
    missing_credentials: RwLock<bool>,
}

impl MockEcsGateway {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Queue a state returned by a later `describe_service`.
    pub async fn push_service_state(&self, service: EcsService) {
        let mut services = self.services.write().await;
        services
            .entry(key(&service.cluster, &service.name))
            .or_default()
            .push_back(service);
    }

    /// Make a task definition describable and listable.
    ///
    /// Snapshots without an ARN get one derived from family and revision.
    pub async fn add_task_definition(&self, snapshot: TaskDefinitionSnapshot) -> String {
        let snapshot = match snapshot.arn() {
            Some(_) => snapshot,
            None => {
                let arn = Self::arn_for(snapshot.family(), snapshot.revision());
                let revision = snapshot.revision();
                snapshot.with_arn(arn, revision)
            }
        };
        let arn = snapshot.arn().unwrap_or_default().to_string();

        self.families
            .write()
            .await
            .entry(snapshot.family().to_string())
            .or_default()
            .push(arn.clone());
        self.task_definitions.write().await.insert(arn.clone(), snapshot);
        arn
    }

    pub async fn set_tasks(&self, cluster: &str, service: &str, tasks: Vec<TaskSummary>) {
        self.tasks.write().await.insert(key(cluster, service), tasks);
    }

    /// Split `ListTaskDefinitions` results into pages of `size`.
    pub async fn set_page_size(&self, size: usize) {
        *self.page_size.write().await = Some(size.max(1));
    }

    /// After `update_service`, report the service as settled on the new
    /// task definition.
    pub async fn set_converge_on_update(&self, converge: bool) {
        *self.converge_on_update.write().await = converge;
    }

    pub async fn fail_update_for(&self, service: &str) {
        self.fail_update_for.write().await.insert(service.to_string());
    }

    /// Delay every `update_service` by `latency` before it is recorded.
    pub async fn set_update_latency(&self, latency: Duration) {
        *self.update_latency.write().await = Some(latency);
    }

    pub async fn set_fail_on_deregister(&self, fail: bool) {
        *self.fail_on_deregister.write().await = fail;
    }

    pub async fn set_missing_credentials(&self, missing: bool) {
        *self.missing_credentials.write().await = missing;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub async fn registered(&self) -> Vec<RegisterTaskDefinition> {
        self.registered.read().await.clone()
    }

    pub async fn deregistered(&self) -> Vec<String> {
        self.deregistered.read().await.clone()
    }

    pub async fn updates(&self) -> Vec<UpdateServiceRequest> {
        self.updates.read().await.clone()
    }

    pub async fn run_requests(&self) -> Vec<RunTaskRequest> {
        self.run_requests.read().await.clone()
    }

    pub async fn describe_service_calls(&self) -> usize {
        *self.describe_calls.read().await
    }

    pub fn arn_for(family: &str, revision: i32) -> String {
        format!(
            "arn:aws:ecs:us-east-1:000000000000:task-definition/{}:{}",
            family, revision
        )
    }

    async fn check_credentials(&self) -> Result<()> {
        if *self.missing_credentials.read().await {
            return Err(GatewayError::NoCredentials);
        }
        Ok(())
    }
}

#[async_trait]
impl EcsGateway for MockEcsGateway {
    async fn describe_service(&self, cluster: &str, service: &str) -> Result<EcsService> {
        self.check_credentials().await?;
        *self.describe_calls.write().await += 1;

        let mut services = self.services.write().await;
        let queue = services
            .get_mut(&key(cluster, service))
            .ok_or_else(|| GatewayError::ServiceNotFound {
                cluster: cluster.to_string(),
                service: service.to_string(),
            })?;

        let state = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        state.ok_or_else(|| GatewayError::ServiceNotFound {
            cluster: cluster.to_string(),
            service: service.to_string(),
        })
    }

    async fn describe_task_definition(&self, arn: &str) -> Result<TaskDefinitionSnapshot> {
        self.check_credentials().await?;
        self.task_definitions
            .read()
            .await
            .get(arn)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownTaskDefinition(arn.to_string()))
    }

    async fn list_task_definitions(
        &self,
        family: &str,
        next_token: Option<String>,
    ) -> Result<TaskDefinitionPage> {
        let inactive = self.inactive.read().await;
        let arns: Vec<String> = self
            .families
            .read()
            .await
            .get(family)
            .map(|arns| {
                arns.iter()
                    .rev()
                    .filter(|arn| !inactive.contains(*arn))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let start = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| GatewayError::api("ListTaskDefinitions", "invalid next token"))?,
            None => 0,
        };
        let size = self.page_size.read().await.unwrap_or(arns.len().max(1));
        let end = (start + size).min(arns.len());

        Ok(TaskDefinitionPage {
            arns: arns.get(start..end).map(<[String]>::to_vec).unwrap_or_default(),
            next_token: (end < arns.len()).then(|| end.to_string()),
        })
    }

    async fn list_tasks(&self, cluster: &str, service: &str) -> Result<Vec<String>> {
        Ok(self
            .tasks
            .read()
            .await
            .get(&key(cluster, service))
            .map(|tasks| tasks.iter().map(|t| t.task_arn.clone()).collect())
            .unwrap_or_default())
    }

    async fn describe_tasks(&self, _cluster: &str, task_arns: &[String]) -> Result<Vec<TaskSummary>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .flatten()
            .filter(|t| task_arns.contains(&t.task_arn))
            .cloned()
            .collect())
    }

    async fn register_task_definition(
        &self,
        request: &RegisterTaskDefinition,
    ) -> Result<TaskDefinitionSnapshot> {
        self.check_credentials().await?;

        let revision = {
            let definitions = self.task_definitions.read().await;
            definitions
                .values()
                .filter(|td| td.family() == request.family)
                .map(TaskDefinitionSnapshot::revision)
                .max()
                .unwrap_or(0)
                + 1
        };

        let snapshot = TaskDefinitionSnapshot::new(request.family.clone(), request.containers.clone())
            .map_err(|e| GatewayError::api("RegisterTaskDefinition", e.to_string()))?
            .with_arn(Self::arn_for(&request.family, revision), revision)
            .with_volumes(request.volumes.clone())
            .with_roles(request.task_role_arn.clone(), request.execution_role_arn.clone())
            .with_network_mode(request.network_mode.clone())
            .with_compatibilities(request.requires_compatibilities.clone())
            .with_task_size(request.cpu.clone(), request.memory.clone())
            .with_placement_constraints(request.placement_constraints.clone())
            .with_tags(request.tags.clone());

        self.registered.write().await.push(request.clone());
        self.add_task_definition(snapshot.clone()).await;
        Ok(snapshot)
    }

    async fn deregister_task_definition(&self, arn: &str) -> Result<()> {
        if *self.fail_on_deregister.read().await {
            return Err(GatewayError::api("DeregisterTaskDefinition", "mock failure"));
        }
        if !self.task_definitions.read().await.contains_key(arn) {
            return Err(GatewayError::UnknownTaskDefinition(arn.to_string()));
        }
        self.inactive.write().await.insert(arn.to_string());
        self.deregistered.write().await.push(arn.to_string());
        Ok(())
    }

    async fn update_service(&self, request: &UpdateServiceRequest) -> Result<()> {
        if self.fail_update_for.read().await.contains(&request.service) {
            return Err(GatewayError::api(
                "UpdateService",
                format!("mock failure for {}", request.service),
            ));
        }
        let latency = *self.update_latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.updates.write().await.push(request.clone());

        if *self.converge_on_update.read().await {
            let mut services = self.services.write().await;
            if let Some(queue) = services.get_mut(&key(&request.cluster, &request.service)) {
                if let Some(mut settled) = queue.back().cloned() {
                    if let Some(td) = &request.task_definition {
                        settled.task_definition = td.clone();
                    }
                    if let Some(count) = request.desired_count {
                        settled.desired_count = count;
                    }
                    settled.running_count = settled.desired_count;
                    settled.pending_count = 0;
                    settled.deployments = vec![Deployment::primary(
                        settled.task_definition.clone(),
                        settled.desired_count,
                        settled.running_count,
                    )];
                    queue.clear();
                    queue.push_back(settled);
                }
            }
        }
        Ok(())
    }

    async fn run_task(&self, request: &RunTaskRequest) -> Result<Vec<String>> {
        self.run_requests.write().await.push(request.clone());
        Ok((0..request.count)
            .map(|i| format!("arn:aws:ecs:us-east-1:000000000000:task/{}/{}", request.cluster, i))
            .collect())
    }
}
