//! Deployment failure metric.
//!
//! A failed rollout records one `FailedCloudliftDeployments` data point with
//! `ClusterName` and `ServiceName` dimensions. Sink failures are logged by the
//! caller and never replace the deployment error.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit};
use aws_sdk_cloudwatch::Client;
use tokio::sync::RwLock;
use tracing::debug;

use crate::ecs::GatewayError;
use crate::utils::aws::classify;
use crate::utils::retry::RetryPolicy;

/// Metric name recorded for every failed deployment.
pub const FAILED_DEPLOYMENTS_METRIC: &str = "FailedCloudliftDeployments";

pub type Result<T> = std::result::Result<T, MetricsError>;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to build metric datum: {0}")]
    Build(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Destination for deployment metrics.
///
/// Implementations:
/// - `CloudWatchMetrics`: `PutMetricData` via `aws-sdk-cloudwatch`
/// - `NoopMetrics`: metrics disabled
/// - `RecordingMetrics`: in-memory, for tests
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_deployment_failure(&self, cluster: &str, service: &str) -> Result<()>;
}

pub struct CloudWatchMetrics {
    client: Client,
    namespace: String,
    retry: RetryPolicy,
}

impl CloudWatchMetrics {
    pub fn new(sdk_config: &SdkConfig, namespace: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client: Client::new(sdk_config),
            namespace: namespace.into(),
            retry,
        }
    }

    fn failure_datum(cluster: &str, service: &str) -> Result<MetricDatum> {
        let dimension = |name: &str, value: &str| {
            Ok::<_, MetricsError>(
                Dimension::builder()
                    .name(name)
                    .value(value)
                    .build(),
            )
        };

        Ok(MetricDatum::builder()
            .metric_name(FAILED_DEPLOYMENTS_METRIC)
            .dimensions(dimension("ClusterName", cluster)?)
            .dimensions(dimension("ServiceName", service)?)
            .value(1.0)
            .unit(StandardUnit::Count)
            .build())
    }
}

#[async_trait]
impl MetricsSink for CloudWatchMetrics {
    async fn record_deployment_failure(&self, cluster: &str, service: &str) -> Result<()> {
        let datum = Self::failure_datum(cluster, service)?;

        self.retry
            .run("PutMetricData", || {
                let call = self
                    .client
                    .put_metric_data()
                    .namespace(&self.namespace)
                    .metric_data(datum.clone());
                async move { call.send().await.map_err(|e| classify("PutMetricData", e)) }
            })
            .await?;

        debug!(
            namespace = %self.namespace,
            cluster = %cluster,
            service = %service,
            "Recorded deployment failure metric"
        );
        Ok(())
    }
}

/// Sink used when metrics are disabled.
#[derive(Debug, Default)]
pub struct NoopMetrics;

#[async_trait]
impl MetricsSink for NoopMetrics {
    async fn record_deployment_failure(&self, _cluster: &str, _service: &str) -> Result<()> {
        Ok(())
    }
}

/// In-memory sink recording `(cluster, service)` pairs.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    failures: RwLock<Vec<(String, String)>>,
    fail: RwLock<bool>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    pub async fn failures(&self) -> Vec<(String, String)> {
        self.failures.read().await.clone()
    }
}

#[async_trait]
impl MetricsSink for RecordingMetrics {
    async fn record_deployment_failure(&self, cluster: &str, service: &str) -> Result<()> {
        if *self.fail.read().await {
            return Err(MetricsError::Gateway(GatewayError::api(
                "PutMetricData",
                "recording sink set to fail",
            )));
        }
        self.failures
            .write()
            .await
            .push((cluster.to_string(), service.to_string()));
        Ok(())
    }
}
