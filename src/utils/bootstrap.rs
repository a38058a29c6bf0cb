//! Bootstrap utilities for the cloudlift binary.
//!
//! Shared initialization: tracing and the AWS SDK configuration every client
//! is built from.

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, SdkConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV_VAR: &str = "CLOUDLIFT_LOG";

/// Install the subscriber for the `cloudlift` CLI.
///
/// Deploy progress and diffs go to the console directly; tracing carries the
/// structured per-service records, filtered by `CLOUDLIFT_LOG` (`info` when
/// unset or unparsable).
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the shared AWS configuration.
///
/// SDK-level retries are disabled; callers wrap requests in
/// [`RetryPolicy`](crate::utils::retry::RetryPolicy) instead.
pub async fn load_aws_config(region: Option<&str>, endpoint_url: Option<&str>) -> SdkConfig {
    let mut builder =
        aws_config::defaults(BehaviorVersion::latest()).retry_config(RetryConfig::disabled());

    if let Some(region) = region {
        builder = builder.region(aws_config::Region::new(region.to_string()));
    }

    if let Some(endpoint) = endpoint_url {
        builder = builder.endpoint_url(endpoint);
    }

    let config = builder.load().await;

    tracing::debug!(
        region = ?config.region().map(|r| r.as_ref().to_string()),
        endpoint = ?endpoint_url,
        "Loaded AWS configuration"
    );

    config
}
