//! Resolves the image URI a deployment points containers at.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ecr::types::ImageIdentifier;
use tracing::{info, warn};

use crate::error::{DeployError, Result};
use crate::utils::aws::classify;
use crate::utils::retry::RetryPolicy;

/// Repository name for an application.
pub fn repository_name(application: &str) -> String {
    format!("{}-repo", application)
}

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Confirm `repository:tag` exists and return its full image URI.
    async fn ensure_image_in_ecr(&self, repository: &str, tag: &str) -> Result<String>;
}

fn image_not_found() -> DeployError {
    DeployError::unrecoverable("Image for given version could not be found.")
}

pub struct EcrImageRegistry {
    client: aws_sdk_ecr::Client,
    retry: RetryPolicy,
}

impl EcrImageRegistry {
    pub fn new(sdk_config: &SdkConfig, retry: RetryPolicy) -> Self {
        Self {
            client: aws_sdk_ecr::Client::new(sdk_config),
            retry,
        }
    }
}

#[async_trait]
impl ImageRegistry for EcrImageRegistry {
    async fn ensure_image_in_ecr(&self, repository: &str, tag: &str) -> Result<String> {
        let repositories = self
            .retry
            .run("DescribeRepositories", || async move {
                self.client
                    .describe_repositories()
                    .repository_names(repository)
                    .send()
                    .await
                    .map_err(|e| classify("DescribeRepositories", e))
            })
            .await
            .map_err(|e| {
                DeployError::unrecoverable_from(
                    format!("ECR repository {} could not be described.", repository),
                    e.into(),
                )
            })?;

        let uri = repositories
            .repositories()
            .iter()
            .find_map(|r| r.repository_uri())
            .ok_or_else(image_not_found)?
            .to_string();

        info!(repository = %repository, tag = %tag, "Using tag to find image");

        let images = self
            .retry
            .run("BatchGetImage", || {
                let call = self
                    .client
                    .batch_get_image()
                    .repository_name(repository)
                    .image_ids(ImageIdentifier::builder().image_tag(tag).build());
                async move { call.send().await.map_err(|e| classify("BatchGetImage", e)) }
            })
            .await?;

        if images.images().is_empty() {
            warn!(tag = %tag, "Please build, tag and upload the image for this version");
            return Err(image_not_found());
        }

        Ok(format!("{}:{}", uri, tag))
    }
}

/// Registry with a fixed set of repository URIs and tags, for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticImageRegistry {
    repositories: BTreeMap<String, (String, Vec<String>)>,
}

impl StaticImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, repository: &str, uri: &str, tag: &str) -> Self {
        self.repositories
            .entry(repository.to_string())
            .or_insert_with(|| (uri.to_string(), Vec::new()))
            .1
            .push(tag.to_string());
        self
    }
}

#[async_trait]
impl ImageRegistry for StaticImageRegistry {
    async fn ensure_image_in_ecr(&self, repository: &str, tag: &str) -> Result<String> {
        match self.repositories.get(repository) {
            Some((uri, tags)) if tags.iter().any(|t| t == tag) => Ok(format!("{}:{}", uri, tag)),
            _ => Err(image_not_found()),
        }
    }
}
