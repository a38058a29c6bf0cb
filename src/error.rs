//! Deployment error taxonomy.
//!
//! `Unrecoverable` carries a message that is printed to the operator as-is.
//! Connection problems discovered while building the ECS gateway or loading a
//! service are reported as `EcsConnection` so the CLI can point at credentials
//! or naming mistakes.

use crate::ecs::GatewayError;

/// Result type for deployment operations.
pub type Result<T> = std::result::Result<T, DeployError>;

/// Errors raised by the deployment core.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Terminal for the current operation; the message is operator-facing.
    #[error("{message}")]
    Unrecoverable {
        message: String,
        #[source]
        source: Option<Box<DeployError>>,
    },

    #[error("{0}")]
    EcsConnection(String),

    #[error("Unknown container: {0}")]
    UnknownContainer(String),

    #[error("Unknown task definition arn: {0}")]
    UnknownTaskDefinition(String),

    #[error(transparent)]
    Gateway(GatewayError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GatewayError> for DeployError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::UnknownTaskDefinition(arn) => Self::UnknownTaskDefinition(arn),
            other => Self::Gateway(other),
        }
    }
}

impl DeployError {
    /// Build an `Unrecoverable` error with no underlying cause.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable {
            message: message.into(),
            source: None,
        }
    }

    /// Build an `Unrecoverable` error wrapping the cause that triggered it.
    pub fn unrecoverable_from(message: impl Into<String>, cause: DeployError) -> Self {
        Self::Unrecoverable {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Map a failure reaching ECS onto `EcsConnection`, with operator
    /// guidance for missing credentials and unknown services.
    pub fn connection(err: GatewayError) -> Self {
        match err {
            GatewayError::ServiceNotFound { .. } => Self::EcsConnection(
                "An error occurred when calling the DescribeServices operation: Service not found."
                    .to_string(),
            ),
            GatewayError::NoCredentials => Self::EcsConnection(
                "Unable to locate credentials. Configure credentials by running \"aws configure\"."
                    .to_string(),
            ),
            other => Self::EcsConnection(other.to_string()),
        }
    }

    /// Whether this is an operator-facing terminal failure.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. })
    }
}
