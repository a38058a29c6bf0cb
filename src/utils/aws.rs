//! AWS SDK error classification shared by every client in the crate.

use std::error::Error as StdError;

use aws_config::SdkConfig;
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_ecs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

use crate::ecs::GatewayError;

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ProvisionedThroughputExceededException",
];

const TRANSIENT_CODES: &[&str] = &[
    "ServerException",
    "InternalFailure",
    "InternalServerError",
    "ServiceUnavailable",
    "RequestTimeout",
    "RequestTimeoutException",
];

/// Map an SDK failure onto the gateway taxonomy.
///
/// Throttling and server-side errors become retryable; timeouts and
/// connection failures are transient; everything else is a plain API error
/// carrying the service's own message.
pub fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> GatewayError
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            return GatewayError::Transient {
                operation: operation.to_string(),
                message,
            };
        }
        _ => {}
    }

    match err.code() {
        Some(code) if THROTTLING_CODES.contains(&code) => GatewayError::Throttled {
            operation: operation.to_string(),
            message,
        },
        Some(code) if TRANSIENT_CODES.contains(&code) => GatewayError::Transient {
            operation: operation.to_string(),
            message,
        },
        Some("UnrecognizedClientException" | "InvalidClientTokenId" | "ExpiredTokenException") => {
            GatewayError::NoCredentials
        }
        _ => GatewayError::Api {
            operation: operation.to_string(),
            message,
        },
    }
}

/// Resolve credentials once so a missing profile is reported before any
/// control-plane call is attempted.
pub async fn ensure_credentials(config: &SdkConfig) -> Result<(), GatewayError> {
    let provider = config
        .credentials_provider()
        .ok_or(GatewayError::NoCredentials)?;
    provider.provide_credentials().await.map_err(|e| {
        tracing::debug!(error = %e, "Credential resolution failed");
        GatewayError::NoCredentials
    })?;
    Ok(())
}
