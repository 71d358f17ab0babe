//! Azure provider error types

use stackflow_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AzureError {
    #[error("{0} not found. Please install it and make sure it is on PATH")]
    ToolNotFound(&'static str),

    #[error("Not logged in to Azure: {0}. Run 'az login'")]
    AuthenticationFailed(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Azure service error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected: {0}")]
    Validation(String),

    #[error("Connection failed: {0}")]
    Transport(String),

    #[error("{tool} command failed: {message}")]
    CommandFailed { tool: &'static str, message: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cloud error: {0}")]
    CloudError(#[from] CloudError),
}

impl AzureError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AzureError::NotFound(_))
    }
}

impl From<AzureError> for CloudError {
    fn from(err: AzureError) -> Self {
        match err {
            AzureError::ToolNotFound(tool) => {
                CloudError::ProviderNotFound(format!("{} is not installed", tool))
            }
            AzureError::AuthenticationFailed(msg) => CloudError::AuthenticationFailed(msg),
            AzureError::NotFound(msg) => CloudError::ResourceNotFound(msg),
            AzureError::Throttled(msg) => CloudError::RateLimited(msg),
            AzureError::Server { status, message } => CloudError::ServerError { status, message },
            AzureError::Validation(msg) => CloudError::Validation(msg),
            AzureError::Transport(msg) => CloudError::Transport(msg),
            AzureError::CommandFailed { tool, message } => {
                CloudError::CommandFailed(format!("{}: {}", tool, message))
            }
            AzureError::UnexpectedResponse(msg) => CloudError::ApiError(msg),
            AzureError::JsonError(e) => CloudError::Json(e.to_string()),
            AzureError::IoError(e) => CloudError::Io(e.to_string()),
            AzureError::CloudError(e) => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, AzureError>;

/// Classify the stderr of a failed `az`/`kubectl` invocation
pub fn classify(tool: &'static str, stderr: &str) -> AzureError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(&n.to_lowercase()));

    if has(&[
        "ResourceNotFound",
        "ResourceGroupNotFound",
        "Not Found(",
        "NotFound",
        "(NotFound)",
    ]) {
        AzureError::NotFound(message)
    } else if has(&["TooManyRequests", "Too Many Requests", "429", "throttl"]) {
        AzureError::Throttled(message)
    } else if let Some(status) = server_status(&lower) {
        AzureError::Server { status, message }
    } else if has(&[
        "az login",
        "AuthorizationFailed",
        "InvalidAuthenticationToken",
        "ExpiredAuthenticationToken",
        "Unauthorized",
        "Forbidden",
    ]) {
        AzureError::AuthenticationFailed(message)
    } else if has(&[
        "InvalidParameter",
        "Bad Request",
        "BadRequest",
        "ValidationError",
        "InvalidTemplate",
        "invalid value",
        "is invalid",
    ]) {
        AzureError::Validation(message)
    } else if has(&[
        "connection refused",
        "connection reset",
        "connection aborted",
        "timed out",
        "timeout",
        "unable to connect",
        "name resolution",
        "temporary failure",
    ]) {
        AzureError::Transport(message)
    } else {
        AzureError::CommandFailed { tool, message }
    }
}

fn server_status(lower: &str) -> Option<u16> {
    const SERVER: &[(&str, u16)] = &[
        ("internal server error", 500),
        ("internalservererror", 500),
        ("bad gateway", 502),
        ("service unavailable", 503),
        ("serviceunavailable", 503),
        ("gateway timeout", 504),
        ("gatewaytimeout", 504),
    ];
    SERVER
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, status)| *status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = classify(
            "az",
            "ERROR: Not Found({\"error\":{\"code\":\"ResourceNotFound\",\"message\":\"The Resource was not found.\"}})",
        );
        assert!(err.is_not_found());

        let err = classify("az", "ERROR: (ResourceGroupNotFound) Resource group 'demo-rg' could not be found.");
        assert!(err.is_not_found());

        let err = classify("kubectl", "Error from server (NotFound): deployments.apps \"backend\" not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_transient() {
        let throttled: CloudError = classify("az", "ERROR: Too Many Requests({\"error\":{}})").into();
        assert!(throttled.is_transient());

        let server: CloudError =
            classify("az", "ERROR: Service Unavailable({\"error\":{\"code\":\"ServiceUnavailable\"}})").into();
        assert!(matches!(server, CloudError::ServerError { status: 503, .. }));
        assert!(server.is_transient());

        let transport: CloudError =
            classify("kubectl", "Unable to connect to the server: dial tcp: i/o timeout").into();
        assert!(transport.is_transient());
    }

    #[test]
    fn test_classify_fatal() {
        let auth: CloudError = classify("az", "ERROR: Please run 'az login' to setup account.").into();
        assert!(matches!(auth, CloudError::AuthenticationFailed(_)));
        assert!(!auth.is_transient());

        let invalid: CloudError = classify(
            "az",
            "ERROR: Bad Request({\"error\":{\"code\":\"InvalidParameter\",\"message\":\"sku\"}})",
        )
        .into();
        assert!(matches!(invalid, CloudError::Validation(_)));
        assert!(!invalid.is_transient());

        let other: CloudError = classify("az", "something odd happened").into();
        assert!(matches!(other, CloudError::CommandFailed(_)));
    }
}
