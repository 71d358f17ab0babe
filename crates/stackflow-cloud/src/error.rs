//! Cloud provider error types

use stackflow_core::StackError;
use stackflow_core::model::UnresolvedReference;
use std::time::Duration;
use thiserror::Error;

/// Cloud provider and convergence errors
#[derive(Error, Debug, Clone)]
pub enum CloudError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to decode credentials of {resource}: {message}")]
    CredentialDecode { resource: String, message: String },

    #[error("Provider returned no credentials for {0}")]
    NoCredentialsReturned(String),

    #[error("{resource} did not settle within {}s", .timeout.as_secs())]
    TimeoutExceeded { resource: String, timeout: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cannot delete {resource}: dependents still present ({})", .dependents.join(", "))]
    DependentStillPresent {
        resource: String,
        dependents: Vec<String>,
    },

    #[error("Unresolved input: {0}")]
    UnresolvedReference(String),

    #[error("Workloads failed: {}", .failed.join(", "))]
    WorkloadsFailed { failed: Vec<String> },

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl CloudError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CloudError::RateLimited(_) | CloudError::ServerError { .. } | CloudError::Transport(_)
        )
    }

    /// Errors raised before any provider call was made
    pub fn is_configuration(&self) -> bool {
        matches!(self, CloudError::Configuration(_))
    }
}

impl From<StackError> for CloudError {
    fn from(err: StackError) -> Self {
        CloudError::Configuration(err.to_string())
    }
}

impl From<UnresolvedReference> for CloudError {
    fn from(err: UnresolvedReference) -> Self {
        CloudError::UnresolvedReference(err.0)
    }
}

impl From<std::io::Error> for CloudError {
    fn from(err: std::io::Error) -> Self {
        CloudError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::Json(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
