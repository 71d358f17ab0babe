use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StackError {
    #[error("KDL parse error: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error: {path}\nreason: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid manifest {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("invalid reference template '{template}': {message}")]
    InvalidTemplate { template: String, message: String },

    #[error("resource declared twice: {0}")]
    DuplicateResource(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("dependency cycle detected: {}", .members.join(" -> "))]
    CycleDetected { members: Vec<String> },

    #[error("resource '{resource}' depends on '{target}', which is not declared")]
    DanglingReference { resource: String, target: String },
}

impl StackError {
    /// Errors that make the whole stack unusable before any provider call.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            StackError::InvalidConfig(_)
                | StackError::InvalidTemplate { .. }
                | StackError::DuplicateResource(_)
                | StackError::CycleDetected { .. }
                | StackError::DanglingReference { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StackError>;
