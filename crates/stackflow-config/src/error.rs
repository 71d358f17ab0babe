use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config directory not found")]
    ConfigDirNotFound,

    #[error(
        "stack file not found. Looked in:\n\
        - current directory: stack.local.kdl, .stack.local.kdl, stack.kdl, .stack.kdl\n\
        - ./.stackflow/\n\
        - ~/.config/stackflow/stack.kdl\n\
        Set STACKFLOW_CONFIG_PATH to point at a file directly"
    )]
    StackFileNotFound,

    #[error("STACKFLOW_CONFIG_PATH points at a missing file: {0}")]
    ConfigPathMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
