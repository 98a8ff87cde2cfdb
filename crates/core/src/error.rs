use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum DroverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{task}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("execution failed: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, DroverError>;
