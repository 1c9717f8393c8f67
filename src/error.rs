use thiserror::Error;

use crate::env::EnvError;
use crate::supervisor::SupervisorError;
use crate::util::{CommandError, FileError};

pub const EXIT_TASKS_FAILED: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("Task '{0}' not found")]
    UnknownTask(String),
    #[error("Task '{task}' depends on '{dependency}' which doesn't exist")]
    UnknownDependency { task: String, dependency: String },
    #[error("Circular dependency: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("Service '{0}' is not defined")]
    UnknownService(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Env file error: {0}")]
    Env(#[from] EnvError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("File error: {0}")]
    File(#[from] FileError),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl StackError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StackError::Supervisor(_) | StackError::Command(_) => EXIT_TASKS_FAILED,
            _ => EXIT_USAGE,
        }
    }
}

pub type Result<T> = std::result::Result<T, StackError>;
