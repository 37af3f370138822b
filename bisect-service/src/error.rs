// Service Errors
// Crate-level error type for engine operations

use crate::config::ConfigError;
use crate::job::{ArgumentsError, CancelError, SchedulerError};
use crate::task::{EvaluateError, GraphError};

use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Arguments(#[from] ArgumentsError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Evaluate(#[from] EvaluateError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Cancel(#[from] CancelError),

    #[error("Job not found: {0}")]
    JobNotFound(String),
}
