// Execution Errors
// Failure reasons for build, test and read-value executions

use crate::services::BackendError;

use thiserror::Error;

/// Errors that fail a build execution. Never retried automatically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Build failed: {0}")]
    Failed(String),

    #[error("Build was canceled: {0}")]
    Canceled(String),

    #[error("Build reported success but no artifact found")]
    IsolateNotFound,
}

/// Errors that fail a test execution
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TestError {
    #[error("Test task expired before a bot picked it up")]
    Expired,

    #[error("Bot died while running the test")]
    BotDied,

    #[error("Test task failed: {0}")]
    Failed(String),

    #[error("Test task ended in unexpected state {0}")]
    Unexpected(String),

    #[error("Test task completed without an output")]
    NoOutput,
}

/// Errors that fail a read-value execution
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadValueError {
    #[error("Results file not found: {0}")]
    NoFile(String),

    #[error("Results file has an unknown format: {0}")]
    UnknownFormat(String),

    #[error("No matching values found: {0}")]
    NotFound(String),

    #[error("Matching histograms contain no values")]
    NoValues,

    #[error("Chart not found: {0}")]
    ChartNotFound(String),

    #[error("Trace not found: {0}")]
    TraceNotFound(String),
}

/// Any reason an execution can fail
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Test(#[from] TestError),

    #[error(transparent)]
    ReadValue(#[from] ReadValueError),

    #[error("Service error: {0}")]
    Service(#[from] BackendError),

    #[error("Execution timed out after {polls} polls")]
    Timeout { polls: u32 },

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl ExecutionError {
    /// Short machine-readable reason recorded in task payloads
    pub fn reason(&self) -> &'static str {
        match self {
            ExecutionError::Build(BuildError::IsolateNotFound) => "BuildIsolateNotFound",
            ExecutionError::Build(BuildError::Canceled(_)) => "BuildCancelled",
            ExecutionError::Build(_) => "BuildFailed",
            ExecutionError::Test(TestError::Expired) => "SwarmingExpired",
            ExecutionError::Test(TestError::Failed(_)) => "RunTestFailed",
            ExecutionError::Test(_) => "SwarmingTaskError",
            ExecutionError::ReadValue(_) => "ReadValueError",
            ExecutionError::Service(_) => "ServiceError",
            ExecutionError::Timeout { .. } => "ExecutionTimeout",
            ExecutionError::MissingInput(_) => "MissingInput",
            ExecutionError::Cancelled(_) => "JobCancelled",
        }
    }

    /// Transient service errors are retried on the next poll
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Service(e) if e.is_transient())
    }
}
