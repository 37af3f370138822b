// Backend Services
// Boundary traits for the build, artifact, test, results and source-control backends

pub mod http;
pub mod simulated;

// Re-export key types
pub use http::HttpServices;
pub use simulated::SimulatedBackend;

use crate::change::Change;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by a backend service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transport(_) => true,
            BackendError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Reference to a content-addressed artifact (build output or test output)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Isolate {
    pub server: String,
    pub hash: String,
}

impl Isolate {
    pub fn new(server: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            hash: hash.into(),
        }
    }
}

/// Parameters for a build request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub builder: String,
    pub bucket: String,
    pub target: String,
    pub change: Change,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    Scheduled,
    Started,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Failure,
    Canceled,
}

/// Status of a previously requested build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub id: String,
    pub status: BuildState,
    #[serde(default)]
    pub result: Option<BuildResult>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Parameters for triggering a test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRequest {
    pub swarming_server: String,
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    pub isolate: Isolate,
    pub change: Change,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestState {
    Pending,
    Running,
    Completed,
    Expired,
    BotDied,
    Canceled,
    TimedOut,
}

/// Status of a triggered test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStatus {
    pub state: TestState,
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub output: Option<Isolate>,
}

/// One entry of a commit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Build backend
#[async_trait::async_trait]
pub trait BuildService: Send + Sync {
    /// Request a build and return its id
    async fn request_build(&self, request: &BuildRequest) -> Result<String, BackendError>;

    /// Query the status of a build
    async fn build_status(&self, build_id: &str) -> Result<BuildStatus, BackendError>;
}

/// Content-addressed artifact cache
#[async_trait::async_trait]
pub trait IsolateCache: Send + Sync {
    async fn get(
        &self,
        builder: &str,
        change: &Change,
        target: &str,
    ) -> Result<Option<Isolate>, BackendError>;
}

/// Test/bot-pool backend
#[async_trait::async_trait]
pub trait TestService: Send + Sync {
    /// Trigger a test run and return its task id
    async fn trigger(&self, request: &TestRequest) -> Result<String, BackendError>;

    async fn status(&self, task_id: &str) -> Result<TestStatus, BackendError>;
}

/// Storage for test outputs
#[async_trait::async_trait]
pub trait ResultStore: Send + Sync {
    /// Fetch a JSON file from a test output
    async fn fetch(&self, output: &Isolate, path: &str) -> Result<serde_json::Value, BackendError>;
}

/// Source-control log service
#[async_trait::async_trait]
pub trait SourceControl: Send + Sync {
    /// Commits after `from` up to and including `to`, newest first
    async fn commit_range(
        &self,
        repository: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<CommitInfo>, BackendError>;
}

/// The set of backends an engine talks to
#[derive(Clone)]
pub struct Services {
    pub builds: Arc<dyn BuildService>,
    pub isolates: Arc<dyn IsolateCache>,
    pub tests: Arc<dyn TestService>,
    pub results: Arc<dyn ResultStore>,
    pub source_control: Arc<dyn SourceControl>,
}

impl Services {
    /// Use a single backend for every service
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: BuildService + IsolateCache + TestService + ResultStore + SourceControl + 'static,
    {
        Self {
            builds: backend.clone(),
            isolates: backend.clone(),
            tests: backend.clone(),
            results: backend.clone(),
            source_control: backend,
        }
    }

    /// Replace the source-control backend
    pub fn with_source_control(mut self, source_control: Arc<dyn SourceControl>) -> Self {
        self.source_control = source_control;
        self
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(BackendError::Transport("reset".into()).is_transient());
        assert!(BackendError::Status {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!BackendError::Status {
            status: 404,
            message: "missing".into()
        }
        .is_transient());
        assert!(!BackendError::InvalidResponse("bad".into()).is_transient());
    }

    #[test]
    fn test_build_status_wire_format() {
        let status: BuildStatus = serde_json::from_str(
            r#"{"id": "8945", "status": "COMPLETED", "result": "FAILURE", "reason": "compile"}"#,
        )
        .unwrap();
        assert_eq!(status.status, BuildState::Completed);
        assert_eq!(status.result, Some(BuildResult::Failure));
        assert_eq!(status.url, None);
    }

    #[test]
    fn test_test_status_wire_format() {
        let status: TestStatus = serde_json::from_str(
            r#"{"state": "BOT_DIED", "bot_id": "bot-1"}"#,
        )
        .unwrap();
        assert_eq!(status.state, TestState::BotDied);
        assert!(!status.failure);
        assert_eq!(status.bot_id.as_deref(), Some("bot-1"));
    }
}
