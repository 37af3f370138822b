// HTTP Services
// JSON-over-HTTP clients for the build, isolate, test, results and source-control backends

use super::{
    BackendError, BuildRequest, BuildService, BuildStatus, CommitInfo, Isolate, IsolateCache,
    ResultStore, Services, SourceControl, TestRequest, TestService, TestStatus,
};
use crate::change::Change;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Base URLs of the backend services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpEndpoints {
    pub build_url: String,
    pub isolate_url: String,
    pub test_url: String,
    pub results_url: String,
    pub source_url: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for HttpEndpoints {
    fn default() -> Self {
        Self {
            build_url: "http://localhost:8081".to_string(),
            isolate_url: "http://localhost:8082".to_string(),
            test_url: "http://localhost:8083".to_string(),
            results_url: "http://localhost:8084".to_string(),
            source_url: "http://localhost:8085".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct LogResponse {
    #[serde(default)]
    log: Vec<CommitInfo>,
}

/// Backend implementation talking to real services over HTTP
#[derive(Debug, Clone)]
pub struct HttpServices {
    client: reqwest::Client,
    endpoints: HttpEndpoints,
}

impl HttpServices {
    pub fn new(endpoints: HttpEndpoints) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    /// Use this client for every backend
    pub fn into_services(self) -> Services {
        Services::from_backend(Arc::new(self))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.endpoints.timeout_secs.max(1))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, BackendError> {
        let response = request
            .timeout(self.timeout())
            .send()
            .await
            .map_err(|e| BackendError::Transport(format!("{}: {}", what, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("{}: {}", what, e)))
    }
}

#[async_trait::async_trait]
impl BuildService for HttpServices {
    async fn request_build(&self, request: &BuildRequest) -> Result<String, BackendError> {
        let url = format!("{}/builds", self.endpoints.build_url);
        debug!(builder = %request.builder, change = %request.change, "requesting build");
        let response: IdResponse = self
            .send(self.client.post(&url).json(request), "build request")
            .await?;
        Ok(response.id)
    }

    async fn build_status(&self, build_id: &str) -> Result<BuildStatus, BackendError> {
        let url = format!("{}/builds/{}", self.endpoints.build_url, build_id);
        self.send(self.client.get(&url), &format!("build {}", build_id))
            .await
    }
}

#[async_trait::async_trait]
impl IsolateCache for HttpServices {
    async fn get(
        &self,
        builder: &str,
        change: &Change,
        target: &str,
    ) -> Result<Option<Isolate>, BackendError> {
        let url = format!("{}/isolates", self.endpoints.isolate_url);
        let request = self.client.get(&url).query(&[
            ("builder", builder.to_string()),
            ("change", change.id_string()),
            ("target", target.to_string()),
        ]);

        match self.send(request, "isolate lookup").await {
            Ok(isolate) => Ok(Some(isolate)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl TestService for HttpServices {
    async fn trigger(&self, request: &TestRequest) -> Result<String, BackendError> {
        let url = format!("{}/tasks", self.endpoints.test_url);
        let response: TaskResponse = self
            .send(self.client.post(&url).json(request), "test trigger")
            .await?;
        Ok(response.task_id)
    }

    async fn status(&self, task_id: &str) -> Result<TestStatus, BackendError> {
        let url = format!("{}/tasks/{}", self.endpoints.test_url, task_id);
        self.send(self.client.get(&url), &format!("task {}", task_id))
            .await
    }
}

#[async_trait::async_trait]
impl ResultStore for HttpServices {
    async fn fetch(&self, output: &Isolate, path: &str) -> Result<serde_json::Value, BackendError> {
        let url = format!(
            "{}/outputs/{}/{}/{}",
            self.endpoints.results_url,
            output
                .server
                .trim_start_matches("https://")
                .trim_start_matches("http://"),
            output.hash,
            path.trim_start_matches('/')
        );
        self.send(self.client.get(&url), path).await
    }
}

#[async_trait::async_trait]
impl SourceControl for HttpServices {
    async fn commit_range(
        &self,
        repository: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<CommitInfo>, BackendError> {
        let url = format!(
            "{}/{}/+log/{}..{}",
            self.endpoints.source_url, repository, from, to
        );
        let response: LogResponse = self
            .send(self.client.get(&url), &format!("log {}..{}", from, to))
            .await?;
        Ok(response.log)
    }
}
