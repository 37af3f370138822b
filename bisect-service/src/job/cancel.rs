// Job Cancellation
// Authorization and state checks for user cancellation requests

use super::scheduler::Scheduler;
use super::store::JobStore;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already cancelled: {0}")]
    AlreadyCancelled(String),

    #[error("Job {0} is already running and cannot be cancelled")]
    AlreadyRunning(String),

    #[error("User \"{user}\" is not allowed to cancel job {job_id}")]
    Forbidden { job_id: String, user: String },
}

impl CancelError {
    /// HTTP status reported for this error
    pub fn status_code(&self) -> u16 {
        match self {
            CancelError::NotFound(_) => 404,
            CancelError::AlreadyCancelled(_) | CancelError::AlreadyRunning(_) => 400,
            CancelError::Forbidden { .. } => 403,
        }
    }
}

/// Decides who may cancel jobs they do not own
pub trait Authorizer: Send + Sync {
    fn is_admin(&self, user: &str) -> bool;

    /// Whether `user` may act on behalf of another user
    fn is_delegate(&self, user: &str) -> bool;
}

/// Authorizer backed by fixed user lists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticAuthorizer {
    #[serde(default)]
    admins: HashSet<String>,
    #[serde(default)]
    delegates: HashSet<String>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admin(mut self, user: impl Into<String>) -> Self {
        self.admins.insert(user.into());
        self
    }

    pub fn with_delegate(mut self, user: impl Into<String>) -> Self {
        self.delegates.insert(user.into());
        self
    }
}

impl Authorizer for StaticAuthorizer {
    fn is_admin(&self, user: &str) -> bool {
        self.admins.contains(user)
    }

    fn is_delegate(&self, user: &str) -> bool {
        self.delegates.contains(user)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub job_id: String,
    pub reason: String,
    /// The authenticated caller
    pub actor: String,
    /// User the caller acts on behalf of
    #[serde(default)]
    pub user: Option<String>,
}

/// The user a request is attributed to, or `None` when the caller may not
/// act on behalf of the named user
fn effective_user<'a>(request: &'a CancelRequest, authorizer: &dyn Authorizer) -> Option<&'a str> {
    match &request.user {
        Some(user) if *user != request.actor => {
            authorizer.is_delegate(&request.actor).then_some(user.as_str())
        }
        _ => Some(request.actor.as_str()),
    }
}

async fn try_cancel(
    store: &JobStore,
    scheduler: &Scheduler,
    authorizer: &dyn Authorizer,
    request: &CancelRequest,
) -> Result<(), CancelError> {
    let job = store
        .get(&request.job_id)
        .await
        .ok_or_else(|| CancelError::NotFound(request.job_id.clone()))?;
    let mut job = job.lock().await;

    if job.cancelled {
        return Err(CancelError::AlreadyCancelled(job.id.clone()));
    }
    if job.started && job.task.is_some() {
        return Err(CancelError::AlreadyRunning(job.id.clone()));
    }

    let forbidden = || CancelError::Forbidden {
        job_id: request.job_id.clone(),
        user: request.actor.clone(),
    };
    let user = effective_user(request, authorizer).ok_or_else(forbidden)?;
    if job.arguments.user.as_deref() != Some(user) && !authorizer.is_admin(user) {
        return Err(forbidden());
    }

    job.cancel(user, &request.reason)?;
    scheduler.cancel(&job.id);
    info!(job_id = %job.id, user, reason = %request.reason, "job cancelled");
    Ok(())
}

/// Handle a cancellation request.
///
/// Returns the HTTP status and body: `(200, {})` on success, otherwise the
/// error's status with `{"error": message}`.
pub async fn cancel_job(
    store: &JobStore,
    scheduler: &Scheduler,
    authorizer: &dyn Authorizer,
    request: &CancelRequest,
) -> (u16, Value) {
    match try_cancel(store, scheduler, authorizer, request).await {
        Ok(()) => (200, json!({})),
        Err(e) => {
            warn!(job_id = %request.job_id, actor = %request.actor, error = %e, "cancel rejected");
            (e.status_code(), json!({ "error": e.to_string() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::job::{Job, JobArguments, JobStatus};

    const OWNER: &str = "lovely.user@example.com";

    async fn setup() -> (JobStore, Scheduler, String) {
        let arguments = JobArguments {
            repository: "chromium".into(),
            start_git_hash: "aaa".into(),
            end_git_hash: "bbb".into(),
            builder: "linux-perf".into(),
            metric: Some("timeToFirstPaint".into()),
            configuration: Some("mock".into()),
            user: Some(OWNER.into()),
            ..Default::default()
        };
        let job = Job::new(arguments, &EngineConfig::default()).unwrap();
        let id = job.id.clone();
        let scheduler = Scheduler::new();
        scheduler.schedule("mock", &id, 0);
        let store = JobStore::new();
        store.insert(job).await;
        (store, scheduler, id)
    }

    fn request(job_id: &str, actor: &str, user: Option<&str>) -> CancelRequest {
        CancelRequest {
            job_id: job_id.to_string(),
            reason: "testing!".to_string(),
            actor: actor.to_string(),
            user: user.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_owner_cancels_once() {
        let (store, scheduler, id) = setup().await;
        let authorizer = StaticAuthorizer::new();

        let (status, body) = cancel_job(&store, &scheduler, &authorizer, &request(&id, OWNER, None)).await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({}));
        {
            let job = store.get(&id).await.unwrap();
            let job = job.lock().await;
            assert_eq!(job.status, JobStatus::Cancelled);
            assert_eq!(job.cancel_reason.as_deref(), Some("lovely.user@example.com: testing!"));
        }
        assert!(scheduler.is_stopped(&id));

        let (status, body) = cancel_job(&store, &scheduler, &authorizer, &request(&id, OWNER, None)).await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().contains("already cancelled"));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (store, scheduler, _) = setup().await;
        let (status, _) = cancel_job(
            &store,
            &scheduler,
            &StaticAuthorizer::new(),
            &request("missing", OWNER, None),
        )
        .await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_running_job_cannot_be_cancelled() {
        let (store, scheduler, id) = setup().await;
        scheduler.pick_job("mock");
        store.update(&id, |job| job.start()).await.unwrap().unwrap();

        let (status, body) =
            cancel_job(&store, &scheduler, &StaticAuthorizer::new(), &request(&id, OWNER, None)).await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().contains("already running"));
    }

    #[tokio::test]
    async fn test_forbidden_and_admin() {
        let (store, scheduler, id) = setup().await;
        let authorizer = StaticAuthorizer::new().with_admin("admin@example.com");

        let (status, _) = cancel_job(
            &store,
            &scheduler,
            &authorizer,
            &request(&id, "another.user@example.com", None),
        )
        .await;
        assert_eq!(status, 403);

        let (status, _) = cancel_job(
            &store,
            &scheduler,
            &authorizer,
            &request(&id, "admin@example.com", None),
        )
        .await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn test_delegation() {
        let (store, scheduler, id) = setup().await;
        let service = "service@example.com";

        // Not allowed to delegate
        let (status, _) = cancel_job(
            &store,
            &scheduler,
            &StaticAuthorizer::new(),
            &request(&id, service, Some(OWNER)),
        )
        .await;
        assert_eq!(status, 403);

        let authorizer = StaticAuthorizer::new().with_delegate(service);
        let (status, _) =
            cancel_job(&store, &scheduler, &authorizer, &request(&id, service, Some(OWNER))).await;
        assert_eq!(status, 200);

        let job = store.get(&id).await.unwrap();
        assert_eq!(
            job.lock().await.cancel_reason.as_deref(),
            Some("lovely.user@example.com: testing!")
        );
    }

    #[tokio::test]
    async fn test_delegation_to_admin() {
        let (store, scheduler, id) = setup().await;
        let authorizer = StaticAuthorizer::new()
            .with_delegate("service@example.com")
            .with_admin("admin@example.com");

        let (status, _) = cancel_job(
            &store,
            &scheduler,
            &authorizer,
            &request(&id, "service@example.com", Some("admin@example.com")),
        )
        .await;
        assert_eq!(status, 200);
    }
}
