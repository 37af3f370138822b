// Find Isolate
// Locates a build artifact for a change, requesting a build when none exists

use super::error::{BuildError, ExecutionError};
use super::execution::{Detail, Step};
use super::BuildDedup;
use crate::change::Change;
use crate::services::{BuildRequest, BuildResult, BuildState, Isolate, Services};

use std::collections::BTreeMap;
use tracing::debug;

/// Quest: find or build the artifact for a builder/target
#[derive(Debug, Clone)]
pub struct FindIsolate {
    pub builder: String,
    pub target: String,
    pub bucket: String,
    pub fallback_target: Option<String>,
    /// Tags attached to build requests (job id, user, ...)
    pub tags: BTreeMap<String, String>,
    dedup: BuildDedup,
}

impl PartialEq for FindIsolate {
    fn eq(&self, other: &Self) -> bool {
        self.builder == other.builder
            && self.target == other.target
            && self.bucket == other.bucket
            && self.fallback_target == other.fallback_target
    }
}

impl FindIsolate {
    pub fn new(
        builder: impl Into<String>,
        target: impl Into<String>,
        bucket: impl Into<String>,
        dedup: BuildDedup,
    ) -> Self {
        Self {
            builder: builder.into(),
            target: target.into(),
            bucket: bucket.into(),
            fallback_target: None,
            tags: BTreeMap::new(),
            dedup,
        }
    }

    pub fn with_fallback_target(mut self, target: impl Into<String>) -> Self {
        self.fallback_target = Some(target.into());
        self
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Shared map of builds already requested per change
    pub fn dedup(&self) -> &BuildDedup {
        &self.dedup
    }
}

/// Each phase issues at most one outbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    CheckCache,
    CheckFallback,
    RequestBuild,
    PollBuild,
    VerifyCache,
}

#[derive(Debug, Clone)]
pub(crate) struct FindIsolateExecution {
    quest: FindIsolate,
    phase: Phase,
    build_id: Option<String>,
    build_url: Option<String>,
    isolate: Option<Isolate>,
}

impl FindIsolateExecution {
    pub(crate) fn new(quest: FindIsolate) -> Self {
        Self {
            quest,
            phase: Phase::CheckCache,
            build_id: None,
            build_url: None,
            isolate: None,
        }
    }

    pub(crate) async fn poll(
        &mut self,
        change: &Change,
        services: &Services,
    ) -> Result<Step, ExecutionError> {
        match self.phase {
            Phase::CheckCache => {
                let target = self.quest.target.clone();
                if let Some(step) = self.check_cache(change, &target, services).await? {
                    return Ok(step);
                }
                self.phase = if self.quest.fallback_target.is_some() {
                    Phase::CheckFallback
                } else {
                    Phase::RequestBuild
                };
                Ok(Step::Waiting)
            }

            Phase::CheckFallback => {
                if let Some(target) = self.quest.fallback_target.clone() {
                    if let Some(step) = self.check_cache(change, &target, services).await? {
                        return Ok(step);
                    }
                }
                self.phase = Phase::RequestBuild;
                Ok(Step::Waiting)
            }

            Phase::RequestBuild => {
                self.request_build(change, services).await?;
                self.phase = Phase::PollBuild;
                Ok(Step::Waiting)
            }

            Phase::PollBuild => {
                let Some(build_id) = self.build_id.clone() else {
                    self.phase = Phase::RequestBuild;
                    return Ok(Step::Waiting);
                };
                let status = services.builds.build_status(&build_id).await?;
                if status.url.is_some() {
                    self.build_url = status.url.clone();
                }

                match (status.status, status.result) {
                    (BuildState::Scheduled | BuildState::Started, _) => Ok(Step::Waiting),
                    (BuildState::Completed, Some(BuildResult::Failure)) => Err(BuildError::Failed(
                        status.reason.unwrap_or_else(|| "BUILD_FAILURE".to_string()),
                    )
                    .into()),
                    (BuildState::Completed, Some(BuildResult::Canceled)) => {
                        Err(BuildError::Canceled(
                            status.reason.unwrap_or_else(|| "CANCELED".to_string()),
                        )
                        .into())
                    }
                    (BuildState::Completed, _) => {
                        debug!(build = %build_id, "build completed, verifying artifact");
                        self.phase = Phase::VerifyCache;
                        Ok(Step::Waiting)
                    }
                }
            }

            Phase::VerifyCache => {
                let target = self.quest.target.clone();
                if let Some(step) = self.check_cache(change, &target, services).await? {
                    return Ok(step);
                }
                Err(BuildError::IsolateNotFound.into())
            }
        }
    }

    async fn check_cache(
        &mut self,
        change: &Change,
        target: &str,
        services: &Services,
    ) -> Result<Option<Step>, ExecutionError> {
        let found = services
            .isolates
            .get(&self.quest.builder, change, target)
            .await?;

        let Some(isolate) = found else {
            debug!(change = %change, target, "not found in isolate cache");
            return Ok(None);
        };

        let mut arguments = BTreeMap::new();
        arguments.insert("isolate_server".to_string(), isolate.server.clone());
        arguments.insert("isolate_hash".to_string(), isolate.hash.clone());
        self.isolate = Some(isolate);
        Ok(Some(Step::Done {
            arguments,
            values: Vec::new(),
        }))
    }

    /// Adopt a sibling's build for this change, or request a new one
    async fn request_build(
        &mut self,
        change: &Change,
        services: &Services,
    ) -> Result<(), ExecutionError> {
        let existing = self.quest.dedup.lock().get(change).cloned();
        if let Some(build_id) = existing {
            debug!(change = %change, build = %build_id, "reusing previously requested build");
            self.build_id = Some(build_id);
            return Ok(());
        }

        let request = BuildRequest {
            builder: self.quest.builder.clone(),
            bucket: self.quest.bucket.clone(),
            target: self.quest.target.clone(),
            change: change.clone(),
            tags: self.quest.tags.clone(),
        };
        let requested = services.builds.request_build(&request).await?;

        // Another execution may have raced us while the request was in flight.
        let build_id = self
            .quest
            .dedup
            .lock()
            .entry(change.clone())
            .or_insert(requested)
            .clone();
        debug!(change = %change, build = %build_id, "requested build");
        self.build_id = Some(build_id);
        Ok(())
    }

    pub(crate) fn details(&self) -> Vec<Detail> {
        let mut details = vec![Detail::new("builder", &self.quest.builder)];
        if let Some(build_id) = &self.build_id {
            details.push(Detail::new("build", build_id).with_url(self.build_url.clone()));
        }
        if let Some(isolate) = &self.isolate {
            details.push(
                Detail::new("isolate", &isolate.hash)
                    .with_url(Some(format!("{}/blobs/{}", isolate.server, isolate.hash))),
            );
        }
        details
    }
}
