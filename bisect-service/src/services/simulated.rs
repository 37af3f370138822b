// Simulated Backend
// In-memory build, isolate, test, result and source-control services over a linear history

use super::{
    BackendError, BuildRequest, BuildResult, BuildService, BuildState, BuildStatus, CommitInfo,
    Isolate, IsolateCache, ResultStore, SourceControl, TestRequest, TestService, TestState,
    TestStatus,
};
use crate::change::{Change, Commit};

use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};

const ISOLATE_SERVER: &str = "https://isolate.simulated";
const OUTPUT_SERVER: &str = "https://results.simulated";

/// Deterministic 40-character hash for the commit at `index`
fn commit_hash(index: usize) -> String {
    let mut x = (index as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    x ^= x >> 31;
    format!("{:016x}{:016x}{:08x}", x, x.rotate_left(17), index)
}

/// How a simulated build ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildOutcome {
    Success,
    Failure,
    Canceled,
    /// Reports success without uploading an artifact
    NoArtifact,
}

#[derive(Debug)]
struct SimBuild {
    builder: String,
    target: String,
    change: Change,
    polls_left: u32,
    outcome: BuildOutcome,
}

#[derive(Debug)]
struct SimTask {
    index: Option<usize>,
    run: usize,
    polls_left: u32,
    fails: bool,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    builds: HashMap<String, SimBuild>,
    tasks: HashMap<String, SimTask>,
    isolates: HashMap<(String, Change, String), Isolate>,
    outputs: HashMap<String, serde_json::Value>,
    build_requests: usize,
    test_runs: usize,
    commit_range_requests: usize,
}

/// Backend simulating a single repository with a linear history.
///
/// Commit 0 is the oldest. Builds and tests complete after a configurable
/// number of polls, and every test run reports `before` up to and including
/// the culprit commit and `after` for every later commit.
#[derive(Debug)]
pub struct SimulatedBackend {
    repository: String,
    hashes: Vec<String>,
    build_polls: u32,
    test_polls: u32,
    build_outcomes: HashMap<usize, BuildOutcome>,
    failing_tests: HashSet<usize>,
    metric: String,
    story: String,
    regression: Option<usize>,
    before: f64,
    after: f64,
    noise: f64,
    samples: usize,
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    /// A repository with `length` commits and no regression
    pub fn linear(repository: impl Into<String>, length: usize) -> Self {
        Self {
            repository: repository.into(),
            hashes: (0..length).map(commit_hash).collect(),
            build_polls: 1,
            test_polls: 1,
            build_outcomes: HashMap::new(),
            failing_tests: HashSet::new(),
            metric: "timeToFirstPaint".to_string(),
            story: "simulated_story".to_string(),
            regression: None,
            before: 1.0,
            after: 1.0,
            noise: 0.0,
            samples: 3,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Values jump from `before` to `after` on the commit following `culprit`
    pub fn with_regression(mut self, culprit: usize, before: f64, after: f64) -> Self {
        self.regression = Some(culprit);
        self.before = before;
        self.after = after;
        self
    }

    /// Polls a build stays in progress before completing
    pub fn with_build_polls(mut self, polls: u32) -> Self {
        self.build_polls = polls;
        self
    }

    /// Polls a test stays in progress before completing
    pub fn with_test_polls(mut self, polls: u32) -> Self {
        self.test_polls = polls;
        self
    }

    pub fn with_failing_build(mut self, index: usize) -> Self {
        self.build_outcomes.insert(index, BuildOutcome::Failure);
        self
    }

    /// Builds of the commit at `index` end cancelled
    pub fn with_cancelled_build(mut self, index: usize) -> Self {
        self.build_outcomes.insert(index, BuildOutcome::Canceled);
        self
    }

    /// Builds of the commit at `index` succeed but leave the isolate cache empty
    pub fn with_missing_artifact(mut self, index: usize) -> Self {
        self.build_outcomes.insert(index, BuildOutcome::NoArtifact);
        self
    }

    pub fn with_failing_test(mut self, index: usize) -> Self {
        self.failing_tests.insert(index);
        self
    }

    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = metric.into();
        self
    }

    pub fn with_story(mut self, story: impl Into<String>) -> Self {
        self.story = story.into();
        self
    }

    /// Deterministic spread added around each value
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude;
        self
    }

    /// Sample values reported per test run
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples.max(1);
        self
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// The commit at `index`. Panics when out of range.
    pub fn commit(&self, index: usize) -> Commit {
        Commit::new(self.repository.clone(), self.hashes[index].clone())
    }

    /// Position of a commit in the history
    pub fn index_of(&self, commit: &Commit) -> Option<usize> {
        if commit.repository != self.repository {
            return None;
        }
        self.hashes.iter().position(|h| *h == commit.git_hash)
    }

    pub fn build_requests(&self) -> usize {
        self.state.lock().build_requests
    }

    pub fn test_runs(&self) -> usize {
        self.state.lock().test_runs
    }

    pub fn commit_range_requests(&self) -> usize {
        self.state.lock().commit_range_requests
    }

    /// Put an artifact for `change` into the isolate cache
    pub fn prebuild(&self, builder: &str, change: &Change, target: &str) -> Isolate {
        let mut state = self.state.lock();
        state.next_id += 1;
        let isolate = Isolate::new(ISOLATE_SERVER, format!("prebuilt-{}", state.next_id));
        state.isolates.insert(
            (builder.to_string(), change.clone(), target.to_string()),
            isolate.clone(),
        );
        isolate
    }

    fn change_index(&self, change: &Change) -> Option<usize> {
        change.base_commit().and_then(|c| self.index_of(c))
    }

    /// Sample values produced by run number `run` of the commit at `index`
    pub fn values_for(&self, index: Option<usize>, run: usize) -> Vec<f64> {
        let regressed = matches!((self.regression, index), (Some(r), Some(i)) if i > r);
        let base = if regressed { self.after } else { self.before };
        (0..self.samples)
            .map(|j| {
                let offset = ((run * 7 + j * 3) % 5) as f64 - 2.0;
                base + self.noise * offset / 2.0
            })
            .collect()
    }

    fn histograms(&self, values: &[f64]) -> serde_json::Value {
        json!([
            {
                "name": self.metric,
                "sampleValues": values,
                "diagnostics": { "stories": [self.story] },
            }
        ])
    }
}

#[async_trait::async_trait]
impl BuildService for SimulatedBackend {
    async fn request_build(&self, request: &BuildRequest) -> Result<String, BackendError> {
        let outcome = self
            .change_index(&request.change)
            .and_then(|i| self.build_outcomes.get(&i).copied())
            .unwrap_or(BuildOutcome::Success);

        let mut state = self.state.lock();
        state.next_id += 1;
        state.build_requests += 1;
        let id = format!("build-{}", state.next_id);
        state.builds.insert(
            id.clone(),
            SimBuild {
                builder: request.builder.clone(),
                target: request.target.clone(),
                change: request.change.clone(),
                polls_left: self.build_polls,
                outcome,
            },
        );
        Ok(id)
    }

    async fn build_status(&self, build_id: &str) -> Result<BuildStatus, BackendError> {
        let mut state = self.state.lock();
        let Some(build) = state.builds.get_mut(build_id) else {
            return Err(BackendError::NotFound(format!("build {}", build_id)));
        };

        let url = Some(format!("https://builds.simulated/{}", build_id));
        if build.polls_left > 0 {
            build.polls_left -= 1;
            return Ok(BuildStatus {
                id: build_id.to_string(),
                status: BuildState::Started,
                result: None,
                reason: None,
                url,
            });
        }

        let (result, reason) = match build.outcome {
            BuildOutcome::Failure => (BuildResult::Failure, Some("compile error")),
            BuildOutcome::Canceled => (BuildResult::Canceled, Some("superseded")),
            BuildOutcome::NoArtifact | BuildOutcome::Success => (BuildResult::Success, None),
        };
        if build.outcome != BuildOutcome::Success {
            return Ok(BuildStatus {
                id: build_id.to_string(),
                status: BuildState::Completed,
                result: Some(result),
                reason: reason.map(str::to_string),
                url,
            });
        }

        let key = (
            build.builder.clone(),
            build.change.clone(),
            build.target.clone(),
        );
        let isolate = Isolate::new(ISOLATE_SERVER, format!("isolate-{}", build_id));
        state.isolates.entry(key).or_insert(isolate);

        Ok(BuildStatus {
            id: build_id.to_string(),
            status: BuildState::Completed,
            result: Some(BuildResult::Success),
            reason: None,
            url,
        })
    }
}

#[async_trait::async_trait]
impl IsolateCache for SimulatedBackend {
    async fn get(
        &self,
        builder: &str,
        change: &Change,
        target: &str,
    ) -> Result<Option<Isolate>, BackendError> {
        let key = (builder.to_string(), change.clone(), target.to_string());
        Ok(self.state.lock().isolates.get(&key).cloned())
    }
}

#[async_trait::async_trait]
impl TestService for SimulatedBackend {
    async fn trigger(&self, request: &TestRequest) -> Result<String, BackendError> {
        let index = self.change_index(&request.change);
        let fails = index.is_some_and(|i| self.failing_tests.contains(&i));

        let mut state = self.state.lock();
        state.next_id += 1;
        let run = state.test_runs;
        state.test_runs += 1;
        let id = format!("task-{}", state.next_id);
        state.tasks.insert(
            id.clone(),
            SimTask {
                index,
                run,
                polls_left: self.test_polls,
                fails,
            },
        );
        Ok(id)
    }

    async fn status(&self, task_id: &str) -> Result<TestStatus, BackendError> {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Err(BackendError::NotFound(format!("task {}", task_id)));
        };

        if task.polls_left > 0 {
            task.polls_left -= 1;
            return Ok(TestStatus {
                state: TestState::Running,
                failure: false,
                bot_id: Some("sim-bot-1".to_string()),
                output: None,
            });
        }

        if task.fails {
            return Ok(TestStatus {
                state: TestState::Completed,
                failure: true,
                bot_id: Some("sim-bot-1".to_string()),
                output: None,
            });
        }

        let (index, run) = (task.index, task.run);
        let output = Isolate::new(OUTPUT_SERVER, format!("output-{}", task_id));
        let histograms = self.histograms(&self.values_for(index, run));
        state.outputs.insert(output.hash.clone(), histograms);

        Ok(TestStatus {
            state: TestState::Completed,
            failure: false,
            bot_id: Some("sim-bot-1".to_string()),
            output: Some(output),
        })
    }
}

#[async_trait::async_trait]
impl ResultStore for SimulatedBackend {
    async fn fetch(&self, output: &Isolate, path: &str) -> Result<serde_json::Value, BackendError> {
        self.state
            .lock()
            .outputs
            .get(&output.hash)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("{}/{}", output.hash, path)))
    }
}

#[async_trait::async_trait]
impl SourceControl for SimulatedBackend {
    async fn commit_range(
        &self,
        repository: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<CommitInfo>, BackendError> {
        self.state.lock().commit_range_requests += 1;

        if repository != self.repository {
            return Err(BackendError::NotFound(format!("repository {}", repository)));
        }
        let position = |hash: &str| {
            self.hashes
                .iter()
                .position(|h| h == hash)
                .ok_or_else(|| BackendError::NotFound(format!("commit {}", hash)))
        };
        let from = position(from)?;
        let to = position(to)?;
        if from >= to {
            return Ok(Vec::new());
        }

        Ok((from + 1..=to)
            .rev()
            .map(|i| CommitInfo {
                commit: self.hashes[i].clone(),
                parents: vec![self.hashes[i - 1].clone()],
                author: Some("dev@simulated".to_string()),
                message: Some(format!("Commit {}", i)),
            })
            .collect())
    }
}
