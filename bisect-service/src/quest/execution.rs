// Execution State Machine
// Polling lifecycle shared by every quest execution

use super::error::ExecutionError;
use super::find_isolate::FindIsolateExecution;
use super::read_value::ReadValueExecution;
use super::run_test::RunTestExecution;
use crate::change::Change;
use crate::services::Services;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Default poll budget: three days at one poll per minute
pub const DEFAULT_MAX_POLLS: u32 = 4320;

/// Lifecycle of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    NotStarted,
    Polling,
    Completed,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Failed)
    }
}

/// Outcome of a single poll
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Waiting,
    Done {
        arguments: BTreeMap<String, String>,
        values: Vec<f64>,
    },
}

/// Key/value shown for an execution, optionally linking to a backend page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detail {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Detail {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Stage {
    FindIsolate(FindIsolateExecution),
    RunTest(RunTestExecution),
    ReadValue(ReadValueExecution),
}

impl Stage {
    async fn poll(&mut self, change: &Change, services: &Services) -> Result<Step, ExecutionError> {
        match self {
            Stage::FindIsolate(stage) => stage.poll(change, services).await,
            Stage::RunTest(stage) => stage.poll(change, services).await,
            Stage::ReadValue(stage) => stage.poll(services).await,
        }
    }

    fn details(&self) -> Vec<Detail> {
        match self {
            Stage::FindIsolate(stage) => stage.details(),
            Stage::RunTest(stage) => stage.details(),
            Stage::ReadValue(stage) => stage.details(),
        }
    }
}

/// One unit of asynchronous work for a change.
///
/// Calling [`Execution::advance`] moves the execution forward by at most one
/// outbound request. Once completed or failed an execution never changes again.
#[derive(Debug, Clone)]
pub struct Execution {
    change: Change,
    stage: Stage,
    state: ExecutionState,
    polls: u32,
    max_polls: u32,
    result_arguments: BTreeMap<String, String>,
    result_values: Vec<f64>,
    error: Option<ExecutionError>,
}

impl Execution {
    pub(crate) fn new(change: Change, stage: Stage) -> Self {
        Self {
            change,
            stage,
            state: ExecutionState::NotStarted,
            polls: 0,
            max_polls: DEFAULT_MAX_POLLS,
            result_arguments: BTreeMap::new(),
            result_values: Vec::new(),
            error: None,
        }
    }

    /// Limit the number of non-terminal polls before the execution times out
    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls.max(1);
        self
    }

    pub fn change(&self) -> &Change {
        &self.change
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn completed(&self) -> bool {
        self.state == ExecutionState::Completed
    }

    pub fn failed(&self) -> bool {
        self.state == ExecutionState::Failed
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        self.error.as_ref()
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Outputs handed to the next quest (isolate references)
    pub fn result_arguments(&self) -> &BTreeMap<String, String> {
        &self.result_arguments
    }

    /// Measurements produced by a read-value execution
    pub fn result_values(&self) -> &[f64] {
        &self.result_values
    }

    /// Poll the backends once and return the resulting state.
    ///
    /// Transient service errors leave the execution polling; any other error
    /// fails it. Terminal executions are returned unchanged.
    pub async fn advance(&mut self, services: &Services) -> ExecutionState {
        if self.is_terminal() {
            return self.state;
        }
        self.state = ExecutionState::Polling;

        match self.stage.poll(&self.change, services).await {
            Ok(Step::Done { arguments, values }) => {
                debug!(change = %self.change, polls = self.polls, "execution completed");
                self.result_arguments = arguments;
                self.result_values = values;
                self.state = ExecutionState::Completed;
            }
            Ok(Step::Waiting) => self.count_poll(),
            Err(e) if e.is_transient() => {
                warn!(change = %self.change, error = %e, "transient service error, will retry");
                self.count_poll();
            }
            Err(e) => self.fail(e),
        }

        self.state
    }

    fn count_poll(&mut self) {
        self.polls += 1;
        if self.polls >= self.max_polls {
            self.fail(ExecutionError::Timeout { polls: self.polls });
        }
    }

    fn fail(&mut self, error: ExecutionError) {
        debug!(change = %self.change, error = %error, "execution failed");
        self.error = Some(error);
        self.state = ExecutionState::Failed;
    }

    /// Fail an execution that is not yet terminal (job cancellation)
    pub(crate) fn abort(&mut self, error: ExecutionError) {
        if !self.is_terminal() {
            self.fail(error);
        }
    }

    pub fn details(&self) -> Vec<Detail> {
        self.stage.details()
    }

    /// JSON summary: `{completed, exception, details}`
    pub fn as_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "completed": self.completed(),
            "exception": self.error.as_ref().map(|e| e.to_string()),
            "details": self.details(),
        })
    }
}
