// Quest Module
// Quest descriptors and the executions they start for a change

pub mod error;
pub mod execution;
pub mod find_isolate;
pub mod read_value;

// Re-export key types
pub use error::{BuildError, ExecutionError, ReadValueError, TestError};
pub use execution::{Detail, Execution, ExecutionState, DEFAULT_MAX_POLLS};
pub use find_isolate::FindIsolate;
pub use read_value::{ReadValue, ReadValueMode, Statistic};
pub use run_test::RunTest;

use crate::change::Change;
use crate::services::Isolate;
use execution::Stage;
use find_isolate::FindIsolateExecution;
use read_value::ReadValueExecution;
use run_test::RunTestExecution;

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Build ids already requested per change, shared by every find-isolate
/// execution of one job
pub type BuildDedup = Arc<Mutex<HashMap<Change, String>>>;

pub fn new_build_dedup() -> BuildDedup {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Descriptor of a kind of work; starts one execution per change
#[derive(Debug, Clone, PartialEq)]
pub enum Quest {
    FindIsolate(FindIsolate),
    RunTest(RunTest),
    ReadValue(ReadValue),
}

impl Quest {
    /// Start an execution for `change`.
    ///
    /// `inputs` holds the result arguments of the previous quest's execution;
    /// test and read-value quests need `isolate_server` and `isolate_hash`.
    pub fn start(
        &self,
        change: &Change,
        inputs: &BTreeMap<String, String>,
    ) -> Result<Execution, ExecutionError> {
        let stage = match self {
            Quest::FindIsolate(quest) => {
                Stage::FindIsolate(FindIsolateExecution::new(quest.clone()))
            }
            Quest::RunTest(quest) => {
                Stage::RunTest(RunTestExecution::new(quest.clone(), isolate_input(inputs)?))
            }
            Quest::ReadValue(quest) => {
                Stage::ReadValue(ReadValueExecution::new(quest.clone(), isolate_input(inputs)?))
            }
        };
        Ok(Execution::new(change.clone(), stage))
    }
}

fn isolate_input(inputs: &BTreeMap<String, String>) -> Result<Isolate, ExecutionError> {
    let field = |name: &str| {
        inputs
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::MissingInput(name.to_string()))
    };
    Ok(Isolate::new(field("isolate_server")?, field("isolate_hash")?))
}

impl fmt::Display for Quest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quest::FindIsolate(_) => "Build",
            Quest::RunTest(_) => "Test",
            Quest::ReadValue(_) => "Get values",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Commit;
    use crate::services::{Services, SimulatedBackend};

    fn quest(dedup: &BuildDedup) -> Quest {
        Quest::FindIsolate(FindIsolate::new(
            "linux-perf",
            "performance_test_suite",
            "ci",
            dedup.clone(),
        ))
    }

    #[test]
    fn test_quest_equality_ignores_dedup() {
        let a = quest(&new_build_dedup());
        let b = quest(&new_build_dedup());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "Build");
    }

    #[tokio::test]
    async fn test_concurrent_find_isolate_requests_one_build() {
        let backend = Arc::new(SimulatedBackend::linear("chromium", 4).with_build_polls(1));
        let services = Services::from_backend(backend.clone());
        let dedup = new_build_dedup();
        let change = Change::from_commit(backend.commit(2));

        let mut executions: Vec<Execution> = (0..3)
            .map(|_| quest(&dedup).start(&change, &BTreeMap::new()).unwrap())
            .collect();

        for _ in 0..6 {
            for execution in executions.iter_mut() {
                execution.advance(&services).await;
            }
        }

        assert_eq!(backend.build_requests(), 1);
        for execution in &executions {
            assert!(execution.completed(), "{:?}", execution.error());
        }
        let hashes: Vec<_> = executions
            .iter()
            .map(|e| e.result_arguments()["isolate_hash"].clone())
            .collect();
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_cached_isolate_skips_build() {
        let backend = Arc::new(SimulatedBackend::linear("chromium", 4));
        let services = Services::from_backend(backend.clone());
        let change = Change::from_commit(backend.commit(1));
        backend.prebuild("linux-perf", &change, "performance_test_suite");

        let mut execution = quest(&new_build_dedup())
            .start(&change, &BTreeMap::new())
            .unwrap();
        assert_eq!(execution.advance(&services).await, ExecutionState::Completed);
        assert_eq!(backend.build_requests(), 0);
    }

    #[tokio::test]
    async fn test_fallback_target() {
        let backend = Arc::new(SimulatedBackend::linear("chromium", 4));
        let services = Services::from_backend(backend.clone());
        let change = Change::from_commit(backend.commit(1));
        backend.prebuild("linux-perf", &change, "telemetry_perf_tests");

        let find = FindIsolate::new("linux-perf", "performance_test_suite", "ci", new_build_dedup())
            .with_fallback_target("telemetry_perf_tests");
        let mut execution = Quest::FindIsolate(find)
            .start(&change, &BTreeMap::new())
            .unwrap();
        assert_eq!(execution.advance(&services).await, ExecutionState::Polling);
        assert_eq!(execution.advance(&services).await, ExecutionState::Completed);
        assert_eq!(backend.build_requests(), 0);
    }

    #[tokio::test]
    async fn test_failed_build() {
        let backend = Arc::new(
            SimulatedBackend::linear("chromium", 4)
                .with_build_polls(0)
                .with_failing_build(3),
        );
        let services = Services::from_backend(backend.clone());
        let change = Change::from_commit(backend.commit(3));

        let mut execution = quest(&new_build_dedup())
            .start(&change, &BTreeMap::new())
            .unwrap();
        let mut state = ExecutionState::NotStarted;
        for _ in 0..3 {
            state = execution.advance(&services).await;
        }
        assert_eq!(state, ExecutionState::Failed);
        assert_eq!(execution.error().map(|e| e.reason()), Some("BuildFailed"));
    }

    #[tokio::test]
    async fn test_cancelled_build() {
        let backend = Arc::new(
            SimulatedBackend::linear("chromium", 4)
                .with_build_polls(0)
                .with_cancelled_build(2),
        );
        let services = Services::from_backend(backend.clone());
        let change = Change::from_commit(backend.commit(2));

        let mut execution = quest(&new_build_dedup())
            .start(&change, &BTreeMap::new())
            .unwrap();
        let mut state = ExecutionState::NotStarted;
        for _ in 0..3 {
            state = execution.advance(&services).await;
        }
        assert_eq!(state, ExecutionState::Failed);
        assert_eq!(
            execution.error(),
            Some(&ExecutionError::Build(BuildError::Canceled("superseded".to_string())))
        );
        assert_eq!(execution.error().map(|e| e.reason()), Some("BuildCancelled"));
    }

    #[tokio::test]
    async fn test_successful_build_without_artifact() {
        let backend = Arc::new(
            SimulatedBackend::linear("chromium", 4)
                .with_build_polls(0)
                .with_missing_artifact(1),
        );
        let services = Services::from_backend(backend.clone());
        let change = Change::from_commit(backend.commit(1));

        let mut execution = quest(&new_build_dedup())
            .start(&change, &BTreeMap::new())
            .unwrap();
        while !execution.is_terminal() {
            execution.advance(&services).await;
        }
        assert_eq!(
            execution.error(),
            Some(&ExecutionError::Build(BuildError::IsolateNotFound))
        );
        assert_eq!(execution.error().map(|e| e.reason()), Some("BuildIsolateNotFound"));
        assert_eq!(backend.build_requests(), 1);
    }

    #[tokio::test]
    async fn test_build_pipeline_to_values() {
        let backend = Arc::new(SimulatedBackend::linear("chromium", 4).with_regression(2, 1.0, 5.0));
        let services = Services::from_backend(backend.clone());
        let change = Change::from_commit(backend.commit(3));
        let dedup = new_build_dedup();

        let quests = [
            quest(&dedup),
            Quest::RunTest(RunTest::new("https://swarming", BTreeMap::new())),
            Quest::ReadValue(ReadValue::histograms(
                "perf_results.json",
                "timeToFirstPaint",
                None,
            )),
        ];

        let mut inputs = BTreeMap::new();
        let mut values = Vec::new();
        for quest in &quests {
            let mut execution = quest.start(&change, &inputs).unwrap();
            while !execution.is_terminal() {
                execution.advance(&services).await;
            }
            assert!(execution.completed(), "{:?}", execution.error());
            inputs = execution.result_arguments().clone();
            values = execution.result_values().to_vec();
        }
        assert_eq!(values, vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_read_value_requires_isolate() {
        let change = Change::from_commit(Commit::new("chromium", "abc"));
        let err = Quest::ReadValue(ReadValue::default())
            .start(&change, &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err, ExecutionError::MissingInput("isolate_server".to_string()));
    }
}
