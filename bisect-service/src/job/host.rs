// Job Evaluation Host
// Applies evaluator actions to a job's task graph, executions and search space

use crate::bisection::stages::payload_errors;
use crate::bisection::{add_attempts, attempt_count, resolve_pairs, Exploration, PairOutcome};
use crate::change::Change;
use crate::events::{EngineEvent, EventSender, ProgressSender};
use crate::quest::{Execution, ExecutionError, ExecutionState, Quest};
use crate::services::Services;
use crate::task::{Action, EvaluateError, EvaluationHost, TaskGraph, TaskStatus, TaskType};

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Mutable view of a job during one evaluation
pub(crate) struct JobHost<'a> {
    pub job_id: &'a str,
    pub graph: &'a mut TaskGraph,
    pub executions: &'a mut HashMap<String, Execution>,
    pub quests: &'a [Quest],
    pub changes: &'a mut Vec<Change>,
    pub culprits: &'a mut Vec<(Change, Change)>,
    pub bots: &'a mut Vec<String>,
    pub services: &'a Services,
    pub progress: &'a Option<ProgressSender>,
    /// Attempts given to every inserted change
    pub min_attempts: usize,
    pub max_polls: u32,
}

fn errors_payload(reason: &str, message: String) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(
        "errors".to_string(),
        json!([{"reason": reason, "message": message}]),
    );
    payload
}

fn quest_for(quests: &[Quest], task_type: TaskType) -> Option<&Quest> {
    quests.iter().find(|quest| {
        matches!(
            (quest, task_type),
            (Quest::FindIsolate(_), TaskType::FindIsolate)
                | (Quest::RunTest(_), TaskType::RunTest)
                | (Quest::ReadValue(_), TaskType::ReadValue)
        )
    })
}

impl JobHost<'_> {
    /// Set status and merge payload. Invalid transitions are logged and skipped.
    fn update_task(
        &mut self,
        task_id: &str,
        status: Option<TaskStatus>,
        payload: Map<String, Value>,
    ) -> Result<bool, EvaluateError> {
        if !self.graph.contains(task_id) {
            return Err(EvaluateError::UnknownTask(task_id.to_string()));
        }
        let mut changed = self.graph.merge_payload(task_id, payload)?;

        if let Some(status) = status {
            match self.graph.update_status(task_id, status) {
                Ok(true) => {
                    debug!(job_id = self.job_id, task_id, status = %status, "task updated");
                    self.progress
                        .send_event(EngineEvent::task_updated(self.job_id, task_id, status));
                    changed = true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(job_id = self.job_id, task_id, error = %e, "skipping status update");
                }
            }
        }
        Ok(changed)
    }

    /// Start the task's execution if needed, then advance it once
    async fn advance_task(&mut self, task_id: &str) -> Result<bool, EvaluateError> {
        let task = self
            .graph
            .get(task_id)
            .ok_or_else(|| EvaluateError::UnknownTask(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(false);
        }

        if !self.executions.contains_key(task_id) {
            let change: Change = task
                .payload
                .get("change")
                .cloned()
                .and_then(|c| serde_json::from_value(c).ok())
                .ok_or_else(|| EvaluateError::InvalidPayload {
                    task_id: task_id.to_string(),
                    message: "missing \"change\"".to_string(),
                })?;
            let quest = quest_for(self.quests, task.task_type).ok_or_else(|| {
                EvaluateError::InvalidPayload {
                    task_id: task_id.to_string(),
                    message: format!("no quest runs {} tasks", task.task_type),
                }
            })?;
            let inputs: BTreeMap<String, String> = task
                .dependencies
                .first()
                .and_then(|dependency| self.executions.get(dependency))
                .map(|execution| execution.result_arguments().clone())
                .unwrap_or_default();

            match quest.start(&change, &inputs) {
                Ok(execution) => {
                    self.executions
                        .insert(task_id.to_string(), execution.with_max_polls(self.max_polls));
                }
                Err(error) => {
                    let payload = errors_payload(error.reason(), error.to_string());
                    return self.update_task(task_id, Some(TaskStatus::Failed), payload);
                }
            }
        }

        let Some(execution) = self.executions.get_mut(task_id) else {
            return Ok(false);
        };
        let state = execution.advance(self.services).await;

        let mut payload = Map::new();
        payload.insert("execution".to_string(), execution.as_dict());
        let status = match state {
            ExecutionState::Completed => {
                payload.insert(
                    "result_arguments".to_string(),
                    json!(execution.result_arguments()),
                );
                payload.insert("result_values".to_string(), json!(execution.result_values()));
                for detail in execution.details() {
                    if detail.key == "bot" && !self.bots.contains(&detail.value) {
                        self.bots.push(detail.value);
                    }
                }
                TaskStatus::Completed
            }
            ExecutionState::Failed => {
                if let Some(error) = execution.error() {
                    payload.extend(errors_payload(error.reason(), error.to_string()));
                }
                TaskStatus::Failed
            }
            ExecutionState::NotStarted | ExecutionState::Polling => TaskStatus::Ongoing,
        };
        self.update_task(task_id, Some(status), payload)
    }

    async fn explore(
        &mut self,
        task_id: &str,
        exploration: Exploration,
    ) -> Result<bool, EvaluateError> {
        let mut changed = false;

        for (change, target) in &exploration.refine {
            let current = attempt_count(self.graph, change);
            let added = add_attempts(self.graph, change, current, *target)?;
            if added > 0 {
                debug!(job_id = self.job_id, change = %change, attempts = *target, "refining change");
                changed = true;
            }
        }

        if !exploration.bisect.is_empty() {
            let outcomes = resolve_pairs(
                &exploration.bisect,
                self.changes.as_slice(),
                self.services.source_control.as_ref(),
            )
            .await;
            for outcome in outcomes {
                changed |= self.apply_outcome(task_id, outcome)?;
            }
        }
        Ok(changed)
    }

    fn apply_outcome(&mut self, task_id: &str, outcome: PairOutcome) -> Result<bool, EvaluateError> {
        let mut payload = Map::new();
        match outcome {
            PairOutcome::Midpoint {
                before,
                after,
                midpoint,
            } => {
                let position = self
                    .changes
                    .iter()
                    .position(|c| *c == after)
                    .unwrap_or(self.changes.len());
                self.changes.insert(position, midpoint.clone());
                add_attempts(self.graph, &midpoint, 0, self.min_attempts)?;
                info!(job_id = self.job_id, change = %midpoint, "added change");
                self.progress.send_event(EngineEvent::ChangeAdded {
                    job_id: self.job_id.to_string(),
                    change: midpoint.to_string(),
                    before: before.to_string(),
                    after: after.to_string(),
                });
                payload.insert("changes".to_string(), json!(self.changes));
            }
            PairOutcome::Culprit { before, after } => {
                let pair = (before, after);
                if self.culprits.contains(&pair) {
                    return Ok(false);
                }
                info!(job_id = self.job_id, culprit = %pair.0, next = %pair.1, "culprit found");
                self.progress.send_event(EngineEvent::CulpritFound {
                    job_id: self.job_id.to_string(),
                    culprit: pair.0.to_string(),
                    next: pair.1.to_string(),
                });
                self.culprits.push(pair);
                payload.insert("culprits".to_string(), json!(self.culprits));
            }
            PairOutcome::Unresolvable {
                before,
                after,
                reason,
            } => {
                warn!(job_id = self.job_id, before = %before, after = %after, reason = %reason, "cannot bisect pair");
                let task = self
                    .graph
                    .get(task_id)
                    .ok_or_else(|| EvaluateError::UnknownTask(task_id.to_string()))?;
                let mut failed_pairs: Vec<(Change, Change)> = task
                    .payload
                    .get("failed_pairs")
                    .and_then(|p| serde_json::from_value(p.clone()).ok())
                    .unwrap_or_default();
                let mut errors = payload_errors(&task.payload);
                errors.push(json!({"reason": "NonLinear", "message": reason}));
                failed_pairs.push((before, after));
                payload.insert("failed_pairs".to_string(), json!(failed_pairs));
                payload.insert("errors".to_string(), Value::Array(errors));
            }
            PairOutcome::Retry {
                before,
                after,
                reason,
            } => {
                warn!(job_id = self.job_id, before = %before, after = %after, reason = %reason, "midpoint lookup failed, will retry");
                return Ok(false);
            }
        }
        self.update_task(task_id, None, payload)
    }
}

/// Fail every in-flight execution and mark its task cancelled
pub(crate) fn abort_executions(
    job_id: &str,
    graph: &mut TaskGraph,
    executions: &mut HashMap<String, Execution>,
    reason: &str,
) {
    for (task_id, execution) in executions.iter_mut() {
        if execution.is_terminal() {
            continue;
        }
        execution.abort(ExecutionError::Cancelled(reason.to_string()));
        if let Err(e) = graph.update_status(task_id, TaskStatus::Cancelled) {
            debug!(job_id, task_id = %task_id, error = %e, "task not cancelled");
        }
    }
}

#[async_trait::async_trait]
impl EvaluationHost for JobHost<'_> {
    fn graph(&self) -> &TaskGraph {
        self.graph
    }

    async fn apply(&mut self, actions: Vec<Action>) -> Result<bool, EvaluateError> {
        let mut changed = false;
        for action in actions {
            changed |= match action {
                Action::UpdateTask {
                    task_id,
                    status,
                    payload,
                } => self.update_task(&task_id, status, payload)?,
                Action::Advance { task_id } => self.advance_task(&task_id).await?,
                Action::Explore {
                    task_id,
                    exploration,
                } => self.explore(&task_id, exploration).await?,
            };
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bisection::{build_graph, find_isolate_id, run_test_id, ComparisonMode};
    use crate::quest::{new_build_dedup, FindIsolate, ReadValue, RunTest};
    use crate::services::SimulatedBackend;
    use std::sync::Arc;

    struct Fixture {
        backend: Arc<SimulatedBackend>,
        services: Services,
        graph: TaskGraph,
        executions: HashMap<String, Execution>,
        quests: Vec<Quest>,
        changes: Vec<Change>,
        culprits: Vec<(Change, Change)>,
        bots: Vec<String>,
        progress: Option<ProgressSender>,
    }

    impl Fixture {
        fn new(first: usize, second: usize) -> Self {
            let backend = Arc::new(SimulatedBackend::linear("chromium", 8).with_build_polls(0));
            let services = Services::from_backend(backend.clone());
            let changes = vec![
                Change::from_commit(backend.commit(first)),
                Change::from_commit(backend.commit(second)),
            ];
            let graph = build_graph(&changes, 1, ComparisonMode::Performance).unwrap();
            let quests = vec![
                Quest::FindIsolate(FindIsolate::new(
                    "linux-perf",
                    "performance_test_suite",
                    "ci",
                    new_build_dedup(),
                )),
                Quest::RunTest(RunTest::new("https://swarming", BTreeMap::new())),
                Quest::ReadValue(ReadValue::histograms("perf_results.json", "timeToFirstPaint", None)),
            ];
            Self {
                backend,
                services,
                graph,
                executions: HashMap::new(),
                quests,
                changes,
                culprits: Vec::new(),
                bots: Vec::new(),
                progress: None,
            }
        }

        fn host(&mut self) -> JobHost<'_> {
            JobHost {
                job_id: "job",
                graph: &mut self.graph,
                executions: &mut self.executions,
                quests: &self.quests,
                changes: &mut self.changes,
                culprits: &mut self.culprits,
                bots: &mut self.bots,
                services: &self.services,
                progress: &self.progress,
                min_attempts: 2,
                max_polls: 10,
            }
        }
    }

    #[tokio::test]
    async fn test_advance_records_execution() {
        let mut fixture = Fixture::new(0, 7);
        let isolate = find_isolate_id(&fixture.changes[0]);

        let changed = fixture
            .host()
            .apply(vec![Action::advance(isolate.clone())])
            .await
            .unwrap();
        assert!(changed);

        let task = fixture.graph.get(&isolate).unwrap();
        assert_eq!(task.status, TaskStatus::Ongoing);
        assert_eq!(task.payload["execution"]["completed"], false);

        // Cache miss, build request, build poll, artifact lookup
        for _ in 0..3 {
            fixture
                .host()
                .apply(vec![Action::advance(isolate.clone())])
                .await
                .unwrap();
        }
        let task = fixture.graph.get(&isolate).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.payload["result_arguments"]["isolate_hash"].is_string());
        assert_eq!(fixture.backend.build_requests(), 1);
    }

    #[tokio::test]
    async fn test_missing_input_fails_task() {
        let mut fixture = Fixture::new(0, 7);
        let test_id = run_test_id(&fixture.changes[0], 0);

        fixture
            .host()
            .apply(vec![Action::advance(test_id.clone())])
            .await
            .unwrap();
        let task = fixture.graph.get(&test_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.payload["errors"][0]["reason"], "MissingInput");
    }

    #[tokio::test]
    async fn test_invalid_transition_is_skipped() {
        let mut fixture = Fixture::new(0, 7);
        let isolate = find_isolate_id(&fixture.changes[0]);
        fixture.graph.update_status(&isolate, TaskStatus::Completed).unwrap();

        let changed = fixture
            .host()
            .apply(vec![Action::update_status(isolate.clone(), TaskStatus::Pending)])
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(fixture.graph.get(&isolate).unwrap().status, TaskStatus::Completed);

        let result = fixture
            .host()
            .apply(vec![Action::update_status("missing", TaskStatus::Ongoing)])
            .await;
        assert!(matches!(result, Err(EvaluateError::UnknownTask(_))));
    }

    #[tokio::test]
    async fn test_explore_inserts_midpoint() {
        let mut fixture = Fixture::new(0, 4);
        let (a, b) = (fixture.changes[0].clone(), fixture.changes[1].clone());
        let exploration = Exploration {
            bisect: vec![(a.clone(), b.clone())],
            refine: Vec::new(),
        };

        let changed = fixture
            .host()
            .apply(vec![Action::Explore {
                task_id: crate::bisection::FIND_CULPRIT_TASK.to_string(),
                exploration,
            }])
            .await
            .unwrap();
        assert!(changed);

        let midpoint = Change::from_commit(fixture.backend.commit(2));
        assert_eq!(fixture.changes, vec![a, midpoint.clone(), b]);
        assert_eq!(attempt_count(&fixture.graph, &midpoint), 2);
        let task = fixture.graph.get(crate::bisection::FIND_CULPRIT_TASK).unwrap();
        assert_eq!(task.payload["changes"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_explore_records_culprit_and_refines() {
        let mut fixture = Fixture::new(3, 4);
        let (a, b) = (fixture.changes[0].clone(), fixture.changes[1].clone());
        let exploration = Exploration {
            bisect: vec![(a.clone(), b.clone())],
            refine: vec![(b.clone(), 3)],
        };

        fixture
            .host()
            .apply(vec![Action::Explore {
                task_id: crate::bisection::FIND_CULPRIT_TASK.to_string(),
                exploration,
            }])
            .await
            .unwrap();

        assert_eq!(fixture.culprits, vec![(a.clone(), b.clone())]);
        assert_eq!(fixture.changes.len(), 2);
        assert_eq!(attempt_count(&fixture.graph, &b), 3);
        let task = fixture.graph.get(crate::bisection::FIND_CULPRIT_TASK).unwrap();
        assert_eq!(task.payload["culprits"], json!([[a, b]]));
    }

    #[test]
    fn test_abort_cancels_in_flight() {
        let mut fixture = Fixture::new(0, 7);
        let isolate = find_isolate_id(&fixture.changes[0]);
        let execution = fixture.quests[0]
            .start(&fixture.changes[0], &BTreeMap::new())
            .unwrap();
        fixture.executions.insert(isolate.clone(), execution);
        fixture.graph.update_status(&isolate, TaskStatus::Ongoing).unwrap();

        abort_executions("job", &mut fixture.graph, &mut fixture.executions, "dev: stop");
        assert_eq!(fixture.graph.get(&isolate).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(
            fixture.executions[&isolate].error().map(|e| e.reason()),
            Some("JobCancelled")
        );
    }
}
