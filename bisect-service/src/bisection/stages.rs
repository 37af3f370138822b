// Stage Evaluator
// Drives find-isolate, run-test and read-value tasks once their inputs are ready

use crate::task::{Accumulator, Action, Evaluator, Event, Task, TaskStatus};

use serde_json::{json, Map, Value};

/// Status of a dependency as recorded in the accumulator
pub(crate) fn accumulated_status(accumulator: &Accumulator, task_id: &str) -> Option<TaskStatus> {
    accumulator
        .get(task_id)
        .and_then(|entry| entry.get("status"))
        .and_then(|status| serde_json::from_value(status.clone()).ok())
}

/// Advances a stage task when all its dependencies completed, and fails it when
/// any dependency failed or was cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionEvaluator;

impl Evaluator for ExecutionEvaluator {
    fn evaluate(&self, task: &Task, _: &Event, accumulator: &mut Accumulator) -> Option<Vec<Action>> {
        let mut all_completed = true;
        for dependency in &task.dependencies {
            match accumulated_status(accumulator, dependency) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) => {
                    let mut payload = Map::new();
                    payload.insert(
                        "errors".to_string(),
                        json!([{
                            "reason": "DependencyFailed",
                            "message": format!("Dependency \"{}\" did not complete", dependency),
                        }]),
                    );
                    return Some(vec![Action::update(
                        task.id.clone(),
                        Some(TaskStatus::Failed),
                        payload,
                    )]);
                }
                _ => all_completed = false,
            }
        }

        all_completed.then(|| vec![Action::advance(task.id.clone())])
    }
}

/// Errors recorded in a task payload
pub(crate) fn payload_errors(payload: &Map<String, Value>) -> Vec<Value> {
    payload
        .get("errors")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    fn test_task() -> Task {
        Task::new("run_test_x_0", TaskType::RunTest)
            .with_dependencies(vec!["find_isolate_x".to_string()])
    }

    fn accumulator_with(status: &str) -> Accumulator {
        let mut accumulator = Accumulator::new();
        accumulator.insert("find_isolate_x".to_string(), json!({"status": status}));
        accumulator
    }

    #[test]
    fn test_waits_for_dependencies() {
        let mut accumulator = accumulator_with("ongoing");
        assert_eq!(
            ExecutionEvaluator.evaluate(&test_task(), &Event::update(), &mut accumulator),
            None
        );
    }

    #[test]
    fn test_advances_when_dependencies_completed() {
        let mut accumulator = accumulator_with("completed");
        assert_eq!(
            ExecutionEvaluator.evaluate(&test_task(), &Event::update(), &mut accumulator),
            Some(vec![Action::advance("run_test_x_0")])
        );

        let root = Task::new("find_isolate_x", TaskType::FindIsolate);
        assert_eq!(
            ExecutionEvaluator.evaluate(&root, &Event::initiate(), &mut Accumulator::new()),
            Some(vec![Action::advance("find_isolate_x")])
        );
    }

    #[test]
    fn test_fails_on_failed_dependency() {
        let mut accumulator = accumulator_with("failed");
        let actions = ExecutionEvaluator
            .evaluate(&test_task(), &Event::update(), &mut accumulator)
            .unwrap();
        match &actions[0] {
            Action::UpdateTask {
                status, payload, ..
            } => {
                assert_eq!(*status, Some(TaskStatus::Failed));
                assert_eq!(payload_errors(payload)[0]["reason"], "DependencyFailed");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }
}
