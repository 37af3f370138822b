// Bisection Pipeline
// Task ids, graph construction and the evaluator stack of a bisection job

use super::find_culprit::FindCulpritEvaluator;
use super::stages::ExecutionEvaluator;
use super::ComparisonMode;
use crate::change::Change;
use crate::config::BisectionSettings;
use crate::task::{
    All, DispatchByEventType, DispatchByTaskType, EventType, Filter, GraphError, Not,
    PayloadLifter, Sequence, Task, TaskGraph, TaskIsEventTarget, TaskStatus, TaskStatusIn,
    TaskType,
};

use serde_json::{json, Map, Value};

/// Id of the task that compares changes and grows the search space
pub const FIND_CULPRIT_TASK: &str = "performance_bisection";

pub fn find_isolate_id(change: &Change) -> String {
    format!("find_isolate_{}", change.id_string())
}

pub fn run_test_id(change: &Change, attempt: usize) -> String {
    format!("run_test_{}_{}", change.id_string(), attempt)
}

pub fn read_value_id(change: &Change, attempt: usize) -> String {
    format!("read_value_{}_{}", change.id_string(), attempt)
}

/// One build/test/read cycle for a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub change: Change,
    pub index: usize,
}

impl Attempt {
    pub fn new(change: Change, index: usize) -> Self {
        Self { change, index }
    }

    /// Ids of the tasks whose executions form this attempt, in pipeline order
    pub fn task_ids(&self) -> [String; 3] {
        [
            find_isolate_id(&self.change),
            run_test_id(&self.change, self.index),
            read_value_id(&self.change, self.index),
        ]
    }
}

fn stage_payload(change: &Change, attempt: Option<usize>) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("change".to_string(), json!(change));
    if let Some(attempt) = attempt {
        payload.insert("attempt".to_string(), json!(attempt));
    }
    payload
}

/// Add attempts `from..to` for `change`.
///
/// The change's find-isolate task is created on first use and shared by all of
/// its attempts. When the find-culprit task exists it gains a dependency on
/// every new read-value task. Returns the number of attempts added.
pub fn add_attempts(
    graph: &mut TaskGraph,
    change: &Change,
    from: usize,
    to: usize,
) -> Result<usize, GraphError> {
    let isolate_id = find_isolate_id(change);
    if !graph.contains(&isolate_id) {
        graph.add_task(
            Task::new(isolate_id.clone(), TaskType::FindIsolate)
                .with_payload(stage_payload(change, None)),
        )?;
    }

    let mut added = 0;
    for attempt in from..to {
        let test_id = run_test_id(change, attempt);
        if graph.contains(&test_id) {
            continue;
        }
        let read_id = read_value_id(change, attempt);

        graph.add_task(
            Task::new(test_id.clone(), TaskType::RunTest)
                .with_payload(stage_payload(change, Some(attempt)))
                .with_dependencies(vec![isolate_id.clone()]),
        )?;
        graph.add_task(
            Task::new(read_id.clone(), TaskType::ReadValue)
                .with_payload(stage_payload(change, Some(attempt)))
                .with_dependencies(vec![test_id]),
        )?;
        if graph.contains(FIND_CULPRIT_TASK) {
            graph.add_dependency(FIND_CULPRIT_TASK, &read_id)?;
        }
        added += 1;
    }
    Ok(added)
}

/// Number of attempts already in the graph for `change`
pub fn attempt_count(graph: &TaskGraph, change: &Change) -> usize {
    (0..)
        .take_while(|&attempt| graph.contains(&read_value_id(change, attempt)))
        .count()
}

/// Build the initial graph: a find-culprit task over `changes`, each with
/// `attempts` attempts.
pub fn build_graph(
    changes: &[Change],
    attempts: usize,
    mode: ComparisonMode,
) -> Result<TaskGraph, GraphError> {
    let mut payload = Map::new();
    payload.insert("comparison_mode".to_string(), json!(mode));
    payload.insert("changes".to_string(), json!(changes));
    payload.insert("culprits".to_string(), json!([]));
    payload.insert("failed_pairs".to_string(), json!([]));
    payload.insert("errors".to_string(), json!([]));

    let mut graph = TaskGraph::new();
    graph.add_task(Task::new(FIND_CULPRIT_TASK, TaskType::FindCulprit).with_payload(payload))?;
    for change in changes {
        add_attempts(&mut graph, change, 0, attempts)?;
    }
    Ok(graph)
}

/// Handlers for tasks that are still active
fn active_task_handlers(settings: &BisectionSettings, mode: ComparisonMode) -> Filter {
    let handlers = DispatchByTaskType::by_task_type()
        .on(TaskType::FindIsolate, ExecutionEvaluator)
        .on(TaskType::RunTest, ExecutionEvaluator)
        .on(TaskType::ReadValue, ExecutionEvaluator)
        .on(TaskType::FindCulprit, FindCulpritEvaluator::new(settings, mode));

    Filter::new(
        All(vec![
            Box::new(TaskIsEventTarget),
            Box::new(Not(Box::new(TaskStatusIn(vec![
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ])))),
        ]),
        handlers,
    )
}

/// The evaluator a bisection job runs for `initiate` and `update` events.
///
/// Every task's payload and status is lifted into the accumulator first, so
/// each handler sees the state of its dependencies.
pub fn job_evaluator(settings: &BisectionSettings, mode: ComparisonMode) -> Sequence {
    Sequence(vec![
        Box::new(PayloadLifter::new().exclude_keys(vec!["execution".to_string()])),
        Box::new(
            DispatchByEventType::by_event_type()
                .on(EventType::Initiate, active_task_handlers(settings, mode))
                .on(EventType::Update, active_task_handlers(settings, mode)),
        ),
    ])
}
