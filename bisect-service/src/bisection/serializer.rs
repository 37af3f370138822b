// State Serializer
// Renders the task graph of a bisection job as per-change attempt state

use super::pipeline::{attempt_count, Attempt, FIND_CULPRIT_TASK};
use crate::change::Change;
use crate::task::{traverse, Accumulator, Event, EventType, Selector, TaskGraph};

use serde_json::{json, Value};

/// Placeholder for a task whose execution has not started
fn not_started() -> Value {
    json!({"completed": false, "exception": null, "details": []})
}

fn execution_of(accumulator: &Accumulator, task_id: &str) -> Value {
    accumulator
        .get(task_id)
        .and_then(|entry| entry.get("execution"))
        .cloned()
        .unwrap_or_else(not_started)
}

/// Per-change state of the search space, in bisection order.
///
/// Each entry holds the change, its attempts with the execution of every
/// stage, the comparisons with its neighbours and the values read so far.
pub fn serialize_state(graph: &TaskGraph) -> Vec<Value> {
    let selector = Selector::new().event_type(EventType::Serialize);
    let (accumulator, _) = traverse(graph, &Event::serialize(), &selector);

    let Some(find_culprit) = accumulator.get(FIND_CULPRIT_TASK) else {
        return Vec::new();
    };
    let changes: Vec<Change> = find_culprit
        .get("changes")
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default();

    changes
        .iter()
        .enumerate()
        .map(|(index, change)| {
            let attempts: Vec<Value> = (0..attempt_count(graph, change))
                .map(|n| {
                    let executions: Vec<Value> = Attempt::new(change.clone(), n)
                        .task_ids()
                        .iter()
                        .map(|id| execution_of(&accumulator, id))
                        .collect();
                    json!({ "executions": executions })
                })
                .collect();

            let comparisons = find_culprit
                .get("comparisons")
                .and_then(|c| c.get(index))
                .cloned()
                .unwrap_or_else(|| json!({"prev": null, "next": null}));
            let result_values = find_culprit
                .get("result_values")
                .and_then(|v| v.get(index))
                .cloned()
                .unwrap_or_else(|| json!([]));

            json!({
                "change": change,
                "attempts": attempts,
                "comparisons": comparisons,
                "result_values": result_values,
            })
        })
        .collect()
}
