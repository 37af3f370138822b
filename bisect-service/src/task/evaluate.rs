// Graph Evaluation
// Post-order traversal of the task graph and the evaluate-apply loop

use super::action::Action;
use super::evaluator::{Accumulator, Evaluator};
use super::event::Event;
use super::graph::{GraphError, TaskGraph};

use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Default limit on traversals per evaluation
pub const DEFAULT_MAX_PASSES: usize = 64;

#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Invalid payload for task {task_id}: {message}")]
    InvalidPayload { task_id: String, message: String },
}

/// Owner of a task graph that applies evaluator actions
#[async_trait::async_trait]
pub trait EvaluationHost: Send {
    fn graph(&self) -> &TaskGraph;

    /// Apply actions in order. Returns whether any task or the graph changed.
    async fn apply(&mut self, actions: Vec<Action>) -> Result<bool, EvaluateError>;
}

/// Visit every task once, dependencies before dependents, starting from the
/// tasks nothing depends on. Returns the accumulator and the collected actions.
pub fn traverse(
    graph: &TaskGraph,
    event: &Event,
    evaluator: &dyn Evaluator,
) -> (Accumulator, Vec<Action>) {
    let mut accumulator = Accumulator::new();
    let mut actions = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();

    for root in graph.terminal_tasks() {
        // Iterative post-order: (task id, dependencies expanded)
        let mut stack: Vec<(&str, bool)> = vec![(root.id.as_str(), false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                if let Some(task) = graph.get(id) {
                    if let Some(produced) = evaluator.evaluate(task, event, &mut accumulator) {
                        actions.extend(produced);
                    }
                }
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            if let Some(task) = graph.get(id) {
                // Reverse so the first dependency is evaluated first
                for dep in task.dependencies.iter().rev() {
                    if !visited.contains(dep.as_str()) {
                        stack.push((dep.as_str(), false));
                    }
                }
            }
        }
    }

    (accumulator, actions)
}

/// Evaluate the graph until it settles.
///
/// Each pass traverses the graph and hands the actions to the host. The loop
/// ends when a pass produces no actions, when applying them changed nothing,
/// or after `max_passes`. `Advance` is applied at most once per task per call.
/// Returns the accumulator of the last traversal.
pub async fn evaluate<H>(
    host: &mut H,
    event: &Event,
    evaluator: &dyn Evaluator,
    max_passes: usize,
) -> Result<Accumulator, EvaluateError>
where
    H: EvaluationHost + ?Sized,
{
    let mut advanced: HashSet<String> = HashSet::new();
    let mut accumulator = Accumulator::new();

    for pass in 0..max_passes.max(1) {
        let (acc, actions) = traverse(host.graph(), event, evaluator);
        accumulator = acc;

        let actions: Vec<Action> = actions
            .into_iter()
            .filter(|action| match action {
                Action::Advance { task_id } => advanced.insert(task_id.clone()),
                _ => true,
            })
            .collect();

        if actions.is_empty() {
            debug!(pass, event = %event.event_type, "evaluation settled");
            break;
        }
        if !host.apply(actions).await? {
            debug!(pass, event = %event.event_type, "no changes applied");
            break;
        }
    }

    Ok(accumulator)
}
