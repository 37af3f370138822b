// Task Actions
// Side effects requested by evaluators and applied by the evaluation host

use super::graph::TaskStatus;
use crate::bisection::Exploration;

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Set a task's status and merge keys into its payload
    UpdateTask {
        task_id: String,
        status: Option<TaskStatus>,
        payload: Map<String, Value>,
    },

    /// Drive the task's execution one step
    Advance { task_id: String },

    /// Grow the search space: new changes or extra attempts
    Explore {
        task_id: String,
        exploration: Exploration,
    },
}

impl Action {
    pub fn update_status(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self::UpdateTask {
            task_id: task_id.into(),
            status: Some(status),
            payload: Map::new(),
        }
    }

    pub fn update(
        task_id: impl Into<String>,
        status: Option<TaskStatus>,
        payload: Map<String, Value>,
    ) -> Self {
        Self::UpdateTask {
            task_id: task_id.into(),
            status,
            payload,
        }
    }

    pub fn advance(task_id: impl Into<String>) -> Self {
        Self::Advance {
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Action::UpdateTask { task_id, .. }
            | Action::Advance { task_id }
            | Action::Explore { task_id, .. } => task_id,
        }
    }
}
