// Task Graph
// Arena of tasks and their dependencies, validated as a directed acyclic graph

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to an unknown task
    UnknownDependency,
    /// A task with the same id already exists
    DuplicateTask,
    /// Status change that would move a task backwards
    InvalidTransition,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::CyclicDependency,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
        }
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::DuplicateTask,
        }
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidTransition,
        }
    }
}

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FindIsolate,
    RunTest,
    ReadValue,
    FindCulprit,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::FindIsolate => "find_isolate",
            TaskType::RunTest => "run_test",
            TaskType::ReadValue => "read_value",
            TaskType::FindCulprit => "find_culprit",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ongoing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` keeps the status monotonic
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (a, b) if *a == b => true,
            (TaskStatus::Pending, _) => true,
            (TaskStatus::Ongoing, next) => next != TaskStatus::Pending,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ongoing => "ongoing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node of the task graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            task_type,
            payload: Map::new(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Tasks stored in insertion order with an id index
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    indices: HashMap<String, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from tasks in any order, then validate it
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for task in tasks {
            if graph.indices.contains_key(&task.id) {
                return Err(GraphError::duplicate(format!("duplicate task '{}'", task.id)));
            }
            graph.indices.insert(task.id.clone(), graph.tasks.len());
            graph.tasks.push(task);
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Add a task whose dependencies already exist
    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        if self.indices.contains_key(&task.id) {
            return Err(GraphError::duplicate(format!("duplicate task '{}'", task.id)));
        }
        for dep in &task.dependencies {
            if !self.indices.contains_key(dep) {
                return Err(GraphError::unknown_dependency(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.id, dep
                )));
            }
        }
        self.indices.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    /// Add an edge `task_id -> dependency`, rejecting edges that close a cycle
    pub fn add_dependency(&mut self, task_id: &str, dependency: &str) -> Result<bool, GraphError> {
        if !self.indices.contains_key(dependency) {
            return Err(GraphError::unknown_dependency(format!(
                "task '{}' depends on unknown task '{}'",
                task_id, dependency
            )));
        }
        let index = self.index(task_id)?;
        if self.tasks[index].dependencies.iter().any(|d| d == dependency) {
            return Ok(false);
        }
        if task_id == dependency || self.reaches(dependency, task_id) {
            return Err(GraphError::cyclic(format!(
                "circular dependency detected: {} -> {}",
                task_id, dependency
            )));
        }
        self.tasks[index].dependencies.push(dependency.to_string());
        Ok(true)
    }

    /// Whether `to` is reachable from `from` along dependency edges
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(task) = self.get(id) {
                stack.extend(task.dependencies.iter().map(String::as_str));
            }
        }
        false
    }

    fn index(&self, id: &str) -> Result<usize, GraphError> {
        self.indices
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::unknown_dependency(format!("unknown task '{}'", id)))
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.indices.get(id).map(|&idx| &self.tasks[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.indices.contains_key(id)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Move a task to `status`. Returns whether the status changed.
    pub fn update_status(&mut self, id: &str, status: TaskStatus) -> Result<bool, GraphError> {
        let index = self.index(id)?;
        let task = &mut self.tasks[index];
        if !task.status.can_transition_to(status) {
            return Err(GraphError::invalid_transition(format!(
                "task '{}' cannot move from {} to {}",
                id, task.status, status
            )));
        }
        let changed = task.status != status;
        task.status = status;
        Ok(changed)
    }

    /// Merge keys into a task's payload. Returns whether any value changed.
    pub fn merge_payload(&mut self, id: &str, payload: Map<String, Value>) -> Result<bool, GraphError> {
        let index = self.index(id)?;
        let task = &mut self.tasks[index];
        let mut changed = false;
        for (key, value) in payload {
            if task.payload.get(&key) != Some(&value) {
                task.payload.insert(key, value);
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Ids of tasks that depend on `id`
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.dependencies.iter().any(|d| d == id))
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Tasks no other task depends on, in insertion order
    pub fn terminal_tasks(&self) -> Vec<&Task> {
        let depended: HashSet<&str> = self
            .tasks
            .iter()
            .flat_map(|t| t.dependencies.iter().map(String::as_str))
            .collect();
        self.tasks
            .iter()
            .filter(|t| !depended.contains(t.id.as_str()))
            .collect()
    }

    /// Validate the graph structure
    pub fn validate(&self) -> Result<(), GraphError> {
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !self.indices.contains_key(dep) {
                    return Err(GraphError::unknown_dependency(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
            }
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        for task in &self.tasks {
            if !visited.contains(task.id.as_str()) {
                if let Some(cycle) = self.dfs_cycle(task, &mut visited, &mut rec_stack) {
                    return Err(GraphError::cyclic(format!(
                        "circular dependency detected: {}",
                        cycle.join(" -> ")
                    )));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a Task,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        let name = node.id.as_str();
        visited.insert(name);
        rec_stack.insert(name);

        for dep in &node.dependencies {
            if !visited.contains(dep.as_str()) {
                if let Some(task) = self.get(dep) {
                    if let Some(mut cycle) = self.dfs_cycle(task, visited, rec_stack) {
                        cycle.insert(0, name.to_string());
                        return Some(cycle);
                    }
                }
            } else if rec_stack.contains(dep.as_str()) {
                return Some(vec![name.to_string(), dep.clone()]);
            }
        }

        rec_stack.remove(name);
        None
    }

    /// Tasks in topological order, dependencies first
    pub fn topological_order(&self) -> Vec<&Task> {
        // Kahn's algorithm for topological sort
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut adj_list: HashMap<&str, Vec<&str>> = HashMap::new();

        for task in &self.tasks {
            in_degree.entry(task.id.as_str()).or_insert(0);
            for dep in &task.dependencies {
                adj_list.entry(dep.as_str()).or_default().push(task.id.as_str());
                *in_degree.entry(task.id.as_str()).or_insert(0) += 1;
            }
        }

        // Seed in insertion order so the result is deterministic
        let mut queue: VecDeque<&str> = self
            .tasks
            .iter()
            .map(|t| t.id.as_str())
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();

        let mut result = Vec::new();
        while let Some(id) = queue.pop_front() {
            if let Some(task) = self.get(id) {
                result.push(task);
            }
            if let Some(neighbors) = adj_list.get(id) {
                for &neighbor in neighbors {
                    if let Some(deg) = in_degree.get_mut(neighbor) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(neighbor);
                        }
                    }
                }
            }
        }

        result
    }
}
