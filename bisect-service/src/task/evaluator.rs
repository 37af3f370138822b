// Evaluators
// Composable per-task handlers invoked during a graph traversal

use super::action::Action;
use super::event::{Event, EventType};
use super::graph::{Task, TaskStatus, TaskType};

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Data collected during one traversal, keyed by task id
pub type Accumulator = Map<String, Value>;

/// Handles one task for one event.
///
/// Evaluators never mutate the graph. They record data in the accumulator and
/// return the actions the host should apply; `None` means nothing to do.
pub trait Evaluator: Send + Sync {
    fn evaluate(
        &self,
        task: &Task,
        event: &Event,
        accumulator: &mut Accumulator,
    ) -> Option<Vec<Action>>;
}

impl<F> Evaluator for F
where
    F: Fn(&Task, &Event, &mut Accumulator) -> Option<Vec<Action>> + Send + Sync,
{
    fn evaluate(
        &self,
        task: &Task,
        event: &Event,
        accumulator: &mut Accumulator,
    ) -> Option<Vec<Action>> {
        self(task, event, accumulator)
    }
}

/// Condition on a task, an event and the data collected so far
pub trait Predicate: Send + Sync {
    fn matches(&self, task: &Task, event: &Event, accumulator: &Accumulator) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Task, &Event, &Accumulator) -> bool + Send + Sync,
{
    fn matches(&self, task: &Task, event: &Event, accumulator: &Accumulator) -> bool {
        self(task, event, accumulator)
    }
}

/// Holds when every inner predicate holds
pub struct All(pub Vec<Box<dyn Predicate>>);

impl Predicate for All {
    fn matches(&self, task: &Task, event: &Event, accumulator: &Accumulator) -> bool {
        self.0.iter().all(|p| p.matches(task, event, accumulator))
    }
}

pub struct Not(pub Box<dyn Predicate>);

impl Predicate for Not {
    fn matches(&self, task: &Task, event: &Event, accumulator: &Accumulator) -> bool {
        !self.0.matches(task, event, accumulator)
    }
}

pub struct TaskTypeEq(pub TaskType);

impl Predicate for TaskTypeEq {
    fn matches(&self, task: &Task, _: &Event, _: &Accumulator) -> bool {
        task.task_type == self.0
    }
}

pub struct TaskStatusIn(pub Vec<TaskStatus>);

impl Predicate for TaskStatusIn {
    fn matches(&self, task: &Task, _: &Event, _: &Accumulator) -> bool {
        self.0.contains(&task.status)
    }
}

/// Holds for the event's target task, or for every task when untargeted
pub struct TaskIsEventTarget;

impl Predicate for TaskIsEventTarget {
    fn matches(&self, task: &Task, event: &Event, _: &Accumulator) -> bool {
        event
            .target_task
            .as_deref()
            .map_or(true, |target| target == task.id)
    }
}

/// Does nothing
pub struct NoOp;

impl Evaluator for NoOp {
    fn evaluate(&self, _: &Task, _: &Event, _: &mut Accumulator) -> Option<Vec<Action>> {
        None
    }
}

/// Runs every evaluator in order and concatenates their actions
pub struct Sequence(pub Vec<Box<dyn Evaluator>>);

impl Evaluator for Sequence {
    fn evaluate(
        &self,
        task: &Task,
        event: &Event,
        accumulator: &mut Accumulator,
    ) -> Option<Vec<Action>> {
        let mut actions = Vec::new();
        let mut produced = false;
        for evaluator in &self.0 {
            if let Some(more) = evaluator.evaluate(task, event, accumulator) {
                produced = true;
                actions.extend(more);
            }
        }
        produced.then_some(actions)
    }
}

/// Delegates when the predicate holds, otherwise runs the alternative
pub struct Filter {
    predicate: Box<dyn Predicate>,
    delegate: Box<dyn Evaluator>,
    alternative: Box<dyn Evaluator>,
}

impl Filter {
    pub fn new(predicate: impl Predicate + 'static, delegate: impl Evaluator + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
            delegate: Box::new(delegate),
            alternative: Box::new(NoOp),
        }
    }

    pub fn with_alternative(mut self, alternative: impl Evaluator + 'static) -> Self {
        self.alternative = Box::new(alternative);
        self
    }
}

impl Evaluator for Filter {
    fn evaluate(
        &self,
        task: &Task,
        event: &Event,
        accumulator: &mut Accumulator,
    ) -> Option<Vec<Action>> {
        if self.predicate.matches(task, event, accumulator) {
            self.delegate.evaluate(task, event, accumulator)
        } else {
            self.alternative.evaluate(task, event, accumulator)
        }
    }
}

/// Registry of handlers keyed by an attribute of the task or event
pub struct Dispatch<K> {
    handlers: HashMap<K, Box<dyn Evaluator>>,
    default: Box<dyn Evaluator>,
    key: fn(&Task, &Event) -> K,
}

impl<K: std::hash::Hash + Eq + Send + Sync> Dispatch<K> {
    fn with_key(key: fn(&Task, &Event) -> K) -> Self {
        Self {
            handlers: HashMap::new(),
            default: Box::new(NoOp),
            key,
        }
    }

    /// Register the handler for one key
    pub fn on(mut self, key: K, handler: impl Evaluator + 'static) -> Self {
        self.handlers.insert(key, Box::new(handler));
        self
    }

    /// Handler used when no key matches
    pub fn with_default(mut self, handler: impl Evaluator + 'static) -> Self {
        self.default = Box::new(handler);
        self
    }
}

impl<K: std::hash::Hash + Eq + Send + Sync> Evaluator for Dispatch<K> {
    fn evaluate(
        &self,
        task: &Task,
        event: &Event,
        accumulator: &mut Accumulator,
    ) -> Option<Vec<Action>> {
        let key = (self.key)(task, event);
        self.handlers
            .get(&key)
            .unwrap_or(&self.default)
            .evaluate(task, event, accumulator)
    }
}

pub type DispatchByEventType = Dispatch<EventType>;
pub type DispatchByTaskStatus = Dispatch<TaskStatus>;
pub type DispatchByTaskType = Dispatch<TaskType>;

impl Dispatch<EventType> {
    pub fn by_event_type() -> Self {
        Self::with_key(|_, event| event.event_type)
    }
}

impl Dispatch<TaskStatus> {
    pub fn by_task_status() -> Self {
        Self::with_key(|task, _| task.status)
    }
}

impl Dispatch<TaskType> {
    pub fn by_task_type() -> Self {
        Self::with_key(|task, _| task.task_type)
    }
}

/// Copy a task's payload (optionally restricted) and status into the accumulator
fn lift_payload(
    task: &Task,
    accumulator: &mut Accumulator,
    keep: impl Fn(&str) -> bool,
) {
    let mut entry: Map<String, Value> = task
        .payload
        .iter()
        .filter(|(key, _)| keep(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    entry.insert("status".to_string(), Value::from(task.status.as_str()));
    accumulator.insert(task.id.clone(), Value::Object(entry));
}

/// Records matching tasks in the accumulator.
///
/// A task matches when any of the configured criteria holds. With no criteria
/// nothing matches.
#[derive(Default)]
pub struct Selector {
    task_type: Option<TaskType>,
    event_type: Option<EventType>,
    predicate: Option<Box<dyn Predicate>>,
    include_keys: Option<Vec<String>>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn predicate(mut self, predicate: impl Predicate + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn include_keys(mut self, keys: Vec<String>) -> Self {
        self.include_keys = Some(keys);
        self
    }

    fn selects(&self, task: &Task, event: &Event, accumulator: &Accumulator) -> bool {
        self.task_type.is_some_and(|t| t == task.task_type)
            || self.event_type.is_some_and(|e| e == event.event_type)
            || self
                .predicate
                .as_ref()
                .is_some_and(|p| p.matches(task, event, accumulator))
    }
}

impl Evaluator for Selector {
    fn evaluate(
        &self,
        task: &Task,
        event: &Event,
        accumulator: &mut Accumulator,
    ) -> Option<Vec<Action>> {
        if self.selects(task, event, accumulator) {
            lift_payload(task, accumulator, |key| {
                self.include_keys
                    .as_ref()
                    .map_or(true, |keys| keys.iter().any(|k| k == key))
            });
        }
        None
    }
}

/// Copies every task's payload and status into the accumulator
#[derive(Debug, Clone, Default)]
pub struct PayloadLifter {
    exclude_keys: Vec<String>,
    exclude_event_types: Vec<EventType>,
}

impl PayloadLifter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_keys(mut self, keys: Vec<String>) -> Self {
        self.exclude_keys = keys;
        self
    }

    pub fn exclude_event_types(mut self, event_types: Vec<EventType>) -> Self {
        self.exclude_event_types = event_types;
        self
    }
}

impl Evaluator for PayloadLifter {
    fn evaluate(
        &self,
        task: &Task,
        event: &Event,
        accumulator: &mut Accumulator,
    ) -> Option<Vec<Action>> {
        if !self.exclude_event_types.contains(&event.event_type) {
            lift_payload(task, accumulator, |key| {
                !self.exclude_keys.iter().any(|k| k == key)
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str, task_type: TaskType, status: TaskStatus) -> Task {
        let mut task = Task::new(id, task_type);
        task.status = status;
        task.payload.insert("change".into(), json!("chromium@abc"));
        task.payload.insert("secret".into(), json!("hidden"));
        task
    }

    fn advance_all(task: &Task, _: &Event, _: &mut Accumulator) -> Option<Vec<Action>> {
        Some(vec![Action::advance(task.id.clone())])
    }

    #[test]
    fn test_sequence_concatenates_actions() {
        let sequence = Sequence(vec![Box::new(advance_all), Box::new(NoOp), Box::new(advance_all)]);
        let mut acc = Accumulator::new();
        let t = task("a", TaskType::RunTest, TaskStatus::Pending);
        let actions = sequence.evaluate(&t, &Event::update(), &mut acc).unwrap();
        assert_eq!(actions.len(), 2);

        let empty = Sequence(vec![Box::new(NoOp)]);
        assert!(empty.evaluate(&t, &Event::update(), &mut acc).is_none());
    }

    #[test]
    fn test_filter_and_predicates() {
        let filter = Filter::new(
            All(vec![
                Box::new(TaskTypeEq(TaskType::RunTest)),
                Box::new(Not(Box::new(TaskStatusIn(vec![
                    TaskStatus::Completed,
                    TaskStatus::Failed,
                ])))),
            ]),
            advance_all,
        )
        .with_alternative(
            |task: &Task, _: &Event, acc: &mut Accumulator| -> Option<Vec<Action>> {
                acc.insert(task.id.clone(), json!("skipped"));
                None
            },
        );

        let mut acc = Accumulator::new();
        let pending = task("a", TaskType::RunTest, TaskStatus::Pending);
        assert!(filter.evaluate(&pending, &Event::update(), &mut acc).is_some());

        let done = task("b", TaskType::RunTest, TaskStatus::Completed);
        assert!(filter.evaluate(&done, &Event::update(), &mut acc).is_none());
        assert_eq!(acc["b"], json!("skipped"));
    }

    #[test]
    fn test_event_target_predicate() {
        let t = task("a", TaskType::ReadValue, TaskStatus::Pending);
        let acc = Accumulator::new();
        assert!(TaskIsEventTarget.matches(&t, &Event::update(), &acc));
        assert!(TaskIsEventTarget.matches(&t, &Event::update().with_target("a"), &acc));
        assert!(!TaskIsEventTarget.matches(&t, &Event::update().with_target("b"), &acc));
    }

    #[test]
    fn test_dispatch_by_task_type_with_default() {
        let dispatch = DispatchByTaskType::by_task_type()
            .on(TaskType::FindCulprit, advance_all)
            .with_default(
                |_: &Task, _: &Event, _: &mut Accumulator| -> Option<Vec<Action>> {
                    Some(Vec::new())
                },
            );

        let mut acc = Accumulator::new();
        let culprit = task("fc", TaskType::FindCulprit, TaskStatus::Pending);
        assert_eq!(
            dispatch.evaluate(&culprit, &Event::update(), &mut acc),
            Some(vec![Action::advance("fc")])
        );
        let other = task("rv", TaskType::ReadValue, TaskStatus::Pending);
        assert_eq!(dispatch.evaluate(&other, &Event::update(), &mut acc), Some(Vec::new()));
    }

    #[test]
    fn test_dispatch_by_event_type_and_status() {
        let by_event = DispatchByEventType::by_event_type().on(EventType::Initiate, advance_all);
        let by_status = DispatchByTaskStatus::by_task_status().on(TaskStatus::Ongoing, advance_all);

        let mut acc = Accumulator::new();
        let t = task("a", TaskType::RunTest, TaskStatus::Pending);
        assert!(by_event.evaluate(&t, &Event::initiate(), &mut acc).is_some());
        assert!(by_event.evaluate(&t, &Event::update(), &mut acc).is_none());
        assert!(by_status.evaluate(&t, &Event::update(), &mut acc).is_none());
    }

    #[test]
    fn test_selector_or_criteria_and_include_keys() {
        let selector = Selector::new()
            .task_type(TaskType::ReadValue)
            .event_type(EventType::Select)
            .include_keys(vec!["change".into()]);

        let mut acc = Accumulator::new();
        let read = task("rv", TaskType::ReadValue, TaskStatus::Completed);
        assert!(selector.evaluate(&read, &Event::update(), &mut acc).is_none());
        assert_eq!(acc["rv"], json!({"change": "chromium@abc", "status": "completed"}));

        let build = task("fi", TaskType::FindIsolate, TaskStatus::Pending);
        selector.evaluate(&build, &Event::update(), &mut acc);
        assert!(!acc.contains_key("fi"));
        selector.evaluate(&build, &Event::select(), &mut acc);
        assert!(acc.contains_key("fi"));

        let nothing = Selector::new();
        let mut acc = Accumulator::new();
        nothing.evaluate(&read, &Event::select(), &mut acc);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_payload_lifter_exclusions() {
        let lifter = PayloadLifter::new()
            .exclude_keys(vec!["secret".into()])
            .exclude_event_types(vec![EventType::Serialize]);

        let mut acc = Accumulator::new();
        let t = task("a", TaskType::RunTest, TaskStatus::Ongoing);
        lifter.evaluate(&t, &Event::update(), &mut acc);
        assert_eq!(acc["a"], json!({"change": "chromium@abc", "status": "ongoing"}));

        let mut acc = Accumulator::new();
        lifter.evaluate(&t, &Event::serialize(), &mut acc);
        assert!(acc.is_empty());
    }
}
