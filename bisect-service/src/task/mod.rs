// Task Module
// Generic task graph, events, actions and evaluators

pub mod action;
pub mod evaluate;
pub mod evaluator;
pub mod event;
pub mod graph;

// Re-export key types
pub use action::Action;
pub use evaluate::{evaluate, traverse, EvaluateError, EvaluationHost, DEFAULT_MAX_PASSES};
pub use evaluator::{
    Accumulator, All, Dispatch, DispatchByEventType, DispatchByTaskStatus, DispatchByTaskType,
    Evaluator, Filter, NoOp, Not, PayloadLifter, Predicate, Selector, Sequence, TaskIsEventTarget,
    TaskStatusIn, TaskTypeEq,
};
pub use event::{Event, EventType};
pub use graph::{GraphError, GraphErrorKind, Task, TaskGraph, TaskStatus, TaskType};
