// Task Events
// Events delivered to evaluators during a graph traversal

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// First evaluation of a freshly started job
    Initiate,
    /// Recurring evaluation driving executions forward
    Update,
    /// Collect task data without side effects
    Select,
    /// Render task state for reporting
    Serialize,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Initiate => "initiate",
            EventType::Update => "update",
            EventType::Select => "select",
            EventType::Serialize => "serialize",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Task the event is aimed at, or every task when absent
    #[serde(default)]
    pub target_task: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            target_task: None,
            payload: Map::new(),
        }
    }

    pub fn initiate() -> Self {
        Self::new(EventType::Initiate)
    }

    pub fn update() -> Self {
        Self::new(EventType::Update)
    }

    pub fn select() -> Self {
        Self::new(EventType::Select)
    }

    pub fn serialize() -> Self {
        Self::new(EventType::Serialize)
    }

    pub fn with_target(mut self, task_id: impl Into<String>) -> Self {
        self.target_task = Some(task_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }
}
