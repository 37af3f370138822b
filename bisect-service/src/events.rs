// Engine Events
// Progress reporting for jobs driven by the engine

use crate::job::JobStatus;
use crate::task::TaskStatus;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for engine progress events
pub type ProgressSender = mpsc::UnboundedSender<EngineEvent>;

/// Receiver for engine progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while jobs are scheduled and evaluated
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Job accepted and placed in its configuration queue
    JobQueued {
        job_id: String,
        configuration: String,
    },

    /// Job picked from its queue and its task graph built
    JobStarted { job_id: String, changes: usize },

    /// A task changed status
    TaskUpdated {
        job_id: String,
        task_id: String,
        status: TaskStatus,
    },

    /// A midpoint change was inserted into the search space
    ChangeAdded {
        job_id: String,
        change: String,
        before: String,
        after: String,
    },

    /// Adjacent changes differ; `culprit` is the earlier one
    CulpritFound {
        job_id: String,
        culprit: String,
        next: String,
    },

    /// Job reached a terminal status
    JobFinished {
        job_id: String,
        status: JobStatus,
        difference_count: usize,
        duration: Duration,
    },

    /// Job cancelled by a user
    JobCancelled { job_id: String, reason: String },
}

impl EngineEvent {
    pub fn job_queued(job_id: impl Into<String>, configuration: impl Into<String>) -> Self {
        Self::JobQueued {
            job_id: job_id.into(),
            configuration: configuration.into(),
        }
    }

    pub fn job_started(job_id: impl Into<String>, changes: usize) -> Self {
        Self::JobStarted {
            job_id: job_id.into(),
            changes,
        }
    }

    pub fn task_updated(
        job_id: impl Into<String>,
        task_id: impl Into<String>,
        status: TaskStatus,
    ) -> Self {
        Self::TaskUpdated {
            job_id: job_id.into(),
            task_id: task_id.into(),
            status,
        }
    }

    pub fn job_finished(
        job_id: impl Into<String>,
        status: JobStatus,
        difference_count: usize,
        duration: Duration,
    ) -> Self {
        Self::JobFinished {
            job_id: job_id.into(),
            status,
            difference_count,
            duration,
        }
    }

    /// Job the event belongs to
    pub fn job_id(&self) -> &str {
        match self {
            EngineEvent::JobQueued { job_id, .. }
            | EngineEvent::JobStarted { job_id, .. }
            | EngineEvent::TaskUpdated { job_id, .. }
            | EngineEvent::ChangeAdded { job_id, .. }
            | EngineEvent::CulpritFound { job_id, .. }
            | EngineEvent::JobFinished { job_id, .. }
            | EngineEvent::JobCancelled { job_id, .. } => job_id,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: EngineEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: EngineEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: EngineEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(EngineEvent::job_queued("abc", "linux-perf"));
        tx.send_event(EngineEvent::job_started("abc", 2));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, EngineEvent::JobQueued { .. }));

        let event2 = rx.recv().await.unwrap();
        assert_eq!(event2, EngineEvent::job_started("abc", 2));
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(EngineEvent::job_queued("abc", "linux-perf"));

        let none: Option<ProgressSender> = None;
        none.send_event(EngineEvent::job_started("abc", 2));
    }

    #[test]
    fn test_event_job_id() {
        let event = EngineEvent::task_updated("abc", "run_test_x_0", TaskStatus::Failed);
        assert_eq!(event.job_id(), "abc");
        let cancelled = EngineEvent::JobCancelled {
            job_id: "def".into(),
            reason: "not needed".into(),
        };
        assert_eq!(cancelled.job_id(), "def");
    }
}
