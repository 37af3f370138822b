// Job Module
// Bisection jobs: lifecycle, scheduling, cancellation and timing records

pub mod arguments;
pub mod cancel;
mod host;
pub mod scheduler;
pub mod store;
pub mod timing;

// Re-export key types
pub use arguments::{ArgumentsError, JobArguments, DEFAULT_CONFIGURATION};
pub use cancel::{cancel_job, Authorizer, CancelError, CancelRequest, StaticAuthorizer};
pub use scheduler::{QueueStats, QueueStatus, Scheduler, SchedulerError};
pub use store::{JobStore, SharedJob};
pub use timing::{Estimate, TimingRecord, TimingRecords, TimingTags, MAX_ESTIMATE_TIMINGS};

use crate::bisection::stages::payload_errors;
use crate::bisection::{build_graph, job_evaluator, serialize_state, ComparisonMode, FIND_CULPRIT_TASK};
use crate::change::Change;
use crate::config::{AncillaryFailurePolicy, BisectionSettings, EngineConfig};
use crate::events::ProgressSender;
use crate::quest::{new_build_dedup, Execution, Quest};
use crate::services::Services;
use crate::task::{evaluate, Event, GraphError, TaskGraph, TaskStatus, TaskType};
use host::{abort_executions, JobHost};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Created => "Created",
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Optional sections of the job status JSON
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusOptions {
    /// Include the quests and the per-change state of the search space
    #[serde(default)]
    pub state: bool,
    /// Include a run-time estimate and queue statistics for jobs not yet started
    #[serde(default)]
    pub estimate: bool,
}

/// A bisection job: its arguments, task graph and results
pub struct Job {
    pub id: String,
    pub arguments: JobArguments,
    pub status: JobStatus,

    pub created: DateTime<Utc>,
    pub started: bool,
    pub started_time: Option<DateTime<Utc>>,
    pub updated: DateTime<Utc>,
    /// Handle of the evaluation driving this job; set while it runs
    pub task: Option<String>,

    pub cancelled: bool,
    pub cancel_reason: Option<String>,
    pub exception: Option<String>,
    pub difference_count: Option<usize>,

    /// Search space in bisection order
    pub changes: Vec<Change>,
    /// Adjacent pairs whose values differ; the first change is the culprit
    pub culprits: Vec<(Change, Change)>,
    /// Bots that ran tests for this job
    pub bots: Vec<String>,

    settings: BisectionSettings,
    max_passes: usize,
    max_polls: u32,
    quests: Vec<Quest>,
    graph: TaskGraph,
    executions: HashMap<String, Execution>,
    initiated: bool,
}

impl Job {
    /// Create a job from validated arguments
    pub fn new(arguments: JobArguments, config: &EngineConfig) -> Result<Self, ArgumentsError> {
        arguments.validate()?;
        let changes = arguments.changes()?;
        let id = Uuid::new_v4().simple().to_string();
        let quests = arguments.quests(&new_build_dedup(), &id);
        let now = Utc::now();

        Ok(Self {
            id,
            arguments,
            status: JobStatus::Created,
            created: now,
            started: false,
            started_time: None,
            updated: now,
            task: None,
            cancelled: false,
            cancel_reason: None,
            exception: None,
            difference_count: None,
            changes,
            culprits: Vec::new(),
            bots: Vec::new(),
            settings: config.bisection.clone(),
            max_passes: config.engine.max_passes,
            max_polls: config.engine.max_polls,
            quests,
            graph: TaskGraph::new(),
            executions: HashMap::new(),
            initiated: false,
        })
    }

    pub fn configuration(&self) -> &str {
        self.arguments.configuration_name()
    }

    pub fn comparison_mode(&self) -> ComparisonMode {
        self.arguments.comparison_mode
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time from start to the last update
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.started_time.map(|started| self.updated - started)
    }

    /// The job was placed in its scheduler queue
    pub fn mark_queued(&mut self) {
        if self.status == JobStatus::Created {
            self.status = JobStatus::Queued;
            self.updated = Utc::now();
        }
    }

    /// Build the initial task graph and mark the job running.
    ///
    /// The first evaluation happens on the next call to [`Job::run`].
    /// Cancelled or finished jobs stay as they are.
    pub fn start(&mut self) -> Result<(), GraphError> {
        if self.started || self.cancelled || self.is_terminal() {
            return Ok(());
        }
        let attempts = self
            .arguments
            .initial_attempt_count
            .unwrap_or(self.settings.min_attempts);
        self.graph = build_graph(&self.changes, attempts, self.comparison_mode())?;

        let now = Utc::now();
        self.started = true;
        self.started_time = Some(now);
        self.updated = now;
        self.task = Some(Uuid::new_v4().simple().to_string());
        self.status = JobStatus::Running;
        info!(job_id = %self.id, changes = self.changes.len(), attempts, "job started");
        Ok(())
    }

    /// One tick: evaluate the task graph and update the job status.
    ///
    /// Does nothing for cancelled, finished or unstarted jobs.
    pub async fn run(&mut self, services: &Services, progress: &Option<ProgressSender>) {
        if self.cancelled || self.is_terminal() || !self.started {
            return;
        }
        let event = if self.initiated {
            Event::update()
        } else {
            Event::initiate()
        };
        self.initiated = true;

        let evaluator = job_evaluator(&self.settings, self.comparison_mode());
        let mut host = JobHost {
            job_id: &self.id,
            graph: &mut self.graph,
            executions: &mut self.executions,
            quests: &self.quests,
            changes: &mut self.changes,
            culprits: &mut self.culprits,
            bots: &mut self.bots,
            services,
            progress,
            min_attempts: self.settings.min_attempts,
            max_polls: self.max_polls,
        };
        let result = evaluate(&mut host, &event, &evaluator, self.max_passes).await;
        self.updated = Utc::now();

        match result {
            Ok(_) => self.check_completion(),
            Err(e) => {
                error!(job_id = %self.id, error = %e, "evaluation failed");
                self.finish(JobStatus::Failed, Some(e.to_string()));
            }
        }
    }

    fn check_completion(&mut self) {
        let Some(task) = self.graph.get(FIND_CULPRIT_TASK) else {
            return;
        };
        match task.status {
            TaskStatus::Completed => {
                let count = match self.comparison_mode() {
                    ComparisonMode::Performance => self.culprits.len(),
                    ComparisonMode::Try => {
                        let next = task
                            .payload
                            .get("comparisons")
                            .and_then(|c| c.get(0))
                            .and_then(|c| c.get("next"))
                            .and_then(Value::as_str);
                        usize::from(next == Some("different"))
                    }
                };
                self.difference_count = Some(count);
                self.finish(JobStatus::Completed, None);
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                let message = payload_errors(&task.payload)
                    .last()
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Bisection failed")
                    .to_string();
                self.finish(JobStatus::Failed, Some(message));
            }
            TaskStatus::Pending | TaskStatus::Ongoing => {
                if self.settings.ancillary_failures == AncillaryFailurePolicy::FailJob {
                    let failed = self.graph.tasks().iter().find(|t| {
                        t.task_type != TaskType::FindCulprit && t.status == TaskStatus::Failed
                    });
                    if let Some(task) = failed {
                        let message = payload_errors(&task.payload)
                            .first()
                            .and_then(|e| e.get("message"))
                            .and_then(Value::as_str)
                            .map(|m| format!("{}: {}", task.id, m))
                            .unwrap_or_else(|| format!("{} failed", task.id));
                        self.finish(JobStatus::Failed, Some(message));
                    }
                }
            }
        }
    }

    fn finish(&mut self, status: JobStatus, exception: Option<String>) {
        debug!(job_id = %self.id, status = %status, "job finished");
        self.status = status;
        self.exception = exception;
        self.task = None;
        self.updated = Utc::now();
    }

    /// Stop the job. In-flight executions fail and their tasks are cancelled.
    ///
    /// `user` and `reason` are recorded as `"<user>: <reason>"`, after any
    /// earlier reason.
    pub fn cancel(&mut self, user: &str, reason: &str) -> Result<(), CancelError> {
        if self.cancelled {
            return Err(CancelError::AlreadyCancelled(self.id.clone()));
        }
        let entry = format!("{}: {}", user, reason);
        self.cancel_reason = Some(match self.cancel_reason.take() {
            Some(previous) => format!("{}\n{}", previous, entry),
            None => entry,
        });
        self.cancelled = true;
        abort_executions(&self.id, &mut self.graph, &mut self.executions, reason);
        self.status = JobStatus::Cancelled;
        self.task = None;
        self.updated = Utc::now();
        Ok(())
    }

    /// Tags used to find similar jobs for estimates
    pub fn timing_tags(&self) -> TimingTags {
        self.arguments.timing_tags()
    }

    /// Job status JSON
    pub fn as_dict(&self, options: StatusOptions) -> Value {
        let culprits: Vec<Value> = self
            .culprits
            .iter()
            .map(|(culprit, next)| json!({"change": culprit, "next": next}))
            .collect();
        let mut dict = json!({
            "job_id": self.id,
            "configuration": self.arguments.configuration,
            "status": self.status,
            "arguments": self.arguments,
            "comparison_mode": self.comparison_mode(),
            "bug_id": self.arguments.bug_id,
            "user": self.arguments.user,
            "name": self.arguments.name,
            "bots": self.bots,
            "created": self.created,
            "started_time": self.started_time,
            "updated": self.updated,
            "cancel_reason": self.cancel_reason,
            "difference_count": self.difference_count,
            "exception": self.exception,
            "batch_id": self.arguments.batch_id,
            "culprits": culprits,
        });

        if options.state {
            let quests: Vec<String> = self.quests.iter().map(ToString::to_string).collect();
            dict["quests"] = json!(quests);
            dict["state"] = json!(serialize_state(&self.graph));
        }
        dict
    }
}
