// Bisect Service Library
// Core engine for performance regression bisection

pub mod bisection;
pub mod change;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod quest;
pub mod services;
pub mod task;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};

pub use config::{AncillaryFailurePolicy, BisectionSettings, ConfigError, EngineConfig, EngineSettings};
pub use engine::Engine;
pub use events::{progress_channel, EngineEvent, EventSender, ProgressReceiver, ProgressSender};

// Re-export bisection types
pub use bisection::{serialize_state, ComparisonMode};
pub use change::{Change, Commit, Patch};

// Re-export job types
pub use job::{
    cancel_job, Authorizer, CancelError, CancelRequest, Estimate, Job, JobArguments, JobStatus,
    QueueStats, Scheduler, StaticAuthorizer, StatusOptions, TimingRecord, TimingRecords,
    TimingTags,
};

// Re-export backend types
pub use services::{HttpServices, Services, SimulatedBackend};
