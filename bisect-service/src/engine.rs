// Bisection Engine
// Schedules jobs per configuration and drives their evaluation on a recurring tick

use crate::config::EngineConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::events::{EngineEvent, EventSender, ProgressSender};
use crate::job::{
    cancel_job, Authorizer, CancelRequest, Estimate, Job, JobArguments, JobStatus, JobStore,
    Scheduler, StaticAuthorizer, StatusOptions, TimingRecord, TimingRecords, TimingTags,
};
use crate::services::Services;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Summary of a job that reached a terminal status during a tick
struct Finished {
    job_id: String,
    status: JobStatus,
    difference_count: usize,
    duration: Duration,
    tags: TimingTags,
}

/// Owner of the job store and scheduler; evaluates running jobs on each tick
pub struct Engine {
    config: EngineConfig,
    services: Services,
    store: JobStore,
    scheduler: Scheduler,
    timings: Mutex<TimingRecords>,
    authorizer: Arc<dyn Authorizer>,
    progress: Option<ProgressSender>,
}

impl Engine {
    pub fn new(config: EngineConfig, services: Services) -> Self {
        Self {
            config,
            services,
            store: JobStore::new(),
            scheduler: Scheduler::new(),
            timings: Mutex::new(TimingRecords::new()),
            authorizer: Arc::new(StaticAuthorizer::new()),
            progress: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Seed the timing history used for estimates
    pub fn with_timings(mut self, timings: TimingRecords) -> Self {
        self.timings = Mutex::new(timings);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Copy of the timing history, including jobs finished by this engine
    pub fn timing_records(&self) -> TimingRecords {
        self.timings.lock().clone()
    }

    pub fn estimate(&self, tags: &TimingTags) -> Option<Estimate> {
        self.timings.lock().estimate(tags)
    }

    /// Create a job and queue it on its configuration. Returns the job id.
    pub async fn submit(&self, arguments: JobArguments) -> ServiceResult<String> {
        let mut job = Job::new(arguments, &self.config)?;
        let job_id = job.id.clone();
        let configuration = job.configuration().to_string();
        let priority = job.arguments.priority;

        job.mark_queued();
        self.store.insert(job).await;
        self.scheduler.schedule(&configuration, &job_id, priority);

        info!(job_id = %job_id, configuration = %configuration, "job queued");
        self.progress
            .send_event(EngineEvent::job_queued(&job_id, &configuration));
        Ok(job_id)
    }

    /// Start queued jobs while their configuration has capacity
    async fn start_queued(&self) {
        let limit = self.config.engine.max_running_per_configuration;
        for configuration in self.scheduler.all_configurations() {
            while self.scheduler.running_count(&configuration) < limit {
                let Some((job_id, _)) = self.scheduler.pick_job(&configuration) else {
                    break;
                };
                let Some(job) = self.store.get(&job_id).await else {
                    warn!(job_id = %job_id, "scheduled job missing from store");
                    self.scheduler.remove(&job_id);
                    continue;
                };

                let mut job = job.lock().await;
                if job.cancelled || job.is_terminal() {
                    debug!(job_id = %job_id, status = %job.status, "skipping stopped job");
                    self.scheduler.remove(&job_id);
                    continue;
                }
                match job.start() {
                    Ok(()) => {
                        self.progress
                            .send_event(EngineEvent::job_started(&job_id, job.changes.len()));
                    }
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to build task graph");
                        job.status = JobStatus::Failed;
                        job.exception = Some(e.to_string());
                        self.scheduler.complete(&job_id);
                    }
                }
            }
        }
    }

    /// Run one evaluation of every running job, concurrently.
    ///
    /// Returns the number of jobs that are not yet terminal.
    pub async fn tick(&self) -> usize {
        self.start_queued().await;

        let mut set = JoinSet::new();
        for job_id in self.store.ids().await {
            let Some(job) = self.store.get(&job_id).await else {
                continue;
            };
            let services = self.services.clone();
            let progress = self.progress.clone();

            set.spawn(async move {
                let mut job = job.lock().await;
                if job.status != JobStatus::Running {
                    return None;
                }
                job.run(&services, &progress).await;
                if !job.is_terminal() {
                    return None;
                }
                Some(Finished {
                    job_id: job.id.clone(),
                    status: job.status,
                    difference_count: job.difference_count.unwrap_or(0),
                    duration: job
                        .duration()
                        .and_then(|d| d.to_std().ok())
                        .unwrap_or_default(),
                    tags: job.timing_tags(),
                })
            });
        }

        while let Some(result) = set.join_next().await {
            match result {
                Ok(Some(finished)) => self.record_finished(finished),
                Ok(None) => {}
                Err(e) => error!(error = %e, "job evaluation panicked"),
            }
        }

        let mut active = 0;
        for job_id in self.store.ids().await {
            if let Some(job) = self.store.get(&job_id).await {
                if !job.lock().await.is_terminal() {
                    active += 1;
                }
            }
        }
        debug!(active, "tick complete");
        active
    }

    fn record_finished(&self, finished: Finished) {
        self.scheduler.complete(&finished.job_id);
        if finished.status == JobStatus::Completed {
            self.timings.lock().record(TimingRecord {
                job_id: finished.job_id.clone(),
                tags: finished.tags,
                duration_secs: finished.duration.as_secs_f64(),
                completed: Utc::now(),
            });
        }
        info!(
            job_id = %finished.job_id,
            status = %finished.status,
            difference_count = finished.difference_count,
            "job finished"
        );
        self.progress.send_event(EngineEvent::job_finished(
            finished.job_id,
            finished.status,
            finished.difference_count,
            finished.duration,
        ));
    }

    /// Tick on an interval until no job is active or `max_ticks` is reached.
    ///
    /// Returns the number of ticks run.
    pub async fn run(&self) -> u64 {
        let period = Duration::from_millis(self.config.engine.tick_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        let mut ticks = 0;
        loop {
            interval.tick().await;
            ticks += 1;
            if self.tick().await == 0 || self.tick_limit_reached(ticks) {
                return ticks;
            }
        }
    }

    /// Tick without sleeping until no job is active or `max_ticks` is reached
    pub async fn run_until_idle(&self) -> u64 {
        let mut ticks = 0;
        loop {
            ticks += 1;
            if self.tick().await == 0 || self.tick_limit_reached(ticks) {
                return ticks;
            }
            tokio::task::yield_now().await;
        }
    }

    fn tick_limit_reached(&self, ticks: u64) -> bool {
        match self.config.engine.max_ticks {
            Some(max) if ticks >= max => {
                warn!(ticks, "tick limit reached with active jobs");
                true
            }
            _ => false,
        }
    }

    /// Handle a user cancellation request; see [`cancel_job`]
    pub async fn cancel(&self, request: &CancelRequest) -> (u16, Value) {
        let (status, body) =
            cancel_job(&self.store, &self.scheduler, self.authorizer.as_ref(), request).await;
        if status == 200 {
            self.progress.send_event(EngineEvent::JobCancelled {
                job_id: request.job_id.clone(),
                reason: request.reason.clone(),
            });
        }
        (status, body)
    }

    /// Job status JSON with the requested optional sections
    pub async fn job_status(&self, job_id: &str, options: StatusOptions) -> ServiceResult<Value> {
        let job = self
            .store
            .get(job_id)
            .await
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?;
        let job = job.lock().await;

        let mut dict = job.as_dict(options);
        if options.estimate && !job.started {
            dict["estimate"] = json!(self.estimate(&job.timing_tags()));
            dict["queue_stats"] = json!(self.scheduler.queue_stats(job.configuration()).ok());
        }
        Ok(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use crate::events::progress_channel;
    use crate::job::SharedJob;
    use crate::services::SimulatedBackend;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.bisection.min_attempts = 4;
        config.engine.max_ticks = Some(200);
        config
    }

    fn arguments(backend: &SimulatedBackend, start: usize, end: usize) -> JobArguments {
        JobArguments {
            configuration: Some("linux-perf".into()),
            repository: backend.repository().to_string(),
            start_git_hash: backend.commit(start).git_hash,
            end_git_hash: backend.commit(end).git_hash,
            builder: "Linux Builder Perf".into(),
            benchmark: Some("speedometer2".into()),
            metric: Some("timeToFirstPaint".into()),
            user: Some("dev@example.com".into()),
            ..Default::default()
        }
    }

    fn backend(length: usize, culprit: usize) -> Arc<SimulatedBackend> {
        Arc::new(
            SimulatedBackend::linear("chromium", length)
                .with_regression(culprit, 1.0, 5.0)
                .with_samples(1)
                .with_build_polls(0)
                .with_test_polls(0),
        )
    }

    async fn job(engine: &Engine, job_id: &str) -> SharedJob {
        engine.store().get(job_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_adjacent_changes_end_to_end() {
        let backend = backend(4, 1);
        let (tx, mut rx) = progress_channel();
        let engine =
            Engine::new(config(), Services::from_backend(backend.clone())).with_progress(tx);

        let job_id = engine.submit(arguments(&backend, 1, 2)).await.unwrap();
        engine.run_until_idle().await;

        let shared = job(&engine, &job_id).await;
        let job = shared.lock().await;
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.exception);
        assert_eq!(job.difference_count, Some(1));
        assert_eq!(job.culprits[0].0, Change::from_commit(backend.commit(1)));

        let state = crate::bisection::serialize_state(job.graph());
        assert_eq!(state[0]["result_values"], json!([1.0, 1.0, 1.0, 1.0]));
        assert_eq!(state[1]["result_values"], json!([5.0, 5.0, 5.0, 5.0]));
        drop(job);

        assert_eq!(engine.timing_records().len(), 1);
        assert!(engine.scheduler().is_stopped(&job_id));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(EngineEvent::JobQueued { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::JobStarted { changes: 2, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::CulpritFound { .. })));
        assert!(matches!(
            events.last(),
            Some(EngineEvent::JobFinished {
                status: JobStatus::Completed,
                difference_count: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_bisects_simulated_history() {
        let backend = backend(33, 20);
        let engine = Engine::new(config(), Services::from_backend(backend.clone()));

        let job_id = engine.submit(arguments(&backend, 0, 32)).await.unwrap();
        engine.run_until_idle().await;

        let shared = job(&engine, &job_id).await;
        let job = shared.lock().await;
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.exception);
        assert_eq!(
            job.culprits,
            vec![(
                Change::from_commit(backend.commit(20)),
                Change::from_commit(backend.commit(21))
            )]
        );
        // Changes stay in history order
        let indices: Vec<usize> = job
            .changes
            .iter()
            .filter_map(|c| c.base_commit().and_then(|commit| backend.index_of(commit)))
            .collect();
        assert!(indices.windows(2).all(|w| w[0] < w[1]), "{:?}", indices);
    }

    #[tokio::test]
    async fn test_one_running_job_per_configuration() {
        let backend = Arc::new(
            SimulatedBackend::linear("chromium", 4)
                .with_build_polls(3)
                .with_test_polls(0),
        );
        let engine = Engine::new(config(), Services::from_backend(backend.clone()));

        let first = engine.submit(arguments(&backend, 0, 3)).await.unwrap();
        let second = engine.submit(arguments(&backend, 0, 3)).await.unwrap();
        assert_eq!(engine.tick().await, 2);

        assert_eq!(job(&engine, &first).await.lock().await.status, JobStatus::Running);
        assert_eq!(job(&engine, &second).await.lock().await.status, JobStatus::Queued);

        engine.run_until_idle().await;
        assert_eq!(job(&engine, &second).await.lock().await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let backend = backend(4, 1);
        let engine = Engine::new(config(), Services::from_backend(backend.clone()));
        let job_id = engine.submit(arguments(&backend, 0, 3)).await.unwrap();

        let request = CancelRequest {
            job_id: job_id.clone(),
            reason: "not needed".into(),
            actor: "dev@example.com".into(),
            user: None,
        };
        assert_eq!(engine.cancel(&request).await, (200, json!({})));
        assert_eq!(engine.tick().await, 0);
        assert_eq!(backend.build_requests(), 0);

        let status = engine.job_status(&job_id, StatusOptions::default()).await.unwrap();
        assert_eq!(status["status"], "Cancelled");
        assert_eq!(status["cancel_reason"], "dev@example.com: not needed");
    }

    #[tokio::test]
    async fn test_job_cancelled_while_queued_stays_cancelled() {
        let backend = backend(4, 1);
        let engine = Engine::new(config(), Services::from_backend(backend.clone()));
        let job_id = engine.submit(arguments(&backend, 0, 3)).await.unwrap();

        // Cancelled in the store without its queue element being updated
        engine
            .store
            .update(&job_id, |job| job.cancel("dev@example.com", "stale").unwrap())
            .await
            .unwrap();

        assert_eq!(engine.tick().await, 0);
        assert_eq!(engine.run_until_idle().await, 1);
        assert_eq!(backend.build_requests(), 0);
        assert!(engine.scheduler.is_stopped(&job_id));

        let status = engine.job_status(&job_id, StatusOptions::default()).await.unwrap();
        assert_eq!(status["status"], "Cancelled");
    }

    #[tokio::test]
    async fn test_status_with_estimate() {
        let backend = backend(4, 1);
        let mut history = TimingRecords::new();
        history.record(TimingRecord {
            job_id: "old".into(),
            tags: TimingTags {
                configuration: Some("linux-perf".into()),
                ..Default::default()
            },
            duration_secs: 1800.0,
            completed: Utc::now(),
        });
        let engine =
            Engine::new(config(), Services::from_backend(backend.clone())).with_timings(history);
        let job_id = engine.submit(arguments(&backend, 0, 3)).await.unwrap();

        let status = engine
            .job_status(
                &job_id,
                StatusOptions {
                    state: false,
                    estimate: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(status["estimate"]["timings"], json!([1800.0]));
        assert_eq!(status["queue_stats"]["queued_jobs"], 1);

        assert!(matches!(
            engine.job_status("missing", StatusOptions::default()).await,
            Err(ServiceError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let backend = backend(4, 1);
        let engine = Engine::new(config(), Services::from_backend(backend.clone()));
        let mut arguments = arguments(&backend, 0, 3);
        arguments.end_git_hash = arguments.start_git_hash.clone();

        assert!(matches!(
            engine.submit(arguments).await,
            Err(ServiceError::Arguments(_))
        ));
        assert!(engine.store().is_empty().await);
    }
}
