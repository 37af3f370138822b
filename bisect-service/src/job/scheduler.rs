// Job Scheduler
// Per-configuration FIFO queues with priorities and queue-time statistics

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Queue-time samples older than this are dropped
const SAMPLE_MAX_AGE_DAYS: i64 = 7;

/// Most queue-time samples kept per configuration
const SAMPLE_MAX_COUNT: usize = 50;

/// Done or cancelled elements are dropped this long after they stop
const STOPPED_MAX_AGE_DAYS: i64 = 7;

/// Most done or cancelled elements kept per configuration
const STOPPED_MAX_COUNT: usize = 50;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),
}

/// Status of a job inside its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Running,
    Cancelled,
    Done,
}

#[derive(Debug, Clone)]
struct QueueElement {
    job_id: String,
    status: QueueStatus,
    priority: i32,
    timestamp: DateTime<Utc>,
    /// Jobs ahead of this one when it was queued
    queue_len: usize,
    sequence: u64,
    /// When the element became done or cancelled
    stopped: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ConfigurationQueue {
    jobs: Vec<QueueElement>,
    /// (pick time, hours waited, queue length at enqueue time)
    samples: Vec<(DateTime<Utc>, f64, usize)>,
}

impl ConfigurationQueue {
    fn count(&self, status: QueueStatus) -> usize {
        self.jobs.iter().filter(|e| e.status == status).count()
    }

    fn record_sample(&mut self, waited_hours: f64, queue_len: usize, now: DateTime<Utc>) {
        self.samples.push((now, waited_hours, queue_len));
        let cutoff = now - Duration::days(SAMPLE_MAX_AGE_DAYS);
        self.samples.retain(|(picked, _, _)| *picked >= cutoff);
        if self.samples.len() > SAMPLE_MAX_COUNT {
            let excess = self.samples.len() - SAMPLE_MAX_COUNT;
            self.samples.drain(..excess);
        }
    }

    /// Drop old done and cancelled elements, keeping the newest ones
    fn prune_stopped(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(STOPPED_MAX_AGE_DAYS);
        self.jobs
            .retain(|e| !matches!(e.stopped, Some(stopped) if stopped < cutoff));

        let mut stopped: Vec<(DateTime<Utc>, u64)> = self
            .jobs
            .iter()
            .filter_map(|e| e.stopped.map(|at| (at, e.sequence)))
            .collect();
        if stopped.len() <= STOPPED_MAX_COUNT {
            return;
        }
        stopped.sort();
        let excess = stopped.len() - STOPPED_MAX_COUNT;
        let dropped: Vec<u64> = stopped[..excess].iter().map(|&(_, seq)| seq).collect();
        self.jobs.retain(|e| !dropped.contains(&e.sequence));
    }
}

/// Queue statistics for one configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub cancelled_jobs: usize,
    pub queue_time_samples: Vec<(f64, usize)>,
    pub job_id_with_status: Vec<(String, QueueStatus)>,
}

/// Queues of jobs waiting for their configuration's bots.
///
/// Lower priority values run first; equal priorities run in submission order.
#[derive(Debug, Default)]
pub struct Scheduler {
    queues: Mutex<HashMap<String, ConfigurationQueue>>,
    sequence: Mutex<u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job to the queue of `configuration`
    pub fn schedule(&self, configuration: &str, job_id: &str, priority: i32) {
        let sequence = {
            let mut next = self.sequence.lock();
            *next += 1;
            *next
        };
        let mut queues = self.queues.lock();
        let queue = queues.entry(configuration.to_string()).or_default();
        let queue_len = queue.count(QueueStatus::Queued);
        queue.jobs.push(QueueElement {
            job_id: job_id.to_string(),
            status: QueueStatus::Queued,
            priority,
            timestamp: Utc::now(),
            queue_len,
            sequence,
            stopped: None,
        });
        queue.prune_stopped(Utc::now());
        debug!(configuration, job_id, priority, queue_len, "job scheduled");
    }

    /// Mark the next queued job of `configuration` as running and return it
    pub fn pick_job(&self, configuration: &str) -> Option<(String, QueueStatus)> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(configuration)?;

        let index = queue
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == QueueStatus::Queued)
            .min_by_key(|(_, e)| (e.priority, e.sequence))
            .map(|(index, _)| index)?;

        let now = Utc::now();
        let element = &mut queue.jobs[index];
        element.status = QueueStatus::Running;
        let waited_hours = (now - element.timestamp).num_milliseconds() as f64 / 3_600_000.0;
        let queue_len = element.queue_len;
        let job_id = element.job_id.clone();

        queue.record_sample(waited_hours, queue_len, now);
        debug!(configuration, job_id = %job_id, waited_hours, "job picked");
        Some((job_id, QueueStatus::Queued))
    }

    fn set_status(&self, job_id: &str, from: &[QueueStatus], to: QueueStatus) -> bool {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            if let Some(element) = queue
                .jobs
                .iter_mut()
                .find(|e| e.job_id == job_id && from.contains(&e.status))
            {
                element.status = to;
                if matches!(to, QueueStatus::Done | QueueStatus::Cancelled) {
                    element.stopped = Some(now);
                    queue.prune_stopped(now);
                }
                return true;
            }
        }
        false
    }

    /// Mark a running job as done
    pub fn complete(&self, job_id: &str) -> bool {
        self.set_status(job_id, &[QueueStatus::Running], QueueStatus::Done)
    }

    /// Cancel a queued or running job. Returns whether the job was found active.
    pub fn cancel(&self, job_id: &str) -> bool {
        self.set_status(
            job_id,
            &[QueueStatus::Queued, QueueStatus::Running],
            QueueStatus::Cancelled,
        )
    }

    /// Drop a job from every queue
    pub fn remove(&self, job_id: &str) {
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            queue.jobs.retain(|e| e.job_id != job_id);
        }
    }

    /// Whether the job is neither queued nor running. Unknown jobs are stopped.
    pub fn is_stopped(&self, job_id: &str) -> bool {
        let queues = self.queues.lock();
        !queues.values().any(|queue| {
            queue.jobs.iter().any(|e| {
                e.job_id == job_id
                    && matches!(e.status, QueueStatus::Queued | QueueStatus::Running)
            })
        })
    }

    pub fn all_configurations(&self) -> Vec<String> {
        let mut configurations: Vec<String> = self.queues.lock().keys().cloned().collect();
        configurations.sort();
        configurations
    }

    /// Number of running jobs in `configuration`
    pub fn running_count(&self, configuration: &str) -> usize {
        self.queues
            .lock()
            .get(configuration)
            .map(|queue| queue.count(QueueStatus::Running))
            .unwrap_or(0)
    }

    pub fn queue_stats(&self, configuration: &str) -> Result<QueueStats, SchedulerError> {
        let queues = self.queues.lock();
        let queue = queues
            .get(configuration)
            .ok_or_else(|| SchedulerError::QueueNotFound(configuration.to_string()))?;
        Ok(QueueStats {
            queued_jobs: queue.count(QueueStatus::Queued),
            running_jobs: queue.count(QueueStatus::Running),
            cancelled_jobs: queue.count(QueueStatus::Cancelled),
            queue_time_samples: queue
                .samples
                .iter()
                .map(|&(_, waited, queue_len)| (waited, queue_len))
                .collect(),
            job_id_with_status: queue
                .jobs
                .iter()
                .map(|e| (e.job_id.clone(), e.status))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_in_submission_order() {
        let scheduler = Scheduler::new();
        scheduler.schedule("linux", "a", 0);
        scheduler.schedule("linux", "b", 0);

        assert_eq!(
            scheduler.pick_job("linux"),
            Some(("a".to_string(), QueueStatus::Queued))
        );
        assert_eq!(
            scheduler.pick_job("linux"),
            Some(("b".to_string(), QueueStatus::Queued))
        );
        assert_eq!(scheduler.pick_job("linux"), None);
        assert_eq!(scheduler.pick_job("mac"), None);
        assert_eq!(scheduler.running_count("linux"), 2);
    }

    #[test]
    fn test_priority_order() {
        let scheduler = Scheduler::new();
        scheduler.schedule("linux", "low", 5);
        scheduler.schedule("linux", "high", -1);
        scheduler.schedule("linux", "normal", 0);

        let order: Vec<String> = (0..3)
            .filter_map(|_| scheduler.pick_job("linux"))
            .map(|(id, _)| id)
            .collect();
        assert_eq!(order, vec!["high", "normal", "low"]);
    }

    #[test]
    fn test_cancelled_jobs_are_not_picked() {
        let scheduler = Scheduler::new();
        scheduler.schedule("linux", "a", 0);
        scheduler.schedule("linux", "b", 0);

        assert!(scheduler.cancel("a"));
        assert!(!scheduler.cancel("a"));
        assert_eq!(scheduler.pick_job("linux").map(|(id, _)| id), Some("b".to_string()));
    }

    #[test]
    fn test_queue_stats() {
        let scheduler = Scheduler::new();
        scheduler.schedule("linux", "a", 0);
        scheduler.schedule("linux", "b", 0);
        scheduler.schedule("linux", "c", 0);
        scheduler.pick_job("linux");
        scheduler.cancel("c");

        let stats = scheduler.queue_stats("linux").unwrap();
        assert_eq!(stats.queued_jobs, 1);
        assert_eq!(stats.running_jobs, 1);
        assert_eq!(stats.cancelled_jobs, 1);
        assert_eq!(stats.queue_time_samples.len(), 1);
        assert_eq!(stats.queue_time_samples[0].1, 0);
        assert_eq!(
            stats.job_id_with_status,
            vec![
                ("a".to_string(), QueueStatus::Running),
                ("b".to_string(), QueueStatus::Queued),
                ("c".to_string(), QueueStatus::Cancelled),
            ]
        );

        assert_eq!(
            scheduler.queue_stats("mac"),
            Err(SchedulerError::QueueNotFound("mac".to_string()))
        );
    }

    #[test]
    fn test_is_stopped() {
        let scheduler = Scheduler::new();
        assert!(scheduler.is_stopped("unknown"));

        scheduler.schedule("linux", "a", 0);
        assert!(!scheduler.is_stopped("a"));
        scheduler.pick_job("linux");
        assert!(!scheduler.is_stopped("a"));
        assert!(scheduler.complete("a"));
        assert!(scheduler.is_stopped("a"));

        scheduler.remove("a");
        assert!(scheduler.queue_stats("linux").unwrap().job_id_with_status.is_empty());
        assert_eq!(scheduler.all_configurations(), vec!["linux"]);
    }

    #[test]
    fn test_samples_are_capped() {
        let scheduler = Scheduler::new();
        for i in 0..(SAMPLE_MAX_COUNT + 5) {
            scheduler.schedule("linux", &format!("job-{}", i), 0);
            scheduler.pick_job("linux");
        }
        let stats = scheduler.queue_stats("linux").unwrap();
        assert_eq!(stats.queue_time_samples.len(), SAMPLE_MAX_COUNT);
    }

    #[test]
    fn test_stopped_jobs_are_pruned() {
        let scheduler = Scheduler::new();
        for i in 0..(STOPPED_MAX_COUNT + 5) {
            let job_id = format!("job-{}", i);
            scheduler.schedule("linux", &job_id, 0);
            scheduler.pick_job("linux");
            assert!(scheduler.complete(&job_id));
        }
        scheduler.schedule("linux", "waiting", 0);

        let stats = scheduler.queue_stats("linux").unwrap();
        assert_eq!(stats.job_id_with_status.len(), STOPPED_MAX_COUNT + 1);
        assert_eq!(stats.job_id_with_status[0].0, "job-5");
        assert_eq!(stats.queued_jobs, 1);

        // A week later only the active element is left
        let mut queues = scheduler.queues.lock();
        let queue = queues.get_mut("linux").unwrap();
        queue.prune_stopped(Utc::now() + Duration::days(STOPPED_MAX_AGE_DAYS + 1));
        let remaining: Vec<&str> = queue.jobs.iter().map(|e| e.job_id.as_str()).collect();
        assert_eq!(remaining, vec!["waiting"]);
    }
}
