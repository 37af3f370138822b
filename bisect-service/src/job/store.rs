// Job Store
// In-memory registry of jobs shared between the engine and request handlers

use super::Job;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A job guarded for use across engine ticks and handlers
pub type SharedJob = Arc<Mutex<Job>>;

#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<String, SharedJob>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job, replacing any job with the same id
    pub async fn insert(&self, job: Job) -> SharedJob {
        let id = job.id.clone();
        let shared = Arc::new(Mutex::new(job));
        self.jobs.write().await.insert(id, shared.clone());
        shared
    }

    pub async fn get(&self, job_id: &str) -> Option<SharedJob> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn remove(&self, job_id: &str) -> Option<SharedJob> {
        self.jobs.write().await.remove(job_id)
    }

    /// Ids of all stored jobs, sorted
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Run `f` on a job while holding its lock
    pub async fn update<F, R>(&self, job_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Job) -> R,
    {
        let job = self.get(job_id).await?;
        let mut job = job.lock().await;
        Some(f(&mut job))
    }
}
