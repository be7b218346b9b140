use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::auth::Owner;
use crate::error::{Result, WorkerError};
use crate::job::{Job, JobId};

/// Jobs grouped by the identity that started them.
///
/// Every lookup is scoped to one owner's bucket, so a job id belonging to
/// someone else resolves exactly like an id that was never issued.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Owner, OwnerJobs>>,
}

#[derive(Debug, Default)]
struct OwnerJobs {
    ordered: Vec<Arc<Job>>,
    by_id: HashMap<JobId, Arc<Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` under its owner.
    pub async fn add_job(&self, job: Arc<Job>) {
        let mut jobs = self.jobs.write().await;
        let bucket = jobs.entry(job.owner().clone()).or_default();
        bucket.by_id.insert(job.id(), Arc::clone(&job));
        bucket.ordered.push(job);
    }

    /// Resolve `id` within `owner`'s jobs only.
    pub async fn find_job(&self, owner: &Owner, id: &JobId) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .await
            .get(owner)
            .and_then(|bucket| bucket.by_id.get(id))
            .cloned()
            .ok_or_else(|| WorkerError::JobNotFound(id.to_string()))
    }

    /// `owner`'s jobs in the order they were added.
    pub async fn jobs_for_owner(&self, owner: &Owner) -> Vec<Arc<Job>> {
        self.jobs
            .read()
            .await
            .get(owner)
            .map(|bucket| bucket.ordered.clone())
            .unwrap_or_default()
    }

    /// Stop every running job. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let running: Vec<Arc<Job>> = self
            .jobs
            .read()
            .await
            .values()
            .flat_map(|bucket| bucket.ordered.iter())
            .filter(|job| job.is_running())
            .cloned()
            .collect();

        running.iter().filter(|job| job.stop()).count()
    }

    /// Total number of jobs across all owners.
    pub async fn len(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .map(|bucket| bucket.ordered.len())
            .sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
