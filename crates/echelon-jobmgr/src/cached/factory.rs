//! The process-wide index of cached jobs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use echelon_core::JobId;

use super::job::CachedJob;
use super::RuntimeListener;
use crate::store::Store;

/// Creates and indexes [`CachedJob`] entries.
///
/// Jobs are created by an external job service; the factory learns of them
/// lazily on first reference. [`JobFactory::add_job`] only inserts an empty
/// cache shell and never touches the store; the shell populates itself on
/// first read.
pub struct JobFactory {
    jobs: RwLock<HashMap<JobId, Arc<CachedJob>>>,
    store: Arc<dyn Store>,
    listener: Arc<dyn RuntimeListener>,
}

impl std::fmt::Debug for JobFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let jobs = self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0);
        f.debug_struct("JobFactory")
            .field("jobs", &jobs)
            .finish_non_exhaustive()
    }
}

impl JobFactory {
    /// Creates a factory writing through to `store` and notifying
    /// `listener` on every successful mutation.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, listener: Arc<dyn RuntimeListener>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            store,
            listener,
        }
    }

    /// Gets or inserts the cache entry for a job. Never touches the store.
    #[must_use]
    pub fn add_job(&self, job_id: &JobId) -> Arc<CachedJob> {
        if let Some(job) = self.get_job(job_id) {
            return job;
        }

        let mut jobs = self.jobs.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let job = jobs.entry(job_id.clone()).or_insert_with(|| {
            Arc::new(CachedJob::new(
                job_id.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.listener),
            ))
        });
        Arc::clone(job)
    }

    /// Looks up the cache entry for a job without inserting.
    #[must_use]
    pub fn get_job(&self, job_id: &JobId) -> Option<Arc<CachedJob>> {
        self.jobs
            .read()
            .ok()
            .and_then(|jobs| jobs.get(job_id).cloned())
    }

    /// Evicts a job (and with it, its task entries) from the cache.
    ///
    /// Called by the external untrack path once nothing references the job
    /// anymore; in-flight holders of the `Arc` keep a detached entry.
    pub fn untrack_job(&self, job_id: &JobId) {
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.remove(job_id);
        }
    }

    /// Number of jobs currently resident.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }
}
