//! One cached job and its task entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use echelon_core::JobId;

use super::task::CachedTask;
use super::RuntimeListener;
use crate::error::{Error, Result};
use crate::job::{JobConfig, JobRuntime};
use crate::store::Store;
use crate::task::{RuntimeDiff, TaskRuntime};
use crate::watch::JobSummary;

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("cached job lock poisoned")
}

/// A job resident in the cache, sole owner of its task entries.
///
/// Config and runtime populate lazily from the store; task entries are
/// created on first reference and live until the job is untracked.
pub struct CachedJob {
    id: JobId,
    config: Mutex<Option<JobConfig>>,
    runtime: Mutex<Option<JobRuntime>>,
    tasks: RwLock<HashMap<u32, Arc<CachedTask>>>,
    store: Arc<dyn Store>,
    listener: Arc<dyn RuntimeListener>,
}

impl std::fmt::Debug for CachedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedJob")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl CachedJob {
    pub(super) fn new(
        id: JobId,
        store: Arc<dyn Store>,
        listener: Arc<dyn RuntimeListener>,
    ) -> Self {
        Self {
            id,
            config: Mutex::new(None),
            runtime: Mutex::new(None),
            tasks: RwLock::new(HashMap::new()),
            store,
            listener,
        }
    }

    /// The job's identifier.
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Gets the job configuration, populating the cache from the store on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when the job does not exist in the store.
    pub async fn get_config(&self) -> Result<JobConfig> {
        {
            let guard = self.config.lock().map_err(poison_err)?;
            if let Some(config) = guard.as_ref() {
                return Ok(config.clone());
            }
        }

        let config = self.store.get_job_config(&self.id).await?;
        let mut guard = self.config.lock().map_err(poison_err)?;
        *guard = Some(config.clone());
        Ok(config)
    }

    /// Gets the job runtime, populating the cache from the store on first
    /// use.
    pub async fn get_runtime(&self) -> Result<JobRuntime> {
        {
            let guard = self.runtime.lock().map_err(poison_err)?;
            if let Some(runtime) = guard.as_ref() {
                return Ok(runtime.clone());
            }
        }

        let runtime = self.store.get_job_runtime(&self.id).await?;
        let mut guard = self.runtime.lock().map_err(poison_err)?;
        *guard = Some(runtime.clone());
        Ok(runtime)
    }

    /// Writes a job runtime through to the store with compare-and-set.
    ///
    /// On success the cache holds the post-image and the listener is
    /// notified; on a version conflict the cached entry is invalidated so
    /// the next read re-reads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedVersion`] on a CAS conflict.
    pub async fn compare_and_set_runtime(&self, runtime: JobRuntime) -> Result<JobRuntime> {
        let stored = match self.store.cas_job_runtime(&self.id, runtime).await {
            Ok(stored) => stored,
            Err(err) => {
                if let Ok(mut guard) = self.runtime.lock() {
                    *guard = None;
                }
                return Err(err);
            }
        };

        {
            let mut guard = self.runtime.lock().map_err(poison_err)?;
            *guard = Some(stored.clone());
        }

        self.listener.on_job_runtime_changed(JobSummary {
            job_id: self.id.clone(),
            state: stored.state,
            goal_state: stored.goal_state,
        });

        Ok(stored)
    }

    /// Gets or creates the cached entry for one task slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `instance_id` is outside
    /// `[0, instance_count)`.
    pub async fn add_task(&self, instance_id: u32) -> Result<Arc<CachedTask>> {
        if let Some(task) = self.get_task(instance_id) {
            return Ok(task);
        }

        let config = self.get_config().await?;
        if instance_id >= config.instance_count {
            return Err(Error::invalid_argument(format!(
                "instance {instance_id} out of range for job with {} instances",
                config.instance_count
            )));
        }

        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let task = tasks.entry(instance_id).or_insert_with(|| {
            Arc::new(CachedTask::new(
                self.id.clone(),
                instance_id,
                Arc::clone(&self.store),
                Arc::clone(&self.listener),
            ))
        });
        Ok(Arc::clone(task))
    }

    /// Looks up the cached entry for one task slot.
    #[must_use]
    pub fn get_task(&self, instance_id: u32) -> Option<Arc<CachedTask>> {
        self.tasks
            .read()
            .ok()
            .and_then(|tasks| tasks.get(&instance_id).cloned())
    }

    /// Bulk-refreshes cached task runtimes from store reads.
    ///
    /// With `force` set every cached value is overwritten; otherwise entries
    /// holding a newer revision are left alone. No store writes, no
    /// notifications.
    pub async fn replace_tasks(
        &self,
        runtimes: BTreeMap<u32, TaskRuntime>,
        force: bool,
    ) -> Result<()> {
        for (instance_id, runtime) in runtimes {
            let task = self.add_task(instance_id).await?;
            task.replace_runtime(runtime, force)?;
        }
        Ok(())
    }

    /// Applies field-level diffs to tasks, one CAS per task.
    ///
    /// Each merged runtime passes the same goal-state validation as a full
    /// compare-and-set write. This is **not** a cross-task transaction:
    /// tasks are patched independently in instance order, a failing patch
    /// does not roll back earlier ones, and the first error is what the
    /// caller receives.
    pub async fn patch_tasks(&self, diffs: BTreeMap<u32, RuntimeDiff>) -> Result<()> {
        let job_type = self.get_config().await?.job_type;
        let mut first_err = None;
        for (instance_id, diff) in diffs {
            let result = match self.add_task(instance_id).await {
                Ok(task) => task.patch_runtime(&diff, job_type).await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                tracing::warn!(
                    job_id = %self.id,
                    instance_id,
                    error = %err,
                    "failed to patch task runtime"
                );
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Invalidates the cached config and runtime.
    ///
    /// The task entries stay; their own invalidation is per-write.
    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.config.lock() {
            *guard = None;
        }
        if let Ok(mut guard) = self.runtime.lock() {
            *guard = None;
        }
    }

    /// The cached runtime, if resident. Never touches the store.
    pub fn cached_runtime(&self) -> Result<Option<JobRuntime>> {
        let guard = self.runtime.lock().map_err(poison_err)?;
        Ok(guard.clone())
    }
}
