//! One cached task instance.

use std::sync::{Arc, Mutex, PoisonError};

use echelon_core::JobId;

use super::RuntimeListener;
use crate::error::{Error, Result};
use crate::job::JobType;
use crate::pod_event::PodEvent;
use crate::store::Store;
use crate::task::{RuntimeDiff, TaskRuntime, TaskState};
use crate::watch::PodSummary;

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("cached task lock poisoned")
}

/// A task instance resident in the cache.
///
/// The runtime populates lazily from the store on first read and tracks the
/// store's post-image after every successful write. The entry never writes
/// to the store except through [`CachedTask::compare_and_set_runtime`] and
/// [`CachedTask::patch_runtime`].
pub struct CachedTask {
    job_id: JobId,
    instance_id: u32,
    runtime: Mutex<Option<TaskRuntime>>,
    store: Arc<dyn Store>,
    listener: Arc<dyn RuntimeListener>,
}

impl std::fmt::Debug for CachedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedTask")
            .field("job_id", &self.job_id)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl CachedTask {
    pub(super) fn new(
        job_id: JobId,
        instance_id: u32,
        store: Arc<dyn Store>,
        listener: Arc<dyn RuntimeListener>,
    ) -> Self {
        Self {
            job_id,
            instance_id,
            runtime: Mutex::new(None),
            store,
            listener,
        }
    }

    /// The owning job.
    #[must_use]
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// The slot within the job.
    #[must_use]
    pub const fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// Gets the task runtime, populating the cache from the store on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when the task does not exist in the store.
    pub async fn get_runtime(&self) -> Result<TaskRuntime> {
        if let Some(runtime) = self.cached_runtime()? {
            return Ok(runtime);
        }

        let mut infos = self
            .store
            .get_task_for_job(&self.job_id, self.instance_id)
            .await?;
        let info = infos
            .remove(&self.instance_id)
            .ok_or_else(|| Error::task_not_found(&self.job_id, self.instance_id))?;

        let mut guard = self.runtime.lock().map_err(poison_err)?;
        *guard = Some(info.runtime.clone());
        Ok(info.runtime)
    }

    /// Writes a full runtime through to the store with compare-and-set.
    ///
    /// The caller presents the runtime it read, mutated in place; the write
    /// lands only if the store's revision still matches. On success the
    /// cache holds the post-image and the listener is notified. On a version
    /// conflict the cached entry is invalidated so the next read re-reads,
    /// and the conflict is surfaced for the caller's bounded retry loop.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] when the goal state is not permitted for
    ///   the job type
    /// - [`Error::UnexpectedVersion`] on a CAS conflict
    pub async fn compare_and_set_runtime(
        &self,
        runtime: TaskRuntime,
        job_type: JobType,
    ) -> Result<TaskRuntime> {
        validate_goal_state(&runtime, job_type)?;
        self.write_through(runtime).await
    }

    /// Merges a field-level diff into the current runtime and writes it
    /// through with compare-and-set.
    ///
    /// The merged runtime passes the same goal-state validation as
    /// [`CachedTask::compare_and_set_runtime`]. No retry is performed here;
    /// a conflict is the caller's to handle.
    pub async fn patch_runtime(
        &self,
        diff: &RuntimeDiff,
        job_type: JobType,
    ) -> Result<TaskRuntime> {
        if diff.is_empty() {
            return self.get_runtime().await;
        }
        let mut runtime = self.get_runtime().await?;
        diff.apply_to(&mut runtime);
        validate_goal_state(&runtime, job_type)?;
        self.write_through(runtime).await
    }

    /// Replaces the cached runtime without touching the store.
    ///
    /// With `force` unset the replacement is skipped when the cache already
    /// holds a newer revision; a forced replacement always wins. Used by the
    /// Refresh path after a bulk store read.
    pub fn replace_runtime(&self, runtime: TaskRuntime, force: bool) -> Result<()> {
        let mut guard = self.runtime.lock().map_err(poison_err)?;
        let stale = !force
            && guard
                .as_ref()
                .is_some_and(|cached| cached.revision > runtime.revision);
        if !stale {
            *guard = Some(runtime);
        }
        Ok(())
    }

    /// The cached runtime, if resident.
    pub fn cached_runtime(&self) -> Result<Option<TaskRuntime>> {
        let guard = self.runtime.lock().map_err(poison_err)?;
        Ok(guard.clone())
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.runtime.lock() {
            *guard = None;
        }
    }

    /// CAS against the store, then refresh the cache, append history, and
    /// notify, per the module's lock discipline.
    async fn write_through(&self, runtime: TaskRuntime) -> Result<TaskRuntime> {
        let prev = self.cached_runtime()?;

        let stored = match self
            .store
            .cas_task_runtime(&self.job_id, self.instance_id, runtime)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                // The cache can no longer be trusted to match the store.
                self.invalidate();
                return Err(err);
            }
        };

        {
            let mut guard = self.runtime.lock().map_err(poison_err)?;
            *guard = Some(stored.clone());
        }

        if history_worthy(prev.as_ref(), &stored) {
            self.store
                .append_pod_event(
                    &self.job_id,
                    self.instance_id,
                    PodEvent::from_runtime(&stored),
                )
                .await?;
        }

        self.listener.on_task_runtime_changed(PodSummary {
            job_id: self.job_id.clone(),
            instance_id: self.instance_id,
            pod_id: stored.pod_id.clone(),
            state: stored.state,
            goal_state: stored.goal_state,
            host: stored.host.clone(),
            message: stored.message.clone(),
        });

        Ok(stored)
    }
}

/// A mutation earns a pod event when the run, state, or goal changed.
fn history_worthy(prev: Option<&TaskRuntime>, next: &TaskRuntime) -> bool {
    prev.is_none_or(|prev| {
        prev.pod_id != next.pod_id
            || prev.state != next.state
            || prev.goal_state != next.goal_state
    })
}

/// Goal-state validation applied on both write paths.
///
/// The goal vocabulary is fixed; a Succeeded goal additionally requires a
/// batch job, since service instances never run to completion.
fn validate_goal_state(runtime: &TaskRuntime, job_type: JobType) -> Result<()> {
    if !runtime.goal_state.is_goal_state() {
        return Err(Error::invalid_argument(format!(
            "{} is not a valid task goal state",
            runtime.goal_state
        )));
    }
    if runtime.goal_state == TaskState::Succeeded && job_type != JobType::Batch {
        return Err(Error::invalid_argument(
            "a succeeded goal state requires a batch job",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cached::NoopListener;
    use crate::job::{JobConfig, JobRuntime, JobState};
    use crate::store::memory::InMemoryStore;

    fn job_id() -> JobId {
        JobId::new("j1")
    }

    fn seeded_task(store: &Arc<InMemoryStore>) -> CachedTask {
        store
            .create_job(
                &job_id(),
                JobConfig {
                    instance_count: 1,
                    job_type: JobType::Service,
                    config_version: 1,
                    health_check: false,
                },
                JobRuntime::initialized(JobState::Running),
            )
            .unwrap();
        store
            .create_task(
                &job_id(),
                0,
                TaskRuntime::initialized(&job_id(), 0, TaskState::Running),
            )
            .unwrap();
        CachedTask::new(
            job_id(),
            0,
            Arc::clone(store) as Arc<dyn Store>,
            Arc::new(NoopListener),
        )
    }

    #[tokio::test]
    async fn get_runtime_populates_lazily() {
        let store = Arc::new(InMemoryStore::new());
        let task = seeded_task(&store);

        assert!(task.cached_runtime().unwrap().is_none());
        let runtime = task.get_runtime().await.unwrap();
        assert_eq!(runtime.state, TaskState::Initialized);
        assert!(task.cached_runtime().unwrap().is_some());
    }

    #[tokio::test]
    async fn cas_updates_cache_and_appends_event() {
        let store = Arc::new(InMemoryStore::new());
        let task = seeded_task(&store);

        let mut runtime = task.get_runtime().await.unwrap();
        runtime.state = TaskState::Running;
        let stored = task
            .compare_and_set_runtime(runtime, JobType::Service)
            .await
            .unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(task.cached_runtime().unwrap().unwrap().revision, 2);

        let events = store.get_pod_events(&job_id(), 0, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actual_state, TaskState::Running);
    }

    #[tokio::test]
    async fn conflict_invalidates_cache() {
        let store = Arc::new(InMemoryStore::new());
        let task = seeded_task(&store);

        let runtime = task.get_runtime().await.unwrap();

        // A racing writer lands first.
        let mut racer = runtime.clone();
        racer.message = "racer".to_string();
        store.cas_task_runtime(&job_id(), 0, racer).await.unwrap();

        let err = task
            .compare_and_set_runtime(runtime, JobType::Service)
            .await
            .unwrap_err();
        assert!(err.is_unexpected_version());
        assert!(task.cached_runtime().unwrap().is_none());

        // The next read re-reads the store's truth.
        let reread = task.get_runtime().await.unwrap();
        assert_eq!(reread.message, "racer");
    }

    #[tokio::test]
    async fn patch_preserves_unset_fields() {
        let store = Arc::new(InMemoryStore::new());
        let task = seeded_task(&store);

        let diff = RuntimeDiff {
            goal_state: Some(TaskState::Killed),
            message: Some("stop requested".to_string()),
            ..RuntimeDiff::default()
        };
        let stored = task.patch_runtime(&diff, JobType::Service).await.unwrap();
        assert_eq!(stored.goal_state, TaskState::Killed);
        assert_eq!(stored.message, "stop requested");
        assert_eq!(stored.state, TaskState::Initialized);
    }

    #[tokio::test]
    async fn goal_state_vocabulary_is_enforced() {
        let store = Arc::new(InMemoryStore::new());
        let task = seeded_task(&store);

        let mut runtime = task.get_runtime().await.unwrap();
        runtime.goal_state = TaskState::Pending;
        let err = task
            .compare_and_set_runtime(runtime.clone(), JobType::Service)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));

        runtime.goal_state = TaskState::Succeeded;
        let err = task
            .compare_and_set_runtime(runtime, JobType::Service)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn replace_respects_newer_cache_unless_forced() {
        let store = Arc::new(InMemoryStore::new());
        let task = seeded_task(&store);

        let mut newer = task.get_runtime().await.unwrap();
        newer.revision = 9;
        task.replace_runtime(newer, false).unwrap();

        let mut older = task.cached_runtime().unwrap().unwrap();
        older.revision = 3;
        task.replace_runtime(older.clone(), false).unwrap();
        assert_eq!(task.cached_runtime().unwrap().unwrap().revision, 9);

        task.replace_runtime(older, true).unwrap();
        assert_eq!(task.cached_runtime().unwrap().unwrap().revision, 3);
    }
}
