//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a simple in-memory implementation
//! of the [`Store`] trait suitable for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no durability, no cross-process
//!   coordination
//! - **Single-process only**: state is not shared across process boundaries

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use echelon_core::{JobId, PodId};

use super::{QuerySpec, Store};
use crate::error::{Error, Result};
use crate::job::{JobConfig, JobRuntime};
use crate::pod_event::PodEvent;
use crate::task::{InstanceRange, TaskInfo, TaskRuntime};

/// Everything the store holds for one job.
#[derive(Debug, Clone)]
struct JobRecord {
    config: JobConfig,
    runtime: JobRuntime,
    tasks: BTreeMap<u32, TaskRuntime>,
    /// Pod events per instance, in append order.
    pod_events: BTreeMap<u32, Vec<PodEvent>>,
}

/// In-memory store for testing.
///
/// Provides a simple, thread-safe implementation of the [`Store`] trait
/// using `RwLock` for synchronization. Revisions behave like the production
/// store: every CAS write bumps the stored revision and a stale writer gets
/// [`Error::UnexpectedVersion`].
///
/// ## Example
///
/// ```rust
/// use echelon_jobmgr::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// // Seed jobs and tasks in tests...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    framework_ids: RwLock<HashMap<String, String>>,
    /// Number of upcoming CAS calls that fail with a version conflict.
    injected_cas_conflicts: AtomicU32,
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("store lock poisoned")
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a job with its configuration and runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn create_job(
        &self,
        job_id: &JobId,
        config: JobConfig,
        runtime: JobRuntime,
    ) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        jobs.insert(
            job_id.clone(),
            JobRecord {
                config,
                runtime,
                tasks: BTreeMap::new(),
                pod_events: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Seeds a task runtime under an existing job.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is absent or the lock is poisoned.
    pub fn create_task(
        &self,
        job_id: &JobId,
        instance_id: u32,
        runtime: TaskRuntime,
    ) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::job_not_found(job_id))?;
        record.tasks.insert(instance_id, runtime);
        Ok(())
    }

    /// Registers a framework id under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_framework_id(&self, name: &str, framework_id: &str) -> Result<()> {
        let mut ids = self.framework_ids.write().map_err(poison_err)?;
        ids.insert(name.to_string(), framework_id.to_string());
        Ok(())
    }

    /// Makes the next `count` CAS calls fail with a version conflict.
    ///
    /// Use this to exercise the bounded concurrency-retry paths without a
    /// real racing writer.
    pub fn inject_cas_conflicts(&self, count: u32) {
        self.injected_cas_conflicts.store(count, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_cas_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Returns the run id of the newest event recorded for an instance.
    fn latest_run(events: &[PodEvent]) -> Option<u64> {
        events.iter().map(|e| e.pod_id.run_id()).max()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_job_config(&self, job_id: &JobId) -> Result<JobConfig> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        jobs.get(job_id)
            .map(|record| record.config.clone())
            .ok_or_else(|| Error::job_not_found(job_id))
    }

    async fn get_job_runtime(&self, job_id: &JobId) -> Result<JobRuntime> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        jobs.get(job_id)
            .map(|record| record.runtime.clone())
            .ok_or_else(|| Error::job_not_found(job_id))
    }

    async fn get_tasks_for_job(&self, job_id: &JobId) -> Result<BTreeMap<u32, TaskInfo>> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        let record = jobs.get(job_id).ok_or_else(|| Error::job_not_found(job_id))?;
        Ok(record
            .tasks
            .iter()
            .map(|(&instance_id, runtime)| {
                (
                    instance_id,
                    TaskInfo {
                        job_id: job_id.clone(),
                        instance_id,
                        runtime: runtime.clone(),
                    },
                )
            })
            .collect())
    }

    async fn get_tasks_for_job_by_range(
        &self,
        job_id: &JobId,
        range: InstanceRange,
    ) -> Result<BTreeMap<u32, TaskInfo>> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        let record = jobs.get(job_id).ok_or_else(|| Error::job_not_found(job_id))?;
        // An inverted range selects nothing rather than panicking.
        let to = range.to.max(range.from);
        Ok(record
            .tasks
            .range(range.from..to)
            .map(|(&instance_id, runtime)| {
                (
                    instance_id,
                    TaskInfo {
                        job_id: job_id.clone(),
                        instance_id,
                        runtime: runtime.clone(),
                    },
                )
            })
            .collect())
    }

    async fn get_task_for_job(
        &self,
        job_id: &JobId,
        instance_id: u32,
    ) -> Result<BTreeMap<u32, TaskInfo>> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        let record = jobs.get(job_id).ok_or_else(|| Error::job_not_found(job_id))?;
        Ok(record
            .tasks
            .get(&instance_id)
            .map(|runtime| {
                (
                    instance_id,
                    TaskInfo {
                        job_id: job_id.clone(),
                        instance_id,
                        runtime: runtime.clone(),
                    },
                )
            })
            .into_iter()
            .collect())
    }

    async fn get_task_runtimes_for_job_by_range(
        &self,
        job_id: &JobId,
        range: InstanceRange,
    ) -> Result<BTreeMap<u32, TaskRuntime>> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        let record = jobs.get(job_id).ok_or_else(|| Error::job_not_found(job_id))?;
        let to = range.to.max(range.from);
        Ok(record
            .tasks
            .range(range.from..to)
            .map(|(&instance_id, runtime)| (instance_id, runtime.clone()))
            .collect())
    }

    async fn query_tasks(
        &self,
        job_id: &JobId,
        spec: &QuerySpec,
    ) -> Result<(Vec<TaskInfo>, u32)> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        let record = jobs.get(job_id).ok_or_else(|| Error::job_not_found(job_id))?;

        let matches: Vec<TaskInfo> = record
            .tasks
            .iter()
            .filter(|(_, runtime)| {
                spec.task_states.is_empty() || spec.task_states.contains(&runtime.state)
            })
            .filter(|(_, runtime)| {
                spec.hosts.is_empty()
                    || runtime
                        .host
                        .as_ref()
                        .is_some_and(|host| spec.hosts.contains(host))
            })
            .map(|(&instance_id, runtime)| TaskInfo {
                job_id: job_id.clone(),
                instance_id,
                runtime: runtime.clone(),
            })
            .collect();

        let total = u32::try_from(matches.len()).unwrap_or(u32::MAX);
        let offset = spec.pagination.offset as usize;
        let window: Vec<TaskInfo> = if spec.pagination.limit == 0 {
            matches.into_iter().skip(offset).collect()
        } else {
            matches
                .into_iter()
                .skip(offset)
                .take(spec.pagination.limit as usize)
                .collect()
        };
        Ok((window, total))
    }

    async fn cas_job_runtime(&self, job_id: &JobId, runtime: JobRuntime) -> Result<JobRuntime> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::job_not_found(job_id))?;

        if self.take_injected_conflict() {
            return Err(Error::UnexpectedVersion {
                expected: runtime.revision,
                actual: record.runtime.revision,
            });
        }

        if record.runtime.revision != runtime.revision {
            return Err(Error::UnexpectedVersion {
                expected: runtime.revision,
                actual: record.runtime.revision,
            });
        }

        let mut stored = runtime;
        stored.revision += 1;
        stored.update_time = Utc::now();
        record.runtime = stored.clone();
        Ok(stored)
    }

    async fn cas_task_runtime(
        &self,
        job_id: &JobId,
        instance_id: u32,
        runtime: TaskRuntime,
    ) -> Result<TaskRuntime> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::job_not_found(job_id))?;
        let stored = record
            .tasks
            .get_mut(&instance_id)
            .ok_or_else(|| Error::task_not_found(job_id, instance_id))?;

        if self.take_injected_conflict() {
            return Err(Error::UnexpectedVersion {
                expected: runtime.revision,
                actual: stored.revision,
            });
        }

        if stored.revision != runtime.revision {
            return Err(Error::UnexpectedVersion {
                expected: runtime.revision,
                actual: stored.revision,
            });
        }

        let mut next = runtime;
        next.revision += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn append_pod_event(
        &self,
        job_id: &JobId,
        instance_id: u32,
        event: PodEvent,
    ) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::job_not_found(job_id))?;
        record
            .pod_events
            .entry(instance_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_pod_events(
        &self,
        job_id: &JobId,
        instance_id: u32,
        pod_id: Option<&PodId>,
    ) -> Result<Vec<PodEvent>> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        let record = jobs.get(job_id).ok_or_else(|| Error::job_not_found(job_id))?;
        let Some(events) = record.pod_events.get(&instance_id) else {
            return Ok(Vec::new());
        };

        let run = match pod_id {
            Some(pod_id) => pod_id.run_id(),
            None => match Self::latest_run(events) {
                Some(run) => run,
                None => return Ok(Vec::new()),
            },
        };

        // Newest first within the run.
        Ok(events
            .iter()
            .filter(|e| e.pod_id.run_id() == run)
            .rev()
            .cloned()
            .collect())
    }

    async fn delete_pod_events(
        &self,
        job_id: &JobId,
        instance_id: u32,
        from_run: u64,
        to_run_exclusive: u64,
    ) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::job_not_found(job_id))?;
        if let Some(events) = record.pod_events.get_mut(&instance_id) {
            events.retain(|e| {
                let run = e.pod_id.run_id();
                run < from_run || run >= to_run_exclusive
            });
        }
        Ok(())
    }

    async fn get_framework_id(&self, name: &str) -> Result<String> {
        let ids = self.framework_ids.read().map_err(poison_err)?;
        Ok(ids.get(name).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, JobType};
    use crate::store::Pagination;
    use crate::task::TaskState;

    fn job_id() -> JobId {
        JobId::new("j1")
    }

    fn seed(store: &InMemoryStore) {
        store
            .create_job(
                &job_id(),
                JobConfig {
                    instance_count: 3,
                    job_type: JobType::Service,
                    config_version: 1,
                    health_check: false,
                },
                JobRuntime::initialized(JobState::Running),
            )
            .unwrap();
        for instance_id in 0..3 {
            store
                .create_task(
                    &job_id(),
                    instance_id,
                    TaskRuntime::initialized(&job_id(), instance_id, TaskState::Running),
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn job_reads_fail_when_absent() {
        let store = InMemoryStore::new();
        let err = store.get_job_config(&job_id()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn range_reads_select_instances() {
        let store = InMemoryStore::new();
        seed(&store);

        let all = store.get_tasks_for_job(&job_id()).await.unwrap();
        assert_eq!(all.len(), 3);

        let ranged = store
            .get_tasks_for_job_by_range(&job_id(), InstanceRange::new(1, 3))
            .await
            .unwrap();
        assert_eq!(ranged.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

        let single = store.get_task_for_job(&job_id(), 2).await.unwrap();
        assert_eq!(single.len(), 1);
        assert!(single.contains_key(&2));

        let missing = store.get_task_for_job(&job_id(), 9).await.unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn cas_task_runtime_bumps_revision() {
        let store = InMemoryStore::new();
        seed(&store);

        let mut runtime = store
            .get_task_for_job(&job_id(), 0)
            .await
            .unwrap()
            .remove(&0)
            .unwrap()
            .runtime;
        runtime.state = TaskState::Running;

        let stored = store.cas_task_runtime(&job_id(), 0, runtime).await.unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.state, TaskState::Running);
    }

    #[tokio::test]
    async fn cas_rejects_stale_revision() {
        let store = InMemoryStore::new();
        seed(&store);

        let runtime = store
            .get_task_for_job(&job_id(), 0)
            .await
            .unwrap()
            .remove(&0)
            .unwrap()
            .runtime;

        // First write wins.
        store
            .cas_task_runtime(&job_id(), 0, runtime.clone())
            .await
            .unwrap();

        // Replaying the same read loses.
        let err = store
            .cas_task_runtime(&job_id(), 0, runtime)
            .await
            .unwrap_err();
        assert!(err.is_unexpected_version());
    }

    #[tokio::test]
    async fn injected_conflicts_fail_then_clear() {
        let store = InMemoryStore::new();
        seed(&store);
        store.inject_cas_conflicts(2);

        let runtime = store.get_job_runtime(&job_id()).await.unwrap();
        for _ in 0..2 {
            let err = store
                .cas_job_runtime(&job_id(), runtime.clone())
                .await
                .unwrap_err();
            assert!(err.is_unexpected_version());
        }
        assert!(store.cas_job_runtime(&job_id(), runtime).await.is_ok());
    }

    #[tokio::test]
    async fn pod_events_filter_by_run_and_default_to_latest() {
        let store = InMemoryStore::new();
        seed(&store);

        for run in 1..=3u64 {
            let mut runtime = TaskRuntime::initialized(&job_id(), 0, TaskState::Running);
            runtime.pod_id = PodId::new(&job_id(), 0, run);
            runtime.prev_pod_id = PodId::new(&job_id(), 0, run - 1);
            store
                .append_pod_event(&job_id(), 0, PodEvent::from_runtime(&runtime))
                .await
                .unwrap();
        }

        let latest = store.get_pod_events(&job_id(), 0, None).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].pod_id.run_id(), 3);

        let second = PodId::new(&job_id(), 0, 2);
        let run2 = store
            .get_pod_events(&job_id(), 0, Some(&second))
            .await
            .unwrap();
        assert_eq!(run2.len(), 1);
        assert_eq!(run2[0].prev_pod_id.run_id(), 1);

        store.delete_pod_events(&job_id(), 0, 1, 3).await.unwrap();
        let remaining = store.get_pod_events(&job_id(), 0, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pod_id.run_id(), 3);
        assert!(store
            .get_pod_events(&job_id(), 0, Some(&second))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let store = InMemoryStore::new();
        seed(&store);

        let (all, total) = store
            .query_tasks(&job_id(), &QuerySpec::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(total, 3);

        let spec = QuerySpec {
            task_states: vec![TaskState::Initialized],
            pagination: Pagination { offset: 1, limit: 1 },
            ..QuerySpec::default()
        };
        let (window, total) = store.query_tasks(&job_id(), &spec).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].instance_id, 1);
    }

    #[tokio::test]
    async fn framework_id_defaults_to_empty() {
        let store = InMemoryStore::new();
        assert_eq!(store.get_framework_id("Echelon").await.unwrap(), "");
        store.set_framework_id("Echelon", "fw-1").unwrap();
        assert_eq!(store.get_framework_id("Echelon").await.unwrap(), "fw-1");
    }
}
