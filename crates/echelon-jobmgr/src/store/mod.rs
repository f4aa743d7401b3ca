//! Pluggable storage for job and task state.
//!
//! The [`Store`] trait is the narrow read/write contract the reconciliation
//! engine holds against the durable store. Leader election is handled
//! separately by [`crate::leader::Candidate`].
//!
//! ## Design Principles
//!
//! - **CAS semantics**: runtime writes use compare-and-set on the record's
//!   revision to prevent races between concurrent writers
//! - **Append-only history**: pod events are appended and range-deleted,
//!   never updated
//! - **Testability**: in-memory implementation for tests, a durable backend
//!   in production

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

use echelon_core::{JobId, PodId};

use crate::error::Result;
use crate::job::{JobConfig, JobRuntime};
use crate::pod_event::PodEvent;
use crate::task::{InstanceRange, TaskInfo, TaskRuntime, TaskState};

/// Pagination window for task queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    /// Number of records to skip.
    pub offset: u32,
    /// Maximum number of records to return; 0 means no limit.
    pub limit: u32,
}

/// Filter + pagination for [`Store::query_tasks`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySpec {
    /// Keep only tasks whose state is in this set; empty keeps all.
    pub task_states: Vec<TaskState>,
    /// Keep only tasks placed on these hosts; empty keeps all.
    pub hosts: Vec<String>,
    /// Result window.
    pub pagination: Pagination,
}

/// Storage abstraction for job and task state.
///
/// ## CAS Semantics
///
/// `cas_job_runtime` and `cas_task_runtime` are the only write paths for
/// runtime records. The caller presents the runtime it read (including its
/// `revision`); the store applies the write only when the stored revision
/// still matches, bumping the revision on success. A mismatch fails with
/// [`crate::error::Error::UnexpectedVersion`] and the caller may re-read and
/// retry, bounded by its concurrency-retry budget.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from RPC
/// workers and reconcilers.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Job reads ---

    /// Gets a job's declared configuration.
    async fn get_job_config(&self, job_id: &JobId) -> Result<JobConfig>;

    /// Gets a job's runtime record.
    async fn get_job_runtime(&self, job_id: &JobId) -> Result<JobRuntime>;

    // --- Task reads ---

    /// Gets every task of a job, keyed by instance id.
    async fn get_tasks_for_job(&self, job_id: &JobId) -> Result<BTreeMap<u32, TaskInfo>>;

    /// Gets the tasks of a job whose instance id falls in `range`.
    async fn get_tasks_for_job_by_range(
        &self,
        job_id: &JobId,
        range: InstanceRange,
    ) -> Result<BTreeMap<u32, TaskInfo>>;

    /// Gets a single task as a single-entry map, empty when absent.
    async fn get_task_for_job(
        &self,
        job_id: &JobId,
        instance_id: u32,
    ) -> Result<BTreeMap<u32, TaskInfo>>;

    /// Gets task runtimes (without the owning-info envelope) for a range.
    async fn get_task_runtimes_for_job_by_range(
        &self,
        job_id: &JobId,
        range: InstanceRange,
    ) -> Result<BTreeMap<u32, TaskRuntime>>;

    /// Queries a job's tasks with filtering and pagination.
    ///
    /// Returns the matching window and the total match count before
    /// pagination.
    async fn query_tasks(&self, job_id: &JobId, spec: &QuerySpec)
        -> Result<(Vec<TaskInfo>, u32)>;

    // --- Runtime writes (CAS) ---

    /// Atomically replaces a job runtime if its revision still matches.
    ///
    /// Returns the stored runtime with its bumped revision.
    async fn cas_job_runtime(&self, job_id: &JobId, runtime: JobRuntime) -> Result<JobRuntime>;

    /// Atomically replaces a task runtime if its revision still matches.
    ///
    /// Returns the stored runtime with its bumped revision.
    async fn cas_task_runtime(
        &self,
        job_id: &JobId,
        instance_id: u32,
        runtime: TaskRuntime,
    ) -> Result<TaskRuntime>;

    // --- Pod events ---

    /// Appends a pod event to an instance's history.
    async fn append_pod_event(
        &self,
        job_id: &JobId,
        instance_id: u32,
        event: PodEvent,
    ) -> Result<()>;

    /// Gets the events of one run, newest first.
    ///
    /// With `pod_id` absent, returns the events of the latest run.
    async fn get_pod_events(
        &self,
        job_id: &JobId,
        instance_id: u32,
        pod_id: Option<&PodId>,
    ) -> Result<Vec<PodEvent>>;

    /// Deletes events for runs in `[from_run, to_run_exclusive)`.
    async fn delete_pod_events(
        &self,
        job_id: &JobId,
        instance_id: u32,
        from_run: u64,
        to_run_exclusive: u64,
    ) -> Result<()>;

    // --- Framework info ---

    /// Gets the broker-assigned framework id registered under `name`.
    ///
    /// Returns an empty string when no registration exists.
    async fn get_framework_id(&self, name: &str) -> Result<String>;
}
