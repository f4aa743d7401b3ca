//! The TaskManager RPC surface.
//!
//! [`TaskService`] translates each TaskManager operation into operations
//! over the store facade, the cached entity factory, the goal-state driver,
//! and the leader guard. Requests and responses are plain typed structs; a
//! response carries either its success payload or a typed error variant,
//! while transport-kind failures (unavailable, deadline exceeded) are
//! returned as errors.
//!
//! Write operations (`start`, `stop`, `restart`, `refresh`) are
//! leader-guarded and run under the configured RPC deadline. The only retry
//! the handler performs is the bounded concurrency-retry around its own
//! compare-and-set calls.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use echelon_core::{JobId, PodId};

use crate::cached::JobFactory;
use crate::client::{
    extract_ip_port_from_agent_pid, HostManagerClient, LogManager, ResManagerClient,
};
use crate::config::JobmgrConfig;
use crate::error::{Error, Result};
use crate::goalstate::Driver;
use crate::job::{default_job_goal_state, JobConfig, JobRuntime, JobState, JobType};
use crate::leader::Candidate;
use crate::metrics::{JobmgrMetrics, TimingGuard};
use crate::pod_event::{PodEvent, PodEventInfo};
use crate::store::{QuerySpec, Store};
use crate::task::{
    default_task_goal_state, regenerate_run, InstanceRange, RuntimeDiff, TaskInfo, TaskRuntime,
    TaskState, TerminationReason, TerminationStatus,
};

/// Default number of runs returned by a pod-events query.
const DEFAULT_POD_EVENTS_LIMIT: u64 = 10;

/// Fallback broker agent port when the agent PID carries none.
const DEFAULT_AGENT_PORT: &str = "5051";

// --- Request/response types ---

/// Request for [`TaskService::get`].
#[derive(Debug, Clone)]
pub struct GetRequest {
    /// The job to read.
    pub job_id: JobId,
    /// The instance to read.
    pub instance_id: u32,
}

/// Response of [`TaskService::get`].
#[derive(Debug, Default)]
pub struct GetResponse {
    /// The latest task record for the instance.
    pub result: Option<TaskInfo>,
    /// One synthesized record per terminal event in the current run's
    /// history.
    pub results: Vec<TaskInfo>,
    /// Typed failure, when the read could not be served.
    pub error: Option<GetError>,
}

/// Typed failures of [`TaskService::get`].
#[derive(Debug)]
pub enum GetError {
    /// The job does not exist.
    NotFound {
        /// The job that was looked up.
        job_id: JobId,
        /// Failure detail.
        message: String,
    },
    /// The instance is outside the job's range.
    OutOfRange {
        /// The job that was looked up.
        job_id: JobId,
        /// The job's instance count.
        instance_count: u32,
    },
}

/// Request for [`TaskService::list`].
#[derive(Debug, Clone)]
pub struct ListRequest {
    /// The job to list.
    pub job_id: JobId,
    /// Restrict to one instance range; absent lists every task.
    pub range: Option<InstanceRange>,
}

/// Response of [`TaskService::list`].
#[derive(Debug, Default)]
pub struct ListResponse {
    /// Matching tasks keyed by instance id.
    pub result: BTreeMap<u32, TaskInfo>,
    /// Typed failure, when no tasks matched.
    pub error: Option<ListError>,
}

/// Typed failures of [`TaskService::list`].
#[derive(Debug)]
pub enum ListError {
    /// The job does not exist or the range matched nothing.
    NotFound {
        /// The job that was looked up.
        job_id: JobId,
        /// Failure detail.
        message: String,
    },
}

/// Request for [`TaskService::query`].
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// The job to query.
    pub job_id: JobId,
    /// Filter and pagination.
    pub spec: QuerySpec,
}

/// Pagination echo returned with query results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponsePagination {
    /// Records skipped.
    pub offset: u32,
    /// Window size requested.
    pub limit: u32,
    /// Total matches before pagination.
    pub total: u32,
}

/// Response of [`TaskService::query`].
#[derive(Debug, Default)]
pub struct QueryResponse {
    /// The matching window.
    pub records: Vec<TaskInfo>,
    /// Pagination echo.
    pub pagination: ResponsePagination,
    /// Typed failure, when the job was not found.
    pub error: Option<QueryError>,
}

/// Typed failures of [`TaskService::query`].
#[derive(Debug)]
pub enum QueryError {
    /// The job does not exist.
    NotFound {
        /// The job that was looked up.
        job_id: JobId,
        /// Failure detail.
        message: String,
    },
}

/// Request for [`TaskService::start`].
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// The job whose tasks to start.
    pub job_id: JobId,
    /// Restrict to instance ranges; empty starts every task.
    pub ranges: Vec<InstanceRange>,
}

/// Response of [`TaskService::start`].
#[derive(Debug, Default)]
pub struct StartResponse {
    /// Instances whose goal was successfully reset.
    pub started_instance_ids: Vec<u32>,
    /// Instances that could not be started.
    pub invalid_instance_ids: Vec<u32>,
    /// Typed failure, when the operation failed as a whole.
    pub error: Option<StartError>,
}

/// Typed failures of [`TaskService::start`].
#[derive(Debug)]
pub enum StartError {
    /// The job does not exist.
    NotFound {
        /// The job that was looked up.
        job_id: JobId,
        /// Failure detail.
        message: String,
    },
    /// The requested range is outside the job.
    OutOfRange {
        /// The job that was looked up.
        job_id: JobId,
        /// The job's instance count.
        instance_count: u32,
    },
    /// The job runtime update failed.
    Failure {
        /// Failure detail.
        message: String,
    },
}

/// Request for [`TaskService::stop`].
#[derive(Debug, Clone)]
pub struct StopRequest {
    /// The job whose tasks to stop.
    pub job_id: JobId,
    /// Restrict to instance ranges; empty stops the whole job.
    pub ranges: Vec<InstanceRange>,
}

/// Response of [`TaskService::stop`].
#[derive(Debug, Default)]
pub struct StopResponse {
    /// Instances whose goal was flipped to Killed.
    pub stopped_instance_ids: Vec<u32>,
    /// Instances that could not be stopped.
    pub invalid_instance_ids: Vec<u32>,
    /// Typed failure, when the operation failed as a whole.
    pub error: Option<StopError>,
}

/// Typed failures of [`TaskService::stop`].
#[derive(Debug)]
pub enum StopError {
    /// The job does not exist.
    NotFound {
        /// The job that was looked up.
        job_id: JobId,
        /// Failure detail.
        message: String,
    },
    /// The requested range is outside the job.
    OutOfRange {
        /// The job that was looked up.
        job_id: JobId,
        /// The job's instance count.
        instance_count: u32,
    },
    /// A goal-state update failed.
    UpdateError {
        /// Failure detail.
        message: String,
    },
}

/// Request for [`TaskService::restart`].
#[derive(Debug, Clone)]
pub struct RestartRequest {
    /// The job whose tasks to restart.
    pub job_id: JobId,
    /// Restrict to instance ranges; empty restarts every task.
    pub ranges: Vec<InstanceRange>,
}

/// Response of [`TaskService::restart`].
#[derive(Debug, Default)]
pub struct RestartResponse {}

/// Request for [`TaskService::refresh`].
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    /// The job to reload from the store.
    pub job_id: JobId,
    /// Restrict to one instance range; absent refreshes every task.
    pub range: Option<InstanceRange>,
}

/// Response of [`TaskService::refresh`].
#[derive(Debug, Default)]
pub struct RefreshResponse {}

/// Request for [`TaskService::get_pod_events`].
#[derive(Debug, Clone)]
pub struct GetPodEventsRequest {
    /// The job to read.
    pub job_id: JobId,
    /// The instance to read.
    pub instance_id: u32,
    /// Read one specific run; absent starts at the latest run.
    pub pod_id: Option<PodId>,
    /// Number of runs to walk back; defaults to 10, forced to 1 when a
    /// specific run is requested.
    pub limit: Option<u64>,
}

/// Response of [`TaskService::get_pod_events`].
#[derive(Debug, Default)]
pub struct GetPodEventsResponse {
    /// Events, newest run first.
    pub result: Vec<PodEventInfo>,
}

/// Request for [`TaskService::delete_pod_events`].
#[derive(Debug, Clone)]
pub struct DeletePodEventsRequest {
    /// The job to prune.
    pub job_id: JobId,
    /// The instance to prune.
    pub instance_id: u32,
    /// Events of runs `<= run_id` are deleted.
    pub run_id: u64,
}

/// Request for [`TaskService::get_cache`].
#[derive(Debug, Clone)]
pub struct GetCacheRequest {
    /// The job to inspect.
    pub job_id: JobId,
    /// The instance to inspect.
    pub instance_id: u32,
}

/// Response of [`TaskService::get_cache`].
#[derive(Debug)]
pub struct GetCacheResponse {
    /// The cache-resident runtime.
    pub runtime: TaskRuntime,
}

/// Request for [`TaskService::browse_sandbox`].
#[derive(Debug, Clone)]
pub struct BrowseSandboxRequest {
    /// The job to browse.
    pub job_id: JobId,
    /// The instance to browse.
    pub instance_id: u32,
    /// Browse one specific run; absent browses the current run.
    pub pod_id: Option<PodId>,
}

/// Response of [`TaskService::browse_sandbox`].
#[derive(Debug, Default)]
pub struct BrowseSandboxResponse {
    /// Agent address serving the sandbox.
    pub hostname: String,
    /// Agent port serving the sandbox.
    pub port: String,
    /// Sandbox file paths.
    pub paths: Vec<String>,
    /// Broker master hostname.
    pub master_hostname: String,
    /// Broker master port.
    pub master_port: String,
    /// Typed failure, when the sandbox could not be resolved.
    pub error: Option<BrowseSandboxError>,
}

/// Typed failures of [`TaskService::browse_sandbox`].
#[derive(Debug)]
pub enum BrowseSandboxError {
    /// The job does not exist.
    NotFound {
        /// The job that was looked up.
        job_id: JobId,
        /// Failure detail.
        message: String,
    },
    /// The instance or run has no recorded placement history.
    OutOfRange {
        /// The job that was looked up.
        job_id: JobId,
        /// The job's instance count.
        instance_count: u32,
    },
    /// The run has no host or agent to browse.
    NotRunning {
        /// Failure detail.
        message: String,
    },
    /// A downstream lookup failed.
    Failure {
        /// Failure detail.
        message: String,
    },
}

// --- Service ---

/// The TaskManager service handler.
pub struct TaskService {
    store: Arc<dyn Store>,
    factory: Arc<JobFactory>,
    driver: Driver,
    candidate: Arc<dyn Candidate>,
    resmgr: Arc<dyn ResManagerClient>,
    hostmgr: Arc<dyn HostManagerClient>,
    log_manager: Arc<dyn LogManager>,
    config: JobmgrConfig,
    metrics: JobmgrMetrics,
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService").finish_non_exhaustive()
    }
}

impl TaskService {
    /// Wires the service over its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        factory: Arc<JobFactory>,
        driver: Driver,
        candidate: Arc<dyn Candidate>,
        resmgr: Arc<dyn ResManagerClient>,
        hostmgr: Arc<dyn HostManagerClient>,
        log_manager: Arc<dyn LogManager>,
        config: JobmgrConfig,
    ) -> Self {
        Self {
            store,
            factory,
            driver,
            candidate,
            resmgr,
            hostmgr,
            log_manager,
            config,
            metrics: JobmgrMetrics::new(),
        }
    }

    /// Fetches the latest task record and the terminal history of the
    /// current run.
    pub async fn get(&self, req: GetRequest) -> Result<GetResponse> {
        let _timer = self.api_timer("get");

        let job_config = match self.job_config_without_filling_cache(&req.job_id).await {
            Ok(config) => config,
            Err(err) => {
                tracing::debug!(job_id = %req.job_id, error = %err, "failed to get job config");
                self.metrics.record_api_call("get", false);
                return Ok(GetResponse {
                    error: Some(GetError::NotFound {
                        message: format!("job {} not found, {err}", req.job_id),
                        job_id: req.job_id,
                    }),
                    ..GetResponse::default()
                });
            }
        };

        let mut tasks = self
            .store
            .get_task_for_job(&req.job_id, req.instance_id)
            .await?;
        let last_task_info = tasks.remove(&req.instance_id);

        // Latest run's full history; the chain walk is bounded by I5.
        let events = match self
            .pod_events_chain(&req.job_id, req.instance_id, None, None)
            .await
        {
            Ok(events) => events,
            Err(_) => {
                self.metrics.record_api_call("get", false);
                return Ok(GetResponse {
                    error: Some(GetError::OutOfRange {
                        job_id: req.job_id,
                        instance_count: job_config.instance_count,
                    }),
                    ..GetResponse::default()
                });
            }
        };

        let results = last_task_info
            .as_ref()
            .map(|last| terminal_task_infos(&events, last))
            .unwrap_or_default();

        self.metrics.record_api_call("get", true);
        Ok(GetResponse {
            result: last_task_info,
            results,
            error: None,
        })
    }

    /// Lists task records for a job, annotating PENDING tasks with the
    /// resource manager's reason.
    pub async fn list(&self, req: ListRequest) -> Result<ListResponse> {
        let _timer = self.api_timer("list");

        let ranges: Vec<InstanceRange> = req.range.into_iter().collect();
        let result = self.task_infos_by_ranges(&req.job_id, &ranges).await;

        let mut tasks = match result {
            Ok(tasks) if !tasks.is_empty() => tasks,
            Ok(_) => {
                self.metrics.record_api_call("list", false);
                return Ok(ListResponse {
                    error: Some(ListError::NotFound {
                        message: "no tasks in the requested range".to_string(),
                        job_id: req.job_id,
                    }),
                    ..ListResponse::default()
                });
            }
            Err(err) => {
                self.metrics.record_api_call("list", false);
                return Ok(ListResponse {
                    error: Some(ListError::NotFound {
                        message: format!("err= {err}"),
                        job_id: req.job_id,
                    }),
                    ..ListResponse::default()
                });
            }
        };

        self.fill_pending_reasons(&req.job_id, tasks.values_mut())
            .await;

        self.metrics.record_api_call("list", true);
        Ok(ListResponse {
            result: tasks,
            error: None,
        })
    }

    /// Queries task records with filtering and pagination.
    pub async fn query(&self, req: QueryRequest) -> Result<QueryResponse> {
        let _timer = self.api_timer("query");

        if let Err(err) = self.job_runtime_without_filling_cache(&req.job_id).await {
            tracing::debug!(job_id = %req.job_id, error = %err, "failed to find job");
            self.metrics.record_api_call("query", false);
            return Ok(QueryResponse {
                error: Some(QueryError::NotFound {
                    message: format!("failed to find job {}, err={err}", req.job_id),
                    job_id: req.job_id,
                }),
                ..QueryResponse::default()
            });
        }

        let (mut records, total) = match self.store.query_tasks(&req.job_id, &req.spec).await {
            Ok(result) => result,
            Err(err) => {
                self.metrics.record_api_call("query", false);
                return Ok(QueryResponse {
                    error: Some(QueryError::NotFound {
                        message: format!("err= {err}"),
                        job_id: req.job_id,
                    }),
                    ..QueryResponse::default()
                });
            }
        };

        self.fill_pending_reasons(&req.job_id, records.iter_mut())
            .await;

        self.metrics.record_api_call("query", true);
        Ok(QueryResponse {
            records,
            pagination: ResponsePagination {
                offset: req.spec.pagination.offset,
                limit: req.spec.pagination.limit,
                total,
            },
            error: None,
        })
    }

    /// Starts stopped tasks of a job: regenerates each selected run and
    /// resets its goal to the job type's default.
    pub async fn start(&self, req: StartRequest) -> Result<StartResponse> {
        let _timer = self.api_timer("start");

        if !self.candidate.is_leader() {
            self.metrics.record_api_call("start", false);
            return Err(Error::unavailable("Task Start API not supported on non-leader"));
        }

        let timeout = self.config.rpc_timeout();
        with_deadline(timeout, "start", self.start_inner(req)).await
    }

    async fn start_inner(&self, req: StartRequest) -> Result<StartResponse> {
        let cached_job = self.factory.add_job(&req.job_id);
        let cached_config = match cached_job.get_config().await {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(job_id = %req.job_id, error = %err, "failed to get job config");
                self.metrics.record_api_call("start", false);
                return Ok(StartResponse {
                    error: Some(StartError::NotFound {
                        message: err.to_string(),
                        job_id: req.job_id,
                    }),
                    ..StartResponse::default()
                });
            }
        };

        // Move the job itself to Pending with the type's default goal,
        // retrying the read-modify-write on version conflicts.
        let mut attempts = 0;
        loop {
            let mut job_runtime = match cached_job.get_runtime().await {
                Ok(runtime) => runtime,
                Err(err) => {
                    self.metrics.record_api_call("start", false);
                    return Err(err);
                }
            };

            // Batch jobs in a terminal state cannot be restarted.
            if cached_config.job_type == JobType::Batch && job_runtime.state.is_terminal() {
                tracing::info!(
                    job_id = %req.job_id,
                    state = %job_runtime.state,
                    "cannot start tasks in a terminal job"
                );
                self.metrics.record_api_call("start", false);
                return Err(Error::invalid_argument(
                    "cannot start tasks in a terminated job",
                ));
            }

            job_runtime.state = JobState::Pending;
            job_runtime.goal_state = default_job_goal_state(cached_config.job_type);

            match cached_job.compare_and_set_runtime(job_runtime).await {
                Ok(_) => break,
                Err(err) if err.is_unexpected_version() => {
                    self.metrics.record_cas_conflict("job");
                    attempts += 1;
                    if attempts < self.config.max_concurrency_error_retry {
                        continue;
                    }
                    tracing::error!(job_id = %req.job_id, error = %err, "failed to set job runtime");
                    self.metrics.record_api_call("start", false);
                    return Ok(StartResponse {
                        error: Some(StartError::Failure {
                            message: format!("task start failed while updating job status {err}"),
                        }),
                        ..StartResponse::default()
                    });
                }
                Err(err) => {
                    tracing::error!(job_id = %req.job_id, error = %err, "failed to set job runtime");
                    self.metrics.record_api_call("start", false);
                    return Ok(StartResponse {
                        error: Some(StartError::Failure {
                            message: format!("task start failed while updating job status {err}"),
                        }),
                        ..StartResponse::default()
                    });
                }
            }
        }

        let task_infos = match self.task_infos_by_ranges(&req.job_id, &req.ranges).await {
            Ok(infos) => infos,
            Err(err) => {
                tracing::error!(job_id = %req.job_id, error = %err, "failed to get tasks for job");
                self.metrics.record_api_call("start", false);
                return Ok(StartResponse {
                    error: Some(StartError::OutOfRange {
                        job_id: req.job_id,
                        instance_count: cached_config.instance_count,
                    }),
                    ..StartResponse::default()
                });
            }
        };

        let mut started_instance_ids = Vec::new();
        let mut invalid_instance_ids = Vec::new();

        for (&instance_id, _info) in &task_infos {
            let cached_task = match cached_job.add_task(instance_id).await {
                Ok(task) => task,
                Err(err) => {
                    tracing::info!(
                        job_id = %req.job_id,
                        instance_id,
                        error = %err,
                        "failed to add task during task start"
                    );
                    invalid_instance_ids.push(instance_id);
                    continue;
                }
            };

            let mut attempts = 0;
            loop {
                let runtime = match cached_task.get_runtime().await {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::info!(
                            job_id = %req.job_id,
                            instance_id,
                            error = %err,
                            "failed to fetch runtime during task start"
                        );
                        invalid_instance_ids.push(instance_id);
                        break;
                    }
                };

                // Only stopped tasks are startable.
                if runtime.goal_state != TaskState::Killed {
                    tracing::debug!(
                        job_id = %req.job_id,
                        instance_id,
                        goal_state = %runtime.goal_state,
                        "task was not stopped"
                    );
                    break;
                }

                let mut next = runtime;
                regenerate_run(
                    &req.job_id,
                    instance_id,
                    &mut next,
                    cached_config.health_check,
                );
                next.goal_state = default_task_goal_state(cached_config.job_type);
                next.message = "Task start API request".to_string();

                match cached_task
                    .compare_and_set_runtime(next, cached_config.job_type)
                    .await
                {
                    Ok(_) => {
                        started_instance_ids.push(instance_id);
                        break;
                    }
                    Err(err) if err.is_unexpected_version() => {
                        self.metrics.record_cas_conflict("task");
                        attempts += 1;
                        if attempts < self.config.max_concurrency_error_retry {
                            continue;
                        }
                        invalid_instance_ids.push(instance_id);
                        break;
                    }
                    Err(err) => {
                        tracing::info!(
                            job_id = %req.job_id,
                            instance_id,
                            error = %err,
                            "failed to write runtime during task start"
                        );
                        invalid_instance_ids.push(instance_id);
                        break;
                    }
                }
            }
        }

        for &instance_id in &started_instance_ids {
            self.driver
                .enqueue_task(&req.job_id, instance_id, Instant::now());
        }
        self.driver.enqueue_job_with_default_delay(&req.job_id);

        self.metrics.record_api_call("start", true);
        Ok(StartResponse {
            started_instance_ids,
            invalid_instance_ids,
            error: None,
        })
    }

    /// Stops tasks of a job. Stopping the whole job short-circuits into a
    /// single job-level goal flip.
    pub async fn stop(&self, req: StopRequest) -> Result<StopResponse> {
        let _timer = self.api_timer("stop");

        if !self.candidate.is_leader() {
            self.metrics.record_api_call("stop", false);
            return Err(Error::unavailable("Task Stop API not supported on non-leader"));
        }

        let timeout = self.config.rpc_timeout();
        with_deadline(timeout, "stop", self.stop_inner(req)).await
    }

    async fn stop_inner(&self, req: StopRequest) -> Result<StopResponse> {
        let cached_job = self.factory.add_job(&req.job_id);
        let cached_config = match cached_job.get_config().await {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(job_id = %req.job_id, error = %err, "failed to get job config");
                self.metrics.record_api_call("stop", false);
                return Ok(StopResponse {
                    error: Some(StopError::NotFound {
                        message: err.to_string(),
                        job_id: req.job_id,
                    }),
                    ..StopResponse::default()
                });
            }
        };

        let whole_job = req.ranges.is_empty()
            || (req.ranges.len() == 1 && req.ranges[0].covers_job(cached_config.instance_count));
        if whole_job {
            tracing::info!(job_id = %req.job_id, "stopping all tasks in the job");
            return Ok(self
                .stop_job(&req.job_id, cached_config.instance_count)
                .await);
        }

        let task_infos = match self.task_infos_by_ranges(&req.job_id, &req.ranges).await {
            Ok(infos) => infos,
            Err(err) => {
                tracing::error!(job_id = %req.job_id, error = %err, "failed to get tasks for job");
                self.metrics.record_api_call("stop", false);
                return Ok(StopResponse {
                    error: Some(StopError::OutOfRange {
                        job_id: req.job_id,
                        instance_count: cached_config.instance_count,
                    }),
                    ..StopResponse::default()
                });
            }
        };

        // Only tasks whose goal flips are part of the patch.
        let mut runtime_diffs: BTreeMap<u32, RuntimeDiff> = BTreeMap::new();
        for (&instance_id, info) in &task_infos {
            if info.runtime.goal_state == TaskState::Killed {
                continue;
            }
            runtime_diffs.insert(
                instance_id,
                RuntimeDiff {
                    goal_state: Some(TaskState::Killed),
                    message: Some("Task stop API request".to_string()),
                    reason: Some(String::new()),
                    termination_status: Some(Some(TerminationStatus {
                        reason: TerminationReason::KilledOnRequest,
                    })),
                    ..RuntimeDiff::default()
                },
            );
        }
        let instance_ids: Vec<u32> = runtime_diffs.keys().copied().collect();

        let patch_result = cached_job.patch_tasks(runtime_diffs).await;

        let (stopped_instance_ids, invalid_instance_ids) = match &patch_result {
            Ok(()) => {
                self.metrics.record_api_call("stop", true);
                (instance_ids, Vec::new())
            }
            Err(err) => {
                tracing::error!(
                    job_id = %req.job_id,
                    instance_ids = ?instance_ids,
                    error = %err,
                    "failed to update killed goal state"
                );
                self.metrics.record_api_call("stop", false);
                (Vec::new(), instance_ids)
            }
        };

        for &instance_id in &stopped_instance_ids {
            self.driver
                .enqueue_task(&req.job_id, instance_id, Instant::now());
        }
        self.driver.enqueue_job_with_default_delay(&req.job_id);

        if let Err(err) = patch_result {
            return Ok(StopResponse {
                stopped_instance_ids,
                invalid_instance_ids,
                error: Some(StopError::UpdateError {
                    message: format!("goal state update failed for {err}"),
                }),
            });
        }
        Ok(StopResponse {
            stopped_instance_ids,
            invalid_instance_ids,
            error: None,
        })
    }

    /// Stops a whole job with one CAS on the job runtime instead of a
    /// per-task fan-out.
    async fn stop_job(&self, job_id: &JobId, instance_count: u32) -> StopResponse {
        let instance_list: Vec<u32> = (0..instance_count).collect();
        let cached_job = self.factory.add_job(job_id);

        let mut attempts = 0;
        loop {
            let mut job_runtime = match cached_job.get_runtime().await {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::error!(job_id = %job_id, error = %err, "failed to get job runtime");
                    self.metrics.record_api_call("stop", false);
                    return StopResponse {
                        error: Some(StopError::UpdateError {
                            message: format!("job state fetch failed for {err}"),
                        }),
                        invalid_instance_ids: instance_list,
                        ..StopResponse::default()
                    };
                }
            };

            if job_runtime.goal_state == JobState::Killed {
                return StopResponse {
                    stopped_instance_ids: instance_list,
                    ..StopResponse::default()
                };
            }

            job_runtime.desired_state_version += 1;
            job_runtime.goal_state = JobState::Killed;

            match cached_job.compare_and_set_runtime(job_runtime).await {
                Ok(_) => break,
                Err(err) if err.is_unexpected_version() => {
                    self.metrics.record_cas_conflict("job");
                    attempts += 1;
                    if attempts < self.config.max_concurrency_error_retry {
                        continue;
                    }
                    tracing::error!(job_id = %job_id, error = %err, "failed to update job runtime");
                    self.metrics.record_api_call("stop", false);
                    return StopResponse {
                        error: Some(StopError::UpdateError {
                            message: format!("job state update failed for {err}"),
                        }),
                        invalid_instance_ids: instance_list,
                        ..StopResponse::default()
                    };
                }
                Err(err) => {
                    tracing::error!(job_id = %job_id, error = %err, "failed to update job runtime");
                    self.metrics.record_api_call("stop", false);
                    return StopResponse {
                        error: Some(StopError::UpdateError {
                            message: format!("job state update failed for {err}"),
                        }),
                        invalid_instance_ids: instance_list,
                        ..StopResponse::default()
                    };
                }
            }
        }

        self.driver.enqueue_job(job_id, Instant::now());

        self.metrics.record_api_call("stop", true);
        StopResponse {
            stopped_instance_ids: instance_list,
            ..StopResponse::default()
        }
    }

    /// Restarts tasks by bumping each selected task's desired run.
    pub async fn restart(&self, req: RestartRequest) -> Result<RestartResponse> {
        let _timer = self.api_timer("restart");

        if !self.candidate.is_leader() {
            self.metrics.record_api_call("restart", false);
            return Err(Error::unavailable(
                "Task Restart API not supported on non-leader",
            ));
        }

        let timeout = self.config.rpc_timeout();
        with_deadline(timeout, "restart", self.restart_inner(req)).await
    }

    async fn restart_inner(&self, req: RestartRequest) -> Result<RestartResponse> {
        let cached_job = self.factory.add_job(&req.job_id);

        let task_infos = match self.task_infos_by_ranges(&req.job_id, &req.ranges).await {
            Ok(infos) => infos,
            Err(err) => {
                self.metrics.record_api_call("restart", false);
                return Err(err);
            }
        };

        let mut runtime_diffs: BTreeMap<u32, RuntimeDiff> = BTreeMap::new();
        for (&instance_id, info) in &task_infos {
            // An unparseable pod id restarts from run 1.
            let run_id = info.runtime.pod_id.run_id();
            runtime_diffs.insert(
                instance_id,
                RuntimeDiff {
                    desired_pod_id: Some(PodId::new(&req.job_id, instance_id, run_id + 1)),
                    ..RuntimeDiff::default()
                },
            );
        }

        let instance_ids: Vec<u32> = runtime_diffs.keys().copied().collect();
        if let Err(err) = cached_job.patch_tasks(runtime_diffs).await {
            self.metrics.record_api_call("restart", false);
            return Err(err);
        }

        for instance_id in instance_ids {
            self.driver
                .enqueue_task(&req.job_id, instance_id, Instant::now());
        }

        self.metrics.record_api_call("restart", true);
        Ok(RestartResponse::default())
    }

    /// Reloads task runtimes from the store into the cache and enqueues
    /// everything for evaluation.
    pub async fn refresh(&self, req: RefreshRequest) -> Result<RefreshResponse> {
        let _timer = self.api_timer("refresh");

        if !self.candidate.is_leader() {
            self.metrics.record_api_call("refresh", false);
            return Err(Error::unavailable(
                "Task Refresh API not supported on non-leader",
            ));
        }

        let timeout = self.config.rpc_timeout();
        with_deadline(timeout, "refresh", self.refresh_inner(req)).await
    }

    async fn refresh_inner(&self, req: RefreshRequest) -> Result<RefreshResponse> {
        let job_config = match self.store.get_job_config(&req.job_id).await {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(job_id = %req.job_id, error = %err, "failed to load job config");
                self.metrics.record_api_call("refresh", false);
                return Err(Error::not_found("job", req.job_id.to_string()));
            }
        };

        let mut range = req
            .range
            .unwrap_or_else(|| InstanceRange::new(0, job_config.instance_count));
        range.to = range.to.min(job_config.instance_count);

        let runtimes = match self
            .store
            .get_task_runtimes_for_job_by_range(&req.job_id, range)
            .await
        {
            Ok(runtimes) if !runtimes.is_empty() => runtimes,
            Ok(_) | Err(_) => {
                tracing::error!(
                    job_id = %req.job_id,
                    range_from = range.from,
                    range_to = range.to,
                    "failed to load task runtimes"
                );
                self.metrics.record_api_call("refresh", false);
                return Err(Error::not_found("tasks", req.job_id.to_string()));
            }
        };

        let instance_ids: Vec<u32> = runtimes.keys().copied().collect();
        let cached_job = self.factory.add_job(&req.job_id);
        cached_job.replace_tasks(runtimes, true).await?;

        for instance_id in instance_ids {
            self.driver
                .enqueue_task(&req.job_id, instance_id, Instant::now());
        }
        self.driver.enqueue_job_with_default_delay(&req.job_id);

        self.metrics.record_api_call("refresh", true);
        Ok(RefreshResponse::default())
    }

    /// Walks the pod-event chain backwards, newest run first.
    pub async fn get_pod_events(
        &self,
        req: GetPodEventsRequest,
    ) -> Result<GetPodEventsResponse> {
        let _timer = self.api_timer("get_pod_events");

        // A specific run pins the walk to exactly that run.
        let limit = if req.pod_id.is_some() {
            1
        } else {
            match req.limit {
                Some(0) | None => DEFAULT_POD_EVENTS_LIMIT,
                Some(limit) => limit,
            }
        };

        let events = self
            .pod_events_chain(
                &req.job_id,
                req.instance_id,
                req.pod_id.as_ref(),
                Some(limit),
            )
            .await?;

        let result = events
            .iter()
            .map(PodEventInfo::try_from)
            .collect::<Result<Vec<_>>>()?;

        self.metrics.record_api_call("get_pod_events", true);
        Ok(GetPodEventsResponse { result })
    }

    /// Deletes the events of runs `[1, run_id]`.
    pub async fn delete_pod_events(&self, req: DeletePodEventsRequest) -> Result<()> {
        let _timer = self.api_timer("delete_pod_events");
        self.store
            .delete_pod_events(&req.job_id, req.instance_id, 1, req.run_id + 1)
            .await?;
        self.metrics.record_api_call("delete_pod_events", true);
        Ok(())
    }

    /// Reads a task runtime from the cache without touching the store.
    pub async fn get_cache(&self, req: GetCacheRequest) -> Result<GetCacheResponse> {
        let cached_job = self
            .factory
            .get_job(&req.job_id)
            .ok_or_else(|| Error::not_found("job cache entry", req.job_id.to_string()))?;
        let cached_task = cached_job
            .get_task(req.instance_id)
            .ok_or_else(|| Error::not_found("task cache entry", req.job_id.instance_name(req.instance_id)))?;
        let runtime = cached_task.cached_runtime()?.ok_or_else(|| {
            Error::not_found(
                "task runtime cache entry",
                req.job_id.instance_name(req.instance_id),
            )
        })?;
        Ok(GetCacheResponse { runtime })
    }

    /// Lists sandbox file paths of a run, with the agent and broker master
    /// endpoints needed to fetch them.
    pub async fn browse_sandbox(
        &self,
        req: BrowseSandboxRequest,
    ) -> Result<BrowseSandboxResponse> {
        let _timer = self.api_timer("browse_sandbox");

        let job_config = match self.job_config_without_filling_cache(&req.job_id).await {
            Ok(config) => config,
            Err(err) => {
                tracing::debug!(job_id = %req.job_id, error = %err, "failed to get job config");
                self.metrics.record_api_call("browse_sandbox", false);
                return Ok(BrowseSandboxResponse {
                    error: Some(BrowseSandboxError::NotFound {
                        message: format!("job {} not found, {err}", req.job_id),
                        job_id: req.job_id,
                    }),
                    ..BrowseSandboxResponse::default()
                });
            }
        };

        let (hostname, agent_id, pod_id) = match self.sandbox_path_info(&req).await {
            Ok(info) => info,
            Err(SandboxPathError::NoHistory) => {
                self.metrics.record_api_call("browse_sandbox", false);
                return Ok(BrowseSandboxResponse {
                    error: Some(BrowseSandboxError::OutOfRange {
                        job_id: req.job_id,
                        instance_count: job_config.instance_count,
                    }),
                    ..BrowseSandboxResponse::default()
                });
            }
            Err(SandboxPathError::NotRunning) => {
                self.metrics.record_api_call("browse_sandbox", false);
                return Ok(BrowseSandboxResponse {
                    error: Some(BrowseSandboxError::NotRunning {
                        message: "task has no hostname or agent id".to_string(),
                    }),
                    ..BrowseSandboxResponse::default()
                });
            }
        };

        let framework_id = match self.framework_id().await {
            Ok(framework_id) => framework_id,
            Err(err) => {
                tracing::error!(job_id = %req.job_id, error = %err, "failed to get framework id");
                self.metrics.record_api_call("browse_sandbox", false);
                return Ok(BrowseSandboxResponse {
                    error: Some(BrowseSandboxError::Failure {
                        message: err.to_string(),
                    }),
                    ..BrowseSandboxResponse::default()
                });
            }
        };

        // Prefer the agent's address over its hostname; the hostname may
        // not be resolvable from here.
        let mut agent_ip = hostname.clone();
        let mut agent_port = DEFAULT_AGENT_PORT.to_string();
        match self.hostmgr.agent_info(&hostname).await {
            Ok(Some(agent)) => {
                if let Ok((ip, port)) = extract_ip_port_from_agent_pid(&agent.pid) {
                    agent_ip = ip;
                    if let Some(port) = port {
                        agent_port = port;
                    }
                }
            }
            Ok(None) | Err(_) => {
                tracing::info!(hostname = %hostname, "could not get broker agent info");
            }
        }

        tracing::debug!(
            hostname = %hostname,
            ip_address = %agent_ip,
            port = %agent_port,
            agent_id = %agent_id,
            pod_id = %pod_id,
            framework_id = %framework_id,
            "listing sandbox files"
        );

        let paths = match self
            .log_manager
            .list_sandbox_files_paths(
                &self.config.agent_work_dir,
                &framework_id,
                &agent_ip,
                &agent_port,
                &agent_id,
                pod_id.as_str(),
            )
            .await
        {
            Ok(paths) => paths,
            Err(err) => {
                tracing::error!(
                    hostname = %hostname,
                    agent_id = %agent_id,
                    framework_id = %framework_id,
                    error = %err,
                    "failed to list sandbox file paths"
                );
                self.metrics.record_api_call("browse_sandbox", false);
                return Ok(BrowseSandboxResponse {
                    error: Some(BrowseSandboxError::Failure {
                        message: format!("sandbox listing failed on host {hostname} due to: {err}"),
                    }),
                    ..BrowseSandboxResponse::default()
                });
            }
        };

        let master = match self.hostmgr.master_host_port().await {
            Ok(master) => master,
            Err(err) => {
                tracing::error!(error = %err, "failed to get broker master endpoint");
                self.metrics.record_api_call("browse_sandbox", false);
                return Ok(BrowseSandboxResponse {
                    error: Some(BrowseSandboxError::Failure {
                        message: err.to_string(),
                    }),
                    ..BrowseSandboxResponse::default()
                });
            }
        };

        self.metrics.record_api_call("browse_sandbox", true);
        Ok(BrowseSandboxResponse {
            hostname: agent_ip,
            port: agent_port,
            paths,
            master_hostname: master.hostname,
            master_port: master.port,
            error: None,
        })
    }

    // --- Helpers ---

    /// Reads a job config through the cache when resident, otherwise from
    /// the store, without inserting a cache entry.
    ///
    /// Read paths must not populate the cache: nothing would ever untrack
    /// jobs that only ever get read.
    async fn job_config_without_filling_cache(&self, job_id: &JobId) -> Result<JobConfig> {
        match self.factory.get_job(job_id) {
            Some(cached_job) => cached_job.get_config().await,
            None => self.store.get_job_config(job_id).await,
        }
    }

    /// Reads a job runtime the same way.
    async fn job_runtime_without_filling_cache(&self, job_id: &JobId) -> Result<JobRuntime> {
        match self.factory.get_job(job_id) {
            Some(cached_job) => cached_job.get_runtime().await,
            None => self.store.get_job_runtime(job_id).await,
        }
    }

    /// Resolves task infos for a set of ranges; no ranges means the whole
    /// job.
    async fn task_infos_by_ranges(
        &self,
        job_id: &JobId,
        ranges: &[InstanceRange],
    ) -> Result<BTreeMap<u32, TaskInfo>> {
        if ranges.is_empty() {
            return self.store.get_tasks_for_job(job_id).await;
        }

        let mut task_infos = BTreeMap::new();
        for range in ranges {
            let mut range = *range;
            if range.from > range.to {
                return Err(Error::invalid_argument(format!(
                    "malformed instance range [{}, {})",
                    range.from, range.to
                )));
            }
            // Instance ids are 32-bit on the wire but the store indexes them
            // as signed; clamp instead of handing it an overflowing bound.
            range.to = range.to.min(u32::try_from(i32::MAX).unwrap_or(u32::MAX));
            let tasks = self.store.get_tasks_for_job_by_range(job_id, range).await?;
            task_infos.extend(tasks);
        }
        Ok(task_infos)
    }

    /// Annotates PENDING tasks with the reason the resource manager is
    /// still holding them. Best effort.
    async fn fill_pending_reasons<'a>(
        &self,
        job_id: &JobId,
        tasks: impl Iterator<Item = &'a mut TaskInfo>,
    ) {
        let pending: Vec<&'a mut TaskInfo> = tasks
            .filter(|info| info.runtime.state == TaskState::Pending)
            .collect();
        if pending.is_empty() {
            return;
        }

        match self.resmgr.get_active_tasks(job_id).await {
            Ok(active) => {
                for info in pending {
                    let name = job_id.instance_name(info.instance_id);
                    if let Some(entry) = active.get(&name) {
                        info.runtime.reason = entry.reason.clone();
                    }
                }
            }
            Err(err) => {
                tracing::debug!(job_id = %job_id, error = %err, "failed to get active tasks");
            }
        }
    }

    /// Walks the pod-event chain backwards from `start` (or the latest
    /// run), at most `limit` runs, stopping when the previous run decodes
    /// to 0.
    async fn pod_events_chain(
        &self,
        job_id: &JobId,
        instance_id: u32,
        start: Option<&PodId>,
        limit: Option<u64>,
    ) -> Result<Vec<PodEvent>> {
        let mut events = Vec::new();
        let mut pod_id: Option<PodId> = start.cloned();
        let mut runs = 0u64;

        loop {
            if limit.is_some_and(|limit| runs >= limit) {
                break;
            }

            let batch = self
                .store
                .get_pod_events(job_id, instance_id, pod_id.as_ref())
                .await?;
            let Some(newest) = batch.first() else {
                break;
            };

            let prev_pod_id = newest.prev_pod_id.clone();
            events.extend(batch);
            runs += 1;

            // Run 0 marks the end of history.
            if prev_pod_id.run_id() == 0 {
                break;
            }
            pod_id = Some(prev_pod_id);
        }

        Ok(events)
    }

    /// Resolves `(hostname, agent_id, pod_id)` for the sandbox of a run.
    async fn sandbox_path_info(
        &self,
        req: &BrowseSandboxRequest,
    ) -> std::result::Result<(String, String, PodId), SandboxPathError> {
        if let Some(pod_id) = &req.pod_id {
            // Historical run: prefer the terminal event of its chain.
            let events = self
                .pod_events_chain(&req.job_id, req.instance_id, Some(pod_id), None)
                .await
                .map_err(|_| SandboxPathError::NoHistory)?;
            let Some(first) = events.first() else {
                return Err(SandboxPathError::NoHistory);
            };
            let event = events.iter().find(|e| e.is_terminal()).unwrap_or(first);
            match (&event.hostname, &event.agent_id) {
                (Some(hostname), Some(agent_id))
                    if !hostname.is_empty() && !agent_id.is_empty() =>
                {
                    Ok((hostname.clone(), agent_id.clone(), pod_id.clone()))
                }
                _ => Err(SandboxPathError::NotRunning),
            }
        } else {
            let mut tasks = self
                .store
                .get_task_for_job(&req.job_id, req.instance_id)
                .await
                .map_err(|_| SandboxPathError::NoHistory)?;
            let Some(info) = tasks.remove(&req.instance_id) else {
                return Err(SandboxPathError::NoHistory);
            };
            match (&info.runtime.host, &info.runtime.agent_id) {
                (Some(hostname), Some(agent_id))
                    if !hostname.is_empty() && !agent_id.is_empty() =>
                {
                    Ok((
                        hostname.clone(),
                        agent_id.clone(),
                        info.runtime.pod_id.clone(),
                    ))
                }
                _ => Err(SandboxPathError::NotRunning),
            }
        }
    }

    /// The framework id this orchestrator registered under; empty
    /// registrations are an error.
    async fn framework_id(&self) -> Result<String> {
        let framework_id = self
            .store
            .get_framework_id(&self.config.framework_name)
            .await?;
        if framework_id.is_empty() {
            return Err(Error::internal("framework id is empty"));
        }
        Ok(framework_id)
    }

    fn api_timer(&self, operation: &'static str) -> TimingGuard<impl FnOnce(std::time::Duration)> {
        let metrics = self.metrics.clone();
        TimingGuard::new(move |duration| metrics.observe_api_duration(operation, duration))
    }
}

/// Why a sandbox path could not be resolved.
enum SandboxPathError {
    /// No task record or pod events exist.
    NoHistory,
    /// The run was never placed on an agent.
    NotRunning,
}

/// Runs a write-RPC body under the configured deadline.
async fn with_deadline<T, F>(
    timeout: std::time::Duration,
    operation: &'static str,
    body: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, body).await {
        Ok(result) => result,
        Err(_) => Err(Error::deadline_exceeded(format!(
            "{operation} exceeded the rpc deadline"
        ))),
    }
}

/// Synthesizes one task record per terminal event in a run's history.
fn terminal_task_infos(events: &[PodEvent], last_task_info: &TaskInfo) -> Vec<TaskInfo> {
    events
        .iter()
        .filter(|event| event.is_terminal())
        .map(|event| {
            let mut runtime = last_task_info.runtime.clone();
            runtime.state = event.actual_state;
            runtime.pod_id = event.pod_id.clone();
            runtime.prev_pod_id = event.prev_pod_id.clone();
            runtime.host = event.hostname.clone();
            runtime.agent_id = event.agent_id.clone();
            runtime.message = event.message.clone();
            runtime.reason = event.reason.clone();
            TaskInfo {
                job_id: last_task_info.job_id.clone(),
                instance_id: last_task_info.instance_id,
                runtime,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_infos_filter_terminal_events() {
        let job_id = JobId::new("j1");
        let last = TaskInfo {
            job_id: job_id.clone(),
            instance_id: 0,
            runtime: TaskRuntime::initialized(&job_id, 0, TaskState::Running),
        };

        let mut running = PodEvent::from_runtime(&last.runtime);
        running.actual_state = TaskState::Running;
        let mut failed = PodEvent::from_runtime(&last.runtime);
        failed.actual_state = TaskState::Failed;
        failed.message = "exit 1".to_string();

        let infos = terminal_task_infos(&[running, failed], &last);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].runtime.state, TaskState::Failed);
        assert_eq!(infos[0].runtime.message, "exit 1");
    }
}
