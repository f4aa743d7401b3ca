//! Task-level state, runtime records, and field-level runtime diffs.
//!
//! This module provides:
//! - `TaskState`: the task state machine shared by actual and goal states
//! - `TaskRuntime`: the versioned record mutated through compare-and-set
//! - `RuntimeDiff`: a partial update merged into a runtime, unset fields
//!   preserved
//! - `regenerate_run`: resets a runtime for a fresh run of the instance

use serde::{Deserialize, Serialize};

use echelon_core::{JobId, PodId};

use crate::job::JobType;

/// Task lifecycle states.
///
/// Both the observed state and the goal state draw from this enum; goal
/// states are restricted to `{Running, Killed, Succeeded, Failed, Deleted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Run created, nothing scheduled yet.
    Initialized,
    /// Waiting for placement by the delegated resource manager.
    Pending,
    /// Placed and handed to an agent, awaiting start.
    Launched,
    /// Agent acknowledged the launch, task is coming up.
    Starting,
    /// Actively executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Exited with a failure.
    Failed,
    /// The agent or its task disappeared.
    Lost,
    /// A kill has been issued and is in flight.
    Killing,
    /// Stopped.
    Killed,
    /// Removed; history may still be queried.
    Deleted,
}

impl TaskState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Lost | Self::Killed | Self::Deleted
        )
    }

    /// Returns true if this state may serve as a goal state.
    #[must_use]
    pub const fn is_goal_state(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Killed | Self::Succeeded | Self::Failed | Self::Deleted
        )
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Pending => "pending",
            Self::Launched => "launched",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Lost => "lost",
            Self::Killing => "killing",
            Self::Killed => "killed",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The goal state a freshly (re)started task converges to, by job type.
#[must_use]
pub const fn default_task_goal_state(job_type: JobType) -> TaskState {
    match job_type {
        JobType::Batch => TaskState::Succeeded,
        JobType::Service => TaskState::Running,
    }
}

/// Health of a running task as reported by its health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    /// No health information is applicable.
    #[default]
    Invalid,
    /// Health checks are not configured for this task.
    Disabled,
    /// Health checks are configured but no result has arrived yet.
    HealthUnknown,
    /// The last health check passed.
    Healthy,
    /// The last health check failed.
    Unhealthy,
}

/// The initial health of a fresh run.
#[must_use]
pub const fn initial_health_state(health_check: bool) -> HealthState {
    if health_check {
        HealthState::HealthUnknown
    } else {
        HealthState::Disabled
    }
}

/// Why a task reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    /// An operator or API client requested the kill.
    KilledOnRequest,
    /// The task exited on its own with a failure.
    Failed,
}

/// Terminal disposition attached to a stopped or failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationStatus {
    /// Why the run terminated.
    pub reason: TerminationReason,
}

/// Observed + desired state of one task instance.
///
/// The record is versioned: every store write bumps `revision`, and writers
/// must present the revision they read (compare-and-set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRuntime {
    /// Current state.
    pub state: TaskState,
    /// State the task must be reconciled to.
    pub goal_state: TaskState,
    /// Identifier of the current run.
    pub pod_id: PodId,
    /// Identifier of the previous run; empty for the first run.
    pub prev_pod_id: PodId,
    /// Run the task should be brought to; a bump past `pod_id` requests a
    /// restart.
    pub desired_pod_id: PodId,
    /// Host the run was placed on, once placed.
    pub host: Option<String>,
    /// Agent the run was placed on, once placed.
    pub agent_id: Option<String>,
    /// Human-readable note from the last transition.
    pub message: String,
    /// Machine-readable reason from the last transition.
    pub reason: String,
    /// Job configuration version this run was launched with.
    pub config_version: u64,
    /// Job configuration version this run should converge to.
    pub desired_config_version: u64,
    /// Health of the current run.
    pub healthy: HealthState,
    /// Terminal disposition, when the run has ended.
    pub termination_status: Option<TerminationStatus>,
    /// Optimistic-concurrency revision; every store write bumps it.
    pub revision: u64,
}

impl TaskRuntime {
    /// A fresh runtime for the first run of an instance.
    #[must_use]
    pub fn initialized(job_id: &JobId, instance_id: u32, goal_state: TaskState) -> Self {
        Self {
            state: TaskState::Initialized,
            goal_state,
            pod_id: PodId::new(job_id, instance_id, 1),
            prev_pod_id: PodId::default(),
            desired_pod_id: PodId::new(job_id, instance_id, 1),
            host: None,
            agent_id: None,
            message: String::new(),
            reason: String::new(),
            config_version: 1,
            desired_config_version: 1,
            healthy: HealthState::Invalid,
            termination_status: None,
            revision: 1,
        }
    }
}

/// Resets a runtime for a fresh run of the instance.
///
/// The new run id is one past the current one; placement, messages, and
/// termination disposition are cleared, and health restarts from the
/// configured initial state. The caller still owns writing the result back
/// through compare-and-set.
pub fn regenerate_run(
    job_id: &JobId,
    instance_id: u32,
    runtime: &mut TaskRuntime,
    health_check: bool,
) {
    let next = runtime.pod_id.next_run(job_id, instance_id);
    runtime.prev_pod_id = runtime.pod_id.clone();
    runtime.pod_id = next.clone();
    runtime.desired_pod_id = next;
    runtime.state = TaskState::Initialized;
    runtime.host = None;
    runtime.agent_id = None;
    runtime.message = String::new();
    runtime.reason = String::new();
    runtime.healthy = initial_health_state(health_check);
    runtime.termination_status = None;
}

/// A task together with its owning job and slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// The owning job.
    pub job_id: JobId,
    /// The slot within the job, in `[0, instance_count)`.
    pub instance_id: u32,
    /// The task's runtime record.
    pub runtime: TaskRuntime,
}

/// A half-open range `[from, to)` of instance ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRange {
    /// Inclusive lower bound.
    pub from: u32,
    /// Exclusive upper bound.
    pub to: u32,
}

impl InstanceRange {
    /// Creates a range covering `[from, to)`.
    #[must_use]
    pub const fn new(from: u32, to: u32) -> Self {
        Self { from, to }
    }

    /// Returns true when `instance_id` falls inside the range.
    #[must_use]
    pub const fn contains(&self, instance_id: u32) -> bool {
        self.from <= instance_id && instance_id < self.to
    }

    /// Returns true when the range covers every slot of a job with
    /// `instance_count` instances.
    #[must_use]
    pub const fn covers_job(&self, instance_count: u32) -> bool {
        self.from == 0 && self.to >= instance_count
    }
}

/// A field-level partial update to a [`TaskRuntime`].
///
/// Unset fields are preserved on apply. Applying a diff never touches the
/// revision; that is the store's job on write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeDiff {
    /// New current state.
    pub state: Option<TaskState>,
    /// New goal state.
    pub goal_state: Option<TaskState>,
    /// New current-run identifier.
    pub pod_id: Option<PodId>,
    /// New desired-run identifier.
    pub desired_pod_id: Option<PodId>,
    /// New placement host.
    pub host: Option<Option<String>>,
    /// New placement agent.
    pub agent_id: Option<Option<String>>,
    /// New transition note.
    pub message: Option<String>,
    /// New transition reason.
    pub reason: Option<String>,
    /// New health state.
    pub healthy: Option<HealthState>,
    /// New terminal disposition.
    pub termination_status: Option<Option<TerminationStatus>>,
}

impl RuntimeDiff {
    /// Returns true when the diff carries no changes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.goal_state.is_none()
            && self.pod_id.is_none()
            && self.desired_pod_id.is_none()
            && self.host.is_none()
            && self.agent_id.is_none()
            && self.message.is_none()
            && self.reason.is_none()
            && self.healthy.is_none()
            && self.termination_status.is_none()
    }

    /// Merges the diff into `runtime`, preserving unset fields.
    pub fn apply_to(&self, runtime: &mut TaskRuntime) {
        if let Some(state) = self.state {
            runtime.state = state;
        }
        if let Some(goal_state) = self.goal_state {
            runtime.goal_state = goal_state;
        }
        if let Some(pod_id) = &self.pod_id {
            runtime.pod_id = pod_id.clone();
        }
        if let Some(desired_pod_id) = &self.desired_pod_id {
            runtime.desired_pod_id = desired_pod_id.clone();
        }
        if let Some(host) = &self.host {
            runtime.host = host.clone();
        }
        if let Some(agent_id) = &self.agent_id {
            runtime.agent_id = agent_id.clone();
        }
        if let Some(message) = &self.message {
            runtime.message = message.clone();
        }
        if let Some(reason) = &self.reason {
            runtime.reason = reason.clone();
        }
        if let Some(healthy) = self.healthy {
            runtime.healthy = healthy;
        }
        if let Some(termination_status) = self.termination_status {
            runtime.termination_status = termination_status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> TaskRuntime {
        TaskRuntime::initialized(&JobId::new("j1"), 0, TaskState::Running)
    }

    #[test]
    fn terminal_states() {
        for state in [
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::Lost,
            TaskState::Killed,
            TaskState::Deleted,
        ] {
            assert!(state.is_terminal(), "{state} should be terminal");
        }
        for state in [
            TaskState::Initialized,
            TaskState::Pending,
            TaskState::Running,
            TaskState::Killing,
        ] {
            assert!(!state.is_terminal(), "{state} should not be terminal");
        }
    }

    #[test]
    fn goal_state_vocabulary() {
        assert!(TaskState::Running.is_goal_state());
        assert!(TaskState::Killed.is_goal_state());
        assert!(TaskState::Deleted.is_goal_state());
        assert!(!TaskState::Pending.is_goal_state());
        assert!(!TaskState::Killing.is_goal_state());
    }

    #[test]
    fn diff_preserves_unset_fields() {
        let mut rt = runtime();
        rt.host = Some("host-a".to_string());
        rt.message = "placed".to_string();

        let diff = RuntimeDiff {
            goal_state: Some(TaskState::Killed),
            message: Some("stop requested".to_string()),
            ..RuntimeDiff::default()
        };
        diff.apply_to(&mut rt);

        assert_eq!(rt.goal_state, TaskState::Killed);
        assert_eq!(rt.message, "stop requested");
        assert_eq!(rt.host.as_deref(), Some("host-a"));
        assert_eq!(rt.state, TaskState::Initialized);
    }

    #[test]
    fn diff_can_clear_optional_fields() {
        let mut rt = runtime();
        rt.host = Some("host-a".to_string());

        let diff = RuntimeDiff {
            host: Some(None),
            ..RuntimeDiff::default()
        };
        diff.apply_to(&mut rt);
        assert!(rt.host.is_none());
    }

    #[test]
    fn regenerate_bumps_run_and_clears_placement() {
        let job = JobId::new("j1");
        let mut rt = runtime();
        rt.state = TaskState::Killed;
        rt.host = Some("host-a".to_string());
        rt.agent_id = Some("agent-a".to_string());
        rt.termination_status = Some(TerminationStatus {
            reason: TerminationReason::KilledOnRequest,
        });

        regenerate_run(&job, 0, &mut rt, true);

        assert_eq!(rt.pod_id.run_id(), 2);
        assert_eq!(rt.prev_pod_id.run_id(), 1);
        assert_eq!(rt.desired_pod_id, rt.pod_id);
        assert_eq!(rt.state, TaskState::Initialized);
        assert!(rt.host.is_none());
        assert!(rt.agent_id.is_none());
        assert_eq!(rt.healthy, HealthState::HealthUnknown);
        assert!(rt.termination_status.is_none());
    }

    #[test]
    fn range_coverage() {
        let range = InstanceRange::new(0, 100);
        assert!(range.covers_job(100));
        assert!(range.covers_job(50));
        assert!(!InstanceRange::new(1, 100).covers_job(100));
        assert!(range.contains(0));
        assert!(!range.contains(100));
    }
}
