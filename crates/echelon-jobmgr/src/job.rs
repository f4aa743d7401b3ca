//! Job-level state, configuration, and runtime records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The scheduling class of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Runs each instance to completion once.
    Batch,
    /// Keeps each instance running indefinitely.
    Service,
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created but not yet evaluated by the goal-state driver.
    Initialized,
    /// At least one task is awaiting placement or launch.
    Pending,
    /// At least one task is running.
    Running,
    /// All instances completed successfully.
    Succeeded,
    /// At least one instance failed terminally.
    Failed,
    /// A stop has been requested and tasks are being brought down.
    Killing,
    /// All instances were stopped.
    Killed,
}

impl JobState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Killing => "killing",
            Self::Killed => "killed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The goal state a freshly (re)started job converges to, by type.
#[must_use]
pub const fn default_job_goal_state(job_type: JobType) -> JobState {
    match job_type {
        JobType::Batch => JobState::Succeeded,
        JobType::Service => JobState::Running,
    }
}

/// Declared shape of a job, owned by the external job service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Number of task slots, indexed `[0, instance_count)`.
    pub instance_count: u32,
    /// Scheduling class.
    pub job_type: JobType,
    /// Version of this configuration in the store.
    pub config_version: u64,
    /// Whether instances of this job carry a health check.
    pub health_check: bool,
}

/// Observed + desired state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRuntime {
    /// Current state, derived from task states by the goal-state driver.
    pub state: JobState,
    /// State the job must be reconciled to.
    pub goal_state: JobState,
    /// Bumped on every goal-state change so reconcilers can detect races.
    pub desired_state_version: u64,
    /// Optimistic-concurrency revision; every store write bumps it.
    pub revision: u64,
    /// Timestamp of the last runtime write.
    pub update_time: DateTime<Utc>,
}

impl JobRuntime {
    /// A fresh runtime for a job that has not been evaluated yet.
    #[must_use]
    pub fn initialized(goal_state: JobState) -> Self {
        Self {
            state: JobState::Initialized,
            goal_state,
            desired_state_version: 1,
            revision: 1,
            update_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Killed.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Killing.is_terminal());
    }

    #[test]
    fn default_goal_state_by_type() {
        assert_eq!(default_job_goal_state(JobType::Batch), JobState::Succeeded);
        assert_eq!(default_job_goal_state(JobType::Service), JobState::Running);
    }
}
