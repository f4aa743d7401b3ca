//! Action selection for the goal-state driver.
//!
//! Reconciliation is a dispatch table keyed by `(current state, goal
//! state)`: selection is pure and deterministic, execution lives in the
//! driver. New behaviors are added by extending the tables, not by
//! subclassing anything.

use std::time::Duration;

use crate::error::Error;
use crate::job::{JobRuntime, JobState};
use crate::task::{TaskRuntime, TaskState};

/// What to do with a task whose current and goal state diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Current state satisfies the goal.
    NoAction,
    /// Hand the run to placement (Initialized -> Pending).
    Start,
    /// Bring the run down (active -> Killing -> Killed).
    Stop,
    /// Regenerate a fresh run for a terminal task that must run again.
    Initialize,
}

impl TaskAction {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NoAction => "noop",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Initialize => "initialize",
        }
    }
}

/// What to do with a job whose current and goal state diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    /// Current state satisfies the goal.
    NoAction,
    /// Fan a kill out to every task whose goal is not yet Killed.
    Kill,
    /// Recompute the job state from its task states.
    UpdateRuntime,
}

impl JobAction {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NoAction => "noop",
            Self::Kill => "kill",
            Self::UpdateRuntime => "update_runtime",
        }
    }
}

/// How an executed action terminated.
#[derive(Debug)]
pub enum ActionOutcome {
    /// Converged; no re-enqueue needed.
    Done,
    /// Re-evaluate after a delay (stale read, kill in flight, ...).
    Retry(Duration),
    /// The action failed; re-enqueue with exponential backoff.
    Failed(Error),
}

impl ActionOutcome {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Retry(_) => "retry",
            Self::Failed(_) => "failed",
        }
    }
}

/// Selects the task action for a runtime snapshot.
///
/// Stale snapshots are fine: every action re-reads through the cache and
/// writes with compare-and-set, so a wrong pick only costs a retry.
#[must_use]
pub fn select_task_action(runtime: &TaskRuntime) -> TaskAction {
    let restart_requested = runtime.desired_pod_id.run_id() > runtime.pod_id.run_id();

    match runtime.goal_state {
        // Terminal goals converge by bringing the run down.
        TaskState::Killed | TaskState::Deleted | TaskState::Failed => {
            if runtime.state.is_terminal() {
                TaskAction::NoAction
            } else {
                TaskAction::Stop
            }
        }
        TaskState::Running | TaskState::Succeeded => {
            if restart_requested {
                // The old run must be gone before the new one exists.
                if runtime.state.is_terminal() {
                    TaskAction::Initialize
                } else {
                    TaskAction::Stop
                }
            } else {
                match runtime.state {
                    TaskState::Initialized => TaskAction::Start,
                    // A service instance that died gets a fresh run.
                    TaskState::Failed | TaskState::Lost
                        if runtime.goal_state == TaskState::Running =>
                    {
                        TaskAction::Initialize
                    }
                    _ => TaskAction::NoAction,
                }
            }
        }
        _ => TaskAction::NoAction,
    }
}

/// Selects the job action for a runtime snapshot.
#[must_use]
pub fn select_job_action(runtime: &JobRuntime) -> JobAction {
    if runtime.goal_state == JobState::Killed
        && !matches!(runtime.state, JobState::Killing | JobState::Killed)
    {
        return JobAction::Kill;
    }
    if runtime.state.is_terminal() && runtime.state == runtime.goal_state {
        return JobAction::NoAction;
    }
    JobAction::UpdateRuntime
}

#[cfg(test)]
mod tests {
    use super::*;
    use echelon_core::{JobId, PodId};

    fn task_runtime(state: TaskState, goal: TaskState) -> TaskRuntime {
        let mut runtime = TaskRuntime::initialized(&JobId::new("j1"), 0, goal);
        runtime.state = state;
        runtime
    }

    #[test]
    fn stop_for_active_task_with_killed_goal() {
        for state in [
            TaskState::Initialized,
            TaskState::Pending,
            TaskState::Running,
            TaskState::Killing,
        ] {
            let runtime = task_runtime(state, TaskState::Killed);
            assert_eq!(select_task_action(&runtime), TaskAction::Stop);
        }
    }

    #[test]
    fn terminal_task_with_killed_goal_is_converged() {
        let runtime = task_runtime(TaskState::Killed, TaskState::Killed);
        assert_eq!(select_task_action(&runtime), TaskAction::NoAction);
    }

    #[test]
    fn failed_goal_drives_active_task_down() {
        let runtime = task_runtime(TaskState::Running, TaskState::Failed);
        assert_eq!(select_task_action(&runtime), TaskAction::Stop);

        let runtime = task_runtime(TaskState::Failed, TaskState::Failed);
        assert_eq!(select_task_action(&runtime), TaskAction::NoAction);

        let runtime = task_runtime(TaskState::Killed, TaskState::Failed);
        assert_eq!(select_task_action(&runtime), TaskAction::NoAction);
    }

    #[test]
    fn start_for_initialized_task() {
        let runtime = task_runtime(TaskState::Initialized, TaskState::Running);
        assert_eq!(select_task_action(&runtime), TaskAction::Start);
    }

    #[test]
    fn restart_initializes_once_old_run_is_down() {
        let job_id = JobId::new("j1");
        let mut runtime = task_runtime(TaskState::Running, TaskState::Running);
        runtime.desired_pod_id = PodId::new(&job_id, 0, 2);
        assert_eq!(select_task_action(&runtime), TaskAction::Stop);

        runtime.state = TaskState::Killed;
        assert_eq!(select_task_action(&runtime), TaskAction::Initialize);
    }

    #[test]
    fn dead_service_instance_is_reinitialized() {
        let runtime = task_runtime(TaskState::Failed, TaskState::Running);
        assert_eq!(select_task_action(&runtime), TaskAction::Initialize);

        // Batch goals do not resurrect failed instances.
        let runtime = task_runtime(TaskState::Failed, TaskState::Succeeded);
        assert_eq!(select_task_action(&runtime), TaskAction::NoAction);
    }

    #[test]
    fn job_kill_fan_out() {
        let mut runtime = JobRuntime::initialized(JobState::Running);
        runtime.state = JobState::Running;
        runtime.goal_state = JobState::Killed;
        assert_eq!(select_job_action(&runtime), JobAction::Kill);

        runtime.state = JobState::Killing;
        assert_eq!(select_job_action(&runtime), JobAction::UpdateRuntime);

        runtime.state = JobState::Killed;
        assert_eq!(select_job_action(&runtime), JobAction::NoAction);
    }

    #[test]
    fn converged_job_is_noop() {
        let mut runtime = JobRuntime::initialized(JobState::Succeeded);
        runtime.state = JobState::Succeeded;
        assert_eq!(select_job_action(&runtime), JobAction::NoAction);

        runtime.state = JobState::Running;
        assert_eq!(select_job_action(&runtime), JobAction::UpdateRuntime);
    }
}
