//! Observability metrics for the job manager.
//!
//! Metrics are exported through the `metrics` crate facade and are designed
//! to support:
//!
//! - **Alerting**: failure-rate alerts per TaskManager operation
//! - **Dashboards**: watch-client occupancy and goal-state queue depth
//! - **Debugging**: CAS conflict rates per entity kind
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `echelon_jobmgr_task_api_total` | Counter | `operation`, `result` | TaskManager calls by outcome |
//! | `echelon_jobmgr_task_api_duration_seconds` | Histogram | `operation` | TaskManager handler latency |
//! | `echelon_jobmgr_watch_clients` | Gauge | `kind` | Registered watch clients |
//! | `echelon_jobmgr_watch_events_total` | Counter | `kind`, `result` | Watch notifications by disposition |
//! | `echelon_jobmgr_goalstate_queue_depth` | Gauge | - | Entities waiting for reconciliation |
//! | `echelon_jobmgr_goalstate_actions_total` | Counter | `entity`, `action`, `outcome` | Reconciliation actions executed |
//! | `echelon_jobmgr_cas_conflicts_total` | Counter | `entity` | Optimistic-concurrency conflicts |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: TaskManager calls by operation and outcome.
    pub const TASK_API_TOTAL: &str = "echelon_jobmgr_task_api_total";
    /// Histogram: TaskManager handler latency in seconds.
    pub const TASK_API_DURATION_SECONDS: &str = "echelon_jobmgr_task_api_duration_seconds";
    /// Gauge: registered watch clients.
    pub const WATCH_CLIENTS: &str = "echelon_jobmgr_watch_clients";
    /// Counter: watch notifications by disposition.
    pub const WATCH_EVENTS_TOTAL: &str = "echelon_jobmgr_watch_events_total";
    /// Gauge: entities waiting for reconciliation.
    pub const GOALSTATE_QUEUE_DEPTH: &str = "echelon_jobmgr_goalstate_queue_depth";
    /// Counter: reconciliation actions executed.
    pub const GOALSTATE_ACTIONS_TOTAL: &str = "echelon_jobmgr_goalstate_actions_total";
    /// Counter: optimistic-concurrency conflicts observed.
    pub const CAS_CONFLICTS_TOTAL: &str = "echelon_jobmgr_cas_conflicts_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// TaskManager operation name (get, start, stop, ...).
    pub const OPERATION: &str = "operation";
    /// Outcome (success, failure; delivered, overflow for watch events).
    pub const RESULT: &str = "result";
    /// Watch client kind (task, job).
    pub const KIND: &str = "kind";
    /// Reconciled entity kind (job, task).
    pub const ENTITY: &str = "entity";
    /// Goal-state action name.
    pub const ACTION: &str = "action";
    /// Action outcome (done, retry, failed).
    pub const OUTCOME: &str = "outcome";
}

/// High-level interface for recording job manager metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct JobmgrMetrics;

impl JobmgrMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a TaskManager call outcome.
    pub fn record_api_call(&self, operation: &'static str, success: bool) {
        counter!(
            names::TASK_API_TOTAL,
            labels::OPERATION => operation,
            labels::RESULT => if success { "success" } else { "failure" },
        )
        .increment(1);
    }

    /// Records TaskManager handler latency.
    pub fn observe_api_duration(&self, operation: &'static str, duration: Duration) {
        histogram!(
            names::TASK_API_DURATION_SECONDS,
            labels::OPERATION => operation,
        )
        .record(duration.as_secs_f64());
    }

    /// Sets the registered watch client count for a kind.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_watch_clients(&self, kind: &'static str, count: usize) {
        gauge!(names::WATCH_CLIENTS, labels::KIND => kind).set(count as f64);
    }

    /// Records the disposition of one watch notification.
    pub fn record_watch_event(&self, kind: &'static str, result: &'static str) {
        counter!(
            names::WATCH_EVENTS_TOTAL,
            labels::KIND => kind,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Sets the goal-state queue depth.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_goalstate_queue_depth(&self, depth: usize) {
        gauge!(names::GOALSTATE_QUEUE_DEPTH).set(depth as f64);
    }

    /// Records one executed goal-state action.
    pub fn record_goalstate_action(
        &self,
        entity: &'static str,
        action: &'static str,
        outcome: &'static str,
    ) {
        counter!(
            names::GOALSTATE_ACTIONS_TOTAL,
            labels::ENTITY => entity,
            labels::ACTION => action,
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records an optimistic-concurrency conflict.
    pub fn record_cas_conflict(&self, entity: &'static str) {
        counter!(names::CAS_CONFLICTS_TOTAL, labels::ENTITY => entity).increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed
    /// duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_does_not_panic() {
        let metrics = JobmgrMetrics::new();
        metrics.record_api_call("start", true);
        metrics.observe_api_duration("start", Duration::from_millis(3));
        metrics.set_watch_clients("task", 2);
        metrics.record_watch_event("task", "overflow");
        metrics.set_goalstate_queue_depth(17);
        metrics.record_goalstate_action("task", "stop", "done");
        metrics.record_cas_conflict("job");
    }

    #[test]
    fn timing_guard_measures_duration() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(5)));
    }
}
