//! Append-only pod events: the per-run history of task state transitions.
//!
//! Events for one instance form a reverse-linked chain through
//! `prev_pod_id`; the chain terminates at an event whose `prev_pod_id`
//! decodes to run 0. Events are never mutated, only appended; deletion is
//! range-based on run ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use echelon_core::PodId;

use crate::error::{Error, Result};
use crate::task::{TaskRuntime, TaskState};

/// One immutable record of a task state transition, as persisted.
///
/// Config versions are carried as decimal strings in the persisted form;
/// [`PodEventInfo`] is the parsed wire form returned by the RPC surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodEvent {
    /// The run this event belongs to.
    pub pod_id: PodId,
    /// The previous run of the same instance; run 0 means no further
    /// history.
    pub prev_pod_id: PodId,
    /// The run the instance was being driven toward at event time.
    pub desired_pod_id: PodId,
    /// Observed state at event time.
    pub actual_state: TaskState,
    /// Goal state at event time.
    pub desired_state: TaskState,
    /// When the transition was recorded.
    pub timestamp: DateTime<Utc>,
    /// Job configuration version, as a decimal string.
    pub version: String,
    /// Desired job configuration version, as a decimal string.
    pub desired_version: String,
    /// Host the run was on, if placed.
    pub hostname: Option<String>,
    /// Agent the run was on, if placed.
    pub agent_id: Option<String>,
    /// Human-readable note from the transition.
    pub message: String,
    /// Machine-readable reason from the transition.
    pub reason: String,
    /// Whether the run was healthy at event time.
    pub healthy: bool,
}

impl PodEvent {
    /// Builds the event describing a runtime's current state.
    #[must_use]
    pub fn from_runtime(runtime: &TaskRuntime) -> Self {
        Self {
            pod_id: runtime.pod_id.clone(),
            prev_pod_id: runtime.prev_pod_id.clone(),
            desired_pod_id: runtime.desired_pod_id.clone(),
            actual_state: runtime.state,
            desired_state: runtime.goal_state,
            timestamp: Utc::now(),
            version: runtime.config_version.to_string(),
            desired_version: runtime.desired_config_version.to_string(),
            hostname: runtime.host.clone(),
            agent_id: runtime.agent_id.clone(),
            message: runtime.message.clone(),
            reason: runtime.reason.clone(),
            healthy: matches!(runtime.healthy, crate::task::HealthState::Healthy),
        }
    }

    /// Returns true when this event records a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.actual_state.is_terminal()
    }
}

/// The wire form of a pod event, with config versions parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodEventInfo {
    /// The run this event belongs to.
    pub pod_id: PodId,
    /// The previous run of the same instance.
    pub prev_pod_id: PodId,
    /// The run the instance was being driven toward at event time.
    pub desired_pod_id: PodId,
    /// Observed state at event time.
    pub actual_state: TaskState,
    /// Goal state at event time.
    pub goal_state: TaskState,
    /// When the transition was recorded.
    pub timestamp: DateTime<Utc>,
    /// Job configuration version.
    pub config_version: i64,
    /// Desired job configuration version.
    pub desired_config_version: i64,
    /// Host the run was on, if placed.
    pub hostname: Option<String>,
    /// Agent the run was on, if placed.
    pub agent_id: Option<String>,
    /// Human-readable note from the transition.
    pub message: String,
    /// Machine-readable reason from the transition.
    pub reason: String,
    /// Whether the run was healthy at event time.
    pub healthy: bool,
}

/// Parses a persisted decimal version string.
///
/// Versions are signed 64-bit on the wire; values that do not fit are
/// rejected rather than wrapped.
pub fn parse_version(value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|e| Error::invalid_argument(format!("malformed config version '{value}': {e}")))
}

impl TryFrom<&PodEvent> for PodEventInfo {
    type Error = Error;

    fn try_from(event: &PodEvent) -> Result<Self> {
        Ok(Self {
            pod_id: event.pod_id.clone(),
            prev_pod_id: event.prev_pod_id.clone(),
            desired_pod_id: event.desired_pod_id.clone(),
            actual_state: event.actual_state,
            goal_state: event.desired_state,
            timestamp: event.timestamp,
            config_version: parse_version(&event.version)?,
            desired_config_version: parse_version(&event.desired_version)?,
            hostname: event.hostname.clone(),
            agent_id: event.agent_id.clone(),
            message: event.message.clone(),
            reason: event.reason.clone(),
            healthy: event.healthy,
        })
    }
}
