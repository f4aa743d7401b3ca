//! Strongly-typed identifiers for Echelon entities.
//!
//! All identifiers are:
//! - **Strongly typed**: prevents mixing up different ID kinds at compile time
//! - **Wire-stable**: jobs are identified by opaque strings assigned by the
//!   job service; pods carry a canonical `<job>-<instance>-<run>` form
//!
//! # Example
//!
//! ```rust
//! use echelon_core::id::{JobId, PodId};
//!
//! let job = JobId::new("b64fd26b-0e39-41b7-b22a-205b69f247bd");
//! let pod = PodId::new(&job, 2, 3);
//!
//! assert_eq!(pod.run_id(), 3);
//! assert_eq!(pod.to_string(), format!("{job}-2-3"));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque identifier for a job.
///
/// Jobs are created by an external job service; the orchestrator core treats
/// their ids as opaque strings and never inspects their structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a job id from its wire representation.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the `<job>-<instance>` name under which a single instance of
    /// this job is registered with external services.
    #[must_use]
    pub fn instance_name(&self, instance_id: u32) -> String {
        format!("{}-{instance_id}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The identifier of one execution attempt (run) of a task.
///
/// The canonical form is `<JobID>-<InstanceID>-<RunID>` where `RunID` is a
/// monotonically increasing decimal counter per instance. Because job ids may
/// themselves contain hyphens, the run component is always parsed from the
/// *last* hyphen; anything that fails to parse yields run 0, which doubles as
/// the "no further history" marker in pod-event chains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodId(String);

impl PodId {
    /// Builds the pod id for a given run of a job instance.
    #[must_use]
    pub fn new(job_id: &JobId, instance_id: u32, run_id: u64) -> Self {
        Self(format!("{job_id}-{instance_id}-{run_id}"))
    }

    /// Wraps an already-encoded pod id taken from the wire.
    #[must_use]
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when no id has been assigned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses the run counter out of the id.
    ///
    /// Splits on the last hyphen and parses the suffix as a decimal u64.
    /// Ids without a parseable run component yield 0.
    #[must_use]
    pub fn run_id(&self) -> u64 {
        self.0
            .rsplit_once('-')
            .and_then(|(_, run)| run.parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// Builds the pod id for the run after this one.
    #[must_use]
    pub fn next_run(&self, job_id: &JobId, instance_id: u32) -> Self {
        Self::new(job_id, instance_id, self.run_id() + 1)
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for PodId {
    fn default() -> Self {
        Self(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_id_roundtrip() {
        let job = JobId::new("j1");
        let pod = PodId::new(&job, 2, 3);
        assert_eq!(pod.as_str(), "j1-2-3");
        assert_eq!(pod.run_id(), 3);
    }

    #[test]
    fn run_id_parses_from_last_hyphen() {
        // Job ids are commonly UUIDs and contain hyphens themselves.
        let job = JobId::new("b64fd26b-0e39-41b7-b22a-205b69f247bd");
        let pod = PodId::new(&job, 7, 12);
        assert_eq!(pod.run_id(), 12);
    }

    #[test]
    fn unparseable_run_yields_zero() {
        assert_eq!(PodId::from_string("garbage").run_id(), 0);
        assert_eq!(PodId::from_string("job-0-notanumber").run_id(), 0);
        assert_eq!(PodId::from_string("").run_id(), 0);
    }

    #[test]
    fn next_run_increments() {
        let job = JobId::new("j1");
        let pod = PodId::new(&job, 2, 3);
        assert_eq!(pod.next_run(&job, 2).as_str(), "j1-2-4");
    }

    #[test]
    fn instance_name_composition() {
        let job = JobId::new("j1");
        assert_eq!(job.instance_name(4), "j1-4");
    }
}
