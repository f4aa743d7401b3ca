//! Configuration for the job manager components.
//!
//! All knobs ship with production defaults; deployments override individual
//! fields through the deserialized config file. Durations are carried as
//! integer milliseconds/seconds in the serialized form and exposed as
//! [`Duration`] accessors.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_RPC_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_CONCURRENCY_ERROR_RETRY: u32 = 5;
const DEFAULT_WATCH_BUFFER_SIZE: usize = 1000;
const DEFAULT_WATCH_MAX_CLIENT: usize = 4;
const DEFAULT_GOALSTATE_WORKERS: usize = 50;
const DEFAULT_JOB_ENQUEUE_DELAY_MS: u64 = 100;
const DEFAULT_FAILURE_BACKOFF_SECS: u64 = 10;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

/// Top-level configuration for the job manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobmgrConfig {
    /// Deadline applied to every write RPC, in seconds.
    pub rpc_timeout_secs: u64,
    /// Bounded retry budget for CAS conflicts at a single call site.
    pub max_concurrency_error_retry: u32,
    /// Agent work directory used to compose sandbox paths.
    pub agent_work_dir: String,
    /// The name this orchestrator registers with the resource broker.
    pub framework_name: String,
    /// Watch processor settings.
    pub watch: WatchConfig,
    /// Goal-state driver settings.
    pub goal_state: GoalStateConfig,
}

impl Default for JobmgrConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
            max_concurrency_error_retry: DEFAULT_MAX_CONCURRENCY_ERROR_RETRY,
            agent_work_dir: "/var/lib/echelon/agent".to_string(),
            framework_name: "Echelon".to_string(),
            watch: WatchConfig::default(),
            goal_state: GoalStateConfig::default(),
        }
    }
}

impl JobmgrConfig {
    /// The deadline applied to every write RPC.
    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Watch processor configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Per-client event queue depth.
    pub buffer_size: usize,
    /// Hard cap on concurrently registered watch clients per kind.
    pub max_client: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_WATCH_BUFFER_SIZE,
            max_client: DEFAULT_WATCH_MAX_CLIENT,
        }
    }
}

/// Goal-state driver configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GoalStateConfig {
    /// Number of reconciler workers pulling due entities.
    pub num_workers: usize,
    /// Coalescing delay for job enqueues triggered by task mutations, in
    /// milliseconds.
    pub job_enqueue_delay_ms: u64,
    /// Initial re-enqueue delay after a failed action, in seconds.
    pub failure_backoff_secs: u64,
    /// Upper bound on the exponential failure backoff, in seconds.
    pub max_backoff_secs: u64,
}

impl Default for GoalStateConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_GOALSTATE_WORKERS,
            job_enqueue_delay_ms: DEFAULT_JOB_ENQUEUE_DELAY_MS,
            failure_backoff_secs: DEFAULT_FAILURE_BACKOFF_SECS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
        }
    }
}

impl GoalStateConfig {
    /// The coalescing delay for job enqueues.
    #[must_use]
    pub const fn job_enqueue_delay(&self) -> Duration {
        Duration::from_millis(self.job_enqueue_delay_ms)
    }

    /// The initial failure backoff.
    #[must_use]
    pub const fn failure_backoff(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_secs)
    }

    /// The failure backoff cap.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}
