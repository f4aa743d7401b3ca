//! # echelon-jobmgr
//!
//! The job/task reconciliation engine of the Echelon workload orchestrator.
//! It sits behind the TaskManager RPC surface and continuously reconciles
//! observed task state against declared goal state:
//!
//! - **Cached entity factory**: an in-memory index of jobs and their tasks
//!   with compare-and-set write-through to the durable store
//! - **Goal-state driver**: per-entity reconciliation queues that move each
//!   entity toward its goal state with bounded retry and backoff
//! - **Watch processor**: bounded, backpressured change streams for an
//!   arbitrary number of subscribers
//!
//! ## Guarantees
//!
//! - **Linearizable runtime writes**: every runtime mutation is a CAS against
//!   the store's versioning; conflicts surface as
//!   [`error::Error::UnexpectedVersion`]
//! - **Per-entity serialization**: goal-state actions for the same entity
//!   never execute concurrently
//! - **Bounded fan-out**: a slow watch subscriber is evicted rather than
//!   allowed to stall producers or other subscribers
//!
//! Placement, durable storage layout, and transport are delegated to
//! collaborators behind the traits in [`store`], [`client`], and [`leader`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cached;
pub mod client;
pub mod config;
pub mod error;
pub mod goalstate;
pub mod handler;
pub mod job;
pub mod leader;
pub mod metrics;
pub mod pod_event;
pub mod store;
pub mod task;
pub mod watch;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cached::{CachedJob, CachedTask, JobFactory, RuntimeListener};
    pub use crate::config::JobmgrConfig;
    pub use crate::error::{Error, Result};
    pub use crate::goalstate::{Driver, EntityKey};
    pub use crate::handler::TaskService;
    pub use crate::job::{JobConfig, JobRuntime, JobState, JobType};
    pub use crate::leader::Candidate;
    pub use crate::store::Store;
    pub use crate::task::{InstanceRange, RuntimeDiff, TaskInfo, TaskRuntime, TaskState};
    pub use crate::watch::{StopSignal, WatchProcessor};
}
