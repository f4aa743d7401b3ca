//! Goal-state driver: per-entity reconciliation toward desired state.
//!
//! Entities (jobs and tasks) are enqueued with a `not_before` deadline into
//! a deduplicating [`queue::DeadlineQueue`]; a fixed pool of reconciler
//! workers pulls due entities, selects an action from the
//! `(current state, goal state)` tables in [`actions`], and executes it.
//!
//! ## Guarantees
//!
//! - actions for the same entity never execute concurrently (per-entity
//!   mutex held for the action's duration)
//! - actions are idempotent and tolerate stale reads; every write goes
//!   through the cache's compare-and-set
//! - a failed action re-enqueues with exponential backoff, capped at the
//!   configured maximum
//! - on shutdown or leader loss the queue is drained and dispatch stops;
//!   outstanding actions observe the shutdown at their next suspension

pub mod actions;
pub mod queue;

mod driver;

pub use driver::{Driver, EntityKey};
