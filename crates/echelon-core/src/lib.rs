//! # echelon-core
//!
//! Shared building blocks for the Echelon workload orchestrator:
//!
//! - **Strongly-typed identifiers**: job ids and pod (run) ids that cannot
//!   be mixed up at compile time
//! - **Error types**: the common error vocabulary used across components
//!
//! Higher-level crates (the job manager, collaborating services) build on
//! these primitives; this crate has no opinion about storage, transport,
//! or scheduling.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;

pub use error::{Error, Result};
pub use id::{JobId, PodId};
