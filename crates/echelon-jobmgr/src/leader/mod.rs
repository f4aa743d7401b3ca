//! Leader gating for write operations.
//!
//! Echelon runs several job manager instances for availability, but only the
//! elected leader may mutate state. The [`Candidate`] trait is the narrow
//! predicate the RPC surface consults; the election protocol itself lives in
//! an external component.
//!
//! Write RPCs fail fast with an unavailable error when
//! [`Candidate::is_leader`] returns false; read RPCs proceed regardless.

use std::sync::atomic::{AtomicBool, Ordering};

/// Gatekeeper predicate backed by an external election component.
pub trait Candidate: Send + Sync {
    /// Returns true while this instance holds leadership.
    fn is_leader(&self) -> bool;
}

/// A candidate with an externally toggled leadership flag.
///
/// Used by tests and single-node deployments where no election runs.
#[derive(Debug, Default)]
pub struct StaticCandidate {
    leader: AtomicBool,
}

impl StaticCandidate {
    /// Creates a candidate with the given initial leadership.
    #[must_use]
    pub fn new(leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(leader),
        }
    }

    /// Grants or revokes leadership.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

impl Candidate for StaticCandidate {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}
