//! Vector clock arbiter
//!
//! Picks which of the stealer's and donor's topology clocks to advance before
//! a metadata write. Concurrent clocks mean the two nodes hold conflicting
//! histories and no side can be trusted, so the write is refused.

use crate::error::{RebalanceError, Result};
use kvmesh_core::{CausalOrdering, NodeId, VectorClock};

/// Return the dominant clock of the stealer and donor views
pub fn resolve_latest_clock(
    stealer: NodeId,
    stealer_clock: &VectorClock,
    donor: NodeId,
    donor_clock: &VectorClock,
    accept_identical: bool,
) -> Result<VectorClock> {
    match stealer_clock.compare(donor_clock) {
        CausalOrdering::After => Ok(stealer_clock.clone()),
        CausalOrdering::Before => Ok(donor_clock.clone()),
        CausalOrdering::Equal if accept_identical => Ok(stealer_clock.clone()),
        CausalOrdering::Concurrently => Err(RebalanceError::ConcurrentClocks {
            stealer,
            stealer_clock: stealer_clock.clone(),
            donor,
            donor_clock: donor_clock.clone(),
        }),
        ordering => Err(RebalanceError::InvalidClockState {
            stealer_clock: stealer_clock.clone(),
            donor_clock: donor_clock.clone(),
            ordering,
        }),
    }
}
