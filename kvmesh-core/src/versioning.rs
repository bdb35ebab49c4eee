//! Vector clocks for topology versioning
//!
//! Every node keeps its own copy of the cluster topology together with a
//! vector clock. Comparing two clocks tells whether one copy supersedes the
//! other or whether they were produced by concurrent, conflicting writers.

use crate::topology::Topology;
use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Causal relationship between two clocks, seen from the left-hand clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CausalOrdering {
    /// Left clock strictly dominates the right one
    After,
    /// Right clock strictly dominates the left one
    Before,
    /// Neither dominates: conflicting histories
    Concurrently,
    /// Identical counters
    Equal,
}

impl fmt::Display for CausalOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CausalOrdering::After => "after",
            CausalOrdering::Before => "before",
            CausalOrdering::Concurrently => "concurrently",
            CausalOrdering::Equal => "equal",
        };
        f.write_str(s)
    }
}

/// Per-node counter vector with the wall-clock time of the last increment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    versions: BTreeMap<NodeId, u64>,
    /// Milliseconds since the Unix epoch of the latest increment
    timestamp: i64,
}

impl VectorClock {
    /// Create an empty clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock from explicit counters
    pub fn from_versions(
        versions: impl IntoIterator<Item = (NodeId, u64)>,
        timestamp: i64,
    ) -> Self {
        Self {
            versions: versions.into_iter().collect(),
            timestamp,
        }
    }

    /// Counter for a node, zero when the node never wrote
    pub fn counter(&self, node: NodeId) -> u64 {
        self.versions.get(&node).copied().unwrap_or(0)
    }

    pub fn versions(&self) -> &BTreeMap<NodeId, u64> {
        &self.versions
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Record a new event on `node`
    pub fn increment(&mut self, node: NodeId, timestamp: i64) {
        *self.versions.entry(node).or_insert(0) += 1;
        self.timestamp = timestamp;
    }

    /// Copy of this clock with one more event on `node`
    pub fn incremented(&self, node: NodeId, timestamp: i64) -> Self {
        let mut clock = self.clone();
        clock.increment(node, timestamp);
        clock
    }

    /// Compare this clock against another.
    ///
    /// Missing entries count as zero. The timestamp plays no part in ordering.
    pub fn compare(&self, other: &VectorClock) -> CausalOrdering {
        let mut self_bigger = false;
        let mut other_bigger = false;

        for node in self.versions.keys().chain(other.versions.keys()) {
            let mine = self.counter(*node);
            let theirs = other.counter(*node);
            if mine > theirs {
                self_bigger = true;
            } else if theirs > mine {
                other_bigger = true;
            }
            if self_bigger && other_bigger {
                return CausalOrdering::Concurrently;
            }
        }

        match (self_bigger, other_bigger) {
            (true, false) => CausalOrdering::After,
            (false, true) => CausalOrdering::Before,
            (false, false) => CausalOrdering::Equal,
            (true, true) => CausalOrdering::Concurrently,
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version(")?;
        for (i, (node, counter)) in self.versions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", node, counter)?;
        }
        write!(f, ") ts:{}", self.timestamp)
    }
}

/// A topology together with the clock it was written under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedTopology {
    pub topology: Topology,
    pub clock: VectorClock,
}

impl VersionedTopology {
    pub fn new(topology: Topology, clock: VectorClock) -> Self {
        Self { topology, clock }
    }
}
