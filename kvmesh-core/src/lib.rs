//! KvMesh Core Library
//!
//! Core abstractions shared by the KvMesh cluster tooling.
//! This crate provides:
//! - The cluster topology document (nodes and their primary partitions)
//! - Vector clocks for ordering concurrent topology updates
//! - Common types and error handling

pub mod error;
pub mod topology;
pub mod versioning;

pub use error::{KvMeshError, Result};
pub use topology::{Node, Topology};
pub use versioning::{CausalOrdering, VectorClock, VersionedTopology};

/// Identifier of a storage node
pub type NodeId = u32;

/// Identifier of a partition of the key space
pub type PartitionId = u32;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Used as the timestamp component of vector clock increments.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
