//! Error types for KvMesh
//!
//! Provides a unified error type for topology and versioning operations.

use crate::{NodeId, PartitionId};
use thiserror::Error;

/// Result type alias for KvMesh core operations
pub type Result<T> = std::result::Result<T, KvMeshError>;

/// Unified error type for KvMesh core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvMeshError {
    // ===== Topology Errors =====
    #[error("Node not found in topology: {0}")]
    NodeNotFound(NodeId),

    #[error("Stealer and donor are the same node: {0}")]
    SameNode(NodeId),

    #[error("Node {0} listed more than once")]
    DuplicateNode(NodeId),

    #[error("Partition {partition} is owned by more than one node")]
    DuplicatePartition { partition: PartitionId },

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for KvMeshError {
    fn from(err: serde_json::Error) -> Self {
        KvMeshError::Serialization(err.to_string())
    }
}
