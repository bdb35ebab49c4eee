//! Admin client interface
//!
//! The orchestrator talks to the cluster only through [`AdminClient`]: fetching
//! and pushing topology metadata, starting migration jobs and waiting on them.
//! The client also holds the orchestrator's cached view of the topology.

use crate::descriptor::MovementDescriptor;
use kvmesh_core::{NodeId, Topology, VectorClock, VersionedTopology};
use std::time::Duration;
use thiserror::Error;

/// Identifier of an asynchronous job running on a node
pub type JobId = u64;

/// Admin client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Node {node} unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },

    #[error("Node {node} rejected request: {reason}")]
    Rejected { node: NodeId, reason: String },

    #[error("Job {job_id} on node {node} failed: {reason}")]
    JobFailed {
        node: NodeId,
        job_id: JobId,
        reason: String,
    },

    #[error("Unknown job {job_id} on node {node}")]
    UnknownJob { node: NodeId, job_id: JobId },

    #[error("Admin client error: {0}")]
    Other(String),
}

/// Cluster administration operations needed by the rebalancer
#[async_trait::async_trait]
pub trait AdminClient: Send + Sync {
    /// Cached topology view
    fn topology(&self) -> Topology;

    /// Replace the cached topology view
    fn set_topology(&self, topology: Topology);

    /// Topology and clock as currently stored on a remote node
    async fn fetch_remote_topology(&self, node: NodeId) -> Result<VersionedTopology, ClientError>;

    /// Push a topology and clock to every node in `targets`.
    ///
    /// Fails if any target rejects the write or cannot be reached.
    async fn propagate_topology(
        &self,
        topology: &Topology,
        clock: &VectorClock,
        targets: &[NodeId],
    ) -> Result<(), ClientError>;

    /// Start migrating one store for a descriptor on its stealer node
    async fn start_migration(
        &self,
        store: &str,
        descriptor: &MovementDescriptor,
    ) -> Result<JobId, ClientError>;

    /// Block until a job finishes, succeeding only if the job succeeded
    async fn await_job(&self, node: NodeId, job_id: JobId, timeout: Duration)
        -> Result<(), ClientError>;

    /// Release connections held by the client
    async fn stop(&self);
}
