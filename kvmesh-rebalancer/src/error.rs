//! Rebalancer error types

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::report::RebalanceReport;
use kvmesh_core::{CausalOrdering, KvMeshError, NodeId, VectorClock};
use thiserror::Error;

/// Rebalancer errors
#[derive(Error, Debug)]
pub enum RebalanceError {
    #[error("Failed to acquire the cluster rebalancing token")]
    TokenUnavailable,

    #[error(
        "Concurrent topology clocks for stealer node {stealer} ({stealer_clock}) \
         and donor node {donor} ({donor_clock})"
    )]
    ConcurrentClocks {
        stealer: NodeId,
        stealer_clock: VectorClock,
        donor: NodeId,
        donor_clock: VectorClock,
    },

    #[error(
        "Invalid clock state: stealer clock {stealer_clock}, donor clock {donor_clock}, \
         ordering {ordering}"
    )]
    InvalidClockState {
        stealer_clock: VectorClock,
        donor_clock: VectorClock,
        ordering: CausalOrdering,
    },

    #[error("Node {0} not found in current or target topology")]
    NodeNotFound(NodeId),

    #[error("Failed to commit rebalance on node {stealer}: {source}")]
    CommitFailed {
        stealer: NodeId,
        #[source]
        source: Box<RebalanceError>,
    },

    #[error("Failed to revert topology on node {stealer} after '{cause}': {rollback_cause}")]
    RollbackFailed {
        stealer: NodeId,
        cause: String,
        rollback_cause: String,
    },

    #[error("Topology writes halted after an unrecovered revert")]
    CommitHalted,

    #[error("Rebalance aborted: {source}")]
    Aborted {
        /// Outcomes up to the abort, unprocessed movements marked skipped
        report: Box<RebalanceReport>,
        #[source]
        source: Box<RebalanceError>,
    },

    #[error("{descriptor} failed incomplete, failed stores: {failed_stores:?}")]
    MigrationFailed {
        descriptor: String,
        failed_stores: Vec<String>,
    },

    #[error("Migration of store {store} on node {node} timed out")]
    MigrationTimeout { store: String, node: NodeId },

    #[error("Admin client error: {0}")]
    Client(#[from] ClientError),

    #[error("Invalid movement descriptor: {0}")]
    Descriptor(String),

    #[error("Planning error: {0}")]
    Planner(String),

    #[error("Topology error: {0}")]
    Topology(#[from] KvMeshError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RebalanceError {
    /// Whether this error leaves shared topology state unrecovered
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            RebalanceError::RollbackFailed { .. } | RebalanceError::Aborted { .. }
        )
    }

    /// Report of an aborted run
    pub fn report(&self) -> Option<&RebalanceReport> {
        match self {
            RebalanceError::Aborted { report, .. } => Some(&**report),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RebalanceError>;
