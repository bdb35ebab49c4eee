//! KvMesh Rebalancer Library
//!
//! This crate moves partitions between the nodes of a KvMesh cluster.
//!
//! A rebalance run:
//! - Takes the cluster-wide rebalancing token
//! - Plans movements (stealer takes partitions from donor) per stealer node
//! - Commits each topology change under vector clock arbitration, reverting
//!   it when the write fails
//! - Migrates the data of every store for each committed movement

pub mod arbiter;
pub mod client;
pub mod commit;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod report;
pub mod simulation;
pub mod token;

// Re-export main types
pub use arbiter::resolve_latest_clock;
pub use client::{AdminClient, ClientError, JobId};
pub use commit::{CommitRecord, MetadataCommitter};
pub use config::{ConfigError, RebalancerConfig, RollbackTargets};
pub use descriptor::{MovementDescriptor, ReplicaPartitions};
pub use error::{RebalanceError, Result};
pub use orchestrator::{attempt_migration, RebalanceOrchestrator};
pub use planner::{
    group_by_stealer, plan_summary, MovementPlanner, RebalanceTask, StaticPlanner,
};
pub use report::{DescriptorOutcome, OutcomeStatus, RebalanceReport};
pub use simulation::{MigrationJob, PropagationRecord, SimulatedCluster};
pub use token::{LocalRebalancingToken, RebalancingToken};
