//! Rebalance run results

use crate::descriptor::MovementDescriptor;
use crate::planner::{group_by_stealer, RebalanceTask};
use std::fmt;
use std::time::Duration;

/// What happened to one movement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Topology committed and every store migrated
    Completed,
    /// Topology change refused or reverted; no data was moved
    CommitFailed { reason: String },
    /// Topology committed but some stores did not migrate
    MigrationFailed { failed_stores: Vec<String> },
    /// Never attempted
    Skipped { reason: String },
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Completed => write!(f, "completed"),
            OutcomeStatus::CommitFailed { reason } => write!(f, "commit failed: {}", reason),
            OutcomeStatus::MigrationFailed { failed_stores } => {
                write!(f, "migration failed for {:?}", failed_stores)
            }
            OutcomeStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// Final state of one movement descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorOutcome {
    /// Descriptor as it stood when processing ended; `stores_pending` holds
    /// whatever did not migrate
    pub descriptor: MovementDescriptor,
    pub status: OutcomeStatus,
}

impl DescriptorOutcome {
    pub fn new(descriptor: MovementDescriptor, status: OutcomeStatus) -> Self {
        Self { descriptor, status }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }
}

/// Overall rebalance result
#[derive(Debug, Clone, Default)]
pub struct RebalanceReport {
    pub outcomes: Vec<DescriptorOutcome>,
    pub duration: Duration,
}

impl RebalanceReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.status,
                    OutcomeStatus::CommitFailed { .. } | OutcomeStatus::MigrationFailed { .. }
                )
            })
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Skipped { .. }))
            .count()
    }

    /// Outcomes for one stealer, in processing order
    pub fn for_stealer(&self, stealer: kvmesh_core::NodeId) -> Vec<&DescriptorOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.descriptor.stealer_id() == stealer)
            .collect()
    }

    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.outcomes.len();
        if total == 0 {
            100.0
        } else {
            (self.succeeded() as f64 / total as f64) * 100.0
        }
    }

    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} skipped in {:?} ({:.1}% success rate)",
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.duration,
            self.success_rate()
        )
    }

    /// Plan for another run covering everything that did not complete.
    ///
    /// Each descriptor keeps only its unmigrated stores and has its attempt
    /// counter bumped.
    pub fn retry_tasks(&self) -> Vec<RebalanceTask> {
        let retries = self
            .outcomes
            .iter()
            .filter(|o| !o.is_success() && !o.descriptor.is_complete())
            .map(|o| {
                let mut descriptor = o.descriptor.clone();
                descriptor.next_attempt();
                descriptor
            });
        group_by_stealer(retries)
    }
}
