//! Topology commit protocol
//!
//! Moves primary partition ownership from a donor to a stealer in the shared
//! topology and pushes the result to both nodes. A failed push is compensated
//! by pushing the previous topology back under a newer clock.
//!
//! All commits and reverts run under one lock shared by every worker, so at
//! most one topology write is in flight at any time. The cached topology held
//! by the admin client is only authoritative while that lock is held.
//!
//! A revert that cannot be applied halts the committer: every later commit,
//! including those already queued on the lock, fails with
//! [`RebalanceError::CommitHalted`] until [`MetadataCommitter::resume`].

use crate::arbiter::resolve_latest_clock;
use crate::client::AdminClient;
use crate::config::{RebalancerConfig, RollbackTargets};
use crate::descriptor::MovementDescriptor;
use crate::error::{RebalanceError, Result};
use kvmesh_core::{now_millis, Node, NodeId, Topology, VectorClock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Topology and clock written by a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub topology: Topology,
    pub clock: VectorClock,
}

/// Serialized writer of the shared topology
pub struct MetadataCommitter {
    admin: Arc<dyn AdminClient>,
    lock: Mutex<()>,
    halted: AtomicBool,
    accept_identical_clocks: bool,
    rollback_targets: RollbackTargets,
}

impl MetadataCommitter {
    pub fn new(admin: Arc<dyn AdminClient>, config: &RebalancerConfig) -> Self {
        Self {
            admin,
            lock: Mutex::new(()),
            halted: AtomicBool::new(false),
            accept_identical_clocks: config.accept_identical_clocks,
            rollback_targets: config.rollback_targets,
        }
    }

    /// Whether a failed revert has stopped all topology writes
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Accept commits again after a halt
    pub fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    /// Add `node` to the cached topology, taken from `target`, if missing.
    ///
    /// The node joins without partitions; it gains them through commits.
    pub async fn ensure_node(&self, target: &Topology, node: NodeId) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.is_halted() {
            return Err(RebalanceError::CommitHalted);
        }

        let current = self.admin.topology();
        if current.contains_node(node) {
            return Ok(());
        }

        let joining = target
            .node(node)
            .map(|n| Node {
                partitions: Vec::new(),
                ..n.clone()
            })
            .ok_or(RebalanceError::NodeNotFound(node))?;

        info!(node, host = %joining.host, "Adding stealer node to cached topology");
        self.admin.set_topology(current.with_nodes([joining]));
        Ok(())
    }

    /// Reassign the descriptor's primary partitions from donor to stealer.
    ///
    /// Clock conflicts fail before anything is written. A failed write is
    /// reverted on the same nodes and reported as [`RebalanceError::CommitFailed`];
    /// a failed revert is reported as [`RebalanceError::RollbackFailed`].
    #[instrument(
        skip_all,
        fields(stealer = descriptor.stealer_id(), donor = descriptor.donor_id())
    )]
    pub async fn commit(&self, descriptor: &MovementDescriptor) -> Result<CommitRecord> {
        let _guard = self.lock.lock().await;
        if self.is_halted() {
            return Err(RebalanceError::CommitHalted);
        }

        let stealer = descriptor.stealer_id();
        let donor = descriptor.donor_id();

        let mut clock = self.latest_clock(stealer, donor).await?;
        let previous = self.admin.topology();

        match self.write(&previous, &mut clock, descriptor).await {
            Ok(record) => {
                debug!(clock = %record.clock, "Topology change committed");
                Ok(record)
            }
            Err(cause) => Err(self.revert(stealer, donor, previous, clock, cause).await),
        }
    }

    async fn latest_clock(&self, stealer: NodeId, donor: NodeId) -> Result<VectorClock> {
        let stealer_view = self.admin.fetch_remote_topology(stealer).await?;
        let donor_view = self.admin.fetch_remote_topology(donor).await?;

        resolve_latest_clock(
            stealer,
            &stealer_view.clock,
            donor,
            &donor_view.clock,
            self.accept_identical_clocks,
        )
    }

    async fn write(
        &self,
        previous: &Topology,
        clock: &mut VectorClock,
        descriptor: &MovementDescriptor,
    ) -> Result<CommitRecord> {
        let stealer = descriptor.stealer_id();
        let donor = descriptor.donor_id();

        let updated =
            previous.reassign_partitions(stealer, donor, descriptor.primary_partitions())?;
        clock.increment(stealer, now_millis());

        self.admin
            .propagate_topology(&updated, clock, &[stealer, donor])
            .await?;

        self.admin.set_topology(updated.clone());
        Ok(CommitRecord {
            topology: updated,
            clock: clock.clone(),
        })
    }

    async fn revert(
        &self,
        stealer: NodeId,
        donor: NodeId,
        previous: Topology,
        clock: VectorClock,
        cause: RebalanceError,
    ) -> RebalanceError {
        let clock = clock.incremented(stealer, now_millis());
        self.admin.set_topology(previous.clone());

        let targets = match self.rollback_targets {
            RollbackTargets::AffectedNodes => vec![stealer, donor],
            RollbackTargets::None => Vec::new(),
        };

        match self
            .admin
            .propagate_topology(&previous, &clock, &targets)
            .await
        {
            Ok(()) => {
                warn!(
                    stealer,
                    donor,
                    clock = %clock,
                    error = %cause,
                    "Topology change reverted"
                );
                RebalanceError::CommitFailed {
                    stealer,
                    source: Box::new(cause),
                }
            }
            Err(rollback) => {
                self.halted.store(true, Ordering::SeqCst);
                error!(
                    stealer,
                    donor,
                    clock = %clock,
                    error = %cause,
                    rollback_error = %rollback,
                    "Topology revert failed, cluster metadata left inconsistent"
                );
                RebalanceError::RollbackFailed {
                    stealer,
                    cause: cause.to_string(),
                    rollback_cause: rollback.to_string(),
                }
            }
        }
    }
}
