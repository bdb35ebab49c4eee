//! In-memory cluster
//!
//! [`SimulatedCluster`] implements [`AdminClient`] without any network: every
//! node's topology view lives in memory, propagations apply immediately and
//! migration jobs complete after an optional delay. Failures can be injected
//! per node and per store, and the cluster records what it was asked to do so
//! a run can be inspected afterwards. Used for dry runs and tests.

use crate::client::{AdminClient, ClientError, JobId};
use crate::descriptor::MovementDescriptor;
use kvmesh_core::{
    CausalOrdering, NodeId, PartitionId, Topology, VectorClock, VersionedTopology,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// One propagation request as seen by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationRecord {
    pub topology: Topology,
    pub clock: VectorClock,
    pub targets: Vec<NodeId>,
    pub succeeded: bool,
}

/// One migration job started on the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationJob {
    pub job_id: JobId,
    pub store: String,
    pub stealer: NodeId,
    pub donor: NodeId,
    pub partitions: Vec<PartitionId>,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Succeed,
    Fail,
    Stall,
}

struct State {
    cached: Topology,
    views: HashMap<NodeId, VersionedTopology>,
    propagations: Vec<PropagationRecord>,
    jobs: HashMap<JobId, (MigrationJob, JobOutcome)>,
    issued: Vec<MigrationJob>,
    /// Remaining injected failures per node
    failing_nodes: HashMap<NodeId, usize>,
    fail_rollbacks: bool,
    poisoned: bool,
    failing_stores: HashSet<String>,
    stalled_stores: HashSet<String>,
}

impl State {
    fn apply_propagation(
        &mut self,
        topology: &Topology,
        clock: &VectorClock,
        targets: &[NodeId],
    ) -> Result<(), ClientError> {
        for &node in targets {
            if self.poisoned {
                return Err(ClientError::Unreachable {
                    node,
                    reason: "injected failure after earlier propagation error".to_string(),
                });
            }
            if let Some(remaining) = self.failing_nodes.get_mut(&node) {
                if *remaining > 0 {
                    *remaining -= 1;
                    self.poisoned = self.fail_rollbacks;
                    return Err(ClientError::Unreachable {
                        node,
                        reason: "injected failure".to_string(),
                    });
                }
            }

            if let Some(view) = self.views.get(&node) {
                if clock.compare(&view.clock) != CausalOrdering::After {
                    return Err(ClientError::Rejected {
                        node,
                        reason: format!("obsolete version {} (node has {})", clock, view.clock),
                    });
                }
            }
            self.views.insert(
                node,
                VersionedTopology::new(topology.clone(), clock.clone()),
            );
        }
        Ok(())
    }
}

/// Increments a counter for its lifetime and tracks the high-water mark
struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`AdminClient`]
pub struct SimulatedCluster {
    state: Mutex<State>,
    next_job: AtomicU64,
    propagation_delay: Duration,
    job_delay: Duration,
    propagations_in_flight: AtomicUsize,
    peak_propagations: AtomicUsize,
    awaits_in_flight: AtomicUsize,
    peak_awaits: AtomicUsize,
    stopped: AtomicBool,
}

impl SimulatedCluster {
    /// Cluster whose nodes all hold `topology` under an empty clock
    pub fn new(topology: Topology) -> Self {
        let views = topology
            .node_ids()
            .into_iter()
            .map(|id| (id, VersionedTopology::new(topology.clone(), VectorClock::new())))
            .collect();

        Self {
            state: Mutex::new(State {
                cached: topology,
                views,
                propagations: Vec::new(),
                jobs: HashMap::new(),
                issued: Vec::new(),
                failing_nodes: HashMap::new(),
                fail_rollbacks: false,
                poisoned: false,
                failing_stores: HashSet::new(),
                stalled_stores: HashSet::new(),
            }),
            next_job: AtomicU64::new(1),
            propagation_delay: Duration::ZERO,
            job_delay: Duration::ZERO,
            propagations_in_flight: AtomicUsize::new(0),
            peak_propagations: AtomicUsize::new(0),
            awaits_in_flight: AtomicUsize::new(0),
            peak_awaits: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Delay every propagation by `delay`
    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    /// Let every successful job run for `delay`
    pub fn with_job_delay(mut self, delay: Duration) -> Self {
        self.job_delay = delay;
        self
    }

    /// Set the topology and clock stored on one node
    pub fn set_remote_view(&self, node: NodeId, view: VersionedTopology) {
        self.state.lock().views.insert(node, view);
    }

    /// Replace only the clock stored on one node
    pub fn set_remote_clock(&self, node: NodeId, clock: VectorClock) {
        let mut state = self.state.lock();
        let topology = state
            .views
            .get(&node)
            .map(|v| v.topology.clone())
            .unwrap_or_else(|| state.cached.clone());
        state
            .views
            .insert(node, VersionedTopology::new(topology, clock));
    }

    pub fn remote_view(&self, node: NodeId) -> Option<VersionedTopology> {
        self.state.lock().views.get(&node).cloned()
    }

    /// Fail the next propagation that reaches `node`
    pub fn fail_propagation_to(&self, node: NodeId) {
        *self.state.lock().failing_nodes.entry(node).or_insert(0) += 1;
    }

    /// Once a propagation has failed, fail every later one as well
    pub fn fail_rollbacks(&self) {
        self.state.lock().fail_rollbacks = true;
    }

    /// Jobs for `store` report failure
    pub fn fail_store(&self, store: &str) {
        self.state.lock().failing_stores.insert(store.to_string());
    }

    /// Jobs for `store` never complete
    pub fn stall_store(&self, store: &str) {
        self.state.lock().stalled_stores.insert(store.to_string());
    }

    pub fn propagations(&self) -> Vec<PropagationRecord> {
        self.state.lock().propagations.clone()
    }

    /// Jobs in the order they were started
    pub fn issued_jobs(&self) -> Vec<MigrationJob> {
        self.state.lock().issued.clone()
    }

    /// Highest number of propagations observed running at once
    pub fn peak_concurrent_propagations(&self) -> usize {
        self.peak_propagations.load(Ordering::SeqCst)
    }

    /// Highest number of job waits observed running at once
    pub fn peak_concurrent_awaits(&self) -> usize {
        self.peak_awaits.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AdminClient for SimulatedCluster {
    fn topology(&self) -> Topology {
        self.state.lock().cached.clone()
    }

    fn set_topology(&self, topology: Topology) {
        self.state.lock().cached = topology;
    }

    async fn fetch_remote_topology(
        &self,
        node: NodeId,
    ) -> Result<VersionedTopology, ClientError> {
        self.state
            .lock()
            .views
            .get(&node)
            .cloned()
            .ok_or_else(|| ClientError::Unreachable {
                node,
                reason: "unknown node".to_string(),
            })
    }

    async fn propagate_topology(
        &self,
        topology: &Topology,
        clock: &VectorClock,
        targets: &[NodeId],
    ) -> Result<(), ClientError> {
        let _in_flight =
            InFlight::enter(&self.propagations_in_flight, &self.peak_propagations);
        if !self.propagation_delay.is_zero() {
            tokio::time::sleep(self.propagation_delay).await;
        }

        let mut state = self.state.lock();
        let result = state.apply_propagation(topology, clock, targets);
        debug!(?targets, clock = %clock, ok = result.is_ok(), "Simulated propagation");
        state.propagations.push(PropagationRecord {
            topology: topology.clone(),
            clock: clock.clone(),
            targets: targets.to_vec(),
            succeeded: result.is_ok(),
        });
        result
    }

    async fn start_migration(
        &self,
        store: &str,
        descriptor: &MovementDescriptor,
    ) -> Result<JobId, ClientError> {
        if self.is_stopped() {
            return Err(ClientError::Other("client stopped".to_string()));
        }

        let mut state = self.state.lock();
        let stealer = descriptor.stealer_id();
        if !state.views.contains_key(&stealer) {
            return Err(ClientError::Unreachable {
                node: stealer,
                reason: "unknown node".to_string(),
            });
        }

        let outcome = if state.stalled_stores.contains(store) {
            JobOutcome::Stall
        } else if state.failing_stores.contains(store) {
            JobOutcome::Fail
        } else {
            JobOutcome::Succeed
        };

        let job = MigrationJob {
            job_id: self.next_job.fetch_add(1, Ordering::SeqCst),
            store: store.to_string(),
            stealer,
            donor: descriptor.donor_id(),
            partitions: descriptor.all_partitions().to_vec(),
            attempt: descriptor.attempt(),
        };
        let job_id = job.job_id;
        state.issued.push(job.clone());
        state.jobs.insert(job_id, (job, outcome));
        Ok(job_id)
    }

    async fn await_job(
        &self,
        node: NodeId,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let _in_flight = InFlight::enter(&self.awaits_in_flight, &self.peak_awaits);

        let outcome = self
            .state
            .lock()
            .jobs
            .get(&job_id)
            .filter(|(job, _)| job.stealer == node)
            .map(|(_, outcome)| *outcome)
            .ok_or(ClientError::UnknownJob { node, job_id })?;

        match outcome {
            JobOutcome::Stall => {
                debug!(node, job_id, ?timeout, "Simulated job stalled");
                std::future::pending().await
            }
            JobOutcome::Fail => Err(ClientError::JobFailed {
                node,
                job_id,
                reason: "injected failure".to_string(),
            }),
            JobOutcome::Succeed => {
                if !self.job_delay.is_zero() {
                    tokio::time::sleep(self.job_delay).await;
                }
                Ok(())
            }
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ReplicaPartitions;
    use kvmesh_core::Node;

    fn topology() -> Topology {
        Topology::new(
            "sim",
            vec![
                Node::new(0, "a", 1, 2, 3, vec![0, 1]),
                Node::new(1, "b", 1, 2, 3, vec![2]),
            ],
        )
        .unwrap()
    }

    fn descriptor() -> MovementDescriptor {
        MovementDescriptor::new(
            1,
            0,
            ReplicaPartitions::from([(0, vec![1])]),
            ReplicaPartitions::new(),
            vec!["users".to_string()],
            topology(),
            2,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_propagation_rejects_obsolete_clock() {
        let cluster = SimulatedCluster::new(topology());
        let clock = VectorClock::from_versions([(1, 1)], 0);

        cluster
            .propagate_topology(&topology(), &clock, &[0, 1])
            .await
            .unwrap();
        let err = cluster
            .propagate_topology(&topology(), &clock, &[0])
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Rejected { node: 0, .. }));
        assert_eq!(cluster.remote_view(1).unwrap().clock, clock);
        assert_eq!(cluster.propagations().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let cluster = SimulatedCluster::new(topology());
        cluster.fail_propagation_to(0);

        let first = VectorClock::from_versions([(1, 1)], 0);
        assert!(cluster
            .propagate_topology(&topology(), &first, &[0])
            .await
            .is_err());
        assert!(cluster
            .propagate_topology(&topology(), &first, &[0])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_jobs_follow_store_outcome() {
        let cluster = SimulatedCluster::new(topology());
        cluster.fail_store("carts");

        let d = descriptor();
        let ok = cluster.start_migration("users", &d).await.unwrap();
        let bad = cluster.start_migration("carts", &d).await.unwrap();

        assert!(cluster.await_job(1, ok, Duration::from_secs(1)).await.is_ok());
        assert!(matches!(
            cluster.await_job(1, bad, Duration::from_secs(1)).await,
            Err(ClientError::JobFailed { .. })
        ));
        assert!(matches!(
            cluster.await_job(0, ok, Duration::from_secs(1)).await,
            Err(ClientError::UnknownJob { .. })
        ));

        let jobs = cluster.issued_jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].store, "users");
        assert_eq!(jobs[0].partitions, vec![1]);
        assert_eq!(jobs[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_stop_refuses_new_jobs() {
        let cluster = SimulatedCluster::new(topology());
        cluster.stop().await;
        assert!(cluster.is_stopped());
        assert!(cluster.start_migration("users", &descriptor()).await.is_err());
    }
}
