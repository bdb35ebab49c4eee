//! Rebalance runs against a simulated cluster

use kvmesh_core::{Node, NodeId, PartitionId, Topology, VectorClock, VersionedTopology};
use kvmesh_rebalancer::{
    AdminClient, LocalRebalancingToken, MovementDescriptor, OutcomeStatus, RebalanceError,
    RebalanceOrchestrator, RebalancerConfig, RebalancingToken, ReplicaPartitions,
    SimulatedCluster, StaticPlanner,
};
use std::sync::Arc;
use std::time::Duration;

fn node(id: NodeId, partitions: Vec<PartitionId>) -> Node {
    Node::new(id, format!("node-{}", id), 8081, 6666, 6667, partitions)
}

fn stores(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn movement(
    stealer: NodeId,
    donor: NodeId,
    partitions: Vec<PartitionId>,
    store_names: &[&str],
    initial: &Topology,
) -> MovementDescriptor {
    MovementDescriptor::new(
        stealer,
        donor,
        ReplicaPartitions::from([(0, partitions)]),
        ReplicaPartitions::new(),
        stores(store_names),
        initial.clone(),
        0,
    )
    .unwrap()
}

fn orchestrator(
    cluster: &Arc<SimulatedCluster>,
    descriptors: Vec<MovementDescriptor>,
    token: Arc<LocalRebalancingToken>,
    config: RebalancerConfig,
) -> RebalanceOrchestrator {
    RebalanceOrchestrator::new(
        cluster.clone() as Arc<dyn AdminClient>,
        Arc::new(StaticPlanner::new(descriptors)),
        token,
        config,
    )
}

#[tokio::test]
async fn test_partition_moves_to_joining_node() {
    let current = Topology::new("cluster", vec![node(0, vec![0, 1, 2])]).unwrap();
    let target = Topology::new("cluster", vec![node(0, vec![0, 1]), node(1, vec![2])]).unwrap();

    let cluster = Arc::new(SimulatedCluster::new(current.clone()));
    cluster.set_remote_clock(0, VectorClock::from_versions([(0, 1)], 0));
    cluster.set_remote_view(1, VersionedTopology::new(current.clone(), VectorClock::new()));

    let token = Arc::new(LocalRebalancingToken::new());
    let orchestrator = orchestrator(
        &cluster,
        vec![movement(1, 0, vec![2], &["s1", "s2"], &current)],
        token.clone(),
        RebalancerConfig::default(),
    );

    let report = orchestrator
        .rebalance(current, target.clone(), &stores(&["s1", "s2"]))
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 1);
    assert!(report.outcomes[0].descriptor.is_complete());
    assert_eq!(cluster.topology(), target);
    assert!(!token.is_held());

    let jobs = cluster.issued_jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].store, "s1");
    assert_eq!(jobs[1].store, "s2");
    assert!(jobs.iter().all(|j| j.stealer == 1 && j.donor == 0));

    // Donor clock advanced once on the stealer's entry
    let written = VectorClock::from_versions([(0, 1), (1, 1)], 0);
    for id in [0, 1] {
        let view = cluster.remote_view(id).unwrap();
        assert_eq!(view.clock.versions(), written.versions());
        assert_eq!(view.topology, target);
    }
}

#[tokio::test]
async fn test_stalled_store_times_out_others_complete() {
    let current = Topology::new("cluster", vec![node(0, vec![0, 1, 2]), node(1, vec![])]).unwrap();
    let cluster = Arc::new(SimulatedCluster::new(current.clone()));
    cluster.set_remote_clock(0, VectorClock::from_versions([(0, 1)], 0));
    cluster.stall_store("s1");

    let config = RebalancerConfig {
        migration_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let orchestrator = orchestrator(
        &cluster,
        vec![movement(1, 0, vec![2], &["s1", "s2"], &current)],
        Arc::new(LocalRebalancingToken::new()),
        config,
    );

    let report = orchestrator
        .rebalance(current.clone(), current, &stores(&["s1", "s2"]))
        .await
        .unwrap();

    let outcome = &report.outcomes[0];
    assert_eq!(
        outcome.status,
        OutcomeStatus::MigrationFailed {
            failed_stores: stores(&["s1"])
        }
    );
    assert_eq!(outcome.descriptor.stores_pending(), stores(&["s1"]).as_slice());
    assert_eq!(cluster.issued_jobs().len(), 2);

    // The topology change itself stays committed
    assert_eq!(cluster.topology().partition_owner(2), Some(1));

    let retry = report.retry_tasks();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].descriptors[0].attempt(), 1);
    assert_eq!(retry[0].descriptors[0].stores_pending(), stores(&["s1"]).as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_drains_many_stealers() {
    const PAIRS: u32 = 6;

    // Donor i owns partition i; stealer 10 + i takes it
    let mut nodes: Vec<Node> = (0..PAIRS).map(|i| node(i, vec![i])).collect();
    nodes.extend((0..PAIRS).map(|i| node(10 + i, vec![])));
    let current = Topology::new("cluster", nodes).unwrap();

    let cluster = Arc::new(
        SimulatedCluster::new(current.clone())
            .with_propagation_delay(Duration::from_millis(10))
            .with_job_delay(Duration::from_millis(80)),
    );
    for donor in 0..PAIRS {
        cluster.set_remote_clock(donor, VectorClock::from_versions([(donor, 1)], 0));
    }

    let descriptors = (0..PAIRS)
        .map(|i| movement(10 + i, i, vec![i], &["users"], &current))
        .collect();
    let config = RebalancerConfig {
        max_parallel_rebalancing: 3,
        ..Default::default()
    };
    let orchestrator = orchestrator(
        &cluster,
        descriptors,
        Arc::new(LocalRebalancingToken::new()),
        config,
    );

    let report = orchestrator
        .rebalance(current.clone(), current, &stores(&["users"]))
        .await
        .unwrap();

    assert_eq!(report.succeeded(), PAIRS as usize);
    for i in 0..PAIRS {
        assert_eq!(report.for_stealer(10 + i).len(), 1);
        assert_eq!(cluster.topology().partition_owner(i), Some(10 + i));
    }
    assert_eq!(cluster.issued_jobs().len(), PAIRS as usize);
    assert_eq!(cluster.peak_concurrent_propagations(), 1);
    assert!(cluster.peak_concurrent_awaits() >= 2);
}

#[tokio::test]
async fn test_movements_of_one_stealer_run_in_order() {
    let current = Topology::new("cluster", vec![node(0, vec![0, 1, 2]), node(5, vec![])]).unwrap();
    let cluster = Arc::new(SimulatedCluster::new(current.clone()));
    cluster.set_remote_clock(0, VectorClock::from_versions([(0, 1)], 0));

    let descriptors = vec![
        movement(5, 0, vec![0], &["users"], &current),
        movement(5, 0, vec![1], &["users"], &current),
        movement(5, 0, vec![2], &["users"], &current),
    ];
    // Consecutive commits between the same pair leave both nodes on one clock
    let config = RebalancerConfig {
        accept_identical_clocks: true,
        ..Default::default()
    };
    let orchestrator = orchestrator(
        &cluster,
        descriptors,
        Arc::new(LocalRebalancingToken::new()),
        config,
    );

    let report = orchestrator
        .rebalance(current.clone(), current, &stores(&["users"]))
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 3);
    let moved: Vec<Vec<PartitionId>> = cluster
        .issued_jobs()
        .into_iter()
        .map(|j| j.partitions)
        .collect();
    assert_eq!(moved, vec![vec![0], vec![1], vec![2]]);

    let counters: Vec<u64> = cluster
        .propagations()
        .iter()
        .map(|p| p.clock.counter(5))
        .collect();
    assert_eq!(counters, vec![1, 2, 3]);
    assert_eq!(cluster.topology().node(5).unwrap().partitions, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_token_denied_does_nothing() {
    let current = Topology::new("cluster", vec![node(0, vec![0, 1]), node(1, vec![])]).unwrap();
    let cluster = Arc::new(SimulatedCluster::new(current.clone()));

    let token = Arc::new(LocalRebalancingToken::new());
    assert!(token.acquire().await.unwrap());

    let orchestrator = orchestrator(
        &cluster,
        vec![movement(1, 0, vec![1], &["users"], &current)],
        token.clone(),
        RebalancerConfig::default(),
    );
    let err = orchestrator
        .rebalance(current.clone(), current, &stores(&["users"]))
        .await
        .unwrap_err();

    assert!(matches!(err, RebalanceError::TokenUnavailable));
    assert!(cluster.propagations().is_empty());
    assert!(cluster.issued_jobs().is_empty());
    // Still held by whoever took it first
    assert!(token.is_held());
}

#[tokio::test]
async fn test_unrecovered_revert_aborts_run() {
    let current = Topology::new(
        "cluster",
        vec![node(0, vec![0, 1]), node(1, vec![]), node(2, vec![2]), node(3, vec![])],
    )
    .unwrap();
    let cluster = Arc::new(SimulatedCluster::new(current.clone()));
    cluster.set_remote_clock(0, VectorClock::from_versions([(0, 1)], 0));
    cluster.set_remote_clock(2, VectorClock::from_versions([(2, 1)], 0));
    cluster.fail_propagation_to(0);
    cluster.fail_rollbacks();

    let token = Arc::new(LocalRebalancingToken::new());
    let config = RebalancerConfig {
        max_parallel_rebalancing: 1,
        ..Default::default()
    };
    let orchestrator = orchestrator(
        &cluster,
        vec![
            movement(1, 0, vec![0], &["users"], &current),
            movement(1, 0, vec![1], &["users"], &current),
            movement(3, 2, vec![2], &["users"], &current),
        ],
        token.clone(),
        config,
    );

    let err = orchestrator
        .rebalance(current.clone(), current.clone(), &stores(&["users"]))
        .await
        .unwrap_err();

    assert!(err.is_run_fatal());
    let report = match err {
        RebalanceError::Aborted { report, source } => {
            assert!(matches!(*source, RebalanceError::RollbackFailed { stealer: 1, .. }));
            report
        }
        other => panic!("unexpected error: {other}"),
    };
    assert!(!token.is_held());

    // Second movement of stealer 1 and the untouched stealer 3 task
    assert_eq!(report.failed(), 1);
    assert_eq!(report.skipped(), 2);
    let retry = report.retry_tasks();
    assert_eq!(retry.len(), 2);
    assert_eq!(retry[0].stealer_id, 1);
    assert_eq!(retry[0].descriptors.len(), 2);
    assert_eq!(retry[1].stealer_id, 3);

    // Forward write and its failed revert, nothing after
    let log = cluster.propagations();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|p| !p.succeeded));
    assert!(cluster.issued_jobs().is_empty());
    assert_eq!(cluster.topology(), current);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commit_waiting_on_lock_is_skipped_after_failed_revert() {
    let current = Topology::new(
        "cluster",
        vec![
            node(0, vec![0]),
            node(1, vec![]),
            node(2, vec![2]),
            node(3, vec![]),
            node(4, vec![4]),
            node(5, vec![5]),
        ],
    )
    .unwrap();

    // Both stealers commit once, migrate, then try a second commit whose
    // write fails. Whichever fails first holds the lock through its failed
    // revert while the other is already queued behind it.
    let cluster = Arc::new(
        SimulatedCluster::new(current.clone())
            .with_propagation_delay(Duration::from_millis(40))
            .with_job_delay(Duration::from_millis(120)),
    );
    cluster.set_remote_clock(0, VectorClock::from_versions([(0, 1)], 0));
    cluster.set_remote_clock(4, VectorClock::from_versions([(4, 1)], 0));
    cluster.fail_propagation_to(2);
    cluster.fail_propagation_to(5);
    cluster.fail_rollbacks();

    let config = RebalancerConfig {
        max_parallel_rebalancing: 2,
        ..Default::default()
    };
    let orchestrator = orchestrator(
        &cluster,
        vec![
            movement(1, 0, vec![0], &["users"], &current),
            movement(1, 2, vec![2], &["users"], &current),
            movement(3, 4, vec![4], &["users"], &current),
            movement(3, 5, vec![5], &["users"], &current),
        ],
        Arc::new(LocalRebalancingToken::new()),
        config,
    );

    let err = orchestrator
        .rebalance(current.clone(), current, &stores(&["users"]))
        .await
        .unwrap_err();
    let report = err.report().expect("aborted run keeps its report");

    // Two commits, one failed write and its failed revert; nothing after
    let log = cluster.propagations();
    assert_eq!(log.len(), 4);
    assert!(log[0].succeeded && log[1].succeeded);
    assert!(!log[2].succeeded && !log[3].succeeded);
    assert_eq!(log[3].targets, log[2].targets);
    assert_eq!(cluster.topology().partition_owner(2), Some(2));
    assert_eq!(cluster.topology().partition_owner(5), Some(5));

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.skipped(), 1);
}
