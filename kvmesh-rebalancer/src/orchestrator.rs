//! Rebalance orchestrator
//!
//! Drives a rebalance run:
//! - Takes the cluster rebalancing token
//! - Turns the plan into a queue of per-stealer tasks
//! - Drains the queue with a fixed pool of workers
//! - Commits each movement, then migrates its stores
//!
//! Workers never share a stealer; movements of one stealer run in plan order.

use crate::client::AdminClient;
use crate::commit::MetadataCommitter;
use crate::config::RebalancerConfig;
use crate::descriptor::MovementDescriptor;
use crate::error::{RebalanceError, Result};
use crate::planner::{plan_summary, MovementPlanner, RebalanceTask};
use crate::report::{DescriptorOutcome, OutcomeStatus, RebalanceReport};
use crate::token::RebalancingToken;
use kvmesh_core::Topology;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

const ABORT_REASON: &str = "run aborted after an unrecovered topology revert";

/// Coordinates one or more rebalance runs against a cluster
pub struct RebalanceOrchestrator {
    admin: Arc<dyn AdminClient>,
    planner: Arc<dyn MovementPlanner>,
    token: Arc<dyn RebalancingToken>,
    config: RebalancerConfig,
    committer: Arc<MetadataCommitter>,
}

impl RebalanceOrchestrator {
    pub fn new(
        admin: Arc<dyn AdminClient>,
        planner: Arc<dyn MovementPlanner>,
        token: Arc<dyn RebalancingToken>,
        config: RebalancerConfig,
    ) -> Self {
        let committer = Arc::new(MetadataCommitter::new(admin.clone(), &config));
        Self {
            admin,
            planner,
            token,
            config,
            committer,
        }
    }

    pub fn admin_client(&self) -> &Arc<dyn AdminClient> {
        &self.admin
    }

    pub fn config(&self) -> &RebalancerConfig {
        &self.config
    }

    /// Release the admin client
    pub async fn stop(&self) {
        self.admin.stop().await;
    }

    /// Move the cluster from `current` towards `target` for `stores`.
    ///
    /// Individual movement failures are recorded in the report. The run
    /// itself fails on an invalid configuration, an unavailable token or a
    /// planning error. A topology revert that could not be applied aborts the
    /// run with [`RebalanceError::Aborted`], which carries the report.
    #[instrument(skip_all, fields(stores = ?stores))]
    pub async fn rebalance(
        &self,
        current: Topology,
        target: Topology,
        stores: &[String],
    ) -> Result<RebalanceReport> {
        let start = Instant::now();
        self.config.validate()?;
        self.admin.set_topology(current.clone());

        match self.token.acquire().await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Rebalancing token held by another run");
                return Err(RebalanceError::TokenUnavailable);
            }
            Err(e) => {
                warn!(error = %e, "Rebalancing token request failed");
                return Err(RebalanceError::TokenUnavailable);
            }
        }

        self.committer.resume();
        let result = self.run(&current, target, stores, start).await;

        if let Err(e) = self.token.release().await {
            warn!(error = %e, "Failed to release rebalancing token");
        }
        result
    }

    async fn run(
        &self,
        current: &Topology,
        target: Topology,
        stores: &[String],
        start: Instant,
    ) -> Result<RebalanceReport> {
        let tasks = self.planner.plan(current, &target, stores).await?;

        info!(plan = %plan_summary(&tasks), "Rebalance plan");
        for task in &tasks {
            for descriptor in &task.descriptors {
                info!(stealer = task.stealer_id, %descriptor, "Planned movement");
            }
        }

        let state = Arc::new(RunState {
            admin: self.admin.clone(),
            committer: self.committer.clone(),
            migration_timeout: self.config.migration_timeout,
            target,
            queue: Mutex::new(tasks.into_iter().collect()),
            aborted: AtomicBool::new(false),
            fatal: Mutex::new(None),
            outcomes: Mutex::new(Vec::new()),
        });

        let handles: Vec<_> = (0..self.config.max_parallel_rebalancing)
            .map(|worker| {
                let state = state.clone();
                tokio::spawn(async move { state.run_worker(worker).await })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Rebalance worker panicked");
            }
        }

        // Entries nobody picked up after an abort
        let leftover: Vec<RebalanceTask> = state.queue.lock().drain(..).collect();
        for task in leftover {
            state.skip_all(task.descriptors);
        }

        let report = RebalanceReport {
            outcomes: std::mem::take(&mut *state.outcomes.lock()),
            duration: start.elapsed(),
        };
        info!(summary = %report.summary(), "Rebalance finished");

        let fatal = state.fatal.lock().take();
        match fatal {
            Some(source) => Err(RebalanceError::Aborted {
                report: Box::new(report),
                source: Box::new(source),
            }),
            None => Ok(report),
        }
    }

    /// Migrate every pending store of `descriptor`; see [`attempt_migration`]
    pub async fn attempt_migration(&self, descriptor: &mut MovementDescriptor) -> Result<()> {
        attempt_migration(
            self.admin.as_ref(),
            descriptor,
            self.config.migration_timeout,
        )
        .await
    }
}

/// Start and wait for a migration job per pending store, one store at a time.
///
/// Migrated stores are removed from the descriptor. A failed or timed out
/// store does not stop the remaining ones; all of them are reported together.
#[instrument(
    skip_all,
    fields(stealer = descriptor.stealer_id(), attempt = descriptor.attempt())
)]
pub async fn attempt_migration(
    admin: &dyn AdminClient,
    descriptor: &mut MovementDescriptor,
    migration_timeout: Duration,
) -> Result<()> {
    let stealer = descriptor.stealer_id();
    let stores = descriptor.stores_pending().to_vec();
    let mut failed_stores = Vec::new();

    for store in stores {
        match migrate_store(admin, descriptor, &store, migration_timeout).await {
            Ok(()) => {
                descriptor.complete_store(&store);
                debug!(store = %store, "Store migrated");
            }
            Err(e) => {
                warn!(store = %store, node = stealer, error = %e, "Store migration failed");
                failed_stores.push(store);
            }
        }
    }

    if failed_stores.is_empty() {
        Ok(())
    } else {
        Err(RebalanceError::MigrationFailed {
            descriptor: descriptor.to_string(),
            failed_stores,
        })
    }
}

async fn migrate_store(
    admin: &dyn AdminClient,
    descriptor: &MovementDescriptor,
    store: &str,
    migration_timeout: Duration,
) -> Result<()> {
    let node = descriptor.stealer_id();
    let job_id = admin.start_migration(store, descriptor).await?;

    match tokio::time::timeout(
        migration_timeout,
        admin.await_job(node, job_id, migration_timeout),
    )
    .await
    {
        Ok(result) => Ok(result?),
        Err(_) => Err(RebalanceError::MigrationTimeout {
            store: store.to_string(),
            node,
        }),
    }
}

/// State shared by the workers of one run
struct RunState {
    admin: Arc<dyn AdminClient>,
    committer: Arc<MetadataCommitter>,
    migration_timeout: Duration,
    target: Topology,
    queue: Mutex<VecDeque<RebalanceTask>>,
    aborted: AtomicBool,
    fatal: Mutex<Option<RebalanceError>>,
    outcomes: Mutex<Vec<DescriptorOutcome>>,
}

impl RunState {
    async fn run_worker(&self, worker: usize) {
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                break;
            }
            let Some(task) = self.queue.lock().pop_front() else {
                break;
            };
            self.process_task(worker, task).await;
        }
        debug!(worker, "Rebalance worker done");
    }

    async fn process_task(&self, worker: usize, task: RebalanceTask) {
        let stealer = task.stealer_id;

        if let Err(e) = self.committer.ensure_node(&self.target, stealer).await {
            if matches!(e, RebalanceError::CommitHalted) {
                self.skip_all(task.descriptors);
                return;
            }
            warn!(
                worker,
                stealer,
                error = %e,
                "Cannot add stealer node, skipping its movements"
            );
            let reason = e.to_string();
            for descriptor in task.descriptors {
                self.record(
                    descriptor,
                    OutcomeStatus::CommitFailed {
                        reason: reason.clone(),
                    },
                );
            }
            return;
        }

        let mut descriptors = task.descriptors.into_iter();
        while let Some(mut descriptor) = descriptors.next() {
            if self.aborted.load(Ordering::SeqCst) {
                self.skip_all(std::iter::once(descriptor).chain(descriptors));
                return;
            }

            debug!(worker, %descriptor, "Starting movement");
            match self.committer.commit(&descriptor).await {
                Ok(_) => {
                    let status = match attempt_migration(
                        self.admin.as_ref(),
                        &mut descriptor,
                        self.migration_timeout,
                    )
                    .await
                    {
                        Ok(()) => OutcomeStatus::Completed,
                        Err(e) => {
                            warn!(worker, error = %e, "Movement incomplete");
                            OutcomeStatus::MigrationFailed {
                                failed_stores: descriptor.stores_pending().to_vec(),
                            }
                        }
                    };
                    debug!(worker, %descriptor, %status, "Movement finished");
                    self.record(descriptor, status);
                }
                // Another worker's revert failed while this one waited on the lock
                Err(RebalanceError::CommitHalted) => {
                    debug!(worker, %descriptor, "Commit halted, skipping");
                    self.skip_all(std::iter::once(descriptor).chain(descriptors));
                    return;
                }
                Err(e) if e.is_run_fatal() => {
                    error!(worker, %descriptor, error = %e, "Aborting rebalance");
                    self.aborted.store(true, Ordering::SeqCst);
                    self.record(
                        descriptor,
                        OutcomeStatus::CommitFailed {
                            reason: e.to_string(),
                        },
                    );
                    self.fatal.lock().get_or_insert(e);
                    self.skip_all(descriptors);
                    return;
                }
                Err(e) => {
                    warn!(worker, %descriptor, error = %e, "Movement not committed");
                    self.record(
                        descriptor,
                        OutcomeStatus::CommitFailed {
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }
    }

    fn record(&self, descriptor: MovementDescriptor, status: OutcomeStatus) {
        self.outcomes
            .lock()
            .push(DescriptorOutcome::new(descriptor, status));
    }

    fn skip_all(&self, descriptors: impl IntoIterator<Item = MovementDescriptor>) {
        let mut outcomes = self.outcomes.lock();
        outcomes.extend(descriptors.into_iter().map(|d| {
            DescriptorOutcome::new(
                d,
                OutcomeStatus::Skipped {
                    reason: ABORT_REASON.to_string(),
                },
            )
        }));
    }
}
