//! KvMesh Rebalancer
//!
//! # Commands
//! - `show-plan` - Decode a movement plan and print it per stealer node
//! - `dry-run` - Run a plan against an in-memory cluster and print the outcome

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kvmesh_core::Topology;
use kvmesh_rebalancer::{
    group_by_stealer, plan_summary, AdminClient, LocalRebalancingToken, RebalanceOrchestrator,
    RebalanceReport, RebalancerConfig, RollbackTargets, SimulatedCluster, StaticPlanner,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "kvmesh-rebalancer")]
#[command(about = "KvMesh partition rebalancing tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a movement plan grouped per stealer node
    ShowPlan {
        /// Plan file, one JSON descriptor per line
        #[arg(long)]
        plan: PathBuf,
    },

    /// Execute a plan against a simulated cluster
    DryRun {
        /// Current topology (JSON)
        #[arg(long)]
        current: PathBuf,

        /// Target topology (JSON)
        #[arg(long)]
        target: PathBuf,

        /// Plan file, one JSON descriptor per line
        #[arg(long)]
        plan: PathBuf,

        /// Stores to migrate
        #[arg(long, value_delimiter = ',', required = true)]
        stores: Vec<String>,

        /// Worker pool size
        #[arg(long, env = "REBALANCER_MAX_PARALLEL")]
        parallelism: Option<usize>,

        /// Per-store migration timeout in seconds
        #[arg(long, env = "REBALANCER_MIGRATION_TIMEOUT_SECS")]
        timeout_secs: Option<u64>,

        /// Refuse commits when stealer and donor clocks are identical
        #[arg(long, default_value = "false")]
        strict_clocks: bool,

        /// Nodes receiving the revert of a failed commit (affected, none)
        #[arg(long, env = "REBALANCER_ROLLBACK_TARGETS")]
        rollback_targets: Option<RollbackTargets>,
    },
}

fn read_topology(path: &Path) -> Result<Topology> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Topology::from_json(&json).with_context(|| format!("invalid topology in {}", path.display()))
}

fn show_plan(plan: &Path) -> Result<()> {
    let planner = StaticPlanner::from_file(plan)?;
    let tasks = group_by_stealer(planner.descriptors().iter().cloned());

    println!("Plan: {}", plan_summary(&tasks));
    for task in &tasks {
        println!();
        println!("Stealer node {}:", task.stealer_id);
        for descriptor in &task.descriptors {
            println!("  {}", descriptor);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn dry_run(
    current: &Path,
    target: &Path,
    plan: &Path,
    stores: Vec<String>,
    parallelism: Option<usize>,
    timeout_secs: Option<u64>,
    strict_clocks: bool,
    rollback_targets: Option<RollbackTargets>,
) -> Result<()> {
    let current = read_topology(current)?;
    let target = read_topology(target)?;
    let planner = StaticPlanner::from_file(plan)?;

    let defaults = RebalancerConfig::default();
    // Every simulated node starts from the same empty clock
    let config = RebalancerConfig {
        max_parallel_rebalancing: parallelism.unwrap_or(defaults.max_parallel_rebalancing),
        migration_timeout: timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.migration_timeout),
        accept_identical_clocks: !strict_clocks,
        rollback_targets: rollback_targets.unwrap_or(defaults.rollback_targets),
    };
    config.validate()?;

    let cluster = Arc::new(SimulatedCluster::new(current.clone()));
    for node in target.nodes() {
        if !current.contains_node(node.id) {
            cluster.set_remote_view(
                node.id,
                kvmesh_core::VersionedTopology::new(current.clone(), Default::default()),
            );
        }
    }

    info!(
        nodes = current.nodes().len(),
        parallelism = config.max_parallel_rebalancing,
        "Starting dry run"
    );

    let orchestrator = RebalanceOrchestrator::new(
        cluster.clone() as Arc<dyn AdminClient>,
        Arc::new(planner),
        Arc::new(LocalRebalancingToken::new()),
        config,
    );
    let result = orchestrator.rebalance(current, target, &stores).await;
    orchestrator.stop().await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if let Some(report) = e.report() {
                print_report(report);
            }
            return Err(e.into());
        }
    };
    print_report(&report);

    println!();
    println!("Final topology:");
    println!("{}", cluster.topology());
    Ok(())
}

fn print_report(report: &RebalanceReport) {
    println!("Result: {}", report.summary());
    for outcome in &report.outcomes {
        println!("  {} -> {}", outcome.descriptor, outcome.status);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ShowPlan { plan } => show_plan(&plan),
        Commands::DryRun {
            current,
            target,
            plan,
            stores,
            parallelism,
            timeout_secs,
            strict_clocks,
            rollback_targets,
        } => {
            dry_run(
                &current,
                &target,
                &plan,
                stores,
                parallelism,
                timeout_secs,
                strict_clocks,
                rollback_targets,
            )
            .await
        }
    }
}
