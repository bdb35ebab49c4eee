//! Rebalance planning
//!
//! The orchestrator consumes a plan as a queue of per-stealer task lists.
//! Computing the diff between two topologies is left to a [`MovementPlanner`]
//! implementation; [`StaticPlanner`] replays a pre-built plan.

use crate::descriptor::MovementDescriptor;
use crate::error::{RebalanceError, Result};
use kvmesh_core::{NodeId, Topology};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, instrument};

/// All movements for one stealer node, processed strictly in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceTask {
    pub stealer_id: NodeId,
    pub descriptors: Vec<MovementDescriptor>,
}

impl RebalanceTask {
    pub fn new(stealer_id: NodeId, descriptors: Vec<MovementDescriptor>) -> Self {
        Self {
            stealer_id,
            descriptors,
        }
    }
}

/// Group descriptors per stealer, keeping first-appearance order of stealers
/// and the relative order of descriptors within a stealer.
pub fn group_by_stealer(
    descriptors: impl IntoIterator<Item = MovementDescriptor>,
) -> Vec<RebalanceTask> {
    let mut tasks: Vec<RebalanceTask> = Vec::new();
    for descriptor in descriptors {
        let stealer = descriptor.stealer_id();
        match tasks.iter_mut().find(|t| t.stealer_id == stealer) {
            Some(task) => task.descriptors.push(descriptor),
            None => tasks.push(RebalanceTask::new(stealer, vec![descriptor])),
        }
    }
    tasks
}

/// Summary of a plan
pub fn plan_summary(tasks: &[RebalanceTask]) -> String {
    let descriptors: usize = tasks.iter().map(|t| t.descriptors.len()).sum();
    let partitions: usize = tasks
        .iter()
        .flat_map(|t| &t.descriptors)
        .map(|d| d.all_partitions().len())
        .sum();
    format!(
        "{} stealer nodes, {} movements, {} partitions",
        tasks.len(),
        descriptors,
        partitions
    )
}

/// Source of the ordered movement plan for a rebalance run
#[async_trait::async_trait]
pub trait MovementPlanner: Send + Sync {
    async fn plan(
        &self,
        current: &Topology,
        target: &Topology,
        stores: &[String],
    ) -> Result<Vec<RebalanceTask>>;
}

/// Planner replaying a pre-built list of descriptors
#[derive(Debug, Clone, Default)]
pub struct StaticPlanner {
    descriptors: Vec<MovementDescriptor>,
}

impl StaticPlanner {
    pub fn new(descriptors: Vec<MovementDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Parse one JSON-encoded descriptor per line; blank lines are skipped
    pub fn from_jsonl(input: &str) -> Result<Self> {
        let descriptors = input
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(MovementDescriptor::from_json_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(descriptors))
    }

    /// Load a plan file written by [`StaticPlanner::to_jsonl`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            RebalanceError::Planner(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_jsonl(&input)
    }

    /// Encode the plan, one descriptor per line
    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for descriptor in &self.descriptors {
            out.push_str(&descriptor.to_json_string()?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn descriptors(&self) -> &[MovementDescriptor] {
        &self.descriptors
    }
}

#[async_trait::async_trait]
impl MovementPlanner for StaticPlanner {
    #[instrument(skip_all, fields(descriptors = self.descriptors.len()))]
    async fn plan(
        &self,
        current: &Topology,
        target: &Topology,
        stores: &[String],
    ) -> Result<Vec<RebalanceTask>> {
        let wanted: HashSet<&str> = stores.iter().map(String::as_str).collect();
        let mut selected = Vec::with_capacity(self.descriptors.len());

        for descriptor in &self.descriptors {
            if !current.contains_node(descriptor.donor_id()) {
                return Err(RebalanceError::Planner(format!(
                    "donor node {} of {} is not in the current topology",
                    descriptor.donor_id(),
                    descriptor
                )));
            }
            if !current.contains_node(descriptor.stealer_id())
                && !target.contains_node(descriptor.stealer_id())
            {
                return Err(RebalanceError::Planner(format!(
                    "stealer node {} of {} is in neither topology",
                    descriptor.stealer_id(),
                    descriptor
                )));
            }

            let mut descriptor = descriptor.clone();
            descriptor.retain_stores(|s| wanted.contains(s));
            if descriptor.is_complete() {
                debug!(%descriptor, "No requested store left, dropping movement");
                continue;
            }
            selected.push(descriptor);
        }

        let tasks = group_by_stealer(selected);
        info!(summary = %plan_summary(&tasks), "Static plan loaded");
        Ok(tasks)
    }
}
