//! Cluster topology document
//!
//! A topology lists the storage nodes of a cluster and the primary partitions
//! each of them owns. Topologies are treated as values: every change produces
//! a new `Topology` derived from the previous one, the original is never
//! edited in place.

use crate::error::{KvMeshError, Result};
use crate::{NodeId, PartitionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A storage node and the primary partitions it owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub host: String,
    pub http_port: u16,
    pub socket_port: u16,
    pub admin_port: u16,
    /// Primary partitions, kept sorted and free of duplicates
    pub partitions: Vec<PartitionId>,
}

impl Node {
    /// Create a node, normalizing the partition list
    pub fn new(
        id: NodeId,
        host: impl Into<String>,
        http_port: u16,
        socket_port: u16,
        admin_port: u16,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) -> Self {
        Self {
            id,
            host: host.into(),
            http_port,
            socket_port,
            admin_port,
            partitions: normalize(partitions),
        }
    }

    /// Check whether this node owns the given partition
    pub fn owns(&self, partition: PartitionId) -> bool {
        self.partitions.binary_search(&partition).is_ok()
    }

    fn with_partitions(&self, partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        Self {
            partitions: normalize(partitions),
            ..self.clone()
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node(id={}, host={}, partitions={:?})",
            self.id, self.host, self.partitions
        )
    }
}

/// Cluster topology: the set of nodes and their partition assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    name: String,
    nodes: Vec<Node>,
}

impl Topology {
    /// Create a topology, rejecting repeated node ids and partitions owned
    /// by more than one node
    pub fn new(name: impl Into<String>, nodes: impl IntoIterator<Item = Node>) -> Result<Self> {
        let mut nodes: Vec<Node> = nodes.into_iter().collect();
        nodes.sort_by_key(|n| n.id);

        let topology = Self {
            name: name.into(),
            nodes,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Parse a topology from its JSON form and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: Topology = serde_json::from_str(json)?;
        // Re-run construction so ordering invariants hold for hand-written files
        Self::new(parsed.name, parsed.nodes)
    }

    /// Serialize the topology to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check that no node id repeats and no partition is owned twice
    pub fn validate(&self) -> Result<()> {
        if let Some(pair) = self.nodes.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(KvMeshError::DuplicateNode(pair[0].id));
        }

        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            for &partition in &node.partitions {
                if !seen.insert(partition) {
                    return Err(KvMeshError::DuplicatePartition { partition });
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes sorted by id
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes
            .binary_search_by_key(&id, |n| n.id)
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Find the node owning a partition
    pub fn partition_owner(&self, partition: PartitionId) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.owns(partition)).map(|n| n.id)
    }

    /// Total number of assigned partitions
    pub fn partition_count(&self) -> usize {
        self.nodes.iter().map(|n| n.partitions.len()).sum()
    }

    /// Return a new topology with the given nodes added.
    ///
    /// A node whose id already exists replaces the existing entry.
    pub fn with_nodes(&self, nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut merged = self.nodes.clone();
        for node in nodes {
            match merged.binary_search_by_key(&node.id, |n| n.id) {
                Ok(idx) => merged[idx] = node,
                Err(idx) => merged.insert(idx, node),
            }
        }
        Self {
            name: self.name.clone(),
            nodes: merged,
        }
    }

    /// Return a new topology where `partitions` move from `donor` to `stealer`.
    ///
    /// Partitions the donor does not own are still added to the stealer.
    /// Every other node keeps its assignment.
    pub fn reassign_partitions(
        &self,
        stealer: NodeId,
        donor: NodeId,
        partitions: &[PartitionId],
    ) -> Result<Self> {
        if stealer == donor {
            return Err(KvMeshError::SameNode(stealer));
        }
        let stealer_node = self.node(stealer).ok_or(KvMeshError::NodeNotFound(stealer))?;
        let donor_node = self.node(donor).ok_or(KvMeshError::NodeNotFound(donor))?;

        let moving: BTreeSet<PartitionId> = partitions.iter().copied().collect();

        let updated_stealer = stealer_node.with_partitions(
            stealer_node
                .partitions
                .iter()
                .copied()
                .chain(moving.iter().copied()),
        );
        let updated_donor = donor_node.with_partitions(
            donor_node
                .partitions
                .iter()
                .copied()
                .filter(|p| !moving.contains(p)),
        );

        // Any third node that still lists a moved partition keeps it; that is
        // a planner bug and the validation below surfaces it.
        let updated = self.with_nodes([updated_stealer, updated_donor]);
        updated.validate()?;
        Ok(updated)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topology({}", self.name)?;
        for node in &self.nodes {
            write!(f, ", {}:{:?}", node.id, node.partitions)?;
        }
        write!(f, ")")
    }
}

fn normalize(partitions: impl IntoIterator<Item = PartitionId>) -> Vec<PartitionId> {
    partitions
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
