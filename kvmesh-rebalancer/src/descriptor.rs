//! Movement descriptor
//!
//! Holds the partitions being moved or deleted between one stealer/donor
//! node pair, together with the stores still waiting to be migrated.
//!
//! A descriptor is a unit of progress, not only a plan: `stores_pending`
//! shrinks as stores finish and `attempt` grows when the caller retries.
//! Everything else is fixed at construction.

use crate::error::{RebalanceError, Result};
use kvmesh_core::{NodeId, PartitionId, Topology};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Replica tier (0 = primary) to ordered partition list
pub type ReplicaPartitions = BTreeMap<u32, Vec<PartitionId>>;

const KEY_STEALER: &str = "stealerId";
const KEY_DONOR: &str = "donorId";
const KEY_STORES: &str = "storesPending";
const KEY_ATTEMPT: &str = "attempt";
const KEY_MAX_REPLICAS: &str = "maxReplicas";
const KEY_TOPOLOGY: &str = "initialTopology";
const KEY_MOVE_PREFIX: &str = "replicaToPartitions";
const KEY_DELETE_PREFIX: &str = "replicaToDeletePartitions";

/// Partitions to move from a donor to a stealer, and the stores left to migrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementDescriptor {
    stealer_id: NodeId,
    donor_id: NodeId,
    replica_to_partitions: ReplicaPartitions,
    replica_to_delete_partitions: ReplicaPartitions,
    stores_pending: Vec<String>,
    attempt: u32,
    /// Topology before any change made for this descriptor. Key ownership for
    /// stores that are not partition-aware must be computed against it, not
    /// against the live topology.
    initial_topology: Topology,
    all_partitions: Vec<PartitionId>,
    max_replica_tier: u32,
}

impl MovementDescriptor {
    pub fn new(
        stealer_id: NodeId,
        donor_id: NodeId,
        replica_to_partitions: ReplicaPartitions,
        replica_to_delete_partitions: ReplicaPartitions,
        stores_pending: Vec<String>,
        initial_topology: Topology,
        attempt: u32,
    ) -> Result<Self> {
        if stealer_id == donor_id {
            return Err(RebalanceError::Descriptor(format!(
                "stealer and donor are both node {}",
                stealer_id
            )));
        }

        let replica_to_partitions = drop_empty_tiers(replica_to_partitions);
        let replica_to_delete_partitions = drop_empty_tiers(replica_to_delete_partitions);

        let all_partitions: Vec<PartitionId> = replica_to_partitions
            .values()
            .flatten()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let max_replica_tier = replica_to_partitions
            .keys()
            .chain(replica_to_delete_partitions.keys())
            .copied()
            .max()
            .unwrap_or(0);

        let mut seen = BTreeSet::new();
        let stores_pending = stores_pending
            .into_iter()
            .filter(|s| seen.insert(s.clone()))
            .collect();

        Ok(Self {
            stealer_id,
            donor_id,
            replica_to_partitions,
            replica_to_delete_partitions,
            stores_pending,
            attempt,
            initial_topology,
            all_partitions,
            max_replica_tier,
        })
    }

    pub fn stealer_id(&self) -> NodeId {
        self.stealer_id
    }

    pub fn donor_id(&self) -> NodeId {
        self.donor_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Bump the attempt counter before a retry
    pub fn next_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn initial_topology(&self) -> &Topology {
        &self.initial_topology
    }

    pub fn replica_to_partitions(&self) -> &ReplicaPartitions {
        &self.replica_to_partitions
    }

    pub fn replica_to_delete_partitions(&self) -> &ReplicaPartitions {
        &self.replica_to_delete_partitions
    }

    /// Primary (tier 0) partitions gained by the stealer
    pub fn primary_partitions(&self) -> &[PartitionId] {
        self.replica_to_partitions
            .get(&0)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All partitions moved, every replica tier included, sorted
    pub fn all_partitions(&self) -> &[PartitionId] {
        &self.all_partitions
    }

    pub fn max_replica_tier(&self) -> u32 {
        self.max_replica_tier
    }

    /// Stores not yet migrated for this descriptor
    pub fn stores_pending(&self) -> &[String] {
        &self.stores_pending
    }

    /// Mark a store as migrated. Returns false if it was not pending.
    pub fn complete_store(&mut self, store: &str) -> bool {
        let before = self.stores_pending.len();
        self.stores_pending.retain(|s| s != store);
        self.stores_pending.len() != before
    }

    /// Keep only the pending stores accepted by `keep`
    pub fn retain_stores<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.stores_pending.retain(|s| keep(s.as_str()));
    }

    pub fn is_complete(&self) -> bool {
        self.stores_pending.is_empty()
    }

    /// Encode into the flat key/value exchange form.
    ///
    /// Every tier from 0 to `maxReplicas` gets an entry in both maps, with an
    /// explicit empty list when the tier has nothing to move.
    pub fn to_map(&self) -> Result<Map<String, Value>> {
        let mut map = Map::new();
        map.insert(KEY_STEALER.to_string(), Value::from(self.stealer_id));
        map.insert(KEY_DONOR.to_string(), Value::from(self.donor_id));
        map.insert(
            KEY_STORES.to_string(),
            Value::from(self.stores_pending.clone()),
        );
        map.insert(KEY_ATTEMPT.to_string(), Value::from(self.attempt));
        map.insert(
            KEY_MAX_REPLICAS.to_string(),
            Value::from(self.max_replica_tier),
        );
        map.insert(
            KEY_TOPOLOGY.to_string(),
            Value::from(self.initial_topology.to_json()?),
        );

        for tier in 0..=self.max_replica_tier {
            map.insert(
                format!("{}{}", KEY_MOVE_PREFIX, tier),
                tier_value(&self.replica_to_partitions, tier),
            );
            map.insert(
                format!("{}{}", KEY_DELETE_PREFIX, tier),
                tier_value(&self.replica_to_delete_partitions, tier),
            );
        }

        Ok(map)
    }

    /// Decode from the flat key/value exchange form
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let stealer_id = get_u32(map, KEY_STEALER)?;
        let donor_id = get_u32(map, KEY_DONOR)?;
        let attempt = get_u32(map, KEY_ATTEMPT)?;
        let max_replicas = get_u32(map, KEY_MAX_REPLICAS)?;

        let stores_pending = get_array(map, KEY_STORES)?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid_field(KEY_STORES, "expected string"))
            })
            .collect::<Result<Vec<_>>>()?;

        let topology_json = map
            .get(KEY_TOPOLOGY)
            .ok_or_else(|| missing_field(KEY_TOPOLOGY))?
            .as_str()
            .ok_or_else(|| invalid_field(KEY_TOPOLOGY, "expected string"))?;
        let initial_topology = Topology::from_json(topology_json)
            .map_err(|e| invalid_field(KEY_TOPOLOGY, &e.to_string()))?;

        let mut replica_to_partitions = ReplicaPartitions::new();
        let mut replica_to_delete_partitions = ReplicaPartitions::new();
        for tier in 0..=max_replicas {
            let moved = get_partitions(map, &format!("{}{}", KEY_MOVE_PREFIX, tier))?;
            if !moved.is_empty() {
                replica_to_partitions.insert(tier, moved);
            }
            let deleted = get_partitions(map, &format!("{}{}", KEY_DELETE_PREFIX, tier))?;
            if !deleted.is_empty() {
                replica_to_delete_partitions.insert(tier, deleted);
            }
        }

        Self::new(
            stealer_id,
            donor_id,
            replica_to_partitions,
            replica_to_delete_partitions,
            stores_pending,
            initial_topology,
            attempt,
        )
    }

    /// Encode as a single-line JSON object
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(&self.to_map()?)
            .map_err(|e| RebalanceError::Descriptor(e.to_string()))
    }

    /// Decode from a JSON object produced by [`MovementDescriptor::to_json_string`]
    pub fn from_json_str(line: &str) -> Result<Self> {
        let map: Map<String, Value> = serde_json::from_str(line).map_err(|e| {
            RebalanceError::Descriptor(format!("failed to parse '{}': {}", line, e))
        })?;
        Self::from_map(&map)
    }
}

impl fmt::Display for MovementDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MovementDescriptor({} <--- {}, partitions moved",
            self.stealer_id, self.donor_id
        )?;
        for tier in 0..=self.max_replica_tier {
            write!(f, " - {:?}", tier_slice(&self.replica_to_partitions, tier))?;
        }
        write!(f, ", partitions deleted")?;
        for tier in 0..=self.max_replica_tier {
            write!(
                f,
                " - {:?}",
                tier_slice(&self.replica_to_delete_partitions, tier)
            )?;
        }
        write!(
            f,
            ", stores: {:?}, attempt: {})",
            self.stores_pending, self.attempt
        )
    }
}

fn drop_empty_tiers(tiers: ReplicaPartitions) -> ReplicaPartitions {
    tiers.into_iter().filter(|(_, p)| !p.is_empty()).collect()
}

fn tier_slice(tiers: &ReplicaPartitions, tier: u32) -> &[PartitionId] {
    tiers.get(&tier).map(Vec::as_slice).unwrap_or(&[])
}

fn tier_value(tiers: &ReplicaPartitions, tier: u32) -> Value {
    Value::from(tier_slice(tiers, tier).to_vec())
}

fn missing_field(key: &str) -> RebalanceError {
    RebalanceError::Descriptor(format!("missing field '{}'", key))
}

fn invalid_field(key: &str, reason: &str) -> RebalanceError {
    RebalanceError::Descriptor(format!("invalid field '{}': {}", key, reason))
}

fn get_array<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Vec<Value>> {
    map.get(key)
        .ok_or_else(|| missing_field(key))?
        .as_array()
        .ok_or_else(|| invalid_field(key, "expected array"))
}

fn get_u32(map: &Map<String, Value>, key: &str) -> Result<u32> {
    let raw = map
        .get(key)
        .ok_or_else(|| missing_field(key))?
        .as_u64()
        .ok_or_else(|| invalid_field(key, "expected unsigned integer"))?;
    u32::try_from(raw).map_err(|_| invalid_field(key, "out of range"))
}

fn get_partitions(map: &Map<String, Value>, key: &str) -> Result<Vec<PartitionId>> {
    get_array(map, key)?
        .iter()
        .map(|v| {
            v.as_u64()
                .and_then(|p| PartitionId::try_from(p).ok())
                .ok_or_else(|| invalid_field(key, "expected partition id"))
        })
        .collect()
}
