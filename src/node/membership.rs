//! Consensus membership: the active node set, its deterministic ordering,
//! and the dynamic 2/3+1 threshold.
//!
//! Membership is recomputed from the store's node-state records on startup
//! and whenever an admission transaction finalizes. The result is published
//! to peer tasks as an immutable snapshot; only the action loop replaces it.

use std::collections::{HashMap, HashSet};

use crate::constants;
use crate::crypto::Key;
use crate::node::storage::{ConsensusNodeRecord, NodeState, SledStore, StoreError};
use crate::Hash;

/// Errors from membership computation. Threshold corruption is fatal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("consensus base {base} below genesis size {genesis}")]
    ThresholdBelowGenesis { base: usize, genesis: usize },
}

/// An immutable view of the consensus membership at one point in time.
#[derive(Clone, Debug, Default)]
pub struct Membership {
    /// Pledging, accepted, and departing records, sorted by
    /// `(timestamp, network id)` ascending.
    pub active_nodes: Vec<ConsensusNodeRecord>,
    /// The accepted subset, by network id.
    pub consensus_nodes: HashMap<Hash, ConsensusNodeRecord>,
    /// Accepted network ids in active order; mask indices address into
    /// this list.
    pub sorted_consensus_nodes: Vec<Hash>,
    /// The at-most-one pledging record.
    pub consensus_pledging: Option<ConsensusNodeRecord>,
    /// Our position in the sorted list, if accepted.
    pub consensus_index: Option<usize>,
    /// Network ids of the genesis nodes.
    pub genesis_nodes: HashSet<Hash>,
    pub network_id: Hash,
    pub my_id: Hash,
    /// Network epoch in nanoseconds; zero-timestamp records inherit it.
    pub epoch: u64,
}

impl Membership {
    /// Derive membership from the store's node records.
    pub fn load(
        store: &SledStore,
        network_id: Hash,
        my_id: Hash,
        genesis_nodes: HashSet<Hash>,
        epoch: u64,
    ) -> Result<Membership, MembershipError> {
        let mut active_nodes = Vec::new();
        let mut consensus_pledging = None;
        for mut record in store.read_consensus_nodes()? {
            if record.timestamp == 0 {
                record.timestamp = epoch;
            }
            match record.state {
                NodeState::Pledging => {
                    consensus_pledging = Some(record.clone());
                    active_nodes.push(record);
                }
                NodeState::Accepted | NodeState::Departing => active_nodes.push(record),
                NodeState::Resigning | NodeState::Cancelled | NodeState::Removed => {}
            }
        }
        active_nodes.sort_by(|a, b| {
            (a.timestamp, a.id_for_network(network_id))
                .cmp(&(b.timestamp, b.id_for_network(network_id)))
        });

        let mut consensus_nodes = HashMap::new();
        let mut sorted_consensus_nodes = Vec::new();
        for record in &active_nodes {
            if record.state == NodeState::Accepted {
                let id = record.id_for_network(network_id);
                consensus_nodes.insert(id, record.clone());
                sorted_consensus_nodes.push(id);
            }
        }
        let consensus_index = sorted_consensus_nodes.iter().position(|id| *id == my_id);

        Ok(Membership {
            active_nodes,
            consensus_nodes,
            sorted_consensus_nodes,
            consensus_pledging,
            consensus_index,
            genesis_nodes,
            network_id,
            my_id,
            epoch,
        })
    }

    /// The sorted public spend keys the CoSi mask indexes into.
    pub fn consensus_keys(&self) -> Vec<Key> {
        self.sorted_consensus_nodes
            .iter()
            .map(|id| self.consensus_nodes[id].signer.public_spend_key)
            .collect()
    }

    /// Mask index of a node, if accepted.
    pub fn node_index(&self, id: &Hash) -> Option<usize> {
        self.sorted_consensus_nodes.iter().position(|n| n == id)
    }

    /// The 2/3+1 threshold over the eligible base at `now`.
    ///
    /// The base counts accepted nodes past their reference window (genesis
    /// nodes unconditionally), departing nodes, and pledging nodes old
    /// enough that their pledge must have propagated. A base below the
    /// genesis size means the store is corrupt; the caller halts.
    pub fn consensus_threshold(&self, now: u64) -> Result<usize, MembershipError> {
        let window = constants::SNAPSHOT_REFERENCE_THRESHOLD * constants::SNAPSHOT_ROUND_GAP;
        let mut base = 0usize;
        for record in &self.active_nodes {
            match record.state {
                NodeState::Pledging => {
                    let maturity = constants::NODE_ACCEPT_PERIOD_MINIMUM - window * 3;
                    if record.timestamp + maturity < now {
                        base += 1;
                    }
                }
                NodeState::Accepted => {
                    let id = record.id_for_network(self.network_id);
                    if self.genesis_nodes.contains(&id) || record.timestamp + window < now {
                        base += 1;
                    }
                }
                NodeState::Departing => base += 1,
                _ => {}
            }
        }
        if base < self.genesis_nodes.len() {
            return Err(MembershipError::ThresholdBelowGenesis {
                base,
                genesis: self.genesis_nodes.len(),
            });
        }
        Ok(base * 2 / 3 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn record(seed: u8, state: NodeState, timestamp: u64) -> ConsensusNodeRecord {
        ConsensusNodeRecord {
            signer: Address::from_seed(&[seed; 64]),
            payee: Address::from_seed(&[seed.wrapping_add(100); 64]),
            state,
            timestamp,
        }
    }

    fn build(store: &SledStore, records: &[ConsensusNodeRecord]) {
        for r in records {
            store.write_consensus_node(r).unwrap();
        }
    }

    #[test]
    fn load_orders_by_timestamp_then_id() {
        let store = SledStore::open_temporary().unwrap();
        let network = Hash::new(b"net");
        let a = record(1, NodeState::Accepted, 300);
        let b = record(2, NodeState::Accepted, 100);
        let c = record(3, NodeState::Accepted, 100);
        build(&store, &[a.clone(), b.clone(), c.clone()]);

        let membership =
            Membership::load(&store, network, Hash::default(), HashSet::new(), 0).unwrap();
        assert_eq!(membership.active_nodes.len(), 3);
        assert_eq!(membership.sorted_consensus_nodes.len(), 3);
        // The two timestamp-100 records sort by network id.
        let b_id = b.id_for_network(network);
        let c_id = c.id_for_network(network);
        let expected_first = if b_id < c_id { b_id } else { c_id };
        assert_eq!(membership.sorted_consensus_nodes[0], expected_first);
        // Latest timestamp sorts last.
        assert_eq!(
            membership.sorted_consensus_nodes[2],
            a.id_for_network(network)
        );
    }

    #[test]
    fn load_is_idempotent() {
        let store = SledStore::open_temporary().unwrap();
        let network = Hash::new(b"net");
        build(
            &store,
            &[
                record(1, NodeState::Accepted, 10),
                record(2, NodeState::Pledging, 20),
                record(3, NodeState::Departing, 30),
                record(4, NodeState::Removed, 40),
            ],
        );
        let a = Membership::load(&store, network, Hash::default(), HashSet::new(), 0).unwrap();
        let b = Membership::load(&store, network, Hash::default(), HashSet::new(), 0).unwrap();
        assert_eq!(a.sorted_consensus_nodes, b.sorted_consensus_nodes);
        assert_eq!(a.active_nodes.len(), 3);
        assert!(a.consensus_pledging.is_some());
        // Removed records never enter the active set.
        assert_eq!(a.consensus_nodes.len(), 1);
    }

    #[test]
    fn threshold_counts_eligible_base() {
        let store = SledStore::open_temporary().unwrap();
        let network = Hash::new(b"net");
        let genesis_records = [
            record(1, NodeState::Accepted, 0),
            record(2, NodeState::Accepted, 0),
            record(3, NodeState::Accepted, 0),
            record(4, NodeState::Accepted, 0),
        ];
        build(&store, &genesis_records);
        let genesis: HashSet<Hash> = genesis_records
            .iter()
            .map(|r| r.id_for_network(network))
            .collect();

        let membership =
            Membership::load(&store, network, Hash::default(), genesis.clone(), 1).unwrap();
        // 4 genesis nodes → base 4 → threshold 3, regardless of age.
        assert_eq!(membership.consensus_threshold(2).unwrap(), 3);

        // A freshly accepted non-genesis node does not count yet.
        let young = record(9, NodeState::Accepted, 1_000_000);
        store.write_consensus_node(&young).unwrap();
        let membership =
            Membership::load(&store, network, Hash::default(), genesis.clone(), 1).unwrap();
        assert_eq!(membership.consensus_threshold(1_000_001).unwrap(), 3);

        // Once its reference window passes, the base grows to 5 → 4.
        let window = constants::SNAPSHOT_REFERENCE_THRESHOLD * constants::SNAPSHOT_ROUND_GAP;
        assert_eq!(
            membership
                .consensus_threshold(1_000_001 + window)
                .unwrap(),
            4
        );
    }

    #[test]
    fn threshold_below_genesis_is_fatal() {
        let store = SledStore::open_temporary().unwrap();
        let network = Hash::new(b"net");
        build(&store, &[record(1, NodeState::Accepted, 50)]);
        // Genesis claims three nodes, the store only yields one.
        let genesis: HashSet<Hash> = (10u8..13)
            .map(|s| record(s, NodeState::Accepted, 0).id_for_network(network))
            .collect();
        let membership =
            Membership::load(&store, network, Hash::default(), genesis, 1).unwrap();
        assert!(matches!(
            membership.consensus_threshold(u64::MAX / 2),
            Err(MembershipError::ThresholdBelowGenesis { .. })
        ));
    }

    #[test]
    fn consensus_keys_align_with_sorted_ids() {
        let store = SledStore::open_temporary().unwrap();
        let network = Hash::new(b"net");
        let records = [
            record(1, NodeState::Accepted, 10),
            record(2, NodeState::Accepted, 20),
        ];
        build(&store, &records);
        let membership =
            Membership::load(&store, network, Hash::default(), HashSet::new(), 0).unwrap();
        let keys = membership.consensus_keys();
        assert_eq!(keys.len(), 2);
        for (i, id) in membership.sorted_consensus_nodes.iter().enumerate() {
            assert_eq!(keys[i], membership.consensus_nodes[id].signer.public_spend_key);
            assert_eq!(membership.node_index(id), Some(i));
        }
    }
}
