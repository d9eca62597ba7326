//! Genesis bootstrapping.
//!
//! `genesis.json` names the founding epoch and nodes. The network id is
//! the digest of the canonical genesis encoding; the bootstrap writes each
//! founding node an accepted record, a round-zero chain head, and a
//! finalized admission snapshot, so a fresh store replays into the same
//! graph on every node.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::node::storage::{ConsensusNodeRecord, NodeState, SledStore, StoreError};
use crate::snapshot::{References, Snapshot};
use crate::transaction::{
    Input, Output, Script, VersionedTransaction, OUTPUT_TYPE_NODE_ACCEPT,
};
use crate::Hash;

/// Errors from genesis loading and bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("cannot read genesis file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed genesis file: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("genesis requires at least one node")]
    Empty,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("store already bootstrapped for network {0}")]
    NetworkMismatch(Hash),
}

/// A founding node entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisNode {
    pub signer: Address,
    pub payee: Address,
    pub balance: u64,
}

/// A founding domain entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisDomain {
    pub signer: Address,
    pub balance: u64,
}

/// The parsed genesis file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Genesis {
    /// Founding epoch, seconds since the UNIX epoch.
    pub epoch: u64,
    pub nodes: Vec<GenesisNode>,
    #[serde(default)]
    pub domains: Vec<GenesisDomain>,
}

impl Genesis {
    pub fn load(dir: &Path) -> Result<Genesis, GenesisError> {
        let raw = std::fs::read_to_string(dir.join("genesis.json"))?;
        let genesis: Genesis = serde_json::from_str(&raw)?;
        if genesis.nodes.is_empty() {
            return Err(GenesisError::Empty);
        }
        Ok(genesis)
    }

    /// The network identity: digest of the canonical genesis encoding.
    pub fn network_id(&self) -> Hash {
        let bytes = rmp_serde::to_vec(self).expect("genesis encoding");
        Hash::new(&bytes)
    }

    pub fn epoch_nanos(&self) -> u64 {
        self.epoch * 1_000_000_000
    }

    /// Network ids of the founding nodes.
    pub fn node_ids(&self) -> HashSet<Hash> {
        let network = self.network_id();
        self.nodes
            .iter()
            .map(|n| n.signer.hash().for_network(network))
            .collect()
    }

    /// The admission transaction of one founding node.
    pub fn node_transaction(&self, index: usize) -> VersionedTransaction {
        let node = &self.nodes[index];
        let mut tx = VersionedTransaction::new(self.network_id());
        tx.inputs.push(Input {
            genesis: (index as u64).to_be_bytes().to_vec(),
            ..Default::default()
        });
        tx.outputs.push(Output {
            output_type: OUTPUT_TYPE_NODE_ACCEPT,
            amount: node.balance,
            keys: vec![node.signer.public_spend_key],
            script: Script::operator(1),
            mask: node.signer.public_view_key,
        });
        tx
    }

    /// Materialise the genesis graph into an empty store: node records,
    /// round-zero heads, and one finalized admission snapshot per node.
    /// Idempotent across restarts; refuses a store bootstrapped for a
    /// different network.
    pub fn bootstrap(&self, store: &SledStore) -> Result<Hash, GenesisError> {
        let network = self.network_id();
        if let Some(existing) = store.state_get::<Hash>("network")? {
            if existing != network {
                return Err(GenesisError::NetworkMismatch(existing));
            }
            return Ok(network);
        }

        let epoch = self.epoch_nanos();
        for (index, node) in self.nodes.iter().enumerate() {
            store.write_consensus_node(&ConsensusNodeRecord {
                signer: node.signer,
                payee: node.payee,
                state: NodeState::Accepted,
                timestamp: epoch,
            })?;

            let node_id = node.signer.hash().for_network(network);
            store.start_round(node_id, 0, epoch, References::default())?;

            let tx = self.node_transaction(index);
            let snapshot = Snapshot {
                node_id,
                round_number: 0,
                references: References::default(),
                transaction: tx.payload_hash(),
                timestamp: epoch,
                signature: None,
            };
            store.write_finalized_snapshot(&snapshot, &tx)?;
        }
        store.state_set("network", &network)?;
        store.flush()?;
        Ok(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_genesis(n: u8) -> Genesis {
        Genesis {
            epoch: 1_700_000_000,
            nodes: (0..n)
                .map(|i| GenesisNode {
                    signer: Address::from_seed(&[i + 1; 64]),
                    payee: Address::from_seed(&[i + 50; 64]),
                    balance: 10_000,
                })
                .collect(),
            domains: vec![],
        }
    }

    #[test]
    fn network_id_deterministic() {
        let g = sample_genesis(3);
        assert_eq!(g.network_id(), g.network_id());
        assert_ne!(g.network_id(), sample_genesis(4).network_id());
    }

    #[test]
    fn bootstrap_builds_graph() {
        let g = sample_genesis(3);
        let store = SledStore::open_temporary().unwrap();
        let network = g.bootstrap(&store).unwrap();

        assert_eq!(store.state_get::<Hash>("network").unwrap(), Some(network));
        assert_eq!(store.read_consensus_nodes().unwrap().len(), 3);
        // Every founding node has a round-zero head and one finalized
        // admission snapshot; topology is dense from zero.
        assert_eq!(store.topology_sequence(), 3);
        for id in g.node_ids() {
            assert_eq!(store.read_round_head(id).unwrap(), Some(0));
            assert_eq!(
                store.read_snapshots_for_node_round(id, 0).unwrap().len(),
                1
            );
        }
    }

    #[test]
    fn bootstrap_idempotent() {
        let g = sample_genesis(2);
        let store = SledStore::open_temporary().unwrap();
        g.bootstrap(&store).unwrap();
        g.bootstrap(&store).unwrap();
        assert_eq!(store.topology_sequence(), 2);
    }

    #[test]
    fn bootstrap_refuses_other_network() {
        let store = SledStore::open_temporary().unwrap();
        sample_genesis(2).bootstrap(&store).unwrap();
        let other = sample_genesis(3);
        assert!(matches!(
            other.bootstrap(&store),
            Err(GenesisError::NetworkMismatch(_))
        ));
    }

    #[test]
    fn genesis_transactions_are_admissions() {
        let g = sample_genesis(1);
        let tx = g.node_transaction(0);
        assert_eq!(
            tx.transaction_type(),
            crate::transaction::TransactionType::NodeAccept
        );
        assert!(!tx.inputs[0].is_spend());
    }
}
