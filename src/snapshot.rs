//! Snapshots: the unit of consensus.
//!
//! A snapshot is an atomic claim "transaction T sits at position
//! (node N, round R)". Its payload hash excludes the collective signature,
//! so the hash is stable across the signing rounds.

use serde::{Deserialize, Serialize};

use crate::crypto::CosiSignature;
use crate::Hash;

/// The `{self, external}` reference pair a round embeds: the predecessor
/// on the same node's chain and the chosen best round of another node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct References {
    #[serde(rename = "self")]
    pub self_: Hash,
    pub external: Hash,
}

impl References {
    pub fn new(self_: Hash, external: Hash) -> References {
        References { self_, external }
    }
}

/// A snapshot binding a transaction to a round-graph position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub node_id: Hash,
    pub round_number: u64,
    pub references: References,
    pub transaction: Hash,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: Option<CosiSignature>,
}

impl Snapshot {
    /// The digest of the snapshot content, excluding the signature.
    pub fn payload_hash(&self) -> Hash {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        let bytes = rmp_serde::to_vec(&unsigned).expect("snapshot payload encoding");
        Hash::new(&bytes)
    }

    pub fn marshal(&self) -> Vec<u8> {
        rmp_serde::to_vec(self).expect("snapshot encoding")
    }

    pub fn unmarshal(data: &[u8]) -> Option<Snapshot> {
        rmp_serde::from_slice(data).ok()
    }
}

/// A finalized snapshot together with its local topological sequence
/// number. The mapping `hash ↔ order` is bijective after finalization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWithTopologicalOrder {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub topological_order: u64,
}
