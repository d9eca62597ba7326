//! # Meridian
//!
//! A Byzantine-fault-tolerant distributed ledger node. Nodes order
//! transactions into per-node rounds, link rounds into a directed acyclic
//! graph, and finalize each snapshot with a collective Schnorr signature
//! (CoSi) from 2/3+1 of the accepted consensus set. Finalized snapshots
//! receive a dense, monotonically increasing topological sequence number
//! and become the canonical history.
//!
//! The crate is organised around the consensus core:
//! - [`crypto`] — Ed25519-group scalars/points, Schnorr, CoSi aggregation
//! - [`address`] — four-key addresses and deterministic view-key derivation
//! - [`transaction`] — versioned transactions, UTXOs, ghost keys
//! - [`snapshot`] — the unit of consensus
//! - [`consensus`] — the round graph and the CoSi state machines
//! - [`node`] — storage, validation, the action loop, and the RPC surface
//! - [`network`] — wire protocol and authenticated peer sessions

pub mod address;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod genesis;
pub mod network;
pub mod node;
pub mod snapshot;
pub mod transaction;

/// Protocol constants shared across the cluster.
pub mod constants {
    /// Nanoseconds between rounds on a single node's chain (~½ s).
    pub const SNAPSHOT_ROUND_GAP: u64 = 500_000_000;
    /// Number of recent rounds a reference may reach back.
    pub const SNAPSHOT_REFERENCE_THRESHOLD: u64 = 10;
    /// Per-node round history window kept in memory.
    pub const ROUND_HISTORY_WINDOW: u64 = SNAPSHOT_REFERENCE_THRESHOLD + 2;
    /// Minimum time a pledged node waits before it can be accepted (12 h).
    pub const NODE_ACCEPT_PERIOD_MINIMUM: u64 = 12 * 60 * 60 * 1_000_000_000;
    /// Capacity of the bounded CoSi action channel.
    pub const MEMPOOL_SIZE: usize = 8192;
    /// Wall-clock lifetime of an in-flight CoSi instance.
    pub const COSI_TIMEOUT: u64 = 2 * SNAPSHOT_ROUND_GAP;
    /// Peer authentication message deadline in seconds.
    pub const AUTHENTICATION_TIMEOUT_SECS: u64 = 3;
    /// Maximum peer message size (16 MiB).
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Default TTL for the outbound dedup cache, seconds.
    pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
    /// Default cache tier budget in MB.
    pub const DEFAULT_MAX_CACHE_SIZE_MB: u64 = 128;
    /// Per-peer outbound queue depth for normal-priority messages.
    pub const PEER_QUEUE_NORMAL: usize = 1024;
    /// Per-peer outbound queue depth for high-priority messages.
    pub const PEER_QUEUE_HIGH: usize = 256;
    /// Units minted per yearly pool, distributed over daily batches.
    pub const MINT_POOL: u64 = 500_000 * 100_000_000;
    /// Daily mint batches per distribution year.
    pub const MINT_BATCHES_PER_YEAR: u64 = 365;
    /// The mint group the kernel distributes for.
    pub const MINT_GROUP_KERNEL: &str = "KERNELNODE";
    /// Stake required to pledge a new consensus node.
    pub const PLEDGE_AMOUNT: u64 = 10_000 * 100_000_000;
}

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 digest. All identifiers (nodes, transactions,
/// snapshots, rounds, networks) are hashes.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Digest arbitrary bytes.
    pub fn new(data: &[u8]) -> Self {
        Hash(*blake3::hash(data).as_bytes())
    }

    /// Combine this hash with a network identifier: `H(network ‖ self)`.
    ///
    /// Node ids and cache keys are always network-scoped so the same
    /// signer key yields distinct identities on distinct networks.
    pub fn for_network(&self, network: Hash) -> Hash {
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&network.0);
        buf[32..].copy_from_slice(&self.0);
        Hash::new(&buf)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(data: &[u8]) -> Option<Hash> {
        let bytes: [u8; 32] = data.try_into().ok()?;
        Some(Hash(bytes))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", hex::encode(&self.0[..8]))
    }
}

impl std::str::FromStr for Hash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Hash::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Current wall clock in nanoseconds since the UNIX epoch.
///
/// All protocol timestamps (snapshots, rounds, node records) are nanos.
pub fn clock_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_roundtrip() {
        let h = Hash::new(b"meridian");
        let s = h.to_string();
        assert_eq!(s.len(), 64);
        let back: Hash = s.parse().unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn hash_for_network_differs() {
        let h = Hash::new(b"node");
        let n1 = Hash::new(b"net1");
        let n2 = Hash::new(b"net2");
        assert_ne!(h.for_network(n1), h.for_network(n2));
        assert_ne!(h.for_network(n1), h);
    }

    #[test]
    fn hash_from_bad_hex_rejected() {
        assert!("zz".parse::<Hash>().is_err());
        assert!("abcd".parse::<Hash>().is_err());
    }
}
