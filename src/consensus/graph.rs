//! The round graph: every node owns a chain of rounds, each round embeds a
//! `{self, external}` reference pair, and the external references weave the
//! per-node chains into a DAG.
//!
//! A round is a *cache round* while it grows and a *final round* once the
//! leader begins a higher number. Cross-node references are by value
//! (`node_id`, `number`, `hash`), never by pointer.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::snapshot::{References, Snapshot};
use crate::Hash;

/// A node only becomes eligible as an external reference once its earliest
/// tracked round is past the warm-up horizon.
pub const ROUND_WARMUP_HORIZON: u64 = 7 + 2 * constants::SNAPSHOT_REFERENCE_THRESHOLD;

/// A sealed (or sealing) segment of a node's chain. `end` and `hash` are
/// zero while the round is still the growing head.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalRound {
    pub node_id: Hash,
    pub number: u64,
    pub start: u64,
    pub end: u64,
    pub hash: Hash,
    pub references: References,
}

impl FinalRound {
    pub fn is_sealed(&self) -> bool {
        !self.hash.is_zero()
    }
}

/// The growing tip of a node's chain, with its accumulated snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRound {
    pub node_id: Hash,
    pub number: u64,
    pub timestamp: u64,
    pub references: References,
    pub snapshots: Vec<Snapshot>,
}

impl CacheRound {
    pub fn new(node_id: Hash, number: u64, timestamp: u64, references: References) -> CacheRound {
        CacheRound {
            node_id,
            number,
            timestamp,
            references,
            snapshots: Vec::new(),
        }
    }

    /// Whether a snapshot may be appended: position matches and the
    /// timestamp is monotone within the round.
    pub fn check_snapshot(&self, snapshot: &Snapshot) -> bool {
        if snapshot.node_id != self.node_id || snapshot.round_number != self.number {
            return false;
        }
        if snapshot.timestamp < self.timestamp {
            return false;
        }
        if let Some(last) = self.snapshots.last() {
            if snapshot.timestamp < last.timestamp {
                return false;
            }
        }
        !self
            .snapshots
            .iter()
            .any(|s| s.transaction == snapshot.transaction)
    }

    pub fn append(&mut self, snapshot: Snapshot) {
        self.snapshots.push(snapshot);
    }

    /// Seal this round. Returns `None` while the round is empty; an empty
    /// head cannot be referenced.
    pub fn as_final(&self) -> Option<FinalRound> {
        let first = self.snapshots.first()?;
        let last = self.snapshots.last()?;
        let start = first.timestamp;
        let end = last.timestamp;
        Some(FinalRound {
            node_id: self.node_id,
            number: self.number,
            start,
            end,
            hash: round_hash(self.node_id, self.number, start, end, &self.snapshots),
            references: self.references,
        })
    }
}

/// The chained commitment over a round's sealed snapshots.
pub fn round_hash(node_id: Hash, number: u64, start: u64, end: u64, snapshots: &[Snapshot]) -> Hash {
    let mut buf = Vec::with_capacity(32 + 24);
    buf.extend_from_slice(&node_id.0);
    buf.extend_from_slice(&number.to_be_bytes());
    buf.extend_from_slice(&start.to_be_bytes());
    buf.extend_from_slice(&end.to_be_bytes());
    let mut acc = Hash::new(&buf);
    for snapshot in snapshots {
        let mut step = [0u8; 64];
        step[..32].copy_from_slice(&acc.0);
        step[32..].copy_from_slice(&snapshot.payload_hash().0);
        acc = Hash::new(&step);
    }
    acc
}

/// A peer's view of the tip of one node's chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub node_id: Hash,
    pub number: u64,
    pub hash: Hash,
}

/// The in-memory round graph owned by the action loop.
#[derive(Debug, Default)]
pub struct RoundGraph {
    pub my_node_id: Hash,
    /// Our growing tip.
    pub my_cache_round: Option<CacheRound>,
    /// Number of our latest sealed round.
    pub my_final_number: u64,
    /// Per-node window of recent final rounds, ascending by number.
    pub round_history: HashMap<Hash, Vec<FinalRound>>,
    /// Advertised tips, one per tracked node.
    pub final_cache: Vec<SyncPoint>,
}

impl RoundGraph {
    /// Record a sealed round in a node's history, trimming the window.
    pub fn push_final(&mut self, round: FinalRound) {
        let history = self.round_history.entry(round.node_id).or_default();
        if history.last().map(|r| r.number) == Some(round.number) {
            // Re-sealing the same number replaces the entry.
            history.pop();
        }
        history.push(round);
        let window = constants::ROUND_HISTORY_WINDOW as usize;
        if history.len() > window {
            let excess = history.len() - window;
            history.drain(..excess);
        }
    }

    /// Recompute the advertised tips from history.
    pub fn update_final_cache(&mut self) {
        let mut cache: Vec<SyncPoint> = self
            .round_history
            .values()
            .filter_map(|rounds| rounds.last())
            .map(|r| SyncPoint {
                node_id: r.node_id,
                number: r.number,
                hash: r.hash,
            })
            .collect();
        cache.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        self.final_cache = cache;
    }

    /// Latest sealed round of a node, if tracked.
    pub fn final_round(&self, node_id: &Hash) -> Option<&FinalRound> {
        self.round_history.get(node_id).and_then(|r| r.last())
    }

    /// Choose the external reference for a round started at `round_time`.
    ///
    /// Candidates are other nodes' earliest tracked rounds; skip rules:
    /// non-genesis nodes still warming up, rounds started after
    /// `round_time`, and rounds too recent to be stable. The winner
    /// maximizes `(history_len, start)` lexicographically.
    pub fn determine_best_round(
        &self,
        genesis_nodes: &HashSet<Hash>,
        round_time: u64,
        now: u64,
    ) -> Option<FinalRound> {
        let mut best: Option<FinalRound> = None;
        let (mut start, mut height) = (0u64, 0u64);
        for (id, rounds) in &self.round_history {
            let head = match rounds.first() {
                Some(r) => r,
                None => continue,
            };
            if !genesis_nodes.contains(id) && head.number < ROUND_WARMUP_HORIZON {
                continue;
            }
            let (rts, rh) = (head.start, rounds.len() as u64);
            if *id == self.my_node_id || rh < height {
                continue;
            }
            if rts > round_time {
                continue;
            }
            if rts + constants::SNAPSHOT_ROUND_GAP * rh > now {
                continue;
            }
            if rh > height || rts > start {
                best = Some(head.clone());
                start = rts;
                height = rh;
            }
        }
        best
    }
}
