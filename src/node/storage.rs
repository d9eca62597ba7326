//! The persistent graph store, backed by sled.
//!
//! All graph data lives in one keyspace under typed key prefixes, so every
//! multi-key update runs inside a single sled transaction and crash
//! recovery always reads a consistent graph.
//!
//! Key layout:
//! - `SNAPSHOT ‖ node_id ‖ round_be ‖ tx_hash` → snapshot
//! - `TOPOLOGY ‖ order_be` → snapshot key
//! - `SNAPTOPO ‖ payload_hash` → `order_be`
//! - `FINAL ‖ tx_hash` → payload hash (presence = finalized)
//! - `TX ‖ tx_hash` / `CACHETX ‖ tx_hash` → transaction tiers
//! - `UTXO ‖ tx_hash ‖ index_be` → UTXO with lock
//! - `MINT ‖ group ‖ batch_be` → mint distribution
//! - `ROUND ‖ node_id ‖ number_be`, `ROUNDHEAD ‖ node_id`,
//!   `ROUNDHASH ‖ hash`, `LINK ‖ from ‖ to` → round records and indexes
//! - `NODE ‖ signer_key` → consensus node record
//! - `STATE ‖ name` → singleton process state
//! - `QUEUE ‖ id_be` → deferred snapshots

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};

use crate::address::Address;
use crate::consensus::graph::FinalRound;
use crate::snapshot::{References, Snapshot, SnapshotWithTopologicalOrder};
use crate::transaction::{MintData, MintDistribution, Utxo, UtxoWithLock, VersionedTransaction};
use crate::{clock_nanos, Hash};

const PREFIX_SNAPSHOT: &[u8] = b"SNAPSHOT";
const PREFIX_TOPOLOGY: &[u8] = b"TOPOLOGY";
const PREFIX_SNAP_TOPO: &[u8] = b"SNAPTOPO";
const PREFIX_FINAL: &[u8] = b"FINAL";
const PREFIX_TX: &[u8] = b"TX";
const PREFIX_CACHE_TX: &[u8] = b"CACHETX";
const PREFIX_UTXO: &[u8] = b"UTXO";
const PREFIX_MINT: &[u8] = b"MINT";
const PREFIX_ROUND: &[u8] = b"ROUND";
const PREFIX_ROUND_HEAD: &[u8] = b"ROUNDHEAD";
const PREFIX_ROUND_HASH: &[u8] = b"ROUNDHASH";
const PREFIX_LINK: &[u8] = b"LINK";
const PREFIX_NODE: &[u8] = b"NODE";
const PREFIX_STATE: &[u8] = b"STATE";
const PREFIX_QUEUE: &[u8] = b"QUEUE";

/// Errors from store operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("round {number} of node {node} is not empty")]
    RoundNotEmpty { node: Hash, number: u64 },
    #[error("input {hash}:{index} locked for transaction {by}")]
    InputLocked { hash: Hash, index: usize, by: Hash },
    #[error("input {hash}:{index} not found")]
    MissingUtxo { hash: Hash, index: usize },
    #[error("mint batch {batch} locked for transaction {by} amount {amount}")]
    MintLocked { batch: u64, by: Hash, amount: u64 },
    #[error("graph corruption: {0}")]
    Corrupt(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> StoreError {
        StoreError::Io(e.to_string())
    }
}

fn unpack_txn_error(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(e) => StoreError::Io(e.to_string()),
    }
}

fn enc<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    rmp_serde::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    rmp_serde::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn compose(prefix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + parts.iter().map(|p| p.len()).sum::<usize>());
    key.extend_from_slice(prefix);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

fn snapshot_entry_key(node_id: Hash, number: u64, transaction: Hash) -> Vec<u8> {
    compose(
        PREFIX_SNAPSHOT,
        &[&node_id.0, &number.to_be_bytes(), &transaction.0],
    )
}

fn topology_key(order: u64) -> Vec<u8> {
    compose(PREFIX_TOPOLOGY, &[&order.to_be_bytes()])
}

fn round_record_key(node_id: Hash, number: u64) -> Vec<u8> {
    compose(PREFIX_ROUND, &[&node_id.0, &number.to_be_bytes()])
}

fn utxo_entry_key(hash: Hash, index: usize) -> Vec<u8> {
    compose(PREFIX_UTXO, &[&hash.0, &(index as u64).to_be_bytes()])
}

fn mint_entry_key(group: &str, batch: u64) -> Vec<u8> {
    compose(PREFIX_MINT, &[group.as_bytes(), &batch.to_be_bytes()])
}

/// Membership state of a consensus node record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Pledging,
    Accepted,
    Departing,
    Resigning,
    Cancelled,
    Removed,
}

/// A consensus node record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusNodeRecord {
    pub signer: Address,
    pub payee: Address,
    pub state: NodeState,
    pub timestamp: u64,
}

impl ConsensusNodeRecord {
    /// The node's network-scoped identity.
    pub fn id_for_network(&self, network: Hash) -> Hash {
        self.signer.hash().for_network(network)
    }
}

/// A snapshot deferred for later ingestion by the action loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedSnapshot {
    pub peer_id: Hash,
    pub snapshot: Snapshot,
    pub finalized: bool,
}

/// A cache-tier transaction with its insertion time, for TTL eviction.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct CachedTransaction {
    inserted_at: u64,
    tx: VersionedTransaction,
}

/// The sled-backed graph store.
pub struct SledStore {
    db: sled::Db,
    graph: sled::Tree,
    topology_counter: AtomicU64,
    queue_counter: AtomicU64,
}

impl SledStore {
    /// Open or create the store at the given directory.
    pub fn open(path: &Path) -> Result<SledStore, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// Open a temporary in-memory store (for testing).
    pub fn open_temporary() -> Result<SledStore, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<SledStore, StoreError> {
        let graph = db.open_tree("graph")?;

        let last_under = |prefix: &[u8]| -> Result<Option<u64>, StoreError> {
            let mut upper = prefix.to_vec();
            upper.extend_from_slice(&u64::MAX.to_be_bytes());
            match graph.range(prefix.to_vec()..=upper).next_back() {
                Some(entry) => {
                    let (key, _) = entry?;
                    let bytes: [u8; 8] = key[prefix.len()..]
                        .try_into()
                        .map_err(|_| StoreError::Corrupt("sequence key length".into()))?;
                    Ok(Some(u64::from_be_bytes(bytes)))
                }
                None => Ok(None),
            }
        };

        let topology_counter =
            AtomicU64::new(last_under(PREFIX_TOPOLOGY)?.map(|n| n + 1).unwrap_or(0));
        let queue_counter = AtomicU64::new(last_under(PREFIX_QUEUE)?.map(|n| n + 1).unwrap_or(0));

        Ok(SledStore {
            db,
            graph,
            topology_counter,
            queue_counter,
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn get_decoded<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.graph.get(key)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── Singleton process state ──

    pub fn state_set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.graph
            .insert(compose(PREFIX_STATE, &[key.as_bytes()]), enc(value)?)?;
        Ok(())
    }

    pub fn state_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.get_decoded(&compose(PREFIX_STATE, &[key.as_bytes()]))
    }

    // ── Consensus node records ──

    pub fn write_consensus_node(&self, record: &ConsensusNodeRecord) -> Result<(), StoreError> {
        let key = compose(PREFIX_NODE, &[&record.signer.public_spend_key.0]);
        self.graph.insert(key, enc(record)?)?;
        Ok(())
    }

    pub fn read_consensus_nodes(&self) -> Result<Vec<ConsensusNodeRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.graph.scan_prefix(PREFIX_NODE) {
            let (_, value) = entry?;
            records.push(dec(&value)?);
        }
        Ok(records)
    }

    // ── Rounds ──

    /// Begin a node's round: write the growing record and move the head.
    pub fn start_round(
        &self,
        node_id: Hash,
        number: u64,
        timestamp: u64,
        references: References,
    ) -> Result<(), StoreError> {
        let record = FinalRound {
            node_id,
            number,
            start: timestamp,
            end: 0,
            hash: Hash::default(),
            references,
        };
        let value = enc(&record)?;
        self.graph
            .transaction(|t| {
                t.insert(round_record_key(node_id, number), value.clone())?;
                t.insert(
                    compose(PREFIX_ROUND_HEAD, &[&node_id.0]),
                    number.to_be_bytes().to_vec(),
                )?;
                Ok(())
            })
            .map_err(unpack_txn_error)
    }

    /// Seal a round: persist its hash and end, and index the hash.
    pub fn seal_round(&self, round: &FinalRound) -> Result<(), StoreError> {
        let value = enc(round)?;
        let record_key = round_record_key(round.node_id, round.number);
        let hash_key = compose(PREFIX_ROUND_HASH, &[&round.hash.0]);
        self.graph
            .transaction(|t| {
                t.insert(record_key.clone(), value.clone())?;
                t.insert(hash_key.clone(), record_key.clone())?;
                Ok(())
            })
            .map_err(unpack_txn_error)
    }

    pub fn read_round_head(&self, node_id: Hash) -> Result<Option<u64>, StoreError> {
        match self.graph.get(compose(PREFIX_ROUND_HEAD, &[&node_id.0]))? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("round head length".into()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// The latest known round record for a node, or `None`.
    pub fn read_round(&self, node_id: Hash) -> Result<Option<FinalRound>, StoreError> {
        match self.read_round_head(node_id)? {
            Some(head) => self.read_round_by_number(node_id, head),
            None => Ok(None),
        }
    }

    pub fn read_round_by_number(
        &self,
        node_id: Hash,
        number: u64,
    ) -> Result<Option<FinalRound>, StoreError> {
        self.get_decoded(&round_record_key(node_id, number))
    }

    pub fn read_round_by_hash(&self, hash: Hash) -> Result<Option<FinalRound>, StoreError> {
        match self.graph.get(compose(PREFIX_ROUND_HASH, &[&hash.0]))? {
            Some(key) => match self.graph.get(&key)? {
                Some(bytes) => Ok(Some(dec(&bytes)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Replace the references of a head round that has sealed no
    /// snapshots yet.
    pub fn update_empty_head_round(
        &self,
        node_id: Hash,
        number: u64,
        references: References,
    ) -> Result<(), StoreError> {
        let prefix = compose(PREFIX_SNAPSHOT, &[&node_id.0, &number.to_be_bytes()]);
        if self.graph.scan_prefix(prefix).next().is_some() {
            return Err(StoreError::RoundNotEmpty {
                node: node_id,
                number,
            });
        }
        let mut record = self
            .read_round_by_number(node_id, number)?
            .ok_or_else(|| StoreError::Corrupt(format!("round {number} missing")))?;
        record.references = references;
        self.graph
            .insert(round_record_key(node_id, number), enc(&record)?)?;
        Ok(())
    }

    // ── Round links ──

    /// The forward-link watermark from one node's chain to another's.
    pub fn read_round_link(&self, from: Hash, to: Hash) -> Result<u64, StoreError> {
        match self.graph.get(compose(PREFIX_LINK, &[&from.0, &to.0]))? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("round link length".into()))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn write_round_link(&self, from: Hash, to: Hash, number: u64) -> Result<(), StoreError> {
        self.graph.insert(
            compose(PREFIX_LINK, &[&from.0, &to.0]),
            number.to_be_bytes().to_vec(),
        )?;
        Ok(())
    }

    // ── Transactions ──

    /// Write to the confirmed tier. Idempotent.
    pub fn write_transaction(&self, tx: &VersionedTransaction) -> Result<(), StoreError> {
        let key = compose(PREFIX_TX, &[&tx.payload_hash().0]);
        self.graph.insert(key, enc(tx)?)?;
        Ok(())
    }

    /// Read a transaction and whether its finalization marker is set.
    pub fn read_transaction(
        &self,
        hash: Hash,
    ) -> Result<Option<(VersionedTransaction, bool)>, StoreError> {
        match self.graph.get(compose(PREFIX_TX, &[&hash.0]))? {
            Some(bytes) => {
                let tx = dec(&bytes)?;
                Ok(Some((tx, self.transaction_finalized(hash)?)))
            }
            None => Ok(None),
        }
    }

    pub fn transaction_finalized(&self, hash: Hash) -> Result<bool, StoreError> {
        Ok(self
            .graph
            .contains_key(compose(PREFIX_FINAL, &[&hash.0]))?)
    }

    pub fn cache_put_transaction(&self, tx: &VersionedTransaction) -> Result<(), StoreError> {
        let cached = CachedTransaction {
            inserted_at: clock_nanos(),
            tx: tx.clone(),
        };
        let key = compose(PREFIX_CACHE_TX, &[&cached.tx.payload_hash().0]);
        self.graph.insert(key, enc(&cached)?)?;
        Ok(())
    }

    pub fn cache_get_transaction(
        &self,
        hash: Hash,
    ) -> Result<Option<VersionedTransaction>, StoreError> {
        let cached: Option<CachedTransaction> =
            self.get_decoded(&compose(PREFIX_CACHE_TX, &[&hash.0]))?;
        Ok(cached.map(|c| c.tx))
    }

    /// Cache-tier transactions not yet finalized.
    pub fn cache_list_transactions(
        &self,
        limit: usize,
    ) -> Result<Vec<VersionedTransaction>, StoreError> {
        let mut txs = Vec::new();
        for entry in self.graph.scan_prefix(PREFIX_CACHE_TX) {
            if txs.len() >= limit {
                break;
            }
            let (_, value) = entry?;
            let cached: CachedTransaction = dec(&value)?;
            if self.transaction_finalized(cached.tx.payload_hash())? {
                continue;
            }
            txs.push(cached.tx);
        }
        Ok(txs)
    }

    /// Evict cache-tier entries past the TTL, and the oldest entries while
    /// the tier exceeds its byte budget.
    pub fn cache_evict(&self, max_bytes: u64, ttl_nanos: u64) -> Result<u64, StoreError> {
        let now = clock_nanos();
        let mut entries: Vec<(sled::IVec, u64, u64)> = Vec::new();
        let mut used = 0u64;
        for entry in self.graph.scan_prefix(PREFIX_CACHE_TX) {
            let (key, value) = entry?;
            let cached: CachedTransaction = dec(&value)?;
            used += value.len() as u64;
            entries.push((key, cached.inserted_at, value.len() as u64));
        }
        entries.sort_by_key(|&(_, inserted_at, _)| inserted_at);
        let mut evicted = 0u64;
        for (key, inserted_at, size) in entries {
            let expired = now.saturating_sub(inserted_at) > ttl_nanos;
            if !expired && used <= max_bytes {
                break;
            }
            self.graph.remove(key)?;
            used = used.saturating_sub(size);
            evicted += 1;
        }
        Ok(evicted)
    }

    // ── UTXO locks ──

    pub fn read_utxo(&self, hash: Hash, index: usize) -> Result<Option<UtxoWithLock>, StoreError> {
        self.get_decoded(&utxo_entry_key(hash, index))
    }

    /// Consume the spend inputs of a transaction. Refuses a double spend
    /// unless `fork` is set, in which case the superseded transaction is
    /// pruned.
    pub fn lock_inputs(&self, tx: &VersionedTransaction, fork: bool) -> Result<(), StoreError> {
        let tx_hash = tx.payload_hash();
        self.graph
            .transaction(|t| {
                for input in &tx.inputs {
                    if !input.is_spend() {
                        continue;
                    }
                    let key = utxo_entry_key(input.hash, input.index);
                    let mut utxo: UtxoWithLock = match t.get(&key)? {
                        Some(bytes) => dec(&bytes).map_err(ConflictableTransactionError::Abort)?,
                        None => {
                            return Err(ConflictableTransactionError::Abort(
                                StoreError::MissingUtxo {
                                    hash: input.hash,
                                    index: input.index,
                                },
                            ))
                        }
                    };
                    match utxo.lock {
                        Some(by) if by == tx_hash => continue,
                        Some(by) => {
                            if !fork {
                                return Err(ConflictableTransactionError::Abort(
                                    StoreError::InputLocked {
                                        hash: input.hash,
                                        index: input.index,
                                        by,
                                    },
                                ));
                            }
                            prune_transaction_in(t, by)?;
                        }
                        None => {}
                    }
                    utxo.lock = Some(tx_hash);
                    let value = enc(&utxo).map_err(ConflictableTransactionError::Abort)?;
                    t.insert(key, value)?;
                }
                Ok(())
            })
            .map_err(unpack_txn_error)
    }

    // ── Mint locks ──

    /// Lock a `(group, batch)` mint for a transaction. A colliding batch
    /// fails unless `fork` is set; forking prunes the superseded
    /// transaction.
    pub fn lock_mint_input(
        &self,
        mint: &MintData,
        tx_hash: Hash,
        fork: bool,
    ) -> Result<(), StoreError> {
        let key = mint_entry_key(&mint.group, mint.batch);
        self.graph
            .transaction(|t| {
                if let Some(bytes) = t.get(&key)? {
                    let dist: MintDistribution =
                        dec(&bytes).map_err(ConflictableTransactionError::Abort)?;
                    if dist.transaction == tx_hash && dist.amount == mint.amount {
                        return Ok(());
                    }
                    if !fork {
                        return Err(ConflictableTransactionError::Abort(StoreError::MintLocked {
                            batch: mint.batch,
                            by: dist.transaction,
                            amount: dist.amount,
                        }));
                    }
                    prune_transaction_in(t, dist.transaction)?;
                }
                let value =
                    enc(&mint.distribute(tx_hash)).map_err(ConflictableTransactionError::Abort)?;
                t.insert(key.clone(), value)?;
                Ok(())
            })
            .map_err(unpack_txn_error)
    }

    /// Finalized mint distributions for a group since `offset`, ascending.
    pub fn read_mint_distributions(
        &self,
        group: &str,
        offset: u64,
        count: usize,
    ) -> Result<Vec<MintDistribution>, StoreError> {
        let prefix = compose(PREFIX_MINT, &[group.as_bytes()]);
        let mut mints = Vec::new();
        for entry in self.graph.range(mint_entry_key(group, offset)..) {
            if mints.len() >= count {
                break;
            }
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let dist: MintDistribution = dec(&value)?;
            if !self.transaction_finalized(dist.transaction)? {
                continue;
            }
            mints.push(dist);
        }
        Ok(mints)
    }

    /// The most recent finalized distribution of a group, or the zero
    /// batch placeholder.
    pub fn read_last_mint_distribution(&self, group: &str) -> Result<MintDistribution, StoreError> {
        let start = mint_entry_key(group, 0);
        let end = mint_entry_key(group, u64::MAX);
        for entry in self.graph.range(start..=end).rev() {
            let (_, value) = entry?;
            let dist: MintDistribution = dec(&value)?;
            if !self.transaction_finalized(dist.transaction)? {
                continue;
            }
            return Ok(dist);
        }
        Ok(MintDistribution {
            group: group.to_string(),
            batch: 0,
            amount: 0,
            transaction: Hash::default(),
        })
    }

    // ── Snapshots and topology ──

    /// Persist a finalized snapshot and assign it the next topological
    /// sequence number. Idempotent: a snapshot already indexed keeps its
    /// order. The transaction gains its finalization marker and its
    /// outputs become spendable UTXOs, all in one atomic update.
    pub fn write_finalized_snapshot(
        &self,
        snapshot: &Snapshot,
        tx: &VersionedTransaction,
    ) -> Result<u64, StoreError> {
        let payload_hash = snapshot.payload_hash();
        if let Some(order) = self.read_snapshot_order(payload_hash)? {
            return Ok(order);
        }

        let order = self.topology_counter.fetch_add(1, Ordering::SeqCst);
        let snap_key = snapshot_entry_key(
            snapshot.node_id,
            snapshot.round_number,
            snapshot.transaction,
        );
        let snap_value = enc(snapshot)?;
        let tx_value = enc(tx)?;
        let tx_hash = tx.payload_hash();

        self.graph
            .transaction(|t| {
                t.insert(snap_key.clone(), snap_value.clone())?;
                t.insert(topology_key(order), snap_key.clone())?;
                t.insert(
                    compose(PREFIX_SNAP_TOPO, &[&payload_hash.0]),
                    order.to_be_bytes().to_vec(),
                )?;
                t.insert(compose(PREFIX_FINAL, &[&tx_hash.0]), payload_hash.0.to_vec())?;
                t.insert(compose(PREFIX_TX, &[&tx_hash.0]), tx_value.clone())?;
                t.remove(compose(PREFIX_CACHE_TX, &[&tx_hash.0]))?;
                for (index, output) in tx.outputs.iter().enumerate() {
                    let key = utxo_entry_key(tx_hash, index);
                    // A relocked fork keeps its lock; fresh outputs start
                    // unlocked.
                    if t.get(&key)?.is_some() {
                        continue;
                    }
                    let utxo = UtxoWithLock {
                        utxo: Utxo {
                            hash: tx_hash,
                            index,
                            output: output.clone(),
                        },
                        lock: None,
                    };
                    let value = enc(&utxo).map_err(ConflictableTransactionError::Abort)?;
                    t.insert(key, value)?;
                }
                Ok(())
            })
            .map_err(unpack_txn_error)?;
        Ok(order)
    }

    /// The topological order of a finalized snapshot, if assigned.
    pub fn read_snapshot_order(&self, payload_hash: Hash) -> Result<Option<u64>, StoreError> {
        match self.graph.get(compose(PREFIX_SNAP_TOPO, &[&payload_hash.0]))? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("topology order length".into()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn read_snapshot(
        &self,
        payload_hash: Hash,
    ) -> Result<Option<SnapshotWithTopologicalOrder>, StoreError> {
        let order = match self.read_snapshot_order(payload_hash)? {
            Some(order) => order,
            None => return Ok(None),
        };
        let key = self
            .graph
            .get(topology_key(order))?
            .ok_or_else(|| StoreError::Corrupt(format!("topology {order} dangling")))?;
        let value = self
            .graph
            .get(&key)?
            .ok_or_else(|| StoreError::Corrupt(format!("snapshot for order {order} missing")))?;
        Ok(Some(SnapshotWithTopologicalOrder {
            snapshot: dec(&value)?,
            topological_order: order,
        }))
    }

    /// A dense window of finalized snapshots starting at `offset`.
    pub fn read_snapshots_since_topology(
        &self,
        offset: u64,
        count: usize,
    ) -> Result<Vec<SnapshotWithTopologicalOrder>, StoreError> {
        let mut result = Vec::new();
        for entry in self.graph.range(topology_key(offset)..) {
            if result.len() >= count {
                break;
            }
            let (order_key, snap_key) = entry?;
            if !order_key.starts_with(PREFIX_TOPOLOGY) {
                break;
            }
            let bytes: [u8; 8] = order_key[PREFIX_TOPOLOGY.len()..]
                .try_into()
                .map_err(|_| StoreError::Corrupt("topology key length".into()))?;
            let order = u64::from_be_bytes(bytes);
            let value = self.graph.get(&snap_key)?.ok_or_else(|| {
                StoreError::Corrupt(format!("snapshot for order {order} missing"))
            })?;
            result.push(SnapshotWithTopologicalOrder {
                snapshot: dec(&value)?,
                topological_order: order,
            });
        }
        Ok(result)
    }

    pub fn read_snapshots_for_node_round(
        &self,
        node_id: Hash,
        number: u64,
    ) -> Result<Vec<SnapshotWithTopologicalOrder>, StoreError> {
        let prefix = compose(PREFIX_SNAPSHOT, &[&node_id.0, &number.to_be_bytes()]);
        let mut result = Vec::new();
        for entry in self.graph.scan_prefix(prefix) {
            let (_, value) = entry?;
            let snapshot: Snapshot = dec(&value)?;
            let order = self
                .read_snapshot_order(snapshot.payload_hash())?
                .ok_or_else(|| StoreError::Corrupt("snapshot without topology order".into()))?;
            result.push(SnapshotWithTopologicalOrder {
                snapshot,
                topological_order: order,
            });
        }
        result.sort_by_key(|s| s.topological_order);
        Ok(result)
    }

    /// The next topological sequence number to be assigned.
    pub fn topology_sequence(&self) -> u64 {
        self.topology_counter.load(Ordering::SeqCst)
    }

    // ── Deferred snapshot queue ──

    /// Non-blocking enqueue of a snapshot for later ingestion.
    pub fn queue_append_snapshot(
        &self,
        peer_id: Hash,
        snapshot: &Snapshot,
        finalized: bool,
    ) -> Result<(), StoreError> {
        let id = self.queue_counter.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedSnapshot {
            peer_id,
            snapshot: snapshot.clone(),
            finalized,
        };
        self.graph
            .insert(compose(PREFIX_QUEUE, &[&id.to_be_bytes()]), enc(&queued)?)?;
        Ok(())
    }

    /// Drain up to `limit` queued snapshots in arrival order.
    pub fn queue_pop_snapshots(&self, limit: usize) -> Result<Vec<QueuedSnapshot>, StoreError> {
        let mut result = Vec::new();
        let mut victims = Vec::new();
        for entry in self.graph.scan_prefix(PREFIX_QUEUE) {
            if result.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            result.push(dec(&value)?);
            victims.push(key);
        }
        for key in victims {
            self.graph.remove(key)?;
        }
        Ok(result)
    }

    // ── Maintenance ──

    /// Scan every snapshot, recompute its payload hash, and check the
    /// topology indexes and round membership. Returns `(total, invalid)`.
    pub fn validate_graph_entries(&self, _network_id: Hash) -> Result<(u64, u64), StoreError> {
        let mut total = 0u64;
        let mut invalid = 0u64;
        for entry in self.graph.scan_prefix(PREFIX_SNAPSHOT) {
            let (key, value) = entry?;
            total += 1;
            let snapshot: Snapshot = match dec(&value) {
                Ok(s) => s,
                Err(_) => {
                    invalid += 1;
                    continue;
                }
            };
            let expected = snapshot_entry_key(
                snapshot.node_id,
                snapshot.round_number,
                snapshot.transaction,
            );
            if key.as_ref() != expected.as_slice() {
                invalid += 1;
                continue;
            }
            let payload_hash = snapshot.payload_hash();
            let order = match self.read_snapshot_order(payload_hash)? {
                Some(order) => order,
                None => {
                    invalid += 1;
                    continue;
                }
            };
            match self.graph.get(topology_key(order))? {
                Some(stored) if stored.as_ref() == expected.as_slice() => {}
                _ => {
                    invalid += 1;
                    continue;
                }
            }
            let head = self.read_round_head(snapshot.node_id)?.unwrap_or(0);
            if snapshot.round_number > head {
                invalid += 1;
            }
        }
        Ok((total, invalid))
    }

    /// Remove snapshot entries (and their indexes) whose node id starts
    /// with the given hex prefix.
    pub fn remove_graph_entries(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        let mut victims = Vec::new();
        for entry in self.graph.scan_prefix(PREFIX_SNAPSHOT) {
            let (key, value) = entry?;
            let node_hex = hex::encode(&key[PREFIX_SNAPSHOT.len()..PREFIX_SNAPSHOT.len() + 32]);
            if node_hex.starts_with(prefix) {
                victims.push((key, value));
            }
        }
        for (key, value) in victims {
            let snapshot: Snapshot = dec(&value)?;
            let payload_hash = snapshot.payload_hash();
            if let Some(order) = self.read_snapshot_order(payload_hash)? {
                self.graph.remove(topology_key(order))?;
            }
            self.graph
                .remove(compose(PREFIX_SNAP_TOPO, &[&payload_hash.0]))?;
            self.graph.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn prune_transaction_in(
    t: &TransactionalTree,
    tx_hash: Hash,
) -> Result<(), ConflictableTransactionError<StoreError>> {
    t.remove(compose(PREFIX_TX, &[&tx_hash.0]))?;
    t.remove(compose(PREFIX_CACHE_TX, &[&tx_hash.0]))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Key;
    use crate::transaction::{Input, Output, Script, OUTPUT_TYPE_SCRIPT};

    fn temp_store() -> SledStore {
        SledStore::open_temporary().unwrap()
    }

    fn sample_tx(tag: u8) -> VersionedTransaction {
        let mut tx = VersionedTransaction::new(Hash::new(b"asset"));
        tx.inputs.push(Input {
            genesis: vec![tag],
            ..Default::default()
        });
        tx.outputs.push(Output {
            output_type: OUTPUT_TYPE_SCRIPT,
            amount: 100,
            keys: vec![Key::random().public()],
            script: Script::operator(1),
            mask: Key::random().public(),
        });
        tx
    }

    fn sample_snapshot(node: Hash, number: u64, tx: &VersionedTransaction) -> Snapshot {
        Snapshot {
            node_id: node,
            round_number: number,
            references: References::default(),
            transaction: tx.payload_hash(),
            timestamp: 1_000 + number,
            signature: None,
        }
    }

    #[test]
    fn state_roundtrip() {
        let store = temp_store();
        let network = Hash::new(b"net");
        assert!(store.state_get::<Hash>("network").unwrap().is_none());
        store.state_set("network", &network).unwrap();
        assert_eq!(store.state_get::<Hash>("network").unwrap(), Some(network));
    }

    #[test]
    fn topology_dense_and_bijective() {
        let store = temp_store();
        let node = Hash::new(b"node");
        store
            .start_round(node, 0, 1_000, References::default())
            .unwrap();

        let mut hashes = Vec::new();
        for i in 0..5u8 {
            let tx = sample_tx(i);
            let snapshot = sample_snapshot(node, 0, &tx);
            let order = store.write_finalized_snapshot(&snapshot, &tx).unwrap();
            assert_eq!(order, i as u64);
            hashes.push(snapshot.payload_hash());
        }
        assert_eq!(store.topology_sequence(), 5);

        // Forward and reverse index agree at every offset.
        let window = store.read_snapshots_since_topology(0, 10).unwrap();
        assert_eq!(window.len(), 5);
        for (i, s) in window.iter().enumerate() {
            assert_eq!(s.topological_order, i as u64);
            assert_eq!(s.snapshot.payload_hash(), hashes[i]);
            assert_eq!(store.read_snapshot_order(hashes[i]).unwrap(), Some(i as u64));
        }

        // Windows are dense from arbitrary offsets.
        let tail = store.read_snapshots_since_topology(3, 10).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].topological_order, 3);
    }

    #[test]
    fn finalized_snapshot_idempotent() {
        let store = temp_store();
        let node = Hash::new(b"node");
        store
            .start_round(node, 0, 1_000, References::default())
            .unwrap();
        let tx = sample_tx(1);
        let snapshot = sample_snapshot(node, 0, &tx);
        let a = store.write_finalized_snapshot(&snapshot, &tx).unwrap();
        let b = store.write_finalized_snapshot(&snapshot, &tx).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.topology_sequence(), 1);

        let (_, finalized) = store.read_transaction(tx.payload_hash()).unwrap().unwrap();
        assert!(finalized);
        // Outputs became spendable UTXOs.
        let utxo = store.read_utxo(tx.payload_hash(), 0).unwrap().unwrap();
        assert!(utxo.lock.is_none());
        assert_eq!(utxo.utxo.output.amount, 100);
    }

    #[test]
    fn lock_inputs_refuses_double_spend() {
        let store = temp_store();
        let node = Hash::new(b"node");
        store
            .start_round(node, 0, 1_000, References::default())
            .unwrap();
        let funding = sample_tx(1);
        let snapshot = sample_snapshot(node, 0, &funding);
        store.write_finalized_snapshot(&snapshot, &funding).unwrap();

        let mut spend_a = VersionedTransaction::new(Hash::new(b"asset"));
        spend_a
            .inputs
            .push(Input::reference(funding.payload_hash(), 0));
        spend_a.outputs.push(funding.outputs[0].clone());
        let mut spend_b = spend_a.clone();
        spend_b.extra = vec![1];

        store.lock_inputs(&spend_a, false).unwrap();
        // Same transaction relocks fine.
        store.lock_inputs(&spend_a, false).unwrap();
        // A conflicting spend is refused without fork.
        let err = store.lock_inputs(&spend_b, false).unwrap_err();
        assert!(matches!(err, StoreError::InputLocked { .. }));
        // Fork wins the lock.
        store.lock_inputs(&spend_b, true).unwrap();
        let utxo = store.read_utxo(funding.payload_hash(), 0).unwrap().unwrap();
        assert_eq!(utxo.lock, Some(spend_b.payload_hash()));
    }

    #[test]
    fn missing_utxo_rejected() {
        let store = temp_store();
        let mut spend = VersionedTransaction::new(Hash::new(b"asset"));
        spend.inputs.push(Input::reference(Hash::new(b"nope"), 0));
        assert!(matches!(
            store.lock_inputs(&spend, false),
            Err(StoreError::MissingUtxo { .. })
        ));
    }

    #[test]
    fn mint_lock_fork_semantics() {
        let store = temp_store();
        let node = Hash::new(b"node");
        store
            .start_round(node, 0, 1_000, References::default())
            .unwrap();
        let mint = MintData {
            group: "KERNELNODE".into(),
            batch: 42,
            amount: 500,
        };
        let tx_a = sample_tx(1);
        let tx_b = sample_tx(2);
        let a = tx_a.payload_hash();
        let b = tx_b.payload_hash();

        store.lock_mint_input(&mint, a, false).unwrap();
        // Re-locking the same transaction and amount is a no-op.
        store.lock_mint_input(&mint, a, false).unwrap();

        // A second transaction collides; the error names the holder.
        let err = store.lock_mint_input(&mint, b, false).unwrap_err();
        assert!(err.to_string().contains(&a.to_string()));

        // Forking replaces the lock and prunes the superseded holder.
        store.lock_mint_input(&mint, b, true).unwrap();

        // Distribution listing only reports finalized transactions.
        assert!(store
            .read_mint_distributions("KERNELNODE", 0, 10)
            .unwrap()
            .is_empty());
        let snapshot = sample_snapshot(node, 0, &tx_b);
        store.write_finalized_snapshot(&snapshot, &tx_b).unwrap();
        let mints = store.read_mint_distributions("KERNELNODE", 0, 10).unwrap();
        assert_eq!(mints.len(), 1);
        assert_eq!(mints[0].batch, 42);
        assert_eq!(mints[0].transaction, b);
        assert_eq!(
            store
                .read_last_mint_distribution("KERNELNODE")
                .unwrap()
                .batch,
            42
        );
    }

    #[test]
    fn update_empty_head_round_requires_empty() {
        let store = temp_store();
        let node = Hash::new(b"node");
        store
            .start_round(node, 0, 1_000, References::default())
            .unwrap();

        let refs = References::new(Hash::new(b"a"), Hash::new(b"b"));
        store.update_empty_head_round(node, 0, refs).unwrap();
        assert_eq!(store.read_round(node).unwrap().unwrap().references, refs);

        // Once a snapshot lands in the round, the update is refused.
        let tx = sample_tx(1);
        let snapshot = sample_snapshot(node, 0, &tx);
        store.write_finalized_snapshot(&snapshot, &tx).unwrap();
        assert!(matches!(
            store.update_empty_head_round(node, 0, References::default()),
            Err(StoreError::RoundNotEmpty { .. })
        ));
    }

    #[test]
    fn queue_drains_in_order() {
        let store = temp_store();
        let peer = Hash::new(b"peer");
        for i in 0..3u8 {
            let tx = sample_tx(i);
            let snapshot = sample_snapshot(Hash::new(b"n"), i as u64, &tx);
            store.queue_append_snapshot(peer, &snapshot, false).unwrap();
        }
        let drained = store.queue_pop_snapshots(2).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].snapshot.round_number, 0);
        assert_eq!(drained[1].snapshot.round_number, 1);
        assert_eq!(store.queue_pop_snapshots(10).unwrap().len(), 1);
        assert!(store.queue_pop_snapshots(10).unwrap().is_empty());
    }

    #[test]
    fn validate_graph_entries_detects_corruption() {
        let store = temp_store();
        let node = Hash::new(b"node");
        store
            .start_round(node, 0, 1_000, References::default())
            .unwrap();
        let tx = sample_tx(1);
        let snapshot = sample_snapshot(node, 0, &tx);
        store.write_finalized_snapshot(&snapshot, &tx).unwrap();

        let (total, invalid) = store.validate_graph_entries(Hash::default()).unwrap();
        assert_eq!((total, invalid), (1, 0));

        // Break the reverse index and the entry goes invalid.
        store
            .graph
            .remove(compose(PREFIX_SNAP_TOPO, &[&snapshot.payload_hash().0]))
            .unwrap();
        let (total, invalid) = store.validate_graph_entries(Hash::default()).unwrap();
        assert_eq!((total, invalid), (1, 1));
    }

    #[test]
    fn remove_graph_entries_by_node_prefix() {
        let store = temp_store();
        let node = Hash::new(b"node");
        store
            .start_round(node, 0, 1_000, References::default())
            .unwrap();
        let tx = sample_tx(1);
        let snapshot = sample_snapshot(node, 0, &tx);
        store.write_finalized_snapshot(&snapshot, &tx).unwrap();

        let removed = store
            .remove_graph_entries(&hex::encode(&node.0[..4]))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .read_snapshot(snapshot.payload_hash())
            .unwrap()
            .is_none());
    }

    #[test]
    fn round_records_and_links() {
        let store = temp_store();
        let node = Hash::new(b"node");
        let other = Hash::new(b"other");
        store
            .start_round(node, 0, 1_000, References::default())
            .unwrap();
        assert_eq!(store.read_round_head(node).unwrap(), Some(0));
        assert!(store.read_round(other).unwrap().is_none());

        let sealed = FinalRound {
            node_id: node,
            number: 0,
            start: 1_000,
            end: 2_000,
            hash: Hash::new(b"round"),
            references: References::default(),
        };
        store.seal_round(&sealed).unwrap();
        assert_eq!(
            store.read_round_by_hash(sealed.hash).unwrap().unwrap(),
            sealed
        );

        assert_eq!(store.read_round_link(node, other).unwrap(), 0);
        store.write_round_link(node, other, 7).unwrap();
        assert_eq!(store.read_round_link(node, other).unwrap(), 7);
    }

    #[test]
    fn consensus_node_records_roundtrip() {
        let store = temp_store();
        let record = ConsensusNodeRecord {
            signer: crate::address::Address::from_seed(&[1u8; 64]),
            payee: crate::address::Address::from_seed(&[2u8; 64]),
            state: NodeState::Accepted,
            timestamp: 77,
        };
        store.write_consensus_node(&record).unwrap();
        let records = store.read_consensus_nodes().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, NodeState::Accepted);
        assert_eq!(
            records[0].signer.public_spend_key,
            record.signer.public_spend_key
        );
    }

    #[test]
    fn cache_tier_separate_from_confirmed() {
        let store = temp_store();
        let tx = sample_tx(9);
        let hash = tx.payload_hash();
        store.cache_put_transaction(&tx).unwrap();
        assert!(store.read_transaction(hash).unwrap().is_none());
        assert!(store.cache_get_transaction(hash).unwrap().is_some());
        assert_eq!(store.cache_list_transactions(10).unwrap().len(), 1);
    }

    #[test]
    fn cache_eviction_by_budget() {
        let store = temp_store();
        for i in 0..4u8 {
            store.cache_put_transaction(&sample_tx(i)).unwrap();
        }
        // A zero budget evicts everything.
        let evicted = store.cache_evict(0, u64::MAX).unwrap();
        assert_eq!(evicted, 4);
        assert!(store.cache_list_transactions(10).unwrap().is_empty());
    }

    #[test]
    fn snapshots_for_node_round() {
        let store = temp_store();
        let node = Hash::new(b"node");
        store
            .start_round(node, 3, 1_000, References::default())
            .unwrap();
        let tx_a = sample_tx(1);
        let tx_b = sample_tx(2);
        store
            .write_finalized_snapshot(&sample_snapshot(node, 3, &tx_a), &tx_a)
            .unwrap();
        store
            .write_finalized_snapshot(&sample_snapshot(node, 3, &tx_b), &tx_b)
            .unwrap();

        let snapshots = store.read_snapshots_for_node_round(node, 3).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[0].topological_order < snapshots[1].topological_order);
        assert!(store
            .read_snapshots_for_node_round(node, 4)
            .unwrap()
            .is_empty());
    }
}
