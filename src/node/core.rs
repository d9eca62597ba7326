//! The node orchestrator.
//!
//! One action loop (the [`Kernel`]) owns every consensus-mutating
//! structure: the round graph, the aggregator and verifier maps, and the
//! membership view. Peer tasks only parse, authenticate, and enqueue
//! [`CosiAction`]s into a bounded channel; a full channel drops with a
//! warning rather than stalling reads. Membership is published to peer
//! tasks as an immutable `Arc` snapshot the loop swaps on change.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::config::{self, NodeConfig};
use crate::consensus::cosi::{
    verify_finalized_snapshot, CosiAction, CosiAggregator, CosiError, CosiVerifier,
};
use crate::consensus::graph::{CacheRound, FinalRound, RoundGraph, SyncPoint};
use crate::constants;
use crate::crypto::Key;
use crate::genesis::{Genesis, GenesisError};
use crate::network::peer::{AuthError, OutboundHandle, PeerContext, PeerManager};
use crate::network::protocol::{self, PeerMessage};
use crate::node::membership::{Membership, MembershipError};
use crate::node::storage::{SledStore, StoreError};
use crate::node::validation::{apply_admission, SnapshotValidator, ValidationError};
use crate::snapshot::{References, Snapshot};
use crate::transaction::VersionedTransaction;
use crate::{clock_nanos, Hash};

/// Errors surfaced at node setup or from the action loop.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("genesis error: {0}")]
    Genesis(#[from] GenesisError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),
    #[error("graph validation found {invalid}/{total} invalid entries")]
    InvalidGraph { total: u64, invalid: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from one action-loop step. Handlers record non-fatal errors and
/// move on; fatal ones halt the node.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("cosi error: {0}")]
    Cosi(#[from] CosiError),
}

impl KernelError {
    /// Store corruption and threshold violations are consensus-safety
    /// hazards; everything else is logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::Store(StoreError::Corrupt(_))
                | KernelError::Membership(MembershipError::ThresholdBelowGenesis { .. })
                | KernelError::Validation(ValidationError::Store(StoreError::Corrupt(_)))
        )
    }
}

/// Peers' views of our chain tip, the only shared-mutable structure.
#[derive(Default)]
pub struct SyncPointMap {
    inner: RwLock<HashMap<Hash, SyncPoint>>,
}

impl SyncPointMap {
    pub fn set(&self, peer: Hash, point: SyncPoint) {
        self.inner.write().expect("sync map lock").insert(peer, point);
    }

    pub fn get(&self, peer: &Hash) -> Option<SyncPoint> {
        self.inner.read().expect("sync map lock").get(peer).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("sync map lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State shared between the action loop, peer tasks, and RPC handlers.
pub struct NodeShared {
    pub store: SledStore,
    pub config: NodeConfig,
    pub genesis: Genesis,
    pub signer: Address,
    pub network_id: Hash,
    pub my_id: Hash,
    membership: RwLock<Arc<Membership>>,
    pub sync_points: SyncPointMap,
    pub outbound: OutboundHandle,
    actions: mpsc::Sender<CosiAction>,
    started_at: Instant,
}

impl NodeShared {
    /// The current membership snapshot.
    pub fn membership(&self) -> Arc<Membership> {
        self.membership.read().expect("membership lock").clone()
    }

    /// Swap in a freshly loaded membership view (action loop only).
    pub fn publish_membership(&self, membership: Membership) {
        *self.membership.write().expect("membership lock") = Arc::new(membership);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn enqueue(&self, action: CosiAction) {
        if self.actions.try_send(action).is_err() {
            tracing::warn!("action channel full, dropping consensus message");
        }
    }

    /// Reply to a transaction request from either tier.
    fn send_transaction_to_peer(&self, peer: Hash, hash: Hash) -> Result<(), StoreError> {
        let tx = match self.store.read_transaction(hash)? {
            Some((tx, _)) => Some(tx),
            None => self.store.cache_get_transaction(hash)?,
        };
        if let Some(tx) = tx {
            self.outbound.send_to(
                peer,
                protocol::build_transaction_message(&tx),
                true,
                Some((hash, protocol::PEER_MESSAGE_TYPE_TRANSACTION)),
            );
        }
        Ok(())
    }
}

impl PeerContext for NodeShared {
    fn authenticate(&self, payload: &[u8]) -> Result<(Hash, String), AuthError> {
        let parsed = protocol::parse_authentication_payload(payload)?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now.saturating_sub(parsed.timestamp) > constants::AUTHENTICATION_TIMEOUT_SECS {
            return Err(AuthError::Timeout);
        }
        let membership = self.membership();
        let record = membership
            .consensus_nodes
            .get(&parsed.peer_id)
            .cloned()
            .or_else(|| {
                membership.consensus_pledging.clone().filter(|p| {
                    p.id_for_network(self.network_id) == parsed.peer_id
                })
            });
        let record = match record {
            Some(record) if parsed.peer_id != self.my_id => record,
            _ => return Err(AuthError::UnknownPeer(parsed.peer_id)),
        };
        if !record
            .signer
            .public_spend_key
            .verify(&payload[..40], &parsed.signature)
        {
            return Err(AuthError::BadSignature(parsed.peer_id));
        }
        Ok((parsed.peer_id, parsed.listener))
    }

    fn build_authentication(&self) -> Vec<u8> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        protocol::build_authentication_payload(
            &self.signer.private_spend_key,
            self.my_id,
            &self.config.listener,
            now,
        )
    }

    fn deliver(&self, peer_id: Hash, message: PeerMessage) {
        match message {
            PeerMessage::Ping | PeerMessage::Authentication(_) => {}
            PeerMessage::Graph(points) => {
                if self.membership().consensus_nodes.contains_key(&peer_id) {
                    for point in points {
                        if point.node_id == self.my_id {
                            self.sync_points.set(peer_id, point);
                        }
                    }
                }
            }
            PeerMessage::SnapshotConfirm(hash) => {
                tracing::debug!(peer = %peer_id, snapshot = %hash, "snapshot confirmed");
            }
            PeerMessage::TransactionRequest(hash) => {
                if let Err(e) = self.send_transaction_to_peer(peer_id, hash) {
                    tracing::warn!(peer = %peer_id, error = %e, "transaction request failed");
                }
            }
            PeerMessage::Transaction(tx) => {
                if tx.validate_basic().is_ok() {
                    if let Err(e) = self.store.cache_put_transaction(&tx) {
                        tracing::warn!(error = %e, "cache put failed");
                    }
                }
            }
            PeerMessage::SnapshotAnnouncement {
                commitment,
                snapshot,
            } => self.enqueue(CosiAction::Announcement {
                peer_id,
                snapshot: *snapshot,
                commitment,
            }),
            PeerMessage::SnapshotCommitment {
                snapshot_hash,
                commitment,
                want_tx,
            } => self.enqueue(CosiAction::Commitment {
                peer_id,
                snapshot_hash,
                commitment,
                want_tx,
            }),
            PeerMessage::TransactionChallenge {
                snapshot_hash,
                cosi,
                transaction,
            } => self.enqueue(CosiAction::Challenge {
                peer_id,
                snapshot_hash,
                cosi,
                transaction: transaction.map(|tx| *tx),
            }),
            PeerMessage::SnapshotResponse {
                snapshot_hash,
                response,
            } => self.enqueue(CosiAction::Response {
                peer_id,
                snapshot_hash,
                response,
            }),
            PeerMessage::SnapshotFinalization(snapshot) => {
                self.enqueue(CosiAction::Finalization {
                    peer_id,
                    snapshot: *snapshot,
                })
            }
        }
    }
}

/// Materialise the in-memory round graph from the store.
pub fn load_round_graph(
    store: &SledStore,
    membership: &Membership,
    my_id: Hash,
) -> Result<RoundGraph, StoreError> {
    let mut graph = RoundGraph {
        my_node_id: my_id,
        ..Default::default()
    };
    let mut ids: Vec<Hash> = membership.consensus_nodes.keys().copied().collect();
    if !ids.contains(&my_id) {
        ids.push(my_id);
    }
    for id in ids {
        let head = match store.read_round_head(id)? {
            Some(head) => head,
            None => continue,
        };
        let start = (head + 1).saturating_sub(constants::ROUND_HISTORY_WINDOW);
        for number in start..=head {
            let record = match store.read_round_by_number(id, number)? {
                Some(record) => record,
                None => continue,
            };
            if record.is_sealed() {
                graph.push_final(record);
                continue;
            }
            let snapshots = store.read_snapshots_for_node_round(id, number)?;
            let mut cache = CacheRound::new(id, number, record.start, record.references);
            for s in snapshots {
                cache.append(s.snapshot);
            }
            if let Some(sealed) = cache.as_final() {
                graph.push_final(sealed);
            }
            if id == my_id && number == head {
                graph.my_cache_round = Some(cache);
            }
        }
        if id == my_id {
            graph.my_final_number = graph.final_round(&my_id).map(|r| r.number).unwrap_or(0);
            if graph.my_cache_round.is_none() {
                let record = store
                    .read_round_by_number(my_id, head)?
                    .ok_or_else(|| StoreError::Corrupt("head round missing".into()))?;
                graph.my_cache_round = Some(CacheRound::new(
                    my_id,
                    head,
                    record.start,
                    record.references,
                ));
            }
        }
    }
    graph.update_final_cache();
    Ok(graph)
}

/// The consensus action loop and the state it exclusively owns.
pub struct Kernel {
    pub shared: Arc<NodeShared>,
    pub graph: RoundGraph,
    aggregators: HashMap<Hash, CosiAggregator>,
    verifiers: HashMap<Hash, CosiVerifier>,
    actions_rx: mpsc::Receiver<CosiAction>,
    tick_count: u64,
}

/// The assembled node, ready to run.
pub struct Node {
    pub shared: Arc<NodeShared>,
    pub kernel: Kernel,
    outbound_rx: Option<mpsc::UnboundedReceiver<crate::network::peer::OutCommand>>,
}

impl Node {
    /// Load configuration and genesis, open and validate the store, and
    /// assemble the node.
    pub fn setup(dir: &Path) -> Result<Node, NodeError> {
        let config = NodeConfig::load(dir)?;
        let genesis = Genesis::load(dir)?;
        let store = SledStore::open(&dir.join("store"))?;
        let network_id = genesis.bootstrap(&store)?;

        tracing::info!("validating graph entries...");
        let started = Instant::now();
        let (total, invalid) = store.validate_graph_entries(network_id)?;
        if invalid > 0 {
            return Err(NodeError::InvalidGraph { total, invalid });
        }
        tracing::info!(total, elapsed = ?started.elapsed(), "graph validated");

        let signer = config.signer_address()?;
        let my_id = signer.hash().for_network(network_id);
        let membership = Membership::load(
            &store,
            network_id,
            my_id,
            genesis.node_ids(),
            genesis.epoch_nanos(),
        )?;
        let graph = load_round_graph(&store, &membership, my_id)?;

        let (outbound, outbound_rx) = OutboundHandle::channel();
        let (actions_tx, actions_rx) = mpsc::channel(constants::MEMPOOL_SIZE);

        let shared = Arc::new(NodeShared {
            store,
            config,
            genesis,
            signer,
            network_id,
            my_id,
            membership: RwLock::new(Arc::new(membership)),
            sync_points: SyncPointMap::default(),
            outbound,
            actions: actions_tx,
            started_at: Instant::now(),
        });

        tracing::info!(
            listener = %shared.config.listener,
            signer = %shared.signer,
            network = %shared.network_id,
            node = %shared.my_id,
            topology = shared.store.topology_sequence(),
            "node ready"
        );

        Ok(Node {
            kernel: Kernel {
                shared: shared.clone(),
                graph,
                aggregators: HashMap::new(),
                verifiers: HashMap::new(),
                actions_rx,
                tick_count: 0,
            },
            shared,
            outbound_rx: Some(outbound_rx),
        })
    }

    /// Take the outbound command stream (tests ferry it by hand; `run`
    /// wires it to the peer router).
    pub fn take_outbound_rx(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<crate::network::peer::OutCommand>> {
        self.outbound_rx.take()
    }

    /// Run the node: peer router, listener, neighbor dials, action loop.
    pub async fn run(mut self, dir: &Path, cancel: CancellationToken) -> Result<(), NodeError> {
        let rx = self
            .outbound_rx
            .take()
            .ok_or_else(|| std::io::Error::other("outbound stream already taken"))?;
        let cache_ttl = Duration::from_secs(self.shared.config.cache_ttl);
        PeerManager::start(self.shared.clone(), rx, cache_ttl, cancel.clone());

        let listener = self.shared.config.listener.clone();
        tokio::spawn(PeerManager::listen(
            listener,
            self.shared.clone(),
            cancel.clone(),
        ));

        match config::load_peer_entries(dir) {
            Ok(entries) => {
                for entry in entries {
                    let id = entry.signer.hash().for_network(self.shared.network_id);
                    if id == self.shared.my_id {
                        continue;
                    }
                    self.shared.outbound.add_neighbor(id, entry.host);
                }
            }
            Err(e) => tracing::warn!(error = %e, "no neighbor list loaded"),
        }

        self.kernel.run(cancel).await;
        Ok(())
    }
}

impl Kernel {
    /// Drive the loop until cancellation or a fatal error.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_millis(
            constants::SNAPSHOT_ROUND_GAP / 1_000_000,
        ));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                action = self.actions_rx.recv() => {
                    let action = match action {
                        Some(action) => action,
                        None => break,
                    };
                    if let Err(e) = self.handle_action(action) {
                        if e.is_fatal() {
                            tracing::error!(error = %e, "consensus invariant violated, halting");
                            cancel.cancel();
                            break;
                        }
                        tracing::warn!(error = %e, "action failed");
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.handle_tick(clock_nanos()) {
                        if e.is_fatal() {
                            tracing::error!(error = %e, "consensus invariant violated, halting");
                            cancel.cancel();
                            break;
                        }
                        tracing::warn!(error = %e, "tick failed");
                    }
                }
            }
        }
    }

    /// Drain already-enqueued actions synchronously (tests).
    pub fn drain_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(action) = self.actions_rx.try_recv() {
            if let Err(e) = self.handle_action(action) {
                tracing::warn!(error = %e, "action failed");
            }
            handled += 1;
        }
        handled
    }

    pub fn in_flight(&self) -> (usize, usize) {
        (self.aggregators.len(), self.verifiers.len())
    }

    /// Advance one state machine for one action.
    pub fn handle_action(&mut self, action: CosiAction) -> Result<(), KernelError> {
        match action {
            CosiAction::SelfPropose { transaction } => self.propose_snapshot(transaction),
            CosiAction::Announcement {
                peer_id,
                snapshot,
                commitment,
            } => self.handle_announcement(peer_id, snapshot, commitment),
            CosiAction::Commitment {
                peer_id,
                snapshot_hash,
                commitment,
                want_tx,
            } => self.handle_commitment(peer_id, snapshot_hash, commitment, want_tx),
            CosiAction::Challenge {
                peer_id,
                snapshot_hash,
                cosi,
                transaction,
            } => self.handle_challenge(peer_id, snapshot_hash, cosi, transaction),
            CosiAction::Response {
                peer_id,
                snapshot_hash,
                response,
            } => self.handle_response(peer_id, snapshot_hash, response),
            CosiAction::Finalization { peer_id, snapshot } => {
                self.handle_finalization(peer_id, snapshot)
            }
        }
    }

    /// Seal the cache round once it outlives the round gap, and open the
    /// next one referencing the best external round.
    fn rotate_my_round(&mut self, now: u64) -> Result<(), KernelError> {
        let shared = self.shared.clone();
        let cache = match &self.graph.my_cache_round {
            Some(cache) => cache.clone(),
            None => return Ok(()),
        };
        if now < cache.timestamp + constants::SNAPSHOT_ROUND_GAP {
            return Ok(());
        }
        let sealed = match cache.as_final() {
            Some(sealed) => sealed,
            None => return Ok(()),
        };
        shared.store.seal_round(&sealed)?;
        self.update_round_link(&sealed)?;
        self.graph.my_final_number = sealed.number;
        self.graph.push_final(sealed.clone());

        let membership = shared.membership();
        let best = self
            .graph
            .determine_best_round(&membership.genesis_nodes, now, now);
        let references = References {
            self_: sealed.hash,
            external: best.map(|b| b.hash).unwrap_or(sealed.references.external),
        };
        let number = sealed.number + 1;
        shared
            .store
            .start_round(shared.my_id, number, now, references)?;
        self.graph.my_cache_round = Some(CacheRound::new(shared.my_id, number, now, references));
        Ok(())
    }

    /// Record the forward link implied by a sealed round's external
    /// reference.
    fn update_round_link(&mut self, sealed: &FinalRound) -> Result<(), KernelError> {
        if let Some(external) = self
            .shared
            .store
            .read_round_by_hash(sealed.references.external)?
        {
            let existing = self
                .shared
                .store
                .read_round_link(sealed.node_id, external.node_id)?;
            if external.number > existing {
                self.shared
                    .store
                    .write_round_link(sealed.node_id, external.node_id, external.number)?;
            }
        }
        Ok(())
    }

    /// Leader step 1: build a snapshot for a pending transaction and
    /// announce it.
    fn propose_snapshot(&mut self, transaction: VersionedTransaction) -> Result<(), KernelError> {
        let shared = self.shared.clone();
        let membership = shared.membership();
        let my_index = match membership.consensus_index {
            Some(index) => index,
            None => return Ok(()),
        };
        let now = clock_nanos();
        self.rotate_my_round(now)?;
        let cache = match &self.graph.my_cache_round {
            Some(cache) => cache.clone(),
            None => return Ok(()),
        };

        let tx_hash = transaction.payload_hash();
        let timestamp = cache
            .snapshots
            .last()
            .map(|s| s.timestamp.max(now))
            .unwrap_or(now);
        let snapshot = Snapshot {
            node_id: shared.my_id,
            round_number: cache.number,
            references: cache.references,
            transaction: tx_hash,
            timestamp,
            signature: None,
        };
        if !cache.check_snapshot(&snapshot) {
            return Ok(());
        }
        let payload_hash = snapshot.payload_hash();
        if self.aggregators.contains_key(&payload_hash) {
            return Ok(());
        }
        // Our own transaction passes the same gate follower announcements
        // do: kernel checks, signatures, and input locks.
        let validator = SnapshotValidator::new(&shared.store, &membership);
        match validator.check_cache_snapshot_transaction(&snapshot) {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(tx = %tx_hash, error = %e, "own transaction rejected");
                return Ok(());
            }
        }
        let threshold = membership.consensus_threshold(now)?;
        let aggregator =
            CosiAggregator::new(snapshot.clone(), transaction, my_index, threshold, now);
        let announcement =
            protocol::build_snapshot_announcement_message(&snapshot, aggregator.commitment);
        self.aggregators.insert(payload_hash, aggregator);
        tracing::debug!(snapshot = %payload_hash, round = snapshot.round_number, "announcing snapshot");
        shared.outbound.broadcast(
            announcement,
            false,
            Some((
                payload_hash,
                protocol::PEER_MESSAGE_TYPE_SNAPSHOT_ANNOUNCEMENT,
            )),
        );
        // A solo network satisfies the threshold immediately.
        self.try_advance_leader(payload_hash)
    }

    /// Follower step 1→2: validate an announcement and commit.
    fn handle_announcement(
        &mut self,
        peer_id: Hash,
        snapshot: Snapshot,
        commitment: Key,
    ) -> Result<(), KernelError> {
        let shared = self.shared.clone();
        let membership = shared.membership();
        let leader = snapshot.node_id;
        if leader == shared.my_id || membership.node_index(&leader).is_none() {
            return Ok(());
        }
        // Round numbering must continue the leader's known chain.
        if let Some(last) = self.graph.final_round(&leader) {
            if snapshot.round_number != last.number && snapshot.round_number != last.number + 1 {
                return Ok(());
            }
            if snapshot.timestamp < last.start {
                return Ok(());
            }
        }
        let payload_hash = snapshot.payload_hash();
        if self.verifiers.contains_key(&payload_hash) {
            return Ok(());
        }

        let validator = SnapshotValidator::new(&shared.store, &membership);
        let resolved = validator.check_cache_snapshot_transaction(&snapshot)?;
        let want_tx = resolved.is_none();

        let mut verifier = CosiVerifier::new(snapshot, commitment, clock_nanos());
        verifier.transaction = resolved.map(|(tx, _)| tx);
        let own_commitment = verifier.commit()?;
        self.verifiers.insert(payload_hash, verifier);

        shared.outbound.send_to(
            peer_id,
            protocol::build_snapshot_commitment_message(payload_hash, own_commitment, want_tx),
            false,
            Some((payload_hash, protocol::PEER_MESSAGE_TYPE_SNAPSHOT_COMMITMENT)),
        );
        Ok(())
    }

    /// Leader step 2: collect a follower commitment.
    fn handle_commitment(
        &mut self,
        peer_id: Hash,
        snapshot_hash: Hash,
        commitment: Key,
        want_tx: bool,
    ) -> Result<(), KernelError> {
        let membership = self.shared.membership();
        let index = match membership.node_index(&peer_id) {
            Some(index) => index,
            None => return Ok(()),
        };
        let ready = match self.aggregators.get_mut(&snapshot_hash) {
            Some(aggregator) => aggregator
                .add_commitment(index, commitment, peer_id, want_tx)
                .unwrap_or(false),
            None => return Ok(()),
        };
        if ready {
            self.try_advance_leader(snapshot_hash)?;
        }
        Ok(())
    }

    /// Move the leader forward wherever thresholds are already met:
    /// commitments → challenge, responses → finalization.
    fn try_advance_leader(&mut self, snapshot_hash: Hash) -> Result<(), KernelError> {
        let shared = self.shared.clone();
        let membership = shared.membership();
        let publics = membership.consensus_keys();

        let aggregator = match self.aggregators.get_mut(&snapshot_hash) {
            Some(aggregator) => aggregator,
            None => return Ok(()),
        };

        if aggregator.cosi.is_none() && aggregator.commitments.len() >= aggregator.threshold {
            let cosi =
                aggregator.build_challenge(&publics, &shared.signer.private_spend_key)?;
            let with_tx = !aggregator.want_txs.is_empty();
            let tx = with_tx.then(|| aggregator.transaction.clone());
            let message = protocol::build_transaction_challenge_message(
                snapshot_hash,
                &cosi,
                tx.as_ref(),
            );
            for index in cosi.keys() {
                let peer = membership.sorted_consensus_nodes[index];
                if peer == shared.my_id {
                    continue;
                }
                shared.outbound.send_to(
                    peer,
                    message.clone(),
                    false,
                    Some((
                        snapshot_hash,
                        protocol::PEER_MESSAGE_TYPE_TRANSACTION_CHALLENGE,
                    )),
                );
            }
        }

        let aggregator = match self.aggregators.get_mut(&snapshot_hash) {
            Some(aggregator) => aggregator,
            None => return Ok(()),
        };
        if aggregator.cosi.is_some() && aggregator.responses.len() >= aggregator.threshold {
            let finalized = aggregator.finalize(&publics)?;
            let transaction = aggregator.transaction.clone();
            self.aggregators.remove(&snapshot_hash);
            self.ingest_finalized(shared.my_id, &finalized, &transaction)?;
            shared.outbound.broadcast(
                protocol::build_snapshot_finalization_message(&finalized),
                true,
                Some((
                    snapshot_hash,
                    protocol::PEER_MESSAGE_TYPE_SNAPSHOT_FINALIZATION,
                )),
            );
        }
        Ok(())
    }

    /// Follower step 3→4: answer a challenge.
    fn handle_challenge(
        &mut self,
        peer_id: Hash,
        snapshot_hash: Hash,
        cosi: crate::crypto::CosiSignature,
        transaction: Option<VersionedTransaction>,
    ) -> Result<(), KernelError> {
        let shared = self.shared.clone();
        let membership = shared.membership();
        let my_index = match membership.consensus_index {
            Some(index) => index,
            None => return Ok(()),
        };
        let snapshot = match self.verifiers.get(&snapshot_hash) {
            Some(verifier) => verifier.snapshot.clone(),
            None => return Ok(()),
        };

        // A follower that asked for the transaction validates it now.
        let needs_tx = self
            .verifiers
            .get(&snapshot_hash)
            .map(|v| v.transaction.is_none())
            .unwrap_or(false);
        if needs_tx {
            let tx = match transaction {
                Some(tx) => tx,
                None => return Ok(()),
            };
            shared.store.cache_put_transaction(&tx)?;
            let validator = SnapshotValidator::new(&shared.store, &membership);
            match validator.check_cache_snapshot_transaction(&snapshot)? {
                Some((tx, _)) => {
                    if let Some(verifier) = self.verifiers.get_mut(&snapshot_hash) {
                        verifier.transaction = Some(tx);
                    }
                }
                None => return Ok(()),
            }
        }

        let verifier = match self.verifiers.get_mut(&snapshot_hash) {
            Some(verifier) => verifier,
            None => return Ok(()),
        };
        let publics = membership.consensus_keys();
        let response = match verifier.respond(
            &cosi,
            my_index,
            &publics,
            &shared.signer.private_spend_key,
        ) {
            Ok(response) => response,
            Err(CosiError::NotInMask) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        shared.outbound.send_to(
            peer_id,
            protocol::build_snapshot_response_message(snapshot_hash, response),
            false,
            Some((snapshot_hash, protocol::PEER_MESSAGE_TYPE_SNAPSHOT_RESPONSE)),
        );
        Ok(())
    }

    /// Leader step 4: collect a follower response.
    fn handle_response(
        &mut self,
        peer_id: Hash,
        snapshot_hash: Hash,
        response: [u8; 32],
    ) -> Result<(), KernelError> {
        let membership = self.shared.membership();
        let index = match membership.node_index(&peer_id) {
            Some(index) => index,
            None => return Ok(()),
        };
        let ready = match self.aggregators.get_mut(&snapshot_hash) {
            Some(aggregator) => aggregator.add_response(index, response).unwrap_or(false),
            None => return Ok(()),
        };
        if ready {
            self.try_advance_leader(snapshot_hash)?;
        }
        Ok(())
    }

    /// Step 5, any node: verify and persist a finalized snapshot.
    fn handle_finalization(
        &mut self,
        peer_id: Hash,
        snapshot: Snapshot,
    ) -> Result<(), KernelError> {
        let shared = self.shared.clone();
        let membership = shared.membership();
        let payload_hash = snapshot.payload_hash();
        if shared.store.read_snapshot_order(payload_hash)?.is_some() {
            return Ok(());
        }

        let threshold = membership.consensus_threshold(snapshot.timestamp)?;
        let publics = membership.consensus_keys();
        verify_finalized_snapshot(&snapshot, threshold, &publics)?;

        let resolved = match shared.store.read_transaction(snapshot.transaction)? {
            Some((tx, _)) => Some(tx),
            None => shared.store.cache_get_transaction(snapshot.transaction)?,
        };
        let tx = match resolved {
            Some(tx) => tx,
            None => {
                // Defer until the transaction arrives.
                shared.store.queue_append_snapshot(peer_id, &snapshot, true)?;
                shared.outbound.send_to(
                    peer_id,
                    protocol::build_transaction_request_message(snapshot.transaction),
                    true,
                    Some((
                        snapshot.transaction,
                        protocol::PEER_MESSAGE_TYPE_TRANSACTION_REQUEST,
                    )),
                );
                return Ok(());
            }
        };
        let validator = SnapshotValidator::new(&shared.store, &membership);
        validator.validate_kernel_snapshot(&snapshot, &tx)?;

        self.ingest_finalized(peer_id, &snapshot, &tx)?;
        self.verifiers.remove(&payload_hash);
        if peer_id != shared.my_id {
            shared.outbound.send_to(
                peer_id,
                protocol::build_snapshot_confirm_message(payload_hash),
                true,
                Some((payload_hash, protocol::PEER_MESSAGE_TYPE_SNAPSHOT_CONFIRM)),
            );
        }
        Ok(())
    }

    /// Persist a finalized snapshot, advance the owner's chain, and apply
    /// any membership transition.
    fn ingest_finalized(
        &mut self,
        peer_id: Hash,
        snapshot: &Snapshot,
        tx: &VersionedTransaction,
    ) -> Result<(), KernelError> {
        let shared = self.shared.clone();
        let node = snapshot.node_id;
        match shared.store.read_round_head(node)? {
            None => {
                shared.store.start_round(
                    node,
                    snapshot.round_number,
                    snapshot.timestamp,
                    snapshot.references,
                )?;
            }
            Some(head) if snapshot.round_number == head + 1 => {
                self.seal_foreign_round(node, head)?;
                shared.store.start_round(
                    node,
                    snapshot.round_number,
                    snapshot.timestamp,
                    snapshot.references,
                )?;
            }
            Some(head) if snapshot.round_number > head + 1 => {
                // Too far ahead; park it for the catch-up path.
                shared.store.queue_append_snapshot(peer_id, snapshot, true)?;
                return Ok(());
            }
            Some(_) => {}
        }

        let order = shared.store.write_finalized_snapshot(snapshot, tx)?;
        tracing::info!(
            node = %node,
            round = snapshot.round_number,
            topology = order,
            "snapshot finalized"
        );

        if node == shared.my_id {
            if let Some(cache) = &mut self.graph.my_cache_round {
                if cache.check_snapshot(snapshot) {
                    cache.append(snapshot.clone());
                }
            }
        }
        self.graph.update_final_cache();

        if apply_admission(&shared.store, snapshot, tx)? {
            let membership = Membership::load(
                &shared.store,
                shared.network_id,
                shared.my_id,
                shared.genesis.node_ids(),
                shared.genesis.epoch_nanos(),
            )?;
            tracing::info!(
                accepted = membership.sorted_consensus_nodes.len(),
                pledging = membership.consensus_pledging.is_some(),
                "membership updated"
            );
            shared.publish_membership(membership);
        }
        Ok(())
    }

    /// Seal a foreign node's round from its stored snapshots once its
    /// successor opens.
    fn seal_foreign_round(&mut self, node: Hash, number: u64) -> Result<(), KernelError> {
        let shared = self.shared.clone();
        let record = match shared.store.read_round_by_number(node, number)? {
            Some(record) => record,
            None => return Ok(()),
        };
        if record.is_sealed() {
            return Ok(());
        }
        let snapshots = shared.store.read_snapshots_for_node_round(node, number)?;
        let mut cache = CacheRound::new(node, number, record.start, record.references);
        for s in snapshots {
            cache.append(s.snapshot);
        }
        if let Some(sealed) = cache.as_final() {
            shared.store.seal_round(&sealed)?;
            self.update_round_link(&sealed)?;
            self.graph.push_final(sealed);
        }
        Ok(())
    }

    /// True when enough peers report our chain tip back to us.
    pub fn check_broadcasted_to_peers(&self) -> bool {
        let shared = &self.shared;
        let membership = shared.membership();
        let threshold = match membership.consensus_threshold(clock_nanos()) {
            Ok(threshold) => threshold,
            Err(_) => return false,
        };
        let final_number = self.graph.my_final_number;
        let mut count = 1;
        for id in membership.consensus_nodes.keys() {
            if let Some(remote) = shared.sync_points.get(id) {
                if remote.number + 1 >= final_number {
                    count += 1;
                }
            }
        }
        count >= threshold
    }

    /// True when every peer's view of us is within one round, hashes
    /// agree where they overlap, and our cache round is not mid-flight.
    pub fn check_catch_up_with_peers(&self) -> bool {
        let shared = &self.shared;
        let membership = shared.membership();
        if membership.consensus_nodes.len() <= 1 {
            return true;
        }
        let threshold = match membership.consensus_threshold(clock_nanos()) {
            Ok(threshold) => threshold,
            Err(_) => return false,
        };
        if shared.sync_points.len() < threshold {
            return false;
        }
        let final_number = self.graph.my_final_number;
        let cache = match &self.graph.my_cache_round {
            Some(cache) => cache,
            None => return false,
        };
        for id in membership.consensus_nodes.keys() {
            let remote = match shared.sync_points.get(id) {
                Some(remote) => remote,
                None => continue,
            };
            if remote.number <= final_number {
                continue;
            }
            if remote.number > final_number + 1 {
                return false;
            }
            let sealed = match cache.as_final() {
                Some(sealed) => sealed,
                None => return false,
            };
            if sealed.hash != remote.hash {
                return false;
            }
            if sealed.start + constants::SNAPSHOT_ROUND_GAP * 100 > clock_nanos() {
                return false;
            }
        }
        true
    }

    /// Timer tick: expire stale instances, drain the deferred queue,
    /// advertise the graph, and propose pending transactions.
    pub fn handle_tick(&mut self, now: u64) -> Result<(), KernelError> {
        self.tick_count += 1;
        let shared = self.shared.clone();

        self.aggregators.retain(|hash, aggregator| {
            let keep = !aggregator.expired(now);
            if !keep {
                // The transaction stays in the cache tier for a retry
                // with a fresh nonce.
                tracing::debug!(snapshot = %hash, "aggregator timed out");
            }
            keep
        });
        self.verifiers.retain(|hash, verifier| {
            let keep = !verifier.expired(now);
            if !keep {
                tracing::debug!(snapshot = %hash, "verifier timed out");
            }
            keep
        });

        for queued in shared.store.queue_pop_snapshots(16)? {
            if queued.finalized {
                if let Err(e) = self.handle_finalization(queued.peer_id, queued.snapshot) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    tracing::debug!(error = %e, "deferred snapshot still not ingestable");
                }
            }
        }

        if self.tick_count % 4 == 0 {
            self.graph.update_final_cache();
            shared.outbound.broadcast(
                protocol::build_graph_message(&self.graph.final_cache),
                false,
                None,
            );
        }

        if self.tick_count % 120 == 0 {
            let budget = shared.config.max_cache_size * 1024 * 1024;
            let ttl = shared.config.cache_ttl.saturating_mul(1_000_000_000);
            let evicted = shared.store.cache_evict(budget, ttl)?;
            if evicted > 0 {
                tracing::debug!(evicted, "cache tier evicted");
            }
        }

        let membership = shared.membership();
        if membership.consensus_index.is_some()
            && !self
                .aggregators
                .values()
                .any(|a| a.snapshot.node_id == shared.my_id)
            && self.check_catch_up_with_peers()
        {
            if let Some(tx) = shared.store.cache_list_transactions(1)?.into_iter().next() {
                self.handle_action(CosiAction::SelfPropose { transaction: tx })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::genesis::GenesisNode;

    /// Build a dir with config/genesis for node `index` of `n` founding
    /// nodes; seeds are fixed so every node derives the same genesis.
    pub fn testnet_dir(n: u8, index: u8, listener: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let nodes: Vec<GenesisNode> = (0..n)
            .map(|i| {
                let addr = Address::from_seed(&[i + 1; 64]);
                GenesisNode {
                    signer: addr,
                    payee: addr,
                    balance: constants::PLEDGE_AMOUNT,
                }
            })
            .collect();
        let genesis = Genesis {
            epoch: 1_700_000_000,
            nodes,
            domains: vec![],
        };
        std::fs::write(
            dir.path().join("genesis.json"),
            serde_json::to_string_pretty(&genesis).unwrap(),
        )
        .unwrap();

        let signer = Address::from_seed(&[index + 1; 64]);
        let config = format!(
            r#"{{"signer": "{}", "listener": "{}"}}"#,
            signer.private_spend_key, listener
        );
        std::fs::write(dir.path().join("config.json"), config).unwrap();
        dir
    }

    #[test]
    fn setup_builds_consistent_node() {
        let dir = testnet_dir(3, 0, "127.0.0.1:7301");
        let node = Node::setup(dir.path()).unwrap();
        let membership = node.shared.membership();
        assert_eq!(membership.sorted_consensus_nodes.len(), 3);
        assert_eq!(membership.genesis_nodes.len(), 3);
        assert!(membership.consensus_index.is_some());
        // Genesis gave each node a round-zero chain.
        assert!(node.kernel.graph.my_cache_round.is_some());
        assert_eq!(node.shared.store.topology_sequence(), 3);
    }

    #[test]
    fn authentication_replay_window() {
        let dir_a = testnet_dir(2, 0, "127.0.0.1:7302");
        let dir_b = testnet_dir(2, 1, "127.0.0.1:7303");
        let a = Node::setup(dir_a.path()).unwrap();
        let b = Node::setup(dir_b.path()).unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        // A stale authentication is rejected as a timeout.
        let stale = protocol::build_authentication_payload(
            &b.shared.signer.private_spend_key,
            b.shared.my_id,
            "127.0.0.1:7303",
            now - 10,
        );
        assert!(matches!(
            a.shared.authenticate(&stale),
            Err(AuthError::Timeout)
        ));

        // A fresh one from a consensus peer is accepted.
        let fresh = protocol::build_authentication_payload(
            &b.shared.signer.private_spend_key,
            b.shared.my_id,
            "127.0.0.1:7303",
            now - 1,
        );
        let (peer, listener) = a.shared.authenticate(&fresh).unwrap();
        assert_eq!(peer, b.shared.my_id);
        assert_eq!(listener, "127.0.0.1:7303");

        // A forged signature is rejected.
        let mut forged = fresh.clone();
        forged[50] ^= 1;
        assert!(matches!(
            a.shared.authenticate(&forged),
            Err(AuthError::BadSignature(_))
        ));

        // Our own id is not a valid peer.
        let own = protocol::build_authentication_payload(
            &a.shared.signer.private_spend_key,
            a.shared.my_id,
            "127.0.0.1:7302",
            now,
        );
        assert!(matches!(
            a.shared.authenticate(&own),
            Err(AuthError::UnknownPeer(_))
        ));
    }

    #[test]
    fn load_round_graph_restores_state() {
        let dir = testnet_dir(2, 0, "127.0.0.1:7304");
        let node = Node::setup(dir.path()).unwrap();
        let membership = node.shared.membership();
        let graph = load_round_graph(&node.shared.store, &membership, node.shared.my_id).unwrap();
        // Both genesis chains are tracked with their provisional tips.
        assert_eq!(graph.round_history.len(), 2);
        assert_eq!(graph.final_cache.len(), 2);
        let cache = graph.my_cache_round.unwrap();
        assert_eq!(cache.number, 0);
        assert_eq!(cache.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn solo_network_self_proposal_finalizes() {
        let dir = testnet_dir(1, 0, "127.0.0.1:7305");
        let mut node = Node::setup(dir.path()).unwrap();
        let _outbound = node.take_outbound_rx().unwrap();
        let shared = node.shared.clone();
        let kernel = &mut node.kernel;

        // A pending cache transaction spending the genesis output.
        let genesis_tx = shared.genesis.node_transaction(0);
        let mut spend = VersionedTransaction::new(shared.network_id);
        spend.inputs.push(crate::transaction::Input::reference(
            genesis_tx.payload_hash(),
            0,
        ));
        spend.outputs.push(crate::transaction::Output {
            output_type: crate::transaction::OUTPUT_TYPE_SCRIPT,
            ..genesis_tx.outputs[0].clone()
        });
        spend.sign(&[shared.signer.private_spend_key]);
        shared.store.cache_put_transaction(&spend).unwrap();

        let before = shared.store.topology_sequence();
        kernel.handle_tick(clock_nanos()).unwrap();

        // Threshold is one, so the proposal finalizes in place.
        assert_eq!(shared.store.topology_sequence(), before + 1);
        let (_, finalized) = shared
            .store
            .read_transaction(spend.payload_hash())
            .unwrap()
            .unwrap();
        assert!(finalized);
        assert_eq!(kernel.in_flight(), (0, 0));
        // The proposal sealed round zero and moved the chain forward.
        let cache = kernel.graph.my_cache_round.as_ref().unwrap();
        assert_eq!(cache.number, 1);
        assert_eq!(cache.snapshots.len(), 1);
    }

    #[test]
    fn sync_point_checks() {
        let dir = testnet_dir(2, 0, "127.0.0.1:7306");
        let node = Node::setup(dir.path()).unwrap();
        let membership = node.shared.membership();
        let other: Vec<Hash> = membership
            .sorted_consensus_nodes
            .iter()
            .copied()
            .filter(|id| *id != node.shared.my_id)
            .collect();

        // With no sync points only broadcast fails the threshold of 2.
        assert!(!node.kernel.check_broadcasted_to_peers());

        node.shared.sync_points.set(
            other[0],
            SyncPoint {
                node_id: node.shared.my_id,
                number: 0,
                hash: Hash::default(),
            },
        );
        assert!(node.kernel.check_broadcasted_to_peers());
    }
}
