//! The CoSi five-step signing state machines.
//!
//! Every snapshot under consensus has one leader (the node that produced
//! it) and followers (the other accepted nodes). The leader drives a
//! [`CosiAggregator`]; each follower drives a [`CosiVerifier`]. Both are
//! born on the first message observed for a snapshot hash and die on
//! finalization or timeout. Illegal stage transitions are rejected, never
//! silently tolerated.
//!
//! Steps: Announce → Commit → Challenge → Response → Finalization.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::crypto::{cosi_commit, cosi_response, CosiSignature, Key};
use crate::snapshot::Snapshot;
use crate::transaction::VersionedTransaction;
use crate::Hash;

/// Errors from state machine transitions.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CosiError {
    #[error("illegal transition from stage {0:?}")]
    InvalidTransition(&'static str),
    #[error("participant mask excludes this node")]
    NotInMask,
    #[error("aggregate below threshold: {got}/{want}")]
    BelowThreshold { got: usize, want: usize },
    #[error("aggregated signature failed verification")]
    BadAggregate,
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::KeyError),
}

/// An action enqueued into the scheduler's bounded channel. Each variant
/// maps to one step of the wire protocol, except `SelfPropose`, which the
/// timer emits when this node may produce a snapshot of its own.
#[derive(Clone, Debug)]
pub enum CosiAction {
    SelfPropose {
        transaction: VersionedTransaction,
    },
    Announcement {
        peer_id: Hash,
        snapshot: Snapshot,
        commitment: Key,
    },
    Commitment {
        peer_id: Hash,
        snapshot_hash: Hash,
        commitment: Key,
        want_tx: bool,
    },
    Challenge {
        peer_id: Hash,
        snapshot_hash: Hash,
        cosi: CosiSignature,
        transaction: Option<VersionedTransaction>,
    },
    Response {
        peer_id: Hash,
        snapshot_hash: Hash,
        response: [u8; 32],
    },
    Finalization {
        peer_id: Hash,
        snapshot: Snapshot,
    },
}

/// Leader-side aggregation stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregatorStage {
    Announced,
    Challenged,
    Finalized,
}

/// Leader-side state for one snapshot under consensus.
#[derive(Clone, Debug)]
pub struct CosiAggregator {
    pub snapshot: Snapshot,
    pub transaction: VersionedTransaction,
    pub my_index: usize,
    /// Private nonce; regenerated for every attempt, never reused.
    nonce: Key,
    pub commitment: Key,
    /// Participant index → commitment, self included.
    pub commitments: BTreeMap<usize, Key>,
    /// Participant index → response scalar, self included.
    pub responses: BTreeMap<usize, [u8; 32]>,
    /// Peers that asked for the full transaction with their commitment.
    pub want_txs: HashSet<Hash>,
    pub threshold: usize,
    pub cosi: Option<CosiSignature>,
    pub stage: AggregatorStage,
    pub started_at: u64,
}

impl CosiAggregator {
    pub fn new(
        snapshot: Snapshot,
        transaction: VersionedTransaction,
        my_index: usize,
        threshold: usize,
        now: u64,
    ) -> CosiAggregator {
        let (nonce, commitment) = cosi_commit();
        let mut commitments = BTreeMap::new();
        commitments.insert(my_index, commitment);
        CosiAggregator {
            snapshot,
            transaction,
            my_index,
            nonce,
            commitment,
            commitments,
            responses: BTreeMap::new(),
            want_txs: HashSet::new(),
            threshold,
            cosi: None,
            stage: AggregatorStage::Announced,
            started_at: now,
        }
    }

    /// Record a follower commitment. Returns true once the commitment set
    /// reaches the threshold.
    pub fn add_commitment(
        &mut self,
        index: usize,
        commitment: Key,
        peer_id: Hash,
        want_tx: bool,
    ) -> Result<bool, CosiError> {
        if self.stage != AggregatorStage::Announced {
            return Err(CosiError::InvalidTransition("aggregator past announce"));
        }
        self.commitments.entry(index).or_insert(commitment);
        if want_tx {
            self.want_txs.insert(peer_id);
        }
        Ok(self.commitments.len() >= self.threshold)
    }

    /// Aggregate commitments into `(R, mask)`, compute our own response,
    /// and move to the challenge stage. Returns the aggregate to send.
    pub fn build_challenge(
        &mut self,
        publics: &[Key],
        signer: &Key,
    ) -> Result<CosiSignature, CosiError> {
        if self.stage != AggregatorStage::Announced {
            return Err(CosiError::InvalidTransition("aggregator past announce"));
        }
        if self.commitments.len() < self.threshold {
            return Err(CosiError::BelowThreshold {
                got: self.commitments.len(),
                want: self.threshold,
            });
        }
        let cosi = CosiSignature::aggregate_commitments(&self.commitments)?;
        let payload = self.snapshot.payload_hash();
        let challenge = cosi.challenge(publics, &payload.0)?;
        let own = cosi_response(signer, &self.nonce, challenge);
        self.responses.insert(self.my_index, own);
        self.cosi = Some(cosi);
        self.stage = AggregatorStage::Challenged;
        Ok(cosi)
    }

    /// Record a follower response. Returns true once the response set
    /// reaches the threshold.
    pub fn add_response(&mut self, index: usize, response: [u8; 32]) -> Result<bool, CosiError> {
        if self.stage != AggregatorStage::Challenged {
            return Err(CosiError::InvalidTransition("aggregator not challenged"));
        }
        let cosi = self.cosi.as_ref().ok_or(CosiError::BadAggregate)?;
        if !cosi.mask_contains(index) {
            return Err(CosiError::NotInMask);
        }
        self.responses.entry(index).or_insert(response);
        Ok(self.responses.len() >= self.threshold)
    }

    /// Sum responses, verify the aggregate locally, and seal the snapshot
    /// with its collective signature.
    pub fn finalize(&mut self, publics: &[Key]) -> Result<Snapshot, CosiError> {
        if self.stage != AggregatorStage::Challenged {
            return Err(CosiError::InvalidTransition("aggregator not challenged"));
        }
        let mut cosi = self.cosi.take().ok_or(CosiError::BadAggregate)?;
        if self.responses.len() < self.threshold {
            self.cosi = Some(cosi);
            return Err(CosiError::BelowThreshold {
                got: self.responses.len(),
                want: self.threshold,
            });
        }
        // Only responses from masked participants were accepted, so the
        // mask and the response set agree.
        let responses: Vec<[u8; 32]> = self.responses.values().copied().collect();
        cosi.aggregate_responses(&responses);
        let payload = self.snapshot.payload_hash();
        if !cosi.threshold_verify(self.threshold, publics, &payload.0) {
            return Err(CosiError::BadAggregate);
        }
        self.cosi = Some(cosi);
        self.stage = AggregatorStage::Finalized;
        let mut snapshot = self.snapshot.clone();
        snapshot.signature = Some(cosi);
        Ok(snapshot)
    }

    pub fn expired(&self, now: u64) -> bool {
        now.saturating_sub(self.started_at) > constants::COSI_TIMEOUT
    }
}

/// Follower-side verification stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifierStage {
    Announced,
    Committed,
    Responded,
    Finalized,
    Invalid,
}

/// Follower-side state for one snapshot under consensus.
#[derive(Clone, Debug)]
pub struct CosiVerifier {
    pub snapshot: Snapshot,
    pub leader_commitment: Key,
    /// Private nonce; regenerated for every attempt, never reused.
    nonce: Key,
    pub commitment: Key,
    pub transaction: Option<VersionedTransaction>,
    pub stage: VerifierStage,
    pub started_at: u64,
}

impl CosiVerifier {
    pub fn new(snapshot: Snapshot, leader_commitment: Key, now: u64) -> CosiVerifier {
        let (nonce, commitment) = cosi_commit();
        CosiVerifier {
            snapshot,
            leader_commitment,
            nonce,
            commitment,
            transaction: None,
            stage: VerifierStage::Announced,
            started_at: now,
        }
    }

    /// Emit our commitment `R_i` for the leader.
    pub fn commit(&mut self) -> Result<Key, CosiError> {
        if self.stage != VerifierStage::Announced {
            return Err(CosiError::InvalidTransition("verifier past announce"));
        }
        self.stage = VerifierStage::Committed;
        Ok(self.commitment)
    }

    /// Answer the leader's challenge with `s_i = r_i + c·a_i`.
    ///
    /// If the mask excludes us the instance is marked invalid and the
    /// challenge is silently dropped by the caller.
    pub fn respond(
        &mut self,
        cosi: &CosiSignature,
        my_index: usize,
        publics: &[Key],
        signer: &Key,
    ) -> Result<[u8; 32], CosiError> {
        if self.stage != VerifierStage::Committed {
            return Err(CosiError::InvalidTransition("verifier not committed"));
        }
        if !cosi.mask_contains(my_index) {
            self.stage = VerifierStage::Invalid;
            return Err(CosiError::NotInMask);
        }
        let payload = self.snapshot.payload_hash();
        let challenge = cosi.challenge(publics, &payload.0)?;
        self.stage = VerifierStage::Responded;
        Ok(cosi_response(signer, &self.nonce, challenge))
    }

    pub fn expired(&self, now: u64) -> bool {
        now.saturating_sub(self.started_at) > constants::COSI_TIMEOUT
    }
}

/// Compute the challenge scalar a finalization must satisfy and verify the
/// embedded collective signature of a snapshot.
pub fn verify_finalized_snapshot(
    snapshot: &Snapshot,
    threshold: usize,
    publics: &[Key],
) -> Result<CosiSignature, CosiError> {
    let cosi = snapshot.signature.ok_or(CosiError::BadAggregate)?;
    if cosi.signers() < threshold {
        return Err(CosiError::BelowThreshold {
            got: cosi.signers(),
            want: threshold,
        });
    }
    let payload = snapshot.payload_hash();
    if !cosi.verify(publics, &payload.0) {
        return Err(CosiError::BadAggregate);
    }
    Ok(cosi)
}
