//! Kernel snapshot validation: per-transaction-type checks dispatched
//! before a snapshot may enter consensus, plus the membership transitions
//! applied when admission transactions finalize.

use crate::constants;
use crate::node::membership::Membership;
use crate::node::storage::{ConsensusNodeRecord, NodeState, SledStore, StoreError};
use crate::snapshot::Snapshot;
use crate::transaction::{
    parse_pledge_extra, TransactionType, VersionedTransaction, OUTPUT_TYPE_NODE_ACCEPT,
    OUTPUT_TYPE_NODE_CANCEL, OUTPUT_TYPE_NODE_PLEDGE,
};
use crate::address::Address;

/// Errors from kernel snapshot validation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transaction error: {0}")]
    Transaction(#[from] crate::transaction::TransactionError),
    #[error("mint must target group {0}")]
    MintWrongGroup(String),
    #[error("mint batch {got} is not the next expected {want}")]
    MintWrongBatch { got: u64, want: u64 },
    #[error("mint amount {got} does not match schedule amount {want}")]
    MintWrongAmount { got: u64, want: u64 },
    #[error("malformed mint input")]
    MintMalformed,
    #[error("pledge extra must be signer and payee spend keys")]
    PledgeMalformedExtra,
    #[error("a node is already pledging")]
    AlreadyPledging,
    #[error("signer is already an active node")]
    AlreadyActive,
    #[error("pledge output amount {got}, expected {want}")]
    PledgeWrongAmount { got: u64, want: u64 },
    #[error("no pledging node to act on")]
    NoPledgingNode,
    #[error("admission does not match the pledging node")]
    PledgeMismatch,
    #[error("cancel only valid before the accept period elapses")]
    CancelTooLate,
    #[error("cancel output amount {got}, expected {want}")]
    CancelWrongAmount { got: u64, want: u64 },
    #[error("accept only valid after the accept period elapses")]
    AcceptTooEarly,
    #[error("round zero snapshots on a foreign chain must be node accepts")]
    InvalidInitialTransaction,
    #[error("snapshot transaction unknown")]
    TransactionUnknown,
}

/// The scheduled amount of a kernel mint batch: a yearly pool paid out in
/// daily batches, decaying 10% per year.
pub fn mint_batch_amount(batch: u64) -> u64 {
    let year = batch / constants::MINT_BATCHES_PER_YEAR;
    let mut pool = constants::MINT_POOL as u128;
    for _ in 0..year {
        pool = pool * 9 / 10;
    }
    (pool / constants::MINT_BATCHES_PER_YEAR as u128) as u64
}

/// Validates kernel snapshots against the store and the current
/// membership view.
pub struct SnapshotValidator<'a> {
    pub store: &'a SledStore,
    pub membership: &'a Membership,
}

impl<'a> SnapshotValidator<'a> {
    pub fn new(store: &'a SledStore, membership: &'a Membership) -> SnapshotValidator<'a> {
        SnapshotValidator { store, membership }
    }

    /// Dispatch the per-type kernel checks, then the round-zero rule: a
    /// snapshot opening a foreign chain must carry a node accept.
    pub fn validate_kernel_snapshot(
        &self,
        snapshot: &Snapshot,
        tx: &VersionedTransaction,
    ) -> Result<(), ValidationError> {
        match tx.transaction_type() {
            TransactionType::Mint => self.validate_mint(tx)?,
            TransactionType::NodePledge => self.validate_node_pledge(tx)?,
            TransactionType::NodeCancel => self.validate_node_cancel(snapshot, tx)?,
            TransactionType::NodeAccept => self.validate_node_accept(snapshot, tx)?,
            TransactionType::Script => {}
        }
        if snapshot.node_id != self.membership.my_id
            && snapshot.round_number == 0
            && tx.transaction_type() != TransactionType::NodeAccept
        {
            return Err(ValidationError::InvalidInitialTransaction);
        }
        Ok(())
    }

    fn validate_mint(&self, tx: &VersionedTransaction) -> Result<(), ValidationError> {
        let mint = tx
            .inputs
            .iter()
            .find_map(|i| i.mint.as_ref())
            .ok_or(ValidationError::MintMalformed)?;
        if mint.group != constants::MINT_GROUP_KERNEL {
            return Err(ValidationError::MintWrongGroup(mint.group.clone()));
        }
        let last = self
            .store
            .read_last_mint_distribution(constants::MINT_GROUP_KERNEL)?;
        let want = last.batch + 1;
        if mint.batch != want {
            return Err(ValidationError::MintWrongBatch {
                got: mint.batch,
                want,
            });
        }
        let scheduled = mint_batch_amount(mint.batch);
        if mint.amount != scheduled {
            return Err(ValidationError::MintWrongAmount {
                got: mint.amount,
                want: scheduled,
            });
        }
        let distributed: u64 = tx.outputs.iter().map(|o| o.amount).sum();
        if distributed != scheduled {
            return Err(ValidationError::MintWrongAmount {
                got: distributed,
                want: scheduled,
            });
        }
        Ok(())
    }

    fn validate_node_pledge(&self, tx: &VersionedTransaction) -> Result<(), ValidationError> {
        let (signer, _payee) =
            parse_pledge_extra(&tx.extra).ok_or(ValidationError::PledgeMalformedExtra)?;
        if self.membership.consensus_pledging.is_some() {
            return Err(ValidationError::AlreadyPledging);
        }
        if self
            .membership
            .active_nodes
            .iter()
            .any(|n| n.signer.public_spend_key == signer)
        {
            return Err(ValidationError::AlreadyActive);
        }
        let pledged = tx
            .outputs
            .iter()
            .find(|o| o.output_type == OUTPUT_TYPE_NODE_PLEDGE)
            .map(|o| o.amount)
            .unwrap_or(0);
        if pledged != constants::PLEDGE_AMOUNT {
            return Err(ValidationError::PledgeWrongAmount {
                got: pledged,
                want: constants::PLEDGE_AMOUNT,
            });
        }
        Ok(())
    }

    fn validate_node_cancel(
        &self,
        snapshot: &Snapshot,
        tx: &VersionedTransaction,
    ) -> Result<(), ValidationError> {
        let pledging = self
            .membership
            .consensus_pledging
            .as_ref()
            .ok_or(ValidationError::NoPledgingNode)?;
        let (signer, _payee) =
            parse_pledge_extra(&tx.extra).ok_or(ValidationError::PledgeMalformedExtra)?;
        if pledging.signer.public_spend_key != signer {
            return Err(ValidationError::PledgeMismatch);
        }
        if snapshot.timestamp >= pledging.timestamp + constants::NODE_ACCEPT_PERIOD_MINIMUM {
            return Err(ValidationError::CancelTooLate);
        }
        // 1% of the pledge stays slashed; the cancel output refunds the
        // remainder.
        let want = constants::PLEDGE_AMOUNT - constants::PLEDGE_AMOUNT / 100;
        let refunded = tx
            .outputs
            .iter()
            .find(|o| o.output_type == OUTPUT_TYPE_NODE_CANCEL)
            .map(|o| o.amount)
            .unwrap_or(0);
        if refunded != want {
            return Err(ValidationError::CancelWrongAmount {
                got: refunded,
                want,
            });
        }
        Ok(())
    }

    fn validate_node_accept(
        &self,
        snapshot: &Snapshot,
        tx: &VersionedTransaction,
    ) -> Result<(), ValidationError> {
        // Genesis admissions open each founding chain and predate any
        // pledge record.
        if snapshot.round_number == 0
            && self.membership.genesis_nodes.contains(&snapshot.node_id)
        {
            return Ok(());
        }
        let pledging = self
            .membership
            .consensus_pledging
            .as_ref()
            .ok_or(ValidationError::NoPledgingNode)?;
        if snapshot.timestamp < pledging.timestamp + constants::NODE_ACCEPT_PERIOD_MINIMUM {
            return Err(ValidationError::AcceptTooEarly);
        }
        let accepted = tx
            .outputs
            .iter()
            .find(|o| o.output_type == OUTPUT_TYPE_NODE_ACCEPT)
            .map(|o| o.amount)
            .unwrap_or(0);
        if accepted != constants::PLEDGE_AMOUNT {
            return Err(ValidationError::PledgeWrongAmount {
                got: accepted,
                want: constants::PLEDGE_AMOUNT,
            });
        }
        Ok(())
    }

    /// Resolve the transaction a snapshot claims, validating and locking
    /// cache-tier transactions before any persistence. Returns the
    /// transaction and whether it was already finalized, or `None` when it
    /// is unknown (the caller requests it with `want_tx`).
    pub fn check_cache_snapshot_transaction(
        &self,
        snapshot: &Snapshot,
    ) -> Result<Option<(VersionedTransaction, bool)>, ValidationError> {
        if let Some((tx, finalized)) = self.store.read_transaction(snapshot.transaction)? {
            self.validate_kernel_snapshot(snapshot, &tx)?;
            return Ok(Some((tx, finalized)));
        }
        let tx = match self.store.cache_get_transaction(snapshot.transaction)? {
            Some(tx) => tx,
            None => return Ok(None),
        };
        // Full validation happens before the confirmed tier sees the
        // transaction; misbehaving cache entries never get persisted.
        tx.validate_basic()?;
        self.validate_kernel_snapshot(snapshot, &tx)?;
        for (index, input) in tx.inputs.iter().enumerate() {
            if !input.is_spend() {
                continue;
            }
            let utxo = self
                .store
                .read_utxo(input.hash, input.index)?
                .ok_or(StoreError::MissingUtxo {
                    hash: input.hash,
                    index: input.index,
                })?;
            tx.verify_input(index, &utxo.utxo.output)?;
        }
        self.store.lock_inputs(&tx, false)?;
        self.store.write_transaction(&tx)?;
        Ok(Some((tx, false)))
    }
}

/// Apply the membership transition of a finalized admission transaction.
pub fn apply_admission(
    store: &SledStore,
    snapshot: &Snapshot,
    tx: &VersionedTransaction,
) -> Result<bool, ValidationError> {
    match tx.transaction_type() {
        TransactionType::NodePledge => {
            let (signer, payee) =
                parse_pledge_extra(&tx.extra).ok_or(ValidationError::PledgeMalformedExtra)?;
            store.write_consensus_node(&ConsensusNodeRecord {
                signer: Address::from_public_spend(signer),
                payee: Address::from_public_spend(payee),
                state: NodeState::Pledging,
                timestamp: snapshot.timestamp,
            })?;
            Ok(true)
        }
        TransactionType::NodeAccept | TransactionType::NodeCancel => {
            let (signer, payee) =
                parse_pledge_extra(&tx.extra).ok_or(ValidationError::PledgeMalformedExtra)?;
            let state = if tx.transaction_type() == TransactionType::NodeAccept {
                NodeState::Accepted
            } else {
                NodeState::Cancelled
            };
            store.write_consensus_node(&ConsensusNodeRecord {
                signer: Address::from_public_spend(signer),
                payee: Address::from_public_spend(payee),
                state,
                timestamp: snapshot.timestamp,
            })?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
