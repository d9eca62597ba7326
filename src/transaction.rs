//! Versioned transactions, outputs, UTXOs, and mint distributions.
//!
//! Transactions carry opaque typed scripts; the kernel only classifies them
//! by shape (script / mint / node admission) and enforces the admission and
//! mint rules. Everything else is validated elsewhere.

use serde::{Deserialize, Serialize};

use crate::crypto::{Key, Signature};
use crate::Hash;

/// Current transaction version.
pub const TX_VERSION: u8 = 1;

/// Output type tags. The transaction type is derived from these shapes.
pub const OUTPUT_TYPE_SCRIPT: u8 = 0x00;
pub const OUTPUT_TYPE_NODE_PLEDGE: u8 = 0xa0;
pub const OUTPUT_TYPE_NODE_ACCEPT: u8 = 0xa1;
pub const OUTPUT_TYPE_NODE_CANCEL: u8 = 0xa2;

/// Classification of a transaction by its input and output shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Script,
    Mint,
    NodePledge,
    NodeAccept,
    NodeCancel,
}

/// Errors from structural transaction checks.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction has no inputs")]
    NoInputs,
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("duplicate input {0}:{1}")]
    DuplicateInput(Hash, usize),
    #[error("output amount is zero")]
    ZeroAmount,
    #[error("unsupported transaction version {0}")]
    BadVersion(u8),
    #[error("input {0} signature set missing or invalid")]
    BadSignature(usize),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Mint metadata carried by a mint input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintData {
    pub group: String,
    pub batch: u64,
    pub amount: u64,
}

impl MintData {
    /// The locked distribution record this mint produces once bound to a
    /// transaction.
    pub fn distribute(&self, transaction: Hash) -> MintDistribution {
        MintDistribution {
            group: self.group.clone(),
            batch: self.batch,
            amount: self.amount,
            transaction,
        }
    }
}

/// A locked mint: at most one distribution per `(group, batch)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintDistribution {
    pub group: String,
    pub batch: u64,
    pub amount: u64,
    pub transaction: Hash,
}

/// Deposit metadata for externally funded inputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositData {
    pub chain: Hash,
    pub transaction: String,
    pub amount: u64,
}

/// A transaction input: a prior output reference, or genesis / deposit /
/// mint metadata for inputs that create value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub hash: Hash,
    pub index: usize,
    #[serde(default)]
    pub genesis: Vec<u8>,
    #[serde(default)]
    pub deposit: Option<DepositData>,
    #[serde(default)]
    pub mint: Option<MintData>,
}

impl Input {
    pub fn reference(hash: Hash, index: usize) -> Input {
        Input {
            hash,
            index,
            ..Default::default()
        }
    }

    /// True when this input spends a prior output rather than minting,
    /// depositing, or bootstrapping value.
    pub fn is_spend(&self) -> bool {
        self.genesis.is_empty() && self.deposit.is_none() && self.mint.is_none()
    }
}

/// A spending condition: currently the `(0xfe, 0x40, threshold)` operator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script(pub Vec<u8>);

impl Script {
    pub fn operator(threshold: u8) -> Script {
        Script(vec![0xfe, 0x40, threshold])
    }

    pub fn threshold(&self) -> Option<u8> {
        match self.0.as_slice() {
            [0xfe, 0x40, t] => Some(*t),
            _ => None,
        }
    }
}

/// A transaction output: typed, amount-bearing, locked to ghost keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "type")]
    pub output_type: u8,
    pub amount: u64,
    pub keys: Vec<Key>,
    pub script: Script,
    pub mask: Key,
}

/// An unspent output with its position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub hash: Hash,
    pub index: usize,
    pub output: Output,
}

/// A UTXO with its lock state: `lock` names the transaction that consumed
/// it, if any.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoWithLock {
    pub utxo: Utxo,
    pub lock: Option<Hash>,
}

/// A versioned transaction. `signatures[i]` holds the signature set for
/// input `i`; the payload hash excludes all signatures.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedTransaction {
    pub version: u8,
    pub asset: Hash,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub extra: Vec<u8>,
    #[serde(default)]
    pub signatures: Vec<Vec<Signature>>,
}

impl VersionedTransaction {
    pub fn new(asset: Hash) -> VersionedTransaction {
        VersionedTransaction {
            version: TX_VERSION,
            asset,
            ..Default::default()
        }
    }

    /// The serialized pre-signature digest identifying this transaction.
    pub fn payload_hash(&self) -> Hash {
        let mut unsigned = self.clone();
        unsigned.signatures.clear();
        // A struct that just serialized cannot fail to serialize again.
        let bytes = rmp_serde::to_vec(&unsigned).expect("transaction payload encoding");
        Hash::new(&bytes)
    }

    /// Classify by shape: mint inputs dominate, then admission output
    /// types, otherwise a plain script transaction.
    pub fn transaction_type(&self) -> TransactionType {
        if self.inputs.iter().any(|i| i.mint.is_some()) {
            return TransactionType::Mint;
        }
        for output in &self.outputs {
            match output.output_type {
                OUTPUT_TYPE_NODE_PLEDGE => return TransactionType::NodePledge,
                OUTPUT_TYPE_NODE_ACCEPT => return TransactionType::NodeAccept,
                OUTPUT_TYPE_NODE_CANCEL => return TransactionType::NodeCancel,
                _ => {}
            }
        }
        TransactionType::Script
    }

    /// Structural checks independent of store state.
    pub fn validate_basic(&self) -> Result<(), TransactionError> {
        if self.version != TX_VERSION {
            return Err(TransactionError::BadVersion(self.version));
        }
        if self.inputs.is_empty() {
            return Err(TransactionError::NoInputs);
        }
        if self.outputs.is_empty() {
            return Err(TransactionError::NoOutputs);
        }
        let mut seen = std::collections::HashSet::new();
        for input in &self.inputs {
            if input.is_spend() && !seen.insert((input.hash, input.index)) {
                return Err(TransactionError::DuplicateInput(input.hash, input.index));
            }
        }
        if self.outputs.iter().any(|o| o.amount == 0) {
            return Err(TransactionError::ZeroAmount);
        }
        Ok(())
    }

    /// Sign every input with the given private keys over the payload hash.
    pub fn sign(&mut self, keys: &[Key]) {
        let payload = self.payload_hash();
        self.signatures = self
            .inputs
            .iter()
            .map(|_| keys.iter().map(|k| k.sign(&payload.0)).collect())
            .collect();
    }

    /// Verify the signature set of input `index` against the keys of the
    /// output it spends: the script threshold many signatures must each
    /// match a distinct output key.
    pub fn verify_input(&self, index: usize, spent: &Output) -> Result<(), TransactionError> {
        let sigs = self
            .signatures
            .get(index)
            .ok_or(TransactionError::BadSignature(index))?;
        let threshold = spent.script.threshold().unwrap_or(1) as usize;
        let payload = self.payload_hash();
        let mut matched = vec![false; spent.keys.len()];
        let mut valid = 0usize;
        for sig in sigs {
            for (ki, key) in spent.keys.iter().enumerate() {
                if !matched[ki] && key.verify(&payload.0, sig) {
                    matched[ki] = true;
                    valid += 1;
                    break;
                }
            }
        }
        if valid < threshold {
            return Err(TransactionError::BadSignature(index));
        }
        Ok(())
    }

    pub fn marshal(&self) -> Vec<u8> {
        rmp_serde::to_vec(self).expect("transaction encoding")
    }

    pub fn unmarshal(data: &[u8]) -> Result<VersionedTransaction, TransactionError> {
        rmp_serde::from_slice(data).map_err(|e| TransactionError::Serialization(e.to_string()))
    }
}

/// The pledge extra field is exactly the signer then payee public spend
/// keys.
pub fn parse_pledge_extra(extra: &[u8]) -> Option<(Key, Key)> {
    if extra.len() != 64 {
        return None;
    }
    let signer = Key(extra[..32].try_into().unwrap());
    let payee = Key(extra[32..].try_into().unwrap());
    Some((signer, payee))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> VersionedTransaction {
        let mut tx = VersionedTransaction::new(Hash::new(b"asset"));
        tx.inputs.push(Input::reference(Hash::new(b"prev"), 0));
        tx.outputs.push(Output {
            output_type: OUTPUT_TYPE_SCRIPT,
            amount: 100,
            keys: vec![Key::random().public()],
            script: Script::operator(1),
            mask: Key::random().public(),
        });
        tx
    }

    #[test]
    fn payload_hash_excludes_signatures() {
        let mut tx = sample_tx();
        let before = tx.payload_hash();
        tx.sign(&[Key::random()]);
        assert_eq!(tx.payload_hash(), before);
    }

    #[test]
    fn marshal_roundtrip() {
        let mut tx = sample_tx();
        tx.sign(&[Key::random()]);
        let bytes = tx.marshal();
        let back = VersionedTransaction::unmarshal(&bytes).unwrap();
        assert_eq!(back, tx);
        assert_eq!(back.payload_hash(), tx.payload_hash());
    }

    #[test]
    fn transaction_type_from_shapes() {
        let mut tx = sample_tx();
        assert_eq!(tx.transaction_type(), TransactionType::Script);

        tx.outputs[0].output_type = OUTPUT_TYPE_NODE_PLEDGE;
        assert_eq!(tx.transaction_type(), TransactionType::NodePledge);

        tx.inputs[0].mint = Some(MintData {
            group: "KERNELNODE".into(),
            batch: 1,
            amount: 5,
        });
        // Mint inputs dominate output shapes.
        assert_eq!(tx.transaction_type(), TransactionType::Mint);
    }

    #[test]
    fn duplicate_input_rejected() {
        let mut tx = sample_tx();
        tx.inputs.push(Input::reference(Hash::new(b"prev"), 0));
        assert!(matches!(
            tx.validate_basic(),
            Err(TransactionError::DuplicateInput(_, 0))
        ));
    }

    #[test]
    fn zero_amount_rejected() {
        let mut tx = sample_tx();
        tx.outputs[0].amount = 0;
        assert!(matches!(
            tx.validate_basic(),
            Err(TransactionError::ZeroAmount)
        ));
    }

    #[test]
    fn input_signature_verification() {
        let owner = Key::random();
        let spent = Output {
            output_type: OUTPUT_TYPE_SCRIPT,
            amount: 50,
            keys: vec![owner.public()],
            script: Script::operator(1),
            mask: Key::random().public(),
        };
        let mut tx = sample_tx();
        tx.sign(&[owner]);
        tx.verify_input(0, &spent).unwrap();

        let stranger = Key::random();
        tx.sign(&[stranger]);
        assert!(tx.verify_input(0, &spent).is_err());
    }

    #[test]
    fn pledge_extra_layout() {
        let signer = Key::random().public();
        let payee = Key::random().public();
        let mut extra = Vec::new();
        extra.extend_from_slice(&signer.0);
        extra.extend_from_slice(&payee.0);
        let (s, p) = parse_pledge_extra(&extra).unwrap();
        assert_eq!(s, signer);
        assert_eq!(p, payee);
        assert!(parse_pledge_extra(&extra[..63]).is_none());
    }
}
