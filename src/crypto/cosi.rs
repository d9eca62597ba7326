//! Collective Schnorr signatures (CoSi).
//!
//! A [`CosiSignature`] is `(R, s, mask)`: the aggregated nonce commitment,
//! the aggregated response scalar, and a 64-bit bitfield of contributing
//! participant indices. Bit `i` is set iff participant `i` contributed both
//! a commitment and a response.
//!
//! Protocol per snapshot: every participant picks a fresh nonce `r_i` and
//! publishes `R_i = r_i·G`; the leader aggregates `R = Σ R_i`, the challenge
//! is `c = H(R ‖ A ‖ M)` with `A = Σ A_i` over the mask, each participant
//! returns `s_i = r_i + c·a_i`, and `s = Σ s_i`. Verification checks
//! `s·G = R + c·Σ A_i`.

use std::collections::BTreeMap;

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use serde::{Deserialize, Serialize};

use super::keys::{hash_to_scalar, Key, KeyError, Signature};

/// An aggregated collective signature with its participation mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosiSignature {
    pub signature: Signature,
    pub mask: u64,
}

/// Generate a fresh commitment pair `(r, R)` for one CoSi instance.
///
/// The private nonce must never be reused across snapshots; a retry after
/// timeout regenerates it.
pub fn cosi_commit() -> (Key, Key) {
    let r = Key::random();
    let big_r = r.public();
    (r, big_r)
}

/// Compute a participant's response `s_i = r_i + c·a_i`.
pub fn cosi_response(private: &Key, nonce: &Key, challenge: Scalar) -> [u8; 32] {
    (nonce.scalar() + challenge * private.scalar()).to_bytes()
}

impl CosiSignature {
    /// Aggregate participant commitments into `(R, mask)`.
    ///
    /// `commitments` maps participant index to `R_i`; the response scalar
    /// stays zero until [`CosiSignature::aggregate_responses`].
    pub fn aggregate_commitments(
        commitments: &BTreeMap<usize, Key>,
    ) -> Result<CosiSignature, KeyError> {
        if commitments.is_empty() {
            return Err(KeyError::EmptyAggregate);
        }
        let mut mask = 0u64;
        let mut sum = EdwardsPoint::identity();
        for (&index, commitment) in commitments {
            if index >= 64 {
                return Err(KeyError::IndexOutOfRange(index));
            }
            mask |= 1u64 << index;
            sum += commitment.point()?;
        }
        Ok(CosiSignature {
            signature: Signature {
                r: sum.compress().to_bytes(),
                s: [0u8; 32],
            },
            mask,
        })
    }

    /// Participant indices set in the mask, ascending.
    pub fn keys(&self) -> Vec<usize> {
        (0..64).filter(|i| self.mask & (1u64 << i) != 0).collect()
    }

    pub fn mask_contains(&self, index: usize) -> bool {
        index < 64 && self.mask & (1u64 << index) != 0
    }

    /// Number of participants in the mask.
    pub fn signers(&self) -> usize {
        self.mask.count_ones() as usize
    }

    /// Aggregate public key `A = Σ A_i` over the mask.
    ///
    /// `publics` is the full sorted consensus key list; indices in the mask
    /// address into it.
    pub fn aggregate_public(&self, publics: &[Key]) -> Result<EdwardsPoint, KeyError> {
        let mut sum = EdwardsPoint::identity();
        for index in self.keys() {
            let key = publics.get(index).ok_or(KeyError::IndexOutOfRange(index))?;
            sum += key.point()?;
        }
        Ok(sum)
    }

    /// The challenge scalar `c = H(R ‖ A ‖ M)` for this aggregate.
    pub fn challenge(&self, publics: &[Key], message: &[u8]) -> Result<Scalar, KeyError> {
        let aggregate = self.aggregate_public(publics)?;
        Ok(hash_to_scalar(&[
            &self.signature.r,
            &aggregate.compress().to_bytes(),
            message,
        ]))
    }

    /// Sum participant responses into the aggregate scalar `s`.
    pub fn aggregate_responses(&mut self, responses: &[[u8; 32]]) {
        let mut sum = Scalar::ZERO;
        for response in responses {
            sum += Scalar::from_bytes_mod_order(*response);
        }
        self.signature.s = sum.to_bytes();
    }

    /// Verify `s·G = R + c·Σ A_i`.
    pub fn verify(&self, publics: &[Key], message: &[u8]) -> bool {
        let aggregate = match self.aggregate_public(publics) {
            Ok(a) => a,
            Err(_) => return false,
        };
        let big_r = match CompressedEdwardsY(self.signature.r).decompress() {
            Some(p) => p,
            None => return false,
        };
        let s: Option<Scalar> = Scalar::from_canonical_bytes(self.signature.s).into();
        let s = match s {
            Some(s) => s,
            None => return false,
        };
        let c = hash_to_scalar(&[
            &self.signature.r,
            &aggregate.compress().to_bytes(),
            message,
        ]);
        EdwardsPoint::mul_base(&s) == big_r + c * aggregate
    }

    /// Verify and require at least `threshold` participants in the mask.
    pub fn threshold_verify(&self, threshold: usize, publics: &[Key], message: &[u8]) -> bool {
        self.signers() >= threshold && self.verify(publics, message)
    }
}
