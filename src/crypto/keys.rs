//! Ed25519-group keys and single-signer Schnorr signatures.
//!
//! A [`Key`] is a 32-byte curve element: a canonical scalar when used as a
//! private key, a compressed Edwards point when used as a public key or a
//! commitment. Which one it is follows from where it came from; the store
//! and the wire never need to distinguish.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::Hash;

/// Errors from key and signature operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key is not a valid curve point")]
    InvalidPoint,
    #[error("key is not a canonical scalar")]
    InvalidScalar,
    #[error("participant index {0} exceeds the 64-bit mask")]
    IndexOutOfRange(usize),
    #[error("no participants in aggregate")]
    EmptyAggregate,
}

/// A 32-byte Schnorr-curve element.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key(pub [u8; 32]);

impl Key {
    /// Derive a private key from a seed by wide reduction.
    pub fn from_seed(seed: &[u8]) -> Key {
        Key(hash_to_scalar(&[seed]).to_bytes())
    }

    /// A fresh uniformly random private key.
    pub fn random() -> Key {
        let mut wide = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut wide);
        Key(Scalar::from_bytes_mod_order_wide(&wide).to_bytes())
    }

    /// The public key of this private key: `a·G`.
    pub fn public(&self) -> Key {
        Key(EdwardsPoint::mul_base(&self.scalar()).compress().to_bytes())
    }

    /// Reproducibly derive a private scalar from this (public) key.
    ///
    /// Used to recover the private view key of a public-mode address from
    /// its public spend key alone.
    pub fn deterministic_hash_derive(&self) -> Key {
        Key(hash_to_scalar(&[b"meridian.derive", &self.0]).to_bytes())
    }

    /// Interpret as a scalar, reducing mod the group order.
    pub fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }

    /// Interpret as a compressed point.
    pub fn point(&self) -> Result<EdwardsPoint, KeyError> {
        CompressedEdwardsY(self.0)
            .decompress()
            .ok_or(KeyError::InvalidPoint)
    }

    /// The identifier hash of this key.
    pub fn hash(&self) -> Hash {
        Hash::new(&self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Schnorr-sign a message with this private key.
    ///
    /// `R = r·G`, `s = r + H(R ‖ A ‖ msg)·a`. The nonce mixes fresh OS
    /// randomness with the key and message so it is never reused.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let mut noise = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut noise);
        let r = hash_to_scalar(&[&noise, &self.0, message]);
        let big_r = EdwardsPoint::mul_base(&r).compress().to_bytes();
        let public = self.public();
        let c = hash_to_scalar(&[&big_r, &public.0, message]);
        let s = r + c * self.scalar();
        Signature {
            r: big_r,
            s: s.to_bytes(),
        }
    }

    /// Verify a Schnorr signature against this public key.
    pub fn verify(&self, message: &[u8], sig: &Signature) -> bool {
        let a = match self.point() {
            Ok(p) => p,
            Err(_) => return false,
        };
        let big_r = match CompressedEdwardsY(sig.r).decompress() {
            Some(p) => p,
            None => return false,
        };
        let s: Option<Scalar> = Scalar::from_canonical_bytes(sig.s).into();
        let s = match s {
            Some(s) => s,
            None => return false,
        };
        let c = hash_to_scalar(&[&sig.r, &self.0, message]);
        EdwardsPoint::mul_base(&s) == big_r + c * a
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", hex::encode(&self.0[..8]))
    }
}

impl std::str::FromStr for Key {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Key(bytes))
    }
}

/// A 64-byte Schnorr signature: compressed nonce point `R` then scalar `s`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r);
        out[32..].copy_from_slice(&self.s);
        out
    }

    pub fn from_slice(data: &[u8]) -> Option<Signature> {
        if data.len() != 64 {
            return None;
        }
        let mut sig = Signature::default();
        sig.r.copy_from_slice(&data[..32]);
        sig.s.copy_from_slice(&data[32..]);
        Some(sig)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.r[..8]))
    }
}

/// Hash a sequence of byte strings to a scalar by 64-byte wide reduction.
pub fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    let mut wide = [0u8; 64];
    hasher.finalize_xof().fill(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Derive the one-time (ghost) public key of an output:
/// `P = H_s(r·A)·G + B` where `A`/`B` are the payee's public view/spend
/// keys and `r` is the per-output mask private key.
pub fn derive_ghost_public_key(r: &Key, view_pub: &Key, spend_pub: &Key) -> Result<Key, KeyError> {
    let shared = r.scalar() * view_pub.point()?;
    let h = hash_to_scalar(&[&shared.compress().to_bytes()]);
    let point = EdwardsPoint::mul_base(&h) + spend_pub.point()?;
    Ok(Key(point.compress().to_bytes()))
}

/// Recover the one-time private key of an output the owner received:
/// `p = H_s(a·R) + b` with the owner's private view/spend keys.
pub fn derive_ghost_private_key(
    mask: &Key,
    view_priv: &Key,
    spend_priv: &Key,
) -> Result<Key, KeyError> {
    let shared = view_priv.scalar() * mask.point()?;
    let h = hash_to_scalar(&[&shared.compress().to_bytes()]);
    Ok(Key((h + spend_priv.scalar()).to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let private = Key::random();
        let public = private.public();
        let sig = private.sign(b"hello meridian");
        assert!(public.verify(b"hello meridian", &sig));
        assert!(!public.verify(b"hello meridiam", &sig));
    }

    #[test]
    fn wrong_key_rejected() {
        let private = Key::random();
        let other = Key::random().public();
        let sig = private.sign(b"msg");
        assert!(!other.verify(b"msg", &sig));
    }

    #[test]
    fn from_seed_deterministic() {
        let a = Key::from_seed(&[7u8; 64]);
        let b = Key::from_seed(&[7u8; 64]);
        assert_eq!(a, b);
        assert_ne!(a, Key::from_seed(&[8u8; 64]));
    }

    #[test]
    fn deterministic_hash_derive_stable() {
        let public = Key::random().public();
        assert_eq!(
            public.deterministic_hash_derive(),
            public.deterministic_hash_derive()
        );
    }

    #[test]
    fn ghost_key_roundtrip() {
        // Payee keypairs
        let view_priv = Key::random();
        let spend_priv = Key::random();
        let view_pub = view_priv.public();
        let spend_pub = spend_priv.public();
        // Sender picks a per-output mask key r, publishes R = r·G
        let r = Key::random();
        let mask = r.public();

        let ghost_pub = derive_ghost_public_key(&r, &view_pub, &spend_pub).unwrap();
        let ghost_priv = derive_ghost_private_key(&mask, &view_priv, &spend_priv).unwrap();
        assert_eq!(ghost_priv.public(), ghost_pub);

        // And the recovered key actually signs
        let sig = ghost_priv.sign(b"spend");
        assert!(ghost_pub.verify(b"spend", &sig));
    }

    #[test]
    fn signature_byte_roundtrip() {
        let sig = Key::random().sign(b"x");
        let bytes = sig.to_bytes();
        assert_eq!(Signature::from_slice(&bytes).unwrap(), sig);
        assert!(Signature::from_slice(&bytes[..63]).is_none());
    }
}
