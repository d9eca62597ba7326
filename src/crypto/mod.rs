//! Cryptographic primitives: Ed25519-group keys, Schnorr signatures, and
//! collective (CoSi) signature aggregation.

pub mod cosi;
pub mod keys;

pub use cosi::{cosi_commit, cosi_response, CosiSignature};
pub use keys::{hash_to_scalar, Key, KeyError, Signature};
