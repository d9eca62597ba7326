//! Addresses: the four-key identity of a signer or payee.
//!
//! An address bundles private/public view and spend keys. A "public-mode"
//! address derives its view key deterministically from the public spend
//! key, so the full address can be reconstructed from the spend key alone.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

use crate::crypto::Key;
use crate::Hash;

/// Human-readable address prefix.
pub const ADDRESS_PREFIX: &str = "MDN";

/// Errors from address encoding and decoding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address must start with {ADDRESS_PREFIX}")]
    InvalidPrefix,
    #[error("invalid address length")]
    InvalidLength,
    #[error("address checksum mismatch")]
    InvalidChecksum,
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// A four-key address. Private keys are zero when the address was decoded
/// from its public string form.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Address {
    pub private_view_key: Key,
    pub private_spend_key: Key,
    pub public_view_key: Key,
    pub public_spend_key: Key,
}

impl Address {
    /// Derive a full address deterministically from a 64-byte seed.
    ///
    /// Spend and view scalars use distinct derivation domains, so they
    /// differ even for degenerate seeds.
    pub fn from_seed(seed: &[u8; 64]) -> Address {
        let mut spend_input = Vec::with_capacity(64 + 5);
        spend_input.extend_from_slice(b"spend");
        spend_input.extend_from_slice(seed);
        let mut view_input = Vec::with_capacity(64 + 4);
        view_input.extend_from_slice(b"view");
        view_input.extend_from_slice(seed);

        let private_spend_key = Key::from_seed(&spend_input);
        let private_view_key = Key::from_seed(&view_input);
        spend_input.zeroize();
        view_input.zeroize();

        Address {
            public_view_key: private_view_key.public(),
            public_spend_key: private_spend_key.public(),
            private_view_key,
            private_spend_key,
        }
    }

    /// Build an address from a private spend key, deriving the view key
    /// in public mode.
    pub fn from_spend_key(private_spend_key: Key) -> Address {
        let mut addr = Address {
            private_spend_key,
            public_spend_key: private_spend_key.public(),
            ..Default::default()
        };
        addr.derive_public_view();
        addr
    }

    /// Rebuild a public-mode address from a public spend key alone.
    pub fn from_public_spend(public_spend_key: Key) -> Address {
        let private_view_key = public_spend_key.deterministic_hash_derive();
        Address {
            public_spend_key,
            public_view_key: private_view_key.public(),
            ..Default::default()
        }
    }

    /// Switch to public mode: the private view key becomes the
    /// deterministic hash derivation of the public spend key.
    pub fn derive_public_view(&mut self) {
        self.private_view_key = self.public_spend_key.deterministic_hash_derive();
        self.public_view_key = self.private_view_key.public();
    }

    /// The identifier hash of the public keys.
    pub fn hash(&self) -> Hash {
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&self.public_spend_key.0);
        buf[32..].copy_from_slice(&self.public_view_key.0);
        Hash::new(&buf)
    }

    /// Parse the public string form. Private keys are left zero.
    pub fn from_string(s: &str) -> Result<Address, AddressError> {
        let body = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or(AddressError::InvalidPrefix)?;
        let data = hex::decode(body)?;
        if data.len() != 68 {
            return Err(AddressError::InvalidLength);
        }
        let public_spend_key = Key(data[..32].try_into().unwrap());
        let public_view_key = Key(data[32..64].try_into().unwrap());
        let checksum = address_checksum(&public_spend_key, &public_view_key);
        if checksum[..4] != data[64..] {
            return Err(AddressError::InvalidChecksum);
        }
        Ok(Address {
            public_spend_key,
            public_view_key,
            ..Default::default()
        })
    }
}

fn address_checksum(spend: &Key, view: &Key) -> [u8; 32] {
    let mut buf = Vec::with_capacity(ADDRESS_PREFIX.len() + 64);
    buf.extend_from_slice(ADDRESS_PREFIX.as_bytes());
    buf.extend_from_slice(&spend.0);
    buf.extend_from_slice(&view.0);
    Hash::new(&buf).0
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let checksum = address_checksum(&self.public_spend_key, &self.public_view_key);
        let mut data = Vec::with_capacity(68);
        data.extend_from_slice(&self.public_spend_key.0);
        data.extend_from_slice(&self.public_view_key.0);
        data.extend_from_slice(&checksum[..4]);
        write!(f, "{}{}", ADDRESS_PREFIX, hex::encode(data))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_string(s)
    }
}

// Addresses serialize as their public string form; private keys never
// cross a serialization boundary.
impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_string(&s).map_err(D::Error::custom)
    }
}
