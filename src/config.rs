//! Node configuration.
//!
//! A node's state directory holds `config.json` (the signer key and
//! listener), `genesis.json`, `nodes.json` (bootstrap neighbors), and the
//! store subdirectory. Missing or malformed configuration is fatal at
//! startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::constants;
use crate::crypto::Key;

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid signer key: {0}")]
    BadSigner(hex::FromHexError),
}

/// `config.json`: the node's own identity and runtime limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hex-encoded private spend key of the signer.
    pub signer: String,
    /// Address peers dial, e.g. `"127.0.0.1:7239"`.
    pub listener: String,
    /// Cache TTL in seconds.
    #[serde(rename = "cache-ttl", default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Cache tier budget in MB.
    #[serde(rename = "max-cache-size", default = "default_max_cache_size")]
    pub max_cache_size: u64,
}

fn default_cache_ttl() -> u64 {
    constants::DEFAULT_CACHE_TTL_SECS
}

fn default_max_cache_size() -> u64 {
    constants::DEFAULT_MAX_CACHE_SIZE_MB
}

impl NodeConfig {
    pub fn load(dir: &Path) -> Result<NodeConfig, ConfigError> {
        let path = dir.join("config.json");
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Malformed { path, source })
    }

    /// The signer address in public mode, derived from the private spend
    /// key.
    pub fn signer_address(&self) -> Result<Address, ConfigError> {
        let key: Key = self.signer.parse().map_err(ConfigError::BadSigner)?;
        Ok(Address::from_spend_key(key))
    }
}

/// One `nodes.json` entry: a bootstrap neighbor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerEntry {
    pub signer: Address,
    pub host: String,
}

/// Load the bootstrap neighbor list.
pub fn load_peer_entries(dir: &Path) -> Result<Vec<PeerEntry>, ConfigError> {
    let path = dir.join("nodes.json");
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Malformed { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_json() {
        let dir = tempfile::tempdir().unwrap();
        let key = Key::random();
        let raw = format!(
            r#"{{"signer": "{}", "listener": "127.0.0.1:7239", "cache-ttl": 7200, "max-cache-size": 256}}"#,
            key
        );
        std::fs::write(dir.path().join("config.json"), raw).unwrap();

        let config = NodeConfig::load(dir.path()).unwrap();
        assert_eq!(config.listener, "127.0.0.1:7239");
        assert_eq!(config.cache_ttl, 7200);
        assert_eq!(config.max_cache_size, 256);
        let addr = config.signer_address().unwrap();
        assert_eq!(addr.private_spend_key, key);
        // Config signers are public-mode addresses.
        assert_eq!(
            addr.private_view_key,
            addr.public_spend_key.deterministic_hash_derive()
        );
    }

    #[test]
    fn defaults_apply() {
        let dir = tempfile::tempdir().unwrap();
        let raw = format!(
            r#"{{"signer": "{}", "listener": "0.0.0.0:7239"}}"#,
            Key::random()
        );
        std::fs::write(dir.path().join("config.json"), raw).unwrap();
        let config = NodeConfig::load(dir.path()).unwrap();
        assert_eq!(config.cache_ttl, constants::DEFAULT_CACHE_TTL_SECS);
        assert_eq!(config.max_cache_size, constants::DEFAULT_MAX_CACHE_SIZE_MB);
    }

    #[test]
    fn missing_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            NodeConfig::load(dir.path()),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn malformed_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{nope").unwrap();
        assert!(matches!(
            NodeConfig::load(dir.path()),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn peer_entries_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let addr = Address::from_seed(&[5u8; 64]);
        let raw = format!(r#"[{{"signer": "{}", "host": "10.0.0.1:7239"}}]"#, addr);
        std::fs::write(dir.path().join("nodes.json"), raw).unwrap();
        let peers = load_peer_entries(dir.path()).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].host, "10.0.0.1:7239");
        assert_eq!(peers[0].signer.public_spend_key, addr.public_spend_key);
    }
}
