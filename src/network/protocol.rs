//! The peer wire protocol.
//!
//! Each message is a single tag byte followed by a typed payload; framing
//! (length prefixes) is the transport's concern. Structured payloads are
//! msgpack; fixed-width fields are raw bytes in the documented order.

use serde::{Deserialize, Serialize};

use crate::consensus::graph::SyncPoint;
use crate::crypto::{CosiSignature, Key, Signature};
use crate::snapshot::Snapshot;
use crate::transaction::VersionedTransaction;
use crate::Hash;

pub const PEER_MESSAGE_TYPE_PING: u8 = 1;
pub const PEER_MESSAGE_TYPE_AUTHENTICATION: u8 = 3;
pub const PEER_MESSAGE_TYPE_GRAPH: u8 = 4;
pub const PEER_MESSAGE_TYPE_SNAPSHOT_CONFIRM: u8 = 5;
pub const PEER_MESSAGE_TYPE_TRANSACTION_REQUEST: u8 = 6;
pub const PEER_MESSAGE_TYPE_TRANSACTION: u8 = 7;
pub const PEER_MESSAGE_TYPE_SNAPSHOT_ANNOUNCEMENT: u8 = 10;
pub const PEER_MESSAGE_TYPE_SNAPSHOT_COMMITMENT: u8 = 11;
pub const PEER_MESSAGE_TYPE_TRANSACTION_CHALLENGE: u8 = 12;
pub const PEER_MESSAGE_TYPE_SNAPSHOT_RESPONSE: u8 = 13;
pub const PEER_MESSAGE_TYPE_SNAPSHOT_FINALIZATION: u8 = 14;

/// Errors from message parsing.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MessageError {
    #[error("empty message")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("invalid {kind} message size {size}")]
    InvalidSize { kind: &'static str, size: usize },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// A parsed peer message.
#[derive(Clone, Debug)]
pub enum PeerMessage {
    Ping,
    Authentication(Vec<u8>),
    Graph(Vec<SyncPoint>),
    SnapshotConfirm(Hash),
    TransactionRequest(Hash),
    Transaction(Box<VersionedTransaction>),
    SnapshotAnnouncement {
        commitment: Key,
        snapshot: Box<Snapshot>,
    },
    SnapshotCommitment {
        snapshot_hash: Hash,
        commitment: Key,
        want_tx: bool,
    },
    TransactionChallenge {
        snapshot_hash: Hash,
        cosi: CosiSignature,
        transaction: Option<Box<VersionedTransaction>>,
    },
    SnapshotResponse {
        snapshot_hash: Hash,
        response: [u8; 32],
    },
    SnapshotFinalization(Box<Snapshot>),
}

fn msgpack<T: Serialize>(value: &T) -> Vec<u8> {
    rmp_serde::to_vec(value).expect("wire encoding")
}

pub fn build_ping_message() -> Vec<u8> {
    vec![PEER_MESSAGE_TYPE_PING]
}

pub fn build_authentication_message(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + payload.len());
    data.push(PEER_MESSAGE_TYPE_AUTHENTICATION);
    data.extend_from_slice(payload);
    data
}

pub fn build_graph_message(points: &[SyncPoint]) -> Vec<u8> {
    let mut data = vec![PEER_MESSAGE_TYPE_GRAPH];
    data.extend_from_slice(&msgpack(&points));
    data
}

pub fn build_snapshot_confirm_message(snapshot_hash: Hash) -> Vec<u8> {
    let mut data = vec![PEER_MESSAGE_TYPE_SNAPSHOT_CONFIRM];
    data.extend_from_slice(&snapshot_hash.0);
    data
}

pub fn build_transaction_request_message(tx_hash: Hash) -> Vec<u8> {
    let mut data = vec![PEER_MESSAGE_TYPE_TRANSACTION_REQUEST];
    data.extend_from_slice(&tx_hash.0);
    data
}

pub fn build_transaction_message(tx: &VersionedTransaction) -> Vec<u8> {
    let mut data = vec![PEER_MESSAGE_TYPE_TRANSACTION];
    data.extend_from_slice(&tx.marshal());
    data
}

/// Step 1: leader → followers, `R_L ‖ snapshot`.
pub fn build_snapshot_announcement_message(snapshot: &Snapshot, commitment: Key) -> Vec<u8> {
    let mut data = vec![PEER_MESSAGE_TYPE_SNAPSHOT_ANNOUNCEMENT];
    data.extend_from_slice(&commitment.0);
    data.extend_from_slice(&snapshot.marshal());
    data
}

/// Step 2: follower → leader, `snap ‖ R_i ‖ want_tx`.
pub fn build_snapshot_commitment_message(
    snapshot_hash: Hash,
    commitment: Key,
    want_tx: bool,
) -> Vec<u8> {
    let mut data = vec![PEER_MESSAGE_TYPE_SNAPSHOT_COMMITMENT];
    data.extend_from_slice(&snapshot_hash.0);
    data.extend_from_slice(&commitment.0);
    data.push(want_tx as u8);
    data
}

/// Step 3: leader → followers, `snap ‖ (R,s) ‖ mask ‖ [tx]`.
pub fn build_transaction_challenge_message(
    snapshot_hash: Hash,
    cosi: &CosiSignature,
    tx: Option<&VersionedTransaction>,
) -> Vec<u8> {
    let mut data = vec![PEER_MESSAGE_TYPE_TRANSACTION_CHALLENGE];
    data.extend_from_slice(&snapshot_hash.0);
    data.extend_from_slice(&cosi.signature.to_bytes());
    data.extend_from_slice(&cosi.mask.to_be_bytes());
    if let Some(tx) = tx {
        data.extend_from_slice(&tx.marshal());
    }
    data
}

/// Step 4: follower → leader, `snap ‖ s_i`.
pub fn build_snapshot_response_message(snapshot_hash: Hash, response: [u8; 32]) -> Vec<u8> {
    let mut data = vec![PEER_MESSAGE_TYPE_SNAPSHOT_RESPONSE];
    data.extend_from_slice(&snapshot_hash.0);
    data.extend_from_slice(&response);
    data
}

/// Step 5: leader → all, the fully signed snapshot.
pub fn build_snapshot_finalization_message(snapshot: &Snapshot) -> Vec<u8> {
    let mut data = vec![PEER_MESSAGE_TYPE_SNAPSHOT_FINALIZATION];
    data.extend_from_slice(&snapshot.marshal());
    data
}

/// Parse a tagged wire message.
pub fn parse_network_message(data: &[u8]) -> Result<PeerMessage, MessageError> {
    let (&tag, payload) = data.split_first().ok_or(MessageError::Empty)?;
    match tag {
        PEER_MESSAGE_TYPE_PING => Ok(PeerMessage::Ping),
        PEER_MESSAGE_TYPE_AUTHENTICATION => Ok(PeerMessage::Authentication(payload.to_vec())),
        PEER_MESSAGE_TYPE_GRAPH => {
            let points = rmp_serde::from_slice(payload)
                .map_err(|e| MessageError::Malformed(e.to_string()))?;
            Ok(PeerMessage::Graph(points))
        }
        PEER_MESSAGE_TYPE_SNAPSHOT_CONFIRM => {
            let hash = Hash::from_slice(payload).ok_or(MessageError::InvalidSize {
                kind: "confirm",
                size: payload.len(),
            })?;
            Ok(PeerMessage::SnapshotConfirm(hash))
        }
        PEER_MESSAGE_TYPE_TRANSACTION_REQUEST => {
            let hash = Hash::from_slice(payload).ok_or(MessageError::InvalidSize {
                kind: "transaction request",
                size: payload.len(),
            })?;
            Ok(PeerMessage::TransactionRequest(hash))
        }
        PEER_MESSAGE_TYPE_TRANSACTION => {
            let tx = VersionedTransaction::unmarshal(payload)
                .map_err(|e| MessageError::Malformed(e.to_string()))?;
            Ok(PeerMessage::Transaction(Box::new(tx)))
        }
        PEER_MESSAGE_TYPE_SNAPSHOT_ANNOUNCEMENT => {
            if payload.len() <= 32 {
                return Err(MessageError::InvalidSize {
                    kind: "announcement",
                    size: payload.len(),
                });
            }
            let commitment = Key(payload[..32].try_into().unwrap());
            let snapshot = Snapshot::unmarshal(&payload[32..])
                .ok_or_else(|| MessageError::Malformed("announcement snapshot".into()))?;
            Ok(PeerMessage::SnapshotAnnouncement {
                commitment,
                snapshot: Box::new(snapshot),
            })
        }
        PEER_MESSAGE_TYPE_SNAPSHOT_COMMITMENT => {
            if payload.len() != 65 {
                return Err(MessageError::InvalidSize {
                    kind: "commitment",
                    size: payload.len(),
                });
            }
            Ok(PeerMessage::SnapshotCommitment {
                snapshot_hash: Hash(payload[..32].try_into().unwrap()),
                commitment: Key(payload[32..64].try_into().unwrap()),
                want_tx: payload[64] == 1,
            })
        }
        PEER_MESSAGE_TYPE_TRANSACTION_CHALLENGE => {
            if payload.len() < 104 {
                return Err(MessageError::InvalidSize {
                    kind: "challenge",
                    size: payload.len(),
                });
            }
            let snapshot_hash = Hash(payload[..32].try_into().unwrap());
            let signature = Signature::from_slice(&payload[32..96]).unwrap();
            let mask = u64::from_be_bytes(payload[96..104].try_into().unwrap());
            let transaction = if payload.len() > 104 {
                let tx = VersionedTransaction::unmarshal(&payload[104..])
                    .map_err(|e| MessageError::Malformed(e.to_string()))?;
                Some(Box::new(tx))
            } else {
                None
            };
            Ok(PeerMessage::TransactionChallenge {
                snapshot_hash,
                cosi: CosiSignature { signature, mask },
                transaction,
            })
        }
        PEER_MESSAGE_TYPE_SNAPSHOT_RESPONSE => {
            if payload.len() != 64 {
                return Err(MessageError::InvalidSize {
                    kind: "response",
                    size: payload.len(),
                });
            }
            Ok(PeerMessage::SnapshotResponse {
                snapshot_hash: Hash(payload[..32].try_into().unwrap()),
                response: payload[32..].try_into().unwrap(),
            })
        }
        PEER_MESSAGE_TYPE_SNAPSHOT_FINALIZATION => {
            let snapshot = Snapshot::unmarshal(payload)
                .ok_or_else(|| MessageError::Malformed("finalization snapshot".into()))?;
            Ok(PeerMessage::SnapshotFinalization(Box::new(snapshot)))
        }
        other => Err(MessageError::UnknownType(other)),
    }
}

/// Fields of an authentication payload:
/// `u64_be timestamp ‖ peer_id ‖ signature over (ts ‖ peer_id) ‖ listener`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticationPayload {
    pub timestamp: u64,
    pub peer_id: Hash,
    pub signature: Signature,
    pub listener: String,
}

/// Build the authentication payload for our own identity.
pub fn build_authentication_payload(
    signer_private: &Key,
    my_id: Hash,
    listener: &str,
    now_secs: u64,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + 32 + 64 + listener.len());
    data.extend_from_slice(&now_secs.to_be_bytes());
    data.extend_from_slice(&my_id.0);
    let signature = signer_private.sign(&data);
    data.extend_from_slice(&signature.to_bytes());
    data.extend_from_slice(listener.as_bytes());
    data
}

/// Split an authentication payload into its fields. Signature and
/// freshness checks are the caller's policy.
pub fn parse_authentication_payload(
    payload: &[u8],
) -> Result<AuthenticationPayload, MessageError> {
    if payload.len() < 104 {
        return Err(MessageError::InvalidSize {
            kind: "authentication",
            size: payload.len(),
        });
    }
    let timestamp = u64::from_be_bytes(payload[..8].try_into().unwrap());
    let peer_id = Hash(payload[8..40].try_into().unwrap());
    let signature = Signature::from_slice(&payload[40..104]).unwrap();
    let listener = String::from_utf8(payload[104..].to_vec())
        .map_err(|e| MessageError::Malformed(e.to_string()))?;
    Ok(AuthenticationPayload {
        timestamp,
        peer_id,
        signature,
        listener,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::References;

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            node_id: Hash::new(b"node"),
            round_number: 3,
            references: References::new(Hash::new(b"s"), Hash::new(b"e")),
            transaction: Hash::new(b"tx"),
            timestamp: 77,
            signature: None,
        }
    }

    #[test]
    fn announcement_roundtrip() {
        let snapshot = sample_snapshot();
        let commitment = Key::random().public();
        let data = build_snapshot_announcement_message(&snapshot, commitment);
        assert_eq!(data[0], PEER_MESSAGE_TYPE_SNAPSHOT_ANNOUNCEMENT);
        match parse_network_message(&data).unwrap() {
            PeerMessage::SnapshotAnnouncement {
                commitment: c,
                snapshot: s,
            } => {
                assert_eq!(c, commitment);
                assert_eq!(*s, snapshot);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn commitment_layout_is_65_bytes() {
        let hash = Hash::new(b"snap");
        let commitment = Key::random().public();
        let data = build_snapshot_commitment_message(hash, commitment, true);
        assert_eq!(data.len(), 1 + 65);
        match parse_network_message(&data).unwrap() {
            PeerMessage::SnapshotCommitment {
                snapshot_hash,
                commitment: c,
                want_tx,
            } => {
                assert_eq!(snapshot_hash, hash);
                assert_eq!(c, commitment);
                assert!(want_tx);
            }
            other => panic!("wrong message: {other:?}"),
        }
        // A truncated commitment is rejected.
        assert!(parse_network_message(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn challenge_roundtrip_with_and_without_tx() {
        let hash = Hash::new(b"snap");
        let cosi = CosiSignature {
            signature: Signature::from_slice(&[7u8; 64]).unwrap(),
            mask: 0b1011,
        };
        let bare = build_transaction_challenge_message(hash, &cosi, None);
        assert_eq!(bare.len(), 1 + 104);
        match parse_network_message(&bare).unwrap() {
            PeerMessage::TransactionChallenge {
                snapshot_hash,
                cosi: c,
                transaction,
            } => {
                assert_eq!(snapshot_hash, hash);
                assert_eq!(c.mask, 0b1011);
                assert!(transaction.is_none());
            }
            other => panic!("wrong message: {other:?}"),
        }

        let tx = VersionedTransaction::new(Hash::new(b"asset"));
        let full = build_transaction_challenge_message(hash, &cosi, Some(&tx));
        match parse_network_message(&full).unwrap() {
            PeerMessage::TransactionChallenge { transaction, .. } => {
                assert_eq!(*transaction.unwrap(), tx);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn response_layout_is_64_bytes() {
        let hash = Hash::new(b"snap");
        let data = build_snapshot_response_message(hash, [9u8; 32]);
        assert_eq!(data.len(), 1 + 64);
        match parse_network_message(&data).unwrap() {
            PeerMessage::SnapshotResponse {
                snapshot_hash,
                response,
            } => {
                assert_eq!(snapshot_hash, hash);
                assert_eq!(response, [9u8; 32]);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn finalization_and_graph_roundtrip() {
        let mut snapshot = sample_snapshot();
        snapshot.signature = Some(CosiSignature {
            signature: Signature::default(),
            mask: 0b111,
        });
        let data = build_snapshot_finalization_message(&snapshot);
        match parse_network_message(&data).unwrap() {
            PeerMessage::SnapshotFinalization(s) => assert_eq!(*s, snapshot),
            other => panic!("wrong message: {other:?}"),
        }

        let points = vec![SyncPoint {
            node_id: Hash::new(b"n"),
            number: 4,
            hash: Hash::new(b"h"),
        }];
        let data = build_graph_message(&points);
        match parse_network_message(&data).unwrap() {
            PeerMessage::Graph(p) => assert_eq!(p, points),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn simple_hash_messages() {
        let hash = Hash::new(b"x");
        match parse_network_message(&build_snapshot_confirm_message(hash)).unwrap() {
            PeerMessage::SnapshotConfirm(h) => assert_eq!(h, hash),
            other => panic!("wrong message: {other:?}"),
        }
        match parse_network_message(&build_transaction_request_message(hash)).unwrap() {
            PeerMessage::TransactionRequest(h) => assert_eq!(h, hash),
            other => panic!("wrong message: {other:?}"),
        }
        assert!(matches!(
            parse_network_message(&build_ping_message()).unwrap(),
            PeerMessage::Ping
        ));
    }

    #[test]
    fn unknown_and_empty_rejected() {
        assert!(matches!(
            parse_network_message(&[]),
            Err(MessageError::Empty)
        ));
        assert!(matches!(
            parse_network_message(&[99]),
            Err(MessageError::UnknownType(99))
        ));
    }

    #[test]
    fn authentication_payload_roundtrip() {
        let signer = Key::random();
        let my_id = Hash::new(b"me");
        let payload = build_authentication_payload(&signer, my_id, "127.0.0.1:7239", 1_700_000_000);
        let parsed = parse_authentication_payload(&payload).unwrap();
        assert_eq!(parsed.timestamp, 1_700_000_000);
        assert_eq!(parsed.peer_id, my_id);
        assert_eq!(parsed.listener, "127.0.0.1:7239");
        // The signature covers the first 40 bytes.
        assert!(signer.public().verify(&payload[..40], &parsed.signature));
    }
}
