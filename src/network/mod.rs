//! Peer networking: the typed wire protocol and authenticated sessions.

pub mod peer;
pub mod protocol;

pub use peer::{OutCommand, OutboundHandle, PeerManager};
pub use protocol::PeerMessage;
