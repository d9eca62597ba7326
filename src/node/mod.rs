//! The node: storage, membership, validation, the consensus action loop,
//! and the RPC surface.

pub mod core;
pub mod membership;
pub mod rpc;
pub mod storage;
pub mod validation;

pub use core::{Kernel, Node, NodeError, NodeShared};
pub use membership::Membership;
pub use storage::{ConsensusNodeRecord, NodeState, SledStore, StoreError};
