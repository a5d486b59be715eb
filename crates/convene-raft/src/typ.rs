//! Raft type configuration.
//!
//! Wires together the openraft associated types: node IDs, the
//! request/response payloads, and the async runtime. The replicated
//! payload is a single opaque byte value; the orchestrator owns its
//! encoding.

use std::io::Cursor;

use openraft::TokioRuntime;
use sha2::{Digest, Sha256};

/// Client write request submitted to the consensus group. The bytes
/// carry the serialized cluster configuration; this layer never
/// inspects them.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Request {
    pub data: Vec<u8>,
}

/// Response returned after a write is applied to the state machine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Response {
    pub success: bool,
}

openraft::declare_raft_types!(
    /// Convene Raft type configuration.
    pub TypeConfig:
        D = Request,
        R = Response,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

/// Convenience alias for the Raft instance.
pub type ConveneRaft = openraft::Raft<TypeConfig>;

/// Stable raft ID for a member name.
///
/// Every node must map the same name to the same ID without
/// coordination, so the ID is the first 8 bytes of `sha256(name)`.
pub fn node_id(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 digest is 32 bytes"))
}
