//! Raft RPC envelope carried over the framed transport.
//!
//! Each variant wraps the JSON-serialized openraft request; the reply
//! carries either the serialized openraft response or the remote raft
//! error, mirrored on both ends of the connection.

/// A raft RPC request envelope.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum RaftRpc {
    AppendEntries(Vec<u8>),
    Vote(Vec<u8>),
    InstallSnapshot(Vec<u8>),
}

/// A raft RPC reply. `error` is empty on success and carries the
/// JSON-serialized remote `RaftError` otherwise.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct RaftReply {
    pub data: Vec<u8>,
    pub error: String,
}

impl RaftReply {
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            data,
            error: String::new(),
        }
    }

    pub fn err(error: String) -> Self {
        Self {
            data: Vec::new(),
            error,
        }
    }
}
