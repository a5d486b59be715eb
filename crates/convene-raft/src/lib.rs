// openraft's StorageError is 224 bytes by design — allow it.
#![allow(clippy::result_large_err)]

//! Convene consensus — openraft wrapper for the bootstrap protocol.
//!
//! Provides the replicated-log layer: leader election, committed-entry
//! delivery, and voter membership management, over a framed TCP
//! transport. Storage is in-memory; the group is durable for the
//! process lifetime only.
//!
//! # Architecture
//!
//! - **`typ`** — type configuration (`TypeConfig`, `Request`, `Response`)
//! - **`log_store`** — in-memory raft log storage
//! - **`state_machine`** — applies committed entries, feeds the
//!   committed-entry channel
//! - **`rpc`** — framed RPC envelopes
//! - **`network`** — framed TCP transport for inter-node raft RPCs
//! - **`server`** — inbound raft RPC dispatch
//! - **`engine`** — the narrow API the orchestrator drives

pub mod engine;
pub mod log_store;
pub mod network;
pub mod rpc;
pub mod server;
pub mod state_machine;
pub mod typ;

pub use engine::{ConsensusChannels, ConsensusEngine, ConsensusError};
pub use log_store::LogStore;
pub use network::{NetworkConnection, NetworkFactory};
pub use server::RaftServer;
pub use state_machine::StateMachine;
pub use typ::{node_id, ConveneRaft, Request, Response, TypeConfig};
