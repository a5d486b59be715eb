//! Convene bootstrap lock.
//!
//! A single-shot, single-key, write-only mutual exclusion service:
//! each node runs a [`LockServer`] participant, and the orchestrator
//! aggregates participants into a [`QuorumLock`] to decide which node
//! may bootstrap the consensus group.
//!
//! - **`rpc`** — the four-operation wire surface
//! - **`server`** — per-key boolean grant participant
//! - **`client`** — per-participant RPC client
//! - **`quorum`** — majority acquisition across participants

pub mod client;
pub mod quorum;
pub mod rpc;
pub mod server;

pub use client::LockClient;
pub use quorum::QuorumLock;
pub use rpc::{LockRequest, LockResponse};
pub use server::LockServer;

/// Errors from the bootstrap lock.
///
/// `InsufficientQuorum` is expected and retryable: the caller simply
/// re-attempts on the next membership event. Everything else is a
/// protocol-surface violation and treated as fatal by callers.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("not enough lock participants: have {have}, need {need}")]
    InsufficientQuorum { have: usize, need: usize },

    #[error("unsupported lock operation: {0}")]
    Unsupported(String),

    #[error("lock rpc failed: {0}")]
    Rpc(#[from] convene_wire::WireError),
}
