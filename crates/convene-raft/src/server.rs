//! Raft RPC server — handles incoming raft frames.
//!
//! Wraps a `ConveneRaft` instance and serves [`RaftRpc`] envelopes:
//! each frame is deserialized, dispatched to the corresponding
//! openraft method, and answered with exactly one [`RaftReply`].

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use convene_wire::{read_frame, write_frame};

use crate::rpc::{RaftReply, RaftRpc};
use crate::typ::{ConveneRaft, TypeConfig};

/// Framed-TCP implementation of the raft transport.
#[derive(Clone)]
pub struct RaftServer {
    raft: Arc<ConveneRaft>,
}

impl RaftServer {
    pub fn new(raft: Arc<ConveneRaft>) -> Self {
        Self { raft }
    }

    /// Serve raft RPCs on the given listener. Returns only if the
    /// listener fails.
    pub async fn run(self, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "raft transport listening");
        }

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    debug!(%peer, error = %e, "raft connection closed");
                }
            });
        }
    }

    async fn serve_connection(
        &self,
        mut stream: TcpStream,
    ) -> Result<(), convene_wire::WireError> {
        while let Some(rpc) = read_frame::<_, RaftRpc>(&mut stream).await? {
            let reply = self.dispatch(rpc).await;
            write_frame(&mut stream, &reply).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, rpc: RaftRpc) -> RaftReply {
        match rpc {
            RaftRpc::AppendEntries(data) => {
                let req: openraft::raft::AppendEntriesRequest<TypeConfig> =
                    match serde_json::from_slice(&data) {
                        Ok(req) => req,
                        Err(e) => return RaftReply::err(format!("deserialize: {e}")),
                    };
                debug!(
                    term = req.vote.leader_id().term,
                    "handling append_entries RPC"
                );
                match self.raft.append_entries(req).await {
                    Ok(resp) => encode_reply(&resp),
                    Err(e) => encode_error(&e),
                }
            }
            RaftRpc::Vote(data) => {
                let req: openraft::raft::VoteRequest<u64> = match serde_json::from_slice(&data)
                {
                    Ok(req) => req,
                    Err(e) => return RaftReply::err(format!("deserialize: {e}")),
                };
                debug!(term = req.vote.leader_id().term, "handling vote RPC");
                match self.raft.vote(req).await {
                    Ok(resp) => encode_reply(&resp),
                    Err(e) => encode_error(&e),
                }
            }
            RaftRpc::InstallSnapshot(data) => {
                let req: openraft::raft::InstallSnapshotRequest<TypeConfig> =
                    match serde_json::from_slice(&data) {
                        Ok(req) => req,
                        Err(e) => return RaftReply::err(format!("deserialize: {e}")),
                    };
                debug!("handling install_snapshot RPC");
                match self.raft.install_snapshot(req).await {
                    Ok(resp) => encode_reply(&resp),
                    Err(e) => encode_error(&e),
                }
            }
        }
    }
}

fn encode_reply<T: serde::Serialize>(resp: &T) -> RaftReply {
    match serde_json::to_vec(resp) {
        Ok(data) => RaftReply::ok(data),
        Err(e) => RaftReply::err(format!("serialize: {e}")),
    }
}

fn encode_error<E: serde::Serialize + std::fmt::Display>(error: &E) -> RaftReply {
    // JSON so the peer can reconstruct the typed raft error; the
    // display form is the fallback for encoding failures.
    RaftReply::err(
        serde_json::to_string(error).unwrap_or_else(|_| error.to_string()),
    )
}
