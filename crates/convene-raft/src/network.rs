//! Raft network layer over the framed TCP transport.
//!
//! Implements `RaftNetworkFactory` and `RaftNetwork` so that openraft
//! can replicate between nodes. Each RPC serializes the openraft
//! request to JSON, wraps it in a [`RaftRpc`] frame, and deserializes
//! the reply. The connection to a peer is cached and dropped on any
//! transport error; the next RPC re-dials.

use openraft::error::{InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use convene_wire::{read_frame, write_frame};

use crate::rpc::{RaftReply, RaftRpc};
use crate::typ::TypeConfig;

/// Factory that creates per-peer framed TCP connections.
pub struct NetworkFactory;

/// A single peer connection.
pub struct NetworkConnection {
    target: u64,
    addr: String,
    stream: Option<TcpStream>,
}

impl NetworkConnection {
    fn mk_unreachable<E: std::error::Error>(
        target: u64,
        addr: &str,
        msg: &str,
    ) -> RPCError<u64, BasicNode, E> {
        RPCError::Unreachable(Unreachable::new(&std::io::Error::other(format!(
            "raft rpc to node {target} ({addr}): {msg}",
        ))))
    }

    async fn roundtrip(&mut self, rpc: &RaftRpc) -> Result<RaftReply, String> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
                warn!(target_node = self.target, addr = %self.addr, error = %e, "failed to connect");
                format!("connect to {}: {e}", self.addr)
            })?;
            debug!(target_node = self.target, addr = %self.addr, "connected to raft peer");
            self.stream = Some(stream);
        }

        let stream = self.stream.as_mut().expect("stream just set");
        let result: Result<Option<RaftReply>, convene_wire::WireError> = async {
            write_frame(stream, rpc).await?;
            read_frame(stream).await
        }
        .await;

        match result {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => {
                self.stream = None;
                Err("peer closed connection".to_string())
            }
            Err(e) => {
                self.stream = None;
                Err(format!("transport: {e}"))
            }
        }
    }

    /// Send one envelope and decode the reply, mapping an error payload
    /// to the remote raft error type.
    async fn send<Resp, E>(
        &mut self,
        rpc: RaftRpc,
    ) -> Result<Resp, RPCError<u64, BasicNode, E>>
    where
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned + RemoteFallback,
    {
        let target = self.target;
        let addr = self.addr.clone();

        let reply = self
            .roundtrip(&rpc)
            .await
            .map_err(|e| Self::mk_unreachable::<E>(target, &addr, &e))?;

        if !reply.error.is_empty() {
            let remote: E =
                serde_json::from_str(&reply.error).unwrap_or_else(|_| E::fallback());
            return Err(RPCError::RemoteError(RemoteError::new(target, remote)));
        }

        serde_json::from_slice(&reply.data).map_err(|e| {
            Self::mk_unreachable(target, &addr, &format!("deserialize response: {e}"))
        })
    }
}

/// Fallback remote error when the peer's error payload cannot be
/// decoded.
pub trait RemoteFallback {
    fn fallback() -> Self;
}

impl RemoteFallback for RaftError<u64> {
    fn fallback() -> Self {
        RaftError::Fatal(openraft::error::Fatal::Panicked)
    }
}

impl RemoteFallback for RaftError<u64, InstallSnapshotError> {
    fn fallback() -> Self {
        RaftError::Fatal(openraft::error::Fatal::Panicked)
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        debug!(target, addr = %node.addr, "creating raft network connection");
        NetworkConnection {
            target,
            addr: node.addr.clone(),
            stream: None,
        }
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let data = serde_json::to_vec(&rpc).map_err(|e| {
            Self::mk_unreachable::<RaftError<u64>>(self.target, &self.addr, &format!("serialize: {e}"))
        })?;
        self.send(RaftRpc::AppendEntries(data)).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        let data = serde_json::to_vec(&rpc).map_err(|e| {
            Self::mk_unreachable::<RaftError<u64, InstallSnapshotError>>(
                self.target,
                &self.addr,
                &format!("serialize: {e}"),
            )
        })?;
        self.send(RaftRpc::InstallSnapshot(data)).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let data = serde_json::to_vec(&rpc).map_err(|e| {
            Self::mk_unreachable::<RaftError<u64>>(self.target, &self.addr, &format!("serialize: {e}"))
        })?;
        self.send(RaftRpc::Vote(data)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_creates_lazy_connection() {
        let mut factory = NetworkFactory;
        let node = BasicNode::new("127.0.0.1:9100");
        let conn = factory.new_client(1, &node).await;
        assert_eq!(conn.target, 1);
        assert_eq!(conn.addr, "127.0.0.1:9100");
        assert!(conn.stream.is_none()); // Lazy connect.
    }

    #[test]
    fn vote_request_roundtrips() {
        let vote = openraft::Vote::<u64>::new(1, 2);
        let req = VoteRequest::<u64> {
            vote,
            last_log_id: None,
        };
        let data = serde_json::to_vec(&req).unwrap();
        let back: VoteRequest<u64> = serde_json::from_slice(&data).unwrap();
        assert_eq!(back.vote, vote);
    }
}
