//! Consensus engine — the narrow API the orchestrator drives.
//!
//! Owns the raft instance, its transport server, and the two channels
//! the orchestrator consumes: leadership notifications (one `bool` per
//! transition) and committed entries (every committed payload, in
//! commit order).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use openraft::{BasicNode, ChangeMembers, ServerState};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::log_store::LogStore;
use crate::server::RaftServer;
use crate::state_machine::StateMachine;
use crate::typ::{node_id, ConveneRaft, Request, TypeConfig};

/// How long `apply` waits for majority commit.
const APPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `bootstrap` waits for the self-elected node to confirm
/// leadership. A node that just formed a single-voter group and cannot
/// lead it is misconfigured.
const BOOTSTRAP_LEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the consensus engine. Everything except startup binding
/// is a protocol-invariant violation that callers treat as fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("failed to bind raft transport on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("failed to create raft instance: {0}")]
    Init(String),

    #[error("could not confirm leadership while bootstrapping")]
    BootstrapLeadership,

    #[error("voter membership change failed: {0}")]
    Membership(String),

    #[error("replication timed out after {APPLY_TIMEOUT:?}")]
    ReplicationTimeout,

    #[error("replication failed: {0}")]
    Replication(String),
}

/// Receiving ends of the engine's notification channels.
pub struct ConsensusChannels {
    /// One `bool` per leadership transition: `true` on becoming
    /// leader, `false` on losing it. Each receive is an epoch marker,
    /// not a level signal.
    pub leadership: mpsc::UnboundedReceiver<bool>,
    /// Payload of every committed entry, strictly in commit order,
    /// once per process lifetime.
    pub committed: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Wrapper over the raft instance exposing the bootstrap protocol's
/// narrow surface.
pub struct ConsensusEngine {
    id: u64,
    bind_addr: String,
    raft: Arc<ConveneRaft>,
}

impl ConsensusEngine {
    /// Bind the raft transport on `addr:port` and create the raft
    /// instance. The node is not part of any group yet
    /// (`bootstrapped()` is false).
    pub async fn start(
        name: &str,
        addr: &str,
        port: u16,
    ) -> Result<(Self, ConsensusChannels), ConsensusError> {
        let id = node_id(name);
        let bind_addr = format!("{addr}:{port}");

        let listener =
            TcpListener::bind(&bind_addr)
                .await
                .map_err(|source| ConsensusError::Bind {
                    addr: bind_addr.clone(),
                    source,
                })?;

        let log_store = LogStore::new();
        let (state_machine, committed) = StateMachine::new();

        let config = openraft::Config {
            heartbeat_interval: 500,
            election_timeout_min: 1500,
            election_timeout_max: 3000,
            ..Default::default()
        };

        let raft = ConveneRaft::new(
            id,
            Arc::new(config),
            crate::network::NetworkFactory,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ConsensusError::Init(e.to_string()))?;
        let raft = Arc::new(raft);

        info!(name, raft_id = id, addr = %bind_addr, "consensus engine started");

        tokio::spawn(RaftServer::new(Arc::clone(&raft)).run(listener));

        let leadership = spawn_leadership_watcher(&raft);

        Ok((
            Self {
                id,
                bind_addr,
                raft,
            },
            ConsensusChannels {
                leadership,
                committed,
            },
        ))
    }

    /// True once the local log has at least one entry — the node is
    /// part of a group (its own or one it was added to).
    pub fn bootstrapped(&self) -> bool {
        self.raft.metrics().borrow().last_log_index.is_some()
    }

    /// Form a brand-new single-voter group containing only this node
    /// and block until it confirms leadership. No-op when already
    /// bootstrapped.
    pub async fn bootstrap(&self) -> Result<(), ConsensusError> {
        if self.bootstrapped() {
            return Ok(());
        }

        let mut members = BTreeMap::new();
        members.insert(self.id, BasicNode::new(&self.bind_addr));

        self.raft
            .initialize(members)
            .await
            .map_err(|e| ConsensusError::Init(e.to_string()))?;

        self.raft
            .wait(Some(BOOTSTRAP_LEADER_TIMEOUT))
            .state(ServerState::Leader, "bootstrap leadership")
            .await
            .map_err(|_| ConsensusError::BootstrapLeadership)?;

        info!(raft_id = self.id, "bootstrapped single-node consensus group");
        Ok(())
    }

    /// Idempotently add a remote node as a voter at the given
    /// transport endpoint. A name already in the voter set returns
    /// without a membership change.
    pub async fn add_voter(
        &self,
        name: &str,
        addr: &str,
        port: u16,
    ) -> Result<(), ConsensusError> {
        let id = node_id(name);
        if id == self.id || self.voters().contains(&id) {
            return Ok(());
        }

        let endpoint = format!("{addr}:{port}");
        info!(name, raft_id = id, %endpoint, "adding consensus voter");

        self.raft
            .add_learner(id, BasicNode::new(&endpoint), true)
            .await
            .map_err(|e| ConsensusError::Membership(e.to_string()))?;

        let mut ids = BTreeSet::new();
        ids.insert(id);
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(ids), false)
            .await
            .map_err(|e| ConsensusError::Membership(e.to_string()))?;

        Ok(())
    }

    /// Current voter IDs.
    pub fn voters(&self) -> Vec<u64> {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.membership_config.membership().voter_ids().collect()
    }

    /// True iff this node currently believes it is the leader. May be
    /// stale by the time the caller acts on it; the next leadership
    /// notification corrects it.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().state == ServerState::Leader
    }

    /// Propose a value for replication; blocks until it is committed
    /// to a majority or the timeout expires.
    pub async fn apply(&self, data: Vec<u8>) -> Result<(), ConsensusError> {
        let write = self.raft.client_write(Request { data });
        match tokio::time::timeout(APPLY_TIMEOUT, write).await {
            Err(_) => Err(ConsensusError::ReplicationTimeout),
            Ok(Err(e)) => Err(ConsensusError::Replication(e.to_string())),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// Turn the raft metrics stream into discrete leadership transitions.
fn spawn_leadership_watcher(raft: &Arc<ConveneRaft>) -> mpsc::UnboundedReceiver<bool> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut metrics = raft.metrics();

    tokio::spawn(async move {
        let mut was_leader = false;
        loop {
            let is_leader = metrics.borrow().state == ServerState::Leader;
            if is_leader != was_leader {
                was_leader = is_leader;
                if tx.send(is_leader).is_err() {
                    return;
                }
            }
            if metrics.changed().await.is_err() {
                warn!("raft metrics stream closed");
                return;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_tcp_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn started_engine(name: &str) -> (ConsensusEngine, ConsensusChannels) {
        ConsensusEngine::start(name, "127.0.0.1", free_tcp_port())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_confirms_leadership() {
        let (engine, mut channels) = started_engine("solo").await;

        assert!(!engine.bootstrapped());
        engine.bootstrap().await.unwrap();

        assert!(engine.bootstrapped());
        assert!(engine.is_leader());
        assert_eq!(channels.leadership.recv().await, Some(true));
    }

    #[tokio::test]
    async fn bootstrap_twice_is_noop() {
        let (engine, _channels) = started_engine("solo-2").await;
        engine.bootstrap().await.unwrap();
        engine.bootstrap().await.unwrap();
        assert_eq!(engine.voters(), vec![node_id("solo-2")]);
    }

    #[tokio::test]
    async fn apply_delivers_committed_payload() {
        let (engine, mut channels) = started_engine("writer").await;
        engine.bootstrap().await.unwrap();

        engine.apply(b"config-v1".to_vec()).await.unwrap();

        let payload = channels.committed.recv().await.unwrap();
        assert_eq!(payload, b"config-v1");
    }

    #[tokio::test]
    async fn add_voter_is_idempotent_across_two_nodes() {
        let leader_port = free_tcp_port();
        let follower_port = free_tcp_port();

        let (leader, _leader_ch) = ConsensusEngine::start("leader", "127.0.0.1", leader_port)
            .await
            .unwrap();
        let (follower, mut follower_ch) =
            ConsensusEngine::start("follower", "127.0.0.1", follower_port)
                .await
                .unwrap();

        leader.bootstrap().await.unwrap();
        leader
            .add_voter("follower", "127.0.0.1", follower_port)
            .await
            .unwrap();

        let mut voters = leader.voters();
        voters.sort_unstable();
        assert_eq!(voters.len(), 2);
        assert!(voters.contains(&node_id("follower")));

        // Second call for the same name: no observable change.
        leader
            .add_voter("follower", "127.0.0.1", follower_port)
            .await
            .unwrap();
        assert_eq!(leader.voters().len(), 2);

        // The follower is bootstrapped by replication and sees
        // committed payloads.
        leader.apply(b"shared".to_vec()).await.unwrap();
        let payload = tokio::time::timeout(
            Duration::from_secs(10),
            follower_ch.committed.recv(),
        )
        .await
        .expect("follower did not receive committed entry")
        .unwrap();
        assert_eq!(payload, b"shared");
        assert!(follower.bootstrapped());
    }
}
