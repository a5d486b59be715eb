//! The orchestrator — wires membership, lock, consensus, and proxy
//! into the bootstrap protocol.
//!
//! Three loops run for the process lifetime:
//!
//! - **join events** — on every membership change, race for the
//!   bootstrap lock until the consensus group exists; once this node
//!   leads, pull every known member into the voter set.
//! - **leadership** — on becoming leader, derive the next cluster
//!   configuration from the latest applied snapshot and the gossip
//!   view, and replicate it.
//! - **convergence** — on every committed configuration, repoint the
//!   API server proxy and run this node's role action.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use convene_lock::{LockClient, LockError, LockServer, QuorumLock};
use convene_membership::{Gossip, JoinEvent, Member};
use convene_proxy::ApiServerProxy;
use convene_raft::{ConsensusChannels, ConsensusEngine};

use crate::discovery::{run_discovery, Discovery};
use crate::state::{next_cluster_state, resolve_role, ClusterState, Role};
use crate::tool::{BootstrapTool, JoinConfig};

/// The one lock key ever acquired.
const BOOTSTRAP_LOCK_KEY: &str = "leader";

/// Port every master's API server listens on.
pub const API_SERVER_PORT: u16 = 6443;

/// Static node configuration, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique, stable node name.
    pub name: String,
    /// Address this node binds and advertises.
    pub address: String,
    /// Membership base port; consensus is `port + 1`, the lock
    /// participant `port + 2`.
    pub port: u16,
    /// Members required before the bootstrap race may start.
    pub initial_nodes: usize,
    /// Target control-plane size.
    pub master_nodes: usize,
    /// Front-end address of the API server proxy.
    pub frontend_addr: String,
}

/// One convene node. `run` consumes it and returns only on a fatal
/// error.
pub struct Cluster {
    config: ClusterConfig,
    tool: Arc<dyn BootstrapTool>,
    providers: Vec<Box<dyn Discovery>>,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        tool: Arc<dyn BootstrapTool>,
        providers: Vec<Box<dyn Discovery>>,
    ) -> Self {
        Self {
            config,
            tool,
            providers,
        }
    }

    /// Start every component and drive the three protocol loops until
    /// one of them fails. The RNG feeds master selection and
    /// credential generation; seed it for reproducible tests.
    pub async fn run<R: Rng + Send>(self, rng: R) -> anyhow::Result<()> {
        let Self {
            config,
            tool,
            providers,
        } = self;

        let local = Member::new(&config.name, &config.address, config.port);
        info!(
            name = %local.name,
            addr = %local.gossip_addr(),
            initial_nodes = config.initial_nodes,
            master_nodes = config.master_nodes,
            "starting convene node"
        );

        let (gossip, join_events) = Gossip::new(local.clone());

        let (consensus, channels) =
            ConsensusEngine::start(&config.name, &config.address, local.consensus_port()).await?;
        let consensus = Arc::new(consensus);
        let ConsensusChannels {
            leadership,
            committed,
        } = channels;

        let lock_listener = TcpListener::bind(local.lock_addr())
            .await
            .with_context(|| format!("binding lock participant on {}", local.lock_addr()))?;
        let lock_server = LockServer::new();
        let lock = QuorumLock::new(&config.name, config.initial_nodes);

        let proxy = ApiServerProxy::new(config.frontend_addr.clone());

        gossip.start().await?;

        // Latest applied configuration, shared between the leader loop
        // (proposal base) and the convergence loop (writer).
        let latest: Arc<Mutex<Option<ClusterState>>> = Arc::new(Mutex::new(None));

        tokio::try_join!(
            async {
                lock_server
                    .run(lock_listener)
                    .await
                    .context("lock participant failed")
            },
            async { proxy.run().await.context("api server proxy failed") },
            run_discovery(providers, gossip.clone(), config.port),
            join_event_loop(
                join_events,
                gossip.clone(),
                lock,
                Arc::clone(&consensus),
                local.name.clone(),
            ),
            leader_loop(
                leadership,
                gossip.clone(),
                Arc::clone(&consensus),
                Arc::clone(&latest),
                config.master_nodes,
                rng,
            ),
            convergence_loop(
                committed,
                gossip.clone(),
                proxy.clone(),
                tool,
                latest,
                local.name.clone(),
                config.frontend_addr.clone(),
            ),
        )?;

        Ok(())
    }
}

/// React to membership changes: race for the bootstrap lock until a
/// consensus group exists, then (as leader) absorb every member into
/// the voter set. Replayed events are harmless; both reactions are
/// idempotent.
async fn join_event_loop(
    mut events: mpsc::UnboundedReceiver<JoinEvent>,
    gossip: Gossip,
    mut lock: QuorumLock,
    consensus: Arc<ConsensusEngine>,
    self_name: String,
) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        debug!(new = event.members.len(), "membership changed");

        if !consensus.bootstrapped() {
            for member in gossip.members() {
                lock.register_participant(LockClient::new(member.lock_addr()));
            }

            match lock.try_acquire(BOOTSTRAP_LOCK_KEY).await {
                Ok(true) => {
                    info!("won the bootstrap race");
                    consensus
                        .bootstrap()
                        .await
                        .context("bootstrapping consensus group")?;
                }
                Ok(false) => debug!("lost the bootstrap race"),
                Err(LockError::InsufficientQuorum { have, need }) => {
                    debug!(have, need, "bootstrap quorum not assembled yet");
                }
                Err(e) => return Err(e).context("bootstrap lock acquisition"),
            }
        }

        if consensus.bootstrapped() && consensus.is_leader() {
            for member in gossip.members() {
                if member.name == self_name {
                    continue;
                }
                consensus
                    .add_voter(&member.name, &member.addr, member.consensus_port())
                    .await
                    .with_context(|| format!("adding voter {}", member.name))?;
            }
        }
    }

    Err(anyhow!("membership event channel closed"))
}

/// On each rise to leadership, propose the next cluster configuration.
/// The proposal is derived from the latest applied snapshot, so a
/// leadership flap re-proposes the same credentials and retained
/// masters rather than reshuffling the cluster.
async fn leader_loop<R: Rng + Send>(
    mut leadership: mpsc::UnboundedReceiver<bool>,
    gossip: Gossip,
    consensus: Arc<ConsensusEngine>,
    latest: Arc<Mutex<Option<ClusterState>>>,
    master_nodes: usize,
    mut rng: R,
) -> anyhow::Result<()> {
    while let Some(is_leader) = leadership.recv().await {
        if !is_leader {
            debug!("leadership lost");
            continue;
        }
        info!("elected consensus leader");

        let base = latest
            .lock()
            .expect("cluster state lock")
            .clone()
            .unwrap_or_default();
        let members: Vec<String> = gossip.members().into_iter().map(|m| m.name).collect();

        let state = next_cluster_state(&base, &members, master_nodes, &mut rng);
        info!(masters = ?state.masters, "proposing cluster configuration");

        let payload = serde_json::to_vec(&state).context("encoding cluster configuration")?;
        consensus
            .apply(payload)
            .await
            .context("replicating cluster configuration")?;
    }

    Err(anyhow!("leadership channel closed"))
}

/// Apply every committed configuration locally: repoint the proxy at
/// the masters' API servers, then run this node's role action. The
/// role action is skipped when the configuration is unchanged, so
/// re-proposals after a leadership flap do not re-run the bootstrap
/// tool.
async fn convergence_loop(
    mut committed: mpsc::UnboundedReceiver<Vec<u8>>,
    gossip: Gossip,
    proxy: ApiServerProxy,
    tool: Arc<dyn BootstrapTool>,
    latest: Arc<Mutex<Option<ClusterState>>>,
    self_name: String,
    endpoint: String,
) -> anyhow::Result<()> {
    let mut last_acted: Option<ClusterState> = None;

    while let Some(payload) = committed.recv().await {
        let state: ClusterState =
            serde_json::from_slice(&payload).context("malformed committed cluster state")?;
        info!(masters = ?state.masters, "committed cluster configuration");

        *latest.lock().expect("cluster state lock") = Some(state.clone());

        let upstreams = master_upstreams(&state.masters, |name| gossip.member_addr(name));
        proxy.set_upstreams(upstreams);

        if last_acted.as_ref() == Some(&state) {
            debug!("configuration unchanged, skipping role action");
            continue;
        }

        let role = resolve_role(&self_name, &state.masters);
        info!(?role, "running role action");

        let config = JoinConfig {
            endpoint: endpoint.clone(),
            token: state.bootstrap_token.clone(),
            certificate_key: state.certificate_key.clone(),
        };
        let tool = Arc::clone(&tool);
        tokio::task::spawn_blocking(move || match role {
            Role::Genesis => tool.genesis(&config),
            Role::ControlPlane => tool.join_control_plane(&config),
            Role::Worker => tool.join_worker(&config),
        })
        .await
        .context("role action task failed")??;

        last_acted = Some(state);
    }

    Err(anyhow!("committed entry channel closed"))
}

/// API server routes for the given masters. A master whose address is
/// not in the membership view yet is skipped; the next committed
/// configuration (or a later proxy reconciliation) picks it up.
fn master_upstreams<F>(masters: &[String], lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut upstreams = Vec::new();
    for master in masters {
        match lookup(master) {
            Some(addr) => upstreams.push(format!("{addr}:{API_SERVER_PORT}")),
            None => warn!(%master, "master not in membership view, skipping route"),
        }
    }
    upstreams
}
