//! Gossip protocol — periodic UDP announcements of the full member
//! table.
//!
//! Every node repeatedly sends its member table to all members it
//! knows plus any pending join targets. Receiving a table merges it
//! into the local view; names seen for the first time are emitted as a
//! [`JoinEvent`] on the event channel. The view is eventually
//! consistent: `members()` snapshots are not ordered with respect to
//! any particular event delivery.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::member::Member;

/// Announce interval for the full member table.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Backoff between join rounds for peers that have not merged yet.
const JOIN_RETRY: Duration = Duration::from_secs(2);

const MAX_DATAGRAM: usize = 64 * 1024;

/// Errors from the gossip layer. Only startup can fail; everything
/// after that is retried.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("failed to bind gossip socket on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("gossip not started")]
    NotStarted,
}

/// One membership join event. A single event may carry several newly
/// seen members; the same member name may reappear in a later event
/// after a flap, so consumers must tolerate duplicates.
#[derive(Debug, Clone)]
pub struct JoinEvent {
    pub members: Vec<Member>,
}

/// Datagram payload: the sender's full member table.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Announce {
    members: Vec<Member>,
}

struct State {
    members: HashMap<String, Member>,
    /// Candidate join targets not yet merged (gossip addresses).
    peers: BTreeSet<String>,
}

/// Gossip membership handle. Cheap to clone; all clones share the same
/// member table and socket.
#[derive(Clone)]
pub struct Gossip {
    local: Member,
    state: Arc<Mutex<State>>,
    events: mpsc::UnboundedSender<JoinEvent>,
    socket: Arc<OnceLock<Arc<UdpSocket>>>,
}

impl Gossip {
    /// Create a gossip handle for the local member. The returned
    /// receiver delivers join events strictly in arrival order.
    pub fn new(local: Member) -> (Self, mpsc::UnboundedReceiver<JoinEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut members = HashMap::new();
        members.insert(local.name.clone(), local.clone());

        let gossip = Self {
            local,
            state: Arc::new(Mutex::new(State {
                members,
                peers: BTreeSet::new(),
            })),
            events: tx,
            socket: Arc::new(OnceLock::new()),
        };
        (gossip, rx)
    }

    /// Bind the gossip socket and spawn the receive and announce
    /// loops. Emits the initial join event for the local member.
    pub async fn start(&self) -> Result<(), MembershipError> {
        let bind_addr = self.local.gossip_addr();
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|source| MembershipError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let socket = Arc::new(socket);
        let _ = self.socket.set(Arc::clone(&socket));

        info!(addr = %bind_addr, name = %self.local.name, "gossip listening");

        // The local node's own arrival is the first event; with a
        // one-node quorum this alone drives bootstrap.
        let _ = self.events.send(JoinEvent {
            members: vec![self.local.clone()],
        });

        let recv = self.clone();
        tokio::spawn(async move { recv.recv_loop(socket).await });

        let announce = self.clone();
        tokio::spawn(async move { announce.announce_loop().await });

        Ok(())
    }

    /// Register a discovered candidate address for future join rounds.
    pub fn add_peer(&self, addr: impl Into<String>) {
        let addr = addr.into();
        let mut state = self.state.lock().expect("gossip state lock");
        if state.peers.insert(addr.clone()) {
            debug!(%addr, "registered join target");
        }
    }

    /// Snapshot of currently known members, local node included.
    pub fn members(&self) -> Vec<Member> {
        let state = self.state.lock().expect("gossip state lock");
        state.members.values().cloned().collect()
    }

    /// Look up a member's address by name.
    pub fn member_addr(&self, name: &str) -> Option<String> {
        let state = self.state.lock().expect("gossip state lock");
        state.members.get(name).map(|m| m.addr.clone())
    }

    /// Merge with the given peers, then retry forever: every round,
    /// announce to each target that has not shown up in the member
    /// table yet. Unreachable peers are never an error; initial peer
    /// lists routinely race with peer startup.
    pub async fn run_join(&self, addresses: Vec<String>) -> Result<(), MembershipError> {
        for addr in addresses {
            self.add_peer(addr);
        }

        loop {
            let targets = self.pending_targets();
            if !targets.is_empty() {
                debug!(count = targets.len(), "announcing to pending join targets");
                self.announce_to(&targets).await?;
            }
            tokio::time::sleep(JOIN_RETRY).await;
        }
    }

    /// Join targets that no known member is advertising.
    fn pending_targets(&self) -> Vec<String> {
        let state = self.state.lock().expect("gossip state lock");
        let member_addrs: BTreeSet<String> =
            state.members.values().map(|m| m.gossip_addr()).collect();
        state
            .peers
            .iter()
            .filter(|p| !member_addrs.contains(*p))
            .cloned()
            .collect()
    }

    async fn announce_loop(self) {
        loop {
            let targets: Vec<String> = {
                let state = self.state.lock().expect("gossip state lock");
                let mut targets: BTreeSet<String> = state
                    .members
                    .values()
                    .filter(|m| m.name != self.local.name)
                    .map(|m| m.gossip_addr())
                    .collect();
                targets.extend(state.peers.iter().cloned());
                targets.into_iter().collect()
            };

            if !targets.is_empty() {
                if let Err(e) = self.announce_to(&targets).await {
                    warn!(error = %e, "announce round failed");
                }
            }

            tokio::time::sleep(ANNOUNCE_INTERVAL).await;
        }
    }

    async fn announce_to(&self, targets: &[String]) -> Result<(), MembershipError> {
        let socket = self
            .socket
            .get()
            .cloned()
            .ok_or(MembershipError::NotStarted)?;

        let announce = Announce {
            members: self.members(),
        };
        let payload = match serde_json::to_vec(&announce) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode announce");
                return Ok(());
            }
        };

        for target in targets {
            if let Err(e) = socket.send_to(&payload, target).await {
                debug!(%target, error = %e, "announce send failed, will retry");
            }
        }
        Ok(())
    }

    async fn recv_loop(self, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "gossip receive failed");
                    continue;
                }
            };

            let announce: Announce = match serde_json::from_slice(&buf[..len]) {
                Ok(a) => a,
                Err(e) => {
                    warn!(%from, error = %e, "dropping malformed announce");
                    continue;
                }
            };

            self.merge(announce.members);
        }
    }

    /// Merge a received member table; emit a join event for names not
    /// previously known.
    fn merge(&self, incoming: Vec<Member>) {
        let mut new_members = Vec::new();
        {
            let mut state = self.state.lock().expect("gossip state lock");
            for member in incoming {
                if !state.members.contains_key(&member.name) {
                    state.members.insert(member.name.clone(), member.clone());
                    new_members.push(member);
                }
            }
        }

        if !new_members.is_empty() {
            for m in &new_members {
                info!(name = %m.name, addr = %m.gossip_addr(), "member joined");
            }
            let _ = self.events.send(JoinEvent {
                members: new_members,
            });
        }
    }
}
