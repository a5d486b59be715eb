//! Quorum lock — majority mutual exclusion across lock participants.
//!
//! Used exactly once per cluster lifetime to decide which node
//! bootstraps the consensus group. There is no pre-existing leader to
//! arbitrate, so the winner is whoever a strict majority of
//! participants grants first.

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::client::LockClient;
use crate::LockError;

/// Aggregates lock participants and performs majority acquisition.
pub struct QuorumLock {
    owner: String,
    initial_nodes: usize,
    participants: Vec<LockClient>,
}

impl QuorumLock {
    /// `initial_nodes` is the number of participants that must be
    /// registered before any acquisition attempt is allowed; `owner`
    /// identifies this node in participant logs.
    pub fn new(owner: impl Into<String>, initial_nodes: usize) -> Self {
        Self {
            owner: owner.into(),
            initial_nodes,
            participants: Vec::new(),
        }
    }

    /// Idempotently add a participant endpoint. Duplicates by address
    /// are no-ops.
    pub fn register_participant(&mut self, client: LockClient) {
        if self.participants.iter().any(|c| c.addr() == client.addr()) {
            return;
        }
        debug!(addr = client.addr(), "registered lock participant");
        self.participants.push(client);
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Attempt a non-blocking majority acquisition of `key`.
    ///
    /// Fails with [`LockError::InsufficientQuorum`] until at least the
    /// configured initial-node count of participants is registered;
    /// attempting earlier could win a false majority against a partial
    /// view and split the cluster at genesis. Participants that cannot
    /// be reached simply do not grant.
    ///
    /// On a lost race every grant that was collected is released, so
    /// two nodes holding partial minorities cannot wedge each other
    /// forever.
    pub async fn try_acquire(&self, key: &str) -> Result<bool, LockError> {
        if self.participants.len() < self.initial_nodes {
            return Err(LockError::InsufficientQuorum {
                have: self.participants.len(),
                need: self.initial_nodes,
            });
        }

        let mut requests = JoinSet::new();
        for client in &self.participants {
            let client = client.clone();
            let key = key.to_string();
            let owner = self.owner.clone();
            requests.spawn(async move {
                let granted = client.acquire(&key, &owner).await;
                (client, granted)
            });
        }

        let mut granted = Vec::new();
        let mut denied = 0usize;
        while let Some(joined) = requests.join_next().await {
            let Ok((client, outcome)) = joined else {
                denied += 1;
                continue;
            };
            match outcome {
                Ok(true) => granted.push(client),
                Ok(false) => denied += 1,
                Err(e) => {
                    debug!(addr = client.addr(), error = %e, "participant unreachable");
                    denied += 1;
                }
            }
        }

        let majority = self.participants.len() / 2 + 1;
        if granted.len() >= majority {
            info!(
                key,
                grants = granted.len(),
                participants = self.participants.len(),
                "quorum lock acquired"
            );
            return Ok(true);
        }

        debug!(
            key,
            grants = granted.len(),
            denied,
            "quorum lock lost, releasing partial grants"
        );
        for client in granted {
            if let Err(e) = client.release(key, &self.owner).await {
                debug!(addr = client.addr(), error = %e, "release failed");
            }
        }
        Ok(false)
    }
}
