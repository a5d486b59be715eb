//! The replicated cluster configuration and the pure logic that
//! produces it.
//!
//! `ClusterState` is the one value the consensus group agrees on. The
//! elected leader derives the next value from the latest applied
//! snapshot plus the current gossip view; every node's convergence
//! loop turns a committed value into a local role action.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Lowercase alphanumerics, the charset of a kubeadm bootstrap token.
const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// The single replicated value.
///
/// Once committed, `masters` is stable until a later epoch proposes a
/// new value. The first master performs cluster genesis, the remainder
/// join the control plane, everyone else joins as a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterState {
    pub bootstrap_token: String,
    pub certificate_key: String,
    pub masters: Vec<String>,
}

/// The local role a node resolves from a committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Genesis,
    ControlPlane,
    Worker,
}

/// Resolve this node's role against the committed master list.
pub fn resolve_role(name: &str, masters: &[String]) -> Role {
    match masters.iter().position(|m| m == name) {
        Some(0) => Role::Genesis,
        Some(_) => Role::ControlPlane,
        None => Role::Worker,
    }
}

/// Generate a bootstrap token: `AAAAAA.BBBBBBBBBBBBBBBB`, 6 + 16
/// lowercase alphanumerics.
pub fn generate_bootstrap_token<R: Rng>(rng: &mut R) -> String {
    format!("{}.{}", random_chars(rng, 6), random_chars(rng, 16))
}

/// Generate a certificate key: hex-encoded sha256 of 255 random bytes.
pub fn generate_certificate_key<R: Rng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 255];
    rng.fill(&mut bytes[..]);
    hex::encode(Sha256::digest(bytes))
}

fn random_chars<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

/// Select the master set for the next proposal.
///
/// Previously chosen names that left the gossip view are dropped, then
/// the set is refilled by uniform sampling from the remaining members,
/// without duplicates, until it reaches `target` (or every member is a
/// master — the view can be smaller than the target while nodes are
/// still arriving).
pub fn pick_masters<R: Rng>(
    current: &[String],
    members: &[String],
    target: usize,
    rng: &mut R,
) -> Vec<String> {
    let mut masters: Vec<String> = current
        .iter()
        .filter(|m| members.contains(m))
        .cloned()
        .collect();

    let mut candidates: Vec<&String> = members
        .iter()
        .filter(|m| !masters.contains(m))
        .collect();

    while masters.len() < target && !candidates.is_empty() {
        let idx = rng.gen_range(0..candidates.len());
        masters.push(candidates.swap_remove(idx).clone());
    }

    masters
}

/// Derive the next `ClusterState` from the latest applied snapshot.
///
/// The token and certificate key are generated only when unset, so a
/// leadership flap never rotates credentials that nodes may already
/// have joined with.
pub fn next_cluster_state<R: Rng>(
    base: &ClusterState,
    members: &[String],
    target: usize,
    rng: &mut R,
) -> ClusterState {
    ClusterState {
        bootstrap_token: if base.bootstrap_token.is_empty() {
            generate_bootstrap_token(rng)
        } else {
            base.bootstrap_token.clone()
        },
        certificate_key: if base.certificate_key.is_empty() {
            generate_certificate_key(rng)
        } else {
            base.certificate_key.clone()
        },
        masters: pick_masters(&base.masters, members, target, rng),
    }
}
