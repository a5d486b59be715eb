//! Convene orchestration.
//!
//! Ties the membership, lock, consensus, and proxy layers into one
//! self-organizing node: a set of identically configured daemons
//! discovers each other, elects exactly one node to found the cluster,
//! replicates a single cluster configuration, and converges every node
//! onto its role.
//!
//! - **`state`** — the replicated [`ClusterState`] and the pure
//!   selection/credential logic
//! - **`tool`** — the [`BootstrapTool`] seam to external tooling
//! - **`discovery`** — peer discovery providers and the poll loop
//! - **`orchestrator`** — the [`Cluster`] node and its protocol loops

pub mod discovery;
pub mod orchestrator;
pub mod state;
pub mod tool;

pub use discovery::{Discovery, EnvPeers, StaticPeers};
pub use orchestrator::{Cluster, ClusterConfig, API_SERVER_PORT};
pub use state::{resolve_role, ClusterState, Role};
pub use tool::{BootstrapTool, JoinConfig};
