//! The seam between cluster convergence and the external bootstrap
//! tooling.
//!
//! The orchestrator decides *what* a node should become; a
//! [`BootstrapTool`] implementation performs the actual host mutation
//! (in production, by driving kubeadm). Methods are synchronous and
//! may block for minutes; the convergence loop runs them on a blocking
//! worker.

/// Everything a node needs to join (or found) the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinConfig {
    /// Stable control-plane endpoint, `ip:port` of the local proxy.
    pub endpoint: String,
    /// kubeadm bootstrap token.
    pub token: String,
    /// Certificate key for control-plane certificate distribution.
    pub certificate_key: String,
}

/// Role actions executed when a committed cluster state arrives.
pub trait BootstrapTool: Send + Sync {
    /// Initialize a brand-new cluster on this host.
    fn genesis(&self, config: &JoinConfig) -> anyhow::Result<()>;

    /// Join an existing cluster as an additional control-plane node.
    fn join_control_plane(&self, config: &JoinConfig) -> anyhow::Result<()>;

    /// Join an existing cluster as a worker node.
    fn join_worker(&self, config: &JoinConfig) -> anyhow::Result<()>;
}
