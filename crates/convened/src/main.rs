//! convened — self-organizing Kubernetes control-plane bootstrap
//! daemon.
//!
//! Run the same binary with the same flags on every node; the nodes
//! find each other, elect one to found the cluster, and converge onto
//! control-plane and worker roles on their own.

mod kubeadm;

use std::sync::Arc;

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;

use convene_cluster::{Cluster, ClusterConfig, Discovery, EnvPeers, StaticPeers, API_SERVER_PORT};
use kubeadm::Kubeadm;

#[derive(Debug, Parser)]
#[command(name = "convened", version, about)]
struct Args {
    /// Members required before the cluster may bootstrap.
    #[arg(long, default_value_t = 3)]
    initial_nodes: usize,

    /// Target number of control-plane nodes.
    #[arg(long, default_value_t = 3)]
    master_nodes: usize,

    /// Address this node binds and advertises to peers.
    #[arg(long)]
    address: String,

    /// Membership base port; consensus uses port+1, the bootstrap
    /// lock port+2.
    #[arg(long, default_value_t = 1234)]
    port: u16,

    /// Unique node name. Defaults to the hostname, then node-<port>.
    #[arg(long)]
    name: Option<String>,

    /// Virtual IP the API server front-end listens on.
    #[arg(long, default_value = "127.0.13.37")]
    control_plane_ip: String,

    /// Gossip addresses of known peers, host or host:port.
    #[arg(value_name = "PEER")]
    peers: Vec<String>,
}

impl Args {
    fn node_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match std::env::var("HOSTNAME") {
            Ok(host) if !host.is_empty() => host,
            _ => format!("node-{}", self.port),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let config = ClusterConfig {
        name: args.node_name(),
        address: args.address.clone(),
        port: args.port,
        initial_nodes: args.initial_nodes,
        master_nodes: args.master_nodes,
        frontend_addr: format!("{}:{}", args.control_plane_ip, API_SERVER_PORT),
    };

    let tool = Arc::new(Kubeadm::new());
    let providers: Vec<Box<dyn Discovery>> = vec![
        Box::new(StaticPeers::new(args.peers)),
        Box::new(EnvPeers::new("DISCOVERY_PEERS")),
    ];

    Cluster::new(config, tool, providers)
        .run(StdRng::from_entropy())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["convened", "--address", "10.0.0.1"]).unwrap();
        assert_eq!(args.initial_nodes, 3);
        assert_eq!(args.master_nodes, 3);
        assert_eq!(args.port, 1234);
        assert_eq!(args.control_plane_ip, "127.0.13.37");
        assert!(args.peers.is_empty());
    }

    #[test]
    fn address_is_required() {
        assert!(Args::try_parse_from(["convened"]).is_err());
    }

    #[test]
    fn explicit_name_wins() {
        let args =
            Args::try_parse_from(["convened", "--address", "10.0.0.1", "--name", "alpha"])
                .unwrap();
        assert_eq!(args.node_name(), "alpha");
    }

    #[test]
    fn trailing_args_are_peers() {
        let args = Args::try_parse_from([
            "convened",
            "--address",
            "10.0.0.1",
            "10.0.0.2",
            "10.0.0.3:4321",
        ])
        .unwrap();
        assert_eq!(args.peers, vec!["10.0.0.2", "10.0.0.3:4321"]);
    }
}
