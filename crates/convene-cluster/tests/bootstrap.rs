//! End-to-end bootstrap: three daemons on loopback discover each
//! other, exactly one founds the cluster, and every node converges
//! onto a role from the same committed configuration.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use convene_cluster::{
    BootstrapTool, Cluster, ClusterConfig, Discovery, JoinConfig, StaticPeers,
};

/// Records role actions instead of mutating the host.
struct RecordingTool {
    name: String,
    actions: Arc<Mutex<Vec<(String, &'static str)>>>,
}

impl BootstrapTool for RecordingTool {
    fn genesis(&self, config: &JoinConfig) -> anyhow::Result<()> {
        assert!(!config.token.is_empty());
        assert!(!config.certificate_key.is_empty());
        self.record("genesis");
        Ok(())
    }

    fn join_control_plane(&self, config: &JoinConfig) -> anyhow::Result<()> {
        assert!(!config.token.is_empty());
        self.record("control-plane");
        Ok(())
    }

    fn join_worker(&self, _config: &JoinConfig) -> anyhow::Result<()> {
        self.record("worker");
        Ok(())
    }
}

impl RecordingTool {
    fn record(&self, role: &'static str) {
        self.actions
            .lock()
            .unwrap()
            .push((self.name.clone(), role));
    }
}

/// A base port whose +1 and +2 neighbors are also free.
fn free_base_port() -> u16 {
    loop {
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = udp.local_addr().unwrap().port();
        if port >= u16::MAX - 2 {
            continue;
        }
        let consensus = std::net::TcpListener::bind(("127.0.0.1", port + 1));
        let lock = std::net::TcpListener::bind(("127.0.0.1", port + 2));
        if consensus.is_ok() && lock.is_ok() {
            return port;
        }
    }
}

fn free_tcp_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn three_nodes_bootstrap_exactly_one_cluster() {
    let actions: Arc<Mutex<Vec<(String, &'static str)>>> = Arc::new(Mutex::new(Vec::new()));

    let names = ["a", "b", "c"];
    let ports: Vec<u16> = names.iter().map(|_| free_base_port()).collect();
    let seed_addr = format!("127.0.0.1:{}", ports[0]);

    for (i, name) in names.iter().enumerate() {
        let config = ClusterConfig {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            port: ports[i],
            initial_nodes: 3,
            master_nodes: 3,
            frontend_addr: free_tcp_addr(),
        };
        let tool = Arc::new(RecordingTool {
            name: name.to_string(),
            actions: Arc::clone(&actions),
        });
        let peers = if i == 0 {
            Vec::new()
        } else {
            vec![seed_addr.clone()]
        };
        let providers: Vec<Box<dyn Discovery>> = vec![Box::new(StaticPeers::new(peers))];

        let cluster = Cluster::new(config, tool, providers);
        let rng = StdRng::seed_from_u64(i as u64);
        tokio::spawn(async move {
            if let Err(e) = cluster.run(rng).await {
                panic!("cluster node failed: {e:#}");
            }
        });
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(90);
    loop {
        if actions.lock().unwrap().len() >= 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "nodes did not converge onto roles in time"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let actions = actions.lock().unwrap().clone();
    let genesis: Vec<&String> = actions
        .iter()
        .filter(|(_, role)| *role == "genesis")
        .map(|(name, _)| name)
        .collect();
    assert_eq!(genesis.len(), 1, "exactly one node may found the cluster");

    let mut acted: Vec<&String> = actions.iter().map(|(name, _)| name).collect();
    acted.sort();
    acted.dedup();
    assert_eq!(acted.len(), 3, "every node must run a role action");

    // Three masters across three nodes: the two non-genesis nodes
    // join the control plane.
    let control_plane = actions
        .iter()
        .filter(|(_, role)| *role == "control-plane")
        .count();
    assert_eq!(control_plane, 2);
}
