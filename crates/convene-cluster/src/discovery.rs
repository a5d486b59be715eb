//! Peer discovery — feeds candidate gossip addresses into the
//! membership layer.
//!
//! Providers are polled on a fixed interval so late-arriving peers
//! (DHCP, slow boot, racing daemons) are still found. A provider
//! failure is logged and retried, never fatal.

use std::collections::BTreeSet;
use std::time::Duration;

use convene_membership::Gossip;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A source of candidate peer addresses.
pub trait Discovery: Send + Sync {
    /// Candidate addresses, `host` or `host:port`.
    fn resolve(&self) -> anyhow::Result<Vec<String>>;
}

/// Fixed peer list, typically from the command line.
pub struct StaticPeers {
    addrs: Vec<String>,
}

impl StaticPeers {
    pub fn new(addrs: Vec<String>) -> Self {
        Self { addrs }
    }
}

impl Discovery for StaticPeers {
    fn resolve(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.addrs.clone())
    }
}

/// Peers from an environment variable, one address per line. Re-read
/// every poll, so the variable can be populated after startup.
pub struct EnvPeers {
    var: String,
}

impl EnvPeers {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Discovery for EnvPeers {
    fn resolve(&self) -> anyhow::Result<Vec<String>> {
        match std::env::var(&self.var) {
            Ok(raw) => Ok(raw
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect()),
            Err(std::env::VarError::NotPresent) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Append the default membership port to addresses that carry none.
fn ensure_port(addr: String, default_port: u16) -> String {
    if addr.contains(':') {
        addr
    } else {
        format!("{addr}:{default_port}")
    }
}

/// Poll every provider forever, handing newly seen addresses to the
/// gossip layer as join targets.
pub async fn run_discovery(
    providers: Vec<Box<dyn Discovery>>,
    gossip: Gossip,
    default_port: u16,
) -> anyhow::Result<()> {
    let mut seen = BTreeSet::new();

    loop {
        for provider in &providers {
            let addrs = match provider.resolve() {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(error = %e, "peer discovery failed, will retry");
                    continue;
                }
            };

            for addr in addrs {
                let addr = ensure_port(addr, default_port);
                if seen.insert(addr.clone()) {
                    debug!(%addr, "discovered peer");
                    gossip.add_peer(addr);
                }
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_peers_resolve_verbatim() {
        let provider = StaticPeers::new(vec!["10.0.0.1:1234".to_string()]);
        assert_eq!(provider.resolve().unwrap(), vec!["10.0.0.1:1234"]);
    }

    #[test]
    fn env_peers_split_on_lines() {
        let provider = EnvPeers::new("CONVENE_TEST_PEERS");
        assert!(provider.resolve().unwrap().is_empty());

        // Env mutation is process-global; the variable name is unique
        // to this test.
        unsafe { std::env::set_var("CONVENE_TEST_PEERS", "10.0.0.1:1234\n\n 10.0.0.2 \n") };
        assert_eq!(
            provider.resolve().unwrap(),
            vec!["10.0.0.1:1234", "10.0.0.2"]
        );
        unsafe { std::env::remove_var("CONVENE_TEST_PEERS") };
    }

    #[test]
    fn bare_hosts_get_the_default_port() {
        assert_eq!(ensure_port("10.0.0.1".to_string(), 1234), "10.0.0.1:1234");
        assert_eq!(
            ensure_port("10.0.0.1:9999".to_string(), 1234),
            "10.0.0.1:9999"
        );
    }
}
