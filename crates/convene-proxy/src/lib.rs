//! Dynamic TCP front-end for the control-plane API servers.
//!
//! Presents one stable listening address and forwards each new
//! connection to the next upstream in rotation. The upstream set is
//! reconciled at runtime without touching the listening socket, and
//! upstream choice happens at accept time only, so connections to
//! retained upstreams are never reset by a reconfiguration.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Upstream configured at construction so the proxy fails fast rather
/// than hanging until the first real set is applied.
const PLACEHOLDER_UPSTREAM: &str = "0.0.0.0:0";

/// Routes added and removed by one reconciliation. Unchanged upstreams
/// appear in neither list.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Round-robin TCP proxy with a runtime-reconfigurable upstream set.
#[derive(Clone)]
pub struct ApiServerProxy {
    front_addr: String,
    routes: Arc<RwLock<BTreeSet<String>>>,
    counter: Arc<AtomicUsize>,
}

impl ApiServerProxy {
    pub fn new(front_addr: impl Into<String>) -> Self {
        let mut routes = BTreeSet::new();
        routes.insert(PLACEHOLDER_UPSTREAM.to_string());

        Self {
            front_addr: front_addr.into(),
            routes: Arc::new(RwLock::new(routes)),
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The front-end address this proxy accepts on.
    pub fn front_addr(&self) -> &str {
        &self.front_addr
    }

    /// Reconcile the route set against the desired upstreams.
    ///
    /// Adds routes for new upstreams and removes routes no longer
    /// desired; an upstream present in both sets is untouched. An
    /// empty desired set is valid and degrades to "no healthy
    /// backend", not an error.
    pub fn set_upstreams<I, S>(&self, desired: I) -> RouteDiff
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let desired: BTreeSet<String> = desired.into_iter().map(Into::into).collect();
        let mut routes = self.routes.write().expect("route table lock");

        let added: Vec<String> = desired.difference(&routes).cloned().collect();
        let removed: Vec<String> = routes.difference(&desired).cloned().collect();

        for upstream in &added {
            info!(front = %self.front_addr, %upstream, "adding route");
        }
        for upstream in &removed {
            info!(front = %self.front_addr, %upstream, "removing route");
        }

        *routes = desired;
        RouteDiff { added, removed }
    }

    /// Current route snapshot (sorted).
    pub fn upstreams(&self) -> Vec<String> {
        let routes = self.routes.read().expect("route table lock");
        routes.iter().cloned().collect()
    }

    /// Select the next upstream in rotation.
    pub fn next_upstream(&self) -> Option<String> {
        let routes = self.routes.read().expect("route table lock");
        if routes.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % routes.len();
        routes.iter().nth(idx).cloned()
    }

    /// Accept on the front-end address and forward each connection to
    /// the next upstream. Returns only on listener failure.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.front_addr).await?;
        info!(front = %self.front_addr, "API server load balancer listening");

        loop {
            let (downstream, peer) = listener.accept().await?;
            let Some(upstream) = self.next_upstream() else {
                debug!(%peer, "no healthy backend, dropping connection");
                continue;
            };

            tokio::spawn(async move {
                match TcpStream::connect(&upstream).await {
                    Ok(mut backend) => {
                        let mut downstream = downstream;
                        if let Err(e) =
                            tokio::io::copy_bidirectional(&mut downstream, &mut backend).await
                        {
                            debug!(%peer, %upstream, error = %e, "proxy stream ended");
                        }
                    }
                    Err(e) => {
                        warn!(%peer, %upstream, error = %e, "upstream connect failed");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn starts_with_fail_fast_placeholder() {
        let proxy = ApiServerProxy::new("127.0.13.37:6443");
        assert_eq!(proxy.upstreams(), vec![PLACEHOLDER_UPSTREAM.to_string()]);
    }

    #[test]
    fn first_set_replaces_placeholder() {
        let proxy = ApiServerProxy::new("127.0.13.37:6443");
        let diff = proxy.set_upstreams(["1.1.1.1:6443", "2.2.2.2:6443"]);

        assert_eq!(diff.added, vec!["1.1.1.1:6443", "2.2.2.2:6443"]);
        assert_eq!(diff.removed, vec![PLACEHOLDER_UPSTREAM.to_string()]);
    }

    #[test]
    fn reconciliation_is_the_symmetric_difference() {
        let proxy = ApiServerProxy::new("127.0.13.37:6443");
        proxy.set_upstreams(["1.1.1.1:6443", "2.2.2.2:6443"]);

        let diff = proxy.set_upstreams(["2.2.2.2:6443", "3.3.3.3:6443"]);
        assert_eq!(diff.added, vec!["3.3.3.3:6443"]);
        assert_eq!(diff.removed, vec!["1.1.1.1:6443"]);

        assert_eq!(
            proxy.upstreams(),
            vec!["2.2.2.2:6443".to_string(), "3.3.3.3:6443".to_string()]
        );
    }

    #[test]
    fn identical_set_touches_nothing() {
        let proxy = ApiServerProxy::new("127.0.13.37:6443");
        proxy.set_upstreams(["1.1.1.1:6443"]);

        let diff = proxy.set_upstreams(["1.1.1.1:6443"]);
        assert_eq!(diff, RouteDiff::default());
    }

    #[test]
    fn empty_set_is_no_healthy_backend() {
        let proxy = ApiServerProxy::new("127.0.13.37:6443");
        proxy.set_upstreams(["1.1.1.1:6443"]);

        let diff = proxy.set_upstreams(Vec::<String>::new());
        assert_eq!(diff.removed, vec!["1.1.1.1:6443"]);
        assert!(proxy.upstreams().is_empty());
        assert!(proxy.next_upstream().is_none());
    }

    #[test]
    fn rotation_cycles_through_upstreams() {
        let proxy = ApiServerProxy::new("127.0.13.37:6443");
        proxy.set_upstreams(["1.1.1.1:6443", "2.2.2.2:6443"]);

        let first = proxy.next_upstream().unwrap();
        let second = proxy.next_upstream().unwrap();
        let third = proxy.next_upstream().unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn forwards_bytes_to_upstream() {
        // Echo upstream.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = upstream.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let n = stream.read(&mut buf).await.unwrap();
                    stream.write_all(&buf[..n]).await.unwrap();
                });
            }
        });

        // Proxy on a free front port.
        let front = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let front_addr = front.local_addr().unwrap().to_string();
        drop(front);

        let proxy = ApiServerProxy::new(front_addr.clone());
        proxy.set_upstreams([upstream_addr]);
        let runner = proxy.clone();
        tokio::spawn(async move { runner.run().await });

        // Give the listener a moment to bind.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut client = TcpStream::connect(&front_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
