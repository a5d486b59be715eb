//! Lock participant server.
//!
//! Grants one boolean flag per key, first-come-first-served, and holds
//! it until an explicit `Release`. The flag map is the only mutable
//! cross-request state in this component.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use convene_wire::{read_frame, write_frame};

use crate::rpc::{LockRequest, LockResponse};

/// A single lock participant. One instance runs per node, listening on
/// the node's lock endpoint.
#[derive(Clone, Default)]
pub struct LockServer {
    locked: Arc<Mutex<HashMap<String, bool>>>,
}

impl LockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve lock RPCs on the given listener. Returns only if the
    /// listener fails.
    pub async fn run(self, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "lock server listening");
        }

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    debug!(%peer, error = %e, "lock connection closed");
                }
            });
        }
    }

    async fn serve_connection(
        &self,
        mut stream: TcpStream,
    ) -> Result<(), convene_wire::WireError> {
        while let Some(request) = read_frame::<_, LockRequest>(&mut stream).await? {
            let response = self.handle(request);
            write_frame(&mut stream, &response).await?;
        }
        Ok(())
    }

    fn handle(&self, request: LockRequest) -> LockResponse {
        match request {
            LockRequest::Acquire { key, owner } => {
                let mut locked = self.locked.lock().expect("lock table");
                let flag = locked.entry(key.clone()).or_insert(false);
                if *flag {
                    debug!(%key, %owner, "acquire denied, already held");
                    LockResponse::granted(false)
                } else {
                    *flag = true;
                    debug!(%key, %owner, "acquire granted");
                    LockResponse::granted(true)
                }
            }
            LockRequest::Release { key, owner } => {
                let mut locked = self.locked.lock().expect("lock table");
                locked.insert(key.clone(), false);
                debug!(%key, %owner, "released");
                LockResponse::granted(true)
            }
            LockRequest::SharedAcquire { key, .. } => {
                warn!(%key, "refusing SharedAcquire");
                LockResponse::unsupported("SharedAcquire")
            }
            LockRequest::ForcedRelease { key, .. } => {
                warn!(%key, "refusing ForcedRelease");
                LockResponse::unsupported("ForcedRelease")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire(key: &str) -> LockRequest {
        LockRequest::Acquire {
            key: key.to_string(),
            owner: "test".to_string(),
        }
    }

    #[test]
    fn first_acquire_wins_second_denied() {
        let server = LockServer::new();
        assert!(server.handle(acquire("leader")).granted);
        assert!(!server.handle(acquire("leader")).granted);
    }

    #[test]
    fn keys_are_independent() {
        let server = LockServer::new();
        assert!(server.handle(acquire("leader")).granted);
        assert!(server.handle(acquire("other")).granted);
    }

    #[test]
    fn release_makes_key_acquirable_again() {
        let server = LockServer::new();
        assert!(server.handle(acquire("leader")).granted);

        let resp = server.handle(LockRequest::Release {
            key: "leader".to_string(),
            owner: "test".to_string(),
        });
        assert!(resp.granted);
        assert!(server.handle(acquire("leader")).granted);
    }

    #[test]
    fn shared_and_forced_operations_refused() {
        let server = LockServer::new();

        let shared = server.handle(LockRequest::SharedAcquire {
            key: "leader".to_string(),
            owner: "test".to_string(),
        });
        assert!(!shared.granted);
        assert!(!shared.error.is_empty());

        let forced = server.handle(LockRequest::ForcedRelease {
            key: "leader".to_string(),
            owner: "test".to_string(),
        });
        assert!(!forced.granted);
        assert!(!forced.error.is_empty());

        // Refusals must not disturb the flag.
        assert!(server.handle(acquire("leader")).granted);
    }
}
