//! Lock RPC client — one participant endpoint per client.

use convene_wire::call;

use crate::rpc::{LockRequest, LockResponse};
use crate::LockError;

/// Client for a single remote lock participant. Dials per call; the
/// lock is used a handful of times per cluster lifetime, so connection
/// reuse buys nothing.
#[derive(Debug, Clone)]
pub struct LockClient {
    addr: String,
}

impl LockClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// The participant endpoint this client talks to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Non-blocking exclusive acquisition. `Ok(true)` iff this
    /// participant granted the key.
    pub async fn acquire(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        self.roundtrip(LockRequest::Acquire {
            key: key.to_string(),
            owner: owner.to_string(),
        })
        .await
    }

    /// Release a previously granted key.
    pub async fn release(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        self.roundtrip(LockRequest::Release {
            key: key.to_string(),
            owner: owner.to_string(),
        })
        .await
    }

    /// Present on the protocol surface only; the server always refuses.
    pub async fn shared_acquire(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        self.roundtrip(LockRequest::SharedAcquire {
            key: key.to_string(),
            owner: owner.to_string(),
        })
        .await
    }

    /// Present on the protocol surface only; the server always refuses.
    pub async fn forced_release(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        self.roundtrip(LockRequest::ForcedRelease {
            key: key.to_string(),
            owner: owner.to_string(),
        })
        .await
    }

    async fn roundtrip(&self, request: LockRequest) -> Result<bool, LockError> {
        let response: LockResponse = call(&self.addr, &request).await?;
        if !response.error.is_empty() {
            return Err(LockError::Unsupported(response.error));
        }
        Ok(response.granted)
    }
}
