//! Lock RPC surface.
//!
//! Four named remote operations. `SharedAcquire` and `ForcedRelease`
//! are part of the protocol surface but always answer "not supported";
//! callers must never rely on them.

/// A lock RPC request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum LockRequest {
    /// Non-blocking exclusive acquisition; granted first-come-first-served.
    Acquire { key: String, owner: String },
    /// Release a previously granted key.
    Release { key: String, owner: String },
    /// Shared (read) acquisition. Always refused.
    SharedAcquire { key: String, owner: String },
    /// Administrative release. Always refused.
    ForcedRelease { key: String, owner: String },
}

/// Reply to any lock RPC. `error` is empty on a well-formed operation;
/// unsupported operations carry a message and never a grant.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LockResponse {
    pub granted: bool,
    pub error: String,
}

impl LockResponse {
    pub fn granted(granted: bool) -> Self {
        Self {
            granted,
            error: String::new(),
        }
    }

    pub fn unsupported(op: &str) -> Self {
        Self {
            granted: false,
            error: format!("{op} is not supported"),
        }
    }
}
